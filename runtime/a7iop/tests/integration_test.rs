//! Integration tests for the A7IOP transport
//!
//! These tests play the AP guest against the coprocessor window through
//! MMIO accesses only, and check what the IOP side observes:
//! - v2 and v4 message round trips
//! - direction gating from the guest
//! - depth reporting past the nominal queue size
//! - interrupt lines and deferred work

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use apple_a7iop::*;

fn build(generation: Generation, bh: Option<BottomHalf>) -> A7iop {
    A7iop::new(&A7iopConfig::new("SMC", generation), None, bh).expect("valid config")
}

/// Absolute offset of a register in the AP mailbox window
fn ap_reg(generation: Generation, local: u64) -> u64 {
    generation.ap_mailbox_base() + local
}

fn ctrl(iop: &A7iop, generation: Generation, dir: Direction) -> CtrlStatus {
    let offset = ap_reg(generation, generation.layout().ctrl(dir));
    CtrlStatus::from_bits_retain(iop.read(offset, 4).expect("ctrl read") as u32)
}

#[derive(Default)]
struct RecordingSink {
    levels: std::sync::Mutex<Vec<bool>>,
}

impl IrqSink for RecordingSink {
    fn set_level(&self, level: bool) {
        self.levels.lock().unwrap().push(level);
    }
}

/// Guest sends through the v2 window, IOP replies, guest reads the reply
#[test]
fn test_v2_round_trip() {
    let generation = Generation::V2;
    let layout = generation.layout();
    let iop = build(generation, None);

    assert!(iop.write(ap_reg(generation, layout.send_word(Direction::Iop, 0)), 0x89ab_cdef, 4));
    assert!(iop.write(ap_reg(generation, layout.send_word(Direction::Iop, 1)), 0x0123_4567, 4));

    let received = iop.recv_iop().expect("message in IOP inbox");
    assert_eq!(received.msg, 0x0123_4567_89ab_cdef);

    iop.send_ap(Message::new(0, 0xfeed_face_cafe_beef));
    let lo = iop.read(ap_reg(generation, layout.recv_word(Direction::Ap, 0)), 4).unwrap();
    let hi = iop.read(ap_reg(generation, layout.recv_word(Direction::Ap, 1)), 4).unwrap();
    assert_eq!((hi << 32) | lo, 0xfeed_face_cafe_beef);
    assert!(iop.ap_mailbox().is_empty());
}

/// v4 slots carry the endpoint and the receive-time depth stamp
#[test]
fn test_v4_round_trip_keeps_endpoint() {
    let generation = Generation::V4;
    let layout = generation.layout();
    let iop = build(generation, None);

    let sent = Message::new(0x24, 0x1122_3344_5566_7788);
    let words = sent.words();
    assert!(iop.write(ap_reg(generation, layout.send_word(Direction::Iop, 0)), words[0], 8));
    assert!(iop.write(ap_reg(generation, layout.send_word(Direction::Iop, 2)), words[1], 8));

    let received = iop.recv_iop().unwrap();
    assert_eq!(received.endpoint, 0x24);
    assert_eq!(received.msg, sent.msg);
    assert_eq!(received.flags, CtrlStatus::count(1).bits());

    iop.send_ap(received);
    let w0 = iop.read(ap_reg(generation, layout.recv_word(Direction::Ap, 0)), 8).unwrap();
    let w1 = iop.read(ap_reg(generation, layout.recv_word(Direction::Ap, 2)), 8).unwrap();
    let echoed = Message::from_words([w0, w1]);
    assert_eq!(echoed.endpoint, 0x24);
    assert_eq!(echoed.msg, sent.msg);
}

/// Guest disables its IOP direction; its sends no longer reach the IOP
#[test]
fn test_disabled_iop_direction() {
    let generation = Generation::V2;
    let layout = generation.layout();
    let iop = build(generation, None);

    assert!(iop.write(ap_reg(generation, layout.ctrl(Direction::Iop)), 0, 4));
    assert_eq!(ctrl(&iop, generation, Direction::Iop), CtrlStatus::EMPTY);

    assert!(iop.write(ap_reg(generation, layout.send_word(Direction::Iop, 0)), 0x1, 8));
    assert_eq!(iop.iop_mailbox().len(), 0);
    assert!(iop.recv_iop().is_none());

    // The AP direction is untouched.
    iop.send_ap(Message::new(0, 7));
    assert_eq!(iop.read(ap_reg(generation, layout.recv_word(Direction::Ap, 0)), 8), Some(7));

    assert!(iop.write(
        ap_reg(generation, layout.ctrl(Direction::Iop)),
        u64::from(CtrlStatus::ENABLE.bits()),
        4
    ));
    assert!(iop.write(ap_reg(generation, layout.send_word(Direction::Iop, 0)), 0x2, 8));
    assert_eq!(iop.recv_iop().map(|m| m.msg), Some(0x2));
}

/// Sixteen pushes are all accepted and reported as full and overflowed
#[test]
fn test_sixteen_pushes_overflow() {
    let generation = Generation::V4;
    let layout = generation.layout();
    let iop = build(generation, None);

    for n in 0..16u64 {
        iop.send_ap(Message::new(0x20, n));
    }

    let status = ctrl(&iop, generation, Direction::Ap);
    assert!(status.contains(CtrlStatus::ENABLE | CtrlStatus::FULL | CtrlStatus::OVERFLOW));
    assert!(!status.contains(CtrlStatus::EMPTY));
    assert_eq!(status.depth(), MAX_MESSAGE_COUNT);

    for n in 0..16u64 {
        let payload = iop.read(ap_reg(generation, layout.recv_word(Direction::Ap, 0)), 8);
        assert_eq!(payload, Some(n));
    }
    assert!(ctrl(&iop, generation, Direction::Ap).contains(CtrlStatus::EMPTY));
}

/// Reading an empty receive slot latches underflow until reset
#[test]
fn test_guest_underflow_until_reset() {
    let generation = Generation::V2;
    let layout = generation.layout();
    let iop = build(generation, None);
    let recv0 = ap_reg(generation, layout.recv_word(Direction::Ap, 0));

    assert_eq!(iop.read(recv0, 8), Some(0));
    assert_eq!(ctrl(&iop, generation, Direction::Ap), CtrlStatus::ENABLE | CtrlStatus::UNDERFLOW);
    assert!(iop.irq(MailboxIrq::ApNonEmpty).level());

    iop.send_ap(Message::new(0, 1));
    assert_eq!(iop.read(recv0, 8), Some(0));

    iop.reset();
    assert_eq!(ctrl(&iop, generation, Direction::Ap), CtrlStatus::ENABLE | CtrlStatus::EMPTY);
    assert!(!iop.irq(MailboxIrq::ApNonEmpty).level());
}

/// The AP-nonempty line follows the AP inbox and honours the mask
#[test]
fn test_irq_sink_follows_ap_inbox() {
    let generation = Generation::V4;
    let layout = generation.layout();
    let iop = build(generation, None);
    let sink = Arc::new(RecordingSink::default());
    iop.connect_irq(MailboxIrq::ApNonEmpty, sink.clone());

    iop.send_ap(Message::new(0, 1));
    assert_eq!(sink.levels.lock().unwrap().last(), Some(&true));

    let mask = u64::from(IntMask::AP_NONEMPTY.bits());
    assert!(iop.write(ap_reg(generation, layout.int_mask_set), mask, 4));
    assert_eq!(sink.levels.lock().unwrap().last(), Some(&false));

    assert!(iop.write(ap_reg(generation, layout.int_mask_clr), mask, 4));
    assert_eq!(sink.levels.lock().unwrap().last(), Some(&true));

    iop.read(ap_reg(generation, layout.recv_word(Direction::Ap, 0)), 8);
    assert_eq!(sink.levels.lock().unwrap().last(), Some(&false));
}

/// Guest sends wake the IOP side through its bottom half
#[test]
fn test_guest_send_schedules_iop_work() {
    let event_loop = EventLoop::new();
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = runs.clone();
    let bh = event_loop.bottom_half("smc-iop", move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let generation = Generation::V2;
    let iop = build(generation, Some(bh));
    let send0 = ap_reg(generation, generation.layout().send_word(Direction::Iop, 0));

    assert!(iop.write(send0, 0x1, 8));
    assert!(iop.write(send0, 0x2, 8));
    assert_eq!(event_loop.run_pending(), 1);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(iop.iop_mailbox().len(), 2);

    // IOP → AP traffic does not wake the IOP side.
    iop.send_ap(Message::new(0, 3));
    assert!(!event_loop.has_pending());
}

#[test]
fn test_config_rejects_small_window() {
    let mut config = A7iopConfig::new("SEP", Generation::V4);
    config.mmio_size = 0x1000;
    assert!(matches!(
        A7iop::new(&config, None, None),
        Err(A7iopError::WindowTooSmall { .. })
    ));
}
