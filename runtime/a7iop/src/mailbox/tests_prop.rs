//! Property tests for a linked mailbox pair
//!
//! Random interleavings of send, receive, mask updates and reset on both
//! sides are checked against a plain queue model after every step: FIFO
//! order, the underflow latch, and the four output lines of each mailbox.

use std::collections::VecDeque;
use std::sync::Arc;

use proptest::prelude::*;

use super::{Direction, IntMask, Mailbox};
use crate::irq::MailboxIrq;
use crate::message::Message;

#[derive(Debug, Clone, Copy)]
enum Side {
    Iop,
    Ap,
}

impl Side {
    fn pick<'a>(self, iop: &'a Arc<Mailbox>, ap: &'a Arc<Mailbox>) -> &'a Arc<Mailbox> {
        match self {
            Side::Iop => iop,
            Side::Ap => ap,
        }
    }
}

#[derive(Debug, Clone)]
enum Op {
    Send(Side, Direction),
    Receive(Side, Direction),
    SetMask(Side, u32),
    ClearMask(Side, u32),
    Reset(Side),
}

fn arb_side() -> impl Strategy<Value = Side> {
    prop_oneof![Just(Side::Iop), Just(Side::Ap)]
}

fn arb_direction() -> impl Strategy<Value = Direction> {
    prop_oneof![Just(Direction::Iop), Just(Direction::Ap)]
}

fn arb_mask() -> impl Strategy<Value = u32> {
    let lines = IntMask::IOP_EMPTY | IntMask::IOP_NONEMPTY | IntMask::AP_EMPTY | IntMask::AP_NONEMPTY;
    any::<u32>().prop_map(move |bits| bits & lines.bits())
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (arb_side(), arb_direction()).prop_map(|(s, d)| Op::Send(s, d)),
        3 => (arb_side(), arb_direction()).prop_map(|(s, d)| Op::Receive(s, d)),
        1 => (arb_side(), arb_mask()).prop_map(|(s, m)| Op::SetMask(s, m)),
        1 => (arb_side(), arb_mask()).prop_map(|(s, m)| Op::ClearMask(s, m)),
        1 => arb_side().prop_map(Op::Reset),
    ]
}

#[derive(Default)]
struct Inbox {
    queue: VecDeque<u64>,
    underflow: bool,
}

#[derive(Default)]
struct Model {
    iop: Inbox,
    ap: Inbox,
    iop_mask: u32,
    ap_mask: u32,
}

impl Model {
    fn inbox(&mut self, dir: Direction) -> &mut Inbox {
        match dir {
            Direction::Iop => &mut self.iop,
            Direction::Ap => &mut self.ap,
        }
    }

    fn mask(&mut self, side: Side) -> &mut u32 {
        match side {
            Side::Iop => &mut self.iop_mask,
            Side::Ap => &mut self.ap_mask,
        }
    }

    fn receive(&mut self, dir: Direction) -> Option<u64> {
        let inbox = self.inbox(dir);
        if inbox.underflow {
            return None;
        }
        let popped = inbox.queue.pop_front();
        inbox.underflow = popped.is_none();
        popped
    }
}

fn check_lines(mbox: &Mailbox, model: &Model, mask: u32) -> std::result::Result<(), TestCaseError> {
    let mask = IntMask::from_bits_retain(mask);
    let expect = [
        (
            MailboxIrq::IopNonEmpty,
            (!mask.contains(IntMask::IOP_NONEMPTY) && !model.iop.queue.is_empty()) || model.iop.underflow,
        ),
        (
            MailboxIrq::IopEmpty,
            !mask.contains(IntMask::IOP_EMPTY) && model.iop.queue.is_empty(),
        ),
        (
            MailboxIrq::ApNonEmpty,
            (!mask.contains(IntMask::AP_NONEMPTY) && !model.ap.queue.is_empty()) || model.ap.underflow,
        ),
        (
            MailboxIrq::ApEmpty,
            !mask.contains(IntMask::AP_EMPTY) && model.ap.queue.is_empty(),
        ),
    ];
    for (irq, level) in expect {
        prop_assert_eq!(mbox.irq_level(irq), level, "{} {:?}", mbox.role(), irq);
    }
    Ok(())
}

proptest! {
    #[test]
    fn mailbox_pair_matches_queue_model(ops in prop::collection::vec(arb_op(), 1..64)) {
        let (iop, ap) = Mailbox::pair("prop", None);
        let mut model = Model::default();
        let mut next = 0u64;

        for op in ops {
            match op {
                Op::Send(s, dir) => {
                    s.pick(&iop, &ap).send(dir, Message::new(0x20, next));
                    model.inbox(dir).queue.push_back(next);
                    next += 1;
                }
                Op::Receive(s, dir) => {
                    let got = s.pick(&iop, &ap).receive(dir).map(|m| m.msg);
                    prop_assert_eq!(got, model.receive(dir));
                }
                Op::SetMask(s, bits) => {
                    s.pick(&iop, &ap).set_int_mask(bits);
                    *model.mask(s) |= bits;
                }
                Op::ClearMask(s, bits) => {
                    s.pick(&iop, &ap).clear_int_mask(bits);
                    *model.mask(s) &= !bits;
                }
                Op::Reset(s) => {
                    s.pick(&iop, &ap).reset();
                    let owned = s.pick(&iop, &ap).owns();
                    *model.inbox(owned) = Inbox::default();
                    *model.mask(s) = 0;
                }
            }

            prop_assert_eq!(iop.len(), model.iop.queue.len());
            prop_assert_eq!(ap.len(), model.ap.queue.len());
            prop_assert_eq!(iop.underflowed(), model.iop.underflow);
            prop_assert_eq!(ap.underflowed(), model.ap.underflow);
            check_lines(&iop, &model, model.iop_mask)?;
            check_lines(&ap, &model, model.ap_mask)?;
        }
    }
}
