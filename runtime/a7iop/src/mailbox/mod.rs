//! Mailbox - one inbox queue plus its control state
//!
//! An A7IOP channel is built from two mailboxes. The IOP mailbox owns the
//! inbox the AP sends into; the AP mailbox owns the inbox the IOP sends
//! into. Each also carries its own interrupt mask, direction-enable bits
//! and IRQ outputs, and reaches the other inbox through its peer link.
//!
//! # Overflow and underflow
//! Pushes are never refused: past [`MAX_MESSAGE_COUNT`] the queue keeps
//! growing and the guest sees FULL/OVERFLOW in the control register.
//! Popping an empty inbox latches UNDERFLOW; from then on the inbox reads
//! as empty and its non-empty line stays asserted until reset.
//!
//! # Locking
//! Each mailbox has one mutex. It is never held while another mailbox's
//! lock is taken, while IRQ sinks run, or while a bottom half is scheduled.

pub mod regs;

use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};

use bitflags::bitflags;

use crate::bh::BottomHalf;
use crate::irq::{IrqLine, MailboxIrq, MAILBOX_IRQ_COUNT};
use crate::message::Message;

/// Queue depth at which the control register reports FULL
pub const MAX_MESSAGE_COUNT: usize = 15;

const CTRL_COUNT_SHIFT: u32 = 20;

bitflags! {
    /// Interrupt mask; a set bit masks the corresponding line
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct IntMask: u32 {
        const IOP_EMPTY = 1 << 0;
        const IOP_NONEMPTY = 1 << 4;
        const AP_EMPTY = 1 << 8;
        const AP_NONEMPTY = 1 << 12;

        // Guests write whole words; keep bits we do not model.
        const _ = !0;
    }
}

bitflags! {
    /// Direction control/status register bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CtrlStatus: u32 {
        const ENABLE = 1 << 0;
        const FULL = 1 << 16;
        const EMPTY = 1 << 17;
        const OVERFLOW = 1 << 18;
        const UNDERFLOW = 1 << 19;
        const COUNT = (MAX_MESSAGE_COUNT as u32) << CTRL_COUNT_SHIFT;
    }
}

impl CtrlStatus {
    /// Encode a queue depth into the COUNT field (truncating like hardware)
    pub fn count(depth: usize) -> Self {
        Self::from_bits_truncate(((depth as u32) << CTRL_COUNT_SHIFT) & Self::COUNT.bits())
    }

    /// Queue depth held in the COUNT field
    pub fn depth(self) -> usize {
        ((self.bits() & Self::COUNT.bits()) >> CTRL_COUNT_SHIFT) as usize
    }
}

/// Which inbox an operation targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// AP → IOP: the inbox the coprocessor drains
    Iop,
    /// IOP → AP: the inbox the application processor drains
    Ap,
}

#[derive(Debug, Default)]
struct MailboxState {
    inbox: VecDeque<Message>,
    underflow: bool,
    int_mask: IntMask,
    iop_dir_en: bool,
    ap_dir_en: bool,
}

impl MailboxState {
    fn new() -> Self {
        Self {
            iop_dir_en: true,
            ap_dir_en: true,
            ..Self::default()
        }
    }

    fn dir_enabled(&self, dir: Direction) -> bool {
        match dir {
            Direction::Iop => self.iop_dir_en,
            Direction::Ap => self.ap_dir_en,
        }
    }
}

/// Snapshot of an inbox taken under its lock
#[derive(Debug, Clone, Copy)]
struct QueueStatus {
    len: usize,
    underflow: bool,
}

impl QueueStatus {
    fn ctrl(self) -> CtrlStatus {
        if self.underflow {
            return CtrlStatus::UNDERFLOW;
        }

        let mut status = CtrlStatus::count(self.len.min(MAX_MESSAGE_COUNT));
        status.set(CtrlStatus::FULL, self.len >= MAX_MESSAGE_COUNT);
        status.set(CtrlStatus::OVERFLOW, self.len > MAX_MESSAGE_COUNT);
        status.set(CtrlStatus::EMPTY, self.len == 0);
        status
    }
}

/// Borrowed or upgraded reference to the mailbox owning an inbox
enum Target<'a> {
    Local(&'a Mailbox),
    Peer(Arc<Mailbox>),
}

impl Deref for Target<'_> {
    type Target = Mailbox;

    fn deref(&self) -> &Mailbox {
        match self {
            Target::Local(mailbox) => mailbox,
            Target::Peer(mailbox) => mailbox,
        }
    }
}

/// One half of an A7IOP channel
pub struct Mailbox {
    role: String,
    owns: Direction,
    state: Mutex<MailboxState>,
    peer: OnceLock<Weak<Mailbox>>,
    irqs: [IrqLine; MAILBOX_IRQ_COUNT],
    bh: Option<BottomHalf>,
}

impl Mailbox {
    /// Create an unlinked mailbox owning the `owns` inbox
    ///
    /// `bh` is scheduled whenever a message lands in this mailbox's inbox.
    /// A mailbox built this way has no peer, so both directions resolve to
    /// its own inbox. Use [`Mailbox::pair`] for a cross-wired pair.
    pub fn new(role: &str, owns: Direction, bh: Option<BottomHalf>) -> Arc<Self> {
        Arc::new(Self {
            role: role.to_string(),
            owns,
            state: Mutex::new(MailboxState::new()),
            peer: OnceLock::new(),
            irqs: Default::default(),
            bh,
        })
    }

    /// Build a cross-wired IOP/AP pair named `<role>-iop` and `<role>-ap`
    ///
    /// # Returns
    /// `(iop_mailbox, ap_mailbox)`
    pub fn pair(role: &str, iop_bh: Option<BottomHalf>) -> (Arc<Self>, Arc<Self>) {
        let iop = Self::new(&format!("{role}-iop"), Direction::Iop, iop_bh);
        let ap = Self::new(&format!("{role}-ap"), Direction::Ap, None);
        Self::link(&iop, &ap);
        (iop, ap)
    }

    /// Cross-wire a freshly built IOP/AP pair
    fn link(iop: &Arc<Self>, ap: &Arc<Self>) {
        // Neither peer slot has been set since `new`.
        let _ = iop.peer.set(Arc::downgrade(ap));
        let _ = ap.peer.set(Arc::downgrade(iop));
        iop.update_irq();
        ap.update_irq();
    }

    /// Name used in log output
    pub fn role(&self) -> &str {
        &self.role
    }

    /// Inbox held by this mailbox
    pub fn owns(&self) -> Direction {
        self.owns
    }

    fn lock(&self) -> MutexGuard<'_, MailboxState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn peer(&self) -> Option<Arc<Mailbox>> {
        self.peer.get().and_then(Weak::upgrade)
    }

    fn target(&self, dir: Direction) -> Target<'_> {
        if dir == self.owns {
            return Target::Local(self);
        }
        match self.peer() {
            Some(peer) => Target::Peer(peer),
            None => Target::Local(self),
        }
    }

    fn queue_status(&self) -> QueueStatus {
        let state = self.lock();
        QueueStatus {
            len: state.inbox.len(),
            underflow: state.underflow,
        }
    }

    /// Recompute all four output lines from both inboxes and our mask
    fn update_irq(&self) {
        let iop = self.target(Direction::Iop).queue_status();
        let ap = self.target(Direction::Ap).queue_status();
        let mask = self.lock().int_mask;

        let iop_empty = iop.len == 0;
        let ap_empty = ap.len == 0;

        log::trace!(
            "{}: update_irq iop_empty={} ap_empty={} mask={:#x}",
            self.role,
            iop_empty,
            ap_empty,
            mask.bits()
        );

        self.irq(MailboxIrq::IopNonEmpty)
            .set((!mask.contains(IntMask::IOP_NONEMPTY) && !iop_empty) || iop.underflow);
        self.irq(MailboxIrq::IopEmpty)
            .set(!mask.contains(IntMask::IOP_EMPTY) && iop_empty);
        self.irq(MailboxIrq::ApNonEmpty)
            .set((!mask.contains(IntMask::AP_NONEMPTY) && !ap_empty) || ap.underflow);
        self.irq(MailboxIrq::ApEmpty)
            .set(!mask.contains(IntMask::AP_EMPTY) && ap_empty);
    }

    /// Recompute our lines and the peer's; both observe this inbox
    fn update_linked_irqs(&self) {
        self.update_irq();
        if let Some(peer) = self.peer() {
            peer.update_irq();
        }
    }

    /// Append to this mailbox's own inbox
    fn push(&self, msg: Message) {
        {
            let mut state = self.lock();
            log::trace!(
                "{}: send ep {:#x} msg {:#018x} flags {:#x}",
                self.role,
                msg.endpoint,
                msg.msg,
                msg.flags
            );
            state.inbox.push_back(msg);
        }
        self.update_linked_irqs();

        if let Some(bh) = &self.bh {
            bh.schedule();
        }
    }

    /// Pop from this mailbox's own inbox, latching underflow when empty
    fn pop(&self) -> Option<Message> {
        let popped = {
            let mut state = self.lock();
            if state.underflow {
                return None;
            }

            let depth = state.inbox.len();
            match state.inbox.pop_front() {
                Some(mut msg) => {
                    msg.flags |= CtrlStatus::count(depth).bits();
                    log::trace!(
                        "{}: recv ep {:#x} msg {:#018x} flags {:#x}",
                        self.role,
                        msg.endpoint,
                        msg.msg,
                        msg.flags
                    );
                    Some(msg)
                }
                None => {
                    state.underflow = true;
                    None
                }
            }
        };

        if popped.is_none() {
            log::warn!(target: "guest_error", "{}: inbox underflowed", self.role);
        }
        self.update_linked_irqs();
        popped
    }

    /// Send `msg` towards `dir`
    ///
    /// Dropped (and logged) if this mailbox has `dir` disabled. Never
    /// refused for depth; see [`CtrlStatus::FULL`].
    pub fn send(&self, dir: Direction, msg: Message) {
        if !self.lock().dir_enabled(dir) {
            log::warn!(
                target: "guest_error",
                "{}: send {:?} direction not enabled",
                self.role,
                dir
            );
            return;
        }

        self.target(dir).push(msg);
    }

    /// Receive the oldest message queued towards `dir`
    ///
    /// The returned message has the pre-pop depth OR-ed into its flags.
    /// Returns `None` if the direction is disabled, the inbox is empty, or
    /// the inbox underflowed earlier.
    pub fn receive(&self, dir: Direction) -> Option<Message> {
        if !self.lock().dir_enabled(dir) {
            log::warn!(
                target: "guest_error",
                "{}: receive {:?} direction not enabled",
                self.role,
                dir
            );
            return None;
        }

        self.target(dir).pop()
    }

    /// OR `bits` into the interrupt mask
    pub fn set_int_mask(&self, bits: u32) {
        self.lock().int_mask |= IntMask::from_bits_retain(bits);
        self.update_irq();
    }

    /// Clear `bits` from the interrupt mask
    pub fn clear_int_mask(&self, bits: u32) {
        self.lock().int_mask &= !IntMask::from_bits_retain(bits);
        self.update_irq();
    }

    /// Current interrupt mask
    pub fn int_mask(&self) -> u32 {
        self.lock().int_mask.bits()
    }

    /// Gate sends and receives towards `dir` through this mailbox
    pub fn set_direction_enabled(&self, dir: Direction, enabled: bool) {
        let mut state = self.lock();
        match dir {
            Direction::Iop => state.iop_dir_en = enabled,
            Direction::Ap => state.ap_dir_en = enabled,
        }
    }

    /// Whether `dir` is enabled on this mailbox
    pub fn direction_enabled(&self, dir: Direction) -> bool {
        self.lock().dir_enabled(dir)
    }

    /// Direction control register value as read by the guest
    pub fn ctrl(&self, dir: Direction) -> u32 {
        let mut status = CtrlStatus::empty();
        status.set(CtrlStatus::ENABLE, self.lock().dir_enabled(dir));
        (status | self.target(dir).queue_status().ctrl()).bits()
    }

    /// Write the direction control register; only ENABLE is writable
    pub fn set_ctrl(&self, dir: Direction, value: u32) {
        self.set_direction_enabled(dir, CtrlStatus::from_bits_retain(value).contains(CtrlStatus::ENABLE));
    }

    /// Whether this mailbox's own inbox has nothing to deliver
    pub fn is_empty(&self) -> bool {
        let state = self.lock();
        state.underflow || state.inbox.is_empty()
    }

    /// Number of messages in this mailbox's own inbox
    pub fn len(&self) -> usize {
        self.lock().inbox.len()
    }

    /// Whether this mailbox's own inbox has latched underflow
    pub fn underflowed(&self) -> bool {
        self.lock().underflow
    }

    /// Output line `irq`
    pub fn irq(&self, irq: MailboxIrq) -> &IrqLine {
        &self.irqs[irq.index()]
    }

    /// Current level of output line `irq`
    pub fn irq_level(&self, irq: MailboxIrq) -> bool {
        self.irq(irq).level()
    }

    /// Drain the inbox and return all control state to its power-on value
    pub fn reset(&self) {
        {
            let mut state = self.lock();
            let dropped = state.inbox.len();
            *state = MailboxState::new();
            if dropped > 0 {
                log::debug!("{}: reset dropped {} queued messages", self.role, dropped);
            }
        }

        self.update_linked_irqs();
    }
}

impl core::fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.lock();
        f.debug_struct("Mailbox")
            .field("role", &self.role)
            .field("owns", &self.owns)
            .field("len", &state.inbox.len())
            .field("underflow", &state.underflow)
            .field("int_mask", &state.int_mask)
            .field("iop_dir_en", &state.iop_dir_en)
            .field("ap_dir_en", &state.ap_dir_en)
            .finish()
    }
}

#[cfg(test)]
mod tests_prop;
