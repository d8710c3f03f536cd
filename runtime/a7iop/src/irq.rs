//! Interrupt lines
//!
//! Each mailbox drives four level-triggered output lines. The SoC glue
//! connects an [`IrqSink`] to the lines it routes to an interrupt
//! controller; the current level is always queryable regardless.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// Number of interrupt outputs per mailbox
pub const MAILBOX_IRQ_COUNT: usize = 4;

/// Mailbox interrupt outputs, in line-index order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MailboxIrq {
    /// IOP inbox is empty
    IopEmpty = 0,
    /// IOP inbox holds messages (or has underflowed)
    IopNonEmpty = 1,
    /// AP inbox is empty
    ApEmpty = 2,
    /// AP inbox holds messages (or has underflowed)
    ApNonEmpty = 3,
}

impl MailboxIrq {
    /// All lines, in index order
    pub const ALL: [MailboxIrq; MAILBOX_IRQ_COUNT] = [
        MailboxIrq::IopEmpty,
        MailboxIrq::IopNonEmpty,
        MailboxIrq::ApEmpty,
        MailboxIrq::ApNonEmpty,
    ];

    /// Line index as wired on the device
    pub fn index(self) -> usize {
        self as usize
    }
}

/// Receiver of interrupt level changes (an interrupt controller input)
pub trait IrqSink: Send + Sync {
    /// Drive the input to `level`
    fn set_level(&self, level: bool);
}

/// A single level-triggered output line
#[derive(Default)]
pub struct IrqLine {
    level: AtomicBool,
    sink: RwLock<Option<Arc<dyn IrqSink>>>,
}

impl IrqLine {
    /// Create an unconnected line at level low
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the line to an interrupt controller input
    pub fn connect(&self, sink: Arc<dyn IrqSink>) {
        *self.sink.write().unwrap_or_else(PoisonError::into_inner) = Some(sink);
    }

    /// Drive the line; the sink sees every update, like a wire would
    pub fn set(&self, level: bool) {
        self.level.store(level, Ordering::Release);

        let sink = self
            .sink
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(sink) = sink {
            sink.set_level(level);
        }
    }

    /// Current level of the line
    pub fn level(&self) -> bool {
        self.level.load(Ordering::Acquire)
    }
}

impl core::fmt::Debug for IrqLine {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IrqLine")
            .field("level", &self.level())
            .finish_non_exhaustive()
    }
}
