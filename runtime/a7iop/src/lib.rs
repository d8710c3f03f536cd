//! A7IOP - Apple coprocessor mailbox transport
//!
//! # Purpose
//! Models the A7IOP block that every Apple-silicon coprocessor (ANS, SIO,
//! SMC, SEP) uses to exchange fixed-size messages with the application
//! processor: two inbox queues, their control/status registers, interrupt
//! lines, and the coprocessor run/status words.
//!
//! # Integration Points
//! - Depends on: nothing but an event loop to run deferred callbacks
//! - Provides to: RTBuddy engine, SoC glue (MMIO windows and IRQ lines)
//! - Register windows: v2 (legacy, 2-word slots) and v4 (4-word slots)
//!
//! # Architecture
//! An [`A7iop`] owns an IOP mailbox (AP→IOP inbox) and an AP mailbox
//! (IOP→AP inbox) that reference each other. Each mailbox guards its
//! state with its own mutex; the two locks are never held together.
//! Pushes into the IOP inbox schedule a [`BottomHalf`] that the owner
//! drains on its [`EventLoop`].
//!
//! # Testing Strategy
//! - Unit tests: queue semantics, IRQ predicate, register decoding
//! - Integration tests: guest-visible scenarios through the MMIO windows

pub mod bh;
pub mod config;
pub mod iop;
pub mod irq;
pub mod mailbox;
pub mod message;
pub mod mmio;

pub use bh::{BottomHalf, EventLoop};
pub use config::{A7iopConfig, Generation};
pub use iop::{A7iop, CpuCtrl, CpuStatus, IopOps};
pub use irq::{IrqLine, IrqSink, MailboxIrq};
pub use mailbox::regs::{MailboxRegs, RegisterLayout};
pub use mailbox::{CtrlStatus, Direction, IntMask, Mailbox, MAX_MESSAGE_COUNT};
pub use message::Message;
pub use mmio::MmioDevice;

use thiserror::Error;

/// Error types for A7IOP construction and register access
#[derive(Debug, Error)]
pub enum A7iopError {
    #[error("Unsupported access size {size} at offset {offset:#x}")]
    InvalidAccessSize { offset: u64, size: u8 },

    #[error("Misaligned {size}-byte access at offset {offset:#x}")]
    MisalignedAccess { offset: u64, size: u8 },

    #[error("{size}-byte access at offset {offset:#x} falls outside the {window:#x}-byte window")]
    OutOfWindow { offset: u64, size: u8, window: u64 },

    #[error("MMIO window of {mmio_size:#x} bytes cannot hold {generation:?} mailboxes (need {required:#x})")]
    WindowTooSmall {
        generation: Generation,
        mmio_size: u64,
        required: u64,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, A7iopError>;
