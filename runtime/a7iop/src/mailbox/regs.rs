//! Mailbox register window (v2 and v4 generations)
//!
//! Both generations expose the same logical registers; only the offsets and
//! the width of the message slots differ. [`RegisterLayout`] captures those
//! differences and a single [`MailboxRegs`] decoder serves either one.
//!
//! # Message slots
//! A send slot is a staging buffer: words written into it are kept until
//! the access that ends exactly at the end of the slot, which commits the
//! whole slot as one [`Message`]. A read of the first word of a receive slot
//! pops one message into a latch; every word of the slot, the first one
//! included, is read back from that latch. An empty mailbox latches zeros.
//!
//! v2 slots are 8 bytes wide and carry only the payload; v4 slots carry the
//! whole 16-byte record.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use static_assertions::const_assert;

use super::{Direction, Mailbox};
use crate::message::{Message, MESSAGE_SIZE};
use crate::mmio::{access_mask, check_access, MmioDevice};

/// Register offsets of one mailbox window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterLayout {
    /// Write ORs into the interrupt mask; read returns the mask
    pub int_mask_set: u64,
    /// Write clears mask bits; read returns the inverted mask
    pub int_mask_clr: u64,
    /// IOP direction control/status
    pub iop_ctrl: u64,
    /// AP direction control/status
    pub ap_ctrl: u64,
    /// First byte of the IOP send slot
    pub iop_send: u64,
    /// First byte of the IOP receive slot
    pub iop_recv: u64,
    /// First byte of the AP send slot
    pub ap_send: u64,
    /// First byte of the AP receive slot
    pub ap_recv: u64,
    /// Width of each message slot in bytes
    pub slot_size: u64,
    /// Size of the whole window
    pub window_size: u64,
}

impl RegisterLayout {
    /// Legacy layout, 2-word slots
    pub const V2: Self = Self {
        int_mask_set: 0x00,
        int_mask_clr: 0x04,
        iop_ctrl: 0x08,
        ap_ctrl: 0x20,
        iop_send: 0x10,
        iop_recv: 0x18,
        ap_send: 0x30,
        ap_recv: 0x38,
        slot_size: 0x8,
        window_size: 0x40,
    };

    /// AKF layout, 4-word slots
    pub const V4: Self = Self {
        int_mask_set: 0x000,
        int_mask_clr: 0x004,
        iop_ctrl: 0x008,
        ap_ctrl: 0x00C,
        iop_send: 0x700,
        iop_recv: 0x710,
        ap_send: 0x720,
        ap_recv: 0x730,
        slot_size: 0x10,
        window_size: 0x740,
    };

    fn send_base(&self, dir: Direction) -> u64 {
        match dir {
            Direction::Iop => self.iop_send,
            Direction::Ap => self.ap_send,
        }
    }

    fn recv_base(&self, dir: Direction) -> u64 {
        match dir {
            Direction::Iop => self.iop_recv,
            Direction::Ap => self.ap_recv,
        }
    }

    fn ctrl_offset(&self, dir: Direction) -> u64 {
        match dir {
            Direction::Iop => self.iop_ctrl,
            Direction::Ap => self.ap_ctrl,
        }
    }

    /// Offset of the `word`-th 32-bit word of the `dir` send slot
    pub fn send_word(&self, dir: Direction, word: u64) -> u64 {
        self.send_base(dir) + word * 4
    }

    /// Offset of the `word`-th 32-bit word of the `dir` receive slot
    pub fn recv_word(&self, dir: Direction, word: u64) -> u64 {
        self.recv_base(dir) + word * 4
    }

    /// Offset of the `dir` control register
    pub fn ctrl(&self, dir: Direction) -> u64 {
        self.ctrl_offset(dir)
    }

    /// Number of 32-bit words in a message slot
    pub fn slot_words(&self) -> u64 {
        self.slot_size / 4
    }

    fn decode(&self, offset: u64, size: u8) -> Option<Register> {
        if offset == self.int_mask_set {
            return Some(Register::IntMaskSet);
        }
        if offset == self.int_mask_clr {
            return Some(Register::IntMaskClr);
        }

        for dir in [Direction::Iop, Direction::Ap] {
            if offset == self.ctrl_offset(dir) {
                return Some(Register::Ctrl(dir));
            }
            if let Some(at) = self.slot_offset(self.send_base(dir), offset, size) {
                return Some(Register::Send(dir, at));
            }
            if let Some(at) = self.slot_offset(self.recv_base(dir), offset, size) {
                return Some(Register::Recv(dir, at));
            }
        }

        None
    }

    fn slot_offset(&self, base: u64, offset: u64, size: u8) -> Option<usize> {
        let end = base + self.slot_size;
        if offset >= base && offset + u64::from(size) <= end {
            Some((offset - base) as usize)
        } else {
            None
        }
    }
}

const_assert!(RegisterLayout::V2.slot_size as usize <= MESSAGE_SIZE);
const_assert!(RegisterLayout::V4.slot_size as usize <= MESSAGE_SIZE);
const_assert!(RegisterLayout::V2.ap_recv + RegisterLayout::V2.slot_size == RegisterLayout::V2.window_size);
const_assert!(RegisterLayout::V4.ap_recv + RegisterLayout::V4.slot_size == RegisterLayout::V4.window_size);

/// Decoded register access
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Register {
    IntMaskSet,
    IntMaskClr,
    Ctrl(Direction),
    /// Byte offset within the send slot
    Send(Direction, usize),
    /// Byte offset within the receive slot
    Recv(Direction, usize),
}

#[derive(Debug, Default)]
struct Latches {
    iop_send: [u8; MESSAGE_SIZE],
    ap_send: [u8; MESSAGE_SIZE],
    iop_recv: [u8; MESSAGE_SIZE],
    ap_recv: [u8; MESSAGE_SIZE],
}

impl Latches {
    fn send(&mut self, dir: Direction) -> &mut [u8; MESSAGE_SIZE] {
        match dir {
            Direction::Iop => &mut self.iop_send,
            Direction::Ap => &mut self.ap_send,
        }
    }

    fn recv(&mut self, dir: Direction) -> &mut [u8; MESSAGE_SIZE] {
        match dir {
            Direction::Iop => &mut self.iop_recv,
            Direction::Ap => &mut self.ap_recv,
        }
    }
}

/// Guest-visible register window of one [`Mailbox`]
pub struct MailboxRegs {
    mailbox: Arc<Mailbox>,
    layout: &'static RegisterLayout,
    latches: Mutex<Latches>,
}

impl MailboxRegs {
    /// Expose `mailbox` through `layout`
    pub fn new(mailbox: Arc<Mailbox>, layout: &'static RegisterLayout) -> Self {
        Self {
            mailbox,
            layout,
            latches: Mutex::new(Latches::default()),
        }
    }

    /// The mailbox behind this window
    pub fn mailbox(&self) -> &Arc<Mailbox> {
        &self.mailbox
    }

    /// Offsets this window decodes
    pub fn layout(&self) -> &'static RegisterLayout {
        self.layout
    }

    /// Clear the send staging buffers and receive latches
    pub fn reset(&self) {
        *self.lock() = Latches::default();
    }

    fn lock(&self) -> MutexGuard<'_, Latches> {
        self.latches.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_slot(&self, dir: Direction, at: usize, value: u64, size: u8) {
        let len = usize::from(size);
        let commit = at + len == self.layout.slot_size as usize;

        let staged = {
            let mut latches = self.lock();
            let staging = latches.send(dir);
            staging[at..at + len].copy_from_slice(&value.to_le_bytes()[..len]);
            commit.then(|| Message::from_bytes(staging))
        };

        if let Some(msg) = staged {
            self.mailbox.send(dir, msg);
        }
    }

    fn read_slot(&self, dir: Direction, at: usize, size: u8) -> u64 {
        let popped = if at == 0 {
            Some(self.mailbox.receive(dir))
        } else {
            None
        };

        let len = usize::from(size);
        let mut latches = self.lock();
        let latch = latches.recv(dir);
        if let Some(msg) = popped {
            *latch = msg.map(|m| m.to_bytes()).unwrap_or_default();
        }

        let mut bytes = [0u8; 8];
        bytes[..len].copy_from_slice(&latch[at..at + len]);
        u64::from_le_bytes(bytes)
    }
}

impl MmioDevice for MailboxRegs {
    fn read(&self, offset: u64, size: u8) -> Option<u64> {
        if let Err(e) = check_access(offset, size) {
            log::warn!(target: "guest_error", "{}: read refused: {}", self.mailbox.role(), e);
            return None;
        }

        let value = match self.layout.decode(offset, size) {
            Some(Register::IntMaskSet) => u64::from(self.mailbox.int_mask()),
            Some(Register::IntMaskClr) => u64::from(!self.mailbox.int_mask()),
            Some(Register::Ctrl(dir)) => u64::from(self.mailbox.ctrl(dir)),
            Some(Register::Recv(dir, at)) => self.read_slot(dir, at, size),
            Some(Register::Send(..)) | None => {
                log::warn!(
                    target: "guest_error",
                    "{}: unknown read @ {:#x}",
                    self.mailbox.role(),
                    offset
                );
                0
            }
        };

        Some(value & access_mask(size))
    }

    fn write(&self, offset: u64, value: u64, size: u8) -> bool {
        if let Err(e) = check_access(offset, size) {
            log::warn!(target: "guest_error", "{}: write refused: {}", self.mailbox.role(), e);
            return false;
        }

        let value = value & access_mask(size);
        match self.layout.decode(offset, size) {
            Some(Register::IntMaskSet) => self.mailbox.set_int_mask(value as u32),
            Some(Register::IntMaskClr) => self.mailbox.clear_int_mask(value as u32),
            Some(Register::Ctrl(dir)) => self.mailbox.set_ctrl(dir, value as u32),
            Some(Register::Send(dir, at)) => self.write_slot(dir, at, value, size),
            Some(Register::Recv(..)) | None => {
                log::warn!(
                    target: "guest_error",
                    "{}: unknown write @ {:#x} value {:#x}",
                    self.mailbox.role(),
                    offset,
                    value
                );
            }
        }

        true
    }

    fn size(&self) -> u64 {
        self.layout.window_size
    }
}

impl core::fmt::Debug for MailboxRegs {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MailboxRegs")
            .field("mailbox", &self.mailbox.role())
            .field("window_size", &self.layout.window_size)
            .finish_non_exhaustive()
    }
}
