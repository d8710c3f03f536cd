//! A7IOP core - one coprocessor's mailbox pair and run control
//!
//! The core owns the two cross-wired mailboxes of a coprocessor channel and
//! the CPU control/status words. It offers the four transport primitives
//! used by the layers above:
//!
//! | Primitive    | Mailbox | Inbox touched |
//! |--------------|---------|---------------|
//! | `send_ap`    | IOP     | AP (push)     |
//! | `recv_ap`    | IOP     | AP (pop)      |
//! | `send_iop`   | AP      | IOP (push)    |
//! | `recv_iop`   | AP      | IOP (pop)     |
//!
//! Starting the coprocessor is delegated to an [`IopOps`] implementation so
//! the core stays agnostic of what runs on the other side.
//!
//! # Register window
//! The coprocessor window holds CPU_CTRL and CPU_STATUS, overlaid by the
//! IOP and AP mailbox windows at generation-specific offsets.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bitflags::bitflags;

use crate::bh::BottomHalf;
use crate::config::{A7iopConfig, Generation};
use crate::irq::{IrqLine, IrqSink, MailboxIrq};
use crate::mailbox::regs::MailboxRegs;
use crate::mailbox::{Direction, Mailbox};
use crate::message::Message;
use crate::mmio::{access_mask, check_access, check_window, MmioDevice};
use crate::Result;

/// CPU control register offset
pub const REG_CPU_CTRL: u64 = 0x44;

/// CPU status register offset
pub const REG_CPU_STATUS: u64 = 0x48;

bitflags! {
    /// CPU control word
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CpuCtrl: u32 {
        /// Release the coprocessor from reset
        const RUN = 1 << 4;

        const _ = !0;
    }
}

bitflags! {
    /// CPU status word
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CpuStatus: u32 {
        /// Coprocessor is idle (asleep)
        const IDLE = 1 << 0;

        const _ = !0;
    }
}

/// Coprocessor start/wakeup capability
///
/// Implemented by the layer that emulates the coprocessor firmware. Both
/// methods are called with no A7IOP lock held and may use the transport.
pub trait IopOps: Send + Sync {
    /// Cold start after the AP sets CPU_CTRL.RUN
    fn start(&self, _iop: &A7iop) {}

    /// Wake from a low-power state
    fn wakeup(&self, _iop: &A7iop) {}
}

#[derive(Debug, Default)]
struct CpuState {
    ctrl: CpuCtrl,
    status: CpuStatus,
    running: bool,
}

/// One coprocessor's A7IOP block
pub struct A7iop {
    role: String,
    generation: Generation,
    mmio_size: u64,
    protocol_version: u32,
    iop_regs: MailboxRegs,
    ap_regs: MailboxRegs,
    cpu: Mutex<CpuState>,
    ops: Option<Arc<dyn IopOps>>,
}

impl A7iop {
    /// Build the mailbox pair and register windows described by `config`
    ///
    /// # Arguments
    /// * `config` - role, generation and window size
    /// * `ops` - start/wakeup capability, if anything runs on the IOP side
    /// * `iop_bh` - scheduled whenever a message lands in the IOP inbox
    ///
    /// # Errors
    /// Returns an error if `config` does not validate.
    pub fn new(
        config: &A7iopConfig,
        ops: Option<Arc<dyn IopOps>>,
        iop_bh: Option<BottomHalf>,
    ) -> Result<Self> {
        config.validate()?;

        let (iop_mailbox, ap_mailbox) = Mailbox::pair(&config.role, iop_bh);
        let layout = config.generation.layout();

        log::debug!(
            "A7IOP({}): {:?} window {:#x}, iop mailbox @ {:#x}, ap mailbox @ {:#x}",
            config.role,
            config.generation,
            config.mmio_size,
            config.generation.iop_mailbox_base(),
            config.generation.ap_mailbox_base()
        );

        Ok(Self {
            role: config.role.clone(),
            generation: config.generation,
            mmio_size: config.mmio_size,
            protocol_version: config.protocol_version,
            iop_regs: MailboxRegs::new(iop_mailbox, layout),
            ap_regs: MailboxRegs::new(ap_mailbox, layout),
            cpu: Mutex::new(CpuState::default()),
            ops,
        })
    }

    /// Coprocessor name used in log output
    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// RTKit protocol version this coprocessor speaks
    pub fn protocol_version(&self) -> u32 {
        self.protocol_version
    }

    /// Mailbox owning the AP→IOP inbox
    pub fn iop_mailbox(&self) -> &Arc<Mailbox> {
        self.iop_regs.mailbox()
    }

    /// Mailbox owning the IOP→AP inbox
    pub fn ap_mailbox(&self) -> &Arc<Mailbox> {
        self.ap_regs.mailbox()
    }

    /// Register window of the IOP mailbox
    pub fn iop_regs(&self) -> &MailboxRegs {
        &self.iop_regs
    }

    /// Register window of the AP mailbox
    pub fn ap_regs(&self) -> &MailboxRegs {
        &self.ap_regs
    }

    /// Push a message towards the AP
    pub fn send_ap(&self, msg: Message) {
        self.iop_mailbox().send(Direction::Ap, msg);
    }

    /// Pop a message queued for the AP
    pub fn recv_ap(&self) -> Option<Message> {
        self.iop_mailbox().receive(Direction::Ap)
    }

    /// Push a message towards the IOP
    pub fn send_iop(&self, msg: Message) {
        self.ap_mailbox().send(Direction::Iop, msg);
    }

    /// Pop a message queued for the IOP
    pub fn recv_iop(&self) -> Option<Message> {
        self.ap_mailbox().receive(Direction::Iop)
    }

    /// Device interrupt output `irq` (driven by the AP mailbox)
    pub fn irq(&self, irq: MailboxIrq) -> &IrqLine {
        self.ap_mailbox().irq(irq)
    }

    /// Route device interrupt output `irq` to `sink`
    pub fn connect_irq(&self, irq: MailboxIrq, sink: Arc<dyn IrqSink>) {
        self.irq(irq).connect(sink);
    }

    fn lock(&self) -> MutexGuard<'_, CpuState> {
        self.cpu.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Invoke the start (`wake == false`) or wakeup capability
    pub fn cpu_start(&self, wake: bool) {
        let Some(ops) = &self.ops else {
            log::debug!("A7IOP({}): no ops registered, start ignored", self.role);
            return;
        };

        if wake {
            log::debug!("A7IOP({}): wakeup", self.role);
            ops.wakeup(self);
        } else {
            log::debug!("A7IOP({}): start", self.role);
            ops.start(self);
        }
    }

    pub fn cpu_ctrl(&self) -> u32 {
        self.lock().ctrl.bits()
    }

    /// Write CPU_CTRL; setting RUN on an idle core starts it
    pub fn set_cpu_ctrl(&self, value: u32) {
        let ctrl = CpuCtrl::from_bits_retain(value);
        let start = {
            let mut cpu = self.lock();
            cpu.ctrl = ctrl;
            let start = ctrl.contains(CpuCtrl::RUN) && !cpu.running;
            if start {
                cpu.running = true;
            }
            start
        };

        if start {
            self.cpu_start(false);
        }
    }

    pub fn cpu_status(&self) -> u32 {
        self.lock().status.bits()
    }

    pub fn set_cpu_status(&self, value: u32) {
        self.lock().status = CpuStatus::from_bits_retain(value);
    }

    /// Set or clear bits of CPU_STATUS
    pub fn update_cpu_status(&self, bits: CpuStatus, set: bool) {
        self.lock().status.set(bits, set);
    }

    /// Whether CPU_CTRL.RUN has started the core since the last reset
    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    /// Return both mailboxes, their windows and the CPU words to power-on state
    pub fn reset(&self) {
        self.iop_mailbox().reset();
        self.ap_mailbox().reset();
        self.iop_regs.reset();
        self.ap_regs.reset();
        *self.lock() = CpuState::default();
    }

    fn mailbox_window(&self, offset: u64) -> Option<(&MailboxRegs, u64)> {
        let windows = [
            (&self.iop_regs, self.generation.iop_mailbox_base()),
            (&self.ap_regs, self.generation.ap_mailbox_base()),
        ];
        windows.into_iter().find_map(|(regs, base)| {
            (offset >= base && regs.contains(offset - base)).then(|| (regs, offset - base))
        })
    }
}

impl MmioDevice for A7iop {
    fn read(&self, offset: u64, size: u8) -> Option<u64> {
        if let Err(e) = check_window(offset, size, self.mmio_size) {
            log::warn!(target: "guest_error", "A7IOP({}): read refused: {}", self.role, e);
            return None;
        }
        if let Some((regs, local)) = self.mailbox_window(offset) {
            return regs.read(local, size);
        }

        if let Err(e) = check_access(offset, size) {
            log::warn!(target: "guest_error", "A7IOP({}): read refused: {}", self.role, e);
            return None;
        }

        let value = match offset {
            REG_CPU_CTRL => u64::from(self.cpu_ctrl()),
            REG_CPU_STATUS => u64::from(self.cpu_status()),
            _ => {
                log::debug!(target: "unimp", "A7IOP({}): unknown read from {:#x}", self.role, offset);
                0
            }
        };
        Some(value & access_mask(size))
    }

    fn write(&self, offset: u64, value: u64, size: u8) -> bool {
        if let Err(e) = check_window(offset, size, self.mmio_size) {
            log::warn!(target: "guest_error", "A7IOP({}): write refused: {}", self.role, e);
            return false;
        }
        if let Some((regs, local)) = self.mailbox_window(offset) {
            return regs.write(local, value, size);
        }

        if let Err(e) = check_access(offset, size) {
            log::warn!(target: "guest_error", "A7IOP({}): write refused: {}", self.role, e);
            return false;
        }

        match (offset, self.generation) {
            (REG_CPU_CTRL, _) => self.set_cpu_ctrl(value as u32),
            (REG_CPU_STATUS, Generation::V2) => self.set_cpu_status(value as u32),
            _ => {
                log::debug!(
                    target: "unimp",
                    "A7IOP({}): unknown write to {:#x} of value {:#x}",
                    self.role,
                    offset,
                    value
                );
            }
        }
        true
    }

    fn size(&self) -> u64 {
        self.mmio_size
    }
}

impl core::fmt::Debug for A7iop {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("A7iop")
            .field("role", &self.role)
            .field("generation", &self.generation)
            .field("mmio_size", &self.mmio_size)
            .field("cpu", &*self.lock())
            .finish_non_exhaustive()
    }
}
