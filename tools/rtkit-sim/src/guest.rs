//! AP-side RTKit driver working purely through MMIO
//!
//! Plays the role of the application processor's RTKit client: it starts
//! the coprocessor through CPU_CTRL, answers the bring-up handshake and
//! exchanges messages through the AP mailbox window.

use anyhow::{bail, Result};
use std::sync::Arc;

use apple_a7iop::iop::REG_CPU_CTRL;
use apple_a7iop::{CpuCtrl, Direction, EventLoop, Generation, Message, MmioDevice};
use apple_rtbuddy::{ManagementMessage, RtBuddy, EP_MANAGEMENT};

/// Upper bound on management messages exchanged during bring-up
const MAX_BOOT_STEPS: usize = 64;

/// Direction of a logged message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// AP → IOP
    Sent,
    /// IOP → AP
    Received,
}

/// Outcome of a completed bring-up
#[derive(Debug, Default)]
pub struct BootReport {
    /// Every message exchanged, in order
    pub transcript: Vec<(Flow, Message)>,
    /// Endpoints advertised by rollcall, as wire ids
    pub advertised: Vec<u32>,
}

pub struct Guest {
    rtb: Arc<RtBuddy>,
    event_loop: EventLoop,
    generation: Generation,
    transcript: Vec<(Flow, Message)>,
}

impl Guest {
    pub fn new(rtb: Arc<RtBuddy>, event_loop: EventLoop) -> Self {
        let generation = rtb.iop().generation();
        Self {
            rtb,
            event_loop,
            generation,
            transcript: Vec::new(),
        }
    }

    fn ap_reg(&self, local: u64) -> u64 {
        self.generation.ap_mailbox_base() + local
    }

    fn write(&self, offset: u64, value: u64) -> Result<()> {
        if !self.rtb.iop().write(offset, value, 4) {
            bail!("write to {:#x} refused", offset);
        }
        Ok(())
    }

    fn read(&self, offset: u64) -> Result<u64> {
        match self.rtb.iop().read(offset, 4) {
            Some(value) => Ok(value),
            None => bail!("read from {:#x} refused", offset),
        }
    }

    /// Set CPU_CTRL.RUN and let the coprocessor run
    pub fn start(&mut self) -> Result<()> {
        self.write(REG_CPU_CTRL, u64::from(CpuCtrl::RUN.bits()))?;
        self.event_loop.run_pending();
        Ok(())
    }

    /// Write one message into the IOP send slot, word by word
    pub fn send(&mut self, endpoint: u32, payload: u64) -> Result<()> {
        let layout = self.generation.layout();
        let msg = Message::new(endpoint, payload);
        let bytes = msg.to_bytes();

        for word in 0..layout.slot_words() {
            let at = (word * 4) as usize;
            let value = u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
            self.write(self.ap_reg(layout.send_word(Direction::Iop, word)), u64::from(value))?;
        }

        self.transcript.push((Flow::Sent, msg));
        self.event_loop.run_pending();
        Ok(())
    }

    /// Read one message from the AP receive slot, if the inbox holds one
    ///
    /// v2 slots carry no endpoint; messages read through them report
    /// endpoint 0.
    pub fn recv(&mut self) -> Result<Option<Message>> {
        let layout = self.generation.layout();
        let ctrl = self.read(self.ap_reg(layout.ctrl(Direction::Ap)))?;
        if apple_a7iop::CtrlStatus::from_bits_retain(ctrl as u32).depth() == 0 {
            return Ok(None);
        }

        let mut bytes = [0u8; apple_a7iop::message::MESSAGE_SIZE];
        for word in 0..layout.slot_words() {
            let value = self.read(self.ap_reg(layout.recv_word(Direction::Ap, word)))? as u32;
            let at = (word * 4) as usize;
            bytes[at..at + 4].copy_from_slice(&value.to_le_bytes());
        }

        let msg = Message::from_bytes(&bytes);
        self.transcript.push((Flow::Received, msg));
        Ok(Some(msg))
    }

    fn recv_mgmt(&mut self) -> Result<ManagementMessage> {
        match self.recv()? {
            Some(msg) if msg.endpoint == EP_MANAGEMENT => Ok(ManagementMessage::decode(msg.msg)),
            Some(msg) => bail!("expected management message, got endpoint {:#x}", msg.endpoint),
            None => bail!("coprocessor did not answer"),
        }
    }

    fn send_mgmt(&mut self, msg: ManagementMessage) -> Result<()> {
        self.send(EP_MANAGEMENT, msg.encode())
    }

    /// Run the full bring-up: hello, rollcall, power-state ack
    pub fn boot(&mut self) -> Result<BootReport> {
        self.start()?;

        match self.recv_mgmt()? {
            ManagementMessage::Hello { major, minor } => {
                self.send_mgmt(ManagementMessage::HelloAck { major, minor })?;
            }
            other => bail!("expected hello, got {:?}", other),
        }

        let mut advertised = Vec::new();
        for _ in 0..MAX_BOOT_STEPS {
            match self.recv_mgmt()? {
                msg @ ManagementMessage::Rollcall { mask, block, .. } => {
                    advertised.extend(
                        (0..32u32)
                            .filter(|bit| mask & (1 << bit) != 0)
                            .map(|bit| u32::from(block) * 32 + bit),
                    );
                    self.send_mgmt(msg)?;
                }
                ManagementMessage::PowerStateAck { .. } => {
                    return Ok(BootReport {
                        transcript: std::mem::take(&mut self.transcript),
                        advertised,
                    });
                }
                other => bail!("unexpected {:?} during rollcall", other),
            }
        }

        bail!("bring-up did not finish within {} messages", MAX_BOOT_STEPS)
    }

    /// Send a ping and check the ack echoes it
    pub fn ping(&mut self, seg: u32, timestamp: u16) -> Result<()> {
        self.send_mgmt(ManagementMessage::Ping { seg, timestamp })?;
        match self.recv_mgmt()? {
            ManagementMessage::PingAck { seg: s, timestamp: t } if s == seg && t == timestamp => Ok(()),
            other => bail!("bad ping reply {:?}", other),
        }
    }

    /// Messages exchanged since the last [`Guest::boot`]
    pub fn take_transcript(&mut self) -> Vec<(Flow, Message)> {
        std::mem::take(&mut self.transcript)
    }
}
