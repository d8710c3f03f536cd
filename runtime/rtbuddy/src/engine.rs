//! RTBuddy engine: bring-up state machine and endpoint dispatch
//!
//! # State machine
//! ```text
//!   Idle --(start/wakeup: hello)--> WaitHello
//!   WaitHello --(hello-ack: first rollcall)--> WaitRollcall
//!   WaitRollcall --(rollcall ack, more queued: next rollcall)--> WaitRollcall
//!   WaitRollcall --(rollcall ack, queue empty: power-state-ack 32)--> Idle
//! ```
//! Ping and set-ap-power-state are answered in every state.
//!
//! # Locking
//! The protocol state and the endpoint registry have their own locks. Both
//! are released before any message is sent, any handler runs, or the
//! coprocessor start hooks are called.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, RwLock, Weak};

use apple_a7iop::{A7iop, A7iopConfig, CpuStatus, EventLoop, IopOps, Message};

use crate::endpoint::{
    EndpointHandler, EndpointId, EndpointRegistry, EP_CRASHLOG, EP_MANAGEMENT,
};
use crate::mgmt::{pstate, ManagementMessage, PSTATE_MASK, ROLLCALL_DONE_STATE};
use crate::Result;

/// Management endpoint state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ep0State {
    /// Not in a handshake
    Idle,
    /// Hello sent, waiting for hello-ack
    WaitHello,
    /// Rollcall in progress, one message outstanding
    WaitRollcall,
}

/// Hooks for the peripheral that owns an engine
///
/// Called on coprocessor start/wakeup, before the hello goes out.
pub trait RtBuddyOps: Send + Sync {
    fn start(&self, _rtb: &RtBuddy) {}
    fn wakeup(&self, _rtb: &RtBuddy) {}
}

struct ProtocolState {
    ep0: Ep0State,
    rollcall: VecDeque<Message>,
}

/// What a management message asks the engine to do once unlocked
enum Action {
    None,
    Send(Message),
    Wake,
    Sleep(u32),
}

/// Routes the A7IOP start hooks and bottom half back to the engine
#[derive(Default)]
struct EngineLink(OnceLock<Weak<RtBuddy>>);

impl EngineLink {
    fn engine(&self) -> Option<Arc<RtBuddy>> {
        self.0.get().and_then(Weak::upgrade)
    }
}

impl IopOps for EngineLink {
    fn start(&self, _iop: &A7iop) {
        if let Some(rtb) = self.engine() {
            rtb.iop_start(false);
        }
    }

    fn wakeup(&self, _iop: &A7iop) {
        if let Some(rtb) = self.engine() {
            rtb.iop_start(true);
        }
    }
}

/// RTKit coprocessor endpoint engine over one [`A7iop`]
pub struct RtBuddy {
    iop: A7iop,
    protocol_version: u32,
    endpoints: RwLock<EndpointRegistry>,
    state: Mutex<ProtocolState>,
    ops: Option<Arc<dyn RtBuddyOps>>,
}

impl RtBuddy {
    /// Build an engine and its A7IOP block
    ///
    /// The IOP inbox's bottom half is registered on `event_loop`; running
    /// the loop dispatches queued messages. The management endpoint and the
    /// (handler-less) crashlog endpoint are registered up front.
    ///
    /// # Errors
    /// Returns an error if `config` does not validate.
    pub fn new(
        config: &A7iopConfig,
        event_loop: &EventLoop,
        ops: Option<Arc<dyn RtBuddyOps>>,
    ) -> Result<Arc<Self>> {
        let link = Arc::new(EngineLink::default());

        let bh_link = link.clone();
        let bh = event_loop.bottom_half(&format!("{}-rtbuddy", config.role), move || {
            if let Some(rtb) = bh_link.engine() {
                rtb.dispatch();
            }
        });

        let iop_ops: Arc<dyn IopOps> = link.clone();
        let iop = A7iop::new(config, Some(iop_ops), Some(bh))?;

        let rtb = Arc::new(Self {
            iop,
            protocol_version: config.protocol_version,
            endpoints: RwLock::new(EndpointRegistry::default()),
            state: Mutex::new(ProtocolState {
                ep0: Ep0State::Idle,
                rollcall: VecDeque::new(),
            }),
            ops,
        });
        // Fresh cell, cannot already be set.
        let _ = link.0.set(Arc::downgrade(&rtb));

        rtb.register_control_endpoint(EP_MANAGEMENT, |rtb: &RtBuddy, ep, msg| {
            rtb.handle_management(ep, msg)
        })?;
        rtb.endpoints_mut()
            .insert(EndpointId::control(EP_CRASHLOG)?, None, false);

        Ok(rtb)
    }

    /// The A7IOP block this engine drives
    pub fn iop(&self) -> &A7iop {
        &self.iop
    }

    pub fn protocol_version(&self) -> u32 {
        self.protocol_version
    }

    /// Current management endpoint state
    pub fn ep0_state(&self) -> Ep0State {
        self.lock().ep0
    }

    /// Rollcall messages waiting behind the outstanding one
    pub fn pending_rollcall(&self) -> usize {
        self.lock().rollcall.len()
    }

    /// Registered endpoints in ascending wire order
    pub fn endpoints(&self) -> Vec<EndpointId> {
        self.endpoints_ref().ids()
    }

    fn lock(&self) -> MutexGuard<'_, ProtocolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn endpoints_ref(&self) -> std::sync::RwLockReadGuard<'_, EndpointRegistry> {
        self.endpoints.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn endpoints_mut(&self) -> std::sync::RwLockWriteGuard<'_, EndpointRegistry> {
        self.endpoints.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a control endpoint (`id < 32`)
    ///
    /// # Errors
    /// `EndpointOutOfRange` if `id` is not a control endpoint.
    pub fn register_control_endpoint<F>(&self, id: u32, handler: F) -> Result<()>
    where
        F: Fn(&RtBuddy, u32, u64) + Send + Sync + 'static,
    {
        let id = EndpointId::control(id)?;
        let handler: EndpointHandler = Arc::new(handler);
        self.endpoints_mut().insert(id, Some(handler), false);
        Ok(())
    }

    /// Register user endpoint `id` (`id < 224`, wire id `id + 32`)
    ///
    /// The handler receives the local id.
    ///
    /// # Errors
    /// `EndpointOutOfRange` if `id` is outside the user range.
    pub fn register_user_endpoint<F>(&self, id: u32, handler: F) -> Result<()>
    where
        F: Fn(&RtBuddy, u32, u64) + Send + Sync + 'static,
    {
        let id = EndpointId::user(id)?;
        let handler: EndpointHandler = Arc::new(handler);
        self.endpoints_mut().insert(id, Some(handler), true);
        Ok(())
    }

    pub fn unregister_control_endpoint(&self, id: u32) -> Result<()> {
        let id = EndpointId::control(id)?;
        self.endpoints_mut().remove(id);
        Ok(())
    }

    pub fn unregister_user_endpoint(&self, id: u32) -> Result<()> {
        let id = EndpointId::user(id)?;
        self.endpoints_mut().remove(id);
        Ok(())
    }

    fn send(&self, id: EndpointId, payload: u64) {
        self.iop.send_ap(Message::new(id.raw(), payload));
    }

    /// Send `payload` to the AP on control endpoint `id`
    pub fn send_control_message(&self, id: u32, payload: u64) -> Result<()> {
        self.send(EndpointId::control(id)?, payload);
        Ok(())
    }

    /// Send `payload` to the AP on user endpoint `id` (local numbering)
    pub fn send_user_message(&self, id: u32, payload: u64) -> Result<()> {
        self.send(EndpointId::user(id)?, payload);
        Ok(())
    }

    fn send_management(&self, msg: ManagementMessage) {
        self.send(EndpointId::from_raw(EP_MANAGEMENT), msg.encode());
    }

    fn send_hello(&self) {
        log::debug!("RTBuddy({}): send hello v{}", self.iop.role(), self.protocol_version);
        self.lock().ep0 = Ep0State::WaitHello;

        let version = self.protocol_version as u16;
        self.send_management(ManagementMessage::Hello {
            major: version,
            minor: version,
        });
    }

    /// Coprocessor start (`wake == false`) or wakeup
    fn iop_start(&self, wake: bool) {
        log::debug!(
            "RTBuddy({}): iop {}",
            self.iop.role(),
            if wake { "wakeup" } else { "start" }
        );
        self.iop.update_cpu_status(CpuStatus::IDLE, false);

        if let Some(ops) = &self.ops {
            if wake {
                ops.wakeup(self);
            } else {
                ops.start(self);
            }
        }

        self.send_hello();
    }

    /// Management endpoint handler
    fn handle_management(&self, ep: u32, raw: u64) {
        let msg = ManagementMessage::decode(raw);
        log::trace!(
            "RTBuddy({}): mgmt msg {:#018x} ({:?}) in {:?}",
            self.iop.role(),
            raw,
            msg,
            self.ep0_state()
        );

        let reply_to = EndpointId::from_raw(ep);
        match msg {
            ManagementMessage::Ping { seg, timestamp } => {
                self.send(reply_to, ManagementMessage::PingAck { seg, timestamp }.encode());
                return;
            }
            ManagementMessage::SetApPowerState { state } => {
                self.send(reply_to, ManagementMessage::SetApPowerState { state }.encode());
                return;
            }
            _ => {}
        }

        let rollcall = matches!(msg, ManagementMessage::HelloAck { .. })
            .then(|| self.endpoints_ref().rollcall());

        let action = {
            let mut state = self.lock();
            match (state.ep0, msg) {
                (Ep0State::Idle, ManagementMessage::SetIopPowerState { state: value }) => {
                    match value & PSTATE_MASK {
                        pstate::WAIT_VR | pstate::ON => Action::Wake,
                        pstate::SLPNOMEM => Action::Sleep(value & PSTATE_MASK),
                        other => {
                            log::debug!(
                                target: "unimp",
                                "RTBuddy({}): unhandled iop power state {:#x}",
                                self.iop.role(),
                                other
                            );
                            Action::None
                        }
                    }
                }
                (Ep0State::WaitHello, ManagementMessage::HelloAck { .. }) => {
                    state.ep0 = Ep0State::WaitRollcall;
                    state.rollcall = rollcall
                        .unwrap_or_default()
                        .into_iter()
                        .map(|m| Message::new(EP_MANAGEMENT, m.encode()))
                        .collect();
                    state.rollcall.pop_front().map_or(Action::None, Action::Send)
                }
                (Ep0State::WaitRollcall, ManagementMessage::Rollcall { .. }) => {
                    match state.rollcall.pop_front() {
                        Some(next) => Action::Send(next),
                        None => {
                            state.ep0 = Ep0State::Idle;
                            log::debug!("RTBuddy({}): rollcall finished", self.iop.role());
                            Action::Send(Message::new(
                                reply_to.raw(),
                                ManagementMessage::PowerStateAck {
                                    state: ROLLCALL_DONE_STATE,
                                }
                                .encode(),
                            ))
                        }
                    }
                }
                (Ep0State::WaitRollcall, ManagementMessage::EpStart { .. }) => Action::None,
                (ep0, msg) => {
                    log::warn!(
                        target: "guest_error",
                        "RTBuddy({}): unexpected {:?} in {:?}",
                        self.iop.role(),
                        msg,
                        ep0
                    );
                    Action::None
                }
            }
        };

        match action {
            Action::None => {}
            Action::Send(msg) => self.iop.send_ap(msg),
            Action::Wake => self.iop.cpu_start(true),
            Action::Sleep(value) => {
                self.iop.set_cpu_status(CpuStatus::IDLE.bits());
                self.send(reply_to, ManagementMessage::PowerStateAck { state: value }.encode());
            }
        }
    }

    /// Drain the IOP inbox, routing each message to its endpoint handler
    ///
    /// Runs from the bottom half; may also be called directly.
    ///
    /// # Returns
    /// Number of messages taken from the inbox
    pub fn dispatch(&self) -> usize {
        let mut handled = 0;

        while !self.iop.iop_mailbox().is_empty() {
            let Some(msg) = self.iop.recv_iop() else {
                break;
            };
            handled += 1;

            let id = EndpointId::from_raw(msg.endpoint);
            let entry = self.endpoints_ref().get(id);
            match entry {
                Some(entry) => match &entry.handler {
                    Some(handler) => handler(self, entry.handler_id(id), msg.msg),
                    None => log::debug!(
                        "RTBuddy({}): endpoint {} has no handler, dropped {:#018x}",
                        self.iop.role(),
                        id,
                        msg.msg
                    ),
                },
                None => log::warn!(
                    target: "guest_error",
                    "RTBuddy({}): message for unregistered endpoint {} dropped",
                    self.iop.role(),
                    id
                ),
            }
        }

        handled
    }

    /// Reset the A7IOP block and return the engine to `Idle`
    pub fn reset(&self) {
        self.iop.reset();

        let mut state = self.lock();
        state.ep0 = Ep0State::Idle;
        state.rollcall.clear();
    }
}

impl core::fmt::Debug for RtBuddy {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RtBuddy")
            .field("role", &self.iop.role())
            .field("protocol_version", &self.protocol_version)
            .field("ep0", &self.ep0_state())
            .finish_non_exhaustive()
    }
}
