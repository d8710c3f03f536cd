//! RTBuddy - RTKit coprocessor protocol engine
//!
//! # Purpose
//! Implements the coprocessor side of Apple's RTKit management protocol
//! on top of an A7IOP mailbox: the hello handshake, the endpoint rollcall,
//! power-state negotiation and ping/ack, plus routing of every other
//! message to the handler registered for its endpoint.
//!
//! # Integration Points
//! - Depends on: `apple-a7iop` (transport, event loop)
//! - Provides to: peripheral models (SMC, SIO, ANS, SEP) that register
//!   endpoint handlers and send replies through the engine
//!
//! # Architecture
//! [`RtBuddy`] owns its [`apple_a7iop::A7iop`]. Messages pushed into the
//! IOP inbox schedule a bottom half that calls [`RtBuddy::dispatch`];
//! endpoint 0 is handled by the engine itself, everything else goes to
//! registered handlers. User endpoints are numbered from 0 by peripherals
//! and offset by [`EP_USER_START`] on the wire.
//!
//! # Testing Strategy
//! - Unit tests: message codec, registry and rollcall construction
//! - Integration tests: full bring-up driven from the AP side

pub mod endpoint;
pub mod engine;
pub mod mgmt;

pub use endpoint::{
    EndpointHandler, EndpointId, EP_CRASHLOG, EP_MANAGEMENT, EP_USER_START, USER_ENDPOINT_COUNT,
};
pub use engine::{Ep0State, RtBuddy, RtBuddyOps};
pub use mgmt::{ManagementMessage, MessageType};

use apple_a7iop::A7iopError;
use thiserror::Error;

/// Error types for endpoint registration and messaging
#[derive(Debug, Error)]
pub enum RtBuddyError {
    #[error("Endpoint {id} out of range (limit {limit})")]
    EndpointOutOfRange { id: u32, limit: u32 },

    #[error("A7IOP error: {0}")]
    A7iop(#[from] A7iopError),
}

pub type Result<T> = std::result::Result<T, RtBuddyError>;
