//! Management endpoint (endpoint 0) message codec
//!
//! Every management message is a 64-bit payload whose message type lives
//! in bits 52..56. The remaining layout depends on the type:
//!
//! | Type                  | Fields                                        |
//! |-----------------------|-----------------------------------------------|
//! | hello / hello-ack     | major 0..16, minor 16..32                      |
//! | ping / ping-ack       | seg 0..32, timestamp 32..48                    |
//! | endpoint-start        | state 0..32, ep 32..52                         |
//! | power-state messages  | state 0..32                                    |
//! | rollcall              | mask 0..32, block 32..38, ended 51             |

const TYPE_SHIFT: u32 = 52;
const TYPE_MASK: u64 = 0xF;

const ROLLCALL_BLOCK_SHIFT: u32 = 32;
const ROLLCALL_BLOCK_MASK: u64 = 0x3F;
const ROLLCALL_ENDED_BIT: u64 = 1 << 51;

const EP_START_SHIFT: u32 = 32;
/// Everything between bit 32 and the type field
const EP_START_MASK: u64 = 0xF_FFFF;

/// Mask applied to a power-state payload to get the IOP power state
pub const PSTATE_MASK: u32 = 0xFFF;

/// IOP power states carried by `set-iop-power-state`
pub mod pstate {
    /// Asleep, memory not retained
    pub const SLPNOMEM: u32 = 0x000;
    /// Waiting for voltage regulators
    pub const WAIT_VR: u32 = 0x201;
    pub const PWRGATE: u32 = 0x202;
    /// Fully on
    pub const ON: u32 = 0x220;
}

/// State value acknowledged once the rollcall completes
pub const ROLLCALL_DONE_STATE: u32 = 32;

/// Management message type field values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Hello = 1,
    HelloAck = 2,
    Ping = 3,
    PingAck = 4,
    EpStart = 5,
    SetIopPowerState = 6,
    PowerStateAck = 7,
    Rollcall = 8,
    SetApPowerState = 11,
}

impl MessageType {
    /// Decode the type field; `None` for values the protocol does not define
    pub fn from_raw(value: u8) -> Option<Self> {
        Some(match value {
            1 => Self::Hello,
            2 => Self::HelloAck,
            3 => Self::Ping,
            4 => Self::PingAck,
            5 => Self::EpStart,
            6 => Self::SetIopPowerState,
            7 => Self::PowerStateAck,
            8 => Self::Rollcall,
            11 => Self::SetApPowerState,
            _ => return None,
        })
    }
}

/// Decoded management message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagementMessage {
    Hello { major: u16, minor: u16 },
    HelloAck { major: u16, minor: u16 },
    Ping { seg: u32, timestamp: u16 },
    PingAck { seg: u32, timestamp: u16 },
    EpStart { state: u32, ep: u32 },
    SetIopPowerState { state: u32 },
    PowerStateAck { state: u32 },
    Rollcall { mask: u32, block: u8, ended: bool },
    SetApPowerState { state: u32 },
    /// Type field not defined by the protocol; raw payload kept
    Unknown(u64),
}

fn lo32(raw: u64) -> u32 {
    raw as u32
}

fn lo16(raw: u64) -> u16 {
    raw as u16
}

fn hi16(raw: u64) -> u16 {
    (raw >> 16) as u16
}

fn word32(raw: u64) -> u16 {
    (raw >> 32) as u16
}

fn with_type(kind: MessageType, fields: u64) -> u64 {
    ((kind as u64) << TYPE_SHIFT) | fields
}

impl ManagementMessage {
    /// Raw type field of a management payload
    pub fn raw_type(raw: u64) -> u8 {
        ((raw >> TYPE_SHIFT) & TYPE_MASK) as u8
    }

    /// Decode a 64-bit management payload
    pub fn decode(raw: u64) -> Self {
        let Some(kind) = MessageType::from_raw(Self::raw_type(raw)) else {
            return Self::Unknown(raw);
        };

        match kind {
            MessageType::Hello => Self::Hello { major: lo16(raw), minor: hi16(raw) },
            MessageType::HelloAck => Self::HelloAck { major: lo16(raw), minor: hi16(raw) },
            MessageType::Ping => Self::Ping { seg: lo32(raw), timestamp: word32(raw) },
            MessageType::PingAck => Self::PingAck { seg: lo32(raw), timestamp: word32(raw) },
            MessageType::EpStart => Self::EpStart {
                state: lo32(raw),
                ep: ((raw >> EP_START_SHIFT) & EP_START_MASK) as u32,
            },
            MessageType::SetIopPowerState => Self::SetIopPowerState { state: lo32(raw) },
            MessageType::PowerStateAck => Self::PowerStateAck { state: lo32(raw) },
            MessageType::SetApPowerState => Self::SetApPowerState { state: lo32(raw) },
            MessageType::Rollcall => Self::Rollcall {
                mask: lo32(raw),
                block: ((raw >> ROLLCALL_BLOCK_SHIFT) & ROLLCALL_BLOCK_MASK) as u8,
                ended: raw & ROLLCALL_ENDED_BIT != 0,
            },
        }
    }

    /// Encode to a 64-bit management payload
    pub fn encode(&self) -> u64 {
        match *self {
            Self::Hello { major, minor } => {
                with_type(MessageType::Hello, u64::from(major) | (u64::from(minor) << 16))
            }
            Self::HelloAck { major, minor } => {
                with_type(MessageType::HelloAck, u64::from(major) | (u64::from(minor) << 16))
            }
            Self::Ping { seg, timestamp } => {
                with_type(MessageType::Ping, u64::from(seg) | (u64::from(timestamp) << 32))
            }
            Self::PingAck { seg, timestamp } => {
                with_type(MessageType::PingAck, u64::from(seg) | (u64::from(timestamp) << 32))
            }
            Self::EpStart { state, ep } => {
                let ep = (u64::from(ep) & EP_START_MASK) << EP_START_SHIFT;
                with_type(MessageType::EpStart, u64::from(state) | ep)
            }
            Self::SetIopPowerState { state } => with_type(MessageType::SetIopPowerState, u64::from(state)),
            Self::PowerStateAck { state } => with_type(MessageType::PowerStateAck, u64::from(state)),
            Self::SetApPowerState { state } => with_type(MessageType::SetApPowerState, u64::from(state)),
            Self::Rollcall { mask, block, ended } => {
                let mut fields = u64::from(mask)
                    | ((u64::from(block) & ROLLCALL_BLOCK_MASK) << ROLLCALL_BLOCK_SHIFT);
                if ended {
                    fields |= ROLLCALL_ENDED_BIT;
                }
                with_type(MessageType::Rollcall, fields)
            }
            Self::Unknown(raw) => raw,
        }
    }

    /// Message type, if defined
    pub fn kind(&self) -> Option<MessageType> {
        Some(match self {
            Self::Hello { .. } => MessageType::Hello,
            Self::HelloAck { .. } => MessageType::HelloAck,
            Self::Ping { .. } => MessageType::Ping,
            Self::PingAck { .. } => MessageType::PingAck,
            Self::EpStart { .. } => MessageType::EpStart,
            Self::SetIopPowerState { .. } => MessageType::SetIopPowerState,
            Self::PowerStateAck { .. } => MessageType::PowerStateAck,
            Self::Rollcall { .. } => MessageType::Rollcall,
            Self::SetApPowerState { .. } => MessageType::SetApPowerState,
            Self::Unknown(_) => return None,
        })
    }
}
