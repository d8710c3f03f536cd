//! Mailbox message record
//!
//! Every A7IOP message is a fixed 16-byte record: a 64-bit payload, the
//! endpoint it is addressed to, and a flags word. On the wire (and in the
//! register windows) it is laid out little-endian in that order.

use static_assertions::assert_eq_size;

/// Size of a message record in bytes
pub const MESSAGE_SIZE: usize = 16;

/// One mailbox message
///
/// Messages are plain values: ownership moves from the sender into the
/// inbox and out to the receiver. Payloads larger than 64 bits travel
/// out-of-line and are referenced by address inside `msg`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(C)]
pub struct Message {
    /// Opaque 64-bit payload
    pub msg: u64,

    /// Destination endpoint
    pub endpoint: u32,

    /// Flags; the queue depth at receive time is stamped into bits 20..24
    pub flags: u32,
}

assert_eq_size!(Message, [u8; MESSAGE_SIZE]);

impl Message {
    /// Create a message for `endpoint` carrying `msg`
    pub const fn new(endpoint: u32, msg: u64) -> Self {
        Self {
            msg,
            endpoint,
            flags: 0,
        }
    }

    /// The two 64-bit words of the record, as seen by the register windows
    pub const fn words(&self) -> [u64; 2] {
        [self.msg, (self.endpoint as u64) | ((self.flags as u64) << 32)]
    }

    /// Rebuild a message from its two 64-bit words
    pub const fn from_words(words: [u64; 2]) -> Self {
        Self {
            msg: words[0],
            endpoint: words[1] as u32,
            flags: (words[1] >> 32) as u32,
        }
    }

    /// Serialize to the little-endian 16-byte layout
    pub fn to_bytes(&self) -> [u8; MESSAGE_SIZE] {
        let mut out = [0u8; MESSAGE_SIZE];
        out[0..8].copy_from_slice(&self.msg.to_le_bytes());
        out[8..12].copy_from_slice(&self.endpoint.to_le_bytes());
        out[12..16].copy_from_slice(&self.flags.to_le_bytes());
        out
    }

    /// Deserialize from the little-endian 16-byte layout
    pub fn from_bytes(bytes: &[u8; MESSAGE_SIZE]) -> Self {
        let mut msg = [0u8; 8];
        let mut endpoint = [0u8; 4];
        let mut flags = [0u8; 4];
        msg.copy_from_slice(&bytes[0..8]);
        endpoint.copy_from_slice(&bytes[8..12]);
        flags.copy_from_slice(&bytes[12..16]);

        Self {
            msg: u64::from_le_bytes(msg),
            endpoint: u32::from_le_bytes(endpoint),
            flags: u32::from_le_bytes(flags),
        }
    }
}
