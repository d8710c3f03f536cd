//! Endpoint identifiers and the handler registry
//!
//! RTKit endpoints share one 8-bit id space. Ids below [`EP_USER_START`]
//! are control endpoints owned by the protocol itself (management,
//! crashlog, ...). Peripheral endpoints are numbered locally from 0 and
//! live at `local + EP_USER_START` on the wire.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::engine::RtBuddy;
use crate::mgmt::ManagementMessage;
use crate::{Result, RtBuddyError};

/// Management endpoint
pub const EP_MANAGEMENT: u32 = 0;

/// Crash log endpoint
pub const EP_CRASHLOG: u32 = 1;

/// First wire id of the user endpoint range
pub const EP_USER_START: u32 = 32;

/// Number of user endpoint ids
pub const USER_ENDPOINT_COUNT: u32 = 224;

/// Endpoints per rollcall block
const BLOCK_SIZE: u32 = 32;

/// Handler invoked with the engine, the (local) endpoint id and the payload
pub type EndpointHandler = Arc<dyn Fn(&RtBuddy, u32, u64) + Send + Sync>;

/// Wire endpoint id
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EndpointId(u32);

impl EndpointId {
    /// Control endpoint `id`
    ///
    /// # Errors
    /// `EndpointOutOfRange` unless `id < EP_USER_START`.
    pub fn control(id: u32) -> Result<Self> {
        if id >= EP_USER_START {
            return Err(RtBuddyError::EndpointOutOfRange {
                id,
                limit: EP_USER_START,
            });
        }
        Ok(Self(id))
    }

    /// User endpoint with local id `id`
    ///
    /// # Errors
    /// `EndpointOutOfRange` unless `id < USER_ENDPOINT_COUNT`.
    pub fn user(id: u32) -> Result<Self> {
        if id >= USER_ENDPOINT_COUNT {
            return Err(RtBuddyError::EndpointOutOfRange {
                id,
                limit: USER_ENDPOINT_COUNT,
            });
        }
        Ok(Self(id + EP_USER_START))
    }

    /// Wrap a wire id as received from the mailbox
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn is_user(self) -> bool {
        self.0 >= EP_USER_START
    }

    /// Rollcall block this endpoint is advertised in
    pub const fn block(self) -> u32 {
        self.0 / BLOCK_SIZE
    }

    /// Bit of this endpoint within its block's mask
    pub const fn block_bit(self) -> u32 {
        1 << (self.0 % BLOCK_SIZE)
    }
}

impl core::fmt::Display for EndpointId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.is_user() {
            write!(f, "{:#x} (user {:#x})", self.0, self.0 - EP_USER_START)
        } else {
            write!(f, "{:#x}", self.0)
        }
    }
}

#[derive(Clone)]
pub(crate) struct EndpointEntry {
    pub(crate) handler: Option<EndpointHandler>,
    pub(crate) user: bool,
}

impl EndpointEntry {
    /// Id passed to the handler: local numbering for user endpoints
    pub(crate) fn handler_id(&self, id: EndpointId) -> u32 {
        if self.user {
            id.raw() - EP_USER_START
        } else {
            id.raw()
        }
    }
}

/// Endpoints registered on an engine, ordered by wire id
#[derive(Default)]
pub(crate) struct EndpointRegistry {
    entries: BTreeMap<EndpointId, EndpointEntry>,
}

impl EndpointRegistry {
    pub(crate) fn insert(&mut self, id: EndpointId, handler: Option<EndpointHandler>, user: bool) {
        if self
            .entries
            .insert(id, EndpointEntry { handler, user })
            .is_some()
        {
            log::debug!("endpoint {} re-registered", id);
        }
    }

    pub(crate) fn remove(&mut self, id: EndpointId) -> bool {
        self.entries.remove(&id).is_some()
    }

    pub(crate) fn get(&self, id: EndpointId) -> Option<EndpointEntry> {
        self.entries.get(&id).cloned()
    }

    pub(crate) fn ids(&self) -> Vec<EndpointId> {
        self.entries.keys().copied().collect()
    }

    /// Rollcall advertisement for every registered endpoint except 0
    ///
    /// One message per populated 32-endpoint block; the last one carries
    /// `ended`. An empty registry still yields the terminal message.
    pub(crate) fn rollcall(&self) -> Vec<ManagementMessage> {
        let mut out = Vec::new();
        let mut mask = 0u32;
        let mut last_block = 0u32;

        for id in self.entries.keys().filter(|id| id.raw() >= 1) {
            if id.block() != last_block && mask != 0 {
                out.push(ManagementMessage::Rollcall {
                    mask,
                    block: last_block as u8,
                    ended: false,
                });
                mask = 0;
            }
            last_block = id.block();
            mask |= id.block_bit();
        }

        out.push(ManagementMessage::Rollcall {
            mask,
            block: last_block as u8,
            ended: true,
        });
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(ids: &[u32]) -> EndpointRegistry {
        let mut registry = EndpointRegistry::default();
        for &id in ids {
            registry.insert(EndpointId::from_raw(id), None, id >= EP_USER_START);
        }
        registry
    }

    #[test]
    fn test_id_ranges() {
        assert_eq!(EndpointId::control(31).unwrap().raw(), 31);
        assert!(EndpointId::control(32).is_err());
        assert_eq!(EndpointId::user(0).unwrap().raw(), 32);
        assert_eq!(EndpointId::user(223).unwrap().raw(), 255);
        assert!(matches!(
            EndpointId::user(224),
            Err(RtBuddyError::EndpointOutOfRange { id: 224, limit: 224 })
        ));
    }

    #[test]
    fn test_handler_id_translation() {
        let user = EndpointEntry { handler: None, user: true };
        let control = EndpointEntry { handler: None, user: false };
        assert_eq!(user.handler_id(EndpointId::from_raw(0x25)), 5);
        assert_eq!(control.handler_id(EndpointId::from_raw(1)), 1);
    }

    #[test]
    fn test_rollcall_blocks() {
        let messages = registry(&[0, 5, 40, 70, 100]).rollcall();
        assert_eq!(
            messages,
            vec![
                ManagementMessage::Rollcall { mask: 1 << 5, block: 0, ended: false },
                ManagementMessage::Rollcall { mask: 1 << 8, block: 1, ended: false },
                ManagementMessage::Rollcall { mask: 1 << 6, block: 2, ended: false },
                ManagementMessage::Rollcall { mask: 1 << 4, block: 3, ended: true },
            ]
        );
    }

    #[test]
    fn test_rollcall_management_only() {
        let messages = registry(&[0]).rollcall();
        assert_eq!(
            messages,
            vec![ManagementMessage::Rollcall { mask: 0, block: 0, ended: true }]
        );
    }

    #[test]
    fn test_rollcall_same_block_merges() {
        let messages = registry(&[0, 1, 33, 34]).rollcall();
        assert_eq!(
            messages,
            vec![
                ManagementMessage::Rollcall { mask: 1 << 1, block: 0, ended: false },
                ManagementMessage::Rollcall { mask: (1 << 1) | (1 << 2), block: 1, ended: true },
            ]
        );
    }

    #[test]
    fn test_remove() {
        let mut registry = registry(&[0, 40]);
        assert!(registry.remove(EndpointId::from_raw(40)));
        assert!(!registry.remove(EndpointId::from_raw(40)));
        assert_eq!(registry.ids(), vec![EndpointId::from_raw(0)]);
    }
}
