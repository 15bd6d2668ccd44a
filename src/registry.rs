//! Handle-keyed arena for driving network instances from a host runtime
//!
//! Embedders that cannot hold Rust types refer to instances by small
//! non-negative integer handles. The registry owns the instances; `release`
//! shuts an instance down and frees its slot for reuse. There is no
//! process-wide singleton, the embedder owns the registry it creates.

use crate::network::config::NetworkConfig;
use crate::network::interface::PollingNetwork;
use crate::network::peer::PeerLinkNetwork;
use crate::network::relay::RelayNetwork;

use tracing::warn;

/// Returned by `create` when the configuration cannot be parsed
pub const INVALID_HANDLE: i64 = -1;

/// Owned arena mapping integer handles to live network instances
#[derive(Default)]
pub struct NetworkRegistry {
    slots: Vec<Option<Box<dyn PollingNetwork>>>,
}

impl NetworkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a peer-link instance from a JSON configuration.
    /// Returns a handle >= 0, or [`INVALID_HANDLE`] when the JSON does not
    /// parse as a [`NetworkConfig`].
    pub fn create(&mut self, config_json: &str) -> i64 {
        match NetworkConfig::from_json(config_json) {
            Ok(config) => self.insert(Box::new(PeerLinkNetwork::new(config))),
            Err(e) => {
                warn!("Rejected network configuration: {}", e);
                INVALID_HANDLE
            }
        }
    }

    /// Create a relay-only instance from a JSON configuration
    pub fn create_relay(&mut self, config_json: &str) -> i64 {
        match NetworkConfig::from_json(config_json) {
            Ok(config) => self.insert(Box::new(RelayNetwork::new(config))),
            Err(e) => {
                warn!("Rejected network configuration: {}", e);
                INVALID_HANDLE
            }
        }
    }

    /// Borrow the instance behind a handle
    pub fn get(&self, handle: i64) -> Option<&dyn PollingNetwork> {
        usize::try_from(handle)
            .ok()
            .and_then(|i| self.slots.get(i))
            .and_then(|slot| slot.as_deref())
    }

    /// Shut down and drop the instance behind a handle, freeing the slot.
    /// Unknown or already-released handles are ignored.
    pub fn release(&mut self, handle: i64) {
        let Ok(index) = usize::try_from(handle) else {
            return;
        };
        if let Some(slot) = self.slots.get_mut(index) {
            if let Some(network) = slot.take() {
                network.shutdown();
            }
        }
    }

    /// Number of live instances
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Store an instance in the lowest free slot
    fn insert(&mut self, network: Box<dyn PollingNetwork>) -> i64 {
        let index = match self.slots.iter().position(|s| s.is_none()) {
            Some(free) => {
                self.slots[free] = Some(network);
                free
            }
            None => {
                self.slots.push(Some(network));
                self.slots.len() - 1
            }
        };
        index as i64
    }
}
