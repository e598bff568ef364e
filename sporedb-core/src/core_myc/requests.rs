//! Gossip-pull bookkeeping.

use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;

use super::protocol::Node;

/// Nodes asked for one spore before giving up.
const MAX_REQUESTS: usize = 3;

/// Entries remembered for pull service.
const CACHE_SIZE: usize = 128;

#[derive(Debug, Clone, Default)]
struct RequestState {
    requested_to: Vec<Node>,
    delivered: Option<Vec<u8>>,
}

/// Tracks, per spore uuid, the nodes a pull request was sent to and the
/// packed bytes of delivered spores.
///
/// Strict delivery bookkeeping is not required: the rules only optimize
/// bandwidth, and evicted entries merely cause a redundant request.
pub struct RequestsContainer {
    cache: Mutex<LruCache<String, RequestState>>,
}

impl Default for RequestsContainer {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestsContainer {
    pub fn new() -> Self {
        RequestsContainer {
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(CACHE_SIZE).expect("non-zero cache size"),
            )),
        }
    }

    /// Record that `node` may be asked for the spore. Returns whether a
    /// pull request should actually be transmitted.
    pub fn add(&self, spore_uuid: &str, node: &Node) -> bool {
        let mut cache = self.cache.lock();

        let state = match cache.get_mut(spore_uuid) {
            Some(state) => {
                if state.delivered.is_some() || state.requested_to.len() >= MAX_REQUESTS {
                    return false;
                }
                if state.requested_to.iter().any(|n| n.matches(node)) {
                    return false;
                }
                state
            }
            None => {
                cache.put(spore_uuid.to_string(), RequestState::default());
                cache.get_mut(spore_uuid).expect("entry inserted above")
            }
        };

        state.requested_to.push(node.clone());
        true
    }

    /// Cache the packed bytes of a delivered spore.
    pub fn set_delivered(&self, spore_uuid: &str, data: Vec<u8>) {
        self.cache.lock().put(
            spore_uuid.to_string(),
            RequestState {
                requested_to: Vec::new(),
                delivered: Some(data),
            },
        );
    }

    /// The cached bytes of a delivered spore, if any.
    pub fn delivered(&self, spore_uuid: &str) -> Option<Vec<u8>> {
        self.cache
            .lock()
            .get(spore_uuid)
            .and_then(|state| state.delivered.clone())
    }

    pub fn is_delivered(&self, spore_uuid: &str) -> bool {
        self.delivered(spore_uuid).is_some()
    }
}
