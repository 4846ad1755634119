use std::{net::SocketAddr, time::Duration};

use crate::common::{Contact, Id, DEFAULT_FAILURE_THRESHOLD, DEFAULT_K};
use crate::store::Storage;

/// Default request timeout before abandoning an inflight request to a non-responding node.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(2000); // 2 seconds
/// Default number of concurrent probes per lookup round.
pub const DEFAULT_ALPHA: usize = 3;

#[derive(Debug)]
/// Dht Configurations
pub struct Config {
    /// This node's Id.
    ///
    /// Defaults to None, where a random Id is generated.
    pub id: Option<Id>,
    /// The address peers reach this node at, advertised in every message.
    ///
    /// Defaults to `127.0.0.1:0`, transports that bind a socket override it.
    pub address: SocketAddr,
    /// Maximum number of contacts per k-bucket, also the size of lookup results.
    ///
    /// Defaults to [DEFAULT_K]
    pub k: usize,
    /// Concurrent probes per lookup round.
    ///
    /// Defaults to [DEFAULT_ALPHA]
    pub alpha: usize,
    /// Request timeout duration.
    ///
    /// The longer this duration is, the longer lookups take until they are deemed "done".
    /// The shorter this duration is, the more responses from busy nodes we miss out on,
    /// which affects the accuracy of lookups trying to find closest nodes to a target.
    ///
    /// Defaults to [DEFAULT_REQUEST_TIMEOUT]
    pub request_timeout: Duration,
    /// Consecutive failed probes after which a contact may be evicted.
    ///
    /// Defaults to [DEFAULT_FAILURE_THRESHOLD]
    pub failure_threshold: u32,
    /// Store values found by `find_value` at the closest responder that lacked them.
    ///
    /// Defaults to false
    pub cache_lookups: bool,
    /// Contacts to ping and look ourselves up through once the node is running.
    ///
    /// Defaults to an empty list.
    pub bootstrap: Vec<Contact>,
    /// Storage answering `store` and `findValue` requests.
    ///
    /// Defaults to None, where a [crate::store::MemoryStore] is used.
    pub storage: Option<Box<dyn Storage>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            id: None,
            address: SocketAddr::from(([127, 0, 0, 1], 0)),
            k: DEFAULT_K,
            alpha: DEFAULT_ALPHA,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            cache_lookups: false,
            bootstrap: Vec::new(),
            storage: None,
        }
    }
}
