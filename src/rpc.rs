//! Request/response RPC protocol: correlation ids, pending requests, dispatch
//! over a [Transport], and the lookup engine built on top of it.

pub mod config;
mod inflight_requests;
pub mod iterative_query;
pub(crate) mod server;
pub mod udp;

use std::fmt::Debug;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use flume::{Receiver, RecvTimeoutError};
use tracing::{debug, trace};

use crate::common::{Contact, Id, Message, MessageType, RequestSpecific, ResponseSpecific};
use crate::{Error, Result};

pub use config::{Config, DEFAULT_ALPHA, DEFAULT_REQUEST_TIMEOUT};
pub use inflight_requests::{InflightRequests, PendingRequest, Resolution};
pub use iterative_query::{CancellationToken, LookupParams, NodeLookup, Probe, ValueLookup};
pub use udp::UdpTransport;

#[derive(thiserror::Error, Debug)]
/// Errors raised by a [Transport] while dispatching a message.
pub enum TransportError {
    /// Nothing is listening at that address.
    #[error("No route to {0}")]
    Unreachable(SocketAddr),

    /// The transport was shut down.
    #[error("Transport closed")]
    Closed,

    #[error(transparent)]
    /// Transparent [std::io::Error]
    IO(#[from] std::io::Error),
}

/// Delivers encoded messages to peers.
///
/// The transport owns sockets and framing. Replies to requests come back
/// through [crate::Dht::handle_incoming] on the sending node.
pub trait Transport: Debug + Send + Sync {
    fn send(&self, to: SocketAddr, bytes: Vec<u8>) -> Result<(), TransportError>;
}

/// Handle on a sent request, resolved once by a response or by its deadline.
#[derive(Debug)]
pub struct PendingResponse {
    correlation_id: String,
    target: Contact,
    deadline: Instant,
    receiver: Receiver<Result<ResponseSpecific>>,
}

impl PendingResponse {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn target(&self) -> &Contact {
        &self.target
    }
}

/// Formats, sends and correlates requests for one node.
#[derive(Debug)]
pub struct Rpc {
    local: Contact,
    transport: Arc<dyn Transport>,
    inflight_requests: InflightRequests,
    next_tid: AtomicU64,
    request_timeout: Duration,
}

impl Rpc {
    pub fn new(local: Contact, transport: Arc<dyn Transport>, request_timeout: Duration) -> Self {
        Self {
            local,
            transport,
            inflight_requests: InflightRequests::new(),
            next_tid: AtomicU64::new(0),
            request_timeout,
        }
    }

    // === Getters ===

    /// This node as seen by its peers.
    pub fn local(&self) -> &Contact {
        &self.local
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Returns true if this correlation id is still waiting for a response.
    pub fn inflight(&self, correlation_id: &str) -> bool {
        self.inflight_requests.contains(correlation_id)
    }

    pub fn inflight_count(&self) -> usize {
        self.inflight_requests.len()
    }

    // === Public Methods ===

    /// Send a request and record it as pending.
    pub fn request(&self, to: &Contact, request: RequestSpecific) -> Result<PendingResponse> {
        self.inflight_requests.cleanup(self.request_timeout);

        let correlation_id = self.tid();
        let request_type = request.request_type();
        let message = Message::request(correlation_id.clone(), self.local.clone(), request);
        let bytes = message.to_bytes()?;

        let (sender, receiver) = flume::bounded(1);
        self.inflight_requests.insert(PendingRequest::new(
            correlation_id.clone(),
            request_type,
            to.clone(),
            sender,
        ));

        trace!(context = "rpc_request_sending", ?message, to = ?to.address());

        if let Err(error) = self.transport.send(to.address(), bytes) {
            debug!(?error, to = ?to.address(), "Error sending request message");
            self.inflight_requests.remove(&correlation_id);

            return Err(error.into());
        }

        Ok(PendingResponse {
            correlation_id,
            target: to.clone(),
            deadline: Instant::now() + self.request_timeout,
            receiver,
        })
    }

    /// Block until the response arrives or the request times out.
    pub fn wait(&self, pending: PendingResponse) -> Result<ResponseSpecific> {
        match pending.receiver.recv_deadline(pending.deadline) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => self.expire(pending),
            Err(RecvTimeoutError::Disconnected) => Err(Error::DhtWasShutdown),
        }
    }

    /// Hand a decoded response to the request waiting for it.
    pub fn handle_response(&self, message: Message) -> Resolution {
        let Message {
            transaction_id,
            sender,
            message_type,
        } = message;

        let response = match message_type {
            MessageType::Response(response) => response,
            MessageType::Request(_) => return Resolution::Unexpected,
        };

        let resolution = self
            .inflight_requests
            .resolve(&transaction_id, &sender, response);

        match resolution {
            Resolution::Answered => {}
            Resolution::Mismatched => {
                debug!(context = "rpc_validation", ?transaction_id, "Response of the wrong type")
            }
            Resolution::WrongSender => {
                trace!(context = "rpc_validation", ?transaction_id, from = ?sender.id(), "Response from wrong node")
            }
            Resolution::Unexpected => {
                trace!(context = "rpc_validation", ?transaction_id, "Unexpected response id")
            }
        }

        resolution
    }

    /// Fail a pending request with a decoding error, if `from` is the node it
    /// was sent to.
    pub fn fail(&self, correlation_id: &str, from: &Id, error: Error) -> bool {
        self.inflight_requests.fail(correlation_id, from, error)
    }

    // === Private Methods ===

    fn expire(&self, pending: PendingResponse) -> Result<ResponseSpecific> {
        if self
            .inflight_requests
            .remove(&pending.correlation_id)
            .is_none()
        {
            // Answered right at the deadline, the result is already in the channel.
            if let Ok(result) = pending.receiver.try_recv() {
                return result;
            }
        }

        trace!(context = "rpc_timeout", correlation_id = ?pending.correlation_id, to = ?pending.target.address());

        Err(Error::Timeout {
            correlation_id: pending.correlation_id,
        })
    }

    /// Increments self.next_tid and returns the previous value.
    fn tid(&self) -> String {
        // Ids are only reused after 2^64 requests.
        self.next_tid.fetch_add(1, Ordering::Relaxed).to_string()
    }
}
