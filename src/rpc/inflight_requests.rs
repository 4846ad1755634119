use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use flume::Sender;
use tracing::trace;

use crate::common::{Contact, Id, RequestType, ResponseSpecific};
use crate::{Error, Result};

/// A request that was sent and is waiting for its response.
#[derive(Debug)]
pub struct PendingRequest {
    pub correlation_id: String,
    pub request_type: RequestType,
    pub target: Contact,
    pub sent_at: Instant,
    responder: Sender<Result<ResponseSpecific>>,
}

impl PendingRequest {
    pub fn new(
        correlation_id: String,
        request_type: RequestType,
        target: Contact,
        responder: Sender<Result<ResponseSpecific>>,
    ) -> Self {
        Self {
            correlation_id,
            request_type,
            target,
            sent_at: Instant::now(),
            responder,
        }
    }
}

/// What happened to an incoming response.
#[derive(Debug, PartialEq, Eq)]
pub enum Resolution {
    /// Matched a pending request and was handed to its caller.
    Answered,
    /// Matched a pending request but had the wrong type.
    Mismatched,
    /// Came from a node other than the one the request was sent to.
    WrongSender,
    /// No such pending request (timed out, answered already, or never sent).
    Unexpected,
}

/// Pending requests keyed by correlation id.
#[derive(Debug, Default)]
pub struct InflightRequests {
    requests: Mutex<HashMap<String, PendingRequest>>,
}

impl InflightRequests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, request: PendingRequest) {
        self.lock()
            .insert(request.correlation_id.clone(), request);
    }

    pub fn contains(&self, correlation_id: &str) -> bool {
        self.lock().contains_key(correlation_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Remove a pending request without resolving it.
    pub fn remove(&self, correlation_id: &str) -> Option<PendingRequest> {
        self.lock().remove(correlation_id)
    }

    /// Resolve the pending request matching a response, exactly once.
    ///
    /// The result is sent while the map is locked, so a caller that finds its
    /// entry gone is guaranteed to find the result in its channel.
    pub fn resolve(
        &self,
        correlation_id: &str,
        from: &Contact,
        response: ResponseSpecific,
    ) -> Resolution {
        let mut requests = self.lock();

        let request = match requests.get(correlation_id) {
            Some(request) => request,
            None => return Resolution::Unexpected,
        };

        if request.target.id() != from.id() {
            return Resolution::WrongSender;
        }

        let resolution = if request.request_type.accepts(&response.response_type) {
            Resolution::Answered
        } else {
            Resolution::Mismatched
        };

        if let Some(request) = requests.remove(correlation_id) {
            let result = match resolution {
                Resolution::Answered => Ok(response),
                _ => Err(Error::MalformedMessage(format!(
                    "{:?} response to a {:?} request",
                    response.response_type, request.request_type
                ))),
            };

            // The caller may have given up already.
            let _ = request.responder.send(result);
        }

        resolution
    }

    /// Resolve a pending request with an error, returns false if it is unknown
    /// or was sent to another node than `from`.
    pub fn fail(&self, correlation_id: &str, from: &Id, error: Error) -> bool {
        let mut requests = self.lock();

        match requests.get(correlation_id) {
            Some(request) if request.target.id() == from => {}
            _ => return false,
        }

        match requests.remove(correlation_id) {
            Some(request) => {
                let _ = request.responder.send(Err(error));
                true
            }
            None => false,
        }
    }

    /// Drop requests older than `timeout` whose callers stopped waiting.
    pub fn cleanup(&self, timeout: Duration) {
        self.lock().retain(|correlation_id, request| {
            let keep =
                request.sent_at.elapsed() < timeout || !request.responder.is_disconnected();

            if !keep {
                trace!(context = "inflight_cleanup", ?correlation_id, "Dropping expired request");
            }

            keep
        });
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PendingRequest>> {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::common::{ResponseTypeSpecific, Status};

    fn pong() -> ResponseSpecific {
        ResponseSpecific {
            status: Status::Ok,
            response_type: ResponseTypeSpecific::Pong,
        }
    }

    #[test]
    fn resolves_exactly_once() {
        let inflight = InflightRequests::new();
        let target = Contact::random();
        let (tx, rx) = flume::bounded(1);

        inflight.insert(PendingRequest::new(
            "1".to_string(),
            RequestType::Ping,
            target.clone(),
            tx,
        ));

        assert_eq!(inflight.resolve("1", &target, pong()), Resolution::Answered);
        assert_eq!(inflight.resolve("1", &target, pong()), Resolution::Unexpected);

        assert_eq!(rx.recv().unwrap().unwrap(), pong());
        assert!(rx.try_recv().is_err());
        assert!(inflight.is_empty());
    }

    #[test]
    fn ignores_wrong_sender() {
        let inflight = InflightRequests::new();
        let (tx, _rx) = flume::bounded(1);

        inflight.insert(PendingRequest::new(
            "1".to_string(),
            RequestType::Ping,
            Contact::random(),
            tx,
        ));

        assert_eq!(
            inflight.resolve("1", &Contact::random(), pong()),
            Resolution::WrongSender
        );
        assert!(inflight.contains("1"));
    }

    #[test]
    fn fail_ignores_wrong_sender() {
        let inflight = InflightRequests::new();
        let target = Contact::random();
        let (tx, rx) = flume::bounded(1);

        inflight.insert(PendingRequest::new(
            "1".to_string(),
            RequestType::Ping,
            target.clone(),
            tx,
        ));

        let error = || Error::MalformedMessage("bad params".to_string());

        assert!(!inflight.fail("1", Contact::random().id(), error()));
        assert!(inflight.contains("1"));
        assert!(rx.try_recv().is_err());

        assert!(inflight.fail("1", target.id(), error()));
        assert!(matches!(rx.recv().unwrap(), Err(Error::MalformedMessage(_))));
    }

    #[test]
    fn mismatched_type_is_malformed() {
        let inflight = InflightRequests::new();
        let target = Contact::random();
        let (tx, rx) = flume::bounded(1);

        inflight.insert(PendingRequest::new(
            "1".to_string(),
            RequestType::Store,
            target.clone(),
            tx,
        ));

        assert_eq!(inflight.resolve("1", &target, pong()), Resolution::Mismatched);
        assert!(matches!(
            rx.recv().unwrap(),
            Err(Error::MalformedMessage(_))
        ));
    }

    #[test]
    fn cleanup_keeps_waited_requests() {
        let inflight = InflightRequests::new();
        let (tx, rx) = flume::bounded(1);
        let (dropped_tx, dropped_rx) = flume::bounded(1);
        drop(dropped_rx);

        inflight.insert(PendingRequest::new(
            "waited".to_string(),
            RequestType::Ping,
            Contact::random(),
            tx,
        ));
        inflight.insert(PendingRequest::new(
            "abandoned".to_string(),
            RequestType::Ping,
            Contact::random(),
            dropped_tx,
        ));

        inflight.cleanup(Duration::from_millis(0));

        assert!(inflight.contains("waited"));
        assert!(!inflight.contains("abandoned"));
        drop(rx);
    }
}
