//! Wire level behaviour against a peer answering with scripted bytes.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kadnode::messages::{Message, MessageType};
use kadnode::rpc::{Transport, TransportError};
use kadnode::{Contact, Dht, Error, Id, NodeLookup};

type Script = Box<dyn Fn(&str, &Contact) -> Option<String> + Send + Sync>;

/// Answers every request with whatever the script returns for its correlation id.
struct ScriptedTransport {
    dht: Mutex<Option<Dht>>,
    peer: Contact,
    script: Script,
    sent: Mutex<usize>,
}

impl std::fmt::Debug for ScriptedTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedTransport")
            .field("peer", &self.peer)
            .finish()
    }
}

impl Transport for ScriptedTransport {
    fn send(&self, _to: SocketAddr, bytes: Vec<u8>) -> Result<(), TransportError> {
        *self.sent.lock().unwrap() += 1;

        let request = Message::from_bytes(&bytes).unwrap();
        assert!(matches!(request.message_type, MessageType::Request(_)));

        if let Some(reply) = (self.script)(&request.transaction_id, &self.peer) {
            if let Some(dht) = self.dht.lock().unwrap().as_ref() {
                assert_eq!(dht.handle_incoming(reply.as_bytes()), None);
            }
        }

        Ok(())
    }
}

fn wire_contact(contact: &Contact) -> String {
    format!(
        r#"{{"id":"{}","ipAddress":"{}","port":{}}}"#,
        contact.id(),
        contact.address().ip(),
        contact.address().port()
    )
}

fn scripted(script: Script) -> (Dht, Arc<ScriptedTransport>) {
    let transport = Arc::new(ScriptedTransport {
        dht: Mutex::new(None),
        peer: Contact::new(Id::random(), SocketAddr::from(([127, 0, 0, 1], 4000))),
        script,
        sent: Mutex::new(0),
    });

    let dht = Dht::builder()
        .request_timeout(Duration::from_millis(100))
        .build_with_transport(transport.clone());
    *transport.dht.lock().unwrap() = Some(dht.clone());

    (dht, transport)
}

#[test]
fn well_formed_response_is_answered() {
    let (dht, transport) = scripted(Box::new(|correlation_id, peer| {
        Some(format!(
            r#"{{"requestId":"{}","status":"ok","type":"pong","sender":{}}}"#,
            correlation_id,
            wire_contact(peer)
        ))
    }));

    dht.ping(&transport.peer).unwrap();
    assert!(dht.routing_table().contains(transport.peer.id()));
}

#[test]
fn malformed_response_fails_the_request() {
    let (dht, transport) = scripted(Box::new(|correlation_id, peer| {
        Some(format!(
            r#"{{"requestId":"{}","status":"ok","type":"node","sender":{},"params":{{"nodes":"not a list"}}}}"#,
            correlation_id,
            wire_contact(peer)
        ))
    }));

    let lookup_result = dht.send_request(
        &transport.peer,
        kadnode::messages::RequestSpecific::FindNode(kadnode::messages::FindNodeRequestArguments {
            target: Id::random(),
        }),
    );

    assert!(matches!(lookup_result, Err(Error::MalformedMessage(_))));
    assert_eq!(dht.info().inflight_requests(), 0);
}

#[test]
fn unsupported_response_times_out() {
    let (dht, transport) = scripted(Box::new(|correlation_id, peer| {
        Some(format!(
            r#"{{"requestId":"{}","status":"ok","type":"gossip","sender":{}}}"#,
            correlation_id,
            wire_contact(peer)
        ))
    }));

    assert!(matches!(
        dht.ping(&transport.peer),
        Err(Error::Timeout { .. })
    ));
}

#[test]
fn response_of_the_wrong_type_is_malformed() {
    let (dht, transport) = scripted(Box::new(|correlation_id, peer| {
        Some(format!(
            r#"{{"requestId":"{}","status":"ok","type":"value","sender":{},"params":{{"key":"k","value":null}}}}"#,
            correlation_id,
            wire_contact(peer)
        ))
    }));

    assert!(matches!(
        dht.ping(&transport.peer),
        Err(Error::MalformedMessage(_))
    ));
}

#[test]
fn empty_routing_table_sends_nothing() {
    let (dht, transport) = scripted(Box::new(|_, _| None));

    assert_eq!(dht.find_node(Id::random()), NodeLookup::EmptyRoutingTable);
    assert_eq!(*transport.sent.lock().unwrap(), 0);
}

#[test]
fn rejected_store_is_an_error() {
    let (dht, transport) = scripted(Box::new(|correlation_id, peer| {
        Some(format!(
            r#"{{"requestId":"{}","status":"failed","type":"store","sender":{},"params":{{"previousValue":null}}}}"#,
            correlation_id,
            wire_contact(peer)
        ))
    }));

    assert!(matches!(
        dht.store(&transport.peer, "key", Some("value".to_string())),
        Err(Error::Rejected(kadnode::messages::Status::Failed))
    ));
}

#[test]
fn malformed_response_from_another_node_is_ignored() {
    let (dht, transport) = scripted(Box::new(|correlation_id, peer| {
        let impostor = Contact::new(Id::random(), peer.address());

        Some(format!(
            r#"{{"requestId":"{}","status":"ok","type":"store","sender":{},"params":{{}}}}"#,
            correlation_id,
            wire_contact(&impostor)
        ))
    }));

    assert!(matches!(
        dht.ping(&transport.peer),
        Err(Error::Timeout { .. })
    ));
}

#[test]
fn unsupported_response_without_status_times_out() {
    let (dht, transport) = scripted(Box::new(|correlation_id, peer| {
        Some(format!(
            r#"{{"requestId":"{}","type":"announce","sender":{}}}"#,
            correlation_id,
            wire_contact(peer)
        ))
    }));

    assert!(matches!(
        dht.ping(&transport.peer),
        Err(Error::Timeout { .. })
    ));
}
