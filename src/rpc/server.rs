//! Answer requests from other nodes.

use tracing::{debug, warn};

use crate::common::{
    FindNodeRequestArguments, FindValueRequestArguments, Id, NodesResponseArguments,
    RequestSpecific, ResponseSpecific, ResponseTypeSpecific, RoutingTable, Status,
    StoreRequestArguments, StoreResponseArguments, ValueResponseArguments,
};
use crate::store::Storage;

/// Compute the response to a decoded request.
///
/// The caller has already folded the requester into the routing table.
pub(crate) fn handle_request(
    routing_table: &RoutingTable,
    storage: &dyn Storage,
    requester: &Id,
    request: &RequestSpecific,
) -> ResponseSpecific {
    match request {
        RequestSpecific::Ping => ok(ResponseTypeSpecific::Pong),
        RequestSpecific::Store(StoreRequestArguments { key, value }) => {
            let result = match value {
                Some(value) => storage.put(key, value.clone()),
                None => storage.delete(key),
            };

            match result {
                Ok(previous_value) => ok(ResponseTypeSpecific::StoreAck(StoreResponseArguments {
                    previous_value,
                })),
                Err(error) => {
                    warn!(?error, ?key, "Local storage rejected a store request");

                    ResponseSpecific {
                        status: Status::Failed,
                        response_type: ResponseTypeSpecific::StoreAck(StoreResponseArguments {
                            previous_value: None,
                        }),
                    }
                }
            }
        }
        RequestSpecific::FindNode(FindNodeRequestArguments { target }) => ok(nodes(
            routing_table,
            requester,
            target,
        )),
        RequestSpecific::FindValue(FindValueRequestArguments { key }) => match storage.get(key) {
            Ok(Some(value)) => ok(ResponseTypeSpecific::Value(ValueResponseArguments {
                key: key.clone(),
                value: Some(value),
            })),
            Ok(None) => ResponseSpecific {
                status: Status::NotFound,
                response_type: nodes(routing_table, requester, &Id::from_key(key)),
            },
            Err(error) => {
                debug!(?error, ?key, "Local storage failed to read");

                ResponseSpecific {
                    status: Status::InternalError,
                    response_type: nodes(routing_table, requester, &Id::from_key(key)),
                }
            }
        },
    }
}

fn ok(response_type: ResponseTypeSpecific) -> ResponseSpecific {
    ResponseSpecific {
        status: Status::Ok,
        response_type,
    }
}

/// The k closest contacts to `target`, leaving out the requester itself.
fn nodes(routing_table: &RoutingTable, requester: &Id, target: &Id) -> ResponseTypeSpecific {
    let contacts = routing_table
        .closest_contacts(target, routing_table.k() + 1)
        .into_iter()
        .filter(|contact| contact.id() != requester)
        .take(routing_table.k())
        .collect();

    ResponseTypeSpecific::Nodes(NodesResponseArguments { contacts })
}
