#![doc = include_str!("../README.md")]
//! ## Feature flags
#![doc = document_features::document_features!()]
//!

// Public modules
mod common;

#[cfg(feature = "async")]
pub mod async_dht;
mod dht;
mod error;
pub mod rpc;
pub mod store;
pub mod testnet;

pub use crate::common::{messages, ClosestContacts, Contact, Distance, Id, Insertion, RoutingTable};
pub use dht::{Dht, DhtBuilder, Info};
pub use error::{Error, Result};
pub use rpc::{CancellationToken, NodeLookup, ValueLookup};
pub use testnet::Testnet;
