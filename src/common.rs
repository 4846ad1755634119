//! Identifiers, contacts, messages and the routing table shared by the rest of the library.

mod closest_contacts;
mod contact;
mod id;
pub mod messages;
mod routing_table;

pub use closest_contacts::*;
pub use contact::*;
pub use id::*;
pub use messages::*;
pub use routing_table::*;
