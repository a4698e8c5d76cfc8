//! Identifiers, routing state and wire messages used throughout the library.

mod bucket;
mod contact;
mod id;
pub mod messages;
mod routing_table;

pub use bucket::*;
pub use contact::*;
pub use id::*;
pub use messages::*;
pub use routing_table::*;
