//! Iterative algorithms driving many sessions: lookup, get and put.

mod closest_nodes;
mod get;
mod lookup;
mod put;

pub use closest_nodes::ClosestNodes;

pub(crate) use get::{get, get_counters};
pub(crate) use lookup::lookup;
pub(crate) use put::{check_size, put, unsigned_request};
