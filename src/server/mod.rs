//! Transport server module
//!
//! Accepts TCP connections, reads HTTP request heads and offers upgrade
//! requests to registered listeners. Also defines the liveness wire format.

mod handler;
pub mod protocol;
mod request;
mod transport;

pub use handler::*;
pub use request::*;
pub(crate) use transport::reject;
pub use transport::{TransportConfig, TransportServer};
