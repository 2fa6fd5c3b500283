//! Request/response values and the network transport seam.
//!
//! Everything that touches the network goes through [`Transport`], so the
//! interception layer, the liveness probe and the replay queue can be driven
//! by a real HTTP client in production and by scripted fakes in tests.

mod transport;
mod types;

pub use transport::{HttpTransport, Transport, TransportError};
pub use types::{Request, Response, ResponseSource};
