//! Request interception.
//!
//! Every outgoing request is classified by [`RouteTable`] and then served
//! network-first, cache-first, passed through or queued by [`Interceptor`],
//! depending on its class and the current connection state.

mod classify;
mod interceptor;
mod synthetic;

pub use classify::{RequestClass, RouteTable};
pub use interceptor::{FetchError, InstallReport, Interceptor};
pub use synthetic::FROM_CACHE_HEADER;
