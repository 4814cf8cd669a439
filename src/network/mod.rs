//! Network layer - wire construction, transports and the dispatch actor
//!
//! [`client::DispatchEngine`] does the work for a single call; the
//! [`NetworkActor`] runs many of them at once behind a channel.

pub mod actor;
pub mod client;
pub mod transport;

pub use actor::{NetworkActor, NetworkHandle};
pub use client::{build_raw_request, DispatchEngine, DispatchOptions};
pub use transport::{NativeTransport, RawRequest, RawResponse, RestrictedTransport, Transport};
