//! Network fetch layer for the hosted realtime data service.

mod http;
mod sse;
mod traits;

pub use http::{normalize_base, resource_url, HttpRemote};
pub use traits::RemoteService;
#[cfg(test)]
pub use traits::{RemoteUpdate, Subscription};
