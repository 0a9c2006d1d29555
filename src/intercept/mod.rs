//! Background network interceptor with its own versioned caches.
//!
//! Sits between the application and the network:
//! - Shell assets are cached on install and served cache-first
//! - Dynamic API responses are network-first, falling back to the last success
//! - Navigations that miss both get the offline fallback document
//! - Namespaces from older versions are deleted on activation
//! - Clients can pre-warm the data namespace through `InterceptorHandle`

mod namespace;
mod upstream;
mod worker;

pub use namespace::{MemoryNamespaces, NamespaceStore, SqliteNamespaces};
pub use upstream::{HttpUpstream, InterceptRequest};
pub use worker::{Interceptor, InterceptorHandle, InterceptorSettings, ResponseSource};
