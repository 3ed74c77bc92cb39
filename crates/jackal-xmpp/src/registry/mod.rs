//! Stream registry for stanza routing.
//!
//! Tracks every bound stream, local or proxied from a cluster peer, keyed by
//! username and resource.
//!
//! ```text
//! c2s task (ortuman/balcony) --bind--> StreamRegistry <--lookup-- Router
//!                                            |
//!                                DashMap<username, [Arc<dyn C2sStream>]>
//! ```

mod stream_registry;

pub use stream_registry::StreamRegistry;
