//! # quay-server
//!
//! HTTP surface for the deployment engine: submission endpoints, live
//! SSE event streams, the injected-event stream merger, and static
//! serving of published sites.

pub mod relay;
pub mod server;
pub mod sse;

pub use relay::{keep_alive, merged, InjectHandle, KeepAliveStream, MergedStream};
pub use server::{router, serve, AppState, SharedState};
