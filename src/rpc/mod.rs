//! Worker coordinator RPC surface
//!
//! Terminates client and worker requests at any master. Leader-only
//! operations answered by a follower carry a `NotLeader` hint instead of
//! an error status; the routing client follows hints and iterates the
//! configured master set.

pub mod api;
pub mod client;
pub mod dispatch;
pub mod protocol;
pub mod server;

pub use api::CoordinatorApi;
pub use client::{HttpMaster, RoutingClient};
pub use dispatch::Dispatcher;
