//! # Transport Layer
//!
//! Connection management over a UDP socket.
//!
//! ## Components
//! - **Endpoint**: sans-IO connection manager, driven by datagrams and ticks
//! - **Manager**: tokio task owning the socket and driving an endpoint

pub mod endpoint;
pub mod manager;

pub use endpoint::{ConnectionHandle, ConnectionInfo, Endpoint, Event, Received, Transmit};
pub use manager::Manager;
