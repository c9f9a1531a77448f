//! Request/respond plane over the pluggable transport.

pub(crate) mod client;
pub(crate) mod server;

pub use client::RpcClient;
pub use server::{BackgroundServer, RpcServer};
