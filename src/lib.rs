//! TangramFS: a user-space, node-local burst-buffer file system for HPC I/O.
//!
//! Each process of a fixed, cooperating job writes to an append-only scratch
//! file on its own node and records which logical bytes those writes back in
//! a per-file extent index. A metadata service answers "who last wrote byte
//! `b` of file `F`"; reads are satisfied locally, over peer RMA from the
//! last writer, or from the backing parallel file system as a last resort.
//! Byte-range lock tokens enforce the configured consistency mode.
//!
//! The crate is transport-agnostic: everything above the [`Transport`] trait
//! is the distributed I/O plane, and the in-tree [`LoopbackHub`] wires a
//! whole job into one process for single-node runs and tests.

#![warn(rust_2018_idioms, unreachable_pub)]

pub use crate::addr::ClientAddr;
pub use crate::config::{Config, Semantics};
pub use crate::error::{TfsError, TfsResult};
pub use crate::extent::{CopyChunk, Extent, ExtentIndex, ExtentView};
pub use crate::lock::{ByteRange, LockDelegator, LockServer, LockToken, LockType};
pub use crate::loopback::{LoopbackHub, LoopbackTransport};
pub use crate::metadata::MetadataStore;
pub use crate::rma::RmaClient;
pub use crate::rpc::server::DEFAULT_WORKERS;
pub use crate::rpc::{BackgroundServer, RpcClient, RpcServer};
pub use crate::server::TangramServer;
pub use crate::session::{FileSession, TangramFs};
pub use crate::transport::{AmHandler, RmaHandler, Transport, pack_envelope, unpack_envelope};
pub use crate::wire::{FrameError, MsgId, WireInterval, WireStat, WireToken};

mod addr;
pub mod config;
mod error;
mod extent;
mod lock;
mod loopback;
mod metadata;
mod rma;
mod rpc;
mod server;
mod session;
mod transport;
mod wire;
