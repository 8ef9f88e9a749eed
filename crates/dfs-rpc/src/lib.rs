#![forbid(unsafe_code)]
//! RPC surface between clients, the metadata node and data nodes.
//!
//! Requests and responses are closed enums whose serde tag is the wire method
//! name. Nodes implement [`MetadataService`] / [`DataService`] directly; the
//! [`MetadataClient`] / [`DataClient`] stubs implement the same traits by
//! calling an [`RpcServer`], so callers cannot tell a local node from a
//! served one.

mod client;
mod protocol;
mod server;
mod service;

pub use client::{DataClient, MetadataClient, RpcClient};
pub use protocol::{DataRequest, DataResponse, MetadataRequest, MetadataResponse, RemoteError};
pub use server::{
    DataEndpoint, Endpoint, MetadataEndpoint, RpcServer, RpcServerOptions, ServerStats,
    StatsSnapshot,
};
pub use service::{DataService, MetadataService};
