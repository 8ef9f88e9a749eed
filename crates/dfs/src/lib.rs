#![forbid(unsafe_code)]
//! Distributed block store.
//!
//! One metadata node keeps the namespace and every file's block map behind a
//! shadow-block redo log; data nodes hold versioned block bytes; the
//! [`Client`] stitches the two together. [`LocalCluster`] wires a complete
//! in-process deployment.

mod cluster;

pub use cluster::{ClusterOptions, LocalCluster};

pub use dfs_alloc as alloc;
pub use dfs_block as block;
pub use dfs_dir as dir;
pub use dfs_inode as inode;
pub use dfs_journal as journal;
pub use dfs_rpc as rpc;
pub use dfs_types as types;

pub use dfs_client::Client;
pub use dfs_datanode::{DataNode, DataNodeOptions};
pub use dfs_error::{DfsError, ErrorCode, Result};
pub use dfs_metadata::{MetadataNode, MetadataOptions};
pub use dfs_rpc::{DataService, MetadataService, RpcServerOptions};
pub use dfs_types::{BlockId, BlockInfo, FileAttr, InodeId, InodeType, MacId, Version};
