//! Wire messages.
//!
//! Every message is JSON. A request is `{"method": <name>, "args": {...}}`;
//! a reply is `{"Ok": <response>}` or `{"Err": {"code": .., "message": ..}}`.
//! `mknode` answers inode 0 when the name already exists and `lookup`
//! answers inode 0 when it does not.

use dfs_dir::DirEntry;
use dfs_error::{DfsError, ErrorCode};
use dfs_types::{BlockId, BlockInfo, FileAttr, InodeId, InodeType, MacId, Version};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "args", rename_all = "snake_case")]
pub enum MetadataRequest {
    Mknode {
        ty: InodeType,
        parent: InodeId,
        name: String,
    },
    Unlink {
        parent: InodeId,
        name: String,
    },
    Lookup {
        parent: InodeId,
        name: String,
    },
    Readdir {
        inode: InodeId,
    },
    GetTypeAttr {
        inode: InodeId,
    },
    GetBlockMap {
        inode: InodeId,
    },
    AllocBlock {
        inode: InodeId,
    },
    FreeBlock {
        inode: InodeId,
        block_id: BlockId,
        mac_id: MacId,
    },
    ExtendSize {
        inode: InodeId,
        end: u64,
    },
}

impl MetadataRequest {
    /// Wire identifier of this request.
    #[must_use]
    pub fn method(&self) -> &'static str {
        match self {
            Self::Mknode { .. } => "mknode",
            Self::Unlink { .. } => "unlink",
            Self::Lookup { .. } => "lookup",
            Self::Readdir { .. } => "readdir",
            Self::GetTypeAttr { .. } => "get_type_attr",
            Self::GetBlockMap { .. } => "get_block_map",
            Self::AllocBlock { .. } => "alloc_block",
            Self::FreeBlock { .. } => "free_block",
            Self::ExtendSize { .. } => "extend_size",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum MetadataResponse {
    /// `mknode` / `lookup`; 0 is the sentinel.
    Inode(InodeId),
    /// `unlink` / `free_block`.
    Flag(bool),
    Entries(Vec<DirEntry>),
    TypeAttr {
        size: u64,
        atime: u64,
        mtime: u64,
        ctime: u64,
        type_byte: u8,
    },
    BlockMap(Vec<BlockInfo>),
    Block(BlockInfo),
    /// `extend_size`: the resulting logical size.
    Size(u64),
}

impl MetadataResponse {
    #[must_use]
    pub fn type_attr(ty: InodeType, attr: FileAttr) -> Self {
        Self::TypeAttr {
            size: attr.size,
            atime: attr.atime,
            mtime: attr.mtime,
            ctime: attr.ctime,
            type_byte: ty.as_byte(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "args", rename_all = "snake_case")]
pub enum DataRequest {
    ReadData {
        block_id: BlockId,
        offset: u32,
        len: u32,
        version: Version,
    },
    WriteData {
        block_id: BlockId,
        offset: u32,
        bytes: Vec<u8>,
    },
    AllocBlock,
    FreeBlock {
        block_id: BlockId,
    },
}

impl DataRequest {
    #[must_use]
    pub fn method(&self) -> &'static str {
        match self {
            Self::ReadData { .. } => "read_data",
            Self::WriteData { .. } => "write_data",
            Self::AllocBlock => "alloc_block",
            Self::FreeBlock { .. } => "free_block",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum DataResponse {
    /// `read_data`; empty means "refresh your block map".
    Bytes(Vec<u8>),
    Flag(bool),
    Allocated { block_id: BlockId, version: Version },
}

/// Error half of a reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub code: ErrorCode,
    pub message: String,
}

impl RemoteError {
    #[must_use]
    pub fn from_error(err: &DfsError) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
        }
    }

    #[must_use]
    pub fn into_error(self) -> DfsError {
        DfsError::from_code(self.code, self.message)
    }
}

pub(crate) type Reply<T> = std::result::Result<T, RemoteError>;
