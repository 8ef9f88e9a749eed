#![forbid(unsafe_code)]
//! Error types for the distributed block store.
//!
//! # Error Taxonomy
//!
//! Two layers, as with every on-disk format in this workspace:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `dfs-types` | Byte-level decode violations |
//! | Runtime | `DfsError` | `dfs-error` (this crate) | Every node, log and client operation |
//!
//! `dfs-error` does not depend on `dfs-types`. Callers decoding live records
//! convert a `ParseError` into `DfsError::Corruption` with the block number
//! they were reading; decode failures of untrusted input (requests, headers)
//! become `DfsError::Format`.
//!
//! ## Wire Mapping
//!
//! Errors cross node boundaries as an [`ErrorCode`] plus message. The mapping
//! in [`DfsError::code`] is exhaustive (no wildcard arms), so adding a variant
//! is a compile error until it has a code.
//!
//! | Variant | Code |
//! |---------|------|
//! | `Io` | `Invalid` |
//! | `Invalid` | `Invalid` |
//! | `InvalidArg` | `InvalidArg` |
//! | `NotExist` | `NotExist` |
//! | `AlreadyExist` | `AlreadyExist` |
//! | `OutOfResource` | `OutOfResource` |
//! | `Corruption` | `Corruption` |
//! | `Format` | `Format` |
//! | `Transport` | `Transport` |
//!
//! Nothing in the core retries. Every failure goes back to the immediate
//! caller.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unified error type for all store operations.
#[derive(Debug, Error)]
pub enum DfsError {
    /// Operating system I/O error from a backing device.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Device-level failure that did not come from the OS (out-of-bounds
    /// access, an injected fault, a poisoned device).
    #[error("device failure: {0}")]
    Invalid(String),

    /// Out-of-range id, double free, malformed request.
    #[error("invalid argument: {0}")]
    InvalidArg(String),

    #[error("entry does not exist")]
    NotExist,

    #[error("entry already exists")]
    AlreadyExist,

    /// An allocator (primary bitmap, log shadow area, inode table) is full.
    #[error("out of resource")]
    OutOfResource,

    /// Persistent state failed validation at a known block.
    #[error("corrupt data at block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    /// Structurally invalid image or configuration (bad magic, geometry).
    #[error("invalid format: {0}")]
    Format(String),

    /// Opaque failure from the RPC layer.
    #[error("transport error: {0}")]
    Transport(String),
}

/// Serializable error kind carried in RPC replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Invalid,
    InvalidArg,
    NotExist,
    AlreadyExist,
    OutOfResource,
    Corruption,
    Format,
    Transport,
}

impl DfsError {
    /// Wire code for this error.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Io(_) | Self::Invalid(_) => ErrorCode::Invalid,
            Self::InvalidArg(_) => ErrorCode::InvalidArg,
            Self::NotExist => ErrorCode::NotExist,
            Self::AlreadyExist => ErrorCode::AlreadyExist,
            Self::OutOfResource => ErrorCode::OutOfResource,
            Self::Corruption { .. } => ErrorCode::Corruption,
            Self::Format(_) => ErrorCode::Format,
            Self::Transport(_) => ErrorCode::Transport,
        }
    }

    /// Rebuild an error received over the wire.
    ///
    /// The block number of a remote `Corruption` is not transmitted and comes
    /// back as 0; the remote message keeps it in text form.
    #[must_use]
    pub fn from_code(code: ErrorCode, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            ErrorCode::Invalid => Self::Invalid(message),
            ErrorCode::InvalidArg => Self::InvalidArg(message),
            ErrorCode::NotExist => Self::NotExist,
            ErrorCode::AlreadyExist => Self::AlreadyExist,
            ErrorCode::OutOfResource => Self::OutOfResource,
            ErrorCode::Corruption => Self::Corruption {
                block: 0,
                detail: message,
            },
            ErrorCode::Format => Self::Format(message),
            ErrorCode::Transport => Self::Transport(message),
        }
    }

    /// Shorthand for a `Corruption` built from a decode failure.
    #[must_use]
    pub fn corruption(block: u64, detail: impl std::fmt::Display) -> Self {
        Self::Corruption {
            block,
            detail: detail.to_string(),
        }
    }
}

/// Result alias using `DfsError`.
pub type Result<T> = std::result::Result<T, DfsError>;
