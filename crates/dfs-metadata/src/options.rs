use dfs_error::{DfsError, Result};
use dfs_journal::LogLayout;
use dfs_types::{BlockSize, DEFAULT_BLOCK_SIZE};
use serde::{Deserialize, Serialize};

/// Geometry and behavior of a metadata node.
///
/// The device holds `user_blocks` of namespace followed, when the log is
/// enabled, by `log_blocks` of shadow log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataOptions {
    pub block_size: u32,
    pub user_blocks: u64,
    pub log_blocks: u64,
    pub max_inodes: u64,
    /// Without the log, mutations write through and are not crash safe.
    pub log_enabled: bool,
    /// Checkpoint before every transaction.
    pub checkpoint_enabled: bool,
    pub lock_stripes: usize,
    pub recover_on_open: bool,
}

impl Default for MetadataOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            user_blocks: 4096,
            log_blocks: 1024,
            max_inodes: 1024,
            log_enabled: true,
            checkpoint_enabled: true,
            lock_stripes: 64,
            recover_on_open: true,
        }
    }
}

impl MetadataOptions {
    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json(text: &str) -> Result<Self> {
        let options: Self = serde_json::from_str(text)
            .map_err(|err| DfsError::Format(format!("metadata options: {err}")))?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<()> {
        let block_size = BlockSize::new(self.block_size)
            .map_err(|err| DfsError::InvalidArg(format!("block_size: {err}")))?;
        if self.max_inodes == 0 {
            return Err(DfsError::InvalidArg("max_inodes must be positive".to_owned()));
        }
        if self.lock_stripes == 0 {
            return Err(DfsError::InvalidArg("lock_stripes must be positive".to_owned()));
        }
        let bs = u64::from(block_size.get());
        let itable_blocks = self
            .max_inodes
            .checked_add(1)
            .and_then(|slots| slots.checked_mul(8))
            .ok_or_else(|| DfsError::InvalidArg("max_inodes overflows".to_owned()))?
            .div_ceil(bs);
        let bitmap_blocks = self.user_blocks.div_ceil(block_size.bits_per_block());
        // superblock + table + bitmap + root inode
        if self.user_blocks < 1 + itable_blocks + bitmap_blocks + 1 {
            return Err(DfsError::Format(format!(
                "{} user blocks cannot hold a {itable_blocks}-block inode table and {bitmap_blocks}-block bitmap",
                self.user_blocks
            )));
        }
        if self.log_enabled {
            LogLayout::new(self.block_size, self.user_blocks, self.log_blocks)?;
        }
        Ok(())
    }

    /// Blocks the metadata device must provide.
    #[must_use]
    pub fn device_blocks(&self) -> u64 {
        if self.log_enabled {
            self.user_blocks.saturating_add(self.log_blocks)
        } else {
            self.user_blocks
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let options = MetadataOptions::default();
        options.validate().expect("valid");
        assert_eq!(options.device_blocks(), 4096 + 1024);
    }

    #[test]
    fn json_overrides_selected_fields() {
        let options =
            MetadataOptions::from_json(r#"{"block_size": 512, "log_enabled": false}"#)
                .expect("parse");
        assert_eq!(options.block_size, 512);
        assert!(!options.log_enabled);
        assert_eq!(options.user_blocks, 4096);
        assert_eq!(options.device_blocks(), 4096);
    }

    #[test]
    fn impossible_geometry_is_rejected() {
        assert!(matches!(
            MetadataOptions::from_json("{not json"),
            Err(DfsError::Format(_))
        ));
        let cramped = MetadataOptions {
            block_size: 512,
            user_blocks: 4,
            max_inodes: 1024,
            ..MetadataOptions::default()
        };
        assert!(matches!(cramped.validate(), Err(DfsError::Format(_))));
        let odd = MetadataOptions {
            block_size: 3000,
            ..MetadataOptions::default()
        };
        assert!(matches!(odd.validate(), Err(DfsError::InvalidArg(_))));
        let no_log_room = MetadataOptions {
            log_blocks: 1,
            ..MetadataOptions::default()
        };
        assert!(no_log_room.validate().is_err());
    }
}
