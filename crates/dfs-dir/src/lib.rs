#![forbid(unsafe_code)]
//! Directory operations.
//!
//! A directory's content is a flat text list of `name:inode_id` records
//! joined by `/`, e.g. `a:2/b:3`. The empty string is an empty directory.
//! Because both separators are structural, names may not contain `:` or
//! `/` (or NUL), must be non-empty and at most 255 bytes.

use dfs_error::{DfsError, Result};
use dfs_types::InodeId;
use serde::{Deserialize, Serialize};

const RECORD_SEP: char = '/';
const FIELD_SEP: char = ':';

/// Longest accepted entry name in bytes.
pub const MAX_NAME_LEN: usize = 255;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub inode: InodeId,
}

pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(DfsError::InvalidArg(
            "directory entry name cannot be empty".to_owned(),
        ));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(DfsError::InvalidArg(format!(
            "directory entry name exceeds {MAX_NAME_LEN} bytes"
        )));
    }
    if name.contains([RECORD_SEP, FIELD_SEP, '\0']) {
        return Err(DfsError::InvalidArg(format!(
            "directory entry name {name:?} contains a reserved character"
        )));
    }
    Ok(())
}

/// Decode directory content.
pub fn parse_directory(content: &[u8]) -> Result<Vec<DirEntry>> {
    let text = std::str::from_utf8(content)
        .map_err(|err| DfsError::Format(format!("directory content is not UTF-8: {err}")))?;
    if text.is_empty() {
        return Ok(Vec::new());
    }
    text.split(RECORD_SEP)
        .map(|record| {
            let (name, id) = record.rsplit_once(FIELD_SEP).ok_or_else(|| {
                DfsError::Format(format!("directory record {record:?} has no inode field"))
            })?;
            let inode = id.parse::<u64>().map_err(|_| {
                DfsError::Format(format!("directory record {record:?} has a bad inode id"))
            })?;
            Ok(DirEntry {
                name: name.to_owned(),
                inode: InodeId(inode),
            })
        })
        .collect()
}

#[must_use]
pub fn dir_list_to_string(entries: &[DirEntry]) -> String {
    entries
        .iter()
        .map(|entry| format!("{}{FIELD_SEP}{}", entry.name, entry.inode))
        .collect::<Vec<_>>()
        .join(&RECORD_SEP.to_string())
}

/// Append `name -> inode` to encoded content.
pub fn append_to_directory(src: &str, name: &str, inode: InodeId) -> Result<String> {
    validate_name(name)?;
    let mut out = String::with_capacity(src.len() + name.len() + 8);
    out.push_str(src);
    if !src.is_empty() {
        out.push(RECORD_SEP);
    }
    out.push_str(name);
    out.push(FIELD_SEP);
    out.push_str(&inode.0.to_string());
    Ok(out)
}

/// Remove the record for `name`; `NotExist` if there is none.
pub fn rm_from_directory(src: &str, name: &str) -> Result<String> {
    let mut entries = parse_directory(src.as_bytes())?;
    let before = entries.len();
    entries.retain(|entry| entry.name != name);
    if entries.len() == before {
        return Err(DfsError::NotExist);
    }
    Ok(dir_list_to_string(&entries))
}

#[must_use]
pub fn find_entry(entries: &[DirEntry], name: &str) -> Option<InodeId> {
    entries
        .iter()
        .find(|entry| entry.name == name)
        .map(|entry| entry.inode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parse_and_render() {
        let entries = parse_directory(b"a:2/bb:30").expect("parse");
        assert_eq!(
            entries,
            vec![
                DirEntry {
                    name: "a".into(),
                    inode: InodeId(2),
                },
                DirEntry {
                    name: "bb".into(),
                    inode: InodeId(30),
                },
            ]
        );
        assert_eq!(dir_list_to_string(&entries), "a:2/bb:30");
        assert!(parse_directory(b"").expect("empty").is_empty());
    }

    #[test]
    fn append_then_remove() {
        let src = append_to_directory("", "x", InodeId(5)).expect("append");
        assert_eq!(src, "x:5");
        let src = append_to_directory(&src, "y", InodeId(6)).expect("append");
        assert_eq!(src, "x:5/y:6");
        assert_eq!(rm_from_directory(&src, "x").expect("rm"), "y:6");
        assert_eq!(rm_from_directory("y:6", "y").expect("rm"), "");
        assert!(matches!(
            rm_from_directory(&src, "zzz"),
            Err(DfsError::NotExist)
        ));
    }

    #[test]
    fn malformed_content_is_format_error() {
        for raw in [&b"noinode"[..], b"a:1/b", b"a:xyz", b"\xFF:1"] {
            assert!(
                matches!(parse_directory(raw), Err(DfsError::Format(_))),
                "accepted {raw:?}"
            );
        }
    }

    #[test]
    fn reserved_characters_are_rejected() {
        let long = "n".repeat(256);
        for name in ["", "a/b", "a:b", "nul\0", long.as_str()] {
            assert!(validate_name(name).is_err(), "accepted {name:?}");
        }
        assert!(validate_name(&"n".repeat(255)).is_ok());
        assert!(append_to_directory("", "a:b", InodeId(2)).is_err());
    }

    #[test]
    fn find_entry_by_name() {
        let entries = parse_directory(b"a:2/b:3").expect("parse");
        assert_eq!(find_entry(&entries, "b"), Some(InodeId(3)));
        assert_eq!(find_entry(&entries, "c"), None);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn appended_names_are_all_found(
            names in proptest::collection::btree_set("[a-zA-Z0-9._-]{1,16}", 1..20),
        ) {
            let mut src = String::new();
            for (idx, name) in names.iter().enumerate() {
                src = append_to_directory(&src, name, InodeId(idx as u64 + 2)).expect("append");
            }
            let entries = parse_directory(src.as_bytes()).expect("parse");
            prop_assert_eq!(entries.len(), names.len());
            for (idx, name) in names.iter().enumerate() {
                prop_assert_eq!(find_entry(&entries, name), Some(InodeId(idx as u64 + 2)));
            }
        }
    }
}
