//! Cache key derivation for file observations.
//!
//! Two identity schemes share the key space:
//!
//! ```text
//! snapfs:cache:inode:{dev}:{inode}:{size}:{mtime}
//! snapfs:cache:path:{path}:{size}:{mtime}
//! ```
//!
//! Device + inode survives renames within a filesystem, so it is preferred
//! whenever both are present and non-zero. The path scheme covers network
//! shares and filesystems without stable inodes. The scheme tag keeps the two
//! from ever colliding, and because `size` and `mtime` are always the last two
//! numeric fields a path containing `:` cannot alias another key.

use crate::models::FileObservation;

/// Namespace prefix for every key this gateway writes.
pub const KEY_PREFIX: &str = "snapfs:cache";

/// Build the cache key for one observation.
///
/// `mtime` is truncated to whole seconds so sub-second jitter between
/// scanners never causes a spurious miss.
pub fn build_key(path: &str, size: u64, mtime: f64, dev: Option<u64>, inode: Option<u64>) -> String {
    let mtime = mtime_secs(mtime);
    match (dev, inode) {
        (Some(dev), Some(inode)) if dev != 0 && inode != 0 => {
            format!("{}:inode:{}:{}:{}:{}", KEY_PREFIX, dev, inode, size, mtime)
        }
        _ => format!("{}:path:{}:{}:{}", KEY_PREFIX, path, size, mtime),
    }
}

/// Key for a [`FileObservation`]. The path is used as given.
pub fn key_for(obs: &FileObservation) -> String {
    build_key(&obs.path, obs.size, obs.mtime, obs.dev, obs.inode)
}

/// Whole-second modification time, truncated toward zero.
pub fn mtime_secs(mtime: f64) -> i64 {
    mtime.trunc() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inode_key_preferred() {
        let key = build_key("/a/b", 10, 1700000000.0, Some(3), Some(42));
        assert_eq!(key, "snapfs:cache:inode:3:42:10:1700000000");
    }

    #[test]
    fn test_path_key_when_identity_missing() {
        assert_eq!(
            build_key("/a/b", 10, 5.0, None, Some(42)),
            "snapfs:cache:path:/a/b:10:5"
        );
        assert_eq!(
            build_key("/a/b", 10, 5.0, Some(3), None),
            "snapfs:cache:path:/a/b:10:5"
        );
    }

    #[test]
    fn test_zero_device_or_inode_falls_back_to_path() {
        assert_eq!(
            build_key("/a", 1, 2.0, Some(0), Some(9)),
            "snapfs:cache:path:/a:1:2"
        );
        assert_eq!(
            build_key("/a", 1, 2.0, Some(9), Some(0)),
            "snapfs:cache:path:/a:1:2"
        );
    }

    #[test]
    fn test_subsecond_truncation() {
        let a = build_key("/x", 7, 1700000000.01, None, None);
        let b = build_key("/x", 7, 1700000000.99, None, None);
        assert_eq!(a, b);
        let c = build_key("/x", 7, 1700000000.5, Some(1), Some(2));
        let d = build_key("/x", 7, 1700000000.0, Some(1), Some(2));
        assert_eq!(c, d);
    }

    #[test]
    fn test_inode_key_ignores_path() {
        let a = build_key("/old/name.exr", 7, 100.0, Some(1), Some(2));
        let b = build_key("/new/name.exr", 7, 100.0, Some(1), Some(2));
        assert_eq!(a, b);
    }

    #[test]
    fn test_schemes_never_collide() {
        // a path that mimics the inode scheme body still carries the path tag
        let inode = build_key("ignored", 10, 5.0, Some(3), Some(42));
        let path = build_key("3:42", 10, 5.0, None, None);
        assert_ne!(inode, path);
    }

    #[test]
    fn test_key_for_observation() {
        let obs = FileObservation {
            path: "/a/b".to_string(),
            size: 10,
            mtime: 5.9,
            dev: None,
            inode: None,
        };
        assert_eq!(key_for(&obs), "snapfs:cache:path:/a/b:10:5");
    }
}
