//! Per-volume mount reference counts.
//!
//! The map is the single source of truth for "is this volume mounted by this
//! guest". Every operation takes one exclusive lock, so concurrent callers
//! never observe a torn read-modify-write.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Mount table consulted on startup.
pub const PROC_MOUNTS: &str = "/proc/mounts";

#[derive(Debug, Default)]
struct Entry {
    count: u32,
    mount_point: Option<PathBuf>,
}

/// Thread-safe map from volume name to reference count.
///
/// Absent names read as zero. Entries are pruned when their count drops to zero.
#[derive(Debug, Default)]
pub struct RefCountMap {
    entries: Mutex<HashMap<String, Entry>>,
}

impl RefCountMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed counts from the system mount table.
    ///
    /// Every filesystem mounted directly under `mount_root` is counted once,
    /// so a restarted plugin keeps track of volumes it mounted earlier.
    /// Returns the number of volumes found.
    pub fn init(&self, mount_root: &Path) -> Result<usize> {
        let table = std::fs::read_to_string(PROC_MOUNTS)?;
        Ok(self.init_from_table(mount_root, &table))
    }

    /// Seed counts from mount-table text in `/proc/mounts` format.
    pub fn init_from_table(&self, mount_root: &Path, table: &str) -> usize {
        let mut entries = self.entries.lock();
        let mut found = 0;

        for line in table.lines() {
            let mut fields = line.split_whitespace();
            let (Some(_device), Some(target)) = (fields.next(), fields.next()) else {
                continue;
            };
            let target = PathBuf::from(unescape_mount_path(target));
            let Some(name) = volume_under(mount_root, &target) else {
                continue;
            };

            let entry = entries.entry(name.clone()).or_default();
            if entry.count == 0 {
                entry.count = 1;
                entry.mount_point = Some(target.clone());
                found += 1;
                info!(name = %name, mount_point = %target.display(), "found mounted volume");
            }
        }

        found
    }

    /// Current count for `name` (zero if absent).
    pub fn get(&self, name: &str) -> u32 {
        self.entries.lock().get(name).map_or(0, |e| e.count)
    }

    /// Increment the count for `name`, returning the new count.
    pub fn incr(&self, name: &str) -> u32 {
        let mut entries = self.entries.lock();
        let entry = entries.entry(name.to_string()).or_default();
        entry.count += 1;
        debug!(name = %name, refcnt = entry.count, "incremented ref count");
        entry.count
    }

    /// Decrement the count for `name`, returning the new count.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotMounted`] if the count is already zero. An error
    /// always means the count is zero, so callers can continue with
    /// best-effort cleanup.
    pub fn decr(&self, name: &str) -> Result<u32> {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(name) else {
            return Err(Error::NotMounted(name.to_string()));
        };

        entry.count = entry.count.saturating_sub(1);
        let count = entry.count;
        if count == 0 {
            entries.remove(name);
        }

        debug!(name = %name, refcnt = count, "decremented ref count");
        Ok(count)
    }

    /// Record where `name` is mounted. Ignored if the volume has no references.
    pub fn set_mount_point(&self, name: &str, mount_point: &Path) {
        if let Some(entry) = self.entries.lock().get_mut(name) {
            entry.mount_point = Some(mount_point.to_path_buf());
        }
    }

    /// Live mount point for `name`, if it is mounted.
    pub fn mount_point(&self, name: &str) -> Option<PathBuf> {
        self.entries
            .lock()
            .get(name)
            .and_then(|e| e.mount_point.clone())
    }

    /// Names with a non-zero count, sorted.
    pub fn mounted(&self) -> Vec<String> {
        let mut names: Vec<_> = self.entries.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

/// Volume name if `target` is exactly `<mount_root>/<name>`.
fn volume_under(mount_root: &Path, target: &Path) -> Option<String> {
    let rest = target.strip_prefix(mount_root).ok()?;
    let mut components = rest.components();
    let name = components.next()?.as_os_str().to_str()?.to_string();
    if components.next().is_some() {
        return None;
    }
    Some(name)
}

/// Undo the octal escaping `/proc/mounts` applies to whitespace and backslashes.
fn unescape_mount_path(raw: &str) -> String {
    raw.replace("\\040", " ")
        .replace("\\011", "\t")
        .replace("\\012", "\n")
        .replace("\\134", "\\")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_absent_name_reads_zero() {
        let map = RefCountMap::new();
        assert_eq!(map.get("vol1"), 0);
        assert_eq!(map.mount_point("vol1"), None);
    }

    #[test]
    fn test_incr_decr_sequence() {
        let map = RefCountMap::new();
        assert_eq!(map.incr("vol1"), 1);
        assert_eq!(map.incr("vol1"), 2);
        assert_eq!(map.get("vol1"), 2);
        assert_eq!(map.decr("vol1").unwrap(), 1);
        assert_eq!(map.decr("vol1").unwrap(), 0);
        assert_eq!(map.get("vol1"), 0);
        assert!(map.mounted().is_empty());
    }

    #[test]
    fn test_decr_below_zero_is_error() {
        let map = RefCountMap::new();
        assert!(matches!(map.decr("vol1"), Err(Error::NotMounted(n)) if n == "vol1"));

        map.incr("vol1");
        map.decr("vol1").unwrap();
        assert!(map.decr("vol1").is_err());
        assert_eq!(map.get("vol1"), 0);
    }

    #[test]
    fn test_mount_point_bookkeeping() {
        let map = RefCountMap::new();
        map.set_mount_point("vol1", Path::new("/mnt/vmdk/vol1"));
        assert_eq!(map.mount_point("vol1"), None);

        map.incr("vol1");
        map.set_mount_point("vol1", Path::new("/mnt/vmdk/vol1"));
        assert_eq!(
            map.mount_point("vol1"),
            Some(PathBuf::from("/mnt/vmdk/vol1"))
        );

        map.decr("vol1").unwrap();
        assert_eq!(map.mount_point("vol1"), None);
    }

    #[test]
    fn test_concurrent_incr_decr() {
        let map = Arc::new(RefCountMap::new());
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let map = map.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        map.incr("shared");
                    }
                    for _ in 0..500 {
                        map.decr("shared").unwrap();
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(map.get("shared"), 8 * 500);
    }

    #[test]
    fn test_init_from_mount_table() {
        let table = "\
/dev/sda1 / ext4 rw,relatime 0 0
/dev/sdb /mnt/vmdk/vol1 ext4 rw,relatime 0 0
/dev/sdc /mnt/vmdk/my\\040vol xfs ro,relatime 0 0
/dev/sdd /mnt/vmdk/vol1/nested ext4 rw 0 0
/dev/sde /mnt/other/vol2 ext4 rw 0 0
tmpfs /mnt/vmdk tmpfs rw 0 0
";
        let map = RefCountMap::new();
        let found = map.init_from_table(Path::new("/mnt/vmdk"), table);

        assert_eq!(found, 2);
        assert_eq!(map.get("vol1"), 1);
        assert_eq!(map.get("my vol"), 1);
        assert_eq!(map.get("vol2"), 0);
        assert_eq!(map.get("nested"), 0);
        assert_eq!(
            map.mount_point("vol1"),
            Some(PathBuf::from("/mnt/vmdk/vol1"))
        );
        assert_eq!(map.mounted(), vec!["my vol".to_string(), "vol1".to_string()]);
    }

    #[test]
    fn test_init_counts_duplicate_mounts_once() {
        let table = "/dev/sdb /mnt/vmdk/vol1 ext4 rw 0 0\n/dev/sdb /mnt/vmdk/vol1 ext4 rw 0 0\n";
        let map = RefCountMap::new();
        assert_eq!(map.init_from_table(Path::new("/mnt/vmdk"), table), 1);
        assert_eq!(map.get("vol1"), 1);
    }
}
