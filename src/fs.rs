//! Guest filesystem helpers.
//!
//! Everything the orchestrator does to the local OS goes through the
//! [`Filesystem`] trait, so the lifecycle logic can run against fakes.

use crate::error::{Error, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use vmvol_protocol::DeviceSpec;

/// Directory where attached SCSI disks appear, keyed by PCI path.
pub const DISK_BY_PATH: &str = "/dev/disk/by-path";

/// sysfs directory mapping PCI slot numbers to bus addresses.
pub const PCI_SLOTS: &str = "/sys/bus/pci/slots";

/// Directories searched for `mkfs.<fstype>` helpers, in priority order.
pub const MKFS_DIRS: &[&str] = &["/sbin", "/usr/sbin", "/bin", "/usr/bin"];

const MKFS_PREFIX: &str = "mkfs.";

/// Local OS operations needed to provision and mount a volume.
pub trait Filesystem: Send + Sync {
    /// Create `path` and any missing parents.
    fn mkdir(&self, path: &Path) -> Result<()>;

    /// Available filesystem types mapped to their mkfs helper.
    fn mkfs_lookup(&self) -> BTreeMap<String, PathBuf>;

    /// Format `device` with `mkfs`, labelling it `label`.
    fn mkfs(&self, mkfs: &Path, label: &str, device: &Path) -> Result<()>;

    /// Mount `device` at `mount_point`.
    fn mount(&self, mount_point: &Path, fstype: &str, device: &Path, read_only: bool) -> Result<()>;

    /// Unmount whatever is mounted at `mount_point`.
    fn unmount(&self, mount_point: &Path) -> Result<()>;

    /// Device node for a freshly attached disk.
    fn device_path(&self, spec: &DeviceSpec) -> Result<PathBuf>;

    /// Start watching for new device nodes.
    ///
    /// Must be called before the attach request so the event is not missed.
    /// Returns `None` if watching is unsupported on this host.
    fn watch_devices(&self) -> Option<Box<dyn DeviceWatch>>;
}

/// A watch on the device directory, armed before an attach.
pub trait DeviceWatch: Send {
    /// Block until `device` exists or `timeout` passes. Returns whether it appeared.
    fn wait_for(&mut self, device: &Path, timeout: Duration) -> bool;
}

/// [`Filesystem`] that runs the host's mkfs, mount and umount binaries.
#[derive(Debug, Clone)]
pub struct HostFilesystem {
    watch_dir: PathBuf,
    pci_slots: PathBuf,
    mkfs_dirs: Vec<PathBuf>,
}

impl Default for HostFilesystem {
    fn default() -> Self {
        Self {
            watch_dir: PathBuf::from(DISK_BY_PATH),
            pci_slots: PathBuf::from(PCI_SLOTS),
            mkfs_dirs: MKFS_DIRS.iter().map(PathBuf::from).collect(),
        }
    }
}

impl HostFilesystem {
    /// Create helpers using the standard system locations.
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the directory watched for new devices.
    pub fn with_watch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.watch_dir = dir.into();
        self
    }

    /// Override the sysfs PCI slot directory.
    pub fn with_pci_slots(mut self, dir: impl Into<PathBuf>) -> Self {
        self.pci_slots = dir.into();
        self
    }

    /// Override the directories searched for mkfs helpers.
    pub fn with_mkfs_dirs(mut self, dirs: Vec<PathBuf>) -> Self {
        self.mkfs_dirs = dirs;
        self
    }
}

impl Filesystem for HostFilesystem {
    fn mkdir(&self, path: &Path) -> Result<()> {
        std::fs::create_dir_all(path)?;
        Ok(())
    }

    fn mkfs_lookup(&self) -> BTreeMap<String, PathBuf> {
        let mut found = BTreeMap::new();

        for dir in &self.mkfs_dirs {
            let Ok(entries) = std::fs::read_dir(dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let file_name = entry.file_name();
                let Some(fstype) = file_name.to_str().and_then(|n| n.strip_prefix(MKFS_PREFIX)) else {
                    continue;
                };
                if fstype.is_empty() {
                    continue;
                }
                found
                    .entry(fstype.to_string())
                    .or_insert_with(|| entry.path());
            }
        }

        debug!(fstypes = ?found.keys().collect::<Vec<_>>(), "mkfs lookup");
        found
    }

    fn mkfs(&self, mkfs: &Path, label: &str, device: &Path) -> Result<()> {
        info!(mkfs = %mkfs.display(), device = %device.display(), label = %label, "creating filesystem");

        let output = Command::new(mkfs)
            .arg("-L")
            .arg(label)
            .arg(device)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| Error::command_failed(mkfs.display().to_string(), e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::command_failed(
                mkfs.display().to_string(),
                stderr.trim().to_string(),
            ));
        }
        Ok(())
    }

    fn mount(&self, mount_point: &Path, fstype: &str, device: &Path, read_only: bool) -> Result<()> {
        info!(
            device = %device.display(),
            mount_point = %mount_point.display(),
            fstype = %fstype,
            read_only,
            "mounting volume"
        );

        let mut cmd = Command::new("mount");
        cmd.args(["-t", fstype]);
        if read_only {
            cmd.args(["-o", "ro"]);
        }
        let output = cmd
            .arg(device)
            .arg(mount_point)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::mount(format!(
                "failed to mount {} at {}: {}",
                device.display(),
                mount_point.display(),
                stderr.trim()
            )));
        }
        Ok(())
    }

    fn unmount(&self, mount_point: &Path) -> Result<()> {
        info!(mount_point = %mount_point.display(), "unmounting volume");

        let output = Command::new("umount")
            .arg(mount_point)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::mount(format!(
                "failed to unmount {}: {}",
                mount_point.display(),
                stderr.trim()
            )));
        }
        Ok(())
    }

    fn device_path(&self, spec: &DeviceSpec) -> Result<PathBuf> {
        let address_file = self
            .pci_slots
            .join(&spec.controller_pci_slot_number)
            .join("address");

        let address = std::fs::read_to_string(&address_file).map_err(|e| {
            Error::DevicePath(format!(
                "cannot read PCI address for slot {} ({}): {}",
                spec.controller_pci_slot_number,
                address_file.display(),
                e
            ))
        })?;

        let address = address.trim();
        if address.is_empty() {
            return Err(Error::DevicePath(format!(
                "empty PCI address for slot {}",
                spec.controller_pci_slot_number
            )));
        }

        Ok(self.watch_dir.join(scsi_disk_name(address, &spec.unit)))
    }

    fn watch_devices(&self) -> Option<Box<dyn DeviceWatch>> {
        match NotifyDeviceWatch::new(&self.watch_dir) {
            Ok(watch) => Some(Box::new(watch)),
            Err(e) => {
                warn!(dir = %self.watch_dir.display(), error = %e, "device watching unavailable");
                None
            }
        }
    }
}

/// by-path name of the SCSI disk at `unit` behind the controller at `pci_address`.
pub fn scsi_disk_name(pci_address: &str, unit: &str) -> String {
    format!("pci-{}.0-scsi-0:0:{}:0", pci_address, unit)
}

/// inotify-backed [`DeviceWatch`].
pub struct NotifyDeviceWatch {
    _watcher: RecommendedWatcher,
    events: Receiver<notify::Result<Event>>,
}

impl NotifyDeviceWatch {
    /// Watch `dir` (non-recursively) for new entries.
    pub fn new(dir: &Path) -> notify::Result<Self> {
        let (tx, events) = mpsc::channel();
        let mut watcher = notify::recommended_watcher(tx)?;
        watcher.watch(dir, RecursiveMode::NonRecursive)?;
        Ok(Self {
            _watcher: watcher,
            events,
        })
    }
}

impl DeviceWatch for NotifyDeviceWatch {
    fn wait_for(&mut self, device: &Path, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;

        loop {
            if device.exists() {
                return true;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }

            match self.events.recv_timeout(remaining) {
                Ok(Ok(event)) => {
                    if matches!(event.kind, EventKind::Create(_))
                        && event.paths.iter().any(|p| p == device)
                    {
                        debug!(device = %device.display(), "device appeared");
                        return true;
                    }
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "device watch error");
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return device.exists(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_scsi_disk_name() {
        assert_eq!(
            scsi_disk_name("0000:0b:00", "1"),
            "pci-0000:0b:00.0-scsi-0:0:1:0"
        );
    }

    #[test]
    fn test_device_path_from_pci_slot() {
        let slots = TempDir::new().unwrap();
        std::fs::create_dir(slots.path().join("224")).unwrap();
        std::fs::write(slots.path().join("224/address"), "0000:13:00\n").unwrap();

        let fs = HostFilesystem::new().with_pci_slots(slots.path());
        let spec = DeviceSpec {
            unit: "2".into(),
            controller_pci_slot_number: "224".into(),
        };
        assert_eq!(
            fs.device_path(&spec).unwrap(),
            PathBuf::from("/dev/disk/by-path/pci-0000:13:00.0-scsi-0:0:2:0")
        );
    }

    #[test]
    fn test_device_path_unknown_slot() {
        let slots = TempDir::new().unwrap();
        let fs = HostFilesystem::new().with_pci_slots(slots.path());
        let spec = DeviceSpec {
            unit: "0".into(),
            controller_pci_slot_number: "999".into(),
        };
        assert!(matches!(fs.device_path(&spec), Err(Error::DevicePath(_))));
    }

    #[test]
    fn test_mkfs_lookup_prefers_earlier_dirs() {
        let first = TempDir::new().unwrap();
        let second = TempDir::new().unwrap();
        std::fs::write(first.path().join("mkfs.ext4"), "").unwrap();
        std::fs::write(second.path().join("mkfs.ext4"), "").unwrap();
        std::fs::write(second.path().join("mkfs.xfs"), "").unwrap();
        std::fs::write(second.path().join("mkfs."), "").unwrap();
        std::fs::write(second.path().join("fsck.ext4"), "").unwrap();

        let fs = HostFilesystem::new().with_mkfs_dirs(vec![
            first.path().to_path_buf(),
            PathBuf::from("/nonexistent/vmvol-test"),
            second.path().to_path_buf(),
        ]);
        let found = fs.mkfs_lookup();

        assert_eq!(found.len(), 2);
        assert_eq!(found["ext4"], first.path().join("mkfs.ext4"));
        assert_eq!(found["xfs"], second.path().join("mkfs.xfs"));
    }

    #[test]
    fn test_mkdir_creates_parents() {
        let root = TempDir::new().unwrap();
        let path = root.path().join("mnt/vmdk/vol1");
        HostFilesystem::new().mkdir(&path).unwrap();
        assert!(path.is_dir());
        // Existing directories are fine.
        HostFilesystem::new().mkdir(&path).unwrap();
    }

    #[test]
    fn test_watch_unavailable_for_missing_dir() {
        let fs = HostFilesystem::new().with_watch_dir("/nonexistent/vmvol-test");
        assert!(fs.watch_devices().is_none());
    }

    #[test]
    fn test_wait_for_existing_device() {
        let dir = TempDir::new().unwrap();
        let device = dir.path().join("pci-0000:0b:00.0-scsi-0:0:0:0");
        std::fs::write(&device, "").unwrap();

        let mut watch = NotifyDeviceWatch::new(dir.path()).unwrap();
        assert!(watch.wait_for(&device, Duration::from_millis(10)));
    }

    #[test]
    fn test_wait_for_device_created_later() {
        let dir = TempDir::new().unwrap();
        let device = dir.path().join("pci-0000:0b:00.0-scsi-0:0:1:0");

        let mut watch = NotifyDeviceWatch::new(dir.path()).unwrap();
        let creator = {
            let device = device.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                std::fs::write(&device, "").unwrap();
            })
        };

        assert!(watch.wait_for(&device, Duration::from_secs(5)));
        creator.join().unwrap();
    }

    #[test]
    fn test_wait_for_times_out() {
        let dir = TempDir::new().unwrap();
        let device = dir.path().join("never");

        let mut watch = NotifyDeviceWatch::new(dir.path()).unwrap();
        let start = Instant::now();
        assert!(!watch.wait_for(&device, Duration::from_millis(100)));
        assert!(start.elapsed() >= Duration::from_millis(100));
    }
}
