//! Hypervisor-free stand-ins for the volume service and the guest disk layer.
//!
//! `vmvol serve --mock` wires these into the driver so the full volume
//! lifecycle runs on any host: volumes live in memory, attach hands out a
//! synthetic device, and a mounted volume is a plain directory under the
//! mount root.

use crate::error::{Error, Result};
use crate::fs::{DeviceWatch, Filesystem};
use crate::ops::VolumeOps;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};
use vmvol_protocol::{opts, status, DeviceSpec, VolumeOpts, VolumeSummary};

/// Directory that synthetic device paths are reported under.
pub const MOCK_DEVICE_DIR: &str = "/dev/vmvol-mock";

/// Filesystem types the mock pretends it can format.
pub const MOCK_FSTYPES: &[&str] = &["btrfs", "ext4", "xfs"];

/// PCI slot reported for every mock attach.
const MOCK_PCI_SLOT: &str = "0";

#[derive(Debug)]
struct MockVolume {
    opts: VolumeOpts,
    unit: u32,
    attached: bool,
}

/// In-memory volume service.
#[derive(Debug, Default)]
pub struct MockVolumeOps {
    volumes: Mutex<BTreeMap<String, MockVolume>>,
}

impl MockVolumeOps {
    /// Create a service with no volumes.
    pub fn new() -> Self {
        Self::default()
    }

    fn not_found(name: &str) -> Error {
        Error::remote(format!("Volume {} not found", name))
    }
}

impl VolumeOps for MockVolumeOps {
    fn create(&self, name: &str, options: &VolumeOpts) -> Result<()> {
        let mut volumes = self.volumes.lock();
        if volumes.contains_key(name) {
            return Err(Error::remote(format!("Volume {} already exists", name)));
        }
        if let Some(source) = options.get(opts::CLONE_FROM) {
            if !volumes.contains_key(source) {
                return Err(Self::not_found(source));
            }
        }

        let unit = (0..).find(|u| volumes.values().all(|v| v.unit != *u)).unwrap_or(0);
        volumes.insert(
            name.to_string(),
            MockVolume {
                opts: options.clone(),
                unit,
                attached: false,
            },
        );
        info!(name = %name, unit, "mock volume created");
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<()> {
        let mut volumes = self.volumes.lock();
        match volumes.get(name) {
            None => Err(Self::not_found(name)),
            Some(v) if v.attached => Err(Error::remote(format!(
                "Volume {} is attached and cannot be removed",
                name
            ))),
            Some(_) => {
                volumes.remove(name);
                info!(name = %name, "mock volume removed");
                Ok(())
            }
        }
    }

    fn attach(&self, name: &str) -> Result<DeviceSpec> {
        let mut volumes = self.volumes.lock();
        let volume = volumes.get_mut(name).ok_or_else(|| Self::not_found(name))?;
        volume.attached = true;
        debug!(name = %name, unit = volume.unit, "mock volume attached");
        Ok(DeviceSpec {
            unit: volume.unit.to_string(),
            controller_pci_slot_number: MOCK_PCI_SLOT.to_string(),
        })
    }

    fn detach(&self, name: &str) -> Result<()> {
        let mut volumes = self.volumes.lock();
        let volume = volumes.get_mut(name).ok_or_else(|| Self::not_found(name))?;
        volume.attached = false;
        debug!(name = %name, "mock volume detached");
        Ok(())
    }

    fn list(&self) -> Result<Vec<VolumeSummary>> {
        Ok(self
            .volumes
            .lock()
            .iter()
            .map(|(name, v)| VolumeSummary {
                name: name.clone(),
                attributes: v
                    .opts
                    .iter()
                    .map(|(k, val)| (k.clone(), Value::String(val.clone())))
                    .collect(),
            })
            .collect())
    }

    fn get(&self, name: &str) -> Result<Map<String, Value>> {
        let volumes = self.volumes.lock();
        let volume = volumes.get(name).ok_or_else(|| Self::not_found(name))?;

        let mut out: Map<String, Value> = volume
            .opts
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        out.entry(status::ACCESS)
            .or_insert_with(|| Value::String("read-write".to_string()));
        out.insert(
            "status".to_string(),
            Value::String(if volume.attached { "attached" } else { "detached" }.to_string()),
        );
        Ok(out)
    }
}

/// [`Filesystem`] that backs each volume with a directory and never touches
/// block devices.
#[derive(Debug, Clone, Default)]
pub struct MockFilesystem;

impl MockFilesystem {
    /// Create the mock filesystem.
    pub fn new() -> Self {
        Self
    }
}

impl Filesystem for MockFilesystem {
    fn mkdir(&self, path: &Path) -> Result<()> {
        std::fs::create_dir_all(path)?;
        Ok(())
    }

    fn mkfs_lookup(&self) -> BTreeMap<String, PathBuf> {
        MOCK_FSTYPES
            .iter()
            .map(|fstype| (fstype.to_string(), PathBuf::from(format!("mkfs.{}", fstype))))
            .collect()
    }

    fn mkfs(&self, mkfs: &Path, label: &str, device: &Path) -> Result<()> {
        debug!(mkfs = %mkfs.display(), label = %label, device = %device.display(), "mock mkfs");
        Ok(())
    }

    fn mount(&self, mount_point: &Path, fstype: &str, device: &Path, read_only: bool) -> Result<()> {
        if !mount_point.is_dir() {
            return Err(Error::mount(format!(
                "mount point {} does not exist",
                mount_point.display()
            )));
        }
        debug!(
            device = %device.display(),
            mount_point = %mount_point.display(),
            fstype = %fstype,
            read_only,
            "mock mount"
        );
        Ok(())
    }

    fn unmount(&self, mount_point: &Path) -> Result<()> {
        debug!(mount_point = %mount_point.display(), "mock unmount");
        Ok(())
    }

    fn device_path(&self, spec: &DeviceSpec) -> Result<PathBuf> {
        Ok(Path::new(MOCK_DEVICE_DIR).join(format!(
            "slot{}-unit{}",
            spec.controller_pci_slot_number, spec.unit
        )))
    }

    fn watch_devices(&self) -> Option<Box<dyn DeviceWatch>> {
        Some(Box::new(ReadyWatch))
    }
}

/// Mock devices exist as soon as they are attached.
struct ReadyWatch;

impl DeviceWatch for ReadyWatch {
    fn wait_for(&mut self, _device: &Path, _timeout: Duration) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{DriverConfig, VolumeDriver};
    use tempfile::TempDir;

    fn mock_driver(root: &Path) -> VolumeDriver {
        let config = DriverConfig {
            mount_root: root.to_path_buf(),
            ..DriverConfig::default()
        };
        VolumeDriver::new(
            Box::new(MockVolumeOps::new()),
            Box::new(MockFilesystem::new()),
            config,
        )
    }

    #[test]
    fn test_full_lifecycle_without_hypervisor() {
        let root = TempDir::new().unwrap();
        let driver = mock_driver(root.path());

        driver.create("vol1", VolumeOpts::new()).unwrap();
        let info = driver.get("vol1").unwrap();
        assert_eq!(info.status["fstype"], "ext4");
        assert_eq!(info.status["status"], "detached");

        let mount_point = driver.mount("vol1").unwrap();
        assert_eq!(mount_point, root.path().join("vol1"));
        assert!(mount_point.is_dir());
        assert_eq!(driver.get("vol1").unwrap().status["status"], "attached");

        driver.mount("vol1").unwrap();
        driver.unmount("vol1").unwrap();
        assert_eq!(driver.get("vol1").unwrap().status["status"], "attached");
        driver.unmount("vol1").unwrap();
        assert_eq!(driver.get("vol1").unwrap().status["status"], "detached");

        driver.remove("vol1").unwrap();
        assert!(driver.list().unwrap().is_empty());
    }

    #[test]
    fn test_create_with_unknown_fstype_is_rejected() {
        let root = TempDir::new().unwrap();
        let driver = mock_driver(root.path());
        let mut options = VolumeOpts::new();
        options.insert(opts::FSTYPE.to_string(), "zfs".to_string());

        let err = driver.create("vol1", options).unwrap_err();
        assert!(matches!(err, Error::UnsupportedFilesystem { .. }));
        assert!(driver.list().unwrap().is_empty());
    }

    #[test]
    fn test_service_errors() {
        let ops = MockVolumeOps::new();
        ops.create("vol1", &VolumeOpts::new()).unwrap();

        let err = ops.create("vol1", &VolumeOpts::new()).unwrap_err();
        assert_eq!(err.to_string(), "Volume vol1 already exists");
        assert_eq!(ops.remove("vol9").unwrap_err().to_string(), "Volume vol9 not found");

        ops.attach("vol1").unwrap();
        assert!(ops.remove("vol1").is_err());
        ops.detach("vol1").unwrap();
        ops.remove("vol1").unwrap();
    }

    #[test]
    fn test_units_are_distinct_and_reused() {
        let ops = MockVolumeOps::new();
        ops.create("a", &VolumeOpts::new()).unwrap();
        ops.create("b", &VolumeOpts::new()).unwrap();
        assert_eq!(ops.attach("a").unwrap().unit, "0");
        assert_eq!(ops.attach("b").unwrap().unit, "1");

        ops.detach("a").unwrap();
        ops.remove("a").unwrap();
        ops.create("c", &VolumeOpts::new()).unwrap();
        assert_eq!(ops.attach("c").unwrap().unit, "0");
    }

    #[test]
    fn test_clone_requires_source() {
        let ops = MockVolumeOps::new();
        let mut options = VolumeOpts::new();
        options.insert(opts::CLONE_FROM.to_string(), "vol0".to_string());
        assert!(ops.create("vol1", &options).is_err());

        ops.create("vol0", &VolumeOpts::new()).unwrap();
        ops.create("vol1", &options).unwrap();
        let names: Vec<_> = ops.list().unwrap().into_iter().map(|v| v.name).collect();
        assert_eq!(names, vec!["vol0", "vol1"]);
    }
}
