//! In-memory fakes for driver tests.

use crate::error::{Error, Result};
use crate::fs::{DeviceWatch, Filesystem};
use crate::ops::VolumeOps;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use vmvol_protocol::{DeviceSpec, VolumeOpts, VolumeSummary};

/// Ordered record of calls made across fakes sharing the log.
#[derive(Debug, Clone, Default)]
pub(crate) struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    fn push(&self, entry: String) {
        self.0.lock().push(entry);
    }

    pub(crate) fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    /// Number of calls whose entry starts with `prefix`.
    pub(crate) fn count(&self, prefix: &str) -> usize {
        self.0.lock().iter().filter(|e| e.starts_with(prefix)).count()
    }

    pub(crate) fn clear(&self) {
        self.0.lock().clear();
    }
}

/// Configured failures keyed by operation name.
#[derive(Debug, Clone, Default)]
struct Failures(Arc<Mutex<HashMap<&'static str, String>>>);

impl Failures {
    fn check(&self, op: &'static str) -> Result<()> {
        match self.0.lock().get(op) {
            Some(message) => Err(Error::remote(message.clone())),
            None => Ok(()),
        }
    }
}

/// Fake volume service.
#[derive(Debug, Clone, Default)]
pub(crate) struct FakeOps {
    log: CallLog,
    failures: Failures,
    status: Arc<Mutex<Map<String, Value>>>,
    volumes: Arc<Mutex<BTreeSet<String>>>,
    attach_delay: Arc<Mutex<Duration>>,
}

impl FakeOps {
    pub(crate) fn new(log: CallLog) -> Self {
        Self {
            log,
            ..Self::default()
        }
    }

    /// Make `op` fail with `message` until cleared.
    pub(crate) fn fail(&self, op: &'static str, message: &str) {
        self.failures.0.lock().insert(op, message.to_string());
    }

    pub(crate) fn clear_failures(&self) {
        self.failures.0.lock().clear();
    }

    /// Status returned by `get`.
    pub(crate) fn set_status(&self, key: &str, value: &str) {
        self.status
            .lock()
            .insert(key.to_string(), Value::String(value.to_string()));
    }

    /// Make `attach` block for `delay` before answering.
    pub(crate) fn slow_attach(&self, delay: Duration) {
        *self.attach_delay.lock() = delay;
    }

    pub(crate) fn volumes(&self) -> Vec<String> {
        self.volumes.lock().iter().cloned().collect()
    }
}

impl VolumeOps for FakeOps {
    fn create(&self, name: &str, _opts: &VolumeOpts) -> Result<()> {
        self.log.push(format!("create {}", name));
        self.failures.check("create")?;
        self.volumes.lock().insert(name.to_string());
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<()> {
        self.log.push(format!("remove {}", name));
        self.failures.check("remove")?;
        self.volumes.lock().remove(name);
        Ok(())
    }

    fn attach(&self, name: &str) -> Result<DeviceSpec> {
        self.log.push(format!("attach {}", name));
        let delay = *self.attach_delay.lock();
        std::thread::sleep(delay);
        self.failures.check("attach")?;
        Ok(DeviceSpec {
            unit: "0".to_string(),
            controller_pci_slot_number: "160".to_string(),
        })
    }

    fn detach(&self, name: &str) -> Result<()> {
        self.log.push(format!("detach {}", name));
        self.failures.check("detach")
    }

    fn list(&self) -> Result<Vec<VolumeSummary>> {
        self.log.push("list".to_string());
        self.failures.check("list")?;
        Ok(self
            .volumes
            .lock()
            .iter()
            .map(|name| VolumeSummary {
                name: name.clone(),
                attributes: Map::new(),
            })
            .collect())
    }

    fn get(&self, name: &str) -> Result<Map<String, Value>> {
        self.log.push(format!("get {}", name));
        self.failures.check("get")?;
        Ok(self.status.lock().clone())
    }
}

/// Fake guest filesystem.
#[derive(Debug, Clone)]
pub(crate) struct FakeFs {
    log: CallLog,
    failures: Failures,
    mkfs: Arc<Mutex<BTreeMap<String, PathBuf>>>,
    watch_supported: bool,
    device_appears: bool,
}

impl FakeFs {
    pub(crate) fn new(log: CallLog) -> Self {
        let mut mkfs = BTreeMap::new();
        mkfs.insert("ext4".to_string(), PathBuf::from("/sbin/mkfs.ext4"));
        Self {
            log,
            failures: Failures::default(),
            mkfs: Arc::new(Mutex::new(mkfs)),
            watch_supported: true,
            device_appears: true,
        }
    }

    pub(crate) fn fail(&self, op: &'static str, message: &str) {
        self.failures.0.lock().insert(op, message.to_string());
    }

    pub(crate) fn add_mkfs(&self, fstype: &str) {
        self.mkfs
            .lock()
            .insert(fstype.to_string(), PathBuf::from(format!("/sbin/mkfs.{}", fstype)));
    }

    pub(crate) fn without_watch(mut self) -> Self {
        self.watch_supported = false;
        self
    }

    pub(crate) fn device_never_appears(mut self) -> Self {
        self.device_appears = false;
        self
    }
}

impl Filesystem for FakeFs {
    fn mkdir(&self, path: &Path) -> Result<()> {
        self.log.push(format!("mkdir {}", path.display()));
        self.failures.check("mkdir")
    }

    fn mkfs_lookup(&self) -> BTreeMap<String, PathBuf> {
        self.mkfs.lock().clone()
    }

    fn mkfs(&self, mkfs: &Path, label: &str, device: &Path) -> Result<()> {
        self.log
            .push(format!("mkfs {} {} {}", mkfs.display(), label, device.display()));
        self.failures.check("mkfs")
    }

    fn mount(&self, mount_point: &Path, fstype: &str, device: &Path, read_only: bool) -> Result<()> {
        let mode = if read_only { "ro" } else { "rw" };
        self.log.push(format!(
            "mount {} {} {} {}",
            device.display(),
            mount_point.display(),
            fstype,
            mode
        ));
        self.failures.check("mount")
    }

    fn unmount(&self, mount_point: &Path) -> Result<()> {
        self.log.push(format!("unmount {}", mount_point.display()));
        self.failures.check("unmount")
    }

    fn device_path(&self, spec: &DeviceSpec) -> Result<PathBuf> {
        self.log.push(format!("device_path {}", spec.unit));
        self.failures.check("device_path")?;
        Ok(PathBuf::from(format!("/dev/fake/{}", spec.unit)))
    }

    fn watch_devices(&self) -> Option<Box<dyn DeviceWatch>> {
        self.log.push("watch".to_string());
        if !self.watch_supported {
            return None;
        }
        Some(Box::new(FakeWatch {
            log: self.log.clone(),
            appears: self.device_appears,
        }))
    }
}

struct FakeWatch {
    log: CallLog,
    appears: bool,
}

impl DeviceWatch for FakeWatch {
    fn wait_for(&mut self, device: &Path, _timeout: Duration) -> bool {
        self.log.push(format!("wait {}", device.display()));
        self.appears
    }
}
