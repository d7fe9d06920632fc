//! Volume lifecycle orchestration.
//!
//! [`VolumeDriver`] sequences remote attach/detach calls against local device
//! discovery, filesystem creation and mounting. Mounts are reference counted:
//! the first mount of a volume attaches and mounts it, later mounts only bump
//! the count, and the last unmount tears it down.
//!
//! The reference count is always updated before any remote call is issued.
//! Operations on different volumes run concurrently; the container engine
//! serializes operations on the same name.

mod compensation;

pub use compensation::Compensation;

use crate::error::{Error, Result};
use crate::fs::{DeviceWatch, Filesystem};
use crate::ops::VolumeOps;
use crate::refcount::RefCountMap;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use vmvol_protocol::{opts, status, VolumeOpts};

/// Default mount root.
pub const DEFAULT_MOUNT_ROOT: &str = "/mnt/vmdk";

/// Filesystem used when the caller does not ask for one.
pub const DEFAULT_FSTYPE: &str = "ext4";

/// Default time to wait for an attached disk to show up.
pub const DEFAULT_DEVICE_WAIT: Duration = Duration::from_secs(1);

/// Default pause before using a device when watching is unsupported.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(1);

/// Scope reported to the container engine.
pub const SCOPE_GLOBAL: &str = "global";

/// Orchestrator settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverConfig {
    /// Directory under which volumes are mounted.
    pub mount_root: PathBuf,
    /// Filesystem created when none is requested.
    pub default_fstype: String,
    /// How long to wait for an attached device node.
    pub device_wait_timeout: Duration,
    /// Fixed delay used instead of waiting when device watching is unsupported.
    pub settle_delay: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            mount_root: PathBuf::from(DEFAULT_MOUNT_ROOT),
            default_fstype: DEFAULT_FSTYPE.to_string(),
            device_wait_timeout: DEFAULT_DEVICE_WAIT,
            settle_delay: DEFAULT_SETTLE_DELAY,
        }
    }
}

/// A volume as reported to the container engine.
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeInfo {
    /// Volume name.
    pub name: String,
    /// Where the volume is (or would be) mounted.
    pub mountpoint: PathBuf,
    /// Service-provided status. Empty for list results.
    pub status: Map<String, Value>,
}

/// Driver capabilities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    /// Volume visibility scope.
    pub scope: &'static str,
}

/// The volume orchestrator.
pub struct VolumeDriver {
    ops: Box<dyn VolumeOps>,
    fs: Box<dyn Filesystem>,
    refcounts: RefCountMap,
    config: DriverConfig,
}

impl std::fmt::Debug for VolumeDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeDriver")
            .field("refcounts", &self.refcounts)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl VolumeDriver {
    /// Create a driver with an empty reference count map.
    pub fn new(ops: Box<dyn VolumeOps>, fs: Box<dyn Filesystem>, config: DriverConfig) -> Self {
        Self {
            ops,
            fs,
            refcounts: RefCountMap::new(),
            config,
        }
    }

    /// Seed reference counts from volumes already mounted under the mount root.
    pub fn init_refcounts(&self) -> Result<usize> {
        let found = self.refcounts.init(&self.config.mount_root)?;
        info!(
            mount_root = %self.config.mount_root.display(),
            found,
            volumes = ?self.refcounts.mounted(),
            "initialized ref counts"
        );
        Ok(found)
    }

    /// Reference counts.
    pub fn refcounts(&self) -> &RefCountMap {
        &self.refcounts
    }

    /// Mount point for `name`: `<mount_root>/<name>`.
    pub fn path(&self, name: &str) -> PathBuf {
        self.config.mount_root.join(name)
    }

    /// Report driver capabilities.
    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            scope: SCOPE_GLOBAL,
        }
    }

    // ========================================================================
    // Create / Remove
    // ========================================================================

    /// Create a volume and, unless it is a clone, format it.
    ///
    /// Formatting attaches the new disk, waits for its device node, runs
    /// `mkfs` and detaches it again. If any step after the remote create
    /// fails, the volume is detached and removed and the failing step's error
    /// is returned.
    pub fn create(&self, name: &str, mut options: VolumeOpts) -> Result<()> {
        info!(name = %name, "creating volume");

        if options.contains_key(opts::CLONE_FROM) {
            return self.ops.create(name, &options).map_err(|e| {
                error!(name = %name, error = %e, "clone volume failed");
                e
            });
        }

        let fstype = options
            .entry(opts::FSTYPE.to_string())
            .or_insert_with(|| self.config.default_fstype.clone())
            .clone();

        let supported = self.fs.mkfs_lookup();
        let Some(mkfs) = supported.get(&fstype).cloned() else {
            error!(name = %name, fstype = %fstype, "mkfs not found");
            return Err(Error::UnsupportedFilesystem {
                fstype,
                supported: supported.keys().cloned().collect::<Vec<_>>().join(", "),
            });
        };

        self.ops.create(name, &options).map_err(|e| {
            error!(name = %name, error = %e, "create volume failed");
            e
        })?;

        info!(name = %name, fstype = %fstype, "attaching volume and creating filesystem");

        let watch = self.fs.watch_devices();
        let device = self
            .ops
            .attach(name)
            .and_then(|spec| self.fs.device_path(&spec));

        // An attach that failed on the service side may still have left the
        // disk attached, so detach before removing.
        let device = match device {
            Ok(device) => device,
            Err(e) => {
                error!(name = %name, error = %e, "attach failed; removing the volume");
                return Err(self.undo_create(name, e));
            }
        };

        self.wait_for_device(watch, name, &device);

        if let Err(e) = self.fs.mkfs(&mkfs, name, &device) {
            error!(name = %name, error = %e, "create filesystem failed; removing the volume");
            return Err(self.undo_create(name, e));
        }

        self.ops.detach(name).map_err(|e| {
            error!(name = %name, error = %e, "detach volume failed");
            e
        })?;

        info!(name = %name, fstype = %fstype, "volume and filesystem created");
        Ok(())
    }

    fn undo_create(&self, name: &str, primary: Error) -> Error {
        Compensation::new(name, primary)
            .attempt("detach", || self.ops.detach(name))
            .attempt("remove", || self.ops.remove(name))
            .into_error()
    }

    /// Remove a volume. Fails without contacting the service if it is mounted.
    pub fn remove(&self, name: &str) -> Result<()> {
        info!(name = %name, "removing volume");

        let refcnt = self.refcounts.get(name);
        if refcnt != 0 {
            error!(name = %name, refcnt, "remove failure; volume is still mounted");
            return Err(Error::VolumeInUse {
                name: name.to_string(),
                refcnt,
            });
        }

        self.ops.remove(name).map_err(|e| {
            error!(name = %name, error = %e, "failed to remove volume");
            e
        })
    }

    // ========================================================================
    // Mount / Unmount
    // ========================================================================

    /// Mount a volume, returning its mount point.
    ///
    /// Only the first reference attaches and mounts. On failure the reference
    /// is dropped again and, if it was the last one, the disk is detached.
    pub fn mount(&self, name: &str) -> Result<PathBuf> {
        info!(name = %name, "mounting volume");
        let mount_point = self.path(name);

        let refcnt = self.refcounts.incr(name);
        if refcnt > 1 {
            debug!(name = %name, refcnt, "already mounted; skipping mount");
            return Ok(mount_point);
        }

        let volume_status = match self.ops.get(name) {
            Ok(s) => s,
            Err(e) => {
                self.decr_refcount(name);
                return Err(e);
            }
        };
        let (fstype, read_only) = self.mount_options(name, &volume_status);

        if let Err(e) = self.mount_volume(name, &mount_point, &fstype, read_only) {
            error!(name = %name, error = %e, "failed to mount");

            let mut comp = Compensation::new(name, e);
            if self.decr_refcount(name) == 0 {
                info!(name = %name, "detaching unused volume");
                comp = comp.attempt("detach", || self.ops.detach(name));
            }
            return Err(comp.into_error());
        }

        self.refcounts.set_mount_point(name, &mount_point);
        info!(name = %name, mount_point = %mount_point.display(), read_only, "volume mounted");
        Ok(mount_point)
    }

    fn mount_options(&self, name: &str, volume_status: &Map<String, Value>) -> (String, bool) {
        let read_only = match volume_status.get(status::ACCESS).and_then(Value::as_str) {
            Some(access) => access == status::READ_ONLY,
            None => {
                warn!(name = %name, "invalid access type; assuming read-write");
                false
            }
        };

        let fstype = match volume_status.get(status::FSTYPE).and_then(Value::as_str) {
            Some(fstype) => fstype.to_string(),
            None => {
                warn!(
                    name = %name,
                    assumed = %self.config.default_fstype,
                    "invalid filesystem type; using default"
                );
                self.config.default_fstype.clone()
            }
        };

        (fstype, read_only)
    }

    fn mount_volume(&self, name: &str, mount_point: &Path, fstype: &str, read_only: bool) -> Result<()> {
        self.fs.mkdir(mount_point).map_err(|e| {
            error!(name = %name, dir = %mount_point.display(), error = %e, "failed to create mount point");
            e
        })?;

        let watch = self.fs.watch_devices();
        let spec = self.ops.attach(name)?;
        let device = self.fs.device_path(&spec)?;

        // A wait that times out is not fatal: try the mount anyway.
        self.wait_for_device(watch, name, &device);

        self.fs.mount(mount_point, fstype, &device, read_only)
    }

    /// Drop one reference and, if it was the last, unmount and detach.
    ///
    /// The mount point recorded at mount time (or found in the mount table on
    /// startup) is unmounted; without one, `<mount_root>/<name>` is used. A
    /// failed local unmount is logged and the detach still runs.
    pub fn unmount(&self, name: &str) -> Result<()> {
        info!(name = %name, "unmounting volume");

        // Read before decrementing: the entry is pruned when the count hits zero.
        let mount_point = self
            .refcounts
            .mount_point(name)
            .unwrap_or_else(|| self.path(name));

        let refcnt = self.decr_refcount(name);
        if refcnt >= 1 {
            debug!(name = %name, refcnt, "volume still in use; skipping unmount");
            return Ok(());
        }

        if let Err(e) = self.fs.unmount(&mount_point) {
            error!(
                mount_point = %mount_point.display(),
                error = %e,
                "failed to unmount volume; trying to detach"
            );
        }

        self.ops.detach(name).map_err(|e| {
            error!(name = %name, error = %e, "detach volume failed");
            e
        })
    }

    /// Decrement, treating an error as a count of zero.
    fn decr_refcount(&self, name: &str) -> u32 {
        match self.refcounts.decr(name) {
            Ok(refcnt) => refcnt,
            Err(e) => {
                error!(name = %name, error = %e, "ref count error; continuing");
                0
            }
        }
    }

    fn wait_for_device(&self, watch: Option<Box<dyn DeviceWatch>>, name: &str, device: &Path) {
        match watch {
            Some(mut watch) => {
                if !watch.wait_for(device, self.config.device_wait_timeout) {
                    warn!(
                        name = %name,
                        device = %device.display(),
                        timeout = ?self.config.device_wait_timeout,
                        "timed out waiting for device; continuing"
                    );
                }
            }
            None => std::thread::sleep(self.config.settle_delay),
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Fetch one volume with its service status.
    pub fn get(&self, name: &str) -> Result<VolumeInfo> {
        let status = self.ops.get(name)?;
        Ok(VolumeInfo {
            name: name.to_string(),
            mountpoint: self.path(name),
            status,
        })
    }

    /// List all volumes.
    pub fn list(&self) -> Result<Vec<VolumeInfo>> {
        let volumes = self.ops.list()?;
        Ok(volumes
            .into_iter()
            .map(|v| VolumeInfo {
                mountpoint: self.path(&v.name),
                name: v.name,
                status: Map::new(),
            })
            .collect())
    }
}
