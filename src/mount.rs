//! Loop-mount manager.
//!
//! Binds an image to a loop device and mounts it read-only on a fresh
//! temporary directory. A [`MountHandle`] owns exactly one such binding and
//! releases it exactly once, either through [`LoopMounter::unmount`] or,
//! as a last resort, when it is dropped.
//!
//! ```text
//! image ──losetup──▶ /dev/loopN ──mount -o ro──▶ /tmp/isoboot-XXXX
//! ```

use anyhow::{bail, Result};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tempfile::TempDir;

use crate::acquire::Image;
use crate::error::MountError;
use crate::process::Cmd;

/// The host facilities the mounter drives.
pub trait LoopBackend: Send + Sync {
    /// Bind `image` read-only to a free loop device, returning its path.
    fn attach(&self, image: &Path) -> Result<String>;

    fn detach(&self, device: &str) -> Result<()>;

    fn mount(&self, device: &str, target: &Path, fstype: &str) -> Result<()>;

    fn unmount(&self, target: &Path) -> Result<()>;
}

/// Backend that shells out to util-linux.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostLoopBackend;

impl LoopBackend for HostLoopBackend {
    fn attach(&self, image: &Path) -> Result<String> {
        let out = Cmd::new("losetup")
            .args(["--find", "--show", "--read-only"])
            .arg_path(image)
            .error_msg(format!("losetup could not bind '{}'", image.display()))
            .run()?;
        let device = out.stdout.trim();
        if device.is_empty() {
            bail!("losetup printed no device for '{}'", image.display());
        }
        Ok(device.to_string())
    }

    fn detach(&self, device: &str) -> Result<()> {
        Cmd::new("losetup")
            .args(["--detach", device])
            .error_msg(format!("losetup could not detach {device}"))
            .run()?;
        Ok(())
    }

    fn mount(&self, device: &str, target: &Path, fstype: &str) -> Result<()> {
        Cmd::new("mount")
            .args(["-t", fstype, "-o", "ro", device])
            .arg_path(target)
            .error_msg(format!("mount -t {fstype} {device} failed"))
            .run()?;
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        Cmd::new("umount")
            .arg_path(target)
            .error_msg(format!("umount '{}' failed", target.display()))
            .run()?;
        Ok(())
    }
}

/// Resources currently held by live handles.
#[derive(Debug, Default)]
struct InUse {
    devices: HashSet<String>,
    mount_points: HashSet<PathBuf>,
    images: HashSet<PathBuf>,
}

struct MounterInner {
    backend: Box<dyn LoopBackend>,
    fstype: String,
    in_use: Mutex<InUse>,
}

impl MounterInner {
    fn in_use(&self) -> MutexGuard<'_, InUse> {
        self.in_use.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Hands out loop-mounts and tracks which ones are live.
#[derive(Clone)]
pub struct LoopMounter {
    inner: Arc<MounterInner>,
}

impl std::fmt::Debug for LoopMounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopMounter")
            .field("fstype", &self.inner.fstype)
            .field("in_use", &*self.inner.in_use())
            .finish()
    }
}

impl LoopMounter {
    pub fn new(backend: impl LoopBackend + 'static, fstype: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(MounterInner {
                backend: Box::new(backend),
                fstype: fstype.into(),
                in_use: Mutex::new(InUse::default()),
            }),
        }
    }

    /// Mounter backed by the host's `losetup`/`mount`.
    pub fn host(fstype: impl Into<String>) -> Self {
        Self::new(HostLoopBackend, fstype)
    }

    /// Number of live handles.
    pub fn outstanding(&self) -> usize {
        self.inner.in_use().devices.len()
    }

    pub fn mount(&self, image: &Image) -> Result<MountHandle, MountError> {
        let key = fs::canonicalize(&image.path).unwrap_or_else(|_| image.path.clone());
        if self.inner.in_use().images.contains(&key) {
            return Err(MountError::DeviceUnavailable {
                image: image.path.clone(),
                reason: "image already has a live mount".to_string(),
            });
        }

        let device = self
            .inner
            .backend
            .attach(&image.path)
            .map_err(|e| MountError::DeviceUnavailable {
                image: image.path.clone(),
                reason: format!("{e:#}"),
            })?;

        if self.inner.in_use().devices.contains(&device) {
            // Not ours to detach: a live handle owns it.
            return Err(MountError::DeviceUnavailable {
                image: image.path.clone(),
                reason: format!("{device} is already in use by this process"),
            });
        }
        tracing::debug!("bound {} to {}", image.path.display(), device);

        let dir = match tempfile::Builder::new().prefix("isoboot-").tempdir() {
            Ok(dir) => dir,
            Err(e) => {
                self.detach_quietly(&device);
                return Err(MountError::MountFailed {
                    device,
                    mount_point: std::env::temp_dir(),
                    reason: format!("creating mount point: {e}"),
                });
            }
        };
        let mount_point = dir.path().to_path_buf();

        if self.inner.in_use().mount_points.contains(&mount_point) {
            self.detach_quietly(&device);
            return Err(MountError::MountFailed {
                device,
                mount_point,
                reason: "mount point already in use".to_string(),
            });
        }

        if let Err(e) = self
            .inner
            .backend
            .mount(&device, &mount_point, &self.inner.fstype)
        {
            self.detach_quietly(&device);
            remove_dir_quietly(dir);
            return Err(MountError::MountFailed {
                device,
                mount_point,
                reason: format!("{e:#}"),
            });
        }

        {
            let mut in_use = self.inner.in_use();
            in_use.devices.insert(device.clone());
            in_use.mount_points.insert(mount_point.clone());
            in_use.images.insert(key.clone());
        }

        tracing::info!(
            "mounted {} read-only at {} via {}",
            image.path.display(),
            mount_point.display(),
            device
        );

        Ok(MountHandle {
            inner: Arc::clone(&self.inner),
            device,
            mount_point,
            image_key: key,
            dir: Some(dir),
            mounted: true,
            attached: true,
        })
    }

    /// Release `handle`. Calling it again on a released handle does nothing.
    pub fn unmount(&self, handle: &mut MountHandle) -> Result<(), MountError> {
        if !Arc::ptr_eq(&self.inner, &handle.inner) {
            return Err(MountError::UnmountFailed {
                device: handle.device.clone(),
                mount_point: handle.mount_point.clone(),
                reason: "handle belongs to a different mounter".to_string(),
            });
        }
        handle.release()
    }

    fn detach_quietly(&self, device: &str) {
        if let Err(e) = self.inner.backend.detach(device) {
            tracing::warn!("cleanup: detaching {} failed: {:#}", device, e);
        }
    }
}

fn remove_dir_quietly(dir: TempDir) {
    let path = dir.path().to_path_buf();
    if let Err(e) = dir.close() {
        tracing::warn!("cleanup: removing {} failed: {}", path.display(), e);
    }
}

/// Ownership of one loop-device-to-directory binding.
pub struct MountHandle {
    inner: Arc<MounterInner>,
    device: String,
    mount_point: PathBuf,
    image_key: PathBuf,
    dir: Option<TempDir>,
    mounted: bool,
    attached: bool,
}

impl std::fmt::Debug for MountHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountHandle")
            .field("device", &self.device)
            .field("mount_point", &self.mount_point)
            .field("mounted", &self.mounted)
            .field("attached", &self.attached)
            .finish()
    }
}

impl MountHandle {
    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    pub fn read_only(&self) -> bool {
        true
    }

    pub fn is_released(&self) -> bool {
        !self.mounted && !self.attached && self.dir.is_none()
    }

    fn release(&mut self) -> Result<(), MountError> {
        if self.is_released() {
            tracing::debug!("{} already released", self.mount_point.display());
            return Ok(());
        }

        if self.mounted {
            self.inner
                .backend
                .unmount(&self.mount_point)
                .map_err(|e| self.unmount_failed(e))?;
            self.mounted = false;
        }

        if self.attached {
            self.inner
                .backend
                .detach(&self.device)
                .map_err(|e| self.unmount_failed(e))?;
            self.attached = false;
        }

        if let Some(dir) = self.dir.take() {
            remove_dir_quietly(dir);
        }

        let mut in_use = self.inner.in_use();
        in_use.devices.remove(&self.device);
        in_use.mount_points.remove(&self.mount_point);
        in_use.images.remove(&self.image_key);
        drop(in_use);

        tracing::info!("released {} ({})", self.mount_point.display(), self.device);
        Ok(())
    }

    fn unmount_failed(&self, e: anyhow::Error) -> MountError {
        MountError::UnmountFailed {
            device: self.device.clone(),
            mount_point: self.mount_point.clone(),
            reason: format!("{e:#}"),
        }
    }
}

impl Drop for MountHandle {
    fn drop(&mut self) {
        if self.is_released() {
            return;
        }
        tracing::warn!(
            "{} dropped while live; releasing",
            self.mount_point.display()
        );
        if let Err(e) = self.release() {
            tracing::warn!("cleanup: {}", e);
        }
    }
}
