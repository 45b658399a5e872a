//! The ISO boot pipeline.
//!
//! ```text
//! acquire ─▶ mount ─▶ parse ─▶ resolve ─▶ compose ─▶ kexec
//!              │                                      │
//!              └──────── unmount on any failure ◀─────┘
//! ```
//!
//! Either the machine ends up running the new kernel, or the caller gets a
//! [`PipelineError`] naming the failing stage and every loop device and
//! mount point this pipeline allocated has been released.

use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::acquire::{self, Downloader, Image};
use crate::bootconfig::{self, BootEntry};
use crate::cache::{self, CacheDevice};
use crate::catalog::{Catalog, Distribution};
use crate::cmdline::Composer;
use crate::config::Settings;
use crate::error::{ConfigError, PipelineError};
use crate::kexec::Executor;
use crate::mount::{LoopMounter, MountHandle};
use crate::resolve;

/// Caller choices for one boot attempt.
#[derive(Debug, Clone, Default)]
pub struct BootRequest {
    /// Stop right before loading the kernel.
    pub dry_run: bool,
    /// Entry label, overriding the distribution's `boot_label`.
    pub label: Option<String>,
    /// Extra kernel parameters, applied after the distribution template.
    pub extra_params: Vec<String>,
    /// Device descriptor for the template; detected from the image if `None`.
    pub device: Option<CacheDevice>,
}

/// What will be booted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedBoot {
    pub entry: BootEntry,
    /// Final kernel command line.
    pub parameters: String,
}

/// A resolved boot together with the mount its files live on.
#[derive(Debug)]
pub struct Prepared {
    pub boot: ResolvedBoot,
    pub handle: MountHandle,
}

/// Where a distribution's boot entries come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSources<'a> {
    /// Nothing declared: probe the conventional locations on the image.
    Scan,
    /// The declared in-image config (if any) followed by host-side configs.
    Declared {
        image_config: Option<&'a Path>,
        custom: &'a [PathBuf],
    },
}

pub fn config_sources(distro: &Distribution) -> ConfigSources<'_> {
    if distro.boot_config.is_none() && distro.custom_configs.is_empty() {
        return ConfigSources::Scan;
    }
    ConfigSources::Declared {
        image_config: distro.boot_config.as_deref(),
        custom: &distro.custom_configs,
    }
}

/// Read every boot entry `sources` point at on the image mounted at `mount_root`.
pub fn load_entries(
    mount_root: &Path,
    sources: &ConfigSources<'_>,
) -> Result<Vec<BootEntry>, ConfigError> {
    match sources {
        ConfigSources::Scan => bootconfig::parse(mount_root, None),
        ConfigSources::Declared {
            image_config,
            custom,
        } => {
            let mut entries = match image_config {
                Some(hint) => bootconfig::parse(mount_root, Some(*hint))?,
                None => Vec::new(),
            };
            entries.extend(bootconfig::parse_sources(mount_root, custom)?);
            Ok(entries)
        }
    }
}

pub struct Pipeline<'a> {
    catalog: &'a Catalog,
    settings: &'a Settings,
    mounter: LoopMounter,
    executor: Executor,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        catalog: &'a Catalog,
        settings: &'a Settings,
        mounter: LoopMounter,
        executor: Executor,
    ) -> Self {
        Self {
            catalog,
            settings,
            mounter,
            executor,
        }
    }

    pub fn mounter(&self) -> &LoopMounter {
        &self.mounter
    }

    /// Find an image for `distro`: the explicit path, else the cached image
    /// matching its pattern with the highest version-ordered name,
    /// else a download into the cache directory.
    pub fn acquire(
        &self,
        distro: &Distribution,
        iso: Option<&Path>,
        downloader: &Downloader,
        deadline: Option<Duration>,
    ) -> Result<Image, PipelineError> {
        if let Some(path) = iso {
            tracing::info!("[acquire] using local image {}", path.display());
            return Ok(acquire::local(path)?);
        }

        let cached = cache::find_cached_images(&self.settings.cache_dir, self.catalog)
            .into_iter()
            .filter(|c| c.distro == distro.name)
            .last();
        if let Some(cached) = cached {
            tracing::info!("[acquire] using cached image {}", cached.path.display());
            return Ok(acquire::local(&cached.path)?);
        }

        let deadline =
            deadline.unwrap_or(Duration::from_secs(self.settings.download_deadline_secs));
        tracing::info!(
            "[acquire] downloading {} (deadline {}s)",
            distro.name,
            deadline.as_secs()
        );
        Ok(downloader.fetch(distro, &self.settings.cache_dir, deadline)?)
    }

    /// Mount, parse, resolve and compose. On failure nothing stays mounted.
    pub fn prepare(
        &self,
        image: &Image,
        distro: &Distribution,
        request: &BootRequest,
    ) -> Result<Prepared, PipelineError> {
        tracing::info!("[mount] {}", image.path.display());
        let mut handle = self.mounter.mount(image)?;

        match self.resolve_on(&handle, image, distro, request) {
            Ok(boot) => Ok(Prepared { boot, handle }),
            Err(e) => {
                self.cleanup(&mut handle);
                Err(e)
            }
        }
    }

    /// [`Pipeline::prepare`] then kexec. Only returns on failure, after the
    /// image has been unmounted.
    pub fn run(
        &self,
        image: &Image,
        distro: &Distribution,
        request: &BootRequest,
    ) -> Result<Infallible, PipelineError> {
        let Prepared { boot, mut handle } = self.prepare(image, distro, request)?;

        tracing::info!("[boot] {} ({})", boot.entry.label, boot.entry.kernel_path.display());
        let result = self.executor.boot(
            &boot.entry,
            &boot.parameters,
            request.dry_run,
            Some(handle.mount_point()),
        );
        match result {
            Ok(never) => match never {},
            Err(e) => {
                self.cleanup(&mut handle);
                Err(e.into())
            }
        }
    }

    /// Unmount a prepared boot that will not be executed.
    pub fn release(&self, prepared: Prepared) -> Result<ResolvedBoot, PipelineError> {
        let Prepared { boot, mut handle } = prepared;
        self.mounter.unmount(&mut handle)?;
        Ok(boot)
    }

    /// Mount `image`, list its entries from `sources`, unmount. Kernel and
    /// initrd paths are returned as seen from inside the image.
    pub fn list_entries(
        &self,
        image: &Image,
        sources: &ConfigSources<'_>,
    ) -> Result<Vec<BootEntry>, PipelineError> {
        let mut handle = self.mounter.mount(image)?;
        let parsed = load_entries(handle.mount_point(), sources);
        match parsed {
            Ok(entries) => {
                let entries = entries
                    .iter()
                    .map(|e| e.rebase(handle.mount_point(), Path::new("/")))
                    .collect();
                self.mounter.unmount(&mut handle)?;
                Ok(entries)
            }
            Err(e) => {
                self.cleanup(&mut handle);
                Err(e.into())
            }
        }
    }

    fn resolve_on(
        &self,
        handle: &MountHandle,
        image: &Image,
        distro: &Distribution,
        request: &BootRequest,
    ) -> Result<ResolvedBoot, PipelineError> {
        let mount_root = handle.mount_point();

        tracing::info!("[parse] {}", mount_root.display());
        let entries = load_entries(mount_root, &config_sources(distro))?;
        tracing::debug!("{} boot entries found", entries.len());

        tracing::info!("[resolve] {}", distro.name);
        let entry = resolve::resolve_label(&entries, distro, request.label.as_deref())?;

        tracing::info!("[compose] {}", entry.label);
        let device = request
            .device
            .clone()
            .unwrap_or_else(|| CacheDevice::detect(&image.path));
        let parameters = Composer::new()
            .inherit_from_host(&self.settings.inherit_params)
            .overrides(&request.extra_params)
            .compose(&entry, &distro.kernel_params, &device)?;

        Ok(ResolvedBoot { entry, parameters })
    }

    fn cleanup(&self, handle: &mut MountHandle) {
        if let Err(e) = self.mounter.unmount(handle) {
            tracing::warn!("cleanup after failure: {}", e);
        }
    }
}
