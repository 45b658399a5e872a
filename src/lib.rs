//! Boot a Linux distribution straight from an ISO image via kexec.
//!
//! Given an image (local, cached or freshly downloaded), this crate
//! loop-mounts it read-only, reads its SYSLINUX/ISOLINUX configuration,
//! picks one boot entry, builds the kernel command line and hands the
//! machine over to the new kernel.
//!
//! - **Catalog** - Immutable set of known distributions, loaded once
//! - **Acquisition** - Local image, cache lookup, or mirror download with checksum
//! - **Loop mounts** - `losetup` + `mount -o ro` with guaranteed release
//! - **Boot config** - SYSLINUX parser producing ordered [`BootEntry`] values
//! - **Selection** - One deterministic resolution rule
//! - **Command line** - Template rendering and layered parameter merge
//! - **kexec** - `kexec_file_load(2)` + `reboot(LINUX_REBOOT_CMD_KEXEC)`
//!
//! # Architecture
//!
//! ```text
//! isoboot (binary)
//!     │
//!     ├── config::load_settings, Catalog::load
//!     ├── preflight::check_host_tools
//!     └── Pipeline
//!             │
//!             ├── acquire   Image
//!             ├── mount     LoopMounter ──▶ MountHandle
//!             ├── parse     bootconfig ──▶ Vec<BootEntry>
//!             ├── resolve   resolve ──▶ BootEntry
//!             ├── compose   cmdline ──▶ String
//!             └── boot      kexec::Executor ──▶ !
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use isoboot::{acquire, BootRequest, Catalog, Executor, LoopMounter, Pipeline, Settings};
//!
//! let settings = Settings::default();
//! let catalog = Catalog::load(&settings.catalog_path)?;
//! let pipeline = Pipeline::new(
//!     &catalog,
//!     &settings,
//!     LoopMounter::host(&settings.mount_fstype),
//!     Executor::syscall(),
//! );
//!
//! let image = acquire::local("/media/usb/TinyCorePure64-14.0.iso".as_ref())?;
//! let request = BootRequest { dry_run: true, ..Default::default() };
//! let err = pipeline.run(&image, catalog.get("tinycore").unwrap(), &request).unwrap_err();
//! println!("{err}");
//! ```

pub mod acquire;
pub mod bootconfig;
pub mod cache;
pub mod catalog;
pub mod cmdline;
pub mod config;
pub mod error;
pub mod kexec;
pub mod menu;
pub mod mount;
pub mod pipeline;
pub mod preflight;
pub mod process;
pub mod resolve;

pub use acquire::{Downloader, Image, SourceKind};
pub use bootconfig::BootEntry;
pub use cache::CacheDevice;
pub use catalog::{Catalog, Distribution};
pub use cmdline::{Composer, FIXED_SUFFIX};
pub use config::Settings;
pub use error::{ErrorKind, PipelineError, Stage};
pub use kexec::Executor;
pub use menu::MenuItem;
pub use mount::{LoopMounter, MountHandle};
pub use pipeline::{BootRequest, Pipeline, Prepared, ResolvedBoot};
