//! Hand the machine over to a new kernel with kexec.
//!
//! Loading uses `kexec_file_load(2)`, so the kernel verifies and parses the
//! image itself and no `kexec-tools` binary is needed. The trigger is
//! `reboot(LINUX_REBOOT_CMD_KEXEC)`; when it works the process simply
//! stops existing, which is why success is typed as [`Infallible`].

use std::convert::Infallible;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use crate::bootconfig::BootEntry;
use crate::error::BootError;

/// Sysctl that, once set to 1, blocks kexec until the next reboot.
pub const KEXEC_LOAD_DISABLED: &str = "/proc/sys/kernel/kexec_load_disabled";

/// Mechanism for staging and starting a kernel.
pub trait KexecBackend: Send + Sync {
    fn load(&self, kernel: &Path, initrd: Option<&Path>, cmdline: &str) -> io::Result<()>;

    fn sync(&self);

    /// Start the staged kernel. Only returns on failure.
    fn exec(&self) -> io::Result<Infallible>;

    /// Drop whatever kernel is staged.
    fn unload(&self) -> io::Result<()>;
}

/// The real thing: raw syscalls through `libc`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SyscallKexec;

#[cfg(all(
    target_os = "linux",
    any(target_arch = "x86_64", target_arch = "aarch64")
))]
fn kexec_file_load(kernel: &Path, initrd: Option<&Path>, cmdline: &str) -> io::Result<()> {
    use std::ffi::CString;
    use std::os::fd::AsRawFd;

    const KEXEC_FILE_NO_INITRAMFS: libc::c_ulong = 0x4;

    let kernel_file = fs::File::open(kernel)?;
    let initrd_file = initrd.map(fs::File::open).transpose()?;
    let cmdline = CString::new(cmdline)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "NUL byte in command line"))?;

    let (initrd_fd, flags) = match &initrd_file {
        Some(file) => (file.as_raw_fd(), 0),
        None => (-1, KEXEC_FILE_NO_INITRAMFS),
    };
    let cmdline_len = cmdline.as_bytes_with_nul().len() as libc::c_ulong;

    // SAFETY: both descriptors stay open for the duration of the call and
    // `cmdline` is a NUL-terminated buffer of exactly `cmdline_len` bytes.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_kexec_file_load,
            kernel_file.as_raw_fd(),
            initrd_fd,
            cmdline_len,
            cmdline.as_ptr(),
            flags,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(all(
    target_os = "linux",
    any(target_arch = "x86_64", target_arch = "aarch64")
))]
fn kexec_file_unload() -> io::Result<()> {
    const KEXEC_FILE_UNLOAD: libc::c_ulong = 0x1;

    // SAFETY: with KEXEC_FILE_UNLOAD the descriptors and command line are
    // ignored; a zero-length null buffer is valid.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_kexec_file_load,
            -1 as libc::c_int,
            -1 as libc::c_int,
            0 as libc::c_ulong,
            std::ptr::null::<libc::c_char>(),
            KEXEC_FILE_UNLOAD,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(all(
    target_os = "linux",
    any(target_arch = "x86_64", target_arch = "aarch64")
)))]
fn kexec_file_unload() -> io::Result<()> {
    Ok(())
}

#[cfg(not(all(
    target_os = "linux",
    any(target_arch = "x86_64", target_arch = "aarch64")
)))]
fn kexec_file_load(_kernel: &Path, _initrd: Option<&Path>, _cmdline: &str) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "kexec_file_load is not available on this platform",
    ))
}

impl KexecBackend for SyscallKexec {
    fn load(&self, kernel: &Path, initrd: Option<&Path>, cmdline: &str) -> io::Result<()> {
        kexec_file_load(kernel, initrd, cmdline)
    }

    fn sync(&self) {
        // SAFETY: sync(2) takes no arguments and cannot fail.
        unsafe { libc::sync() };
    }

    fn exec(&self) -> io::Result<Infallible> {
        // SAFETY: plain syscall; on success it does not return.
        unsafe { libc::reboot(libc::LINUX_REBOOT_CMD_KEXEC) };
        Err(io::Error::last_os_error())
    }

    fn unload(&self) -> io::Result<()> {
        kexec_file_unload()
    }
}

/// Runs the load → sync → trigger sequence against a backend.
pub struct Executor {
    backend: Box<dyn KexecBackend>,
    disabled_flag: PathBuf,
}

impl Executor {
    pub fn new(backend: Box<dyn KexecBackend>) -> Self {
        Self {
            backend,
            disabled_flag: PathBuf::from(KEXEC_LOAD_DISABLED),
        }
    }

    pub fn syscall() -> Self {
        Self::new(Box::new(SyscallKexec))
    }

    /// Read the load-disabled switch from somewhere other than `/proc`.
    pub fn with_disabled_flag(mut self, path: impl Into<PathBuf>) -> Self {
        self.disabled_flag = path.into();
        self
    }

    /// Boot `entry`. When `mount_root` is given the kernel and initrds must
    /// also resolve to files under it.
    pub fn boot(
        &self,
        entry: &BootEntry,
        parameters: &str,
        dry_run: bool,
        mount_root: Option<&Path>,
    ) -> Result<Infallible, BootError> {
        let kernel = entry.kernel_path.clone();

        if dry_run {
            tracing::info!(
                "dry run: kernel {} initrd {} params \"{}\"",
                kernel.display(),
                entry
                    .initrd_path()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "none".to_string()),
                parameters
            );
            return Err(BootError::DryRunRefused {
                kernel,
                initrd: entry.initrd_path().map(Path::to_path_buf),
                parameters: parameters.to_string(),
            });
        }

        let checked = match mount_root {
            Some(root) => entry.verify(root),
            None => check_files(entry),
        };
        checked.map_err(|reason| BootError::LoadFailed {
            kernel: kernel.clone(),
            reason,
        })?;

        if self.load_disabled() {
            return Err(BootError::LoadFailed {
                kernel,
                reason: format!("kexec is disabled ({} = 1)", self.disabled_flag.display()),
            });
        }

        let combined = concat_initrds(&entry.initrd_paths).map_err(|e| BootError::LoadFailed {
            kernel: kernel.clone(),
            reason: format!("combining initrds: {e}"),
        })?;
        let initrd = match &combined {
            Some(file) => Some(file.path()),
            None => entry.initrd_path(),
        };

        tracing::info!("loading kernel {}", kernel.display());
        self.backend
            .load(&kernel, initrd, parameters)
            .map_err(|e| BootError::LoadFailed {
                kernel: kernel.clone(),
                reason: e.to_string(),
            })?;

        self.backend.sync();
        tracing::info!("executing kexec");
        match self.backend.exec() {
            Ok(never) => match never {},
            Err(e) => {
                if let Err(unload) = self.backend.unload() {
                    tracing::warn!("unloading staged kernel: {}", unload);
                }
                Err(BootError::ExecFailed {
                    reason: e.to_string(),
                })
            }
        }
    }

    fn load_disabled(&self) -> bool {
        fs::read_to_string(&self.disabled_flag)
            .map(|v| v.trim() == "1")
            .unwrap_or(false)
    }
}

/// Boot `entry` with `parameters`. Never returns on success.
pub fn boot(
    executor: &Executor,
    entry: &BootEntry,
    parameters: &str,
    dry_run: bool,
) -> Result<Infallible, BootError> {
    executor.boot(entry, parameters, dry_run, None)
}

/// `kexec_file_load` takes one initramfs; cpio archives concatenate, so
/// several initrds become one temporary file.
fn concat_initrds(initrds: &[PathBuf]) -> io::Result<Option<NamedTempFile>> {
    if initrds.len() < 2 {
        return Ok(None);
    }
    let mut combined = tempfile::Builder::new()
        .prefix("isoboot-initrd-")
        .tempfile()?;
    for initrd in initrds {
        let mut source = fs::File::open(initrd)?;
        io::copy(&mut source, combined.as_file_mut())?;
    }
    combined.as_file().sync_all()?;
    tracing::debug!(
        "combined {} initrds into {}",
        initrds.len(),
        combined.path().display()
    );
    Ok(Some(combined))
}

fn check_files(entry: &BootEntry) -> Result<(), String> {
    let files = std::iter::once(&entry.kernel_path).chain(entry.initrd_paths.iter());
    for path in files {
        let meta = fs::metadata(path).map_err(|e| format!("'{}': {e}", path.display()))?;
        if !meta.is_file() {
            return Err(format!("'{}' is not a regular file", path.display()));
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Records every call; never actually boots anything.
    #[derive(Debug, Clone, Default)]
    pub(crate) struct FakeKexec {
        pub(crate) calls: Arc<Mutex<Vec<String>>>,
        pub(crate) fail_load: Option<String>,
    }

    impl FakeKexec {
        pub(crate) fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl KexecBackend for FakeKexec {
        fn load(&self, kernel: &Path, initrd: Option<&Path>, cmdline: &str) -> io::Result<()> {
            self.calls.lock().unwrap().push(format!(
                "load {} {} {}",
                kernel.display(),
                initrd.map(|p| p.display().to_string()).unwrap_or_default(),
                cmdline
            ));
            match &self.fail_load {
                Some(reason) => Err(io::Error::other(reason.clone())),
                None => Ok(()),
            }
        }

        fn sync(&self) {
            self.calls.lock().unwrap().push("sync".to_string());
        }

        fn exec(&self) -> io::Result<Infallible> {
            self.calls.lock().unwrap().push("exec".to_string());
            Err(io::Error::from_raw_os_error(libc::EPERM))
        }

        fn unload(&self) -> io::Result<()> {
            self.calls.lock().unwrap().push("unload".to_string());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeKexec;
    use super::*;
    use crate::error::ErrorKind;
    use tempfile::TempDir;

    fn entry_in(root: &Path) -> BootEntry {
        fs::create_dir_all(root.join("boot")).unwrap();
        fs::write(root.join("boot/vmlinuz"), b"kernel").unwrap();
        fs::write(root.join("boot/initrd.img"), b"initrd").unwrap();
        BootEntry {
            label: "live".to_string(),
            display: None,
            kernel_path: root.join("boot/vmlinuz"),
            initrd_paths: vec![root.join("boot/initrd.img")],
            parameters: "quiet".to_string(),
            source_config: root.join("isolinux.cfg"),
        }
    }

    fn executor(fake: &FakeKexec, temp: &TempDir) -> Executor {
        Executor::new(Box::new(fake.clone()))
            .with_disabled_flag(temp.path().join("kexec_load_disabled"))
    }

    #[test]
    fn test_dry_run_never_loads() {
        let temp = TempDir::new().unwrap();
        let fake = FakeKexec::default();
        let entry = entry_in(temp.path());

        let err = boot(&executor(&fake, &temp), &entry, "quiet waitusb=10", true).unwrap_err();
        match err {
            BootError::DryRunRefused {
                kernel,
                initrd,
                parameters,
            } => {
                assert_eq!(kernel, entry.kernel_path);
                assert_eq!(initrd, Some(temp.path().join("boot/initrd.img")));
                assert_eq!(parameters, "quiet waitusb=10");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(fake.calls().is_empty());
    }

    #[test]
    fn test_trigger_returning_is_exec_failed() {
        let temp = TempDir::new().unwrap();
        let fake = FakeKexec::default();
        let entry = entry_in(temp.path());

        let err = executor(&fake, &temp)
            .boot(&entry, "quiet", false, Some(temp.path()))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExecFailed);

        let calls = fake.calls();
        assert_eq!(calls.len(), 4);
        assert!(calls[0].starts_with("load "));
        assert!(calls[0].ends_with(" quiet"));
        assert_eq!(&calls[1..], ["sync", "exec", "unload"]);
    }

    #[test]
    fn test_rejected_load_is_load_failed() {
        let temp = TempDir::new().unwrap();
        let fake = FakeKexec {
            fail_load: Some("Exec format error".to_string()),
            ..FakeKexec::default()
        };
        let entry = entry_in(temp.path());

        let err = boot(&executor(&fake, &temp), &entry, "quiet", false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LoadFailed);
        assert!(err.to_string().contains("Exec format error"));
        assert!(!fake.calls().contains(&"exec".to_string()));
    }

    #[test]
    fn test_missing_kernel_is_load_failed_before_loading() {
        let temp = TempDir::new().unwrap();
        let fake = FakeKexec::default();
        let mut entry = entry_in(temp.path());
        entry.kernel_path = temp.path().join("boot/missing");

        let err = boot(&executor(&fake, &temp), &entry, "", false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LoadFailed);
        assert!(fake.calls().is_empty());
    }

    #[test]
    fn test_multiple_initrds_are_concatenated() {
        let temp = TempDir::new().unwrap();
        let fake = FakeKexec::default();
        let mut entry = entry_in(temp.path());
        fs::write(temp.path().join("boot/ucode.img"), b"ucode").unwrap();
        entry.initrd_paths.insert(0, temp.path().join("boot/ucode.img"));

        let combined = concat_initrds(&entry.initrd_paths).unwrap().unwrap();
        assert_eq!(fs::read(combined.path()).unwrap(), b"ucodeinitrd");
        drop(combined);

        let err = boot(&executor(&fake, &temp), &entry, "", false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExecFailed);
        let load = &fake.calls()[0];
        assert!(load.contains("isoboot-initrd-"));
    }

    #[test]
    fn test_disabled_kexec_is_reported() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("kexec_load_disabled"), "1\n").unwrap();
        let fake = FakeKexec::default();
        let entry = entry_in(temp.path());

        let err = boot(&executor(&fake, &temp), &entry, "", false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LoadFailed);
        assert!(err.to_string().contains("disabled"));
        assert!(fake.calls().is_empty());
    }
}
