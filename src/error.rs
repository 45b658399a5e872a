//! Error types for the boot pipeline.
//!
//! Every stage has its own error enum so callers can match on exactly the
//! failures that stage can produce. All of them map onto the flat
//! [`ErrorKind`] taxonomy, which is what the CLI reports.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Flat classification of every failure the pipeline can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    AcquisitionFailed,
    DeviceUnavailable,
    MountFailed,
    UnmountFailed,
    ConfigNotFound,
    ConfigMalformed,
    NoMatchingConfig,
    AmbiguousSelection,
    TemplateError,
    DryRunRefused,
    LoadFailed,
    ExecFailed,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::AcquisitionFailed => "AcquisitionFailed",
            ErrorKind::DeviceUnavailable => "DeviceUnavailable",
            ErrorKind::MountFailed => "MountFailed",
            ErrorKind::UnmountFailed => "UnmountFailed",
            ErrorKind::ConfigNotFound => "ConfigNotFound",
            ErrorKind::ConfigMalformed => "ConfigMalformed",
            ErrorKind::NoMatchingConfig => "NoMatchingConfig",
            ErrorKind::AmbiguousSelection => "AmbiguousSelection",
            ErrorKind::TemplateError => "TemplateError",
            ErrorKind::DryRunRefused => "DryRunRefused",
            ErrorKind::LoadFailed => "LoadFailed",
            ErrorKind::ExecFailed => "ExecFailed",
        };
        f.write_str(name)
    }
}

/// Pipeline stage, used to label where a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Acquire,
    Mount,
    Parse,
    Resolve,
    Compose,
    Boot,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Acquire => write!(f, "acquire"),
            Stage::Mount => write!(f, "mount"),
            Stage::Parse => write!(f, "parse"),
            Stage::Resolve => write!(f, "resolve"),
            Stage::Compose => write!(f, "compose"),
            Stage::Boot => write!(f, "boot"),
        }
    }
}

/// Failure to obtain a local image.
#[derive(Debug, Error)]
pub enum AcquireError {
    /// Local image path does not exist or is not a file/block device
    #[error("image '{}' is not a readable file or block device", .path.display())]
    NotFound { path: PathBuf },

    /// Distribution has no mirrors to download from
    #[error("distribution '{distro}' has no download mirrors")]
    NoMirrors { distro: String },

    /// Every mirror was tried and none produced the image
    #[error("all mirrors failed for '{distro}':\n  {}", .attempts.join("\n  "))]
    AllMirrorsFailed { distro: String, attempts: Vec<String> },

    /// Overall acquisition deadline passed
    #[error("download deadline exceeded for '{distro}'")]
    DeadlineExceeded { distro: String },

    /// Digest of the acquired image does not match the catalog
    #[error("checksum mismatch for '{}': expected {expected}, got {actual}", .path.display())]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    /// Another process holds the download lock for the same destination
    #[error("download destination '{}' is locked by another process", .path.display())]
    Locked { path: PathBuf },

    /// I/O error while reading or writing the image
    #[error("I/O error on '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl AcquireError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::AcquisitionFailed
    }
}

/// Loop-mount lifecycle failures.
#[derive(Debug, Error)]
pub enum MountError {
    /// No loop device could be bound to the image
    #[error("no loop device available for '{}': {reason}", .image.display())]
    DeviceUnavailable { image: PathBuf, reason: String },

    /// The kernel rejected the mount
    #[error("mounting {device} at '{}' failed: {reason}", .mount_point.display())]
    MountFailed {
        device: String,
        mount_point: PathBuf,
        reason: String,
    },

    /// Unmount or loop detach failed
    #[error("unmounting '{}' ({device}) failed: {reason}", .mount_point.display())]
    UnmountFailed {
        device: String,
        mount_point: PathBuf,
        reason: String,
    },
}

impl MountError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MountError::DeviceUnavailable { .. } => ErrorKind::DeviceUnavailable,
            MountError::MountFailed { .. } => ErrorKind::MountFailed,
            MountError::UnmountFailed { .. } => ErrorKind::UnmountFailed,
        }
    }
}

/// Boot configuration discovery and parsing failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// None of the candidate configuration files exist
    #[error("no boot configuration found under '{}' (tried: {})", .root.display(), .tried.join(", "))]
    NotFound { root: PathBuf, tried: Vec<String> },

    /// A configuration file could not be read
    #[error("reading boot configuration '{}': {source}", .path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A configuration file was read but yielded nothing usable
    #[error("malformed boot configuration '{}'{}: {reason}", .path.display(), line_suffix(.line))]
    Malformed {
        path: PathBuf,
        line: Option<usize>,
        reason: String,
    },
}

fn line_suffix(line: &Option<usize>) -> String {
    line.map(|l| format!(" line {l}")).unwrap_or_default()
}

impl ConfigError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConfigError::NotFound { .. } | ConfigError::Unreadable { .. } => {
                ErrorKind::ConfigNotFound
            }
            ConfigError::Malformed { .. } => ErrorKind::ConfigMalformed,
        }
    }
}

/// Entry selection failures.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// Nothing to choose from, or nothing with the required label
    #[error("no boot entry for '{distro}'{}; available: [{}]", label_suffix(.label.as_deref()), .available.join(", "))]
    NoMatchingConfig {
        distro: String,
        label: Option<String>,
        available: Vec<String>,
    },

    /// More than one distinct entry carries the required label
    #[error("{count} different boot entries labelled '{label}' for '{distro}'")]
    AmbiguousSelection {
        distro: String,
        label: String,
        count: usize,
    },
}

fn label_suffix(label: Option<&str>) -> String {
    label.map(|l| format!(" labelled '{l}'")).unwrap_or_default()
}

impl ResolveError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ResolveError::NoMatchingConfig { .. } => ErrorKind::NoMatchingConfig,
            ResolveError::AmbiguousSelection { .. } => ErrorKind::AmbiguousSelection,
        }
    }
}

/// Kernel parameter template rendering failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("unknown placeholder '{name}' at offset {offset}")]
    UnknownPlaceholder { name: String, offset: usize },

    #[error("unterminated placeholder starting at offset {offset}")]
    Unterminated { offset: usize },

    #[error("empty placeholder at offset {offset}")]
    EmptyPlaceholder { offset: usize },

    #[error("unmatched '}}}}' at offset {offset}")]
    StrayClose { offset: usize },

    /// Substituted value cannot be expressed as one kernel argument
    #[error("value of '{name}' at offset {offset} contains a double quote")]
    UnquotableValue { name: String, offset: usize },
}

impl TemplateError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::TemplateError
    }
}

/// Kernel load and re-exec failures.
#[derive(Debug, Error)]
pub enum BootError {
    /// Dry run requested; carries what would have been booted
    #[error("dry run: would kexec '{}'{} with parameters \"{parameters}\"", .kernel.display(), initrd_suffix(.initrd.as_ref()))]
    DryRunRefused {
        kernel: PathBuf,
        initrd: Option<PathBuf>,
        parameters: String,
    },

    /// Staging the kernel was rejected
    #[error("loading kernel '{}' failed: {reason}", .kernel.display())]
    LoadFailed { kernel: PathBuf, reason: String },

    /// The re-exec trigger returned control
    #[error("kexec trigger returned: {reason}")]
    ExecFailed { reason: String },
}

fn initrd_suffix(initrd: Option<&PathBuf>) -> String {
    initrd
        .map(|p| format!(" (initrd '{}')", p.display()))
        .unwrap_or_default()
}

impl BootError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BootError::DryRunRefused { .. } => ErrorKind::DryRunRefused,
            BootError::LoadFailed { .. } => ErrorKind::LoadFailed,
            BootError::ExecFailed { .. } => ErrorKind::ExecFailed,
        }
    }
}

/// A stage-labelled pipeline failure.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("acquire stage failed ({}): {0}", .0.kind())]
    Acquire(#[from] AcquireError),

    #[error("mount stage failed ({}): {0}", .0.kind())]
    Mount(#[from] MountError),

    #[error("parse stage failed ({}): {0}", .0.kind())]
    Parse(#[from] ConfigError),

    #[error("resolve stage failed ({}): {0}", .0.kind())]
    Resolve(#[from] ResolveError),

    #[error("compose stage failed ({}): {0}", .0.kind())]
    Compose(#[from] TemplateError),

    #[error("boot stage failed ({}): {0}", .0.kind())]
    Boot(#[from] BootError),
}

impl PipelineError {
    pub fn stage(&self) -> Stage {
        match self {
            PipelineError::Acquire(_) => Stage::Acquire,
            PipelineError::Mount(_) => Stage::Mount,
            PipelineError::Parse(_) => Stage::Parse,
            PipelineError::Resolve(_) => Stage::Resolve,
            PipelineError::Compose(_) => Stage::Compose,
            PipelineError::Boot(_) => Stage::Boot,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Acquire(e) => e.kind(),
            PipelineError::Mount(e) => e.kind(),
            PipelineError::Parse(e) => e.kind(),
            PipelineError::Resolve(e) => e.kind(),
            PipelineError::Compose(e) => e.kind(),
            PipelineError::Boot(e) => e.kind(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ConfigError::Malformed {
            path: PathBuf::from("/mnt/isolinux/isolinux.cfg"),
            line: Some(12),
            reason: "LABEL without KERNEL".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "malformed boot configuration '/mnt/isolinux/isolinux.cfg' line 12: LABEL without KERNEL"
        );

        let err = TemplateError::StrayClose { offset: 3 };
        assert_eq!(err.to_string(), "unmatched '}}' at offset 3");

        let err = ResolveError::NoMatchingConfig {
            distro: "core".to_string(),
            label: Some("live".to_string()),
            available: vec!["install".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "no boot entry for 'core' labelled 'live'; available: [install]"
        );
    }

    #[test]
    fn test_pipeline_error_reports_stage_and_kind() {
        let err: PipelineError = MountError::MountFailed {
            device: "/dev/loop3".to_string(),
            mount_point: PathBuf::from("/tmp/isoboot-x"),
            reason: "wrong fs type".to_string(),
        }
        .into();

        assert_eq!(err.stage(), Stage::Mount);
        assert_eq!(err.kind(), ErrorKind::MountFailed);
        assert!(err.to_string().starts_with("mount stage failed (MountFailed)"));
    }

    #[test]
    fn test_kind_mapping() {
        let err = ConfigError::Unreadable {
            path: PathBuf::from("x"),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        };
        assert_eq!(err.kind(), ErrorKind::ConfigNotFound);

        let err = BootError::ExecFailed {
            reason: "EPERM".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::ExecFailed);

        let err = AcquireError::NoMirrors {
            distro: "tinycore".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::AcquisitionFailed);
    }
}
