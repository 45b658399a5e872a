//! Preflight checks before touching loop devices.
//!
//! Validates that the host has the tools the loop-mount backend shells out
//! to and the kernel interfaces the pipeline needs, so a missing `losetup`
//! or an unloaded `loop` module shows up as one readable message instead of
//! a failure halfway through the pipeline.
//!
//! # Example
//!
//! ```rust
//! use isoboot::preflight::{command_exists, check_required_tools};
//!
//! if !command_exists("losetup") {
//!     println!("util-linux not installed");
//! }
//!
//! let tools = &[("mount", "util-linux"), ("umount", "util-linux")];
//! if let Err(e) = check_required_tools(tools) {
//!     eprintln!("{}", e);
//! }
//! ```

use anyhow::{bail, Result};
use std::path::Path;

/// Check if a command exists on the host system.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Host tools needed to loop-mount an image.
///
/// Each tuple is (command_name, package_name).
pub const REQUIRED_TOOLS: &[(&str, &str)] = &[
    ("losetup", "util-linux"),
    ("mount", "util-linux"),
    ("umount", "util-linux"),
];

/// Kernel interfaces, relative to `/`, with a hint for when they are absent.
pub const REQUIRED_INTERFACES: &[(&str, &str)] = &[
    ("dev/loop-control", "load the loop module: modprobe loop"),
    ("proc/self/mountinfo", "mount /proc"),
];

/// Check that specific tools are available.
///
/// Returns an error listing every missing tool and its package.
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let missing: Vec<_> = tools
        .iter()
        .filter(|(tool, _)| !command_exists(tool))
        .map(|(t, p)| format!("  {} (install: {})", t, p))
        .collect();

    if !missing.is_empty() {
        bail!("Missing required host tools:\n{}", missing.join("\n"));
    }
    Ok(())
}

/// Check that kernel interfaces exist under `root`.
pub fn check_interfaces(root: &Path, interfaces: &[(&str, &str)]) -> Result<()> {
    let missing: Vec<_> = interfaces
        .iter()
        .filter(|(rel, _)| !root.join(rel).exists())
        .map(|(rel, hint)| format!("  {} ({})", root.join(rel).display(), hint))
        .collect();

    if !missing.is_empty() {
        bail!("Missing kernel interfaces:\n{}", missing.join("\n"));
    }
    Ok(())
}

/// Check everything the host pipeline needs before mounting.
pub fn check_host_tools() -> Result<()> {
    check_required_tools(REQUIRED_TOOLS)?;
    check_interfaces(Path::new("/"), REQUIRED_INTERFACES)
}
