//! SYSLINUX / ISOLINUX configuration parser.
//!
//! Turns the boot configuration found on a mounted image into a list of
//! [`BootEntry`] values, in the order they appear in the source.
//!
//! Supported directives (keywords are case-insensitive):
//!
//! | Directive | Effect |
//! |---|---|
//! | `LABEL name` | starts an entry |
//! | `KERNEL path` / `LINUX path` | kernel image |
//! | `INITRD a[,b…]` | initrd images |
//! | `APPEND args` | kernel parameters (`-` means none); before any `LABEL` it is the default |
//! | `MENU LABEL text` | display text (`^` hotkey markers stripped) |
//! | `INCLUDE file` / `MENU INCLUDE file` | parse another file in place |
//! | `LOCALBOOT`, `COM32`, `*.c32` kernels | entry is not a Linux kernel and is skipped |
//! | `TEXT HELP` … `ENDTEXT` | ignored block |
//!
//! Everything else is skipped. Kernel and initrd paths, absolute or not, are
//! resolved against the mount root, never the live root. A relative
//! `INCLUDE` target is looked up in the including file's directory first,
//! as SYSLINUX does, then at the mount root.

use std::collections::HashSet;
use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::error::ConfigError;

/// Conventional config locations, highest priority first.
pub const CONFIG_CANDIDATES: &[&str] = &[
    "isolinux/isolinux.cfg",
    "boot/isolinux/isolinux.cfg",
    "isolinux.cfg",
    "syslinux/syslinux.cfg",
    "boot/syslinux/syslinux.cfg",
    "syslinux.cfg",
];

const MAX_INCLUDE_DEPTH: usize = 8;

/// One bootable kernel + initrd + parameters combination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootEntry {
    /// `LABEL` value; the matching key.
    pub label: String,
    /// `MENU LABEL` text, if any.
    pub display: Option<String>,
    /// Kernel path on the host, under the mount root.
    pub kernel_path: PathBuf,
    pub initrd_paths: Vec<PathBuf>,
    /// Kernel parameters as written in the config (may hold placeholders).
    pub parameters: String,
    /// Config file that declared this entry.
    pub source_config: PathBuf,
}

impl BootEntry {
    pub fn initrd_path(&self) -> Option<&Path> {
        self.initrd_paths.first().map(PathBuf::as_path)
    }

    /// Text to show an operator.
    pub fn display_label(&self) -> &str {
        self.display.as_deref().unwrap_or(&self.label)
    }

    /// Same entry with kernel and initrd paths moved from under `from` to
    /// under `to`. Paths outside `from` are kept as they are.
    pub fn rebase(&self, from: &Path, to: &Path) -> BootEntry {
        let move_path = |p: &PathBuf| match p.strip_prefix(from) {
            Ok(rel) => to.join(rel),
            Err(_) => p.clone(),
        };
        BootEntry {
            kernel_path: move_path(&self.kernel_path),
            initrd_paths: self.initrd_paths.iter().map(move_path).collect(),
            ..self.clone()
        }
    }

    /// Check that the kernel and initrds are readable regular files that
    /// stay under `mount_root` once symlinks are resolved.
    pub fn verify(&self, mount_root: &Path) -> Result<(), String> {
        let root = fs::canonicalize(mount_root)
            .map_err(|e| format!("mount root '{}': {e}", mount_root.display()))?;

        let files = std::iter::once(&self.kernel_path).chain(self.initrd_paths.iter());
        for path in files {
            let real = fs::canonicalize(path)
                .map_err(|e| format!("'{}': {e}", path.display()))?;
            if !real.starts_with(&root) {
                return Err(format!(
                    "'{}' resolves outside the mounted image",
                    path.display()
                ));
            }
            if !real.is_file() {
                return Err(format!("'{}' is not a regular file", path.display()));
            }
            fs::File::open(&real).map_err(|e| format!("'{}': {e}", path.display()))?;
        }
        Ok(())
    }
}

/// Parse the image's boot configuration.
///
/// With `hint`, only that file (relative to `mount_root`) is parsed.
/// Otherwise [`CONFIG_CANDIDATES`] are tried in order and the first that
/// yields at least one entry wins.
pub fn parse(mount_root: &Path, hint: Option<&Path>) -> Result<Vec<BootEntry>, ConfigError> {
    if let Some(hint) = hint {
        if hint.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(ConfigError::Malformed {
                path: hint.to_path_buf(),
                line: None,
                reason: "config path escapes the image root".to_string(),
            });
        }
        let path = in_image(mount_root, hint);
        if !path.is_file() {
            return Err(ConfigError::NotFound {
                root: mount_root.to_path_buf(),
                tried: vec![hint.display().to_string()],
            });
        }
        return parse_file(mount_root, &path);
    }

    let mut last_err = None;
    for candidate in CONFIG_CANDIDATES {
        let path = mount_root.join(candidate);
        if !path.is_file() {
            continue;
        }
        match parse_file(mount_root, &path) {
            Ok(entries) => {
                tracing::info!("using boot configuration {}", candidate);
                return Ok(entries);
            }
            Err(e) => {
                tracing::warn!("skipping {}: {}", candidate, e);
                last_err = Some(e);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| ConfigError::NotFound {
        root: mount_root.to_path_buf(),
        tried: CONFIG_CANDIDATES.iter().map(|c| c.to_string()).collect(),
    }))
}

/// Parse several config files independently and concatenate their entries
/// in the order given.
pub fn parse_sources(
    mount_root: &Path,
    sources: &[PathBuf],
) -> Result<Vec<BootEntry>, ConfigError> {
    let mut entries = Vec::new();
    for source in sources {
        entries.extend(parse_file(mount_root, source)?);
    }
    Ok(entries)
}

/// Parse one config file. `config_path` is a host path (it may live outside
/// the image); entry paths resolve against `mount_root`.
pub fn parse_file(mount_root: &Path, config_path: &Path) -> Result<Vec<BootEntry>, ConfigError> {
    let mut parser = Parser::new(mount_root);
    parser.parse_path(config_path, 0)?;
    parser.finish_entry();
    parser.into_entries(config_path)
}

/// Map an in-image path (absolute or relative) onto the mount.
fn in_image(mount_root: &Path, path: &Path) -> PathBuf {
    let relative: PathBuf = path
        .components()
        .filter(|c| !matches!(c, Component::RootDir | Component::Prefix(_)))
        .collect();
    mount_root.join(relative)
}

/// Resolve a kernel/initrd reference against the mount root, refusing to
/// climb out of it.
fn resolve_image_path(mount_root: &Path, raw: &str) -> Result<PathBuf, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err("empty path".to_string());
    }
    let candidate = Path::new(raw);
    for component in candidate.components() {
        if matches!(component, Component::ParentDir | Component::Prefix(_)) {
            return Err(format!("path '{raw}' escapes the image root"));
        }
    }
    Ok(in_image(mount_root, candidate))
}

#[derive(Debug)]
struct Problem {
    file: PathBuf,
    line: usize,
    reason: String,
}

#[derive(Debug)]
struct PendingEntry {
    label: String,
    display: Option<String>,
    kernel: Option<String>,
    kernel_args: Option<String>,
    initrds: Option<Vec<String>>,
    append: Option<String>,
    skip: Option<&'static str>,
    file: PathBuf,
    line: usize,
}

struct Parser<'a> {
    mount_root: &'a Path,
    entries: Vec<BootEntry>,
    problems: Vec<Problem>,
    pending: Option<PendingEntry>,
    global_append: Option<String>,
    include_stack: HashSet<PathBuf>,
}

impl<'a> Parser<'a> {
    fn new(mount_root: &'a Path) -> Self {
        Self {
            mount_root,
            entries: Vec::new(),
            problems: Vec::new(),
            pending: None,
            global_append: None,
            include_stack: HashSet::new(),
        }
    }

    fn parse_path(&mut self, path: &Path, depth: usize) -> Result<(), ConfigError> {
        let bytes = fs::read(path).map_err(|source| ConfigError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?;
        let key = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        self.include_stack.insert(key.clone());
        self.parse_text(path, &String::from_utf8_lossy(&bytes), depth);
        self.include_stack.remove(&key);
        Ok(())
    }

    fn parse_text(&mut self, file: &Path, text: &str, depth: usize) {
        let mut in_help_text = false;

        for (index, raw_line) in text.lines().enumerate() {
            let line_no = index + 1;
            let line = raw_line.trim();

            if in_help_text {
                if line.eq_ignore_ascii_case("endtext") {
                    in_help_text = false;
                }
                continue;
            }
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (keyword, rest) = split_keyword(line);
            match keyword.to_ascii_lowercase().as_str() {
                "label" => self.start_entry(rest, file, line_no),
                "kernel" | "linux" => self.set_kernel(rest, file, line_no),
                "initrd" => {
                    let initrds = split_initrds(rest);
                    match self.pending.as_mut() {
                        Some(entry) => entry.initrds = Some(initrds),
                        None => self.note(file, line_no, "INITRD outside of a LABEL block"),
                    }
                }
                "append" => {
                    let append = if rest == "-" { String::new() } else { rest.to_string() };
                    match self.pending.as_mut() {
                        Some(entry) => entry.append = Some(append),
                        None => self.global_append = Some(append),
                    }
                }
                "localboot" | "com32" | "config" | "pxe" | "fdimage" | "comboot" => {
                    if let Some(entry) = self.pending.as_mut() {
                        entry.skip = Some("not a Linux kernel entry");
                    }
                }
                "include" => self.include(rest, file, line_no, depth),
                "menu" => {
                    let (sub, sub_rest) = split_keyword(rest);
                    match sub.to_ascii_lowercase().as_str() {
                        "label" => {
                            let display = sub_rest.replace('^', "").trim().to_string();
                            if let Some(entry) = self.pending.as_mut() {
                                if !display.is_empty() {
                                    entry.display = Some(display);
                                }
                            }
                        }
                        "include" => {
                            let (target, _) = split_keyword(sub_rest);
                            self.include(target, file, line_no, depth);
                        }
                        _ => {}
                    }
                }
                "text" => {
                    if split_keyword(rest).0.eq_ignore_ascii_case("help") {
                        in_help_text = true;
                    }
                }
                other => tracing::trace!("ignoring directive '{}' in {}", other, file.display()),
            }
        }
    }

    fn start_entry(&mut self, rest: &str, file: &Path, line: usize) {
        self.finish_entry();
        let label = rest.trim();
        if label.is_empty() {
            self.note(file, line, "LABEL without a name");
            return;
        }
        self.pending = Some(PendingEntry {
            label: label.to_string(),
            display: None,
            kernel: None,
            kernel_args: None,
            initrds: None,
            append: None,
            skip: None,
            file: file.to_path_buf(),
            line,
        });
    }

    fn set_kernel(&mut self, rest: &str, file: &Path, line: usize) {
        let Some(entry) = self.pending.as_mut() else {
            self.note(file, line, "KERNEL outside of a LABEL block");
            return;
        };
        let (path, args) = split_keyword(rest);
        if path.to_ascii_lowercase().ends_with(".c32") {
            entry.skip = Some("COM32 module, not a Linux kernel");
        }
        entry.kernel = Some(path.to_string());
        entry.kernel_args = (!args.is_empty()).then(|| args.to_string());
    }

    fn include(&mut self, target: &str, file: &Path, line: usize, depth: usize) {
        if target.is_empty() {
            self.note(file, line, "INCLUDE without a file");
            return;
        }
        if depth + 1 > MAX_INCLUDE_DEPTH {
            self.note(file, line, "INCLUDE nested too deeply");
            return;
        }
        let path = match self.include_path(file, target) {
            Ok(path) => path,
            Err(reason) => {
                self.note(file, line, &reason);
                return;
            }
        };
        let key = fs::canonicalize(&path).unwrap_or_else(|_| path.clone());
        if self.include_stack.contains(&key) {
            self.note(file, line, &format!("INCLUDE cycle through '{target}'"));
            return;
        }
        if let Err(e) = self.parse_path(&path, depth + 1) {
            self.note(file, line, &e.to_string());
        }
    }

    /// Relative targets are looked up next to the including file first,
    /// then at the mount root. Absolute targets are always root-relative.
    fn include_path(&self, including: &Path, target: &str) -> Result<PathBuf, String> {
        let rooted = resolve_image_path(self.mount_root, target)?;
        let target = Path::new(target.trim());
        if target.has_root() {
            return Ok(rooted);
        }
        let sibling = including
            .parent()
            .filter(|dir| dir.starts_with(self.mount_root))
            .map(|dir| dir.join(target))
            .filter(|path| path.is_file());
        Ok(sibling.unwrap_or(rooted))
    }

    fn note(&mut self, file: &Path, line: usize, reason: &str) {
        tracing::warn!("{}:{}: {}", file.display(), line, reason);
        self.problems.push(Problem {
            file: file.to_path_buf(),
            line,
            reason: reason.to_string(),
        });
    }

    fn finish_entry(&mut self) {
        let Some(pending) = self.pending.take() else {
            return;
        };

        if let Some(reason) = pending.skip {
            tracing::debug!("skipping entry '{}': {}", pending.label, reason);
            return;
        }

        let Some(kernel) = pending.kernel.as_deref() else {
            let reason = format!("LABEL '{}' has no KERNEL", pending.label);
            self.note(&pending.file, pending.line, &reason);
            return;
        };

        match self.build_entry(&pending, kernel) {
            Ok(entry) => self.entries.push(entry),
            Err(reason) => {
                let reason = format!("LABEL '{}': {reason}", pending.label);
                self.note(&pending.file, pending.line, &reason);
            }
        }
    }

    fn build_entry(&self, pending: &PendingEntry, kernel: &str) -> Result<BootEntry, String> {
        let kernel_path = resolve_image_path(self.mount_root, kernel)?;

        let append = pending
            .append
            .clone()
            .or_else(|| self.global_append.clone())
            .unwrap_or_default();
        let (append_initrds, mut params) = take_initrd_params(&append);
        if let Some(args) = &pending.kernel_args {
            params.insert(0, args.clone());
        }

        let initrd_refs = pending.initrds.clone().unwrap_or(append_initrds);
        let initrd_paths = initrd_refs
            .iter()
            .map(|raw| resolve_image_path(self.mount_root, raw))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(BootEntry {
            label: pending.label.clone(),
            display: pending.display.clone(),
            kernel_path,
            initrd_paths,
            parameters: params.join(" "),
            source_config: pending.file.clone(),
        })
    }

    fn into_entries(self, config_path: &Path) -> Result<Vec<BootEntry>, ConfigError> {
        if !self.entries.is_empty() {
            return Ok(self.entries);
        }
        match self.problems.into_iter().next() {
            Some(problem) => Err(ConfigError::Malformed {
                path: problem.file,
                line: Some(problem.line),
                reason: problem.reason,
            }),
            None => Err(ConfigError::Malformed {
                path: config_path.to_path_buf(),
                line: None,
                reason: "no boot entries".to_string(),
            }),
        }
    }
}

/// Split `KEYWORD rest of line` on the first run of whitespace.
fn split_keyword(line: &str) -> (&str, &str) {
    let line = line.trim();
    match line.find(char::is_whitespace) {
        Some(pos) => (&line[..pos], line[pos..].trim()),
        None => (line, ""),
    }
}

fn split_initrds(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Pull `initrd=` tokens out of an APPEND line.
fn take_initrd_params(append: &str) -> (Vec<String>, Vec<String>) {
    let mut initrds = Vec::new();
    let mut params = Vec::new();
    for token in append.split_whitespace() {
        match token.strip_prefix("initrd=") {
            Some(value) => initrds.extend(split_initrds(value)),
            None => params.push(token.to_string()),
        }
    }
    (initrds, params)
}
