//! Cached images and the device they live on.
//!
//! Booted kernels usually need to find the image again (e.g. `iso-scan`,
//! `findiso=`), so the kernel parameter template is rendered against a
//! [`CacheDevice`] describing the block device that holds the image.

use std::cmp::Ordering;
use std::fs;
use std::iter::Peekable;
use std::path::{Path, PathBuf};
use std::str::Chars;
use walkdir::WalkDir;

use crate::catalog::Catalog;

/// Image file found in the cache directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedImage {
    pub path: PathBuf,
    pub distro: String,
}

/// Regular files directly inside `dir` whose name matches a catalog pattern,
/// sorted by file name in version order. A missing directory yields nothing.
pub fn find_cached_images(dir: &Path, catalog: &Catalog) -> Vec<CachedImage> {
    if !dir.is_dir() {
        return Vec::new();
    }

    WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by(|a, b| {
            version_cmp(&a.file_name().to_string_lossy(), &b.file_name().to_string_lossy())
        })
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!("skipping unreadable cache entry: {}", e);
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            let name = entry.file_name().to_str()?;
            if name.ends_with(".part") {
                return None;
            }
            let distro = catalog.match_image(name)?;
            Some(CachedImage {
                path: entry.path().to_path_buf(),
                distro: distro.name.clone(),
            })
        })
        .collect()
}

/// Compare names with runs of digits ordered by value, so `core-9.iso`
/// sorts before `core-10.iso`.
pub(crate) fn version_cmp(a: &str, b: &str) -> Ordering {
    let mut a = a.chars().peekable();
    let mut b = b.chars().peekable();
    loop {
        match (a.peek().copied(), b.peek().copied()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) if x.is_ascii_digit() && y.is_ascii_digit() => {
                let x = take_digits(&mut a);
                let y = take_digits(&mut b);
                let (xv, yv) = (x.trim_start_matches('0'), y.trim_start_matches('0'));
                let ord = xv
                    .len()
                    .cmp(&yv.len())
                    .then_with(|| xv.cmp(yv))
                    .then_with(|| x.len().cmp(&y.len()));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            (Some(x), Some(y)) => {
                if x != y {
                    return x.cmp(&y);
                }
                a.next();
                b.next();
            }
        }
    }
}

fn take_digits(chars: &mut Peekable<Chars<'_>>) -> String {
    let mut digits = String::new();
    while let Some(c) = chars.next_if(char::is_ascii_digit) {
        digits.push(c);
    }
    digits
}

/// Device descriptor consumed by the kernel parameter template.
///
/// All fields are opaque strings; any that could not be determined are
/// empty. `image_path` is the image's path relative to the device's mount
/// point, rooted at `/`, which is how the booted kernel will see it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheDevice {
    /// Block device name without `/dev/` (e.g. `sdb1`).
    pub name: String,
    pub uuid: String,
    pub mount_point: String,
    pub image_path: String,
}

impl CacheDevice {
    /// Describe the device holding `image` using the live mount table.
    pub fn detect(image: &Path) -> Self {
        let image = fs::canonicalize(image).unwrap_or_else(|_| image.to_path_buf());
        let mounts = fs::read_to_string("/proc/self/mountinfo")
            .map(|raw| parse_mountinfo(&raw))
            .unwrap_or_default();

        let Some(mount) = mount_for_path(&mounts, &image) else {
            tracing::debug!("no mount found for {}", image.display());
            return Self {
                image_path: image.display().to_string(),
                ..Self::default()
            };
        };

        tracing::debug!(
            "{} lives on {} ({}) mounted at {}",
            image.display(),
            mount.source,
            mount.fstype,
            mount.mount_point.display()
        );
        let uuid = uuid_for_device(Path::new("/dev/disk/by-uuid"), Path::new(&mount.source))
            .unwrap_or_default();
        Self::from_mount(mount, &image, uuid)
    }

    fn from_mount(mount: &MountInfo, image: &Path, uuid: String) -> Self {
        let relative = image.strip_prefix(&mount.mount_point).unwrap_or(image);
        let image_path = Path::new("/").join(relative).display().to_string();
        let name = mount
            .source
            .strip_prefix("/dev/")
            .unwrap_or(&mount.source)
            .to_string();

        Self {
            name,
            uuid,
            mount_point: mount.mount_point.display().to_string(),
            image_path,
        }
    }
}

/// One row of `/proc/self/mountinfo`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MountInfo {
    pub(crate) mount_point: PathBuf,
    pub(crate) fstype: String,
    pub(crate) source: String,
}

pub(crate) fn parse_mountinfo(raw: &str) -> Vec<MountInfo> {
    raw.lines()
        .filter_map(|line| {
            let (pre, post) = line.split_once(" - ")?;
            let mount_point = pre.split_whitespace().nth(4)?;
            let mut post = post.split_whitespace();
            let fstype = post.next()?;
            let source = post.next()?;
            Some(MountInfo {
                mount_point: PathBuf::from(unescape_octal(mount_point)),
                fstype: fstype.to_string(),
                source: unescape_octal(source),
            })
        })
        .collect()
}

/// Undo the kernel's `\ooo` escaping of spaces, tabs and backslashes.
fn unescape_octal(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                let value = digits.iter().fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
                if let Ok(value) = u8::try_from(value) {
                    out.push(value);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Deepest mount whose mount point is a prefix of `path`.
pub(crate) fn mount_for_path<'a>(mounts: &'a [MountInfo], path: &Path) -> Option<&'a MountInfo> {
    mounts
        .iter()
        .filter(|m| path.starts_with(&m.mount_point))
        .max_by_key(|m| m.mount_point.components().count())
}

/// Look up the filesystem UUID of `device` via the udev symlink directory.
pub(crate) fn uuid_for_device(by_uuid: &Path, device: &Path) -> Option<String> {
    let device = fs::canonicalize(device).ok()?;
    let mut entries: Vec<_> = fs::read_dir(by_uuid).ok()?.flatten().collect();
    entries.sort_by_key(|e| e.file_name());
    entries.into_iter().find_map(|entry| {
        let target = fs::canonicalize(entry.path()).ok()?;
        (target == device).then(|| entry.file_name().to_string_lossy().into_owned())
    })
}
