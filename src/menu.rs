//! Items an operator can pick from.
//!
//! The interactive UI lives elsewhere; it is handed `label()`s in order and
//! answers with an index or a cancellation.

use std::path::{Path, PathBuf};

use crate::bootconfig::BootEntry;
use crate::cache::CachedImage;
use crate::catalog::Catalog;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MenuItem {
    /// An image already on disk.
    Iso {
        label: String,
        path: PathBuf,
        distro: String,
    },
    /// A boot entry from a mounted image.
    Config { entry: BootEntry },
    /// Download a catalog distribution.
    DownloadOption { distro: String },
    /// Browse another directory for images.
    DirOption { path: PathBuf },
}

impl MenuItem {
    pub fn label(&self) -> String {
        match self {
            MenuItem::Iso { label, distro, .. } => format!("{label} ({distro})"),
            MenuItem::Config { entry } => entry.display_label().to_string(),
            MenuItem::DownloadOption { distro } => format!("Download {distro}"),
            MenuItem::DirOption { path } => format!("Browse {}", path.display()),
        }
    }
}

/// Item at `index`; `None` (out of range or no choice) means cancel.
pub fn select(items: &[MenuItem], index: Option<usize>) -> Option<&MenuItem> {
    items.get(index?)
}

/// Cached images first, then one download option per distribution.
pub fn main_menu(cached: &[CachedImage], catalog: &Catalog) -> Vec<MenuItem> {
    let images = cached.iter().map(|image| MenuItem::Iso {
        label: image
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| image.path.display().to_string()),
        path: image.path.clone(),
        distro: image.distro.clone(),
    });
    let downloads = catalog
        .iter()
        .filter(|d| !d.mirrors.is_empty())
        .map(|d| MenuItem::DownloadOption {
            distro: d.name.clone(),
        });
    images.chain(downloads).collect()
}

/// One item per boot entry, in order.
pub fn entry_menu(entries: &[BootEntry]) -> Vec<MenuItem> {
    entries
        .iter()
        .cloned()
        .map(|entry| MenuItem::Config { entry })
        .collect()
}

/// Subdirectories of `dir` as browse options, sorted.
pub fn dir_options(dir: &Path) -> Vec<MenuItem> {
    let Ok(read) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut dirs: Vec<PathBuf> = read
        .flatten()
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .map(|e| e.path())
        .collect();
    dirs.sort();
    dirs.into_iter()
        .map(|path| MenuItem::DirOption { path })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn catalog() -> Catalog {
        Catalog::from_json_str(
            r#"{
                "arch": { "match_pattern": "^archlinux-.*\\.iso$",
                          "mirrors": [{ "url": "http://example.org/archlinux-x.iso" }] },
                "local": { "match_pattern": "^local-.*\\.iso$" }
            }"#,
            Path::new("."),
        )
        .unwrap()
    }

    #[test]
    fn test_labels_per_variant() {
        let entry = BootEntry {
            label: "live".to_string(),
            display: Some("Live System".to_string()),
            kernel_path: PathBuf::from("/mnt/vmlinuz"),
            initrd_paths: vec![],
            parameters: String::new(),
            source_config: PathBuf::from("/mnt/isolinux.cfg"),
        };
        let items = vec![
            MenuItem::Iso {
                label: "archlinux-2024.iso".to_string(),
                path: PathBuf::from("/cache/archlinux-2024.iso"),
                distro: "arch".to_string(),
            },
            MenuItem::Config { entry },
            MenuItem::DownloadOption {
                distro: "arch".to_string(),
            },
            MenuItem::DirOption {
                path: PathBuf::from("/media/usb"),
            },
        ];
        let labels: Vec<_> = items.iter().map(MenuItem::label).collect();
        assert_eq!(
            labels,
            vec![
                "archlinux-2024.iso (arch)",
                "Live System",
                "Download arch",
                "Browse /media/usb"
            ]
        );
    }

    #[test]
    fn test_select_handles_cancel_and_range() {
        let items = vec![MenuItem::DownloadOption {
            distro: "arch".to_string(),
        }];
        assert_eq!(select(&items, Some(0)), Some(&items[0]));
        assert_eq!(select(&items, Some(1)), None);
        assert_eq!(select(&items, None), None);
    }

    #[test]
    fn test_main_menu_lists_cache_then_downloads() {
        let cached = vec![CachedImage {
            path: PathBuf::from("/cache/local-1.iso"),
            distro: "local".to_string(),
        }];
        let items = main_menu(&cached, &catalog());
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].label(), "local-1.iso (local)");
        assert_eq!(
            items[1],
            MenuItem::DownloadOption {
                distro: "arch".to_string()
            }
        );
    }

    #[test]
    fn test_dir_options_are_sorted_directories() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir(temp.path().join("b")).unwrap();
        std::fs::create_dir(temp.path().join("a")).unwrap();
        std::fs::write(temp.path().join("file.iso"), b"").unwrap();

        let items = dir_options(temp.path());
        assert_eq!(
            items,
            vec![
                MenuItem::DirOption {
                    path: temp.path().join("a")
                },
                MenuItem::DirOption {
                    path: temp.path().join("b")
                },
            ]
        );
    }
}
