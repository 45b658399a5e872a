//! Distribution catalog.
//!
//! The catalog is a JSON object keyed by distribution name:
//!
//! ```json
//! {
//!   "tinycore": {
//!     "match_pattern": "^TinyCorePure64-.*\\.iso$",
//!     "checksum": "…",
//!     "checksum_type": "sha256",
//!     "boot_config": "boot/isolinux/isolinux.cfg",
//!     "custom_configs": ["configs/tinycore.cfg"],
//!     "kernel_params": "iso=UUID={{uuid}}{{image_path}}",
//!     "boot_label": "corepure64",
//!     "mirrors": [{ "name": "main", "url": "http://…/TinyCorePure64-14.0.iso" }]
//!   }
//! }
//! ```
//!
//! It is loaded once and never mutated; components borrow `&Catalog`.

use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumType {
    Sha256,
    Sha512,
}

impl ChecksumType {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "sha256" => Ok(ChecksumType::Sha256),
            "sha512" => Ok(ChecksumType::Sha512),
            other => bail!("unsupported checksum_type '{}' (expected sha256 or sha512)", other),
        }
    }

    fn hex_len(self) -> usize {
        match self {
            ChecksumType::Sha256 => 64,
            ChecksumType::Sha512 => 128,
        }
    }
}

impl fmt::Display for ChecksumType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChecksumType::Sha256 => write!(f, "sha256"),
            ChecksumType::Sha512 => write!(f, "sha512"),
        }
    }
}

/// Expected digest of an image, lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checksum {
    pub kind: ChecksumType,
    pub digest: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mirror {
    pub name: String,
    pub url: String,
}

/// One catalog row.
#[derive(Debug, Clone)]
pub struct Distribution {
    pub name: String,
    /// Recognises image file names belonging to this distribution.
    pub match_pattern: Regex,
    pub checksum: Option<Checksum>,
    /// Config path inside the image; `None` means custom configs only.
    pub boot_config: Option<PathBuf>,
    /// Extra configs on the host filesystem, merged after `boot_config`.
    pub custom_configs: Vec<PathBuf>,
    pub kernel_params: String,
    /// Label the resolver looks for; `None` picks the first entry.
    pub boot_label: Option<String>,
    pub mirrors: Vec<Mirror>,
}

impl Distribution {
    pub fn matches_file_name(&self, file_name: &str) -> bool {
        self.match_pattern.is_match(file_name)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DistributionJson {
    match_pattern: String,
    checksum: Option<String>,
    checksum_type: Option<String>,
    boot_config: Option<String>,
    #[serde(default)]
    custom_configs: Vec<String>,
    #[serde(default)]
    kernel_params: String,
    boot_label: Option<String>,
    #[serde(default)]
    mirrors: Vec<MirrorJson>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct MirrorJson {
    #[serde(default)]
    name: String,
    url: String,
}

/// Immutable set of distributions, ordered by name.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    distros: BTreeMap<String, Distribution>,
}

impl Catalog {
    /// Load the catalog from disk. Relative custom config paths resolve
    /// against the catalog file's directory.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading distribution catalog '{}'", path.display()))?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_json_str(&raw, base_dir)
            .with_context(|| format!("parsing distribution catalog '{}'", path.display()))
    }

    pub fn from_json_str(raw: &str, base_dir: &Path) -> Result<Self> {
        let parsed: BTreeMap<String, DistributionJson> = serde_json::from_str(raw)?;

        let mut distros = BTreeMap::new();
        for (name, row) in parsed {
            let distro = convert_row(&name, row, base_dir)
                .with_context(|| format!("invalid catalog entry '{name}'"))?;
            distros.insert(name, distro);
        }

        if distros.is_empty() {
            bail!("catalog contains no distributions");
        }

        Ok(Self { distros })
    }

    pub fn get(&self, name: &str) -> Option<&Distribution> {
        self.distros.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Distribution> {
        self.distros.values()
    }

    pub fn names(&self) -> Vec<&str> {
        self.distros.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.distros.len()
    }

    pub fn is_empty(&self) -> bool {
        self.distros.is_empty()
    }

    /// First distribution (by name) whose pattern matches `file_name`.
    pub fn match_image(&self, file_name: &str) -> Option<&Distribution> {
        self.iter().find(|d| d.matches_file_name(file_name))
    }
}

fn convert_row(name: &str, row: DistributionJson, base_dir: &Path) -> Result<Distribution> {
    if name.trim().is_empty() {
        bail!("distribution name must not be empty");
    }

    let match_pattern = Regex::new(&row.match_pattern)
        .with_context(|| format!("compiling match_pattern '{}'", row.match_pattern))?;

    let checksum = match (row.checksum, row.checksum_type) {
        (None, None) => None,
        (Some(digest), Some(kind)) => {
            let kind = ChecksumType::parse(&kind)?;
            let digest = digest.trim().to_ascii_lowercase();
            if digest.len() != kind.hex_len() || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
                bail!("checksum is not a valid {} hex digest", kind);
            }
            Some(Checksum { kind, digest })
        }
        (Some(_), None) => bail!("checksum given without checksum_type"),
        (None, Some(_)) => bail!("checksum_type given without checksum"),
    };

    let boot_config = row
        .boot_config
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .map(PathBuf::from);

    let custom_configs = row
        .custom_configs
        .iter()
        .map(|p| {
            let path = Path::new(p);
            if path.is_absolute() {
                path.to_path_buf()
            } else {
                base_dir.join(path)
            }
        })
        .collect();

    let mirrors = row
        .mirrors
        .into_iter()
        .enumerate()
        .map(|(i, m)| Mirror {
            name: if m.name.is_empty() {
                format!("mirror-{}", i + 1)
            } else {
                m.name
            },
            url: m.url,
        })
        .collect();

    Ok(Distribution {
        name: name.to_string(),
        match_pattern,
        checksum,
        boot_config,
        custom_configs,
        kernel_params: row.kernel_params.trim().to_string(),
        boot_label: row
            .boot_label
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty()),
        mirrors,
    })
}
