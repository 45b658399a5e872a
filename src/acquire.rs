//! Image acquisition.
//!
//! Produces an [`Image`] either from a path that is already on the machine
//! (USB stick, pre-seeded cache) or by downloading it from the
//! distribution's mirrors. Acquisition always finishes before anything is
//! mounted.

use sha2::{Digest, Sha256, Sha512};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;

use crate::catalog::{Checksum, ChecksumType, Distribution};
use crate::error::AcquireError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    LocalFile,
    Downloaded,
}

/// A bootable image on local storage. Read-only from here on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub path: PathBuf,
    /// Known for regular files; `None` for block devices.
    pub size_bytes: Option<u64>,
    pub source: SourceKind,
}

/// Use an image that is already present locally.
pub fn local(path: &Path) -> Result<Image, AcquireError> {
    let not_found = || AcquireError::NotFound {
        path: path.to_path_buf(),
    };
    let meta = fs::metadata(path).map_err(|_| not_found())?;

    let size_bytes = if meta.is_file() {
        Some(meta.len())
    } else if meta.file_type().is_block_device() {
        None
    } else {
        return Err(not_found());
    };

    File::open(path).map_err(|source| AcquireError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    Ok(Image {
        path: path.to_path_buf(),
        size_bytes,
        source: SourceKind::LocalFile,
    })
}

/// Compute the digest of `path` and compare with `expected`.
pub fn verify_checksum(path: &Path, expected: &Checksum) -> Result<(), AcquireError> {
    let actual = file_digest(path, expected.kind)?;
    if actual != expected.digest {
        return Err(AcquireError::ChecksumMismatch {
            path: path.to_path_buf(),
            expected: expected.digest.clone(),
            actual,
        });
    }
    tracing::info!("{} checksum verified for {}", expected.kind, path.display());
    Ok(())
}

fn file_digest(path: &Path, kind: ChecksumType) -> Result<String, AcquireError> {
    let io_err = |source| AcquireError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut file = File::open(path).map_err(io_err)?;

    let digest = match kind {
        ChecksumType::Sha256 => {
            let mut hasher = Sha256::new();
            io::copy(&mut file, &mut hasher).map_err(io_err)?;
            format!("{:x}", hasher.finalize())
        }
        ChecksumType::Sha512 => {
            let mut hasher = Sha512::new();
            io::copy(&mut file, &mut hasher).map_err(io_err)?;
            format!("{:x}", hasher.finalize())
        }
    };
    Ok(digest)
}

/// Last path segment of a URL, without query or fragment.
pub fn file_name_from_url(url: &str) -> Option<String> {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    let (_, path) = without_query.split_once("://")?;
    let (_, path) = path.split_once('/')?;
    let name = path.rsplit('/').next()?;
    if name.is_empty() || name == "." || name == ".." {
        return None;
    }
    Some(name.to_string())
}

/// Logs download progress at every tenth of the total.
#[derive(Debug)]
pub(crate) struct Progress {
    label: String,
    total: Option<u64>,
    transferred: u64,
    next_report: u64,
}

/// Reporting step when the total size is unknown.
const UNKNOWN_SIZE_STEP: u64 = 64 * 1024 * 1024;

impl Progress {
    pub(crate) fn new(label: impl Into<String>, total: Option<u64>) -> Self {
        let mut progress = Self {
            label: label.into(),
            total: total.filter(|t| *t > 0),
            transferred: 0,
            next_report: 0,
        };
        progress.next_report = progress.step();
        progress
    }

    fn step(&self) -> u64 {
        match self.total {
            Some(total) => (total / 10).max(1),
            None => UNKNOWN_SIZE_STEP,
        }
    }

    pub(crate) fn percentage(&self) -> Option<u8> {
        self.total
            .map(|total| ((self.transferred.min(total) * 100) / total) as u8)
    }

    /// Record `bytes`; returns true when a report was emitted.
    pub(crate) fn advance(&mut self, bytes: u64) -> bool {
        self.transferred += bytes;
        if self.transferred < self.next_report {
            return false;
        }
        while self.next_report <= self.transferred {
            self.next_report += self.step();
        }
        match self.percentage() {
            Some(pct) => tracing::info!(
                "{}: {}% ({} / {} bytes)",
                self.label,
                pct,
                self.transferred,
                self.total.unwrap_or_default()
            ),
            None => tracing::info!("{}: {} bytes", self.label, self.transferred),
        }
        true
    }
}

/// Downloads images from distribution mirrors.
///
/// Mirrors are tried in catalog order and the first one that yields an
/// image with a matching checksum wins. A failed transfer removes its
/// partial file; one left behind by a killed process is truncated on the
/// next attempt.
#[derive(Debug, Clone)]
pub struct Downloader {
    connect_timeout: Duration,
}

impl Default for Downloader {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
        }
    }
}

impl Downloader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn fetch(
        &self,
        distro: &Distribution,
        dest_dir: &Path,
        deadline: Duration,
    ) -> Result<Image, AcquireError> {
        if distro.mirrors.is_empty() {
            return Err(AcquireError::NoMirrors {
                distro: distro.name.clone(),
            });
        }

        fs::create_dir_all(dest_dir).map_err(|source| AcquireError::Io {
            path: dest_dir.to_path_buf(),
            source,
        })?;

        let deadline_at = Instant::now() + deadline;
        let mut attempts = Vec::new();

        for mirror in &distro.mirrors {
            let remaining = deadline_at.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(AcquireError::DeadlineExceeded {
                    distro: distro.name.clone(),
                });
            }

            let file_name = file_name_from_url(&mirror.url)
                .unwrap_or_else(|| format!("{}.iso", distro.name));
            if !distro.matches_file_name(&file_name) {
                tracing::warn!(
                    "{} does not match the '{}' image pattern",
                    file_name,
                    distro.name
                );
            }
            let dest = dest_dir.join(&file_name);

            if let Some(image) = self.reuse_cached(distro, &dest) {
                return Ok(image);
            }

            tracing::info!("downloading {} from {} ({})", file_name, mirror.name, mirror.url);
            match self.download(&mirror.url, &dest, remaining) {
                Ok(size) => {
                    if let Some(expected) = &distro.checksum {
                        if let Err(e) = verify_checksum(&dest, expected) {
                            discard(&dest);
                            attempts.push(format!("{} ({}): {}", mirror.name, mirror.url, e));
                            continue;
                        }
                    }
                    return Ok(Image {
                        path: dest,
                        size_bytes: Some(size),
                        source: SourceKind::Downloaded,
                    });
                }
                Err(e @ AcquireError::Locked { .. }) => return Err(e),
                Err(e) => {
                    tracing::warn!("mirror {} failed: {}", mirror.name, e);
                    attempts.push(format!("{} ({}): {}", mirror.name, mirror.url, e));
                }
            }
        }

        if Instant::now() >= deadline_at {
            return Err(AcquireError::DeadlineExceeded {
                distro: distro.name.clone(),
            });
        }

        Err(AcquireError::AllMirrorsFailed {
            distro: distro.name.clone(),
            attempts,
        })
    }

    /// A previous complete download is reused only if it can be verified.
    fn reuse_cached(&self, distro: &Distribution, dest: &Path) -> Option<Image> {
        let expected = distro.checksum.as_ref()?;
        let meta = fs::metadata(dest).ok().filter(|m| m.is_file())?;
        match verify_checksum(dest, expected) {
            Ok(()) => {
                tracing::info!("reusing cached image {}", dest.display());
                Some(Image {
                    path: dest.to_path_buf(),
                    size_bytes: Some(meta.len()),
                    source: SourceKind::Downloaded,
                })
            }
            Err(e) => {
                tracing::debug!("cached image unusable: {}", e);
                None
            }
        }
    }

    fn download(&self, url: &str, dest: &Path, timeout: Duration) -> Result<u64, AcquireError> {
        let part = part_path(dest);
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&part)
            .map_err(|source| AcquireError::Io {
                path: part.clone(),
                source,
            })?;
        file.try_lock_exclusive()
            .map_err(|_| AcquireError::Locked { path: part.clone() })?;

        let result = self.transfer(url, dest, &part, &mut file, timeout);
        if let Err(e) = FileExt::unlock(&file) {
            tracing::warn!("unlocking {}: {}", part.display(), e);
        }
        drop(file);

        let renamed = result.and_then(|written| {
            fs::rename(&part, dest)
                .map(|()| written)
                .map_err(|source| AcquireError::Io {
                    path: dest.to_path_buf(),
                    source,
                })
        });
        if renamed.is_err() {
            discard(&part);
        }
        renamed
    }

    /// Stream `url` into the locked `file`.
    fn transfer(
        &self,
        url: &str,
        dest: &Path,
        part: &Path,
        file: &mut File,
        timeout: Duration,
    ) -> Result<u64, AcquireError> {
        let io_err = |source| AcquireError::Io {
            path: part.to_path_buf(),
            source,
        };
        file.set_len(0).map_err(io_err)?;

        let agent = ureq::AgentBuilder::new()
            .timeout_connect(self.connect_timeout.min(timeout))
            .timeout(timeout)
            .build();

        let response = agent
            .get(url)
            .call()
            .map_err(|e| io_err(io::Error::new(io::ErrorKind::Other, e.to_string())))?;

        let total = response
            .header("Content-Length")
            .and_then(|v| v.trim().parse::<u64>().ok());
        let label = dest
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| url.to_string());

        let mut reader = response.into_reader();
        let written = copy_with_progress(&mut reader, &mut *file, Progress::new(label, total))
            .map_err(io_err)?;
        file.sync_all().map_err(io_err)?;

        if let Some(total) = total {
            if written != total {
                return Err(io_err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("expected {total} bytes, received {written}"),
                )));
            }
        }
        Ok(written)
    }
}

/// Remove a partial or rejected download.
fn discard(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            tracing::warn!("removing {}: {}", path.display(), e);
        }
    }
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_os_string();
    name.push(".part");
    PathBuf::from(name)
}

fn copy_with_progress<R: Read, W: Write>(
    reader: &mut R,
    writer: &mut W,
    mut progress: Progress,
) -> io::Result<u64> {
    let mut buf = vec![0u8; 256 * 1024];
    let mut written = 0u64;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        writer.write_all(&buf[..n])?;
        written += n as u64;
        progress.advance(n as u64);
    }
    writer.flush()?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Catalog, Mirror};
    use std::io::{BufRead, BufReader};
    use std::net::TcpListener;
    use std::thread;
    use tempfile::TempDir;

    fn sha256_hex(data: &[u8]) -> String {
        format!("{:x}", Sha256::digest(data))
    }

    fn distro_with(mirrors: Vec<Mirror>, checksum: Option<Checksum>) -> Distribution {
        let catalog = Catalog::from_json_str(
            r#"{ "core": { "match_pattern": "^core.*\\.iso$" } }"#,
            Path::new("."),
        )
        .unwrap();
        let mut distro = catalog.get("core").unwrap().clone();
        distro.mirrors = mirrors;
        distro.checksum = checksum;
        distro
    }

    /// Serve `body` once over HTTP/1.1 on a loopback port.
    fn serve_once(body: &'static [u8]) -> String {
        serve_once_declaring(body, body.len())
    }

    /// Like [`serve_once`] but announce `length` bytes.
    fn serve_once_declaring(body: &'static [u8], length: usize) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut line = String::new();
            while reader.read_line(&mut line).unwrap() > 0 {
                if line == "\r\n" {
                    break;
                }
                line.clear();
            }
            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                length
            );
            stream.write_all(head.as_bytes()).unwrap();
            stream.write_all(body).unwrap();
        });
        format!("http://{}/images/core-1.0.iso", addr)
    }

    fn refused_url() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("http://{}/core-1.0.iso", addr)
    }

    #[test]
    fn test_local_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("core.iso");
        fs::write(&path, b"ISO").unwrap();

        let image = local(&path).unwrap();
        assert_eq!(image.size_bytes, Some(3));
        assert_eq!(image.source, SourceKind::LocalFile);
    }

    #[test]
    fn test_local_rejects_directory_and_missing() {
        let temp = TempDir::new().unwrap();
        assert!(matches!(
            local(temp.path()),
            Err(AcquireError::NotFound { .. })
        ));
        assert!(matches!(
            local(&temp.path().join("missing.iso")),
            Err(AcquireError::NotFound { .. })
        ));
    }

    #[test]
    fn test_verify_checksum() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("core.iso");
        fs::write(&path, b"hello").unwrap();

        let good = Checksum {
            kind: ChecksumType::Sha256,
            digest: sha256_hex(b"hello"),
        };
        assert!(verify_checksum(&path, &good).is_ok());

        let bad = Checksum {
            kind: ChecksumType::Sha256,
            digest: sha256_hex(b"other"),
        };
        assert!(matches!(
            verify_checksum(&path, &bad),
            Err(AcquireError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_file_name_from_url() {
        assert_eq!(
            file_name_from_url("https://host/pub/core-14.iso?mirror=1").as_deref(),
            Some("core-14.iso")
        );
        assert_eq!(file_name_from_url("https://host/"), None);
        assert_eq!(file_name_from_url("https://host"), None);
        assert_eq!(file_name_from_url("not a url"), None);
    }

    #[test]
    fn test_progress_reports_every_tenth() {
        let mut progress = Progress::new("core.iso", Some(100));
        assert!(!progress.advance(5));
        assert!(progress.advance(5));
        assert_eq!(progress.percentage(), Some(10));
        assert!(progress.advance(35));
        assert!(!progress.advance(1));
        assert_eq!(progress.percentage(), Some(46));
    }

    #[test]
    fn test_progress_unknown_total() {
        let mut progress = Progress::new("core.iso", None);
        assert_eq!(progress.percentage(), None);
        assert!(!progress.advance(1024));
        assert!(progress.advance(UNKNOWN_SIZE_STEP));
    }

    #[test]
    fn test_fetch_without_mirrors() {
        let temp = TempDir::new().unwrap();
        let distro = distro_with(vec![], None);
        assert!(matches!(
            Downloader::new().fetch(&distro, temp.path(), Duration::from_secs(5)),
            Err(AcquireError::NoMirrors { .. })
        ));
    }

    #[test]
    fn test_fetch_falls_back_to_second_mirror() {
        const BODY: &[u8] = b"pretend this is an iso9660 image";
        let temp = TempDir::new().unwrap();
        let distro = distro_with(
            vec![
                Mirror {
                    name: "dead".to_string(),
                    url: refused_url(),
                },
                Mirror {
                    name: "live".to_string(),
                    url: serve_once(BODY),
                },
            ],
            Some(Checksum {
                kind: ChecksumType::Sha256,
                digest: sha256_hex(BODY),
            }),
        );

        let image = Downloader::new()
            .fetch(&distro, temp.path(), Duration::from_secs(30))
            .unwrap();
        assert_eq!(image.source, SourceKind::Downloaded);
        assert_eq!(image.path, temp.path().join("core-1.0.iso"));
        assert_eq!(image.size_bytes, Some(BODY.len() as u64));
        assert_eq!(fs::read(&image.path).unwrap(), BODY);
        assert!(!temp.path().join("core-1.0.iso.part").exists());
    }

    #[test]
    fn test_fetch_reports_every_failed_mirror() {
        let temp = TempDir::new().unwrap();
        let distro = distro_with(
            vec![
                Mirror {
                    name: "a".to_string(),
                    url: refused_url(),
                },
                Mirror {
                    name: "b".to_string(),
                    url: refused_url(),
                },
            ],
            None,
        );
        match Downloader::new().fetch(&distro, temp.path(), Duration::from_secs(30)) {
            Err(AcquireError::AllMirrorsFailed { attempts, .. }) => assert_eq!(attempts.len(), 2),
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(!temp.path().join("core-1.0.iso.part").exists());
    }

    #[test]
    fn test_fetch_removes_short_download() {
        let temp = TempDir::new().unwrap();
        let distro = distro_with(
            vec![Mirror {
                name: "short".to_string(),
                url: serve_once_declaring(b"only part of it", 4096),
            }],
            None,
        );

        let result = Downloader::new()
            .with_connect_timeout(Duration::from_secs(2))
            .fetch(&distro, temp.path(), Duration::from_secs(30));
        assert!(matches!(result, Err(AcquireError::AllMirrorsFailed { .. })));
        assert!(!temp.path().join("core-1.0.iso").exists());
        assert!(!temp.path().join("core-1.0.iso.part").exists());
    }

    #[test]
    fn test_fetch_removes_image_with_bad_checksum() {
        const BODY: &[u8] = b"tampered";
        let temp = TempDir::new().unwrap();
        let distro = distro_with(
            vec![Mirror {
                name: "evil".to_string(),
                url: serve_once(BODY),
            }],
            Some(Checksum {
                kind: ChecksumType::Sha256,
                digest: sha256_hex(b"genuine"),
            }),
        );

        let result = Downloader::new().fetch(&distro, temp.path(), Duration::from_secs(30));
        assert!(matches!(result, Err(AcquireError::AllMirrorsFailed { .. })));
        assert!(!temp.path().join("core-1.0.iso").exists());
    }

    #[test]
    fn test_fetch_reuses_verified_cache() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("core-1.0.iso"), b"cached").unwrap();
        let distro = distro_with(
            vec![Mirror {
                name: "dead".to_string(),
                url: refused_url(),
            }],
            Some(Checksum {
                kind: ChecksumType::Sha256,
                digest: sha256_hex(b"cached"),
            }),
        );
        let image = Downloader::new()
            .fetch(&distro, temp.path(), Duration::from_secs(5))
            .unwrap();
        assert_eq!(image.size_bytes, Some(6));
    }
}
