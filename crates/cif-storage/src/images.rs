//! Image download, validation and collision-safe local storage.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use cif_core::{Candidate, CatalogRow};
use image::ImageFormat;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info};

use crate::{FetchError, HttpFetcher, RetryDisposition};

const SUPPORTED_FORMATS: [ImageFormat; 4] = [
    ImageFormat::Jpeg,
    ImageFormat::Png,
    ImageFormat::WebP,
    ImageFormat::Gif,
];

const MAX_NAME_ATTEMPTS: usize = 1000;
const MAX_SLUG_LEN: usize = 80;

/// Minimum acceptable image, used to reject tracking pixels and placeholders.
#[derive(Debug, Clone, Copy)]
pub struct ImageRules {
    pub min_width: u32,
    pub min_height: u32,
    pub min_bytes: usize,
}

impl Default for ImageRules {
    fn default() -> Self {
        Self {
            min_width: 100,
            min_height: 100,
            min_bytes: 256,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidatedImage {
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
}

impl ValidatedImage {
    pub fn extension(&self) -> &'static str {
        self.format.extensions_str().first().copied().unwrap_or("img")
    }
}

#[derive(Debug, Clone)]
pub struct StoredImage {
    pub path: PathBuf,
    pub sha256: String,
    pub byte_size: usize,
    pub width: u32,
    pub height: u32,
    /// An identical file was already stored under this row's name.
    pub deduplicated: bool,
}

#[derive(Debug, Error)]
pub enum ImageFetchError {
    #[error("download failed for {url}: {message}")]
    Download {
        url: String,
        retryable: bool,
        message: String,
    },
    #[error("invalid image at {url}: {reason}")]
    InvalidImage { url: String, reason: String },
    #[error("filesystem error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        persistent: bool,
        #[source]
        source: io::Error,
    },
}

impl ImageFetchError {
    fn download(url: &str, err: FetchError) -> Self {
        ImageFetchError::Download {
            url: url.to_string(),
            retryable: err.disposition() == RetryDisposition::Retryable,
            message: err.to_string(),
        }
    }

    fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        ImageFetchError::Io {
            path: path.into(),
            persistent: is_persistent_io(&source),
            source,
        }
    }
}

/// Disk full, read-only mounts and permission problems will not fix themselves.
pub fn is_persistent_io(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::StorageFull
            | io::ErrorKind::ReadOnlyFilesystem
            | io::ErrorKind::PermissionDenied
            | io::ErrorKind::NotADirectory
    )
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub fn slugify(input: &str) -> String {
    let slug = input
        .trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    slug.chars().take(MAX_SLUG_LEN).collect::<String>().trim_end_matches('-').to_string()
}

/// Check that bytes decode as a supported raster format of non-trivial size.
pub fn validate_image(bytes: &[u8], rules: &ImageRules) -> Result<ValidatedImage, String> {
    if bytes.len() < rules.min_bytes {
        return Err(format!(
            "{} bytes is below the {} byte minimum",
            bytes.len(),
            rules.min_bytes
        ));
    }
    let format = image::guess_format(bytes).map_err(|e| format!("unrecognized format: {e}"))?;
    if !SUPPORTED_FORMATS.contains(&format) {
        return Err(format!("unsupported format {format:?}"));
    }
    let decoded = image::load_from_memory_with_format(bytes, format)
        .map_err(|e| format!("decode failed: {e}"))?;
    let (width, height) = (decoded.width(), decoded.height());
    if width < rules.min_width || height < rules.min_height {
        return Err(format!(
            "{width}x{height} is below the {}x{} minimum",
            rules.min_width, rules.min_height
        ));
    }
    Ok(ValidatedImage {
        format,
        width,
        height,
    })
}

#[derive(Debug, Clone)]
pub struct ImageStore {
    root: PathBuf,
}

impl ImageStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Filenames to try in order: `{slug}`, `{slug}-{index}`, `{slug}-{index}-{n}`.
    pub fn file_name_candidates(row: &CatalogRow, extension: &str) -> impl Iterator<Item = String> {
        let slug = [row.sku.as_str(), row.title.as_str()]
            .iter()
            .map(|s| slugify(s))
            .find(|s| !s.is_empty())
            .unwrap_or_else(|| format!("row-{}", row.index));
        let index = row.index;
        let extension = extension.to_string();
        (0..MAX_NAME_ATTEMPTS).map(move |n| match n {
            0 => format!("{slug}.{extension}"),
            1 => format!("{slug}-{index}.{extension}"),
            n => format!("{slug}-{index}-{n}.{extension}"),
        })
    }

    /// Write through a scoped temp file, then rename into the first free name.
    /// A name already holding the same bytes is reused instead of suffixed,
    /// so a row refetched after a crash keeps its original file.
    /// The temp file is removed on every failure path.
    pub async fn store(
        &self,
        row: &CatalogRow,
        image: ValidatedImage,
        bytes: Vec<u8>,
    ) -> Result<StoredImage, ImageFetchError> {
        let root = self.root.clone();
        let names: Vec<String> = Self::file_name_candidates(row, image.extension()).collect();
        let join_root = root.clone();
        tokio::task::spawn_blocking(move || store_blocking(&root, &names, image, &bytes))
            .await
            .map_err(|e| ImageFetchError::io(join_root, io::Error::other(e)))?
    }
}

fn store_blocking(
    root: &Path,
    names: &[String],
    image: ValidatedImage,
    bytes: &[u8],
) -> Result<StoredImage, ImageFetchError> {
    std::fs::create_dir_all(root).map_err(|e| ImageFetchError::io(root, e))?;

    let sha256 = sha256_hex(bytes);
    let stored = |path: PathBuf, sha256: String, deduplicated: bool| StoredImage {
        path,
        sha256,
        byte_size: bytes.len(),
        width: image.width,
        height: image.height,
        deduplicated,
    };

    let mut temp = NamedTempFile::new_in(root).map_err(|e| ImageFetchError::io(root, e))?;
    temp.write_all(bytes)
        .and_then(|_| temp.flush())
        .and_then(|_| temp.as_file().sync_all())
        .map_err(|e| ImageFetchError::io(temp.path(), e))?;

    for name in names {
        let dest = root.join(name);
        if holds_same_bytes(&dest, &sha256).map_err(|e| ImageFetchError::io(&dest, e))? {
            debug!(name = %name, "identical image already stored");
            return Ok(stored(dest, sha256, true));
        }
        match temp.persist_noclobber(&dest) {
            Ok(_) => return Ok(stored(dest, sha256, false)),
            Err(err) if err.error.kind() == io::ErrorKind::AlreadyExists => {
                debug!(name = %name, "image name taken, trying next");
                temp = err.file;
            }
            Err(err) => return Err(ImageFetchError::io(dest, err.error)),
        }
    }

    Err(ImageFetchError::io(
        root,
        io::Error::new(io::ErrorKind::AlreadyExists, "no free image file name"),
    ))
}

fn holds_same_bytes(path: &Path, sha256: &str) -> io::Result<bool> {
    if !path.try_exists()? {
        return Ok(false);
    }
    Ok(sha256_hex(&std::fs::read(path)?) == sha256)
}

/// Downloads a chosen candidate, validates it and stores it locally.
#[derive(Debug, Clone)]
pub struct ImageFetcher {
    http: HttpFetcher,
    store: ImageStore,
    rules: ImageRules,
}

impl ImageFetcher {
    pub fn new(http: HttpFetcher, store: ImageStore, rules: ImageRules) -> Self {
        Self { http, store, rules }
    }

    pub fn store(&self) -> &ImageStore {
        &self.store
    }

    pub async fn fetch(
        &self,
        candidate: &Candidate,
        row: &CatalogRow,
    ) -> Result<StoredImage, ImageFetchError> {
        let resp = self
            .http
            .fetch_bytes(&candidate.source_name, &candidate.url)
            .await
            .map_err(|e| ImageFetchError::download(&candidate.url, e))?;

        if let Some(content_type) = resp.content_type.as_deref() {
            if content_type.starts_with("text/") || content_type.contains("json") {
                return Err(ImageFetchError::InvalidImage {
                    url: candidate.url.clone(),
                    reason: format!("content-type {content_type} is not an image"),
                });
            }
        }

        let image = validate_image(&resp.body, &self.rules).map_err(|reason| {
            ImageFetchError::InvalidImage {
                url: candidate.url.clone(),
                reason,
            }
        })?;

        let stored = self.store.store(row, image, resp.body).await?;
        info!(
            path = %stored.path.display(),
            bytes = stored.byte_size,
            width = stored.width,
            height = stored.height,
            deduplicated = stored.deduplicated,
            "stored image"
        );
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};
    use std::io::Cursor;
    use tempfile::tempdir;

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = ImageBuffer::from_fn(width, height, |x, y| {
            Rgb([(x * 7 % 256) as u8, (y * 13 % 256) as u8, ((x ^ y) % 256) as u8])
        });
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .unwrap();
        buf
    }

    #[test]
    fn artifact_hashing_is_stable() {
        let hash = sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn slugify_normalizes_and_truncates() {
        assert_eq!(slugify("  AOR Cortisol-Adapt (120 caps) "), "aor-cortisol-adapt-120-caps");
        assert_eq!(slugify("***"), "");
        assert!(slugify(&"x".repeat(200)).len() <= MAX_SLUG_LEN);
    }

    #[test]
    fn validation_rejects_tracking_pixels_and_non_images() {
        let rules = ImageRules {
            min_bytes: 0,
            ..ImageRules::default()
        };
        let pixel = png_bytes(1, 1);
        assert!(validate_image(&pixel, &rules).unwrap_err().contains("below"));
        assert!(validate_image(b"<html>not an image</html>", &rules).is_err());

        let ok = validate_image(&png_bytes(120, 140), &rules).unwrap();
        assert_eq!(ok.format, ImageFormat::Png);
        assert_eq!((ok.width, ok.height), (120, 140));
        assert_eq!(ok.extension(), "png");
    }

    #[test]
    fn file_names_prefer_sku_then_title_then_index() {
        let row = CatalogRow::new(12, "Vitamin D3", "NOW", "NOW-D3");
        let names: Vec<_> = ImageStore::file_name_candidates(&row, "jpg").take(3).collect();
        assert_eq!(names, vec!["now-d3.jpg", "now-d3-12.jpg", "now-d3-12-2.jpg"]);

        let untitled = CatalogRow::new(5, "", "", "");
        let first = ImageStore::file_name_candidates(&untitled, "png").next().unwrap();
        assert_eq!(first, "row-5.png");
    }

    #[tokio::test]
    async fn store_never_clobbers_and_leaves_no_temp_files() {
        let dir = tempdir().expect("tempdir");
        let store = ImageStore::new(dir.path().join("images"));
        let bytes_a = png_bytes(120, 120);
        let bytes_b = png_bytes(130, 120);
        let rules = ImageRules::default();

        let row_a = CatalogRow::new(1, "Omega 3", "THORNE", "TH-1");
        let row_b = CatalogRow::new(2, "Omega 3 copy", "THORNE", "TH-1");
        let image_a = validate_image(&bytes_a, &rules).unwrap();
        let image_b = validate_image(&bytes_b, &rules).unwrap();
        let first = store.store(&row_a, image_a, bytes_a).await.unwrap();
        let second = store.store(&row_b, image_b, bytes_b).await.unwrap();

        assert_eq!(first.path.file_name().unwrap(), "th-1.png");
        assert_eq!(second.path.file_name().unwrap(), "th-1-2.png");
        assert_ne!(first.sha256, second.sha256);
        assert!(!first.deduplicated && !second.deduplicated);

        let entries: Vec<_> = std::fs::read_dir(store.root())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(entries.len(), 2, "unexpected files: {entries:?}");
    }

    #[tokio::test]
    async fn refetching_identical_bytes_reuses_the_row_file() {
        let dir = tempdir().expect("tempdir");
        let store = ImageStore::new(dir.path().join("images"));
        let bytes = png_bytes(120, 120);
        let image = validate_image(&bytes, &ImageRules::default()).unwrap();
        let row = CatalogRow::new(1, "AOR Cortisol Adapt", "AOR", "AOR123");

        let first = store.store(&row, image, bytes.clone()).await.unwrap();
        let again = store.store(&row, image, bytes).await.unwrap();

        assert_eq!(first.path, again.path);
        assert_eq!(again.path.file_name().unwrap(), "aor123.png");
        assert!(again.deduplicated);
        let entries: Vec<_> = std::fs::read_dir(store.root()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }
}
