//! CSV catalog input/output.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use cif_core::CatalogRow;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog io error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("csv error in {}: {source}", path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("column '{column}' not found in {}; available: {available:?}", path.display())]
    MissingColumn {
        path: PathBuf,
        column: String,
        available: Vec<String>,
    },
}

/// Input column names. Lookup is case-insensitive and falls back to the
/// lowercase generic names (`title`, `vendor`, `sku`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnNames {
    pub title: String,
    pub vendor: String,
    pub sku: String,
    pub image_url: String,
    /// Optional column receiving the accepted image's title text.
    pub image_alt_text: Option<String>,
}

impl Default for ColumnNames {
    fn default() -> Self {
        Self {
            title: "Title".to_string(),
            vendor: "Vendor".to_string(),
            sku: "Variant SKU".to_string(),
            image_url: "image_url".to_string(),
            image_alt_text: None,
        }
    }
}

fn find_column(headers: &[String], wanted: &str, fallback: &str) -> Option<usize> {
    [wanted, fallback].iter().find_map(|name| {
        headers
            .iter()
            .position(|h| h.trim().eq_ignore_ascii_case(name.trim()))
    })
}

fn find_or_append_column(headers: &mut Vec<String>, wanted: &str, fallback: &str) -> usize {
    find_column(headers, wanted, fallback).unwrap_or_else(|| {
        headers.push(wanted.to_string());
        headers.len() - 1
    })
}

#[derive(Debug, Clone)]
pub struct Catalog {
    headers: Vec<String>,
    records: Vec<Vec<String>>,
    title_col: usize,
    vendor_col: Option<usize>,
    sku_col: Option<usize>,
    image_col: usize,
    alt_col: Option<usize>,
}

impl Catalog {
    pub fn read(path: impl AsRef<Path>, columns: &ColumnNames) -> Result<Self, CatalogError> {
        let path = path.as_ref();
        let csv_err = |source| CatalogError::Csv {
            path: path.to_path_buf(),
            source,
        };
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(path)
            .map_err(csv_err)?;

        let mut headers: Vec<String> = reader
            .headers()
            .map_err(csv_err)?
            .iter()
            .map(|h| h.trim_start_matches('\u{feff}').to_string())
            .collect();

        let title_col = find_column(&headers, &columns.title, "title").ok_or_else(|| {
            CatalogError::MissingColumn {
                path: path.to_path_buf(),
                column: columns.title.clone(),
                available: headers.clone(),
            }
        })?;
        let vendor_col = find_column(&headers, &columns.vendor, "vendor");
        let sku_col = find_column(&headers, &columns.sku, "sku");
        let image_col = find_or_append_column(&mut headers, &columns.image_url, "image_url");
        let alt_col = columns
            .image_alt_text
            .as_deref()
            .map(|name| find_or_append_column(&mut headers, name, name));

        let mut records = Vec::new();
        for record in reader.records() {
            let record = record.map_err(csv_err)?;
            let mut fields: Vec<String> = record.iter().map(ToString::to_string).collect();
            // ragged rows are padded; extra trailing fields are kept as-is
            if fields.len() < headers.len() {
                fields.resize(headers.len(), String::new());
            }
            records.push(fields);
        }

        Ok(Self {
            headers,
            records,
            title_col,
            vendor_col,
            sku_col,
            image_col,
            alt_col,
        })
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn field(&self, record: &[String], col: Option<usize>) -> String {
        col.and_then(|c| record.get(c))
            .map(|v| v.trim().to_string())
            .unwrap_or_default()
    }

    /// Rows with 1-based indices matching data line order.
    pub fn rows(&self) -> Vec<CatalogRow> {
        self.records
            .iter()
            .enumerate()
            .map(|(i, record)| {
                let mut row = CatalogRow::new(
                    i + 1,
                    self.field(record, Some(self.title_col)),
                    self.field(record, self.vendor_col),
                    self.field(record, self.sku_col),
                );
                let image = self.field(record, Some(self.image_col));
                row.image_url = (!image.is_empty()).then_some(image);
                row
            })
            .collect()
    }

    pub fn image_url(&self, index: usize) -> Option<&str> {
        index
            .checked_sub(1)
            .and_then(|i| self.records.get(i))
            .and_then(|r| r.get(self.image_col))
            .map(String::as_str)
    }

    /// Set the image URL of the 1-based row `index`. Returns false if out of range.
    pub fn set_image_url(&mut self, index: usize, url: &str) -> bool {
        let col = self.image_col;
        match index.checked_sub(1).and_then(|i| self.records.get_mut(i)) {
            Some(record) => {
                record[col] = url.to_string();
                true
            }
            None => false,
        }
    }

    /// Set the alt text of the 1-based row `index`. Returns false if out of
    /// range or no alt text column is configured.
    pub fn set_image_alt_text(&mut self, index: usize, text: &str) -> bool {
        let Some(col) = self.alt_col else {
            return false;
        };
        match index.checked_sub(1).and_then(|i| self.records.get_mut(i)) {
            Some(record) => {
                record[col] = text.to_string();
                true
            }
            None => false,
        }
    }

    pub fn image_alt_text(&self, index: usize) -> Option<&str> {
        let col = self.alt_col?;
        index
            .checked_sub(1)
            .and_then(|i| self.records.get(i))
            .and_then(|r| r.get(col))
            .map(String::as_str)
    }

    /// Write the full catalog to `path` via a sibling temp file and rename.
    pub fn write_atomic(&self, path: impl AsRef<Path>) -> Result<(), CatalogError> {
        let path = path.as_ref();
        let io_err = |source| CatalogError::Io {
            path: path.to_path_buf(),
            source,
        };
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir).map_err(io_err)?;

        let mut temp = NamedTempFile::new_in(dir).map_err(io_err)?;
        {
            let mut writer = csv::WriterBuilder::new()
                .flexible(true)
                .from_writer(&mut temp);
            writer.write_record(&self.headers).map_err(|source| CatalogError::Csv {
                path: path.to_path_buf(),
                source,
            })?;
            for record in &self.records {
                writer.write_record(record).map_err(|source| CatalogError::Csv {
                    path: path.to_path_buf(),
                    source,
                })?;
            }
            writer.flush().map_err(io_err)?;
        }
        temp.flush().map_err(io_err)?;
        temp.as_file().sync_all().map_err(io_err)?;
        temp.persist(path).map_err(|e| io_err(e.error))?;
        Ok(())
    }
}

/// `catalog.csv` -> `catalog_backup.csv` next to the input.
pub fn backup_path_for(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "catalog".to_string());
    let ext = input
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    input.with_file_name(format!("{stem}_backup{ext}"))
}

pub fn backup_catalog(input: &Path) -> Result<PathBuf, CatalogError> {
    let backup = backup_path_for(input);
    fs::copy(input, &backup).map_err(|source| CatalogError::Io {
        path: backup.clone(),
        source,
    })?;
    Ok(backup)
}
