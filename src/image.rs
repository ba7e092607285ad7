//! Firmware image description.
//!
//! An image for these targets is not one file but a set of binaries laid out
//! at fixed flash offsets: second-stage bootloader, partition table,
//! application, and an optional filesystem. The core only validates presence
//! and sizes; building and interpreting the binaries is out of scope.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Conventional ESP32-S3 layout offsets.
pub const OFFSET_BOOTLOADER: u32 = 0x0000;
pub const OFFSET_PARTITIONS: u32 = 0x8000;
pub const OFFSET_APPLICATION: u32 = 0x1_0000;
pub const OFFSET_FILESYSTEM: u32 = 0x21_0000;

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("image part missing: {0}")]
    Missing(PathBuf),

    #[error("image part empty: {0}")]
    Empty(PathBuf),

    #[error("image has no parts")]
    NoParts,

    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// One binary at a fixed flash offset.
#[derive(Debug, Clone)]
pub struct ImagePart {
    pub offset: u32,
    pub path: PathBuf,
    pub size: u64,
}

/// A validated multi-part firmware image.
#[derive(Debug, Clone)]
pub struct FirmwareImage {
    parts: Vec<ImagePart>,
}

impl FirmwareImage {
    /// Validate and load an image from (offset, path) pairs.
    ///
    /// Each part must exist and be non-empty; parts are kept sorted by
    /// offset so engines can stream them in flash order.
    pub fn from_parts(
        parts: impl IntoIterator<Item = (u32, PathBuf)>,
    ) -> Result<Self, ImageError> {
        let mut loaded = Vec::new();
        for (offset, path) in parts {
            let meta = fs::metadata(&path).map_err(|source| match source.kind() {
                std::io::ErrorKind::NotFound => ImageError::Missing(path.clone()),
                _ => ImageError::Io {
                    path: path.clone(),
                    source,
                },
            })?;
            if meta.len() == 0 {
                return Err(ImageError::Empty(path));
            }
            loaded.push(ImagePart {
                offset,
                path,
                size: meta.len(),
            });
        }
        if loaded.is_empty() {
            return Err(ImageError::NoParts);
        }
        loaded.sort_by_key(|p| p.offset);
        Ok(Self { parts: loaded })
    }

    /// Load the conventional four-part layout from a firmware directory, the
    /// way release tarballs are unpacked: bootloader, partitions, app, and
    /// filesystem binaries named `<stem>.bootloader.bin` etc.
    pub fn from_dir(dir: &Path, stem: &str) -> Result<Self, ImageError> {
        Self::from_parts([
            (OFFSET_BOOTLOADER, dir.join(format!("{stem}.bootloader.bin"))),
            (OFFSET_PARTITIONS, dir.join(format!("{stem}.partitions.bin"))),
            (OFFSET_APPLICATION, dir.join(format!("{stem}.bin"))),
            (OFFSET_FILESYSTEM, dir.join(format!("{stem}.filesystem.bin"))),
        ])
    }

    /// Single application binary at the app offset.
    pub fn single(path: PathBuf) -> Result<Self, ImageError> {
        Self::from_parts([(OFFSET_APPLICATION, path)])
    }

    /// Load an image from a path handed over a Start command: a directory
    /// means the conventional four-part layout (stem detected from the
    /// `*.bootloader.bin` file inside), a file means a single app binary.
    pub fn load(path: &Path) -> Result<Self, ImageError> {
        if !path.is_dir() {
            return Self::single(path.to_path_buf());
        }
        let entries = fs::read_dir(path).map_err(|source| ImageError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let stem = entries
            .flatten()
            .filter_map(|e| {
                e.file_name()
                    .to_str()
                    .and_then(|n| n.strip_suffix(".bootloader.bin"))
                    .map(String::from)
            })
            .next()
            .ok_or(ImageError::NoParts)?;
        Self::from_dir(path, &stem)
    }

    pub fn parts(&self) -> &[ImagePart] {
        &self.parts
    }

    /// Total payload size across all parts.
    pub fn total_bytes(&self) -> u64 {
        self.parts.iter().map(|p| p.size).sum()
    }
}
