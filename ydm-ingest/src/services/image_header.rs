//! Image header reader
//!
//! Reads the format signature and the dimension fields from the header;
//! pixel data is never decoded.

use image::{ImageFormat, ImageReader};
use std::fs::File;
use std::io::{BufRead, BufReader, Seek};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ImageFormatError {
    #[error("unrecognized image format")]
    Unsupported,

    #[error("unreadable image header: {0}")]
    Corrupt(String),
}

impl ImageFormatError {
    pub fn kind(&self) -> &'static str {
        match self {
            ImageFormatError::Unsupported => "unsupported",
            ImageFormatError::Corrupt(_) => "corrupt",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageInfo {
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
}

/// Read format and dimensions from any seekable reader
pub fn read_header<R: BufRead + Seek>(reader: R) -> Result<ImageInfo, ImageFormatError> {
    let reader = ImageReader::new(reader)
        .with_guessed_format()
        .map_err(|e| ImageFormatError::Corrupt(e.to_string()))?;
    let format = reader.format().ok_or(ImageFormatError::Unsupported)?;

    let (width, height) = reader.into_dimensions().map_err(|e| match e {
        image::ImageError::Unsupported(_) => ImageFormatError::Unsupported,
        other => ImageFormatError::Corrupt(other.to_string()),
    })?;
    if width == 0 || height == 0 {
        return Err(ImageFormatError::Corrupt(format!(
            "header declares {}x{} pixels",
            width, height
        )));
    }

    Ok(ImageInfo {
        format,
        width,
        height,
    })
}

pub fn read_header_file(path: &Path) -> Result<ImageInfo, ImageFormatError> {
    let file = File::open(path).map_err(|e| ImageFormatError::Corrupt(e.kind().to_string()))?;
    read_header(BufReader::new(file))
}

/// [`read_header_file`] on the blocking pool
pub async fn read_header_blocking(path: PathBuf) -> Result<ImageInfo, ImageFormatError> {
    tokio::task::spawn_blocking(move || read_header_file(&path))
        .await
        .map_err(|e| ImageFormatError::Corrupt(e.to_string()))?
}
