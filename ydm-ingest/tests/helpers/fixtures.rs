//! Dataset fixtures: tiny encoded images, ZIP archives and config files

use image::{ImageBuffer, ImageFormat, Rgb};
use std::io::{Cursor, Write};
use std::path::Path;
use tempfile::TempDir;
use ydm_common::models::ImportRequest;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Three classes, the layout most tests use
pub const CONFIG: &str = "path: coco\ntrain: images/train\nval: images/val\nnc: 3\nnames: [person, car, bicycle]\n";

fn encode(width: u32, height: u32, format: ImageFormat) -> Vec<u8> {
    let img: ImageBuffer<Rgb<u8>, Vec<u8>> =
        ImageBuffer::from_fn(width, height, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 128]));
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, format).expect("encode fixture image");
    out.into_inner()
}

pub fn jpeg(width: u32, height: u32) -> Vec<u8> {
    encode(width, height, ImageFormat::Jpeg)
}

pub fn png(width: u32, height: u32) -> Vec<u8> {
    encode(width, height, ImageFormat::Png)
}

/// In-memory ZIP archive
pub struct ArchiveBuilder {
    zip: ZipWriter<Cursor<Vec<u8>>>,
}

impl ArchiveBuilder {
    pub fn new() -> Self {
        Self {
            zip: ZipWriter::new(Cursor::new(Vec::new())),
        }
    }

    fn options() -> FileOptions {
        FileOptions::default().compression_method(CompressionMethod::Deflated)
    }

    pub fn dir(mut self, name: &str) -> Self {
        self.zip.add_directory(name, Self::options()).expect("add directory");
        self
    }

    pub fn file(mut self, name: &str, data: impl AsRef<[u8]>) -> Self {
        self.zip.start_file(name, Self::options()).expect("start entry");
        self.zip.write_all(data.as_ref()).expect("write entry");
        self
    }

    pub fn build(mut self) -> Vec<u8> {
        self.zip.finish().expect("finish archive").into_inner()
    }
}

pub fn empty_archive() -> Vec<u8> {
    ArchiveBuilder::new().build()
}

pub fn file_url(path: &Path) -> String {
    reqwest::Url::from_file_path(path)
        .expect("absolute fixture path")
        .to_string()
}

/// Config and archives on local disk, addressed by `file://` URLs
pub struct DatasetFiles {
    pub dir: TempDir,
    pub config_url: String,
    pub images_url: String,
    pub labels_url: String,
}

impl DatasetFiles {
    pub fn request(&self, name: &str) -> ImportRequest {
        ImportRequest {
            name: name.to_string(),
            description: Some("fixture dataset".to_string()),
            config_url: self.config_url.clone(),
            images_url: self.images_url.clone(),
            labels_url: self.labels_url.clone(),
        }
    }
}

pub fn write_dataset(config: &str, images: &[u8], labels: &[u8]) -> DatasetFiles {
    let dir = TempDir::new().expect("fixture dir");
    let config_path = dir.path().join("dataset.yaml");
    let images_path = dir.path().join("images.zip");
    let labels_path = dir.path().join("labels.zip");
    std::fs::write(&config_path, config).expect("write config");
    std::fs::write(&images_path, images).expect("write images");
    std::fs::write(&labels_path, labels).expect("write labels");

    DatasetFiles {
        config_url: file_url(&config_path),
        images_url: file_url(&images_path),
        labels_url: file_url(&labels_path),
        dir,
    }
}
