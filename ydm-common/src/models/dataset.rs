//! Dataset, image and annotation records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::job::JobStatus;

/// Normalized YOLO bounding box; every coordinate lies in `[0, 1]`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub center_x: f64,
    pub center_y: f64,
    pub width: f64,
    pub height: f64,
}

/// One labelled object in an image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub class_id: u32,
    pub class_name: String,
    pub bbox: BoundingBox,
}

impl Annotation {
    /// Render back to a YOLO label line
    pub fn to_line(&self) -> String {
        format!(
            "{} {} {} {} {}",
            self.class_id, self.bbox.center_x, self.bbox.center_y, self.bbox.width, self.bbox.height
        )
    }
}

/// Image metadata row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Image {
    pub id: Uuid,
    pub dataset_id: Uuid,
    /// Base name, e.g. `img1.jpg`
    pub filename: String,
    /// Path inside the images archive
    pub relative_path: String,
    pub width: u32,
    pub height: u32,
    pub file_size_bytes: u64,
    pub storage_location: String,
    pub annotations: Vec<Annotation>,
    pub annotation_count: u32,
    pub processed_at: DateTime<Utc>,
}

/// Per-class summary on a dataset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassInfo {
    pub id: u32,
    pub name: String,
    /// Annotations carrying this class
    pub count: u64,
}

/// min / max / mean over the accepted images
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimensionStats {
    pub min: u32,
    pub max: u32,
    pub avg: u32,
}

/// Aggregates over the accepted images
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetStats {
    pub total_images: u64,
    pub total_annotations: u64,
    pub classes_count: u32,
    pub dataset_size_bytes: u64,
    pub avg_annotations_per_image: f64,
    pub width: DimensionStats,
    pub height: DimensionStats,
    /// Entries dropped by per-item validation
    pub skipped_entries: u64,
}

/// Storage prefixes of a dataset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageLayout {
    pub images_path: String,
    pub labels_path: String,
    pub config_path: String,
}

impl StorageLayout {
    pub fn for_dataset(dataset_id: Uuid) -> Self {
        let root = Self::root(dataset_id);
        Self {
            images_path: format!("{}/images", root),
            labels_path: format!("{}/labels", root),
            config_path: format!("{}/config/dataset.yaml", root),
        }
    }

    /// Prefix owning every blob of a dataset
    pub fn root(dataset_id: Uuid) -> String {
        format!("datasets/{}", dataset_id)
    }
}

/// Published dataset document; written only after every image row exists
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub id: Uuid,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub import_job_id: Uuid,
    pub stats: DatasetStats,
    pub classes: Vec<ClassInfo>,
    pub storage: StorageLayout,
}

/// Pagination metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaginationInfo {
    pub page: u32,
    pub limit: u32,
    pub total_items: u64,
    pub total_pages: u64,
    pub has_next: bool,
    pub has_prev: bool,
}

impl PaginationInfo {
    pub fn new(page: u32, limit: u32, total_items: u64) -> Self {
        let limit_u64 = u64::from(limit.max(1));
        let total_pages = total_items.div_ceil(limit_u64);
        Self {
            page,
            limit,
            total_items,
            total_pages,
            has_next: u64::from(page) < total_pages,
            has_prev: page > 1,
        }
    }

    /// Row offset of the first item on this page
    pub fn offset(&self) -> u64 {
        u64::from(self.page.saturating_sub(1)) * u64::from(self.limit)
    }
}

/// A page of items
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub pagination: PaginationInfo,
}

/// Direction of a listing sort
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    pub fn as_sql(self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

/// Image listing sort keys
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageSortField {
    #[default]
    Filename,
    Width,
    Height,
    FileSizeBytes,
    AnnotationCount,
    ProcessedAt,
}

impl ImageSortField {
    /// Column of the `images` table
    pub fn column(self) -> &'static str {
        match self {
            ImageSortField::Filename => "filename",
            ImageSortField::Width => "width",
            ImageSortField::Height => "height",
            ImageSortField::FileSizeBytes => "file_size_bytes",
            ImageSortField::AnnotationCount => "annotation_count",
            ImageSortField::ProcessedAt => "processed_at",
        }
    }
}

/// Which images of a dataset to list, and in what order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageFilter {
    /// Only images with at least one annotation of this class
    pub class_name: Option<String>,
    pub has_annotations: Option<bool>,
    pub sort_by: ImageSortField,
    pub sort_order: SortOrder,
}

impl Default for ImageFilter {
    fn default() -> Self {
        Self {
            class_name: None,
            has_annotations: None,
            sort_by: ImageSortField::Filename,
            sort_order: SortOrder::Asc,
        }
    }
}

/// Dataset listing sort keys
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetSortField {
    #[default]
    CreatedAt,
    CompletedAt,
    Name,
}

impl DatasetSortField {
    /// Column of the `datasets` table
    pub fn column(self) -> &'static str {
        match self {
            DatasetSortField::CreatedAt => "created_at",
            DatasetSortField::CompletedAt => "completed_at",
            DatasetSortField::Name => "name",
        }
    }
}

/// Which datasets to list; newest first unless told otherwise
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetFilter {
    pub status: Option<JobStatus>,
    pub sort_by: DatasetSortField,
    pub sort_order: SortOrder,
}

impl Default for DatasetFilter {
    fn default() -> Self {
        Self {
            status: None,
            sort_by: DatasetSortField::CreatedAt,
            sort_order: SortOrder::Desc,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn annotation_renders_five_fields() {
        let annotation = Annotation {
            class_id: 0,
            class_name: "person".to_string(),
            bbox: BoundingBox {
                center_x: 0.5,
                center_y: 0.5,
                width: 0.2,
                height: 0.3,
            },
        };
        assert_eq!(annotation.to_line(), "0 0.5 0.5 0.2 0.3");
    }

    #[test]
    fn storage_layout_lives_under_dataset_prefix() {
        let id = Uuid::new_v4();
        let layout = StorageLayout::for_dataset(id);
        let root = StorageLayout::root(id);
        assert!(layout.images_path.starts_with(&root));
        assert!(layout.labels_path.starts_with(&root));
        assert_eq!(layout.config_path, format!("{}/config/dataset.yaml", root));
    }

    #[test]
    fn listing_defaults() {
        let images = ImageFilter::default();
        assert_eq!(images.sort_by.column(), "filename");
        assert_eq!(images.sort_order.as_sql(), "ASC");

        let datasets = DatasetFilter::default();
        assert_eq!(datasets.sort_by.column(), "created_at");
        assert_eq!(datasets.sort_order, SortOrder::Desc);

        let field: ImageSortField = serde_json::from_str("\"annotation_count\"").unwrap();
        assert_eq!(field.column(), "annotation_count");
    }

    #[test]
    fn pagination_math() {
        let info = PaginationInfo::new(2, 50, 120);
        assert_eq!(info.total_pages, 3);
        assert!(info.has_next);
        assert!(info.has_prev);
        assert_eq!(info.offset(), 50);

        let last = PaginationInfo::new(3, 50, 120);
        assert!(!last.has_next);

        let empty = PaginationInfo::new(1, 50, 0);
        assert_eq!(empty.total_pages, 0);
        assert!(!empty.has_next);
        assert!(!empty.has_prev);
    }
}
