//! Common types used across the pipeline

use crate::error::CommonError;
use serde::{Deserialize, Serialize};

/// Lifecycle of a protocol photo
///
/// `Uploaded -> Queued -> Processing -> {Completed | Failed}`. A transient
/// failure moves a photo from `Processing` back to `Queued`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhotoStatus {
    Uploaded,
    Queued,
    Processing,
    Completed,
    Failed,
}

impl PhotoStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhotoStatus::Uploaded => "uploaded",
            PhotoStatus::Queued => "queued",
            PhotoStatus::Processing => "processing",
            PhotoStatus::Completed => "completed",
            PhotoStatus::Failed => "failed",
        }
    }

    /// Completed or permanently failed
    pub fn is_terminal(&self) -> bool {
        matches!(self, PhotoStatus::Completed | PhotoStatus::Failed)
    }
}

impl std::str::FromStr for PhotoStatus {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uploaded" => Ok(PhotoStatus::Uploaded),
            "queued" => Ok(PhotoStatus::Queued),
            "processing" => Ok(PhotoStatus::Processing),
            "completed" => Ok(PhotoStatus::Completed),
            "failed" => Ok(PhotoStatus::Failed),
            other => Err(CommonError::UnknownVariant {
                kind: "photo status",
                value: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for PhotoStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A rendition generated from an original photo
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DerivativeKind {
    /// 150x150 cover-cropped WebP for lists and grids
    Thumb,
    /// Progressive JPEG, max 1280px wide, for the gallery viewer
    Gallery,
    /// Baseline JPEG, max 960px wide, embedded by the document renderer
    Pdf,
}

impl DerivativeKind {
    pub const ALL: [DerivativeKind; 3] =
        [DerivativeKind::Thumb, DerivativeKind::Gallery, DerivativeKind::Pdf];

    pub fn as_str(&self) -> &'static str {
        match self {
            DerivativeKind::Thumb => "thumb",
            DerivativeKind::Gallery => "gallery",
            DerivativeKind::Pdf => "pdf",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            DerivativeKind::Thumb => "webp",
            DerivativeKind::Gallery | DerivativeKind::Pdf => "jpg",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            DerivativeKind::Thumb => "image/webp",
            DerivativeKind::Gallery | DerivativeKind::Pdf => "image/jpeg",
        }
    }
}

impl std::fmt::Display for DerivativeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One value per derivative kind
///
/// Every completed photo has all three renditions, so hashes, sizes, keys and
/// urls are carried as a fixed triple rather than a map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Renditions<T> {
    pub thumb: T,
    pub gallery: T,
    pub pdf: T,
}

impl<T> Renditions<T> {
    pub fn get(&self, kind: DerivativeKind) -> &T {
        match kind {
            DerivativeKind::Thumb => &self.thumb,
            DerivativeKind::Gallery => &self.gallery,
            DerivativeKind::Pdf => &self.pdf,
        }
    }

    pub fn map<U>(&self, mut f: impl FnMut(DerivativeKind, &T) -> U) -> Renditions<U> {
        Renditions {
            thumb: f(DerivativeKind::Thumb, &self.thumb),
            gallery: f(DerivativeKind::Gallery, &self.gallery),
            pdf: f(DerivativeKind::Pdf, &self.pdf),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (DerivativeKind, &T)> {
        DerivativeKind::ALL.into_iter().map(move |kind| (kind, self.get(kind)))
    }
}
