use serde::{Deserialize, Serialize};

/// Axis-aligned face region in integer pixel coordinates.
///
/// Width and height are always non-zero; use [`BoundingBox::new`] to build one
/// from untrusted detector output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    /// Returns `None` for degenerate (zero-width or zero-height) boxes.
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Option<Self> {
        if width == 0 || height == 0 {
            return None;
        }
        Some(Self {
            x,
            y,
            width,
            height,
        })
    }

    pub fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    pub fn right(&self) -> i64 {
        i64::from(self.x) + i64::from(self.width)
    }

    pub fn bottom(&self) -> i64 {
        i64::from(self.y) + i64::from(self.height)
    }

    /// Intersection-over-Union with another box, in [0, 1].
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = i64::from(self.x.max(other.x));
        let y1 = i64::from(self.y.max(other.y));
        let x2 = self.right().min(other.right());
        let y2 = self.bottom().min(other.bottom());

        let inter_w = (x2 - x1).max(0) as u64;
        let inter_h = (y2 - y1).max(0) as u64;
        let inter_area = inter_w * inter_h;

        let union_area = self.area() + other.area() - inter_area;
        if union_area > 0 {
            (inter_area as f64 / union_area as f64) as f32
        } else {
            0.0
        }
    }
}

/// Face embedding vector (512-dimensional for the bundled ArcFace model).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar. Zero vectors have
    /// similarity 0 with everything.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }

    /// Cosine distance `1 - similarity`, in [0, 2].
    pub fn cosine_distance(&self, other: &Embedding) -> f32 {
        (1.0 - self.similarity(other)).max(0.0)
    }
}

/// One surviving detection in a frame, ready for matching.
#[derive(Debug, Clone)]
pub struct FaceCandidate {
    pub bbox: BoundingBox,
    /// Crop quality in [0, 1] as scored by the quality gate.
    pub quality: f32,
    /// `None` when the crop was rejected before extraction or extraction failed.
    pub embedding: Option<Embedding>,
}

/// An accepted identity for one candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceMatch {
    pub identity_key: String,
    /// Display confidence, `(1 - distance) * 100`.
    pub confidence: f32,
    pub distance: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

/// Recognition outcome for a single surviving candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameEntry {
    #[serde(rename = "box")]
    pub bbox: BoundingBox,
    #[serde(rename = "match")]
    pub matched: Option<FaceMatch>,
}

/// Per-frame recognition result, one entry per candidate in suppression order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FrameResult {
    pub entries: Vec<FrameEntry>,
}

impl FrameResult {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Identity keys of accepted matches, in frame order.
    pub fn matched_identities(&self) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .filter_map(|e| e.matched.as_ref().map(|m| m.identity_key.as_str()))
    }
}

/// Enrichment record returned by an [`IdentityDirectory`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub key: String,
    pub display_name: String,
}

/// Read-only lookup of enrolled identities. Used for display only, never for
/// matching decisions.
pub trait IdentityDirectory {
    fn lookup(&self, key: &str) -> Option<IdentityRecord>;
}
