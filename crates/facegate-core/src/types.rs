use image::GrayImage;

/// Axis-aligned face region in frame coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceRegion {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

impl FaceRegion {
    pub fn new(x: f32, y: f32, width: f32, height: f32, confidence: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
            confidence,
        }
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Intersection-over-union with another region.
    pub fn iou(&self, other: &FaceRegion) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.area() + other.area() - inter;
        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }

    /// Pixel rectangle `(x, y, w, h)` clamped to an image of the given size.
    ///
    /// Always at least 1×1 so a crop never comes back empty, as long as the
    /// image itself is non-empty.
    pub fn pixel_bounds(&self, img_width: u32, img_height: u32) -> (u32, u32, u32, u32) {
        let max_x = img_width.saturating_sub(1) as f32;
        let max_y = img_height.saturating_sub(1) as f32;

        let x0 = self.x.floor().clamp(0.0, max_x) as u32;
        let y0 = self.y.floor().clamp(0.0, max_y) as u32;
        let x1 = (self.x + self.width).ceil().clamp(0.0, img_width as f32) as u32;
        let y1 = (self.y + self.height).ceil().clamp(0.0, img_height as f32) as u32;

        (x0, y0, x1.saturating_sub(x0).max(1), y1.saturating_sub(y0).max(1))
    }

    /// Copy the region out of a grayscale frame.
    pub fn crop(&self, frame: &GrayImage) -> GrayImage {
        let (x, y, w, h) = self.pixel_bounds(frame.width(), frame.height());
        image::imageops::crop_imm(frame, x, y, w, h).to_image()
    }
}

/// Face embedding vector (512-dimensional for ArcFace w600k_r50).
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model that produced this embedding.
    pub model_version: Option<String>,
}

impl Embedding {
    /// Cosine similarity in [-1, 1]. Zero vectors compare as 0.
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
        if denom > 0.0 {
            dot / denom
        } else {
            0.0
        }
    }

    /// Cosine distance in [0, 2]: `1 - similarity`. Lower means more alike.
    pub fn cosine_distance(&self, other: &Embedding) -> f32 {
        if self.values.len() != other.values.len() {
            return 1.0;
        }
        1.0 - self.similarity(other)
    }
}

/// What the verification oracle says about one (probe, reference) pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VerifyOutcome {
    pub distance: f32,
    /// The oracle's own same-person judgement for this pair.
    pub verified: bool,
}
