use serde::{Deserialize, Serialize};

/// Corner-form box in original image pixels, as produced by postprocessing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub class_id: usize,
    pub confidence: f32,
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.) * (self.y2 - self.y1).max(0.)
    }
}

/// One detected object as returned to clients. Keys follow the centre/size
/// record layout: `xcenter, ycenter, width, height, confidence, class, name`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub xcenter: f32,
    pub ycenter: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    #[serde(rename = "class")]
    pub class_id: usize,
    pub name: String,
}

impl Detection {
    pub fn from_box(bbox: &BoundingBox, name: String) -> Self {
        Self {
            xcenter: (bbox.x1 + bbox.x2) / 2.,
            ycenter: (bbox.y1 + bbox.y2) / 2.,
            width: bbox.x2 - bbox.x1,
            height: bbox.y2 - bbox.y1,
            confidence: bbox.confidence,
            class_id: bbox.class_id,
            name,
        }
    }
}
