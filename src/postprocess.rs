use crate::{
    config::{ModelConfig, ModelFamily},
    detection::BoundingBox,
    imaging::Letterbox,
    model_service::ModelError,
};
use ndarray::{ArrayView2, ArrayViewD, Axis, Ix3};

fn intersection(box1: &BoundingBox, box2: &BoundingBox) -> f32 {
    let width = (box1.x2.min(box2.x2) - box1.x1.max(box2.x1)).max(0.);
    let height = (box1.y2.min(box2.y2) - box1.y1.max(box2.y1)).max(0.);
    width * height
}

fn union(box1: &BoundingBox, box2: &BoundingBox) -> f32 {
    box1.area() + box2.area() - intersection(box1, box2)
}

fn restore(bbox: &BoundingBox, letterbox: &Letterbox) -> BoundingBox {
    BoundingBox {
        x1: letterbox.restore_x(bbox.x1),
        y1: letterbox.restore_y(bbox.y1),
        x2: letterbox.restore_x(bbox.x2),
        y2: letterbox.restore_y(bbox.y2),
        ..*bbox
    }
}

pub fn iou(box1: &BoundingBox, box2: &BoundingBox) -> f32 {
    let union = union(box1, box2);
    if union <= 0. {
        return 0.;
    }
    intersection(box1, box2) / union
}

/// Turns raw detector output into final boxes in original image pixels.
#[derive(Debug, Clone)]
pub struct Postprocessor {
    pub family: ModelFamily,
    pub min_probability: f32,
    pub iou_threshold: f32,
    pub agnostic_nms: bool,
    pub max_detections: usize,
}

impl From<&ModelConfig> for Postprocessor {
    fn from(model_config: &ModelConfig) -> Self {
        Self {
            family: model_config.family,
            min_probability: model_config.min_probability,
            iou_threshold: model_config.iou_threshold,
            agnostic_nms: model_config.agnostic_nms,
            max_detections: model_config.max_detections,
        }
    }
}

impl Postprocessor {
    /// Boxes come back in original image pixels, clipped to the image.
    pub fn process(
        &self,
        output: ArrayViewD<'_, f32>,
        letterbox: &Letterbox,
    ) -> Result<Vec<BoundingBox>, ModelError> {
        let candidates = self.decode(output)?;
        Ok(self
            .non_max_suppression(candidates)
            .iter()
            .map(|bbox| restore(bbox, letterbox))
            .collect())
    }

    /// Rows of `[xc, yc, w, h, (objectness), scores...]`, one per anchor.
    fn rows<'a>(&self, output: ArrayViewD<'a, f32>) -> Result<ArrayView2<'a, f32>, ModelError> {
        let shape = output.shape().to_vec();
        let min_width = match self.family {
            ModelFamily::Yolov5 => 6,
            ModelFamily::Yolov8 => 5,
        };

        let output = output
            .into_dimensionality::<Ix3>()
            .map_err(|_| ModelError::OutputShape(shape.clone()))?;
        if output.shape()[0] != 1 {
            return Err(ModelError::OutputShape(shape));
        }
        let output = output.index_axis_move(Axis(0), 0);

        let rows = match self.family {
            ModelFamily::Yolov5 => output,
            ModelFamily::Yolov8 => output.reversed_axes(),
        };
        if rows.shape()[1] < min_width {
            return Err(ModelError::OutputShape(shape));
        }

        Ok(rows)
    }

    /// Candidate boxes in network input coordinates.
    fn decode(&self, output: ArrayViewD<'_, f32>) -> Result<Vec<BoundingBox>, ModelError> {
        let rows = self.rows(output)?;
        let score_offset = match self.family {
            ModelFamily::Yolov5 => 5,
            ModelFamily::Yolov8 => 4,
        };

        let mut boxes = Vec::new();
        for row in rows.axis_iter(Axis(0)) {
            let objectness = match self.family {
                ModelFamily::Yolov5 => row[4],
                ModelFamily::Yolov8 => 1.,
            };
            if objectness < self.min_probability {
                continue;
            }

            let (class_id, score) = row
                .iter()
                .skip(score_offset)
                .copied()
                .enumerate()
                .reduce(|accum, item| if item.1 > accum.1 { item } else { accum })
                .ok_or_else(|| ModelError::OutputShape(rows.shape().to_vec()))?;

            let confidence = objectness * score;
            if confidence < self.min_probability {
                continue;
            }

            let (xc, yc, w, h) = (row[0], row[1], row[2], row[3]);

            boxes.push(BoundingBox {
                class_id,
                confidence,
                x1: xc - w / 2.,
                y1: yc - h / 2.,
                x2: xc + w / 2.,
                y2: yc + h / 2.,
            });
        }

        Ok(boxes)
    }

    /// Greedy NMS, highest confidence first. The sort is stable so equal
    /// scores keep their anchor order.
    pub fn non_max_suppression(&self, mut boxes: Vec<BoundingBox>) -> Vec<BoundingBox> {
        boxes.sort_by(|box1, box2| box2.confidence.total_cmp(&box1.confidence));

        let mut result: Vec<BoundingBox> = Vec::new();
        for candidate in boxes {
            if result.len() >= self.max_detections {
                break;
            }
            let suppressed = result.iter().any(|kept| {
                (self.agnostic_nms || kept.class_id == candidate.class_id)
                    && iou(kept, &candidate) > self.iou_threshold
            });
            if !suppressed {
                result.push(candidate);
            }
        }

        result
    }
}
