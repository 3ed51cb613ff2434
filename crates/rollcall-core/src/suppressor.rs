//! Geometry-only non-maximum suppression.
//!
//! The detector contract carries no per-box confidence, so overlapping
//! detections of one physical face are resolved by area: the larger box wins.

use crate::types::BoundingBox;

/// IoU at or above which two boxes are treated as the same face.
pub const DEFAULT_OVERLAP_THRESHOLD: f32 = 0.3;

/// Removes duplicate detections of the same face within one frame.
#[derive(Debug, Clone, Copy)]
pub struct GeometrySuppressor {
    overlap_threshold: f32,
}

impl Default for GeometrySuppressor {
    fn default() -> Self {
        Self::new(DEFAULT_OVERLAP_THRESHOLD)
    }
}

impl GeometrySuppressor {
    pub fn new(overlap_threshold: f32) -> Self {
        Self { overlap_threshold }
    }

    /// Greedy area-ordered NMS.
    ///
    /// Returns a subset of `boxes` in selection order (largest area first).
    /// Equal areas keep their input order.
    pub fn suppress(&self, boxes: &[BoundingBox]) -> Vec<BoundingBox> {
        if boxes.len() <= 1 {
            return boxes.to_vec();
        }

        let mut order: Vec<usize> = (0..boxes.len()).collect();
        order.sort_by(|&a, &b| boxes[b].area().cmp(&boxes[a].area()));

        let mut keep = Vec::new();
        let mut suppressed = vec![false; boxes.len()];

        for (pos, &i) in order.iter().enumerate() {
            if suppressed[i] {
                continue;
            }
            keep.push(boxes[i]);

            for &j in &order[pos + 1..] {
                if suppressed[j] {
                    continue;
                }
                if boxes[i].iou(&boxes[j]) >= self.overlap_threshold {
                    suppressed[j] = true;
                }
            }
        }

        let dropped = boxes.len() - keep.len();
        if dropped > 0 {
            tracing::debug!(input = boxes.len(), kept = keep.len(), dropped, "suppressed overlapping boxes");
        }

        keep
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn bbox(x: i32, y: i32, w: u32, h: u32) -> BoundingBox {
        BoundingBox::new(x, y, w, h).unwrap()
    }

    #[test]
    fn test_suppress_empty() {
        assert!(GeometrySuppressor::default().suppress(&[]).is_empty());
    }

    #[test]
    fn test_suppress_single_unchanged() {
        let boxes = [bbox(3, 4, 10, 10)];
        assert_eq!(GeometrySuppressor::default().suppress(&boxes), boxes.to_vec());
    }

    #[test]
    fn test_suppress_disjoint_keeps_all() {
        let boxes = [
            bbox(0, 0, 10, 10),
            bbox(100, 0, 40, 40),
            bbox(0, 100, 25, 25),
            bbox(300, 300, 5, 5),
        ];
        let kept = GeometrySuppressor::default().suppress(&boxes);
        let kept: HashSet<_> = kept.into_iter().collect();
        let input: HashSet<_> = boxes.into_iter().collect();
        assert_eq!(kept, input);
    }

    #[test]
    fn test_suppress_keeps_larger_of_overlapping_pair() {
        let small = bbox(0, 0, 90, 90);
        let large = bbox(0, 0, 100, 100);
        // IoU = 8100 / 10000 = 0.81
        let kept = GeometrySuppressor::default().suppress(&[small, large]);
        assert_eq!(kept, vec![large]);
    }

    #[test]
    fn test_suppress_threshold_is_inclusive() {
        // 10x10 boxes offset by 5 on x: IoU = 50 / 150 = 0.333
        let a = bbox(0, 0, 10, 10);
        let b = bbox(5, 0, 10, 10);
        let iou = a.iou(&b);

        assert_eq!(GeometrySuppressor::new(iou).suppress(&[a, b]).len(), 1);
        assert_eq!(GeometrySuppressor::new(iou + 1e-3).suppress(&[a, b]).len(), 2);
    }

    #[test]
    fn test_suppress_below_threshold_keeps_both() {
        // IoU = 20 / 180 = 0.11
        let a = bbox(0, 0, 10, 10);
        let b = bbox(8, 0, 10, 10);
        assert_eq!(GeometrySuppressor::default().suppress(&[a, b]).len(), 2);
    }

    #[test]
    fn test_suppress_orders_by_area() {
        let boxes = [bbox(0, 0, 10, 10), bbox(100, 100, 50, 50), bbox(300, 0, 20, 20)];
        let kept = GeometrySuppressor::default().suppress(&boxes);
        assert_eq!(kept, vec![boxes[1], boxes[2], boxes[0]]);
    }

    #[test]
    fn test_suppress_chain_only_removes_direct_overlaps() {
        // a overlaps b heavily, b overlaps c heavily, a and c are disjoint.
        let a = bbox(0, 0, 101, 101);
        let b = bbox(50, 0, 100, 100);
        let c = bbox(101, 0, 100, 100);
        assert!(a.iou(&b) >= DEFAULT_OVERLAP_THRESHOLD);
        assert!(b.iou(&c) >= DEFAULT_OVERLAP_THRESHOLD);
        assert_eq!(a.iou(&c), 0.0);

        let kept = GeometrySuppressor::default().suppress(&[c, b, a]);
        assert_eq!(kept, vec![a, c]);
    }
}
