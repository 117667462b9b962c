// ============================================================
// Layer 5 — Relative Geometry Embedding
// ============================================================
// Pairwise relative-geometry features between region bounding
// boxes, used by the geometry-augmented attention variant.
// Everything is expressed in differences and ratios, so the
// embedding is invariant to a uniform translation of all boxes.
//
// Grid-extracted images carry no detector boxes; a box per grid
// cell is synthesized from the cell coordinates instead.
//
// Reference: Herdade et al. (2019) Image Captioning: Transforming
//            Objects into Words

use burn::prelude::*;

/// Where geometry comes from. Region features carry detector
/// boxes; grid features synthesize one box per cell. Exactly one
/// of the two exists by construction.
#[derive(Debug, Clone)]
pub enum GeometrySource<B: Backend> {
    /// Detector boxes, shape [batch, num_items, 4] as (x1, y1, x2, y2)
    Boxes(Tensor<B, 3>),
    /// Grid layout; boxes are synthesized as normalized cells
    Grid { height: usize, width: usize },
}

impl<B: Backend> GeometrySource<B> {
    /// Resolve to concrete box coordinates [batch, n, 4].
    pub fn boxes(&self, batch_size: usize, num_items: usize, device: &B::Device) -> Tensor<B, 3> {
        match self {
            GeometrySource::Boxes(boxes) => {
                let [b, n, _] = boxes.dims();
                assert_eq!(b, batch_size, "box batch does not match features");
                assert_eq!(n, num_items, "box count does not match features");
                boxes.clone()
            }
            GeometrySource::Grid { height, width } => {
                grid_boxes(batch_size, *height, *width, num_items, device)
            }
        }
    }
}

/// Synthesize one normalized box per grid cell, row-major:
/// cell (x, y) -> (x/w, y/h, (x+1)/w, (y+1)/h).
fn grid_boxes<B: Backend>(
    batch_size: usize,
    height: usize,
    width: usize,
    num_items: usize,
    device: &B::Device,
) -> Tensor<B, 3> {
    assert_eq!(
        height * width,
        num_items,
        "grid {height}x{width} does not cover {num_items} feature cells"
    );
    let mut coords = Vec::with_capacity(height * width * 4);
    for y in 0..height {
        for x in 0..width {
            coords.push(x as f32 / width as f32);
            coords.push(y as f32 / height as f32);
            coords.push((x + 1) as f32 / width as f32);
            coords.push((y + 1) as f32 / height as f32);
        }
    }
    Tensor::<B, 1>::from_floats(coords.as_slice(), device)
        .reshape([1, num_items, 4])
        .expand([batch_size, num_items, 4])
}

/// Pairwise relative-geometry embedding.
///
/// boxes: [b, n, 4] -> embedding: [b, n, n, d_g]
///
/// The raw 4 features per pair (i, j) are
///   log(max(|cx_i - cx_j|, eps) / w_i), log(max(|cy_i - cy_j|, eps) / h_i),
///   log(w_i / w_j), log(h_i / h_j)
/// optionally lifted to `d_g` dims with the sinusoidal trick
/// (scale by 100, divide by a 1000^(k/(d_g/8)) frequency ladder,
/// interleave sin and cos).
pub fn box_relational_embedding<B: Backend>(
    boxes: Tensor<B, 3>,
    d_g: usize,
    trigonometric: bool,
) -> Tensor<B, 4> {
    let [b, n, _] = boxes.dims();
    let device = boxes.device();

    let x_min = boxes.clone().slice([0..b, 0..n, 0..1]);
    let y_min = boxes.clone().slice([0..b, 0..n, 1..2]);
    let x_max = boxes.clone().slice([0..b, 0..n, 2..3]);
    let y_max = boxes.slice([0..b, 0..n, 3..4]);

    let cx = (x_min.clone() + x_max.clone()) / 2.0;
    let cy = (y_min.clone() + y_max.clone()) / 2.0;
    let w = (x_max - x_min) + 1.0;
    let h = (y_max - y_min) + 1.0;

    // (b, n, 1) against (b, 1, n) broadcasts to the full pair matrix
    let delta_x = (cx.clone() - cx.reshape([b, 1, n]))
        .div(w.clone().expand([b, n, n]))
        .abs()
        .clamp_min(1e-3)
        .log();
    let delta_y = (cy.clone() - cy.reshape([b, 1, n]))
        .div(h.clone().expand([b, n, n]))
        .abs()
        .clamp_min(1e-3)
        .log();
    let delta_w = w.clone().div(w.reshape([b, 1, n])).log();
    let delta_h = h.clone().div(h.reshape([b, 1, n])).log();

    let position = Tensor::stack::<4>(vec![delta_x, delta_y, delta_w, delta_h], 3); // (b, n, n, 4)

    if !trigonometric {
        assert_eq!(d_g, 4, "raw geometry features are 4-dimensional");
        return position;
    }

    assert!(d_g >= 8 && d_g % 8 == 0, "trigonometric geometry dim must be a multiple of 8");
    let steps = d_g / 8;
    let frequencies = Tensor::<B, 1, Int>::arange(0..steps as i64, &device)
        .float()
        .div_scalar(steps as f32)
        .mul_scalar((1000f32).ln())
        .exp()
        .recip(); // 1 / 1000^(k / steps)

    let angles = position
        .mul_scalar(100.0)
        .unsqueeze_dim::<5>(4)
        .mul(frequencies.reshape([1, 1, 1, 1, steps]).expand([b, n, n, 4, steps]))
        .reshape([b, n, n, 4 * steps]);

    Tensor::cat(vec![angles.clone().sin(), angles.cos()], 3) // (b, n, n, d_g)
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    type TB = burn::backend::NdArray;

    fn sample_boxes(device: &<TB as Backend>::Device) -> Tensor<TB, 3> {
        Tensor::<TB, 1>::from_floats(
            [
                0.0, 0.0, 10.0, 12.0, //
                4.0, 2.0, 9.0, 8.0, //
                1.0, 5.0, 3.0, 7.0,
            ]
            .as_slice(),
            device,
        )
        .reshape([1, 3, 4])
    }

    #[test]
    fn test_embedding_shape() {
        let device = Default::default();
        let emb = box_relational_embedding(sample_boxes(&device), 64, true);
        assert_eq!(emb.dims(), [1, 3, 3, 64]);
        let raw = box_relational_embedding(sample_boxes(&device), 4, false);
        assert_eq!(raw.dims(), [1, 3, 3, 4]);
    }

    #[test]
    fn test_translation_invariance() {
        // Shifting every box by a constant offset must not change
        // the embedding: the geometry is purely relative.
        let device = Default::default();
        let boxes = sample_boxes(&device);
        let offset = Tensor::<TB, 1>::from_floats([37.0, -12.0, 37.0, -12.0].as_slice(), &device)
            .reshape([1, 1, 4])
            .expand([1, 3, 4]);
        let base = box_relational_embedding(boxes.clone(), 64, true);
        let shifted = box_relational_embedding(boxes + offset, 64, true);
        let diff = (base - shifted).abs().max().into_scalar();
        assert!(diff < 1e-4, "translation changed the embedding by {diff}");
    }

    #[test]
    fn test_grid_boxes_cover_unit_square() {
        let device = Default::default();
        let source = GeometrySource::<TB>::Grid { height: 2, width: 3 };
        let boxes = source.boxes(2, 6, &device);
        assert_eq!(boxes.dims(), [2, 6, 4]);
        let data = boxes.slice([0..1, 5..6, 0..4]).into_data().to_vec::<f32>().unwrap();
        // last cell of a 2x3 grid is (2/3, 1/2, 1, 1)
        assert!((data[0] - 2.0 / 3.0).abs() < 1e-6);
        assert!((data[1] - 0.5).abs() < 1e-6);
        assert!((data[2] - 1.0).abs() < 1e-6);
        assert!((data[3] - 1.0).abs() < 1e-6);
    }
}
