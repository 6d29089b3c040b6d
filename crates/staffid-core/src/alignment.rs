//! Face normalization into the 112×112 RGB crop ArcFace expects.
//!
//! With five landmarks the face is warped by a least-squares similarity
//! transform onto the InsightFace reference points. Without landmarks the
//! bounding box is cropped and resized.

use crate::frame::FaceImage;
use crate::types::BoundingBox;

/// ArcFace reference landmarks for a 112×112 output.
const REFERENCE_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

pub const ALIGNED_SIZE: usize = 112;

/// Estimate a 4-DOF similarity transform (scale, rotation, translation)
/// mapping `src` onto `dst` in the least-squares sense.
///
/// Returns `[a, -b, tx, b, a, ty]`:
/// ```text
/// | a  -b  tx |
/// | b   a  ty |
/// ```
fn estimate_similarity_transform(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> [f32; 6] {
    // Normal equations for the unknowns [a, b, tx, ty]. Each point pair adds
    //   sx * a - sy * b + tx = dx
    //   sy * a + sx * b + ty = dy
    let mut ata = [[0.0f32; 4]; 4];
    let mut atb = [0.0f32; 4];

    for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst.iter()) {
        let rows = [([sx, -sy, 1.0, 0.0], dx), ([sy, sx, 0.0, 1.0], dy)];
        for (row, rhs) in rows {
            for j in 0..4 {
                for k in 0..4 {
                    ata[j][k] += row[j] * row[k];
                }
                atb[j] += row[j] * rhs;
            }
        }
    }

    let [a, b, tx, ty] = solve_4x4(ata, atb);
    [a, -b, tx, b, a, ty]
}

/// Gaussian elimination with partial pivoting. A singular system yields the
/// identity scale with no rotation or translation.
#[allow(clippy::needless_range_loop)]
fn solve_4x4(ata: [[f32; 4]; 4], atb: [f32; 4]) -> [f32; 4] {
    let mut m = [[0.0f32; 5]; 4];
    for i in 0..4 {
        m[i][..4].copy_from_slice(&ata[i]);
        m[i][4] = atb[i];
    }

    for col in 0..4 {
        let pivot_row = (col..4)
            .max_by(|&r1, &r2| m[r1][col].abs().total_cmp(&m[r2][col].abs()))
            .unwrap_or(col);
        m.swap(col, pivot_row);

        let pivot = m[col][col];
        if pivot.abs() < 1e-12 {
            return [1.0, 0.0, 0.0, 0.0];
        }

        for row in (col + 1)..4 {
            let factor = m[row][col] / pivot;
            for j in col..5 {
                m[row][j] -= factor * m[col][j];
            }
        }
    }

    let mut x = [0.0f32; 4];
    for i in (0..4).rev() {
        let tail: f32 = ((i + 1)..4).map(|j| m[i][j] * x[j]).sum();
        x[i] = (m[i][4] - tail) / m[i][i];
    }
    x
}

/// Bilinear sample of one RGB pixel at fractional source coordinates.
/// Samples outside the image contribute black.
fn sample_bilinear(image: &FaceImage, sx: f32, sy: f32) -> [u8; 3] {
    let x0 = sx.floor();
    let y0 = sy.floor();
    let fx = sx - x0;
    let fy = sy - y0;

    let fetch = |x: f32, y: f32| -> [f32; 3] {
        if x < 0.0 || y < 0.0 {
            return [0.0; 3];
        }
        let p = image.pixel(x as usize, y as usize);
        [p[0] as f32, p[1] as f32, p[2] as f32]
    };

    let tl = fetch(x0, y0);
    let tr = fetch(x0 + 1.0, y0);
    let bl = fetch(x0, y0 + 1.0);
    let br = fetch(x0 + 1.0, y0 + 1.0);

    let mut out = [0u8; 3];
    for c in 0..3 {
        let val = tl[c] * (1.0 - fx) * (1.0 - fy)
            + tr[c] * fx * (1.0 - fy)
            + bl[c] * (1.0 - fx) * fy
            + br[c] * fx * fy;
        out[c] = val.round().clamp(0.0, 255.0) as u8;
    }
    out
}

/// Apply the inverse of a similarity transform to produce an `out_size`² RGB crop.
fn warp_affine(image: &FaceImage, matrix: &[f32; 6], out_size: usize) -> Vec<u8> {
    let (a, b, tx, ty) = (matrix[0], matrix[3], matrix[2], matrix[5]);

    // M = [[a, -b], [b, a]], det = a² + b²
    let det = a * a + b * b;
    if det.abs() < 1e-12 {
        return vec![0u8; out_size * out_size * 3];
    }
    let ia = a / det;
    let ib = b / det;

    let mut output = Vec::with_capacity(out_size * out_size * 3);
    for oy in 0..out_size {
        for ox in 0..out_size {
            let dx = ox as f32 - tx;
            let dy = oy as f32 - ty;
            let sx = ia * dx + ib * dy;
            let sy = -ib * dx + ia * dy;
            output.extend_from_slice(&sample_bilinear(image, sx, sy));
        }
    }
    output
}

/// Crop the bounding box (clamped to the image) and resize it to `out_size`².
fn crop_resize(image: &FaceImage, face: &BoundingBox, out_size: usize) -> Vec<u8> {
    let x0 = face.x.max(0.0);
    let y0 = face.y.max(0.0);
    let x1 = (face.x + face.width).min(image.width as f32);
    let y1 = (face.y + face.height).min(image.height as f32);
    let w = (x1 - x0).max(1.0);
    let h = (y1 - y0).max(1.0);

    let step_x = w / out_size as f32;
    let step_y = h / out_size as f32;

    let mut output = Vec::with_capacity(out_size * out_size * 3);
    for oy in 0..out_size {
        let sy = y0 + (oy as f32 + 0.5) * step_y - 0.5;
        for ox in 0..out_size {
            let sx = x0 + (ox as f32 + 0.5) * step_x - 0.5;
            output.extend_from_slice(&sample_bilinear(image, sx.max(0.0), sy.max(0.0)));
        }
    }
    output
}

/// Normalize a detected face into a 112×112 packed RGB crop.
pub fn align_face(image: &FaceImage, face: &BoundingBox) -> Vec<u8> {
    match &face.landmarks {
        Some(landmarks) => {
            let matrix = estimate_similarity_transform(landmarks, &REFERENCE_LANDMARKS_112);
            warp_affine(image, &matrix, ALIGNED_SIZE)
        }
        None => crop_resize(image, face, ALIGNED_SIZE),
    }
}
