//! Texture-coordinate transform for the external texture.
//!
//! The fragment stage samples at `M * (s, t, 0, 1)` where `(s, t)` is the
//! interpolated coordinate of the full-screen quad (origin bottom-left).
//! `M = Crop * Flip * Rot`:
//!
//! - `Rot` turns the quad so the buffer shows upright,
//! - `Flip` maps bottom-left quad coordinates onto top-down buffer rows,
//! - `Crop` scales into the valid region and drops row padding.
//!
//! The result is normalised over the buffer's visible `width × height`.

use super::queue::{ProducerFrame, Rotation};

/// Column-major 4×4 matrix, laid out the way shader uniforms expect.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Mat4(pub [f32; 16]);

impl Mat4 {
    pub const IDENTITY: Mat4 = Mat4([
        1.0, 0.0, 0.0, 0.0, //
        0.0, 1.0, 0.0, 0.0, //
        0.0, 0.0, 1.0, 0.0, //
        0.0, 0.0, 0.0, 1.0,
    ]);

    /// Build from rows, which reads naturally in source.
    pub const fn from_rows(r: [[f32; 4]; 4]) -> Mat4 {
        Mat4([
            r[0][0], r[1][0], r[2][0], r[3][0], //
            r[0][1], r[1][1], r[2][1], r[3][1], //
            r[0][2], r[1][2], r[2][2], r[3][2], //
            r[0][3], r[1][3], r[2][3], r[3][3],
        ])
    }

    #[inline]
    pub fn at(&self, row: usize, col: usize) -> f32 {
        self.0[col * 4 + row]
    }

    pub fn mul(&self, rhs: &Mat4) -> Mat4 {
        let mut out = [0.0f32; 16];
        for col in 0..4 {
            for row in 0..4 {
                out[col * 4 + row] = (0..4).map(|k| self.at(row, k) * rhs.at(k, col)).sum();
            }
        }
        Mat4(out)
    }

    /// `M * (s, t, 0, 1)`, returning the first two components.
    #[inline]
    pub fn apply(&self, s: f32, t: f32) -> (f32, f32) {
        (
            self.at(0, 0) * s + self.at(0, 1) * t + self.at(0, 3),
            self.at(1, 0) * s + self.at(1, 1) * t + self.at(1, 3),
        )
    }
}

impl Default for Mat4 {
    fn default() -> Self {
        Mat4::IDENTITY
    }
}

fn rotation(rot: Rotation) -> Mat4 {
    match rot {
        Rotation::None => Mat4::IDENTITY,
        // (s, t) -> (1 - t, s)
        Rotation::Rot90 => Mat4::from_rows([
            [0.0, -1.0, 0.0, 1.0],
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ]),
        Rotation::Rot180 => Mat4::from_rows([
            [-1.0, 0.0, 0.0, 1.0],
            [0.0, -1.0, 0.0, 1.0],
            [0.0, 0.0, 1.0, 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ]),
        // (s, t) -> (t, 1 - s)
        Rotation::Rot270 => Mat4::from_rows([
            [0.0, 1.0, 0.0, 0.0],
            [-1.0, 0.0, 0.0, 1.0],
            [0.0, 0.0, 1.0, 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ]),
    }
}

const FLIP_V: Mat4 = Mat4::from_rows([
    [1.0, 0.0, 0.0, 0.0],
    [0.0, -1.0, 0.0, 1.0],
    [0.0, 0.0, 1.0, 0.0],
    [0.0, 0.0, 0.0, 1.0],
]);

/// Transform for sampling `frame` through the external texture.
pub fn texture_transform(frame: &ProducerFrame) -> Mat4 {
    let (w, h) = (frame.buffer.width.max(1) as f32, frame.buffer.height.max(1) as f32);
    let crop = frame.crop.clamped(frame.buffer.width, frame.buffer.height);

    let crop_m = Mat4::from_rows([
        [crop.width() as f32 / w, 0.0, 0.0, crop.left as f32 / w],
        [0.0, crop.height() as f32 / h, 0.0, crop.top as f32 / h],
        [0.0, 0.0, 1.0, 0.0],
        [0.0, 0.0, 0.0, 1.0],
    ]);

    crop_m.mul(&FLIP_V).mul(&rotation(frame.rotation))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::queue::CropRect;
    use crate::types::RawFrame;

    fn approx(a: (f32, f32), b: (f32, f32)) -> bool {
        (a.0 - b.0).abs() < 1e-5 && (a.1 - b.1).abs() < 1e-5
    }

    fn frame(w: u32, h: u32) -> ProducerFrame {
        ProducerFrame::upright(RawFrame::zeroed(w, h, w * 4), 0)
    }

    #[test]
    fn identity_multiplication() {
        let m = rotation(Rotation::Rot90);
        assert_eq!(m.mul(&Mat4::IDENTITY), m);
        assert_eq!(Mat4::IDENTITY.mul(&m), m);
    }

    #[test]
    fn upright_frame_flips_rows() {
        let m = texture_transform(&frame(8, 8));
        // Quad top-left samples buffer row 0.
        assert!(approx(m.apply(0.0, 1.0), (0.0, 0.0)));
        assert!(approx(m.apply(1.0, 0.0), (1.0, 1.0)));
    }

    #[test]
    fn crop_scales_into_valid_region() {
        let mut f = frame(10, 10);
        f.crop = CropRect {
            left: 2,
            top: 0,
            right: 7,
            bottom: 10,
        };
        let m = texture_transform(&f);
        assert!(approx(m.apply(0.0, 1.0), (0.2, 0.0)));
        assert!(approx(m.apply(1.0, 1.0), (0.7, 0.0)));
    }

    #[test]
    fn half_turn_puts_bottom_right_at_top_left() {
        let mut f = frame(8, 8);
        f.rotation = Rotation::Rot180;
        let m = texture_transform(&f);
        assert!(approx(m.apply(0.0, 1.0), (1.0, 1.0)));
    }

    #[test]
    fn quarter_turn_puts_bottom_left_at_top_left() {
        let mut f = frame(8, 8);
        f.rotation = Rotation::Rot90;
        let m = texture_transform(&f);
        assert!(approx(m.apply(0.0, 1.0), (0.0, 1.0)));
    }
}
