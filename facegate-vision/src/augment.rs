use ndarray::Array3;
use rand::Rng;

use crate::preprocess::FaceTensor;

/// Random geometric jitter applied to training tensors only
#[derive(Debug, Clone, Copy)]
pub struct Augmentation {
    pub rotation_degrees: f32,
    /// Maximum shift as a fraction of the side length
    pub shift: f32,
    /// Zoom is drawn from [1 - zoom, 1 + zoom]
    pub zoom: f32,
    pub horizontal_flip: bool,
}

impl Default for Augmentation {
    fn default() -> Self {
        Self {
            rotation_degrees: 10.0,
            shift: 0.1,
            zoom: 0.1,
            horizontal_flip: true,
        }
    }
}

/// Concrete transform drawn from an [`Augmentation`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub angle: f32,
    pub dx: f32,
    pub dy: f32,
    pub scale: f32,
    pub flip: bool,
}

impl Transform {
    pub const IDENTITY: Transform = Transform {
        angle: 0.0,
        dx: 0.0,
        dy: 0.0,
        scale: 1.0,
        flip: false,
    };
}

impl Augmentation {
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Transform {
        let angle = if self.rotation_degrees > 0.0 {
            rng.gen_range(-self.rotation_degrees..=self.rotation_degrees)
                .to_radians()
        } else {
            0.0
        };
        let mut shift = || {
            if self.shift > 0.0 {
                rng.gen_range(-self.shift..=self.shift)
            } else {
                0.0
            }
        };
        let (dx, dy) = (shift(), shift());
        let scale = if self.zoom > 0.0 {
            rng.gen_range(1.0 - self.zoom..=1.0 + self.zoom)
        } else {
            1.0
        };
        let flip = self.horizontal_flip && rng.gen_bool(0.5);
        Transform {
            angle,
            dx,
            dy,
            scale,
            flip,
        }
    }

    pub fn apply<R: Rng + ?Sized>(&self, tensor: &FaceTensor, rng: &mut R) -> FaceTensor {
        warp(tensor, self.sample(rng))
    }
}

/// Warp a tensor around its center; out-of-range samples take the nearest edge pixel
pub fn warp(tensor: &FaceTensor, t: Transform) -> FaceTensor {
    let src = &tensor.data;
    let (h, w, channels) = src.dim();
    if h == 0 || w == 0 {
        return tensor.clone();
    }

    let cx = (w as f32 - 1.0) / 2.0;
    let cy = (h as f32 - 1.0) / 2.0;
    let (sin, cos) = t.angle.sin_cos();
    let shift_x = t.dx * w as f32;
    let shift_y = t.dy * h as f32;

    let mut out = Array3::<f32>::zeros((h, w, channels));
    for out_y in 0..h {
        for out_x in 0..w {
            // Invert: undo translation, then scale, then rotation
            let mut ox = out_x as f32;
            if t.flip {
                ox = w as f32 - 1.0 - ox;
            }
            let tmp_x = (ox - shift_x - cx) / t.scale;
            let tmp_y = (out_y as f32 - shift_y - cy) / t.scale;
            let in_x = (cos * tmp_x + sin * tmp_y + cx).clamp(0.0, (w - 1) as f32);
            let in_y = (-sin * tmp_x + cos * tmp_y + cy).clamp(0.0, (h - 1) as f32);

            let x0 = in_x.floor() as usize;
            let y0 = in_y.floor() as usize;
            let x1 = (x0 + 1).min(w - 1);
            let y1 = (y0 + 1).min(h - 1);
            let fx = in_x - x0 as f32;
            let fy = in_y - y0 as f32;

            let w00 = (1.0 - fx) * (1.0 - fy);
            let w10 = fx * (1.0 - fy);
            let w01 = (1.0 - fx) * fy;
            let w11 = fx * fy;

            for c in 0..channels {
                let v = src[[y0, x0, c]] * w00
                    + src[[y0, x1, c]] * w10
                    + src[[y1, x0, c]] * w01
                    + src[[y1, x1, c]] * w11;
                out[[out_y, out_x, c]] = v.clamp(0.0, 1.0);
            }
        }
    }

    FaceTensor { data: out }
}
