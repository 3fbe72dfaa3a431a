//! Pure-Rust nearest/bilinear resampling of luminance planes.

use ndarray::Array2;

use crate::types::Plane;

/// Supported resize algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResizeAlgorithm {
    #[default]
    Bilinear,
    Nearest,
}

impl ResizeAlgorithm {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "nearest" | "neighbor" | "nn" => Self::Nearest,
            _ => Self::Bilinear,
        }
    }
}

pub fn resize(plane: &Plane, dst_w: usize, dst_h: usize, algorithm: ResizeAlgorithm) -> Plane {
    match algorithm {
        ResizeAlgorithm::Bilinear => resize_bilinear(plane, dst_w, dst_h),
        ResizeAlgorithm::Nearest => resize_nearest(plane, dst_w, dst_h),
    }
}

/// Nearest-neighbor resize. An empty source yields a zero-filled plane.
pub fn resize_nearest(plane: &Plane, dst_w: usize, dst_h: usize) -> Plane {
    let (src_w, src_h) = (plane.width(), plane.height());
    if plane.is_empty() {
        return Plane::filled(dst_w, dst_h, 0.0);
    }

    let data = Array2::from_shape_fn((dst_h, dst_w), |(dst_y, dst_x)| {
        let src_y = ((dst_y as f64 + 0.5) * src_h as f64 / dst_h as f64) as usize;
        let src_x = ((dst_x as f64 + 0.5) * src_w as f64 / dst_w as f64) as usize;
        plane.get(src_x.min(src_w - 1), src_y.min(src_h - 1))
    });
    Plane::from_array(data)
}

/// Bilinear interpolation resize with pixel-center alignment.
pub fn resize_bilinear(plane: &Plane, dst_w: usize, dst_h: usize) -> Plane {
    let (src_w, src_h) = (plane.width(), plane.height());
    if plane.is_empty() {
        return Plane::filled(dst_w, dst_h, 0.0);
    }

    let data = Array2::from_shape_fn((dst_h, dst_w), |(dst_y, dst_x)| {
        // Map destination pixel center to source coordinates
        let src_yf = (dst_y as f64 + 0.5) * src_h as f64 / dst_h as f64 - 0.5;
        let src_y0 = src_yf.floor().max(0.0) as usize;
        let src_y0 = src_y0.min(src_h - 1);
        let src_y1 = (src_y0 + 1).min(src_h - 1);
        let fy = (src_yf - src_y0 as f64).clamp(0.0, 1.0);

        let src_xf = (dst_x as f64 + 0.5) * src_w as f64 / dst_w as f64 - 0.5;
        let src_x0 = src_xf.floor().max(0.0) as usize;
        let src_x0 = src_x0.min(src_w - 1);
        let src_x1 = (src_x0 + 1).min(src_w - 1);
        let fx = (src_xf - src_x0 as f64).clamp(0.0, 1.0);

        let p00 = plane.get(src_x0, src_y0) as f64;
        let p10 = plane.get(src_x1, src_y0) as f64;
        let p01 = plane.get(src_x0, src_y1) as f64;
        let p11 = plane.get(src_x1, src_y1) as f64;

        let top = p00 * (1.0 - fx) + p10 * fx;
        let bot = p01 * (1.0 - fx) + p11 * fx;
        (top * (1.0 - fy) + bot * fy) as f32
    });
    Plane::from_array(data)
}
