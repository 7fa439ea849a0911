//! Pixel helpers shared by the analyzers.

use image::{GrayImage, Luma, RgbImage};

/// ITU-R 601-2 luma in 16.16 fixed point, rounded.
pub fn luma(r: u8, g: u8, b: u8) -> u8 {
    ((r as u32 * 19595 + g as u32 * 38470 + b as u32 * 7471 + 0x8000) >> 16) as u8
}

pub fn to_gray(img: &RgbImage) -> GrayImage {
    let mut gray = GrayImage::new(img.width(), img.height());
    for (x, y, px) in img.enumerate_pixels() {
        let [r, g, b] = px.0;
        gray.put_pixel(x, y, Luma([luma(r, g, b)]));
    }
    gray
}

/// Population mean and standard deviation of 8-bit samples, scaled to [0, 1].
pub fn unit_mean_std(samples: &[u8]) -> (f64, f64) {
    if samples.is_empty() {
        return (0.0, 0.0);
    }
    let n = samples.len() as f64;
    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    for &s in samples {
        let v = s as f64 / 255.0;
        sum += v;
        sum_sq += v * v;
    }
    let mean = sum / n;
    let var = (sum_sq / n - mean * mean).max(0.0);
    (mean, var.sqrt())
}

/// Row-major single channel float map.
#[derive(Debug, Clone, PartialEq)]
pub struct FloatMap {
    pub width: usize,
    pub height: usize,
    pub data: Vec<f32>,
}

impl FloatMap {
    pub fn zeros(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            data: vec![0.0; width * height],
        }
    }

    pub fn get(&self, x: usize, y: usize) -> f32 {
        self.data[y * self.width + x]
    }

    /// Bilinear resampling with half-pixel centers and edge clamping.
    pub fn resize_bilinear(&self, width: usize, height: usize) -> FloatMap {
        let mut out = FloatMap::zeros(width, height);
        if self.width == 0 || self.height == 0 {
            return out;
        }
        let sx = self.width as f32 / width as f32;
        let sy = self.height as f32 / height as f32;
        for y in 0..height {
            let fy = ((y as f32 + 0.5) * sy - 0.5).max(0.0);
            let y0 = (fy.floor() as usize).min(self.height - 1);
            let y1 = (y0 + 1).min(self.height - 1);
            let wy = fy - y0 as f32;
            for x in 0..width {
                let fx = ((x as f32 + 0.5) * sx - 0.5).max(0.0);
                let x0 = (fx.floor() as usize).min(self.width - 1);
                let x1 = (x0 + 1).min(self.width - 1);
                let wx = fx - x0 as f32;
                let top = self.get(x0, y0) * (1.0 - wx) + self.get(x1, y0) * wx;
                let bottom = self.get(x0, y1) * (1.0 - wx) + self.get(x1, y1) * wx;
                out.data[y * width + x] = top * (1.0 - wy) + bottom * wy;
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn luma_of_primaries() {
        assert_eq!(luma(0, 0, 0), 0);
        assert_eq!(luma(255, 255, 255), 255);
        assert_eq!(luma(255, 0, 0), 76);
        assert_eq!(luma(0, 255, 0), 150);
        assert_eq!(luma(0, 0, 255), 29);
    }

    #[test]
    fn gray_conversion_keeps_dimensions() {
        let img = RgbImage::from_pixel(7, 3, Rgb([10, 20, 30]));
        let gray = to_gray(&img);
        assert_eq!(gray.dimensions(), (7, 3));
    }

    #[test]
    fn mean_std_of_constant_is_zero_spread() {
        let (mean, std) = unit_mean_std(&[51; 100]);
        assert!((mean - 0.2).abs() < 1e-12);
        assert!(std.abs() < 1e-9);
    }

    #[test]
    fn mean_std_of_two_levels() {
        let mut samples = vec![0u8; 50];
        samples.extend(vec![255u8; 50]);
        let (mean, std) = unit_mean_std(&samples);
        assert!((mean - 0.5).abs() < 1e-12);
        assert!((std - 0.5).abs() < 1e-9);
    }

    #[test]
    fn bilinear_resize_of_constant_map_is_constant() {
        let map = FloatMap {
            width: 4,
            height: 4,
            data: vec![0.25; 16],
        };
        let up = map.resize_bilinear(17, 9);
        assert_eq!(up.data.len(), 17 * 9);
        assert!(up.data.iter().all(|v| (v - 0.25).abs() < 1e-6));
    }

    #[test]
    fn bilinear_resize_interpolates_between_columns() {
        let map = FloatMap {
            width: 2,
            height: 1,
            data: vec![0.0, 1.0],
        };
        let up = map.resize_bilinear(4, 1);
        assert_eq!(up.data[0], 0.0);
        assert_eq!(up.data[3], 1.0);
        assert!(up.data[1] > 0.0 && up.data[1] < up.data[2]);
    }
}
