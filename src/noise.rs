use image::{GrayImage, RgbImage};

use crate::imaging::{to_gray, unit_mean_std};

/// Aperture-3 Laplacian; the diagonal taps make it respond to texture in every direction.
const LAPLACIAN: [[f32; 3]; 3] = [[2.0, 0.0, 2.0], [0.0, -8.0, 0.0], [2.0, 0.0, 2.0]];
const EPSILON: f32 = 1e-8;

#[derive(Debug, Clone)]
pub struct NoiseResidual {
    /// |Laplacian| rescaled by its own maximum to [0, 255].
    pub map: GrayImage,
    pub mean: f64,
    pub std: f64,
}

/// Mirror index without repeating the edge sample (`dcb|abcd|cba`).
fn reflect_101(i: isize, len: usize) -> usize {
    if len == 1 {
        return 0;
    }
    let last = len as isize - 1;
    let mut i = i;
    while i < 0 || i > last {
        i = if i < 0 { -i } else { 2 * last - i };
    }
    i as usize
}

pub fn laplacian_abs(gray: &GrayImage) -> Vec<f32> {
    let (w, h) = (gray.width() as usize, gray.height() as usize);
    let src = gray.as_raw();
    let mut out = vec![0.0f32; w * h];
    for y in 0..h {
        for x in 0..w {
            let mut acc = 0.0f32;
            for (ky, row) in LAPLACIAN.iter().enumerate() {
                let sy = reflect_101(y as isize + ky as isize - 1, h);
                for (kx, &k) in row.iter().enumerate() {
                    if k == 0.0 {
                        continue;
                    }
                    let sx = reflect_101(x as isize + kx as isize - 1, w);
                    acc += k * src[sy * w + sx] as f32;
                }
            }
            out[y * w + x] = acc.abs();
        }
    }
    out
}

pub fn compute_noise_residual(img: &RgbImage) -> NoiseResidual {
    let gray = to_gray(img);
    let response = laplacian_abs(&gray);
    let max = response.iter().copied().fold(0.0f32, f32::max);
    let pixels: Vec<u8> = response
        .iter()
        .map(|&v| (v / (max + EPSILON) * 255.0) as u8)
        .collect();
    let (mean, std) = unit_mean_std(&pixels);
    let map = GrayImage::from_raw(gray.width(), gray.height(), pixels)
        .unwrap_or_else(|| GrayImage::new(gray.width(), gray.height()));
    NoiseResidual { map, mean, std }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Luma, Rgb};

    #[test]
    fn reflect_101_mirrors_without_edge_repeat() {
        assert_eq!(reflect_101(-1, 5), 1);
        assert_eq!(reflect_101(-2, 5), 2);
        assert_eq!(reflect_101(5, 5), 3);
        assert_eq!(reflect_101(2, 5), 2);
        assert_eq!(reflect_101(-1, 1), 0);
    }

    #[test]
    fn uniform_page_has_zero_noise() {
        let img = RgbImage::from_pixel(16, 16, Rgb([240, 240, 240]));
        let noise = compute_noise_residual(&img);
        assert_eq!(noise.mean, 0.0);
        assert_eq!(noise.std, 0.0);
        assert!(noise.map.as_raw().iter().all(|&v| v == 0));
    }

    #[test]
    fn single_spike_peaks_at_center() {
        let mut gray = GrayImage::new(5, 5);
        gray.put_pixel(2, 2, Luma([10]));
        let lap = laplacian_abs(&gray);
        assert_eq!(lap[2 * 5 + 2], 80.0);
        assert_eq!(lap[5 + 1], 20.0);
        assert_eq!(lap[2 * 5 + 1], 0.0);
    }

    #[test]
    fn map_is_rescaled_by_its_maximum() {
        let img = RgbImage::from_fn(32, 32, |x, y| {
            if (x / 4 + y / 4) % 2 == 0 {
                Rgb([0, 0, 0])
            } else {
                Rgb([255, 255, 255])
            }
        });
        let noise = compute_noise_residual(&img);
        assert!(noise.map.as_raw().iter().any(|&v| v >= 254));
        assert!(noise.mean > 0.0 && noise.mean <= 1.0);
        assert!(noise.std > 0.0 && noise.std <= 1.0);
    }
}
