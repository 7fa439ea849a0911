//! Error Level Analysis.
//!
//! One lossy JPEG round trip at a fixed quality; regions that were saved at a different quality
//! than the rest of the page show up as higher residual energy.

use image::codecs::jpeg::JpegEncoder;
use image::{ColorType, GrayImage, ImageFormat, RgbImage};
use std::collections::VecDeque;

use crate::error::{ForensicError, Result};
use crate::imaging::{to_gray, unit_mean_std};

/// Floor applied to the Otsu threshold when binarizing the residual.
const MIN_BINARY_THRESHOLD: u8 = 60;
/// Components smaller than this share of the page are ignored.
const MIN_COMPONENT_SHARE: f64 = 0.001;
const AREA_RATIO_CAP: f64 = 0.05;
const MEAN_INTENSITY_CAP: f64 = 0.25;

#[derive(Debug, Clone)]
pub struct ElaResidual {
    /// Absolute difference rescaled so the largest channel value maps to 255.
    pub image: RgbImage,
    /// Grayscale mean of `image`, in [0, 1].
    pub mean: f64,
    /// Grayscale standard deviation of `image`, in [0, 1].
    pub std: f64,
}

pub fn recompress(img: &RgbImage, quality: u8) -> Result<RgbImage> {
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, quality)
        .encode(img, img.width(), img.height(), ColorType::Rgb8)
        .map_err(|e| ForensicError::DecodeError(format!("JPEG recompression failed: {}", e)))?;
    let decoded = image::load_from_memory_with_format(&buf, ImageFormat::Jpeg)?;
    Ok(decoded.to_rgb8())
}

pub fn compute_ela(img: &RgbImage, quality: u8) -> Result<ElaResidual> {
    // 1. One lossy round trip at the configured quality
    let recompressed = recompress(img, quality)?;

    // 2. Per-channel absolute difference
    let mut diff: Vec<u8> = img
        .as_raw()
        .iter()
        .zip(recompressed.as_raw())
        .map(|(&a, &b)| a.abs_diff(b))
        .collect();

    // 3. Stretch so the strongest difference becomes 255.
    // A page that survives recompression untouched would otherwise divide by zero.
    let max_diff = diff.iter().copied().max().unwrap_or(0).max(1) as u32;
    for v in diff.iter_mut() {
        *v = (*v as u32 * 255 / max_diff) as u8;
    }

    let image = RgbImage::from_raw(img.width(), img.height(), diff)
        .ok_or_else(|| ForensicError::DecodeError("ELA buffer size mismatch".into()))?;

    // 4. Statistics are taken on the luma of the stretched residual
    let gray = to_gray(&image);
    let (mean, std) = unit_mean_std(gray.as_raw());
    Ok(ElaResidual { image, mean, std })
}

/// `clamp(v / cap, 0, 1)`
pub fn normalize(value: f64, cap: f64) -> f64 {
    (value / cap).clamp(0.0, 1.0)
}

/// Otsu threshold over an 8-bit histogram, `None` for an empty image.
///
/// A single-level image thresholds at that level, so none of it counts as foreground.
pub fn otsu_threshold(gray: &GrayImage) -> Option<u8> {
    let mut hist = [0u64; 256];
    for &v in gray.as_raw() {
        hist[v as usize] += 1;
    }
    let total: u64 = hist.iter().sum();
    if total == 0 {
        return None;
    }
    let mut levels = hist.iter().enumerate().filter(|(_, &c)| c > 0);
    if let (Some((only, _)), None) = (levels.next(), levels.next()) {
        return Some(only as u8);
    }

    // Sweep every split point and keep the one maximizing between-class variance
    let weighted_total: f64 = hist
        .iter()
        .enumerate()
        .map(|(i, &c)| i as f64 * c as f64)
        .sum();
    let mut weight_bg = 0.0f64;
    let mut sum_bg = 0.0f64;
    let mut best = (0u8, f64::MIN);
    for t in 0..255usize {
        weight_bg += hist[t] as f64;
        if weight_bg == 0.0 {
            continue;
        }
        let weight_fg = total as f64 - weight_bg;
        if weight_fg == 0.0 {
            break;
        }
        sum_bg += t as f64 * hist[t] as f64;
        let mean_bg = sum_bg / weight_bg;
        let mean_fg = (weighted_total - sum_bg) / weight_fg;
        let between = weight_bg * weight_fg * (mean_bg - mean_fg).powi(2);
        if between > best.1 {
            best = (t as u8, between);
        }
    }
    Some(best.0)
}

/// Pixel counts of 8-connected foreground components.
pub fn component_areas(mask: &[bool], width: usize, height: usize) -> Vec<usize> {
    let mut seen = vec![false; mask.len()];
    let mut areas = Vec::new();
    let mut queue = VecDeque::new();
    for start in 0..mask.len() {
        if !mask[start] || seen[start] {
            continue;
        }
        seen[start] = true;
        queue.push_back(start);
        let mut area = 0usize;
        while let Some(idx) = queue.pop_front() {
            area += 1;
            let (x, y) = ((idx % width) as isize, (idx / width) as isize);
            for dy in -1..=1isize {
                for dx in -1..=1isize {
                    let (nx, ny) = (x + dx, y + dy);
                    if nx < 0 || ny < 0 || nx >= width as isize || ny >= height as isize {
                        continue;
                    }
                    let n = ny as usize * width + nx as usize;
                    if mask[n] && !seen[n] {
                        seen[n] = true;
                        queue.push_back(n);
                    }
                }
            }
        }
        areas.push(area);
    }
    areas
}

/// Area-weighted forgery likelihood from the binarized residual.
///
/// Reported alongside the ensemble signals; the tier decision does not use it.
pub fn ela_score(residual: &ElaResidual) -> f64 {
    let gray = to_gray(&residual.image);
    let (width, height) = (gray.width() as usize, gray.height() as usize);
    let page_area = (width * height) as f64;
    if page_area == 0.0 {
        return 0.0;
    }

    // 1. Binarize at Otsu, never below the floor
    let threshold = otsu_threshold(&gray)
        .unwrap_or(MIN_BINARY_THRESHOLD)
        .max(MIN_BINARY_THRESHOLD);
    let mask: Vec<bool> = gray.as_raw().iter().map(|&v| v > threshold).collect();
    // 2. Total area of the components large enough to matter
    let large_area: usize = component_areas(&mask, width, height)
        .into_iter()
        .filter(|&a| a as f64 > page_area * MIN_COMPONENT_SHARE)
        .sum();

    // 3. Blend coverage (80%) with overall residual brightness (20%)
    let area_ratio = large_area as f64 / page_area;
    let (mean_intensity, _) = unit_mean_std(gray.as_raw());
    normalize(area_ratio, AREA_RATIO_CAP) * 0.8 + normalize(mean_intensity, MEAN_INTENSITY_CAP) * 0.2
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Luma, Rgb};

    fn textured(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            let v = ((x * 37 + y * 91) % 251) as u8;
            Rgb([v, v.wrapping_mul(3), 255 - v])
        })
    }

    #[test]
    fn blank_page_has_no_residual_and_no_division_by_zero() {
        let blank = RgbImage::from_pixel(64, 64, Rgb([0, 0, 0]));
        let ela = compute_ela(&blank, 90).unwrap();
        assert!(ela.mean < 0.01, "mean {}", ela.mean);
        assert!(ela.std < 0.01, "std {}", ela.std);
        assert!(ela.mean.is_finite() && ela.std.is_finite());
        assert_eq!(ela.image.dimensions(), (64, 64));
    }

    #[test]
    fn residual_is_rescaled_to_full_range() {
        let ela = compute_ela(&textured(64, 64), 90).unwrap();
        let max = ela.image.as_raw().iter().copied().max().unwrap();
        assert_eq!(max, 255);
        assert!(ela.mean > 0.0 && ela.mean <= 1.0);
        assert!(ela.std > 0.0 && ela.std <= 1.0);
    }

    #[test]
    fn ela_is_deterministic() {
        let img = textured(48, 32);
        let a = compute_ela(&img, 90).unwrap();
        let b = compute_ela(&img, 90).unwrap();
        assert_eq!(a.image.as_raw(), b.image.as_raw());
        assert_eq!(a.mean.to_bits(), b.mean.to_bits());
        assert_eq!(a.std.to_bits(), b.std.to_bits());
    }

    #[test]
    fn normalize_clamps() {
        assert_eq!(normalize(0.1, 0.05), 1.0);
        assert_eq!(normalize(-1.0, 0.05), 0.0);
        assert!((normalize(0.025, 0.05) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn otsu_separates_two_levels() {
        let gray = GrayImage::from_fn(10, 10, |x, _| if x < 5 { Luma([20]) } else { Luma([200]) });
        let t = otsu_threshold(&gray).unwrap();
        assert!((20..200).contains(&t));
        let flat = GrayImage::from_pixel(4, 4, Luma([7]));
        assert_eq!(otsu_threshold(&flat), Some(7));
        assert_eq!(otsu_threshold(&GrayImage::new(0, 0)), None);
    }

    #[test]
    fn components_use_eight_connectivity() {
        // Two diagonal pixels join, an isolated pixel stays apart.
        #[rustfmt::skip]
        let mask = vec![
            true,  false, false, false,
            false, true,  false, false,
            false, false, false, true,
        ];
        let mut areas = component_areas(&mask, 4, 3);
        areas.sort_unstable();
        assert_eq!(areas, vec![1, 2]);
    }

    #[test]
    fn ela_score_counts_bright_blocks() {
        let mut image = RgbImage::from_pixel(100, 100, Rgb([0, 0, 0]));
        for y in 10..30 {
            for x in 10..30 {
                image.put_pixel(x, y, Rgb([255, 255, 255]));
            }
        }
        let residual = ElaResidual {
            image,
            mean: 0.0,
            std: 0.0,
        };
        // 400 px of 10_000 is 4% of the page, mean intensity 0.04.
        let expected = normalize(0.04, 0.05) * 0.8 + normalize(0.04, 0.25) * 0.2;
        assert!((ela_score(&residual) - expected).abs() < 1e-9);
    }

    #[test]
    fn ela_score_of_blank_residual_is_zero() {
        let residual = ElaResidual {
            image: RgbImage::from_pixel(20, 20, Rgb([0, 0, 0])),
            mean: 0.0,
            std: 0.0,
        };
        assert_eq!(ela_score(&residual), 0.0);
    }

    #[test]
    fn uniformly_bright_residual_has_no_foreground() {
        let residual = ElaResidual {
            image: RgbImage::from_pixel(50, 50, Rgb([200, 200, 200])),
            mean: 0.0,
            std: 0.0,
        };
        // Only the brightness term contributes: 0.2 * min(1, (200/255) / 0.25).
        assert!((ela_score(&residual) - 0.2).abs() < 1e-9);
    }
}
