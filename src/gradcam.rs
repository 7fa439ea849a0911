//! Gradient-weighted class activation maps.
//!
//! The classifier's last convolutional block is tapped for one forward and one backward pass.
//! Channel importances are the spatial mean of the gradients; the weighted, rectified sum of the
//! activation channels is the coarse map, which is normalized, upsampled to the page, colored and
//! blended over the page.

use candle_core::{Tensor, D};
use image::codecs::png::PngEncoder;
use image::{ColorType, Rgb, RgbImage};
use tracing::debug;

use crate::classifier::{all_finite, argmax, preprocess, to_vec_f32, Classifier, TapId};
use crate::error::{ForensicError, Result};
use crate::imaging::FloatMap;

const PAGE_WEIGHT: f32 = 0.6;
const HEAT_WEIGHT: f32 = 0.4;
const EPSILON: f32 = 1e-8;

/// Scoped tap on a classifier. Attaches on construction and releases on drop, on every path.
pub struct ActivationTap<'m, C: Classifier + ?Sized> {
    model: &'m mut C,
    id: TapId,
}

impl<'m, C: Classifier + ?Sized> ActivationTap<'m, C> {
    pub fn attach(model: &'m mut C) -> Result<Self> {
        let id = model.attach_tap()?;
        debug!(tap = id.0, model = model.name(), "tap attached");
        Ok(Self { model, id })
    }

    pub fn forward(&mut self, input: &Tensor) -> Result<Vec<f32>> {
        self.model.forward_tapped(self.id, input)
    }

    pub fn backward(&mut self, target: usize) -> Result<()> {
        self.model.backward_tapped(self.id, target)
    }

    pub fn maps(&self) -> Result<(Tensor, Tensor)> {
        self.model.tapped_maps(self.id)
    }
}

impl<C: Classifier + ?Sized> Drop for ActivationTap<'_, C> {
    fn drop(&mut self) {
        self.model.release_tap(self.id);
        debug!(tap = self.id.0, "tap released");
    }
}

/// Overlay image plus the normalized map it was built from. The source page is untouched.
#[derive(Debug, Clone)]
pub struct LocalizationMap {
    pub target_class: usize,
    /// Page-sized map in [0, 1].
    pub heatmap: FloatMap,
    pub overlay: RgbImage,
}

impl LocalizationMap {
    pub fn to_png(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        PngEncoder::new(&mut buf)
            .encode(
                &self.overlay,
                self.overlay.width(),
                self.overlay.height(),
                ColorType::Rgb8,
            )
            .map_err(|e| ForensicError::LocalizationFailed(format!("PNG encoding: {}", e)))?;
        Ok(buf)
    }
}

fn localization_failed(e: ForensicError) -> ForensicError {
    match e {
        ForensicError::LocalizationFailed(_) => e,
        other => ForensicError::LocalizationFailed(other.to_string()),
    }
}

/// Rectified, gradient-weighted sum of activation channels, before normalization.
///
/// Both inputs are `K×h×w`.
pub fn class_activation(activations: &Tensor, gradients: &Tensor) -> Result<FloatMap> {
    weighted_channel_sum(activations, gradients).map_err(localization_failed)
}

fn weighted_channel_sum(activations: &Tensor, gradients: &Tensor) -> Result<FloatMap> {
    let (channels, height, width) = activations.dims3()?;
    if gradients.dims() != activations.dims() {
        return Err(ForensicError::LocalizationFailed(
            "activation and gradient shapes differ".into(),
        ));
    }
    if channels * height * width == 0 {
        return Err(ForensicError::LocalizationFailed(
            "no activations captured".into(),
        ));
    }
    if !all_finite(activations)? || !all_finite(gradients)? {
        return Err(ForensicError::LocalizationFailed(
            "non-finite activations or gradients".into(),
        ));
    }

    // 1. Channel importance: spatial mean of each gradient plane, K×1×1.
    let weights = gradients.mean_keepdim(D::Minus1)?.mean_keepdim(D::Minus2)?;
    // 2. Weight the activation planes, sum over K, keep positive evidence only.
    let cam = activations.broadcast_mul(&weights)?.sum(0)?.relu()?;
    // 3. Hand the h×w map to the image stages.
    Ok(FloatMap {
        width,
        height,
        data: to_vec_f32(&cam)?,
    })
}

/// Shift to zero minimum and scale to [0, 1].
pub fn normalize_map(map: &mut FloatMap) {
    // Dividing by max + eps keeps an all-zero map at zero.
    let min = map.data.iter().copied().fold(f32::INFINITY, f32::min);
    map.data.iter_mut().for_each(|v| *v -= min);
    let max = map.data.iter().copied().fold(0.0f32, f32::max);
    map.data.iter_mut().for_each(|v| *v /= max + EPSILON);
}

/// Blue → cyan → yellow → red.
pub fn jet(value: f32) -> Rgb<u8> {
    let v = value.clamp(0.0, 1.0);
    let channel = |center: f32| {
        let c = (1.5 - (4.0 * v - center).abs()).clamp(0.0, 1.0);
        (c * 255.0).round() as u8
    };
    Rgb([channel(3.0), channel(2.0), channel(1.0)])
}

pub fn blend(page: &RgbImage, heatmap: &FloatMap) -> RgbImage {
    RgbImage::from_fn(page.width(), page.height(), |x, y| {
        // Quantize like an 8-bit heatmap before coloring.
        let level = (heatmap.get(x as usize, y as usize) * 255.0) as u8;
        let heat = jet(level as f32 / 255.0);
        let base = page.get_pixel(x, y);
        let mut out = [0u8; 3];
        for c in 0..3 {
            let v = PAGE_WEIGHT * base.0[c] as f32 + HEAT_WEIGHT * heat.0[c] as f32;
            out[c] = v.round().clamp(0.0, 255.0) as u8;
        }
        Rgb(out)
    })
}

/// Build the localization overlay for `page`, explaining `target` or the top class.
///
/// Any failure is reported as `LocalizationFailed`; the classifier's tap is released regardless.
pub fn generate<C>(classifier: &mut C, page: &RgbImage, target: Option<usize>) -> Result<LocalizationMap>
where
    C: Classifier + ?Sized,
{
    let input = preprocess(page, classifier.input_size(), &classifier.device())
        .map_err(localization_failed)?;
    // 1. Tapped forward and backward; the tap is released when the guard leaves this block.
    let (target_class, coarse) = {
        let mut tap = ActivationTap::attach(classifier).map_err(localization_failed)?;
        let logits = tap.forward(&input).map_err(localization_failed)?;
        let target_class = match target {
            Some(t) => t,
            None => argmax(&logits)
                .ok_or_else(|| ForensicError::LocalizationFailed("empty logits".into()))?,
        };
        tap.backward(target_class).map_err(localization_failed)?;
        let (activations, gradients) = tap.maps().map_err(localization_failed)?;
        (target_class, class_activation(&activations, &gradients)?)
    };

    // 2. Normalize, upsample to page size, color and blend.
    let mut coarse = coarse;
    normalize_map(&mut coarse);
    let heatmap = coarse.resize_bilinear(page.width() as usize, page.height() as usize);
    let overlay = blend(page, &heatmap);
    debug!(
        target_class,
        width = page.width(),
        height = page.height(),
        "localization map generated"
    );
    Ok(LocalizationMap {
        target_class,
        heatmap,
        overlay,
    })
}
