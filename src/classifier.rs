//! Image classifier seam.
//!
//! The pipeline only needs two things from a classifier: logits for a preprocessed page, and a
//! way to read activations and gradients at its last convolutional block for localization. The
//! second part is stateful, so it goes through an explicit tap protocol instead of callbacks
//! registered on the model: a caller attaches a tap, runs a tapped forward and backward pass,
//! reads the captured maps, and releases the tap. `gradcam::ActivationTap` wraps that protocol
//! in a guard so the release cannot be skipped.

use candle_core::{DType, Device, Tensor};
use image::imageops::FilterType;
use image::RgbImage;

use crate::error::{ForensicError, Result};

/// Side of the square model input.
pub const INPUT_SIZE: u32 = 224;
const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Resize to `size`×`size`, scale to [0, 1] and apply ImageNet channel normalization.
///
/// Returns a `1×3×size×size` batch on `device`.
pub fn preprocess(img: &RgbImage, size: u32, device: &Device) -> Result<Tensor> {
    let resized = image::imageops::resize(img, size, size, FilterType::Triangle);
    let plane = (size * size) as usize;
    let mut data = vec![0f32; 3 * plane];
    for (x, y, px) in resized.enumerate_pixels() {
        let offset = (y * size + x) as usize;
        for c in 0..3 {
            let v = px.0[c] as f32 / 255.0;
            data[c * plane + offset] = (v - IMAGENET_MEAN[c]) / IMAGENET_STD[c];
        }
    }
    let side = size as usize;
    Ok(Tensor::from_vec(data, (1, 3, side, side), device)?)
}

/// Flattened `f32` copy of a tensor.
pub fn to_vec_f32(t: &Tensor) -> Result<Vec<f32>> {
    Ok(t.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?)
}

pub fn all_finite(t: &Tensor) -> Result<bool> {
    Ok(to_vec_f32(t)?.iter().all(|v| v.is_finite()))
}

/// Handle for an attached activation tap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TapId(pub u64);

/// A fixed, pre-trained image classifier.
///
/// Weights are read-only; tap state is per instance and not reentrant. Share an instance across
/// threads only behind a mutex.
pub trait Classifier: Send {
    fn name(&self) -> &str;

    /// Side of the square input the model expects.
    fn input_size(&self) -> u32 {
        INPUT_SIZE
    }

    /// Where inputs must be placed.
    fn device(&self) -> Device {
        Device::Cpu
    }

    /// Plain inference on a `1×3×H×W` batch, never touches tap state.
    fn logits(&self, input: &Tensor) -> Result<Vec<f32>>;

    /// Start capturing at the last convolutional block. Fails if a tap is already attached.
    fn attach_tap(&mut self) -> Result<TapId>;

    /// Forward pass that records the tapped block's activations.
    fn forward_tapped(&mut self, tap: TapId, input: &Tensor) -> Result<Vec<f32>>;

    /// Backward pass from `target`'s logit, recording gradients at the tapped block.
    fn backward_tapped(&mut self, tap: TapId, target: usize) -> Result<()>;

    /// Captured `(activations, gradients)`, both `K×h×w`.
    fn tapped_maps(&self, tap: TapId) -> Result<(Tensor, Tensor)>;

    /// Stop capturing and drop any captured state. Releasing an unknown tap is a no-op.
    fn release_tap(&mut self, tap: TapId);

    fn active_taps(&self) -> usize;
}

/// Checks a `1×3×H×W` input before it reaches a model.
pub fn check_input(input: &Tensor) -> Result<()> {
    match input.dims() {
        [1, 3, h, w] if *h > 0 && *w > 0 => {}
        dims => {
            return Err(ForensicError::ModelInferenceError(format!(
                "expected a 1x3xHxW input, got {:?}",
                dims
            )))
        }
    }
    if !all_finite(input)? {
        return Err(ForensicError::ModelInferenceError(
            "input contains non-finite values".into(),
        ));
    }
    Ok(())
}

/// Maximum class probability after softmax.
pub fn max_softmax(logits: &[f32]) -> Option<f64> {
    if logits.is_empty() || logits.iter().any(|v| !v.is_finite()) {
        return None;
    }
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max) as f64;
    let denom: f64 = logits.iter().map(|&v| (v as f64 - max).exp()).sum();
    Some(1.0 / denom)
}

/// Index of the largest logit; first one wins on ties.
pub fn argmax(logits: &[f32]) -> Option<usize> {
    logits
        .iter()
        .enumerate()
        .fold(None, |best: Option<(usize, f32)>, (i, &v)| match best {
            Some((_, b)) if b >= v => best,
            _ => Some((i, v)),
        })
        .map(|(i, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn preprocess_normalizes_channels() {
        let img = RgbImage::from_pixel(30, 10, Rgb([255, 0, 128]));
        let t = preprocess(&img, 8, &Device::Cpu).unwrap();
        assert_eq!(t.dims(), &[1, 3, 8, 8]);
        let values = to_vec_f32(&t).unwrap();
        // Resampling may land one code value off the source.
        assert!((values[3 * 8 + 3] - (1.0 - 0.485) / 0.229).abs() < 0.02);
        assert!((values[64 + 7] - (0.0 - 0.456) / 0.224).abs() < 0.02);
    }

    #[test]
    fn malformed_inputs_are_rejected() {
        let flat = Tensor::zeros((3, 8, 8), DType::F32, &Device::Cpu).unwrap();
        assert_eq!(check_input(&flat).unwrap_err().kind(), "ModelInferenceError");
        let nan = Tensor::from_vec(vec![f32::NAN; 3], (1, 3, 1, 1), &Device::Cpu).unwrap();
        assert!(check_input(&nan).is_err());
        let ok = Tensor::zeros((1, 3, 2, 2), DType::F32, &Device::Cpu).unwrap();
        assert!(check_input(&ok).is_ok());
    }

    #[test]
    fn softmax_max_of_known_logits() {
        let p = max_softmax(&[0.9f32.ln(), 0.1f32.ln()]).unwrap();
        assert!((p - 0.9).abs() < 1e-6);
        let uniform = max_softmax(&[1.0; 4]).unwrap();
        assert!((uniform - 0.25).abs() < 1e-12);
        assert!(max_softmax(&[]).is_none());
        assert!(max_softmax(&[1.0, f32::NAN]).is_none());
    }

    #[test]
    fn softmax_is_stable_for_large_logits() {
        let p = max_softmax(&[1000.0, 0.0]).unwrap();
        assert!((p - 1.0).abs() < 1e-12);
    }

    #[test]
    fn argmax_prefers_first_of_ties() {
        assert_eq!(argmax(&[0.1, 3.0, 3.0, -1.0]), Some(1));
        assert_eq!(argmax(&[]), None);
    }
}
