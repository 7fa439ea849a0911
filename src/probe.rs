use image::RgbImage;
use tracing::debug;

use crate::classifier::{max_softmax, preprocess, Classifier};
use crate::error::{ForensicError, Result};

/// Classifier confidences for a page and its ELA residual.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Confidences {
    pub original: f64,
    pub ela: f64,
}

/// Maximum softmax probability of the classifier on one image.
pub fn confidence<C>(classifier: &C, img: &RgbImage) -> Result<f64>
where
    C: Classifier + ?Sized,
{
    let input = preprocess(img, classifier.input_size(), &classifier.device())?;
    let logits = classifier.logits(&input)?;
    max_softmax(&logits).ok_or_else(|| {
        ForensicError::ModelInferenceError(format!(
            "{} produced no usable logits",
            classifier.name()
        ))
    })
}

/// Runs the classifier on the page and on its residual, reinterpreted as an RGB image.
pub fn probe<C>(classifier: &C, page: &RgbImage, ela_residual: &RgbImage) -> Result<Confidences>
where
    C: Classifier + ?Sized,
{
    let original = confidence(classifier, page)?;
    let ela = confidence(classifier, ela_residual)?;
    debug!(original, ela, model = classifier.name(), "classifier confidences");
    Ok(Confidences { original, ela })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resnet::testing::tiny_resnet;
    use image::Rgb;

    #[test]
    fn confidences_are_probabilities() {
        let (_vars, net) = tiny_resnet();
        let page = RgbImage::from_fn(64, 80, |x, y| Rgb([(x * 3) as u8, (y * 2) as u8, 90]));
        let residual = RgbImage::from_pixel(64, 80, Rgb([3, 3, 3]));
        let c = probe(&net, &page, &residual).unwrap();
        assert!(c.original > 0.0 && c.original <= 1.0);
        assert!(c.ela > 0.0 && c.ela <= 1.0);
    }

    #[test]
    fn probing_twice_is_bit_identical() {
        let (_vars, net) = tiny_resnet();
        let page = RgbImage::from_fn(40, 40, |x, y| Rgb([((x ^ y) * 4) as u8, 128, 40]));
        let a = confidence(&net, &page).unwrap();
        let b = confidence(&net, &page).unwrap();
        assert_eq!(a.to_bits(), b.to_bits());
    }
}
