use image::{DynamicImage, RgbImage};
use img_hash::{HashAlg, HasherConfig};
use sha2::{Digest, Sha256};

/// SHA-256 of the submitted file, lowercase hex.
///
/// Pins the exact bytes that were analyzed; any re-save changes it.
pub fn source_sha256(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// 64-bit gradient perceptual hash of a page, base64.
///
/// Survives recompression and mild rescaling, so the same page resubmitted in another file
/// still matches.
pub fn page_phash(page: &RgbImage) -> String {
    let hasher = HasherConfig::new()
        .hash_alg(HashAlg::Gradient)
        .hash_size(8, 8)
        .to_hasher();
    hasher
        .hash_image(&DynamicImage::ImageRgb8(page.clone()))
        .to_base64()
}
