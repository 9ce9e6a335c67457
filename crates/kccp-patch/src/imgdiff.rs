//! Perceptual image comparison.
//!
//! [`diff_ratio`] counts pixels whose YIQ colour distance exceeds a threshold,
//! following mapbox/pixelmatch without anti-aliasing detection.
//! [`average_hash`] is a cheap 8x8 luma fingerprint used to reject obviously
//! different candidates before the full comparison.

use image::{Rgba, RgbaImage, imageops::FilterType};

/// Colour sensitivity; smaller is stricter
pub const DEFAULT_COLOR_THRESHOLD: f64 = 0.1;

/// Highest differing-pixel ratio at which two images count as the same art
pub const MATCH_RATIO: f64 = 0.01;

/// Highest normalized hash distance worth a full comparison
pub const HASH_DISTANCE: f64 = 0.1;

/// 35215 is the largest possible YIQ delta
const MAX_YIQ_DELTA: f64 = 35215.0;

/// Fraction of pixels that differ between two images of equal size.
///
/// Returns 1.0 when the dimensions differ.
pub fn diff_ratio(a: &RgbaImage, b: &RgbaImage, threshold: f64) -> f64 {
    if a.dimensions() != b.dimensions() {
        return 1.0;
    }
    let total = u64::from(a.width()) * u64::from(a.height());
    if total == 0 || a.as_raw() == b.as_raw() {
        return 0.0;
    }

    let max_delta = MAX_YIQ_DELTA * threshold * threshold;
    let differing = a
        .pixels()
        .zip(b.pixels())
        .enumerate()
        .filter(|(i, (pa, pb))| color_delta(**pa, **pb, *i).abs() > max_delta)
        .count();

    differing as f64 / total as f64
}

/// Whether `candidate` depicts the same art as `current`.
///
/// `current_hash` and `candidate_hash` are the images' [`average_hash`]es.
pub fn is_match(
    current: &RgbaImage,
    current_hash: u64,
    candidate: &RgbaImage,
    candidate_hash: u64,
) -> bool {
    if current.dimensions() != candidate.dimensions() {
        return false;
    }
    if hash_distance(current_hash, candidate_hash) > HASH_DISTANCE {
        return false;
    }
    diff_ratio(candidate, current, DEFAULT_COLOR_THRESHOLD) <= MATCH_RATIO
}

fn color_delta(a: Rgba<u8>, b: Rgba<u8>, index: usize) -> f64 {
    if a == b {
        return 0.0;
    }
    let (r1, g1, b1) = blended(a, index);
    let (r2, g2, b2) = blended(b, index);

    let y1 = rgb2y(r1, g1, b1);
    let y2 = rgb2y(r2, g2, b2);
    let y = y1 - y2;
    let i = rgb2i(r1, g1, b1) - rgb2i(r2, g2, b2);
    let q = rgb2q(r1, g1, b1) - rgb2q(r2, g2, b2);

    let delta = 0.5053 * y * y + 0.299 * i * i + 0.1957 * q * q;
    if y1 > y2 { -delta } else { delta }
}

// Translucent pixels are composed onto white for odd pixels, black for even
fn blended(pixel: Rgba<u8>, index: usize) -> (f64, f64, f64) {
    let [r, g, b, a] = pixel.0.map(f64::from);
    if a >= 255.0 {
        return (r, g, b);
    }
    let alpha = a / 255.0;
    let blend = |c: f64| {
        if index % 2 == 1 {
            (c - 255.0).mul_add(alpha, 255.0)
        } else {
            c * alpha
        }
    };
    (blend(r), blend(g), blend(b))
}

fn rgb2y(r: f64, g: f64, b: f64) -> f64 {
    r * 0.29889531 + g * 0.58662247 + b * 0.11448223
}

fn rgb2i(r: f64, g: f64, b: f64) -> f64 {
    r * 0.59597799 - g * 0.27417610 - b * 0.32180189
}

fn rgb2q(r: f64, g: f64, b: f64) -> f64 {
    r * 0.21147017 - g * 0.52261711 + b * 0.31114694
}

/// 64-bit average hash of the image's luma, alpha-premultiplied.
pub fn average_hash(img: &RgbaImage) -> u64 {
    if img.width() == 0 || img.height() == 0 {
        return 0;
    }
    let small = image::imageops::resize(img, 8, 8, FilterType::Triangle);
    let luma: Vec<f64> = small
        .pixels()
        .map(|p| {
            let [r, g, b, a] = p.0.map(f64::from);
            rgb2y(r, g, b) * a / 255.0
        })
        .collect();
    let mean = luma.iter().sum::<f64>() / luma.len() as f64;

    luma.iter()
        .enumerate()
        .filter(|(_, l)| **l > mean)
        .fold(0u64, |hash, (i, _)| hash | (1 << i))
}

/// Fraction of differing bits between two hashes.
pub fn hash_distance(a: u64, b: u64) -> f64 {
    f64::from((a ^ b).count_ones()) / 64.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(w: u32, h: u32) -> RgbaImage {
        RgbaImage::from_fn(w, h, |x, y| Rgba([(x * 8) as u8, (y * 8) as u8, 128, 255]))
    }

    #[test]
    fn test_identical_images_have_no_difference() {
        let img = gradient(16, 16);
        assert!(diff_ratio(&img, &img.clone(), DEFAULT_COLOR_THRESHOLD).abs() < f64::EPSILON);
    }

    #[test]
    fn test_size_mismatch_is_total_difference() {
        let ratio = diff_ratio(&gradient(16, 16), &gradient(16, 8), DEFAULT_COLOR_THRESHOLD);
        assert!((ratio - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_small_noise_is_tolerated() {
        let a = gradient(16, 16);
        let mut b = a.clone();
        for p in b.pixels_mut() {
            p.0[0] = p.0[0].saturating_add(1);
        }
        assert!(diff_ratio(&a, &b, DEFAULT_COLOR_THRESHOLD) < f64::EPSILON);
    }

    #[test]
    fn test_counts_changed_pixels() {
        let a = RgbaImage::from_pixel(10, 10, Rgba([0, 0, 0, 255]));
        let mut b = a.clone();
        for x in 0..10 {
            b.put_pixel(x, 0, Rgba([255, 255, 255, 255]));
        }
        let ratio = diff_ratio(&a, &b, DEFAULT_COLOR_THRESHOLD);
        assert!((ratio - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_transparent_pixels_blend_alternately() {
        // Fully transparent white against opaque black: black on even pixels only
        let a = RgbaImage::from_pixel(2, 1, Rgba([255, 255, 255, 0]));
        let b = RgbaImage::from_pixel(2, 1, Rgba([0, 0, 0, 255]));
        let ratio = diff_ratio(&a, &b, DEFAULT_COLOR_THRESHOLD);
        assert!((ratio - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_hash_distance() {
        assert!(hash_distance(0, 0).abs() < f64::EPSILON);
        assert!((hash_distance(0, u64::MAX) - 1.0).abs() < f64::EPSILON);
        assert!((hash_distance(0b1011, 0b0011) - 1.0 / 64.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_is_match() {
        let a = gradient(32, 32);
        let hash = average_hash(&a);
        assert!(is_match(&a, hash, &a, hash));

        let inverted = RgbaImage::from_fn(32, 32, |x, y| {
            Rgba([255 - (x * 8) as u8, 255 - (y * 8) as u8, 128, 255])
        });
        assert!(!is_match(&a, hash, &inverted, average_hash(&inverted)));
        assert!(!is_match(&a, hash, &gradient(32, 16), hash));
    }
}
