use std::path::Path;

use image::{GrayImage, ImageBuffer, Luma, Rgb, RgbImage};

use crate::BowResult;

/// Single channel float image, intensities in `0.0..=255.0`.
pub type GrayF32 = ImageBuffer<Luma<f32>, Vec<f32>>;

/// Decode an image from disk into 8-bit RGB, whatever its stored layout.
pub fn load_rgb<P: AsRef<Path>>(path: P) -> BowResult<RgbImage> {
    Ok(image::open(path)?.to_rgb8())
}

/// Greyscale conversion with the fixed-point ITU-R 601 weights.
///
/// Matches the `(R*4899 + G*9617 + B*1868 + 8192) >> 14` rounding so that
/// detectors see the same intensities for the same file.
pub fn to_gray(image: &RgbImage) -> GrayImage {
    let mut gray = GrayImage::new(image.width(), image.height());
    for (x, y, Rgb([r, g, b])) in image.enumerate_pixels() {
        let v = (*r as u32 * 4899 + *g as u32 * 9617 + *b as u32 * 1868 + 8192) >> 14;
        gray.put_pixel(x, y, Luma([v.min(255) as u8]));
    }
    gray
}

pub fn to_gray_f32(image: &RgbImage) -> GrayF32 {
    let gray = to_gray(image);
    GrayF32::from_fn(gray.width(), gray.height(), |x, y| {
        Luma([gray.get_pixel(x, y)[0] as f32])
    })
}

// D65 white point chromaticity
const UN: f64 = 0.197_939_43;
const VN: f64 = 0.468_310_96;

#[inline]
fn srgb_to_linear(v: f64) -> f64 {
    if v <= 0.04045 {
        v / 12.92
    } else {
        ((v + 0.055) / 1.055).powf(2.4)
    }
}

#[inline]
fn saturate_u8(v: f64) -> u8 {
    v.round().max(0.).min(255.) as u8
}

/// Convert one sRGB pixel to CIE L*u*v* in its 8-bit encoding:
/// `L * 255/100`, `(u + 134) * 255/354`, `(v + 140) * 255/262`.
pub fn rgb_to_luv_pixel(rgb: [u8; 3]) -> [u8; 3] {
    let r = srgb_to_linear(rgb[0] as f64 / 255.);
    let g = srgb_to_linear(rgb[1] as f64 / 255.);
    let b = srgb_to_linear(rgb[2] as f64 / 255.);

    let x = 0.412_453 * r + 0.357_580 * g + 0.180_423 * b;
    let y = 0.212_671 * r + 0.715_160 * g + 0.072_169 * b;
    let z = 0.019_334 * r + 0.119_193 * g + 0.950_227 * b;

    let l = if y > 0.008_856 {
        116. * y.cbrt() - 16.
    } else {
        903.3 * y
    };
    let d = 1. / (x + 15. * y + 3. * z).max(f64::EPSILON);
    let u = 13. * l * (4. * x * d - UN);
    let v = 13. * l * (9. * y * d - VN);

    [
        saturate_u8(l * 2.55),
        saturate_u8((u + 134.) * 255. / 354.),
        saturate_u8((v + 140.) * 255. / 262.),
    ]
}

/// Convert a whole image to 8-bit L*u*v*, channel order (L, u, v).
pub fn to_luv(image: &RgbImage) -> RgbImage {
    let mut luv = RgbImage::new(image.width(), image.height());
    for (x, y, px) in image.enumerate_pixels() {
        luv.put_pixel(x, y, Rgb(rgb_to_luv_pixel(px.0)));
    }
    luv
}
