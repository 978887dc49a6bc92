//! Scale invariant feature transform.
//!
//! Keypoints are difference-of-gaussian extrema of a scale space built on the
//! greyscale image upsampled by two; each keypoint gets one descriptor per
//! dominant orientation of its neighbourhood.

use image::RgbImage;
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::colour::to_gray_f32;
use crate::features::FeatureExtractor;
use crate::{BowErr, BowResult};

pub mod descriptor;
mod detect;
pub mod pyramid;

pub use descriptor::DESCRIPTOR_SIZE;
use pyramid::Plane;

/// Blur assumed to be already present in the input image.
const INIT_SIGMA: f64 = 0.5;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct SiftConfig {
    /// Keep only this many of the strongest keypoints. `0` keeps all of them.
    pub number_of_features: usize,
    /// Levels searched per octave.
    pub octave_layers: usize,
    /// Minimum DoG contrast, per unit intensity, spread over the octave layers.
    pub contrast_threshold: f64,
    /// Maximum ratio of principal curvatures.
    pub edge_threshold: f64,
    /// Blur of the first level of each octave.
    pub sigma: f64,
}

impl Default for SiftConfig {
    fn default() -> Self {
        SiftConfig {
            number_of_features: 0,
            octave_layers: 3,
            contrast_threshold: 0.04,
            edge_threshold: 10.0,
            sigma: 1.6,
        }
    }
}

impl SiftConfig {
    pub fn new(number_of_features: usize) -> Self {
        SiftConfig {
            number_of_features,
            ..SiftConfig::default()
        }
    }

    fn validate(&self) -> BowResult<()> {
        if self.octave_layers == 0 {
            return Err(BowErr::Config("sift needs at least one octave layer".into()));
        }
        if self.sigma <= 0.0 {
            return Err(BowErr::Config(format!("sift sigma must be positive, got {}", self.sigma)));
        }
        Ok(())
    }
}

/// A detected keypoint, in the coordinates of the input image.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct KeyPoint {
    pub x: f32,
    pub y: f32,
    /// Diameter of the meaningful neighbourhood.
    pub size: f32,
    /// Dominant orientation in degrees, `0..360`.
    pub angle: f32,
    pub response: f32,
    /// Octave of the scale space, counting the upsampled one as 0.
    pub octave: usize,
    pub layer: usize,
}

/// SIFT detector and descriptor with a cap on the number of features.
#[derive(Debug, Clone, Default)]
pub struct Sift {
    config: SiftConfig,
}

impl Sift {
    pub fn new(number_of_features: usize) -> Self {
        Self::with_config(SiftConfig::new(number_of_features))
    }

    pub fn with_config(config: SiftConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SiftConfig {
        &self.config
    }

    /// Detect keypoints and compute their descriptors, one row per keypoint.
    pub fn detect_and_compute(&self, image: &RgbImage) -> BowResult<(Vec<KeyPoint>, Array2<f32>)> {
        self.config.validate()?;
        if image.width() == 0 || image.height() == 0 {
            return Ok((Vec::new(), Array2::zeros((0, DESCRIPTOR_SIZE))));
        }
        let gray = to_plane(&to_gray_f32(image));

        let base = pyramid::base_image(&gray, self.config.sigma, INIT_SIGMA);
        let kernels = pyramid::gaussian_kernels(self.config.sigma, self.config.octave_layers);
        let octaves = pyramid::number_of_octaves(base.nrows(), base.ncols());
        let gauss = pyramid::gaussian_pyramid(&base, octaves, &kernels);
        let dog = pyramid::difference_of_gaussians(&gauss);

        let mut keypoints = detect::find_scale_space_extrema(&gauss, &dog, &self.config);
        remove_duplicates(&mut keypoints);
        retain_best(&mut keypoints, self.config.number_of_features);

        let mut descriptors = Array2::zeros((keypoints.len(), DESCRIPTOR_SIZE));
        for (kp, mut row) in keypoints.iter_mut().zip(descriptors.rows_mut()) {
            // Back from the upsampled base to octave coordinates.
            let scale = 1.0 / (1usize << kp.octave) as f32;
            let d = descriptor::calc_descriptor(
                &gauss[kp.octave][kp.layer],
                (kp.x * scale, kp.y * scale),
                360.0 - kp.angle,
                kp.size * scale * 0.5,
            );
            row.iter_mut().zip(d.iter()).for_each(|(r, v)| *r = *v);

            kp.x *= 0.5;
            kp.y *= 0.5;
            kp.size *= 0.5;
        }
        Ok((keypoints, descriptors))
    }
}

impl FeatureExtractor for Sift {
    fn compute(&self, image: &RgbImage) -> BowResult<Array2<f32>> {
        self.detect_and_compute(image).map(|(_, descriptors)| descriptors)
    }
}

pub(crate) fn to_plane(gray: &crate::colour::GrayF32) -> Plane {
    Plane::from_fn(gray.height() as usize, gray.width() as usize, |r, c| {
        gray.get_pixel(c as u32, r as u32)[0]
    })
}

fn same_keypoint(a: &KeyPoint, b: &KeyPoint) -> bool {
    a.x == b.x && a.y == b.y && a.size == b.size && a.angle == b.angle
}

/// Sort keypoints by position and scale and drop exact repeats.
fn remove_duplicates(keypoints: &mut Vec<KeyPoint>) {
    keypoints.sort_by(|a, b| {
        a.x.total_cmp(&b.x)
            .then(a.y.total_cmp(&b.y))
            .then(b.size.total_cmp(&a.size))
            .then(a.angle.total_cmp(&b.angle))
    });
    keypoints.dedup_by(|a, b| same_keypoint(a, b));
}

/// Keep the `n` strongest keypoints, strongest first. `0` keeps everything.
fn retain_best(keypoints: &mut Vec<KeyPoint>, n: usize) {
    keypoints.sort_by(|a, b| b.response.total_cmp(&a.response));
    if n > 0 {
        keypoints.truncate(n);
    }
}
