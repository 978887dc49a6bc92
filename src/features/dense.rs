use image::RgbImage;
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::colour::to_gray_f32;
use crate::features::sift::{descriptor, pyramid, to_plane, KeyPoint, DESCRIPTOR_SIZE};
use crate::features::FeatureExtractor;
use crate::{BowErr, BowResult};

/// Smoothing applied before describing grid points, as for the first level
/// of a SIFT octave at the input resolution.
const DESCRIPTOR_SIGMA: f64 = 1.6;
const INIT_SIGMA: f64 = 0.5;

/// Layout of the dense keypoint grid.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct DenseConfig {
    /// Number of grid levels.
    pub scale_levels: usize,
    /// Keypoint size and step multiplier from one level to the next.
    pub scale_mul: f32,
    /// Grid step of the first level, in pixels.
    pub step_size: usize,
    /// Keypoint size of the first level.
    pub feature_scale: f32,
    /// Margin left free on every side of the image.
    pub img_bound: usize,
}

impl Default for DenseConfig {
    fn default() -> Self {
        Self {
            scale_levels: 1,
            scale_mul: 0.1,
            step_size: 6,
            feature_scale: 1.0,
            img_bound: 0,
        }
    }
}

/// SIFT descriptors computed on a regular grid instead of detected points.
#[derive(Debug, Clone, Default)]
pub struct DenseSift {
    config: DenseConfig,
}

impl DenseSift {
    pub fn new(config: DenseConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DenseConfig {
        &self.config
    }

    /// Grid keypoints of a `width × height` image, level by level.
    ///
    /// The step shrinks with the scale multiplier after every level, the
    /// image margin stays fixed.
    pub fn grid(&self, width: u32, height: u32) -> BowResult<Vec<KeyPoint>> {
        let cfg = &self.config;
        if cfg.step_size == 0 {
            return Err(BowErr::Config("dense grid step must be at least 1".into()));
        }
        if cfg.scale_levels == 0 {
            return Err(BowErr::Config("dense grid needs at least one scale level".into()));
        }

        let (width, height) = (width as usize, height as usize);
        let mut keypoints = Vec::new();
        let mut scale = cfg.feature_scale;
        let mut step = cfg.step_size;
        let bound = cfg.img_bound;

        for _ in 0..cfg.scale_levels {
            for x in (bound..width.saturating_sub(bound)).step_by(step) {
                for y in (bound..height.saturating_sub(bound)).step_by(step) {
                    keypoints.push(KeyPoint {
                        x: x as f32,
                        y: y as f32,
                        size: scale,
                        angle: 0.0,
                        response: 0.0,
                        octave: 0,
                        layer: 0,
                    });
                }
            }
            scale *= cfg.scale_mul;
            step = ((step as f32 * cfg.scale_mul + 0.5) as usize).max(1);
        }
        Ok(keypoints)
    }

    /// Describe every grid keypoint. Keypoints are upright.
    pub fn detect_and_compute(&self, image: &RgbImage) -> BowResult<(Vec<KeyPoint>, Array2<f32>)> {
        let keypoints = self.grid(image.width(), image.height())?;
        let gray = to_plane(&to_gray_f32(image));
        let sigma = (DESCRIPTOR_SIGMA.powi(2) - INIT_SIGMA.powi(2)).sqrt();
        let smoothed = pyramid::gaussian_blur(&gray, sigma);

        let mut descriptors = Array2::zeros((keypoints.len(), DESCRIPTOR_SIZE));
        for (kp, mut row) in keypoints.iter().zip(descriptors.rows_mut()) {
            let d = descriptor::calc_descriptor(&smoothed, (kp.x, kp.y), kp.angle, kp.size * 0.5);
            row.iter_mut().zip(d.iter()).for_each(|(r, v)| *r = *v);
        }
        Ok((keypoints, descriptors))
    }
}

impl FeatureExtractor for DenseSift {
    fn compute(&self, image: &RgbImage) -> BowResult<Array2<f32>> {
        self.detect_and_compute(image).map(|(_, descriptors)| descriptors)
    }
}
