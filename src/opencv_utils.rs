use image::RgbImage;
use ndarray::Array2;
use opencv::{self, core::MatTrait, prelude::Feature2DTrait};

use crate::colour::to_gray;
use crate::features::{FeatureExtractor, SiftConfig};
use crate::{BowErr, BowResult};

type CvMat = opencv::core::Mat;

/// SIFT from OpenCV's features2d module, configured like [`crate::Sift`].
///
/// Useful to compare the native detector against the reference one.
#[derive(Debug, Clone, Default)]
pub struct OpenCvSift {
    config: SiftConfig,
}

impl OpenCvSift {
    pub fn new(number_of_features: usize) -> Self {
        Self::with_config(SiftConfig::new(number_of_features))
    }

    pub fn with_config(config: SiftConfig) -> Self {
        Self { config }
    }
}

impl FeatureExtractor for OpenCvSift {
    fn compute(&self, image: &RgbImage) -> BowResult<Array2<f32>> {
        let gray = to_gray(image);
        let flat = CvMat::from_slice(gray.as_raw())?;
        let cv_img = flat.reshape(1, gray.height() as i32)?;

        // Create detector
        let c = &self.config;
        let mut sift = opencv::features2d::SIFT::create(
            c.number_of_features as i32,
            c.octave_layers as i32,
            c.contrast_threshold,
            c.edge_threshold,
            c.sigma,
        )?;

        // Detect keypoints and compute descriptors
        let mut kps = opencv::types::VectorOfKeyPoint::new();
        let mut desc = CvMat::default()?;
        let mask = CvMat::default()?;
        sift.detect_and_compute(&cv_img, &mask, &mut kps, &mut desc, false)?;

        if kps.is_empty() {
            return Ok(Array2::zeros((0, crate::features::sift::DESCRIPTOR_SIZE)));
        }
        if desc.typ()? != opencv::core::CV_32F {
            return Err(BowErr::OpenCvDecode);
        }

        // Copy data from CvMat into the descriptor matrix
        let mut out = Array2::zeros((desc.rows() as usize, desc.cols() as usize));
        for ((i, j), v) in out.indexed_iter_mut() {
            *v = *desc.at_2d::<f32>(i as i32, j as i32)?;
        }
        Ok(out)
    }
}
