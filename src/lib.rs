use std::path::PathBuf;

use thiserror::Error;

/// Local feature extractors (SIFT, dense SIFT, colour histograms) and the
/// batch driver that stacks their descriptors.
pub mod features;
pub use features::{
    extract, extract_from_a_list, extract_pool, ColourHistogram, DenseConfig, DenseSift,
    Extraction, FeatureExtractor, Sift, SiftConfig,
};

/// Image decoding and colour space conversions shared by the extractors.
pub mod colour;

/// Data root and class-folder datasets.
pub mod dataset;
pub use dataset::{DataRoot, Dataset};

/// Implementation of a visual bag-of-words vocabulary over float descriptors.
pub mod vocab;
pub use vocab::Vocabulary;

/// Channel ordering and mean subtraction expected by the pretrained network.
pub mod preprocess;

/// Named augmentation profiles and the augmenting directory image loader.
pub mod augment;

/// Pretrained backbone plus a trainable classification head.
pub mod finetune;

/// Training curve rendering.
pub mod plot;

/// Run configuration.
pub mod settings;
pub use settings::Settings;

/// Utilities for extracting keypoint descriptors using opencv.
#[cfg(feature = "opencv")]
pub mod opencv_utils;
#[cfg(feature = "opencv")]
pub use opencv_utils::*;

/// A single keypoint descriptor.
///
/// SIFT and dense SIFT descriptors are 128 wide, colour histograms `bins²`.
pub type Desc = Vec<f32>;

/// Bag-of-Words representation of an image or descriptor set.
///
/// Index: word/leaf id in the vocabulary.
///
/// Value: total weight of that word in provided features.
pub type BoW = Vec<f32>;

/// This type represents a map from features to their corresponding nodes in the Vocabulary tree.
///
/// The direct index for `feature[i]` is `di = DirectIdx[i]` where
/// `di.len() <= l` (number of levels), and `di[j]` is the id of the node matching `feature[i]`
/// at level `j` in the Vocabulary tree.
pub type DirectIdx<const L: usize> = Vec<smallvec::SmallVec<[usize; L]>>;

/// Provides method(s) for computing the similarity score between bow vectors.
pub trait BoWTrait {
    /// Compute L1 score between two BoW. (Used in Galvez (Eq 2)).
    fn l1(&self, other: &Self) -> f32;
    /// L2 score between the unit-length versions of two BoW.
    fn l2(&self, other: &Self) -> f32;
}

impl BoWTrait for BoW {
    fn l1(&self, other: &Self) -> f32 {
        1. - 0.5
            * (self
                .iter()
                .zip(other)
                .fold(0., |a, (b, c)| a + (b - c).abs()))
    }

    fn l2(&self, other: &Self) -> f32 {
        let norm = |v: &BoW| v.iter().map(|x| x * x).sum::<f32>().sqrt();
        let (na, nb) = (norm(self), norm(other));
        if na == 0. || nb == 0. {
            return 0.;
        }
        let d = self
            .iter()
            .zip(other)
            .fold(0., |a, (b, c)| a + (b / na - c / nb).powi(2));
        1. - 0.5 * d.sqrt()
    }
}

pub type BowResult<T> = std::result::Result<T, BowErr>;

#[derive(Error, Debug)]
pub enum BowErr {
    #[error("Io Error")]
    Io(#[from] std::io::Error),
    #[cfg(feature = "bincode")]
    #[error("Vocabulary Serialization Error")]
    Bincode(#[from] bincode::Error),
    #[error("Image Error")]
    Image(#[from] image::ImageError),
    #[error("Array shape error")]
    Shape(#[from] ndarray::ShapeError),
    #[error("Json Error")]
    Json(#[from] serde_json::Error),
    #[cfg(feature = "opencv")]
    #[error("Opencv Error")]
    OpenCvInternal(#[from] opencv::Error),
    #[cfg(feature = "opencv")]
    #[error("Opencv Descriptor decode error")]
    OpenCvDecode,
    #[cfg(feature = "onnx")]
    #[error("Onnx runtime error")]
    Ort(#[from] ort::Error),
    #[error("No descriptors were accepted, nothing to stack")]
    EmptyBatch,
    #[error("Descriptor width mismatch: expected {expected}, found {found}")]
    DescriptorWidth { expected: usize, found: usize },
    #[error("Ordering not allowed: {0:?}. Use one of these: 'tf' or 'th'")]
    UnknownDimOrdering(String),
    #[error("Unknown data generator profile: {0:?}")]
    UnknownProfile(String),
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("No images found under {0:?}")]
    NoImages(PathBuf),
    #[error("Model must be compiled before training or evaluation")]
    NotCompiled,
}
