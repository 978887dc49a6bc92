use std::collections::HashMap;
use std::path::Path;

use image::RgbImage;
use log::{debug, info};
use ndarray::{concatenate, Array2, ArrayView2, Axis};

use crate::colour::load_rgb;
use crate::dataset::DataRoot;
use crate::{BowErr, BowResult};

mod dense;
mod histogram;
pub mod sift;

pub use dense::{DenseConfig, DenseSift};
pub use histogram::ColourHistogram;
pub use sift::{KeyPoint, Sift, SiftConfig};

/// At most this many images of one label contribute to a batch.
pub const MAX_IMAGES_PER_CLASS: usize = 30;

/// Label given to every image of an unlabelled batch.
pub const NO_LABEL: &str = "no_label";

/// Anything that turns one decoded image into a matrix of descriptor rows.
///
/// Every row produced by one configured extractor has the same width.
pub trait FeatureExtractor {
    /// Compute the descriptors of an image, one row per keypoint.
    fn compute(&self, image: &RgbImage) -> BowResult<Array2<f32>>;
}

impl<E: FeatureExtractor + ?Sized> FeatureExtractor for &E {
    fn compute(&self, image: &RgbImage) -> BowResult<Array2<f32>> {
        (**self).compute(image)
    }
}

impl<E: FeatureExtractor + ?Sized> FeatureExtractor for Box<E> {
    fn compute(&self, image: &RgbImage) -> BowResult<Array2<f32>> {
        (**self).compute(image)
    }
}

/// Stacked descriptors of a batch of images.
///
/// `labels[i]` is the label of the image that produced `descriptors.row(i)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub descriptors: Array2<f32>,
    pub labels: Vec<String>,
}

impl Extraction {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Width of every descriptor row.
    pub fn width(&self) -> usize {
        self.descriptors.ncols()
    }

    /// Rows contributed by images of `label`.
    pub fn count(&self, label: &str) -> usize {
        self.labels.iter().filter(|l| l.as_str() == label).count()
    }
}

/// Load one image by path and return its raw descriptors, unlabelled.
pub fn extract_pool<E, P>(extractor: &E, root: &DataRoot, filename: P) -> BowResult<Array2<f32>>
where
    E: FeatureExtractor + ?Sized,
    P: AsRef<Path>,
{
    let image = load_rgb(root.join(filename))?;
    extractor.compute(&image)
}

/// Descriptors of a single image, each row labelled with `label`.
pub fn extract<E, P>(extractor: &E, root: &DataRoot, filename: P, label: &str) -> BowResult<Extraction>
where
    E: FeatureExtractor + ?Sized,
    P: AsRef<Path>,
{
    let descriptors = extract_pool(extractor, root, filename)?;
    debug!("{} extracted keypoints and descriptors", descriptors.nrows());
    let labels = vec![label.to_owned(); descriptors.nrows()];
    Ok(Extraction {
        descriptors,
        labels,
    })
}

/// Compute descriptors for a list of images and labels.
///
/// Reads at most [`MAX_IMAGES_PER_CLASS`] images per label, in input order,
/// then stacks every accepted descriptor matrix vertically. The label of each
/// image is repeated once per descriptor row it contributed.
///
/// An empty `labels` slice labels every image [`NO_LABEL`]. Otherwise images
/// and labels are paired up to the shorter of the two.
///
/// Fails with [`BowErr::EmptyBatch`] when no image was accepted and with
/// [`BowErr::DescriptorWidth`] when two images produce rows of different widths.
pub fn extract_from_a_list<E, P, S>(
    extractor: &E,
    root: &DataRoot,
    images: &[P],
    labels: &[S],
) -> BowResult<Extraction>
where
    E: FeatureExtractor + ?Sized,
    P: AsRef<Path>,
    S: AsRef<str>,
{
    let labels: Vec<&str> = if labels.is_empty() {
        vec![NO_LABEL; images.len()]
    } else {
        labels.iter().map(|l| l.as_ref()).collect()
    };

    let mut accepted: HashMap<&str, usize> = HashMap::new();
    let mut descriptors: Vec<Array2<f32>> = Vec::new();
    let mut label_per_image: Vec<&str> = Vec::new();

    for (filename, &label) in images.iter().zip(labels.iter()) {
        let count = accepted.entry(label).or_insert(0);
        if *count >= MAX_IMAGES_PER_CLASS {
            continue;
        }
        *count += 1;

        let descriptor = extract_pool(extractor, root, filename)?;
        debug!(
            "Read image {:?}, {} extracted keypoints and descriptors",
            filename.as_ref(),
            descriptor.nrows()
        );
        descriptors.push(descriptor);
        label_per_image.push(label);
    }

    let extraction = stack(&descriptors, &label_per_image)?;
    info!(
        "Stacked {} descriptors of width {} from {} images",
        extraction.len(),
        extraction.width(),
        descriptors.len()
    );
    Ok(extraction)
}

/// Vertically stack per-image descriptors and broadcast their labels.
pub fn stack<S: AsRef<str>>(descriptors: &[Array2<f32>], labels: &[S]) -> BowResult<Extraction> {
    let first = descriptors.first().ok_or(BowErr::EmptyBatch)?;
    let width = first.ncols();
    if let Some(bad) = descriptors.iter().find(|d| d.ncols() != width) {
        return Err(BowErr::DescriptorWidth {
            expected: width,
            found: bad.ncols(),
        });
    }

    let views: Vec<ArrayView2<f32>> = descriptors.iter().map(|d| d.view()).collect();
    let stacked = concatenate(Axis(0), &views)?;
    let labels = descriptors
        .iter()
        .zip(labels)
        .flat_map(|(d, l)| std::iter::repeat(l.as_ref().to_owned()).take(d.nrows()))
        .collect();

    Ok(Extraction {
        descriptors: stacked,
        labels,
    })
}
