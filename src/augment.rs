use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use image::imageops::{self, FilterType};
use image::RgbImage;
use log::{debug, info, warn};
use nalgebra::{Matrix3, Vector3};
use ndarray::{s, Array1, Array2, Array3, Array4, ArrayView4, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::colour::load_rgb;
use crate::dataset::{class_dirs, image_files};
use crate::preprocess::{preprocess_input, DimOrdering};
use crate::{BowErr, BowResult};

/// Added to standard deviations before dividing by them.
const STD_EPSILON: f32 = 1e-7;

/// How points outside the image are filled by [`ImageDataGenerator::random_transform`].
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum FillMode {
    /// `cval` everywhere outside.
    Constant,
    /// Repeat the edge pixel.
    #[default]
    Nearest,
    /// Mirror about the edge, edge pixel included.
    Reflect,
    /// Tile the image.
    Wrap,
}

/// Per-image function run first by [`ImageDataGenerator::standardize`].
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Preprocessing {
    #[default]
    None,
    /// RGB to BGR and subtraction of the VGG16 mean pixel.
    Vgg16,
}

/// Everything an [`ImageDataGenerator`] can do to an image.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct GeneratorOptions {
    pub featurewise_center: bool,
    pub samplewise_center: bool,
    pub featurewise_std_normalization: bool,
    pub samplewise_std_normalization: bool,
    pub preprocessing: Preprocessing,
    /// Degrees.
    pub rotation_range: f32,
    /// Fraction of the width.
    pub width_shift_range: f32,
    /// Fraction of the height.
    pub height_shift_range: f32,
    /// Radians.
    pub shear_range: f32,
    /// Zoom is drawn from `1 - zoom_range ..= 1 + zoom_range`.
    pub zoom_range: f32,
    pub channel_shift_range: f32,
    pub fill_mode: FillMode,
    pub cval: f32,
    pub horizontal_flip: bool,
    pub vertical_flip: bool,
    pub rescale: Option<f32>,
}

impl Default for GeneratorOptions {
    fn default() -> Self {
        DataGeneratorConfig::IDENTITY
    }
}

/// Named generator profiles.
pub struct DataGeneratorConfig;

impl DataGeneratorConfig {
    /// No augmentation or normalisation at all.
    pub const IDENTITY: GeneratorOptions = GeneratorOptions {
        featurewise_center: false,
        samplewise_center: false,
        featurewise_std_normalization: false,
        samplewise_std_normalization: false,
        preprocessing: Preprocessing::None,
        rotation_range: 0.,
        width_shift_range: 0.,
        height_shift_range: 0.,
        shear_range: 0.,
        zoom_range: 0.,
        channel_shift_range: 0.,
        fill_mode: FillMode::Nearest,
        cval: 0.,
        horizontal_flip: false,
        vertical_flip: false,
        rescale: None,
    };

    /// Network preprocessing only.
    pub const PREPROCESS: GeneratorOptions = GeneratorOptions {
        preprocessing: Preprocessing::Vgg16,
        ..Self::IDENTITY
    };

    pub const NORMALISE: GeneratorOptions = GeneratorOptions {
        featurewise_std_normalization: true,
        samplewise_std_normalization: true,
        ..Self::PREPROCESS
    };

    pub const NORM_AND_TRANSFORM: GeneratorOptions = GeneratorOptions {
        featurewise_std_normalization: true,
        samplewise_std_normalization: true,
        ..Self::TRANSFORM
    };

    pub const TRANSFORM: GeneratorOptions = GeneratorOptions {
        rotation_range: 15.,
        width_shift_range: 0.9,
        zoom_range: 0.3,
        fill_mode: FillMode::Reflect,
        horizontal_flip: true,
        ..Self::PREPROCESS
    };

    /// Look a profile up by name, ignoring case.
    pub fn by_name(name: &str) -> BowResult<GeneratorOptions> {
        match name.to_ascii_lowercase().as_str() {
            "identity" => Ok(Self::IDENTITY),
            "preprocess" => Ok(Self::PREPROCESS),
            "normalise" => Ok(Self::NORMALISE),
            "norm_and_transform" => Ok(Self::NORM_AND_TRANSFORM),
            "transform" => Ok(Self::TRANSFORM),
            _ => Err(BowErr::UnknownProfile(name.to_owned())),
        }
    }
}

/// Random augmentation and normalisation of `H × W × C` images.
#[derive(Debug, Default)]
pub struct ImageDataGenerator {
    options: GeneratorOptions,
    mean: Option<Array1<f32>>,
    std: Option<Array1<f32>>,
    warned: AtomicBool,
}

impl ImageDataGenerator {
    pub fn new(options: GeneratorOptions) -> Self {
        Self {
            options,
            ..Self::default()
        }
    }

    pub fn options(&self) -> &GeneratorOptions {
        &self.options
    }

    /// Per-channel statistics used by the feature-wise options, from an
    /// `N × H × W × C` sample.
    pub fn fit(&mut self, x: ArrayView4<f32>) -> BowResult<()> {
        if x.is_empty() {
            return Err(BowErr::EmptyBatch);
        }
        let channels = x.len_of(Axis(3));
        let mut mean = Array1::zeros(channels);
        let mut std = Array1::zeros(channels);
        for (c, plane) in x.axis_iter(Axis(3)).enumerate() {
            let n = plane.len() as f32;
            let m = plane.sum() / n;
            let var = plane.fold(0., |acc, v| acc + (v - m) * (v - m)) / n;
            mean[c] = m;
            std[c] = var.sqrt();
        }
        debug!("Fitted feature-wise mean {:?} and std {:?}", mean, std);
        self.mean = Some(mean);
        self.std = Some(std);
        Ok(())
    }

    /// Normalise one image in the configured order: preprocessing function,
    /// rescale, sample-wise then feature-wise statistics.
    pub fn standardize(&self, x: Array3<f32>) -> BowResult<Array3<f32>> {
        let opts = &self.options;
        let mut x = match opts.preprocessing {
            Preprocessing::None => x,
            Preprocessing::Vgg16 => preprocess_input(x, DimOrdering::Tf)?,
        };
        if let Some(scale) = opts.rescale {
            x *= scale;
        }
        if opts.samplewise_center {
            let m = x.mean().unwrap_or(0.);
            x -= m;
        }
        if opts.samplewise_std_normalization {
            let m = x.mean().unwrap_or(0.);
            let var = x.fold(0., |acc, v| acc + (v - m) * (v - m)) / x.len().max(1) as f32;
            x /= var.sqrt() + STD_EPSILON;
        }
        if opts.featurewise_center {
            match &self.mean {
                Some(mean) => x -= mean,
                None => self.warn_unfitted("featurewise_center"),
            }
        }
        if opts.featurewise_std_normalization {
            match &self.std {
                Some(std) => x /= &(std + STD_EPSILON),
                None => self.warn_unfitted("featurewise_std_normalization"),
            }
        }
        Ok(x)
    }

    fn warn_unfitted(&self, option: &str) {
        if !self.warned.swap(true, Ordering::Relaxed) {
            warn!(
                "{} is set but the generator was never fit on any data, skipping it",
                option
            );
        }
    }

    /// Random affine warp, channel shift and flips of one image.
    pub fn random_transform<R: Rng + ?Sized>(&self, x: &Array3<f32>, rng: &mut R) -> Array3<f32> {
        let opts = &self.options;
        let (h, w, _) = x.dim();
        let mut uniform = |range: f32| {
            if range > 0. {
                rng.gen_range(-range..=range)
            } else {
                0.
            }
        };

        let theta = uniform(opts.rotation_range).to_radians();
        let tx = uniform(opts.height_shift_range) * h as f32;
        let ty = uniform(opts.width_shift_range) * w as f32;
        let shear = uniform(opts.shear_range);
        let (zx, zy) = (1. + uniform(opts.zoom_range), 1. + uniform(opts.zoom_range));
        let channel_shift = uniform(opts.channel_shift_range);

        // (row, col) homogeneous coordinates, output to input
        let rotation = Matrix3::new(
            theta.cos(), -theta.sin(), 0.,
            theta.sin(), theta.cos(), 0.,
            0., 0., 1.,
        );
        let shift = Matrix3::new(1., 0., tx, 0., 1., ty, 0., 0., 1.);
        let shear = Matrix3::new(1., -shear.sin(), 0., 0., shear.cos(), 0., 0., 0., 1.);
        let zoom = Matrix3::new(zx, 0., 0., 0., zy, 0., 0., 0., 1.);
        let transform = offset_center(rotation * shift * shear * zoom, h, w);

        let mut out = if transform == Matrix3::identity() {
            x.clone()
        } else {
            apply_transform(x, &transform, opts.fill_mode, opts.cval)
        };

        if channel_shift != 0. {
            shift_channels(&mut out, channel_shift);
        }
        if opts.horizontal_flip && rng.gen_bool(0.5) {
            out.invert_axis(Axis(1));
        }
        if opts.vertical_flip && rng.gen_bool(0.5) {
            out.invert_axis(Axis(0));
        }
        out
    }

    /// Batches of augmented images read from class sub-folders of `directory`.
    ///
    /// `target_size` is `(height, width)`. Classes are the sorted folder
    /// names and labels come one-hot in that order.
    pub fn flow_from_directory<P: AsRef<Path>>(
        &self,
        directory: P,
        target_size: (u32, u32),
        batch_size: usize,
        seed: Option<u64>,
    ) -> BowResult<DirectoryIterator<'_>> {
        if batch_size == 0 {
            return Err(BowErr::Config("batch size must be at least 1".into()));
        }
        let directory = directory.as_ref();
        let mut class_names = Vec::new();
        let mut filenames = Vec::new();
        let mut classes = Vec::new();
        for class in class_dirs(directory)? {
            let name = match class.file_name().and_then(|n| n.to_str()) {
                Some(name) => name.to_owned(),
                None => continue,
            };
            for file in image_files(&class)? {
                filenames.push(file);
                classes.push(class_names.len());
            }
            class_names.push(name);
        }
        if filenames.is_empty() {
            return Err(BowErr::NoImages(directory.to_path_buf()));
        }
        info!(
            "Found {} images belonging to {} classes.",
            filenames.len(),
            class_names.len()
        );

        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let order = (0..filenames.len()).collect();
        Ok(DirectoryIterator {
            generator: self,
            class_names,
            filenames,
            classes,
            target_size,
            batch_size,
            rng,
            order,
            cursor: 0,
        })
    }
}

/// Re-centre a transform so that it acts about the middle of an `h × w` image.
fn offset_center(m: Matrix3<f32>, h: usize, w: usize) -> Matrix3<f32> {
    let (ox, oy) = (h as f32 / 2. + 0.5, w as f32 / 2. + 0.5);
    let offset = Matrix3::new(1., 0., ox, 0., 1., oy, 0., 0., 1.);
    let reset = Matrix3::new(1., 0., -ox, 0., 1., -oy, 0., 0., 1.);
    offset * m * reset
}

/// Map an out-of-range index back into `0..n`, or `None` for constant fill.
fn fill_index(i: isize, n: usize, mode: FillMode) -> Option<usize> {
    let n = n as isize;
    if (0..n).contains(&i) {
        return Some(i as usize);
    }
    match mode {
        FillMode::Constant => None,
        FillMode::Nearest => Some(i.clamp(0, n - 1) as usize),
        FillMode::Reflect => {
            let period = 2 * n;
            let j = i.rem_euclid(period);
            Some(if j < n { j } else { period - 1 - j } as usize)
        }
        FillMode::Wrap => Some(i.rem_euclid(n) as usize),
    }
}

/// Nearest neighbour resampling where `transform` maps output pixels to input pixels.
fn apply_transform(x: &Array3<f32>, transform: &Matrix3<f32>, mode: FillMode, cval: f32) -> Array3<f32> {
    let (h, w, c) = x.dim();
    let mut out = Array3::from_elem((h, w, c), cval);
    for r in 0..h {
        for col in 0..w {
            let src = transform * Vector3::new(r as f32, col as f32, 1.);
            let (sr, sc) = (src[0].round() as isize, src[1].round() as isize);
            if let (Some(sr), Some(sc)) = (fill_index(sr, h, mode), fill_index(sc, w, mode)) {
                out.slice_mut(s![r, col, ..]).assign(&x.slice(s![sr, sc, ..]));
            }
        }
    }
    out
}

/// Add `intensity` to every channel, clipped to the original value range.
fn shift_channels(x: &mut Array3<f32>, intensity: f32) {
    let lo = x.fold(f32::INFINITY, |a, &v| a.min(v));
    let hi = x.fold(f32::NEG_INFINITY, |a, &v| a.max(v));
    for mut channel in x.axis_iter_mut(Axis(2)) {
        channel.mapv_inplace(|v| (v + intensity).clamp(lo, hi));
    }
}

/// `H × W × 3` float array of an 8-bit image.
pub fn img_to_array(image: &RgbImage) -> Array3<f32> {
    let (w, h) = image.dimensions();
    Array3::from_shape_fn((h as usize, w as usize, 3), |(r, c, ch)| {
        image.get_pixel(c as u32, r as u32)[ch] as f32
    })
}

/// Endless iterator over `(images, one-hot labels)` batches of a class folder tree.
///
/// Files are reshuffled at the start of every epoch; the last batch of an
/// epoch holds whatever is left.
pub struct DirectoryIterator<'a> {
    generator: &'a ImageDataGenerator,
    class_names: Vec<String>,
    filenames: Vec<PathBuf>,
    classes: Vec<usize>,
    target_size: (u32, u32),
    batch_size: usize,
    rng: StdRng,
    order: Vec<usize>,
    cursor: usize,
}

impl<'a> DirectoryIterator<'a> {
    pub fn samples(&self) -> usize {
        self.filenames.len()
    }

    pub fn num_classes(&self) -> usize {
        self.class_names.len()
    }

    pub fn class_names(&self) -> &[String] {
        &self.class_names
    }

    pub fn filenames(&self) -> &[PathBuf] {
        &self.filenames
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn load(&mut self, index: usize) -> BowResult<Array3<f32>> {
        let (height, width) = self.target_size;
        let img = load_rgb(&self.filenames[index])?;
        let img = if img.dimensions() == (width, height) {
            img
        } else {
            imageops::resize(&img, width, height, FilterType::Nearest)
        };
        let x = self.generator.random_transform(&img_to_array(&img), &mut self.rng);
        self.generator.standardize(x)
    }

    /// Load the next batch.
    pub fn next_batch(&mut self) -> BowResult<(Array4<f32>, Array2<f32>)> {
        if self.cursor == 0 {
            self.order.shuffle(&mut self.rng);
        }
        let end = (self.cursor + self.batch_size).min(self.samples());
        let indices: Vec<usize> = self.order[self.cursor..end].to_vec();
        self.cursor = if end == self.samples() { 0 } else { end };

        let (height, width) = self.target_size;
        let mut x = Array4::zeros((indices.len(), height as usize, width as usize, 3));
        let mut y = Array2::zeros((indices.len(), self.num_classes()));
        for (i, &index) in indices.iter().enumerate() {
            let img = self.load(index)?;
            x.index_axis_mut(Axis(0), i).assign(&img);
            y[[i, self.classes[index]]] = 1.;
        }
        Ok((x, y))
    }
}

impl<'a> Iterator for DirectoryIterator<'a> {
    type Item = BowResult<(Array4<f32>, Array2<f32>)>;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.next_batch())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use image::Rgb;
    use ndarray::Array;

    fn ramp(h: usize, w: usize) -> Array3<f32> {
        Array3::from_shape_fn((h, w, 3), |(r, c, ch)| (r * 10 + c + ch * 100) as f32)
    }

    #[test]
    fn profiles_by_name() {
        assert_eq!(
            DataGeneratorConfig::by_name("PREPROCESS").unwrap(),
            DataGeneratorConfig::PREPROCESS
        );
        let t = DataGeneratorConfig::by_name("norm_and_transform").unwrap();
        assert!(t.featurewise_std_normalization && t.horizontal_flip);
        assert_eq!(t.fill_mode, FillMode::Reflect);
        assert_eq!(t.rotation_range, 15.);
        assert!(matches!(
            DataGeneratorConfig::by_name("jitter"),
            Err(BowErr::UnknownProfile(_))
        ));
    }

    #[test]
    fn options_deserialize_with_defaults() {
        let opts: GeneratorOptions =
            serde_json::from_str(r#"{"fill_mode": "wrap", "rescale": 0.5}"#).unwrap();
        assert_eq!(opts.fill_mode, FillMode::Wrap);
        assert_eq!(opts.rescale, Some(0.5));
        assert_eq!(opts.preprocessing, Preprocessing::None);
    }

    #[test]
    fn identity_transform_leaves_image_alone() {
        let gen = ImageDataGenerator::new(DataGeneratorConfig::PREPROCESS);
        let x = ramp(5, 7);
        let mut rng = StdRng::seed_from_u64(0);
        assert_eq!(gen.random_transform(&x, &mut rng), x);
    }

    #[test]
    fn fill_modes() {
        assert_eq!(fill_index(-1, 4, FillMode::Constant), None);
        assert_eq!(fill_index(-3, 4, FillMode::Nearest), Some(0));
        assert_eq!(fill_index(5, 4, FillMode::Nearest), Some(3));
        assert_eq!(fill_index(-1, 4, FillMode::Reflect), Some(0));
        assert_eq!(fill_index(4, 4, FillMode::Reflect), Some(3));
        assert_eq!(fill_index(5, 4, FillMode::Wrap), Some(1));
    }

    #[test]
    fn shift_with_constant_fill() {
        let gen = ImageDataGenerator::new(GeneratorOptions {
            fill_mode: FillMode::Constant,
            cval: -1.,
            ..GeneratorOptions::default()
        });
        let x = ramp(4, 4);
        let m = offset_center(Matrix3::new(1., 0., 0., 0., 1., 2., 0., 0., 1.), 4, 4);
        let out = apply_transform(&x, &m, gen.options.fill_mode, gen.options.cval);
        // Output column c reads input column c + 2.
        assert_eq!(out[[1, 0, 0]], x[[1, 2, 0]]);
        assert_eq!(out[[1, 3, 0]], -1.);
    }

    #[test]
    fn augmentation_keeps_shape() {
        let gen = ImageDataGenerator::new(DataGeneratorConfig::TRANSFORM);
        let mut rng = StdRng::seed_from_u64(5);
        let x = ramp(16, 12);
        for _ in 0..5 {
            assert_eq!(gen.random_transform(&x, &mut rng).dim(), (16, 12, 3));
        }
    }

    #[test]
    fn samplewise_normalisation() {
        let gen = ImageDataGenerator::new(GeneratorOptions {
            samplewise_center: true,
            samplewise_std_normalization: true,
            ..GeneratorOptions::default()
        });
        let y = gen.standardize(ramp(4, 4)).unwrap();
        let n = y.len() as f32;
        let var = y.fold(0., |a, v| a + v * v) / n;
        assert_abs_diff_eq!(y.sum() / n, 0., epsilon = 1e-4);
        assert_abs_diff_eq!(var, 1., epsilon = 1e-3);
    }

    #[test]
    fn featurewise_needs_fit() {
        let mut gen = ImageDataGenerator::new(GeneratorOptions {
            featurewise_center: true,
            ..GeneratorOptions::default()
        });
        let x = ramp(2, 2);
        // Not fit: skipped
        assert_eq!(gen.standardize(x.clone()).unwrap(), x);

        let sample = Array::from_shape_fn((2, 2, 2, 3), |(n, _, _, ch)| (n * 2 + ch) as f32);
        gen.fit(sample.view()).unwrap();
        let y = gen.standardize(Array3::from_elem((1, 1, 3), 1.)).unwrap();
        // channel means are 1, 2, 3
        assert_eq!(y.as_slice().unwrap(), &[0., -1., -2.]);
    }

    #[test]
    fn flow_from_directory_batches() {
        let dir = tempfile::tempdir().unwrap();
        for (class, n) in [("forest", 3), ("coast", 2)] {
            let class_dir = dir.path().join(class);
            std::fs::create_dir_all(&class_dir).unwrap();
            for i in 0..n {
                RgbImage::from_pixel(10, 6, Rgb([i as u8 * 40, 90, 10]))
                    .save(class_dir.join(format!("{}.png", i)))
                    .unwrap();
            }
        }
        let gen = ImageDataGenerator::new(GeneratorOptions::default());
        let mut it = gen.flow_from_directory(dir.path(), (4, 8), 2, Some(1)).unwrap();
        assert_eq!(it.samples(), 5);
        assert_eq!(it.class_names(), &["coast".to_owned(), "forest".to_owned()]);

        let sizes: Vec<usize> = (0..4).map(|_| it.next_batch().unwrap().0.len_of(Axis(0))).collect();
        assert_eq!(sizes, vec![2, 2, 1, 2]);

        let (x, y) = it.next().unwrap().unwrap();
        assert_eq!(x.dim(), (2, 4, 8, 3));
        assert_eq!(y.dim(), (2, 2));
        assert!(y.rows().into_iter().all(|row| row.sum() == 1.));
    }

    #[test]
    fn empty_tree_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("empty_class")).unwrap();
        let gen = ImageDataGenerator::default();
        assert!(matches!(
            gen.flow_from_directory(dir.path(), (8, 8), 4, None),
            Err(BowErr::NoImages(_))
        ));
    }
}
