use nalgebra::DMatrix;

/// A single channel plane indexed `(row, col)`.
pub type Plane = DMatrix<f32>;

/// List of gaussian kernels at which to blur each octave, relative to the
/// previous level. The first entry is the absolute blur of the octave base.
pub fn gaussian_kernels(sigma: f64, num_intervals: usize) -> Vec<f64> {
    let images_per_octave = num_intervals + 3;
    let k: f64 = (2.0_f64).powf(1.0 / num_intervals as f64);
    let mut kernels: Vec<f64> = vec![0.0; images_per_octave];

    kernels[0] = sigma;
    for (idx, item) in kernels.iter_mut().enumerate().skip(1) {
        let sigma_previous = (k.powf(idx as f64 - 1.0)) * sigma;
        let sigma_total = k * sigma_previous;
        *item = (sigma_total.powi(2) - sigma_previous.powi(2)).sqrt();
    }

    kernels
}

/// Compute the number of octaves in the image pyramid as a function of height
/// and width of the (already upsampled) base image.
pub fn number_of_octaves(height: usize, width: usize) -> usize {
    let smallest = height.min(width).max(1) as f64;
    (smallest.log2() - 1.0).round().max(1.0) as usize
}

/// Reflect an out of range index back into `0..n` without repeating the edge
/// sample (`gfedcb|abcdefgh|gfedcba`).
#[inline]
pub(crate) fn reflect101(i: isize, n: usize) -> usize {
    if n == 1 {
        return 0;
    }
    let n = n as isize;
    let period = 2 * (n - 1);
    let mut i = i.rem_euclid(period);
    if i >= n {
        i = period - i;
    }
    i as usize
}

fn gaussian_kernel_1d(sigma: f64) -> Vec<f32> {
    let radius = ((4.0 * sigma).round() as isize).max(1);
    let mut kernel: Vec<f32> = (-radius..=radius)
        .map(|x| (-(x * x) as f64 / (2.0 * sigma * sigma)).exp() as f32)
        .collect();
    let sum: f32 = kernel.iter().sum();
    kernel.iter_mut().for_each(|k| *k /= sum);
    kernel
}

/// Separable gaussian blur with reflected borders.
pub fn gaussian_blur(plane: &Plane, sigma: f64) -> Plane {
    if sigma <= 0.0 {
        return plane.clone();
    }
    let kernel = gaussian_kernel_1d(sigma);
    let radius = (kernel.len() / 2) as isize;
    let (rows, cols) = plane.shape();

    let horizontal = Plane::from_fn(rows, cols, |r, c| {
        kernel.iter().enumerate().fold(0.0, |acc, (k, w)| {
            let cc = reflect101(c as isize + k as isize - radius, cols);
            acc + w * plane[(r, cc)]
        })
    });
    Plane::from_fn(rows, cols, |r, c| {
        kernel.iter().enumerate().fold(0.0, |acc, (k, w)| {
            let rr = reflect101(r as isize + k as isize - radius, rows);
            acc + w * horizontal[(rr, c)]
        })
    })
}

/// Double both dimensions with bilinear interpolation (pixel centres aligned).
pub fn upsample(plane: &Plane) -> Plane {
    let (rows, cols) = plane.shape();
    let sample = |d: usize, n: usize| -> (usize, usize, f32) {
        let s = ((d as f32 + 0.5) * 0.5 - 0.5).max(0.0);
        let s0 = (s.floor() as usize).min(n - 1);
        let s1 = (s0 + 1).min(n - 1);
        (s0, s1, s - s0 as f32)
    };
    Plane::from_fn(rows * 2, cols * 2, |r, c| {
        let (r0, r1, fr) = sample(r, rows);
        let (c0, c1, fc) = sample(c, cols);
        let top = plane[(r0, c0)] * (1.0 - fc) + plane[(r0, c1)] * fc;
        let bottom = plane[(r1, c0)] * (1.0 - fc) + plane[(r1, c1)] * fc;
        top * (1.0 - fr) + bottom * fr
    })
}

/// Halve both dimensions by keeping every other sample.
pub fn downsample(plane: &Plane) -> Plane {
    let (rows, cols) = plane.shape();
    Plane::from_fn((rows / 2).max(1), (cols / 2).max(1), |r, c| {
        plane[((r * 2).min(rows - 1), (c * 2).min(cols - 1))]
    })
}

/// Upsample the input and blur it from its assumed blur up to `sigma`.
pub fn base_image(gray: &Plane, sigma: f64, assumed_blur: f64) -> Plane {
    let scaled = upsample(gray);
    let sigma_diff = (sigma * sigma - 4.0 * assumed_blur * assumed_blur)
        .max(0.01)
        .sqrt();
    gaussian_blur(&scaled, sigma_diff)
}

/// Gaussian scale space: `num_octaves` octaves of `num_intervals + 3` levels.
///
/// The first level of every octave after the first is the level
/// `num_intervals` of the previous octave, decimated by two.
pub fn gaussian_pyramid(base: &Plane, num_octaves: usize, kernels: &[f64]) -> Vec<Vec<Plane>> {
    let num_intervals = kernels.len() - 3;
    let mut pyramid: Vec<Vec<Plane>> = Vec::with_capacity(num_octaves);
    for o in 0..num_octaves {
        let first = match o {
            0 => base.clone(),
            _ => downsample(&pyramid[o - 1][num_intervals]),
        };
        let mut octave = Vec::with_capacity(kernels.len());
        octave.push(first);
        for &sigma in &kernels[1..] {
            let blurred = gaussian_blur(&octave[octave.len() - 1], sigma);
            octave.push(blurred);
        }
        pyramid.push(octave);
    }
    pyramid
}

/// Produce a pyramid of difference of gaussians.
pub fn difference_of_gaussians(gaussians: &[Vec<Plane>]) -> Vec<Vec<Plane>> {
    gaussians
        .iter()
        .map(|octave| {
            octave
                .iter()
                .zip(octave.iter().skip(1))
                .map(|(first, second)| second - first)
                .collect()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn gaussian_kernels_default() {
        let result = gaussian_kernels(1.6, 3);
        let expected = [1.6, 1.2262735, 1.54500779, 1.94658784, 2.452547, 3.09001559];
        for (r, e) in result.iter().zip(expected.iter()) {
            assert_relative_eq!(r, e, epsilon = 1e-6);
        }
    }

    #[test]
    fn number_of_octaves_follows_smallest_side() {
        assert_eq!(number_of_octaves(100, 200), 6);
        assert_eq!(number_of_octaves(223, 324), 7);
        assert_eq!(number_of_octaves(2, 2), 1);
    }

    #[test]
    fn reflect_101_borders() {
        assert_eq!(reflect101(-1, 5), 1);
        assert_eq!(reflect101(-2, 5), 2);
        assert_eq!(reflect101(5, 5), 3);
        assert_eq!(reflect101(2, 5), 2);
        assert_eq!(reflect101(-3, 1), 0);
    }

    #[test]
    fn blur_preserves_constant_planes() {
        let plane = Plane::from_element(9, 7, 42.0);
        let blurred = gaussian_blur(&plane, 2.0);
        for v in blurred.iter() {
            assert_relative_eq!(*v, 42.0, epsilon = 1e-3);
        }
    }

    #[test]
    fn resampling_shapes() {
        let plane = Plane::from_fn(5, 8, |r, c| (r * 8 + c) as f32);
        assert_eq!(upsample(&plane).shape(), (10, 16));
        assert_eq!(downsample(&plane).shape(), (2, 4));
        assert_eq!(downsample(&plane)[(1, 3)], plane[(2, 6)]);
    }

    #[test]
    fn pyramid_layout() {
        let gray = Plane::from_fn(32, 40, |r, c| ((r ^ c) & 8) as f32 * 20.0);
        let base = base_image(&gray, 1.6, 0.5);
        let kernels = gaussian_kernels(1.6, 3);
        let octaves = number_of_octaves(base.nrows(), base.ncols());
        let gauss = gaussian_pyramid(&base, octaves, &kernels);
        let dog = difference_of_gaussians(&gauss);
        assert_eq!(gauss.len(), octaves);
        assert!(gauss.iter().all(|o| o.len() == 6));
        assert!(dog.iter().all(|o| o.len() == 5));
        assert_eq!(gauss[1][0].shape(), (32, 40));
    }
}
