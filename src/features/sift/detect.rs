use nalgebra::{Matrix3, Vector3};

use super::pyramid::Plane;
use super::{KeyPoint, SiftConfig};

/// Keypoints closer than this to the border of an octave are not searched.
pub const IMG_BORDER: usize = 5;
const MAX_INTERP_STEPS: usize = 5;
const ORI_HIST_BINS: usize = 36;
const ORI_SIG_FCTR: f32 = 1.5;
const ORI_RADIUS: f32 = 3.0 * ORI_SIG_FCTR;
const ORI_PEAK_RATIO: f32 = 0.8;

/// Intensities live in `0..=255`; derivatives are expressed per unit intensity.
const IMG_SCALE: f32 = 1.0 / 255.0;

/// Sub-pixel refined extremum, in octave coordinates.
struct Extremum {
    layer: usize,
    r: usize,
    c: usize,
    xi: f32,
    xr: f32,
    xc: f32,
    contrast: f32,
}

/// Find difference-of-gaussian extrema, refine them and assign orientations.
///
/// Returned keypoints are in the coordinates of the upsampled base image; the
/// caller rescales them.
pub fn find_scale_space_extrema(
    gauss: &[Vec<Plane>],
    dog: &[Vec<Plane>],
    config: &SiftConfig,
) -> Vec<KeyPoint> {
    let layers = config.octave_layers;
    let threshold = (0.5 * config.contrast_threshold / layers as f64 * 255.0).floor() as f32;
    let mut keypoints = Vec::new();

    for (o, octave) in dog.iter().enumerate() {
        for i in 1..=layers {
            let (prev, img, next) = (&octave[i - 1], &octave[i], &octave[i + 1]);
            let (rows, cols) = img.shape();
            if rows <= 2 * IMG_BORDER || cols <= 2 * IMG_BORDER {
                continue;
            }
            for r in IMG_BORDER..rows - IMG_BORDER {
                for c in IMG_BORDER..cols - IMG_BORDER {
                    let val = img[(r, c)];
                    if val.abs() <= threshold || !is_extremum(prev, img, next, r, c, val) {
                        continue;
                    }
                    let ext = match refine(octave, i, r, c, config) {
                        Some(ext) => ext,
                        None => continue,
                    };
                    let scale = (1usize << o) as f32;
                    let size = config.sigma as f32
                        * 2f32.powf((ext.layer as f32 + ext.xi) / layers as f32)
                        * scale
                        * 2.0;
                    let scl_octv = size * 0.5 / scale;
                    let hist = orientation_histogram(
                        &gauss[o][ext.layer],
                        ext.r,
                        ext.c,
                        (ORI_RADIUS * scl_octv).round() as isize,
                        ORI_SIG_FCTR * scl_octv,
                    );
                    for angle in dominant_orientations(&hist) {
                        keypoints.push(KeyPoint {
                            x: (ext.c as f32 + ext.xc) * scale,
                            y: (ext.r as f32 + ext.xr) * scale,
                            size,
                            angle,
                            response: ext.contrast.abs(),
                            octave: o,
                            layer: ext.layer,
                        });
                    }
                }
            }
        }
    }
    keypoints
}

fn is_extremum(prev: &Plane, img: &Plane, next: &Plane, r: usize, c: usize, val: f32) -> bool {
    let mut neighbours = [prev, img, next].into_iter().flat_map(move |p| {
        (r - 1..=r + 1).flat_map(move |rr| (c - 1..=c + 1).map(move |cc| p[(rr, cc)]))
    });
    if val > 0.0 {
        neighbours.all(|n| val >= n)
    } else {
        neighbours.all(|n| val <= n)
    }
}

/// Gradient and Hessian of the DoG at `(layer, r, c)`, per unit intensity.
fn derivatives(octave: &[Plane], layer: usize, r: usize, c: usize) -> (Vector3<f32>, Matrix3<f32>) {
    let (prev, img, next) = (&octave[layer - 1], &octave[layer], &octave[layer + 1]);
    let deriv_scale = IMG_SCALE * 0.5;
    let second_deriv_scale = IMG_SCALE;
    let cross_deriv_scale = IMG_SCALE * 0.25;

    let dd = Vector3::new(
        (img[(r, c + 1)] - img[(r, c - 1)]) * deriv_scale,
        (img[(r + 1, c)] - img[(r - 1, c)]) * deriv_scale,
        (next[(r, c)] - prev[(r, c)]) * deriv_scale,
    );

    let v2 = img[(r, c)] * 2.0;
    let dxx = (img[(r, c + 1)] + img[(r, c - 1)] - v2) * second_deriv_scale;
    let dyy = (img[(r + 1, c)] + img[(r - 1, c)] - v2) * second_deriv_scale;
    let dss = (next[(r, c)] + prev[(r, c)] - v2) * second_deriv_scale;
    let dxy = (img[(r + 1, c + 1)] - img[(r + 1, c - 1)] - img[(r - 1, c + 1)]
        + img[(r - 1, c - 1)])
        * cross_deriv_scale;
    let dxs = (next[(r, c + 1)] - next[(r, c - 1)] - prev[(r, c + 1)] + prev[(r, c - 1)])
        * cross_deriv_scale;
    let dys = (next[(r + 1, c)] - next[(r - 1, c)] - prev[(r + 1, c)] + prev[(r - 1, c)])
        * cross_deriv_scale;

    let h = Matrix3::new(dxx, dxy, dxs, dxy, dyy, dys, dxs, dys, dss);
    (dd, h)
}

/// Interpolate an extremum to sub-pixel accuracy, rejecting unstable ones
/// (drifting out of the octave, low contrast, or lying on an edge).
fn refine(octave: &[Plane], layer: usize, r: usize, c: usize, config: &SiftConfig) -> Option<Extremum> {
    let layers = config.octave_layers as isize;
    let (rows, cols) = octave[layer].shape();
    let border = IMG_BORDER as isize;
    let (mut layer, mut r, mut c) = (layer as isize, r as isize, c as isize);
    let mut offset: Vector3<f32> = Vector3::zeros();
    let mut converged = false;

    for _ in 0..MAX_INTERP_STEPS {
        let (dd, h) = derivatives(octave, layer as usize, r as usize, c as usize);
        offset = h.lu().solve(&dd).map(|x| -x).unwrap_or_else(|| Vector3::zeros());
        let (xc, xr, xi): (f32, f32, f32) = (offset[0], offset[1], offset[2]);

        if xi.abs() < 0.5 && xr.abs() < 0.5 && xc.abs() < 0.5 {
            converged = true;
            break;
        }
        let limit = (i32::MAX / 3) as f32;
        if xi.abs() > limit || xr.abs() > limit || xc.abs() > limit {
            return None;
        }

        c += xc.round() as isize;
        r += xr.round() as isize;
        layer += xi.round() as isize;
        if layer < 1
            || layer > layers
            || c < border
            || c >= cols as isize - border
            || r < border
            || r >= rows as isize - border
        {
            return None;
        }
    }
    if !converged {
        return None;
    }

    let (layer, r, c) = (layer as usize, r as usize, c as usize);
    let (dd, h) = derivatives(octave, layer, r, c);
    let t = dd.dot(&offset);
    let contrast = octave[layer][(r, c)] * IMG_SCALE + t * 0.5;
    if contrast.abs() * (config.octave_layers as f32) < config.contrast_threshold as f32 {
        return None;
    }

    let (dxx, dyy, dxy) = (h[(0, 0)], h[(1, 1)], h[(0, 1)]);
    let tr = dxx + dyy;
    let det = dxx * dyy - dxy * dxy;
    let edge = config.edge_threshold as f32;
    if det <= 0.0 || tr * tr * edge >= (edge + 1.0) * (edge + 1.0) * det {
        return None;
    }

    Some(Extremum {
        layer,
        r,
        c,
        xi: offset[2],
        xr: offset[1],
        xc: offset[0],
        contrast,
    })
}

/// Gradient angle in degrees, `0..360`.
#[inline]
pub(crate) fn angle_deg(dy: f32, dx: f32) -> f32 {
    let a = dy.atan2(dx).to_degrees();
    if a < 0.0 {
        a + 360.0
    } else {
        a
    }
}

/// Smoothed, magnitude weighted histogram of gradient orientations around `(r, c)`.
fn orientation_histogram(img: &Plane, r: usize, c: usize, radius: isize, sigma: f32) -> [f32; ORI_HIST_BINS] {
    let n = ORI_HIST_BINS;
    let (rows, cols) = img.shape();
    let expf_scale = -1.0 / (2.0 * sigma * sigma);
    let mut raw = [0f32; ORI_HIST_BINS];

    for i in -radius..=radius {
        let y = r as isize + i;
        if y <= 0 || y >= rows as isize - 1 {
            continue;
        }
        for j in -radius..=radius {
            let x = c as isize + j;
            if x <= 0 || x >= cols as isize - 1 {
                continue;
            }
            let (y, x) = (y as usize, x as usize);
            let dx = img[(y, x + 1)] - img[(y, x - 1)];
            let dy = img[(y - 1, x)] - img[(y + 1, x)];
            let w = (((i * i + j * j) as f32) * expf_scale).exp();
            let mag = (dx * dx + dy * dy).sqrt();
            let bin = ((n as f32 / 360.0) * angle_deg(dy, dx)).round() as usize % n;
            raw[bin] += w * mag;
        }
    }

    let mut hist = [0f32; ORI_HIST_BINS];
    for i in 0..n {
        let at = |k: isize| raw[(i as isize + k).rem_euclid(n as isize) as usize];
        hist[i] = (at(-2) + at(2)) * (1.0 / 16.0) + (at(-1) + at(1)) * (4.0 / 16.0) + at(0) * (6.0 / 16.0);
    }
    hist
}

/// Angles of every histogram peak within 80% of the highest one.
fn dominant_orientations(hist: &[f32; ORI_HIST_BINS]) -> Vec<f32> {
    let n = ORI_HIST_BINS;
    let omax = hist.iter().cloned().fold(0f32, f32::max);
    let mag_thr = omax * ORI_PEAK_RATIO;
    let mut angles = Vec::new();
    if omax <= 0.0 {
        return angles;
    }

    for j in 0..n {
        let l = if j > 0 { j - 1 } else { n - 1 };
        let r2 = if j < n - 1 { j + 1 } else { 0 };
        if hist[j] > hist[l] && hist[j] > hist[r2] && hist[j] >= mag_thr {
            let mut bin = j as f32 + 0.5 * (hist[l] - hist[r2]) / (hist[l] - 2.0 * hist[j] + hist[r2]);
            if bin < 0.0 {
                bin += n as f32;
            } else if bin >= n as f32 {
                bin -= n as f32;
            }
            let mut angle = 360.0 - (360.0 / n as f32) * bin;
            if (angle - 360.0).abs() < f32::EPSILON {
                angle = 0.0;
            }
            angles.push(angle);
        }
    }
    angles
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn angles_cover_the_circle() {
        assert_eq!(angle_deg(0.0, 1.0), 0.0);
        assert!((angle_deg(1.0, 0.0) - 90.0).abs() < 1e-4);
        assert!((angle_deg(-1.0, 0.0) - 270.0).abs() < 1e-4);
    }

    #[test]
    fn single_peak_gives_single_orientation() {
        let mut hist = [0f32; ORI_HIST_BINS];
        hist[8] = 10.0;
        hist[7] = 5.0;
        hist[9] = 5.0;
        let angles = dominant_orientations(&hist);
        assert_eq!(angles.len(), 1);
        assert!((angles[0] - (360.0 - 80.0)).abs() < 1e-3);
    }

    #[test]
    fn flat_histogram_has_no_orientation() {
        assert!(dominant_orientations(&[0f32; ORI_HIST_BINS]).is_empty());
    }

    #[test]
    fn orientation_follows_gradient() {
        // Intensity increasing to the right: gradient angle 0.
        let img = Plane::from_fn(21, 21, |_, c| c as f32 * 10.0);
        let hist = orientation_histogram(&img, 10, 10, 4, 2.0);
        let best = hist
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .unwrap()
            .0;
        assert_eq!(best, 0);
    }
}
