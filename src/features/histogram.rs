use image::RgbImage;
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::colour::to_luv;
use crate::features::FeatureExtractor;
use crate::{BowErr, BowResult};

/// Joint histogram of the u and v chrominance channels of CIE L*u*v*.
///
/// Produces a single `1 × bins²` descriptor per image, normalised as a
/// probability density over the binned `(u, v)` plane.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ColourHistogram {
    pub bins: usize,
    /// `[(u_min, u_max), (v_min, v_max)]`. Defaults to the observed extent of each channel.
    pub range: Option<[(f64, f64); 2]>,
    /// One weight per pixel, row-major.
    pub weights: Option<Vec<f64>>,
}

impl Default for ColourHistogram {
    fn default() -> Self {
        Self {
            bins: 10,
            range: None,
            weights: None,
        }
    }
}

impl ColourHistogram {
    pub fn new(bins: usize) -> Self {
        Self {
            bins,
            ..Self::default()
        }
    }

    pub fn with_range(mut self, range: [(f64, f64); 2]) -> Self {
        self.range = Some(range);
        self
    }

    pub fn with_weights(mut self, weights: Vec<f64>) -> Self {
        self.weights = Some(weights);
        self
    }

    /// Histogram of paired samples, flattened row-major over (u bin, v bin).
    pub fn histogram2d(&self, u: &[f64], v: &[f64]) -> BowResult<Vec<f64>> {
        let bins = self.bins;
        if bins == 0 {
            return Err(BowErr::Config("histogram needs at least one bin".into()));
        }
        if let Some(w) = &self.weights {
            if w.len() != u.len() {
                return Err(BowErr::Config(format!(
                    "{} histogram weights for {} pixels",
                    w.len(),
                    u.len()
                )));
            }
        }

        let (u_range, v_range) = match self.range {
            Some([ur, vr]) => (ur, vr),
            None => (extent(u), extent(v)),
        };
        for (lo, hi) in [u_range, v_range] {
            if !(lo < hi) {
                return Err(BowErr::Config(format!("empty histogram range ({}, {})", lo, hi)));
            }
        }

        let mut hist = vec![0f64; bins * bins];
        for (i, (&x, &y)) in u.iter().zip(v).enumerate() {
            let (bx, by) = match (bin_of(x, u_range, bins), bin_of(y, v_range, bins)) {
                (Some(bx), Some(by)) => (bx, by),
                _ => continue,
            };
            let w = self.weights.as_ref().map(|w| w[i]).unwrap_or(1.0);
            hist[bx * bins + by] += w;
        }

        let total: f64 = hist.iter().sum();
        let area = (u_range.1 - u_range.0) / bins as f64 * (v_range.1 - v_range.0) / bins as f64;
        if total != 0.0 {
            hist.iter_mut().for_each(|h| *h /= total * area);
        }
        Ok(hist)
    }
}

/// Observed `(min, max)`, widened by half a unit on each side when flat.
fn extent(values: &[f64]) -> (f64, f64) {
    let (lo, hi) = values
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &x| (lo.min(x), hi.max(x)));
    if !lo.is_finite() {
        (0.0, 1.0)
    } else if lo == hi {
        (lo - 0.5, hi + 0.5)
    } else {
        (lo, hi)
    }
}

/// Bin of `x` over `bins` equal bins; the last bin includes its right edge.
#[inline]
fn bin_of(x: f64, (lo, hi): (f64, f64), bins: usize) -> Option<usize> {
    if x < lo || x > hi {
        return None;
    }
    let b = ((x - lo) / (hi - lo) * bins as f64) as usize;
    Some(b.min(bins - 1))
}

impl FeatureExtractor for ColourHistogram {
    fn compute(&self, image: &RgbImage) -> BowResult<Array2<f32>> {
        let luv = to_luv(image);
        let (u, v): (Vec<f64>, Vec<f64>) = luv.pixels().map(|p| (p[1] as f64, p[2] as f64)).unzip();
        let hist = self.histogram2d(&u, &v)?;
        Ok(Array2::from_shape_vec(
            (1, hist.len()),
            hist.into_iter().map(|h| h as f32).collect(),
        )?)
    }
}
