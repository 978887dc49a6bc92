use std::str::FromStr;

use ndarray::{Array, Axis, Dimension, RemoveAxis, Slice};
use serde::{Deserialize, Serialize};

use crate::{BowErr, BowResult};

/// Per-channel means of the network's training set, in BGR order.
pub const VGG16_MEAN_BGR: [f32; 3] = [103.939, 116.779, 123.68];

/// Position of the channel axis.
///
/// `Th` is channels first (`C × H × W`), `Tf` channels last (`H × W × C`).
/// Batched arrays carry one more leading axis.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DimOrdering {
    Th,
    #[default]
    Tf,
}

impl FromStr for DimOrdering {
    type Err = BowErr;

    /// `"default"` resolves to the channels last ordering.
    fn from_str(s: &str) -> BowResult<Self> {
        match s {
            "th" => Ok(DimOrdering::Th),
            "tf" | "default" => Ok(DimOrdering::Tf),
            other => Err(BowErr::UnknownDimOrdering(other.to_owned())),
        }
    }
}

impl DimOrdering {
    /// Channel axis of an array with `ndim` axes.
    pub fn channel_axis(self, ndim: usize) -> BowResult<Axis> {
        match self {
            DimOrdering::Th if ndim >= 3 => Ok(Axis(ndim - 3)),
            DimOrdering::Tf if ndim >= 1 => Ok(Axis(ndim - 1)),
            _ => Err(BowErr::Config(format!(
                "{} axes are too few for {:?} ordering",
                ndim, self
            ))),
        }
    }
}

/// Reverse the channel axis: RGB becomes BGR and back.
pub fn colour_channel_swapping<D: Dimension>(
    x: Array<f32, D>,
    ordering: DimOrdering,
) -> BowResult<Array<f32, D>> {
    let axis = ordering.channel_axis(x.ndim())?;
    Ok(x.slice_axis(axis, Slice::new(0, None, -1)).to_owned())
}

/// Zero-centre every channel by the BGR mean pixel.
pub fn mean_subtraction<D: Dimension + RemoveAxis>(
    x: Array<f32, D>,
    ordering: DimOrdering,
) -> BowResult<Array<f32, D>> {
    shift_channels(x, ordering, -1.0)
}

/// Undo [`mean_subtraction`].
pub fn mean_addition<D: Dimension + RemoveAxis>(
    x: Array<f32, D>,
    ordering: DimOrdering,
) -> BowResult<Array<f32, D>> {
    shift_channels(x, ordering, 1.0)
}

/// RGB to BGR swap followed by mean subtraction, the input contract of the
/// pretrained network.
pub fn preprocess_input<D: Dimension + RemoveAxis>(
    x: Array<f32, D>,
    ordering: DimOrdering,
) -> BowResult<Array<f32, D>> {
    let x = colour_channel_swapping(x, ordering)?;
    mean_subtraction(x, ordering)
}

fn shift_channels<D: Dimension + RemoveAxis>(
    mut x: Array<f32, D>,
    ordering: DimOrdering,
    sign: f32,
) -> BowResult<Array<f32, D>> {
    let axis = ordering.channel_axis(x.ndim())?;
    let channels = x.len_of(axis);
    if channels != VGG16_MEAN_BGR.len() {
        return Err(BowErr::Config(format!(
            "mean pixel has 3 channels, array has {}",
            channels
        )));
    }
    for (mut channel, mean) in x.axis_iter_mut(axis).zip(VGG16_MEAN_BGR) {
        channel.mapv_inplace(|v| v + sign * mean);
    }
    Ok(x)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array3, Array4};

    #[test]
    fn parse_orderings() {
        assert_eq!("th".parse::<DimOrdering>().unwrap(), DimOrdering::Th);
        assert_eq!("tf".parse::<DimOrdering>().unwrap(), DimOrdering::Tf);
        assert_eq!("default".parse::<DimOrdering>().unwrap(), DimOrdering::Tf);
        assert!(matches!(
            "nchw".parse::<DimOrdering>(),
            Err(BowErr::UnknownDimOrdering(s)) if s == "nchw"
        ));
    }

    #[test]
    fn swap_reverses_last_axis_for_tf() {
        let x = array![[[1f32, 2., 3.], [4., 5., 6.]]];
        let y = colour_channel_swapping(x, DimOrdering::Tf).unwrap();
        assert_eq!(y, array![[[3f32, 2., 1.], [6., 5., 4.]]]);
    }

    #[test]
    fn swap_reverses_first_axis_for_th() {
        let x = Array3::from_shape_fn((3, 2, 2), |(c, _, _)| c as f32);
        let y = colour_channel_swapping(x, DimOrdering::Th).unwrap();
        assert!(y.index_axis(Axis(0), 0).iter().all(|v| *v == 2.0));
        assert!(y.index_axis(Axis(0), 2).iter().all(|v| *v == 0.0));
    }

    #[test]
    fn preprocess_subtracts_bgr_mean() {
        let x = Array3::from_elem((2, 2, 3), 128.0f32);
        let y = preprocess_input(x, DimOrdering::Tf).unwrap();
        assert_abs_diff_eq!(y[[0, 0, 0]], 128.0 - 103.939, epsilon = 1e-4);
        assert_abs_diff_eq!(y[[1, 1, 2]], 128.0 - 123.68, epsilon = 1e-4);
    }

    #[test]
    fn batched_round_trip() {
        let x = Array4::from_shape_fn((2, 3, 4, 3), |(n, h, w, c)| (n * 50 + h * 10 + w + c * 7) as f32);
        let y = preprocess_input(x.clone(), DimOrdering::Tf).unwrap();
        let back = mean_addition(y, DimOrdering::Tf).unwrap();
        let back = colour_channel_swapping(back, DimOrdering::Tf).unwrap();
        for (a, b) in back.iter().zip(x.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-4);
        }
    }

    #[test]
    fn wrong_channel_count() {
        let x = Array3::<f32>::zeros((2, 2, 4));
        assert!(matches!(
            mean_subtraction(x, DimOrdering::Tf),
            Err(BowErr::Config(_))
        ));
        let flat = ndarray::Array1::<f32>::zeros(3);
        assert!(colour_channel_swapping(flat, DimOrdering::Th).is_err());
    }
}
