use ndarray::{Array2, ArrayView4};
use serde::{Deserialize, Serialize};

use crate::BowResult;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    InputLayer,
    Conv2D,
    MaxPooling2D,
    Flatten,
    Dense,
}

/// One layer of a network as reported to the user.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LayerSummary {
    pub name: String,
    pub kind: LayerKind,
    /// Per-sample output shape, batch axis excluded.
    pub output_shape: Vec<usize>,
    pub trainable: bool,
}

impl LayerSummary {
    pub fn new(name: &str, kind: LayerKind, output_shape: &[usize]) -> Self {
        Self {
            name: name.to_owned(),
            kind,
            output_shape: output_shape.to_vec(),
            trainable: true,
        }
    }
}

/// A pretrained network used for inference only.
///
/// `layers()` lists the complete network, original classifier included;
/// `penultimate` runs it up to the layer before that classifier.
pub trait Backbone {
    /// Short name used for rendered diagrams, e.g. `VGG16`.
    fn name(&self) -> &str;

    fn layers(&self) -> Vec<LayerSummary>;

    /// Width of the penultimate layer's output.
    fn feature_width(&self) -> usize;

    /// Output of the penultimate layer for a preprocessed `N × H × W × C` batch.
    fn penultimate(&self, batch: ArrayView4<f32>) -> BowResult<Array2<f32>>;
}

impl<B: Backbone + ?Sized> Backbone for Box<B> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn layers(&self) -> Vec<LayerSummary> {
        (**self).layers()
    }

    fn feature_width(&self) -> usize {
        (**self).feature_width()
    }

    fn penultimate(&self, batch: ArrayView4<f32>) -> BowResult<Array2<f32>> {
        (**self).penultimate(batch)
    }
}

/// Layers of VGG16 with its 1000-way ImageNet classifier, for `height × width` input.
pub fn vgg16_layers(height: usize, width: usize) -> Vec<LayerSummary> {
    use LayerKind::*;

    let mut layers = vec![LayerSummary::new("input_1", InputLayer, &[height, width, 3])];
    let (mut h, mut w) = (height, width);
    for (block, (convs, filters)) in [(2, 64), (2, 128), (3, 256), (3, 512), (3, 512)]
        .into_iter()
        .enumerate()
    {
        for conv in 1..=convs {
            let name = format!("block{}_conv{}", block + 1, conv);
            layers.push(LayerSummary::new(&name, Conv2D, &[h, w, filters]));
        }
        h /= 2;
        w /= 2;
        let name = format!("block{}_pool", block + 1);
        layers.push(LayerSummary::new(&name, MaxPooling2D, &[h, w, filters]));
    }
    layers.push(LayerSummary::new("flatten", Flatten, &[h * w * 512]));
    layers.push(LayerSummary::new("fc1", Dense, &[4096]));
    layers.push(LayerSummary::new("fc2", Dense, &[4096]));
    layers.push(LayerSummary::new("predictions", Dense, &[1000]));
    layers
}
