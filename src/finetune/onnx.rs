use std::path::Path;

use log::info;
use ndarray::{Array2, ArrayView4, Axis};
use ort::{inputs, GraphOptimizationLevel, Session};

use super::backbone::{vgg16_layers, Backbone, LayerSummary};
use crate::{BowErr, BowResult};

/// VGG16 exported to ONNX with the penultimate layer exposed as a graph output.
///
/// Takes channels-last BGR input with the mean pixel already subtracted.
pub struct OnnxVgg16 {
    session: Session,
    output: String,
    height: usize,
    width: usize,
}

impl OnnxVgg16 {
    /// Load the model and check that `output` (usually `fc2`) is one of its outputs.
    pub fn load<P: AsRef<Path>>(path: P, output: &str, height: usize, width: usize) -> BowResult<Self> {
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(4)?
            .commit_from_file(path.as_ref())?;

        if !session.outputs.iter().any(|o| o.name == output) {
            let names: Vec<&str> = session.outputs.iter().map(|o| o.name.as_str()).collect();
            return Err(BowErr::Config(format!(
                "model has no output {:?}, available: {:?}",
                output, names
            )));
        }
        info!("Loaded {:?}, reading output {:?}", path.as_ref(), output);

        Ok(Self {
            session,
            output: output.to_owned(),
            height,
            width,
        })
    }
}

impl Backbone for OnnxVgg16 {
    fn name(&self) -> &str {
        "VGG16"
    }

    fn layers(&self) -> Vec<LayerSummary> {
        vgg16_layers(self.height, self.width)
    }

    fn feature_width(&self) -> usize {
        4096
    }

    fn penultimate(&self, batch: ArrayView4<f32>) -> BowResult<Array2<f32>> {
        let n = batch.len_of(Axis(0));
        let batch = batch.as_standard_layout().into_owned();
        let outputs = self.session.run(inputs![batch]?)?;

        let output = outputs[self.output.as_str()].try_extract_tensor::<f32>()?;
        Ok(output.to_shape((n, self.feature_width()))?.to_owned())
    }
}
