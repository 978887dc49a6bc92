//! Transfer learning on top of a frozen pretrained network.
//!
//! The pretrained [`Backbone`] only ever runs forward. Its original classifier
//! is replaced by a new softmax [`Dense`] layer, which is the only part of the
//! [`Model`] that training updates.

use std::path::Path;

use log::{debug, info};
use ndarray::{Array2, Array4, ArrayView2, ArrayView4};
use rand::{thread_rng, Rng};
use serde::{Deserialize, Serialize};

use crate::{BowErr, BowResult};

mod backbone;
mod dense;
mod graph;
#[cfg(feature = "onnx")]
mod onnx;

pub use backbone::{vgg16_layers, Backbone, LayerKind, LayerSummary};
pub use dense::{accuracy, Dense, DenseState, Loss, Optimizer};
pub use graph::{plot_model, to_dot};
#[cfg(feature = "onnx")]
pub use onnx::OnnxVgg16;

/// Name given to the new classification layer.
pub const HEAD_NAME: &str = "predictions";

/// A batch of `N × H × W × C` images and their `N × classes` one-hot targets.
pub type Batch = (Array4<f32>, Array2<f32>);

/// Pretrained network as loaded, before any surgery.
pub struct BaseModel<B: Backbone> {
    backbone: B,
}

impl<B: Backbone> BaseModel<B> {
    pub fn layers(&self) -> Vec<LayerSummary> {
        self.backbone.layers()
    }

    pub fn backbone(&self) -> &B {
        &self.backbone
    }
}

/// Wrap a pretrained backbone and render its diagram to `<results_dir>/model<name>a.dot`.
pub fn get_base_model<B: Backbone, P: AsRef<Path>>(backbone: B, results_dir: P) -> BowResult<BaseModel<B>> {
    let base = BaseModel { backbone };
    let name = base.backbone.name().to_owned();
    plot_model(
        &name,
        &base.layers(),
        results_dir.as_ref().join(format!("model{}a.dot", name)),
    )?;
    Ok(base)
}

/// Replace the classifier of `base` with a `classes`-way softmax layer fed by
/// the penultimate layer, freeze every base layer and render the diagram to
/// `<results_dir>/model<name>b.dot`.
pub fn modify_model_for_classes<B: Backbone, P: AsRef<Path>>(
    base: BaseModel<B>,
    classes: usize,
    results_dir: P,
) -> BowResult<Model<B>> {
    modify_model_for_classes_with_rng(base, classes, results_dir, &mut thread_rng())
}

/// Same as [`modify_model_for_classes`] with a caller supplied source of
/// randomness for the new layer's weights.
pub fn modify_model_for_classes_with_rng<B: Backbone, P: AsRef<Path>, R: Rng + ?Sized>(
    base: BaseModel<B>,
    classes: usize,
    results_dir: P,
    rng: &mut R,
) -> BowResult<Model<B>> {
    if classes == 0 {
        return Err(BowErr::Config("the new classifier needs at least one class".into()));
    }
    let head = Dense::glorot_uniform(HEAD_NAME, base.backbone.feature_width(), classes, rng);
    let mut model = Model {
        backbone: base.backbone,
        head,
        base_trainable: true,
        compiled: None,
    };
    let name = model.backbone.name().to_owned();
    plot_model(
        &name,
        &model.layers(),
        results_dir.as_ref().join(format!("model{}b.dot", name)),
    )?;
    model.base_trainable = false;
    Ok(model)
}

/// Per-epoch training and validation scores.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct History {
    pub loss: Vec<f32>,
    pub acc: Vec<f32>,
    pub val_loss: Vec<f32>,
    pub val_acc: Vec<f32>,
}

impl History {
    pub fn epochs(&self) -> usize {
        self.loss.len()
    }

    fn push(&mut self, train: [f32; 2], validation: [f32; 2]) {
        self.loss.push(train[0]);
        self.acc.push(train[1]);
        self.val_loss.push(validation[0]);
        self.val_acc.push(validation[1]);
    }
}

struct Compiled {
    loss: Loss,
    state: DenseState,
}

/// Frozen backbone topped by a trainable classification layer.
pub struct Model<B: Backbone> {
    backbone: B,
    head: Dense,
    base_trainable: bool,
    compiled: Option<Compiled>,
}

impl<B: Backbone> Model<B> {
    /// Every layer up to the penultimate one of the backbone, then the new head.
    pub fn layers(&self) -> Vec<LayerSummary> {
        let mut layers = self.backbone.layers();
        layers.pop();
        for layer in layers.iter_mut() {
            layer.trainable = self.base_trainable;
        }
        layers.push(LayerSummary::new(
            &self.head.name,
            LayerKind::Dense,
            &[self.head.units()],
        ));
        layers
    }

    pub fn head(&self) -> &Dense {
        &self.head
    }

    pub fn classes(&self) -> usize {
        self.head.units()
    }

    pub fn compile(&mut self, loss: Loss, optimizer: Optimizer) {
        self.compiled = Some(Compiled {
            loss,
            state: self.head.init_state(optimizer),
        });
    }

    /// Class probabilities of a preprocessed batch.
    pub fn predict_on_batch(&self, x: ArrayView4<f32>) -> BowResult<Array2<f32>> {
        let features = self.backbone.penultimate(x)?;
        Ok(self.head.forward(features.view()))
    }

    fn check_targets(&self, rows: usize, y: ArrayView2<f32>) -> BowResult<()> {
        if y.dim() != (rows, self.classes()) {
            return Err(BowErr::Config(format!(
                "targets of shape {:?} for {} samples of {} classes",
                y.dim(),
                rows,
                self.classes()
            )));
        }
        Ok(())
    }

    /// One gradient update of the head. Returns loss and accuracy on the batch
    /// before the update.
    pub fn train_on_batch(&mut self, x: ArrayView4<f32>, y: ArrayView2<f32>) -> BowResult<(f32, f32)> {
        if self.compiled.is_none() {
            return Err(BowErr::NotCompiled);
        }
        let features = self.backbone.penultimate(x)?;
        self.check_targets(features.nrows(), y)?;
        let compiled = self.compiled.as_mut().ok_or(BowErr::NotCompiled)?;

        let probs = self.head.forward(features.view());
        let loss = compiled.loss.compute(probs.view(), y);
        let acc = accuracy(probs.view(), y);

        let dz = compiled.loss.gradient(probs.view(), y);
        self.head.backward(features.view(), &dz, &mut compiled.state);
        Ok((loss, acc))
    }

    /// Loss and accuracy on a batch, without updating anything.
    pub fn test_on_batch(&self, x: ArrayView4<f32>, y: ArrayView2<f32>) -> BowResult<(f32, f32)> {
        let loss = self.compiled.as_ref().ok_or(BowErr::NotCompiled)?.loss;
        let probs = self.predict_on_batch(x)?;
        self.check_targets(probs.nrows(), y)?;
        Ok((loss.compute(probs.view(), y), accuracy(probs.view(), y)))
    }

    /// Train for `epochs` epochs of `steps_per_epoch` batches, scoring the
    /// validation generator over `validation_steps` batches after each epoch.
    pub fn fit_generator<T, V>(
        &mut self,
        train: &mut T,
        steps_per_epoch: usize,
        epochs: usize,
        validation: &mut V,
        validation_steps: usize,
    ) -> BowResult<History>
    where
        T: Iterator<Item = BowResult<Batch>>,
        V: Iterator<Item = BowResult<Batch>>,
    {
        if self.compiled.is_none() {
            return Err(BowErr::NotCompiled);
        }
        let mut history = History::default();
        for epoch in 1..=epochs {
            let mut scores = WeightedMean::default();
            for step in 0..steps_per_epoch {
                let (x, y) = next_batch(train)?;
                let (loss, acc) = self.train_on_batch(x.view(), y.view())?;
                debug!("epoch {} step {}: loss {:.4} acc {:.4}", epoch, step + 1, loss, acc);
                scores.add(loss, acc, x.shape()[0]);
            }
            let [loss, acc] = scores.mean()?;
            let [val_loss, val_acc] = self.evaluate_generator(validation, validation_steps)?;
            info!(
                "Epoch {}/{} - loss: {:.4} - acc: {:.4} - val_loss: {:.4} - val_acc: {:.4}",
                epoch, epochs, loss, acc, val_loss, val_acc
            );
            history.push([loss, acc], [val_loss, val_acc]);
        }
        Ok(history)
    }

    /// `[loss, accuracy]` over `steps` batches, weighted by batch size.
    pub fn evaluate_generator<G>(&self, generator: &mut G, steps: usize) -> BowResult<[f32; 2]>
    where
        G: Iterator<Item = BowResult<Batch>>,
    {
        let mut scores = WeightedMean::default();
        for _ in 0..steps {
            let (x, y) = next_batch(generator)?;
            let (loss, acc) = self.test_on_batch(x.view(), y.view())?;
            scores.add(loss, acc, x.shape()[0]);
        }
        scores.mean()
    }
}

fn next_batch<G: Iterator<Item = BowResult<Batch>>>(generator: &mut G) -> BowResult<Batch> {
    generator
        .next()
        .unwrap_or_else(|| Err(BowErr::Config("generator ran out of batches".into())))
}

#[derive(Default)]
struct WeightedMean {
    loss: f64,
    acc: f64,
    samples: usize,
}

impl WeightedMean {
    fn add(&mut self, loss: f32, acc: f32, samples: usize) {
        self.loss += loss as f64 * samples as f64;
        self.acc += acc as f64 * samples as f64;
        self.samples += samples;
    }

    fn mean(&self) -> BowResult<[f32; 2]> {
        if self.samples == 0 {
            return Err(BowErr::EmptyBatch);
        }
        let n = self.samples as f64;
        Ok([(self.loss / n) as f32, (self.acc / n) as f32])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array, Axis};
    use rand::{rngs::StdRng, SeedableRng};

    /// Averages each channel of the image.
    struct ChannelMeans;

    impl Backbone for ChannelMeans {
        fn name(&self) -> &str {
            "Means"
        }

        fn layers(&self) -> Vec<LayerSummary> {
            vec![
                LayerSummary::new("input", LayerKind::InputLayer, &[2, 2, 3]),
                LayerSummary::new("pool", LayerKind::Dense, &[3]),
                LayerSummary::new("old_head", LayerKind::Dense, &[10]),
            ]
        }

        fn feature_width(&self) -> usize {
            3
        }

        fn penultimate(&self, batch: ArrayView4<f32>) -> BowResult<Array2<f32>> {
            batch
                .mean_axis(Axis(1))
                .and_then(|b| b.mean_axis(Axis(1)))
                .ok_or(BowErr::EmptyBatch)
        }
    }

    /// Class `i` images are bright in channel `i`.
    fn batches(n: usize) -> impl Iterator<Item = BowResult<Batch>> {
        (0..).map(move |_| {
            let x = Array::from_shape_fn((n, 2, 2, 3), |(i, _, _, c)| if c == i % 3 { 1. } else { 0. });
            let y = Array2::from_shape_fn((n, 3), |(i, c)| if c == i % 3 { 1. } else { 0. });
            Ok((x, y))
        })
    }

    fn model(dir: &Path) -> Model<ChannelMeans> {
        let base = get_base_model(ChannelMeans, dir).unwrap();
        let mut rng = StdRng::seed_from_u64(4);
        modify_model_for_classes_with_rng(base, 3, dir, &mut rng).unwrap()
    }

    #[test]
    fn surgery_replaces_head_and_freezes_base() {
        let dir = tempfile::tempdir().unwrap();
        let model = model(dir.path());
        let layers = model.layers();
        let names: Vec<&str> = layers.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["input", "pool", HEAD_NAME]);
        assert!(layers[..2].iter().all(|l| !l.trainable));
        assert!(layers[2].trainable);
        assert_eq!(layers[2].output_shape, vec![3]);
        assert!(dir.path().join("modelMeansa.dot").exists());
        assert!(dir.path().join("modelMeansb.dot").exists());
    }

    #[test]
    fn zero_classes_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let base = get_base_model(ChannelMeans, dir.path()).unwrap();
        assert!(matches!(
            modify_model_for_classes(base, 0, dir.path()),
            Err(BowErr::Config(_))
        ));
    }

    #[test]
    fn training_needs_compile() {
        let dir = tempfile::tempdir().unwrap();
        let mut model = model(dir.path());
        let (x, y) = batches(3).next().unwrap().unwrap();
        assert!(matches!(
            model.train_on_batch(x.view(), y.view()),
            Err(BowErr::NotCompiled)
        ));
        assert!(matches!(
            model.evaluate_generator(&mut batches(3), 1),
            Err(BowErr::NotCompiled)
        ));
    }

    #[test]
    fn fit_improves_loss() {
        let dir = tempfile::tempdir().unwrap();
        let mut model = model(dir.path());
        model.compile(Loss::CategoricalCrossentropy, Optimizer::adadelta());
        let history = model
            .fit_generator(&mut batches(6), 20, 5, &mut batches(3), 2)
            .unwrap();
        assert_eq!(history.epochs(), 5);
        assert_eq!(history.val_acc.len(), 5);
        assert!(history.loss[4] < history.loss[0]);

        let [loss, acc] = model.evaluate_generator(&mut batches(3), 4).unwrap();
        assert!(loss.is_finite());
        assert!((0. ..=1.).contains(&acc));
    }

    #[test]
    fn evaluation_weights_by_batch_size() {
        let mut m = WeightedMean::default();
        m.add(1.0, 1.0, 3);
        m.add(0.0, 0.0, 1);
        assert_eq!(m.mean().unwrap(), [0.75, 0.75]);
        assert!(WeightedMean::default().mean().is_err());
    }

    #[test]
    fn targets_must_match_head() {
        let dir = tempfile::tempdir().unwrap();
        let mut model = model(dir.path());
        model.compile(Loss::CategoricalCrossentropy, Optimizer::adadelta());
        let x = Array4::zeros((2, 2, 2, 3));
        let y = Array2::zeros((2, 5));
        assert!(matches!(
            model.train_on_batch(x.view(), y.view()),
            Err(BowErr::Config(_))
        ));
    }

    #[test]
    fn history_serializes() {
        let mut h = History::default();
        h.push([1.0, 0.5], [1.2, 0.4]);
        let json = serde_json::to_string(&h).unwrap();
        let back: History = serde_json::from_str(&json).unwrap();
        assert_eq!(h, back);
    }
}
