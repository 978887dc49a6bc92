use ndarray::{Array, Array1, Array2, ArrayView2, Axis, Dimension, Zip};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Probabilities are clipped to `[EPSILON, 1 - EPSILON]` inside the log.
const EPSILON: f32 = 1e-7;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Loss {
    CategoricalCrossentropy,
}

impl Loss {
    /// Mean loss over the batch.
    pub fn compute(&self, probs: ArrayView2<f32>, targets: ArrayView2<f32>) -> f32 {
        match self {
            Loss::CategoricalCrossentropy => {
                let n = probs.nrows().max(1) as f32;
                let total = Zip::from(&probs)
                    .and(&targets)
                    .fold(0., |acc, &p, &t| acc - t * p.clamp(EPSILON, 1. - EPSILON).ln());
                total / n
            }
        }
    }

    /// Gradient of the mean loss with respect to the pre-softmax activations.
    pub fn gradient(&self, probs: ArrayView2<f32>, targets: ArrayView2<f32>) -> Array2<f32> {
        match self {
            Loss::CategoricalCrossentropy => {
                let n = probs.nrows().max(1) as f32;
                (&probs - &targets) / n
            }
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub enum Optimizer {
    Adadelta { lr: f32, rho: f32, epsilon: f32 },
}

impl Optimizer {
    pub fn adadelta() -> Self {
        Optimizer::Adadelta {
            lr: 1.0,
            rho: 0.95,
            epsilon: 1e-7,
        }
    }
}

impl Default for Optimizer {
    fn default() -> Self {
        Self::adadelta()
    }
}

/// Running averages kept by Adadelta for one parameter tensor.
#[derive(Debug, Clone)]
struct Accumulators<D: Dimension> {
    grad: Array<f32, D>,
    update: Array<f32, D>,
}

impl<D: Dimension> Accumulators<D> {
    fn zeros_like(param: &Array<f32, D>) -> Self {
        Self {
            grad: Array::zeros(param.raw_dim()),
            update: Array::zeros(param.raw_dim()),
        }
    }

    fn step(&mut self, param: &mut Array<f32, D>, grad: &Array<f32, D>, optimizer: Optimizer) {
        let Optimizer::Adadelta { lr, rho, epsilon } = optimizer;
        Zip::from(param)
            .and(grad)
            .and(&mut self.grad)
            .and(&mut self.update)
            .for_each(|p, &g, acc_g, acc_u| {
                *acc_g = rho * *acc_g + (1. - rho) * g * g;
                let u = g * (*acc_u + epsilon).sqrt() / (*acc_g + epsilon).sqrt();
                *p -= lr * u;
                *acc_u = rho * *acc_u + (1. - rho) * u * u;
            });
    }
}

/// Optimizer state of a [`Dense`] layer.
#[derive(Debug, Clone)]
pub struct DenseState {
    optimizer: Optimizer,
    weights: Accumulators<ndarray::Ix2>,
    bias: Accumulators<ndarray::Ix1>,
}

/// Fully connected layer with a softmax activation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Dense {
    pub name: String,
    /// `inputs × units`.
    pub weights: Array2<f32>,
    pub bias: Array1<f32>,
}

impl Dense {
    /// Glorot-uniform weights and zero bias.
    pub fn glorot_uniform<R: Rng + ?Sized>(name: &str, inputs: usize, units: usize, rng: &mut R) -> Self {
        let limit = (6. / (inputs + units) as f32).sqrt();
        let weights = Array2::from_shape_simple_fn((inputs, units), || rng.gen_range(-limit..=limit));
        Self {
            name: name.to_owned(),
            weights,
            bias: Array1::zeros(units),
        }
    }

    pub fn units(&self) -> usize {
        self.bias.len()
    }

    pub fn inputs(&self) -> usize {
        self.weights.nrows()
    }

    /// Class probabilities, one row per sample.
    pub fn forward(&self, x: ArrayView2<f32>) -> Array2<f32> {
        let mut z = x.dot(&self.weights) + &self.bias;
        for mut row in z.rows_mut() {
            let max = row.fold(f32::NEG_INFINITY, |a, &v| a.max(v));
            row.mapv_inplace(|v| (v - max).exp());
            let sum = row.sum();
            row /= sum;
        }
        z
    }

    pub fn init_state(&self, optimizer: Optimizer) -> DenseState {
        DenseState {
            optimizer,
            weights: Accumulators::zeros_like(&self.weights),
            bias: Accumulators::zeros_like(&self.bias),
        }
    }

    /// One gradient step given the loss gradient at the pre-softmax activations.
    pub fn backward(&mut self, x: ArrayView2<f32>, dz: &Array2<f32>, state: &mut DenseState) {
        let grad_w = x.t().dot(dz);
        let grad_b = dz.sum_axis(Axis(0));
        let optimizer = state.optimizer;
        state.weights.step(&mut self.weights, &grad_w, optimizer);
        state.bias.step(&mut self.bias, &grad_b, optimizer);
    }
}

/// Fraction of rows whose most probable class is the target class.
pub fn accuracy(probs: ArrayView2<f32>, targets: ArrayView2<f32>) -> f32 {
    if probs.nrows() == 0 {
        return 0.;
    }
    let argmax = |row: ndarray::ArrayView1<f32>| {
        row.iter()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |best, (i, &v)| if v > best.1 { (i, v) } else { best })
            .0
    };
    let hits = probs
        .rows()
        .into_iter()
        .zip(targets.rows())
        .filter(|(p, t)| argmax(p.view()) == argmax(t.view()))
        .count();
    hits as f32 / probs.nrows() as f32
}
