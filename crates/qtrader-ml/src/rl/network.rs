//! Dueling network parameters.
//!
//! A dense ReLU trunk feeds two heads: a single state value and one advantage per
//! action. Q values are `V + (A - mean(A))`. Gradients are computed by hand, there is
//! no autodiff here, so every layer keeps the activations the backward pass needs.

use ndarray::{Array1, Array2, Axis};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::iter;

/// Fully connected layer, `output = input · weights + biases`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dense {
    pub weights: Array2<f64>,
    pub biases: Array1<f64>,
}

impl Dense {
    /// Xavier-uniform weights and zero biases
    pub fn new<R: Rng + ?Sized>(input: usize, output: usize, rng: &mut R) -> Self {
        let scale = (2.0 / (input + output) as f64).sqrt();
        Self {
            weights: Array2::random_using((input, output), Uniform::new(-scale, scale), rng),
            biases: Array1::zeros(output),
        }
    }

    pub fn input_size(&self) -> usize {
        self.weights.nrows()
    }

    pub fn output_size(&self) -> usize {
        self.weights.ncols()
    }

    fn forward(&self, input: &Array1<f64>) -> Array1<f64> {
        input.dot(&self.weights) + &self.biases
    }

    fn zeros_like(&self) -> Self {
        Self {
            weights: Array2::zeros(self.weights.raw_dim()),
            biases: Array1::zeros(self.biases.len()),
        }
    }

    /// Add the gradient of one sample: outer(input, d_out) and d_out
    fn accumulate(&mut self, input: &Array1<f64>, d_out: &Array1<f64>) {
        let column = input.view().insert_axis(Axis(1));
        let row = d_out.view().insert_axis(Axis(0));
        self.weights += &column.dot(&row);
        self.biases += d_out;
    }

    fn descend(&mut self, grad: &Dense, scale: f64, learning_rate: f64, clip: f64) {
        let clip_scaled = |g: f64| (g * scale).clamp(-clip, clip);
        self.weights
            .scaled_add(-learning_rate, &grad.weights.mapv(clip_scaled));
        self.biases
            .scaled_add(-learning_rate, &grad.biases.mapv(clip_scaled));
    }

    fn blend(&mut self, other: &Dense, tau: f64) {
        self.weights *= 1.0 - tau;
        self.weights.scaled_add(tau, &other.weights);
        self.biases *= 1.0 - tau;
        self.biases.scaled_add(tau, &other.biases);
    }

    fn is_finite(&self) -> bool {
        self.weights.iter().chain(self.biases.iter()).all(|w| w.is_finite())
    }
}

/// Activations of one forward pass
pub(crate) struct ForwardPass {
    /// Input of each trunk layer, then the final hidden vector
    activations: Vec<Array1<f64>>,
    pre_activations: Vec<Array1<f64>>,
    pub value: f64,
    pub advantages: Array1<f64>,
}

impl ForwardPass {
    pub fn q_values(&self) -> Array1<f64> {
        combine(self.value, &self.advantages)
    }

    fn hidden(&self) -> &Array1<f64> {
        // the state itself when there are no hidden layers
        &self.activations[self.activations.len() - 1]
    }
}

/// Parameters of a dueling value network
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuelingParams {
    trunk: Vec<Dense>,
    value: Dense,
    advantage: Dense,
}

impl DuelingParams {
    pub fn new<R: Rng + ?Sized>(
        input_size: usize,
        hidden_layers: &[usize],
        n_actions: usize,
        rng: &mut R,
    ) -> Self {
        let mut trunk = Vec::with_capacity(hidden_layers.len());
        let mut width = input_size;
        for &size in hidden_layers {
            trunk.push(Dense::new(width, size, rng));
            width = size;
        }
        Self {
            trunk,
            value: Dense::new(width, 1, rng),
            advantage: Dense::new(width, n_actions, rng),
        }
    }

    pub fn input_size(&self) -> usize {
        self.trunk
            .first()
            .map(Dense::input_size)
            .unwrap_or_else(|| self.value.input_size())
    }

    pub fn n_actions(&self) -> usize {
        self.advantage.output_size()
    }

    /// State value and raw advantages, before mean subtraction
    pub fn streams(&self, state: &Array1<f64>) -> (f64, Array1<f64>) {
        let pass = self.forward_pass(state);
        (pass.value, pass.advantages)
    }

    pub fn q_values(&self, state: &Array1<f64>) -> Array1<f64> {
        self.forward_pass(state).q_values()
    }

    pub(crate) fn forward_pass(&self, state: &Array1<f64>) -> ForwardPass {
        let mut activations = Vec::with_capacity(self.trunk.len() + 1);
        let mut pre_activations = Vec::with_capacity(self.trunk.len());
        let mut hidden = state.clone();
        for layer in &self.trunk {
            let z = layer.forward(&hidden);
            let next = z.mapv(relu);
            activations.push(hidden);
            pre_activations.push(z);
            hidden = next;
        }
        let value = self.value.forward(&hidden)[0];
        let advantages = self.advantage.forward(&hidden);
        activations.push(hidden);
        ForwardPass {
            activations,
            pre_activations,
            value,
            advantages,
        }
    }

    /// Accumulate into `grads` the gradient of a loss whose derivative with respect to
    /// `Q(s, action)` is `d_q`
    pub(crate) fn backward(&self, pass: &ForwardPass, action: usize, d_q: f64, grads: &mut Self) {
        let n = self.n_actions() as f64;
        let d_value = Array1::from_elem(1, d_q);
        // dQ_a / dA_k = [k == a] - 1/n
        let d_advantage = Array1::from_shape_fn(self.n_actions(), |k| {
            let indicator = if k == action { 1.0 } else { 0.0 };
            d_q * (indicator - 1.0 / n)
        });

        let hidden = pass.hidden();
        grads.value.accumulate(hidden, &d_value);
        grads.advantage.accumulate(hidden, &d_advantage);

        let mut d_hidden = self.value.weights.dot(&d_value) + self.advantage.weights.dot(&d_advantage);
        for (i, layer) in self.trunk.iter().enumerate().rev() {
            let d_pre = &d_hidden * &pass.pre_activations[i].mapv(relu_grad);
            grads.trunk[i].accumulate(&pass.activations[i], &d_pre);
            d_hidden = layer.weights.dot(&d_pre);
        }
    }

    /// Zeroed parameters with the same shape, used as a gradient accumulator
    pub fn zeros_like(&self) -> Self {
        Self {
            trunk: self.trunk.iter().map(Dense::zeros_like).collect(),
            value: self.value.zeros_like(),
            advantage: self.advantage.zeros_like(),
        }
    }

    /// One SGD step: gradients are multiplied by `scale`, clipped per element, then applied
    pub fn apply_gradients(&mut self, grads: &Self, scale: f64, learning_rate: f64, clip: f64) {
        for (layer, grad) in self.layers_mut().zip(grads.layers()) {
            layer.descend(grad, scale, learning_rate, clip);
        }
    }

    /// Move `tau` of the way toward `other`
    pub fn blend(&mut self, other: &Self, tau: f64) {
        for (layer, theirs) in self.layers_mut().zip(other.layers()) {
            layer.blend(theirs, tau);
        }
    }

    pub fn is_finite(&self) -> bool {
        self.layers().all(Dense::is_finite)
    }

    fn layers(&self) -> impl Iterator<Item = &Dense> {
        self.trunk
            .iter()
            .chain(iter::once(&self.value))
            .chain(iter::once(&self.advantage))
    }

    fn layers_mut(&mut self) -> impl Iterator<Item = &mut Dense> {
        self.trunk
            .iter_mut()
            .chain(iter::once(&mut self.value))
            .chain(iter::once(&mut self.advantage))
    }
}

/// Dueling combination `V + (A - mean(A))`
pub fn combine(value: f64, advantages: &Array1<f64>) -> Array1<f64> {
    let mean = advantages.mean().unwrap_or(0.0);
    advantages.mapv(|a| value + a - mean)
}

fn relu(x: f64) -> f64 {
    x.max(0.0)
}

fn relu_grad(x: f64) -> f64 {
    if x > 0.0 {
        1.0
    } else {
        0.0
    }
}
