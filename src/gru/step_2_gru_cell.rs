// External imports
use burn::module::Module;
use burn::nn::{Linear, LinearConfig};
use burn::tensor::{activation, backend::Backend, Tensor};

/// # GRU Layer
///
/// A single Gated Recurrent Unit layer (Cho et al., 2014).
///
/// ## Mathematical Representation
///
/// For input x_t at time t and previous hidden state h_(t-1):
///
/// 1. Update gate: z_t = σ(W_z · x_t + U_z · h_(t-1))
/// 2. Reset gate: r_t = σ(W_r · x_t + U_r · h_(t-1))
/// 3. Candidate state: n_t = tanh(W_n · x_t + r_t ∘ (U_n · h_(t-1)))
/// 4. New hidden state: h_t = (1 - z_t) ∘ n_t + z_t ∘ h_(t-1)
///
/// Where σ is the sigmoid function and ∘ denotes element-wise multiplication.
/// The three input projections and the three hidden projections are each
/// packed into one linear layer of width `3 * hidden_size`.
#[derive(Module, Debug)]
pub struct GruLayer<B: Backend> {
    input_size: usize,
    hidden_size: usize,
    input_weights: Linear<B>,
    hidden_weights: Linear<B>,
}

impl<B: Backend> GruLayer<B> {
    pub fn new(input_size: usize, hidden_size: usize, device: &B::Device) -> Self {
        // update, reset and candidate gates side by side
        let gate_size = 3 * hidden_size;

        Self {
            input_size,
            hidden_size,
            input_weights: LinearConfig::new(input_size, gate_size).init(device),
            hidden_weights: LinearConfig::new(hidden_size, gate_size).init(device),
        }
    }

    /// Advance the layer by one time step
    ///
    /// # Arguments
    ///
    /// * `x_t` - Input at the current step, shape [batch_size, input_size]
    /// * `h` - Previous hidden state, shape [batch_size, hidden_size]
    ///
    /// # Returns
    ///
    /// The new hidden state, shape [batch_size, hidden_size]
    pub fn step(&self, x_t: Tensor<B, 2>, h: Tensor<B, 2>) -> Tensor<B, 2> {
        let hs = self.hidden_size;

        let input_projection = self.input_weights.forward(x_t);
        let hidden_projection = self.hidden_weights.forward(h.clone());

        let z_input = input_projection.clone().narrow(1, 0, hs);
        let r_input = input_projection.clone().narrow(1, hs, hs);
        let n_input = input_projection.narrow(1, 2 * hs, hs);

        let z_hidden = hidden_projection.clone().narrow(1, 0, hs);
        let r_hidden = hidden_projection.clone().narrow(1, hs, hs);
        let n_hidden = hidden_projection.narrow(1, 2 * hs, hs);

        let z = activation::sigmoid(z_input + z_hidden);
        let r = activation::sigmoid(r_input + r_hidden);
        let n = activation::tanh(n_input + r * n_hidden);

        // h = (1 - z) * n + z * h
        (Tensor::ones_like(&z) - z.clone()) * n + z * h
    }

    pub fn input_size(&self) -> usize {
        self.input_size
    }
}

/// # Stacked GRU
///
/// `num_layers` GRU layers where layer `l + 1` consumes the hidden state of
/// layer `l`. The recurrent state is carried as a single tensor of shape
/// [num_layers, batch_size, hidden_size].
#[derive(Module, Debug)]
pub struct Gru<B: Backend> {
    input_size: usize,
    hidden_size: usize,
    layers: Vec<GruLayer<B>>,
}

impl<B: Backend> Gru<B> {
    /// Create a stacked GRU
    ///
    /// # Arguments
    ///
    /// * `input_size` - Number of expected features in the input
    /// * `hidden_size` - Number of features in the hidden state
    /// * `num_layers` - Number of stacked recurrent layers (at least one)
    /// * `device` - The device to allocate tensors on
    pub fn new(input_size: usize, hidden_size: usize, num_layers: usize, device: &B::Device) -> Self {
        let layers = (0..num_layers.max(1))
            .map(|l| {
                let layer_input = if l == 0 { input_size } else { hidden_size };
                GruLayer::new(layer_input, hidden_size, device)
            })
            .collect();

        Self {
            input_size,
            hidden_size,
            layers,
        }
    }

    pub fn input_size(&self) -> usize {
        self.input_size
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// All-zero recurrent state for a fresh sequence
    pub fn zero_state(&self, batch_size: usize, device: &B::Device) -> Tensor<B, 3> {
        Tensor::zeros([self.layers.len(), batch_size, self.hidden_size], device)
    }

    /// Advance every layer by one time step
    ///
    /// Returns the top layer's new hidden state [batch_size, hidden_size] and
    /// the full new state [num_layers, batch_size, hidden_size].
    pub fn step(&self, x_t: Tensor<B, 2>, state: Tensor<B, 3>) -> (Tensor<B, 2>, Tensor<B, 3>) {
        let [_, batch_size, hidden_size] = state.dims();

        let mut layer_input = x_t;
        let mut new_states = Vec::with_capacity(self.layers.len());
        for (l, layer) in self.layers.iter().enumerate() {
            let h_prev = state
                .clone()
                .narrow(0, l, 1)
                .reshape([batch_size, hidden_size]);
            let h = layer.step(layer_input, h_prev);
            new_states.push(h.clone());
            layer_input = h;
        }

        (layer_input, Tensor::stack(new_states, 0))
    }

    /// Run the GRU over a whole sequence
    ///
    /// # Arguments
    ///
    /// * `x` - Input tensor of shape [batch_size, seq_len, input_size]
    /// * `state` - Initial state; `None` starts from zeros
    ///
    /// # Returns
    ///
    /// Top-layer hidden states for every step [batch_size, seq_len, hidden_size]
    /// and the final state [num_layers, batch_size, hidden_size].
    pub fn forward(&self, x: Tensor<B, 3>, state: Option<Tensor<B, 3>>) -> (Tensor<B, 3>, Tensor<B, 3>) {
        let [batch_size, seq_len, input_size] = x.dims();
        let device = x.device();
        let mut state = state.unwrap_or_else(|| self.zero_state(batch_size, &device));

        let mut outputs = Vec::with_capacity(seq_len);
        for t in 0..seq_len {
            let x_t = x.clone().narrow(1, t, 1).reshape([batch_size, input_size]);
            let (h, next_state) = self.step(x_t, state);
            outputs.push(h);
            state = next_state;
        }

        (Tensor::stack(outputs, 1), state)
    }
}
