// External imports
use burn::module::{Module, Param};
use burn::nn::Linear;
use burn::tensor::{activation, backend::Backend, Tensor, TensorData};
use rand::rngs::StdRng;
use rand::Rng;

// Internal imports
use crate::constants::FORGET_GATE_BIAS;

/// Hidden and cell state carried between LSTM steps.
///
/// Produced by the encoder and handed to the decoder as its initial state.
#[derive(Debug, Clone)]
pub struct LstmState<B: Backend> {
    /// Shape [batch_size, hidden_size]
    pub hidden: Tensor<B, 2>,
    /// Shape [batch_size, hidden_size]
    pub cell: Tensor<B, 2>,
}

impl<B: Backend> LstmState<B> {
    /// All-zero state, used when no initial state is supplied
    pub fn zeros(batch_size: usize, hidden_size: usize, device: &B::Device) -> Self {
        Self {
            hidden: Tensor::zeros([batch_size, hidden_size], device),
            cell: Tensor::zeros([batch_size, hidden_size], device),
        }
    }
}

/// LSTM layer
///
/// The four gates (input, forget, cell, output) share one projection for the
/// input and one for the recurrent state. Only the input projection has a bias.
#[derive(Module, Debug)]
pub struct LSTM<B: Backend> {
    hidden_size: usize,
    input_weights: Linear<B>,
    hidden_weights: Linear<B>,
}

impl<B: Backend> LSTM<B> {
    /// Create a new LSTM layer
    ///
    /// # Arguments
    ///
    /// * `input_size` - Size of each input vector
    /// * `hidden_size` - Number of hidden units
    /// * `rng` - Source of the initial weights
    /// * `device` - Device to place tensors on
    pub fn new(
        input_size: usize,
        hidden_size: usize,
        rng: &mut StdRng,
        device: &B::Device,
    ) -> Self {
        let gate_size = 4 * hidden_size; // input, forget, cell, output gates combined

        // Forget gate starts open so early gradients flow through the cell state
        let mut bias = vec![0.0f32; gate_size];
        bias[hidden_size..2 * hidden_size].fill(FORGET_GATE_BIAS);

        let input_weights = glorot_linear(input_size, gate_size, Some(bias), rng, device);
        let hidden_weights = glorot_linear(hidden_size, gate_size, None, rng, device);

        Self {
            hidden_size,
            input_weights,
            hidden_weights,
        }
    }

    /// Input width as seen by the layer's weights
    pub fn input_size(&self) -> usize {
        self.input_weights.weight.val().dims()[0]
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    /// Run the layer over a whole sequence, keeping every step's hidden state.
    ///
    /// # Arguments
    ///
    /// * `x` - Input of shape [batch_size, seq_len, input_size]
    /// * `initial_state` - Starting state, zeros when `None`
    ///
    /// # Returns
    ///
    /// The hidden states [batch_size, seq_len, hidden_size] and the final state
    pub fn forward_sequence(
        &self,
        x: Tensor<B, 3>,
        initial_state: Option<LstmState<B>>,
    ) -> (Tensor<B, 3>, LstmState<B>) {
        let (outputs, state) = self.unroll(x, initial_state, true);
        (Tensor::stack::<3>(outputs, 1), state)
    }

    /// Run the layer over a whole sequence and return only the final state
    pub fn forward_final(&self, x: Tensor<B, 3>, initial_state: Option<LstmState<B>>) -> LstmState<B> {
        let (_, state) = self.unroll(x, initial_state, false);
        state
    }

    fn unroll(
        &self,
        x: Tensor<B, 3>,
        initial_state: Option<LstmState<B>>,
        collect_outputs: bool,
    ) -> (Vec<Tensor<B, 2>>, LstmState<B>) {
        let device = x.device();
        let [batch_size, seq_len, _] = x.dims();
        let gate_size = 4 * self.hidden_size;

        let LstmState {
            mut hidden,
            mut cell,
        } = initial_state
            .unwrap_or_else(|| LstmState::zeros(batch_size, self.hidden_size, &device));

        // Project every timestep at once, the recurrence only needs the hidden part
        let projected = self.input_weights.forward(x);

        let mut outputs = Vec::with_capacity(if collect_outputs { seq_len } else { 0 });
        for t in 0..seq_len {
            let x_t = projected
                .clone()
                .narrow(1, t, 1)
                .reshape([batch_size, gate_size]);
            let gates = x_t + self.hidden_weights.forward(hidden.clone());

            let i = activation::sigmoid(gates.clone().narrow(1, 0, self.hidden_size));
            let f = activation::sigmoid(gates.clone().narrow(1, self.hidden_size, self.hidden_size));
            let g = activation::tanh(gates.clone().narrow(1, 2 * self.hidden_size, self.hidden_size));
            let o = activation::sigmoid(gates.narrow(1, 3 * self.hidden_size, self.hidden_size));

            cell = f * cell + i * g;
            hidden = o * activation::tanh(cell.clone());

            if collect_outputs {
                outputs.push(hidden.clone());
            }
        }

        (outputs, LstmState { hidden, cell })
    }
}

/// Linear layer with Glorot-uniform weights drawn from `rng`.
///
/// Weights are laid out [d_input, d_output] as Burn expects.
pub(crate) fn glorot_linear<B: Backend>(
    d_input: usize,
    d_output: usize,
    bias: Option<Vec<f32>>,
    rng: &mut StdRng,
    device: &B::Device,
) -> Linear<B> {
    let limit = (6.0 / (d_input + d_output) as f64).sqrt() as f32;
    let weights: Vec<f32> = (0..d_input * d_output)
        .map(|_| rng.random_range(-limit..limit))
        .collect();
    let weight = Tensor::<B, 2>::from_data(TensorData::new(weights, [d_input, d_output]), device);

    let bias = bias.map(|values| {
        Param::from_tensor(Tensor::<B, 1>::from_data(
            TensorData::new(values, [d_output]),
            device,
        ))
    });

    Linear {
        weight: Param::from_tensor(weight),
        bias,
    }
}
