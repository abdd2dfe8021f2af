//! Recurrent encoder and attention decoder over folded lane sequences.
//!
//! Both sides run on `(B * N, T, F)` tensors produced by
//! [`crate::reshape::fold_lanes`], so every (run-slot, lane) pair is an
//! independent sequence. When `stateful_rnn` is set, the final hidden state
//! of a forward pass seeds the next one; the trainer clears it at run-group
//! boundaries via `reset_state`.

use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::ops::{sigmoid, softmax_last_dim};
use candle_nn::{linear, Init, Linear, Module, VarBuilder};

use crate::config::ModelConfig;
use crate::error::GnnResult;
use crate::gat::glorot_uniform;

/// GRU cell.
///
/// Standard gating: z = sigmoid(W_z x + U_z h + b_z),
/// r = sigmoid(W_r x + U_r h + b_r),
/// candidate = tanh(W_h x + U_h (r * h) + b_h),
/// h' = (1 - z) * h + z * candidate.
pub struct GruCell {
    w_z: Tensor,
    u_z: Tensor,
    b_z: Tensor,
    w_r: Tensor,
    u_r: Tensor,
    b_r: Tensor,
    w_h: Tensor,
    u_h: Tensor,
    b_h: Tensor,
    hidden_dim: usize,
}

impl GruCell {
    pub fn new(input_dim: usize, hidden_dim: usize, vb: VarBuilder) -> GnnResult<Self> {
        let input_init = glorot_uniform(input_dim, hidden_dim);
        let recurrent_init = glorot_uniform(hidden_dim, hidden_dim);
        Ok(Self {
            w_z: vb.get_with_hints((input_dim, hidden_dim), "w_z", input_init)?,
            u_z: vb.get_with_hints((hidden_dim, hidden_dim), "u_z", recurrent_init)?,
            b_z: vb.get_with_hints(hidden_dim, "b_z", Init::Const(0.0))?,
            w_r: vb.get_with_hints((input_dim, hidden_dim), "w_r", input_init)?,
            u_r: vb.get_with_hints((hidden_dim, hidden_dim), "u_r", recurrent_init)?,
            b_r: vb.get_with_hints(hidden_dim, "b_r", Init::Const(0.0))?,
            w_h: vb.get_with_hints((input_dim, hidden_dim), "w_h", input_init)?,
            u_h: vb.get_with_hints((hidden_dim, hidden_dim), "u_h", recurrent_init)?,
            b_h: vb.get_with_hints(hidden_dim, "b_h", Init::Const(0.0))?,
            hidden_dim,
        })
    }

    pub fn hidden_dim(&self) -> usize {
        self.hidden_dim
    }

    pub fn zero_state(&self, batch: usize, device: &Device) -> GnnResult<Tensor> {
        Ok(Tensor::zeros((batch, self.hidden_dim), DType::F32, device)?)
    }

    /// One step: input `(B, input_dim)`, hidden `(B, hidden_dim)`.
    pub fn step(&self, x: &Tensor, h: &Tensor) -> GnnResult<Tensor> {
        let z = sigmoid(
            &x.matmul(&self.w_z)?
                .add(&h.matmul(&self.u_z)?)?
                .broadcast_add(&self.b_z)?,
        )?;
        let r = sigmoid(
            &x.matmul(&self.w_r)?
                .add(&h.matmul(&self.u_r)?)?
                .broadcast_add(&self.b_r)?,
        )?;
        let candidate = x
            .matmul(&self.w_h)?
            .add(&r.mul(h)?.matmul(&self.u_h)?)?
            .broadcast_add(&self.b_h)?
            .tanh()?;
        let keep = z.affine(-1.0, 1.0)?;
        Ok(keep.mul(h)?.add(&z.mul(&candidate)?)?)
    }
}

/// Stack of GRU layers applied over the time axis.
pub struct GruEncoder {
    layers: Vec<GruCell>,
    stateful: bool,
    state: Vec<Option<Tensor>>,
}

impl GruEncoder {
    pub fn new(config: &ModelConfig, input_dim: usize, vb: VarBuilder) -> GnnResult<Self> {
        let dims = [config.rnn_dim];
        let mut layers = Vec::with_capacity(dims.len());
        let mut in_dim = input_dim;
        for (i, &dim) in dims.iter().enumerate() {
            layers.push(GruCell::new(in_dim, dim, vb.pp(format!("layer{i}")))?);
            in_dim = dim;
        }
        let state = vec![None; layers.len()];
        Ok(Self {
            layers,
            stateful: config.stateful_rnn,
            state,
        })
    }

    /// Drop any carried hidden state.
    pub fn reset_state(&mut self) {
        for s in &mut self.state {
            *s = None;
        }
    }

    /// `(B, T, F)` -> per-step outputs of the top layer, `(B, T, H)`.
    pub fn forward(&mut self, x: &Tensor) -> GnnResult<Tensor> {
        let (b, t, _) = x.dims3()?;
        if !self.stateful {
            self.reset_state();
        }
        let mut hidden = Vec::with_capacity(self.layers.len());
        for (i, cell) in self.layers.iter().enumerate() {
            let h = match &self.state[i] {
                // A carried state only applies while the batch layout is
                // unchanged; a trailing partial group starts from zeros.
                Some(h) if h.dim(0)? == b => h.clone(),
                _ => cell.zero_state(b, x.device())?,
            };
            hidden.push(h);
        }

        let mut outputs = Vec::with_capacity(t);
        for step in 0..t {
            let mut input = x.i((.., step, ..))?.contiguous()?;
            for (i, cell) in self.layers.iter().enumerate() {
                let h = cell.step(&input, &hidden[i])?;
                hidden[i] = h.clone();
                input = h;
            }
            outputs.push(input);
        }

        if self.stateful {
            for (i, h) in hidden.into_iter().enumerate() {
                // Detached so carried state does not keep old graphs alive.
                self.state[i] = Some(h.detach());
            }
        }
        Ok(Tensor::stack(&outputs, 1)?)
    }
}

/// GRU decoder with additive attention over the encoder outputs.
///
/// At each step the previous decoder hidden state scores every encoder
/// position; the softmax-weighted context is concatenated with the current
/// encoder output and fed to the cell. Decode length equals encode length.
pub struct AttnDecoder {
    w_enc: Linear,
    w_dec: Linear,
    v: Tensor,
    cell: GruCell,
    stateful: bool,
    state: Option<Tensor>,
}

impl AttnDecoder {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> GnnResult<Self> {
        let dim = config.rnn_dim;
        Ok(Self {
            w_enc: linear(dim, dim, vb.pp("w_enc"))?,
            w_dec: linear(dim, dim, vb.pp("w_dec"))?,
            v: vb.get_with_hints((dim, 1), "v", glorot_uniform(dim, 1))?,
            cell: GruCell::new(2 * dim, dim, vb.pp("cell"))?,
            stateful: config.stateful_rnn,
            state: None,
        })
    }

    pub fn reset_state(&mut self) {
        self.state = None;
    }

    /// `(B, T, H)` -> `(B, T, H)`.
    pub fn forward(&mut self, enc: &Tensor) -> GnnResult<Tensor> {
        let (b, t, _) = enc.dims3()?;
        if !self.stateful {
            self.reset_state();
        }
        let mut h = match &self.state {
            Some(s) if s.dim(0)? == b => s.clone(),
            _ => self.cell.zero_state(b, enc.device())?,
        };

        let enc = enc.contiguous()?;
        let enc_proj = self.w_enc.forward(&enc)?;
        let mut outputs = Vec::with_capacity(t);
        for step in 0..t {
            let query = self.w_dec.forward(&h)?.unsqueeze(1)?;
            let scores = enc_proj
                .broadcast_add(&query)?
                .tanh()?
                .broadcast_matmul(&self.v)?
                .squeeze(2)?;
            let weights = softmax_last_dim(&scores)?;
            let context = weights.unsqueeze(1)?.matmul(&enc)?.squeeze(1)?;

            let enc_step = enc.i((.., step, ..))?.contiguous()?;
            let input = Tensor::cat(&[&enc_step, &context], 1)?;
            h = self.cell.step(&input, &h)?;
            outputs.push(h.clone());
        }

        if self.stateful {
            self.state = Some(h.detach());
        }
        Ok(Tensor::stack(&outputs, 1)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    fn vb() -> (VarMap, VarBuilder<'static>) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        (varmap, vb)
    }

    #[test]
    fn test_cell_step_shape() {
        let (_vm, vb) = vb();
        let cell = GruCell::new(3, 5, vb).unwrap();
        let x = Tensor::randn(0f32, 1.0, (4, 3), &Device::Cpu).unwrap();
        let h = cell.zero_state(4, &Device::Cpu).unwrap();
        let next = cell.step(&x, &h).unwrap();
        assert_eq!(next.dims(), &[4, 5]);
    }

    #[test]
    fn test_cell_is_deterministic() {
        let (_vm, vb) = vb();
        let cell = GruCell::new(3, 5, vb).unwrap();
        let x = Tensor::randn(0f32, 1.0, (2, 3), &Device::Cpu).unwrap();
        let h = Tensor::randn(0f32, 1.0, (2, 5), &Device::Cpu).unwrap();
        let a = cell.step(&x, &h).unwrap().to_vec2::<f32>().unwrap();
        let b = cell.step(&x, &h).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_encoder_output_shape() {
        let config = ModelConfig::test();
        let (_vm, vb) = vb();
        let mut encoder = GruEncoder::new(&config, 3, vb).unwrap();
        let x = Tensor::randn(0f32, 1.0, (6, 4, 3), &Device::Cpu).unwrap();
        let out = encoder.forward(&x).unwrap();
        assert_eq!(out.dims(), &[6, 4, config.rnn_dim]);
    }

    #[test]
    fn test_encoder_state_carries_across_calls() {
        let config = ModelConfig::test();
        let (_vm, vb) = vb();
        let mut encoder = GruEncoder::new(&config, 3, vb).unwrap();
        let x = Tensor::randn(0f32, 1.0, (2, 4, 3), &Device::Cpu).unwrap();

        let first = encoder.forward(&x).unwrap();
        // Second call starts from the carried state, so outputs differ.
        let carried = encoder.forward(&x).unwrap();
        encoder.reset_state();
        let fresh = encoder.forward(&x).unwrap();

        let first = first.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let carried = carried.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let fresh = fresh.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(first, fresh);
        assert_ne!(first, carried);
    }

    #[test]
    fn test_stateless_encoder_resets_every_call() {
        let mut config = ModelConfig::test();
        config.stateful_rnn = false;
        let (_vm, vb) = vb();
        let mut encoder = GruEncoder::new(&config, 3, vb).unwrap();
        let x = Tensor::randn(0f32, 1.0, (2, 4, 3), &Device::Cpu).unwrap();

        let a = encoder.forward(&x).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let b = encoder.forward(&x).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_decoder_output_shape() {
        let config = ModelConfig::test();
        let (_vm, vb) = vb();
        let mut decoder = AttnDecoder::new(&config, vb).unwrap();
        let enc = Tensor::randn(0f32, 1.0, (6, 4, config.rnn_dim), &Device::Cpu).unwrap();
        let out = decoder.forward(&enc).unwrap();
        assert_eq!(out.dims(), &[6, 4, config.rnn_dim]);
    }
}
