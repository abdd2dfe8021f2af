//! Multi-head, multi-relation graph attention over the lane graph.
//!
//! Each layer attends over the neighbor set given by one adjacency matrix
//! per relation type. Self-loops are forced into every relation so a lane
//! with no neighbors still attends to itself and its attention row remains
//! a valid distribution. Head outputs are averaged or concatenated,
//! relation outputs concatenated or summed, and the layer input can be
//! added back as a residual when the widths line up.

use candle_core::{Tensor, D};
use candle_nn::ops::{leaky_relu, softmax_last_dim};
use candle_nn::{Dropout, Init, VarBuilder};

use crate::config::{HeadReduction, ModelConfig, RelationReduction};
use crate::error::GnnResult;

/// Negative slope of the LeakyReLU applied to attention logits.
const LEAKY_SLOPE: f64 = 0.2;

/// Magnitude of the additive bias that pushes non-neighbors out of the
/// softmax.
const MASK_BIAS: f64 = 1e9;

/// Glorot/Xavier uniform init: U(-s, s) with s = sqrt(6 / (fan_in + fan_out)).
pub(crate) fn glorot_uniform(fan_in: usize, fan_out: usize) -> Init {
    let scale = (6.0 / (fan_in + fan_out) as f64).sqrt();
    Init::Uniform {
        lo: -scale,
        up: scale,
    }
}

/// Identity matrix used to force self-loops.
fn identity(n: usize, device: &candle_core::Device) -> GnnResult<Tensor> {
    let mut values = vec![0f32; n * n];
    for i in 0..n {
        values[i * n + i] = 1.0;
    }
    Ok(Tensor::from_vec(values, (n, n), device)?)
}

/// One attention head: a linear transform plus the two halves of the
/// additive attention kernel.
struct AttentionHead {
    w: Tensor,
    a_src: Tensor,
    a_dst: Tensor,
}

impl AttentionHead {
    fn new(in_dim: usize, out_dim: usize, vb: VarBuilder) -> GnnResult<Self> {
        let w = vb.get_with_hints((in_dim, out_dim), "w", glorot_uniform(in_dim, out_dim))?;
        let a_src = vb.get_with_hints((out_dim, 1), "a_src", glorot_uniform(out_dim, 1))?;
        let a_dst = vb.get_with_hints((out_dim, 1), "a_dst", glorot_uniform(out_dim, 1))?;
        Ok(Self { w, a_src, a_dst })
    }

    /// Input `(B, T, N, F)`, neighbor bias `(B, 1, N, N)`.
    ///
    /// Returns the aggregated output `(B, T, N, out_dim)` and the attention
    /// coefficients `(B, T, N, N)` before dropout; every row of the
    /// coefficient tensor sums to one.
    fn forward(
        &self,
        x: &Tensor,
        bias: &Tensor,
        dropout: &Dropout,
        train: bool,
    ) -> GnnResult<(Tensor, Tensor)> {
        let h = x.broadcast_matmul(&self.w)?;
        let f_src = h.broadcast_matmul(&self.a_src)?;
        let f_dst = h.broadcast_matmul(&self.a_dst)?;

        let logits = f_src.broadcast_add(&f_dst.transpose(D::Minus2, D::Minus1)?)?;
        let logits = leaky_relu(&logits, LEAKY_SLOPE)?;
        let logits = logits.broadcast_add(bias)?;

        let attn = softmax_last_dim(&logits)?;
        let dropped = dropout.forward(&attn, train)?;
        let out = dropped.contiguous()?.matmul(&h.contiguous()?)?;
        Ok((out, attn))
    }
}

/// One graph-attention layer: `heads x relations` attention computations
/// plus the configured reductions.
pub struct GatLayer {
    // Outer index: relation, inner index: head.
    heads: Vec<Vec<AttentionHead>>,
    head_reduction: HeadReduction,
    relation_reduction: RelationReduction,
    residual: bool,
    attn_dropout: Dropout,
}

impl GatLayer {
    pub fn new(config: &ModelConfig, layer: usize, in_dim: usize, vb: VarBuilder) -> GnnResult<Self> {
        let mut heads = Vec::with_capacity(config.relation_names.len());
        for relation in &config.relation_names {
            let vb_rel = vb.pp(relation);
            let mut relation_heads = Vec::with_capacity(config.attn_heads[layer]);
            for head in 0..config.attn_heads[layer] {
                relation_heads.push(AttentionHead::new(
                    in_dim,
                    config.attn_dims[layer],
                    vb_rel.pp(format!("head{head}")),
                )?);
            }
            heads.push(relation_heads);
        }
        Ok(Self {
            heads,
            head_reduction: config.head_reduction,
            relation_reduction: config.relation_reduction,
            residual: config.attn_residual,
            attn_dropout: Dropout::new(config.attn_dropout),
        })
    }

    /// Neighbor bias for relation `r`: 0 on edges (self-loops included),
    /// -MASK_BIAS elsewhere.
    fn relation_bias(&self, a: &Tensor, r: usize) -> GnnResult<Tensor> {
        let (_, _, n, _) = a.dims4()?;
        let adj = a.narrow(1, r, 1)?.squeeze(1)?;
        let eye = identity(n, a.device())?;
        let with_loops = adj.broadcast_maximum(&eye)?;
        // edge -> 0, non-edge -> -MASK_BIAS
        Ok(with_loops.affine(MASK_BIAS, -MASK_BIAS)?.unsqueeze(1)?)
    }

    /// Forward pass that also returns the attention coefficients, indexed
    /// `[relation][head]`, each `(B, T, N, N)`.
    pub fn forward_with_attn(
        &self,
        x: &Tensor,
        a: &Tensor,
        train: bool,
    ) -> GnnResult<(Tensor, Vec<Vec<Tensor>>)> {
        let mut relation_outputs = Vec::with_capacity(self.heads.len());
        let mut coefficients = Vec::with_capacity(self.heads.len());

        for (r, relation_heads) in self.heads.iter().enumerate() {
            let bias = self.relation_bias(a, r)?;
            let mut head_outputs = Vec::with_capacity(relation_heads.len());
            let mut head_coefficients = Vec::with_capacity(relation_heads.len());
            for head in relation_heads {
                let (out, attn) = head.forward(x, &bias, &self.attn_dropout, train)?;
                head_outputs.push(out);
                head_coefficients.push(attn);
            }
            let combined = match self.head_reduction {
                HeadReduction::Average => Tensor::stack(&head_outputs, 0)?.mean(0)?,
                HeadReduction::Concat => Tensor::cat(&head_outputs, D::Minus1)?,
            };
            relation_outputs.push(combined);
            coefficients.push(head_coefficients);
        }

        let mut out = match self.relation_reduction {
            RelationReduction::Concat => Tensor::cat(&relation_outputs, D::Minus1)?,
            RelationReduction::Sum => {
                let mut acc = relation_outputs[0].clone();
                for other in &relation_outputs[1..] {
                    acc = acc.add(other)?;
                }
                acc
            }
        };
        if self.residual {
            out = out.add(x)?;
        }
        Ok((out.relu()?, coefficients))
    }

    pub fn forward(&self, x: &Tensor, a: &Tensor, train: bool) -> GnnResult<Tensor> {
        Ok(self.forward_with_attn(x, a, train)?.0)
    }
}

/// Stack of graph-attention layers.
pub struct GatEncoder {
    layers: Vec<GatLayer>,
}

impl GatEncoder {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> GnnResult<Self> {
        let mut layers = Vec::with_capacity(config.attn_dims.len());
        let mut in_dim = config.x_features.len();
        for layer in 0..config.attn_dims.len() {
            layers.push(GatLayer::new(
                config,
                layer,
                in_dim,
                vb.pp(format!("gat{layer}")),
            )?);
            in_dim = config.gat_layer_dim(layer);
        }
        Ok(Self { layers })
    }

    /// `(B, T, N, F)` with adjacency `(B, R, N, N)` -> `(B, T, N, F_out)`.
    pub fn forward(&self, x: &Tensor, a: &Tensor, train: bool) -> GnnResult<Tensor> {
        let mut h = x.clone();
        for layer in &self.layers {
            h = layer.forward(&h, a, train)?;
        }
        Ok(h)
    }
}
