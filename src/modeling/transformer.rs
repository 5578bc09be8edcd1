use candle_core::{Result, Tensor};
use candle_nn::{layer_norm, Activation, LayerNorm, Linear, Module, VarBuilder};

use crate::modeling::utils::scaled_dot_product_attention;

/// Multi-head attention reading the packed `in_proj_weight` / `in_proj_bias` layout.
///
/// Inputs and outputs are sequence-first: `(tokens, batch, channels)`.
#[derive(Debug, Clone)]
pub struct MultiHeadAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    num_heads: usize,
}

impl MultiHeadAttention {
    pub fn new(embed_dim: usize, num_heads: usize, vb: VarBuilder) -> Result<Self> {
        let in_proj_weight = vb.get_with_hints(
            (3 * embed_dim, embed_dim),
            "in_proj_weight",
            candle_nn::init::DEFAULT_KAIMING_NORMAL,
        )?;
        let in_proj_bias =
            vb.get_with_hints(3 * embed_dim, "in_proj_bias", candle_nn::init::ZERO)?;

        let split = |i: usize| -> Result<Linear> {
            Ok(Linear::new(
                in_proj_weight.narrow(0, i * embed_dim, embed_dim)?,
                Some(in_proj_bias.narrow(0, i * embed_dim, embed_dim)?),
            ))
        };
        let out_proj = candle_nn::linear(embed_dim, embed_dim, vb.pp("out_proj"))?;

        Ok(Self {
            q_proj: split(0)?,
            k_proj: split(1)?,
            v_proj: split(2)?,
            out_proj,
            num_heads,
        })
    }

    fn separate_heads(&self, x: &Tensor) -> Result<Tensor> {
        let (b, n, c) = x.dims3()?;
        x.reshape((b, n, self.num_heads, c / self.num_heads))?
            .transpose(1, 2)?
            .contiguous()
    }

    fn recombine_heads(&self, x: &Tensor) -> Result<Tensor> {
        let (b, n_heads, n_tokens, c_per_head) = x.dims4()?;
        x.transpose(1, 2)?
            .reshape((b, n_tokens, n_heads * c_per_head))
    }

    pub fn forward(&self, query: &Tensor, key: &Tensor, value: &Tensor) -> Result<Tensor> {
        let q = self.q_proj.forward(&query.transpose(0, 1)?.contiguous()?)?;
        let k = self.k_proj.forward(&key.transpose(0, 1)?.contiguous()?)?;
        let v = self.v_proj.forward(&value.transpose(0, 1)?.contiguous()?)?;

        let q = self.separate_heads(&q)?;
        let k = self.separate_heads(&k)?;
        let v = self.separate_heads(&v)?;

        let out = scaled_dot_product_attention(&q, &k, &v)?;
        let out = self.recombine_heads(&out)?;
        self.out_proj.forward(&out)?.transpose(0, 1)?.contiguous()
    }
}

fn with_pos_embed(x: &Tensor, pos: Option<&Tensor>) -> Result<Tensor> {
    match pos {
        Some(pos) => x.broadcast_add(pos),
        None => Ok(x.clone()),
    }
}

/// Queries attend to themselves: `norm(q + attn(q + pos, q + pos, q))`.
#[derive(Debug, Clone)]
pub struct SelfAttentionLayer {
    self_attn: MultiHeadAttention,
    norm: LayerNorm,
}

impl SelfAttentionLayer {
    pub fn new(d_model: usize, nhead: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            self_attn: MultiHeadAttention::new(d_model, nhead, vb.pp("self_attn"))?,
            norm: layer_norm(d_model, 1e-5, vb.pp("norm"))?,
        })
    }

    pub fn forward(&self, tgt: &Tensor, query_pos: Option<&Tensor>) -> Result<Tensor> {
        let qk = with_pos_embed(tgt, query_pos)?;
        let tgt2 = self.self_attn.forward(&qk, &qk, tgt)?;
        self.norm.forward(&(tgt + tgt2)?)
    }
}

/// Queries attend to a context sequence, positional encodings added on both sides.
#[derive(Debug, Clone)]
pub struct CrossAttentionLayer {
    multihead_attn: MultiHeadAttention,
    norm: LayerNorm,
}

impl CrossAttentionLayer {
    pub fn new(d_model: usize, nhead: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            multihead_attn: MultiHeadAttention::new(d_model, nhead, vb.pp("multihead_attn"))?,
            norm: layer_norm(d_model, 1e-5, vb.pp("norm"))?,
        })
    }

    pub fn forward(
        &self,
        tgt: &Tensor,
        memory: &Tensor,
        pos: Option<&Tensor>,
        query_pos: Option<&Tensor>,
    ) -> Result<Tensor> {
        let q = with_pos_embed(tgt, query_pos)?;
        let k = with_pos_embed(memory, pos)?;
        let tgt2 = self.multihead_attn.forward(&q, &k, memory)?;
        self.norm.forward(&(tgt + tgt2)?)
    }
}

#[derive(Debug, Clone)]
pub struct FFNLayer {
    linear1: Linear,
    linear2: Linear,
    norm: LayerNorm,
    activation: Activation,
}

impl FFNLayer {
    pub fn new(d_model: usize, dim_feedforward: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            linear1: candle_nn::linear(d_model, dim_feedforward, vb.pp("linear1"))?,
            linear2: candle_nn::linear(dim_feedforward, d_model, vb.pp("linear2"))?,
            norm: layer_norm(d_model, 1e-5, vb.pp("norm"))?,
            activation: Activation::Relu,
        })
    }
}

impl Module for FFNLayer {
    fn forward(&self, tgt: &Tensor) -> Result<Tensor> {
        let tgt2 = self.linear1.forward(tgt)?;
        let tgt2 = self.activation.forward(&tgt2)?;
        let tgt2 = self.linear2.forward(&tgt2)?;
        self.norm.forward(&(tgt + tgt2)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn vb(varmap: &VarMap) -> VarBuilder<'_> {
        VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu)
    }

    #[test]
    fn test_attention_keeps_sequence_first_layout() -> Result<()> {
        let varmap = VarMap::new();
        let attn = MultiHeadAttention::new(8, 2, vb(&varmap).pp("attn"))?;
        let q = Tensor::randn(0f32, 1.0, (5, 2, 8), &Device::Cpu)?;
        let kv = Tensor::randn(0f32, 1.0, (7, 2, 8), &Device::Cpu)?;
        assert_eq!(attn.forward(&q, &kv, &kv)?.dims(), &[5, 2, 8]);
        Ok(())
    }

    #[test]
    fn test_attention_batches_are_independent() -> Result<()> {
        let varmap = VarMap::new();
        let attn = MultiHeadAttention::new(8, 4, vb(&varmap).pp("attn"))?;
        let q = Tensor::randn(0f32, 1.0, (3, 2, 8), &Device::Cpu)?;
        let kv = Tensor::randn(0f32, 1.0, (4, 2, 8), &Device::Cpu)?;
        let both = attn.forward(&q, &kv, &kv)?;
        let first = attn.forward(&q.narrow(1, 0, 1)?, &kv.narrow(1, 0, 1)?, &kv.narrow(1, 0, 1)?)?;
        let diff = (both.narrow(1, 0, 1)? - first)?
            .abs()?
            .flatten_all()?
            .max(0)?
            .to_scalar::<f32>()?;
        assert!(diff < 1e-5);
        Ok(())
    }

    #[test]
    fn test_layers_preserve_query_shape() -> Result<()> {
        let varmap = VarMap::new();
        let vb = vb(&varmap);
        let cross = CrossAttentionLayer::new(8, 2, vb.pp("cross"))?;
        let selfa = SelfAttentionLayer::new(8, 2, vb.pp("self"))?;
        let ffn = FFNLayer::new(8, 16, vb.pp("ffn"))?;

        let tgt = Tensor::randn(0f32, 1.0, (3, 1, 8), &Device::Cpu)?;
        let memory = Tensor::randn(0f32, 1.0, (6, 1, 8), &Device::Cpu)?;
        let pos = Tensor::randn(0f32, 1.0, (6, 1, 8), &Device::Cpu)?;
        let query_pos = Tensor::randn(0f32, 1.0, (3, 1, 8), &Device::Cpu)?;

        let out = cross.forward(&tgt, &memory, Some(&pos), Some(&query_pos))?;
        let out = selfa.forward(&out, Some(&query_pos))?;
        let out = ffn.forward(&out)?;
        assert_eq!(out.dims(), &[3, 1, 8]);
        Ok(())
    }
}
