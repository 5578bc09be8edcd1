use candle_core::{Result, Tensor, D};
use candle_nn::{Activation, Linear, Module, VarBuilder};

/// Plain perceptron stack, `layers.{i}` weights, activation between layers only.
#[derive(Debug, Clone)]
pub struct MLP {
    layers: Vec<Linear>,
    act: Activation,
}

impl MLP {
    pub fn new(
        vb: VarBuilder,
        input_dim: usize,
        hidden_dim: usize,
        output_dim: usize,
        num_layers: usize,
        activation: Activation,
    ) -> Result<Self> {
        let h = vec![hidden_dim; num_layers.saturating_sub(1)];
        let dims = std::iter::once(input_dim)
            .chain(h.clone())
            .zip(h.into_iter().chain(std::iter::once(output_dim)));

        let mut layers = Vec::with_capacity(num_layers);
        for (i, (in_dim, out_dim)) in dims.enumerate() {
            layers.push(candle_nn::linear(in_dim, out_dim, vb.pp(format!("layers.{i}")))?);
        }

        Ok(Self {
            layers,
            act: activation,
        })
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }
}

impl Module for MLP {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let last = self.layers.len().saturating_sub(1);
        let mut xs = xs.clone();
        for (i, layer) in self.layers.iter().enumerate() {
            xs = layer.forward(&xs)?;
            if i < last {
                xs = self.act.forward(&xs)?;
            }
        }
        Ok(xs)
    }
}

/// softmax(q k^T / sqrt(d)) v over the last two dims.
pub fn scaled_dot_product_attention(q: &Tensor, k: &Tensor, v: &Tensor) -> Result<Tensor> {
    let dim = q.dim(D::Minus1)?;
    let scale_factor = 1.0 / (dim as f64).sqrt();
    let attn_weights = (q.matmul(&k.t()?)? * scale_factor)?;
    candle_nn::ops::softmax_last_dim(&attn_weights)?.matmul(v)
}

/// Applies a `Module` that only understands up to 4 dims to a tensor of any rank by
/// folding the leading dims together.
pub fn forward_flattened<M: Module>(module: &M, xs: &Tensor) -> Result<Tensor> {
    let dims = xs.dims().to_vec();
    if dims.len() <= 3 {
        return module.forward(xs);
    }
    let (lead, tail) = dims.split_at(dims.len() - 2);
    let folded: usize = lead.iter().product();
    let out = module.forward(&xs.reshape((folded, tail[0], tail[1]))?)?;
    let mut out_shape = dims[..dims.len() - 1].to_vec();
    out_shape.push(out.dim(D::Minus1)?);
    out.reshape(out_shape)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_mlp_shapes() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let mlp = MLP::new(vb, 8, 16, 4, 3, Activation::Relu)?;
        assert_eq!(mlp.num_layers(), 3);
        let xs = Tensor::randn(0f32, 1.0, (2, 5, 8), &Device::Cpu)?;
        assert_eq!(mlp.forward(&xs)?.dims(), &[2, 5, 4]);
        Ok(())
    }

    #[test]
    fn test_forward_flattened_high_rank() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let linear = candle_nn::linear(6, 3, vb.pp("proj"))?;
        let xs = Tensor::randn(0f32, 1.0, (2, 3, 4, 5, 6), &Device::Cpu)?;
        let out = forward_flattened(&linear, &xs)?;
        assert_eq!(out.dims(), &[2, 3, 4, 5, 3]);

        let direct = linear.forward(&xs.reshape((24, 5, 6))?)?.reshape((2, 3, 4, 5, 3))?;
        let diff = (out - direct)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?;
        assert_eq!(diff, 0.0);
        Ok(())
    }

    #[test]
    fn test_attention_uniform_keys_average_values() -> Result<()> {
        let q = Tensor::randn(0f32, 1.0, (1, 2, 4), &Device::Cpu)?;
        let k = Tensor::zeros((1, 3, 4), DType::F32, &Device::Cpu)?;
        let v = Tensor::new(&[[[1f32, 0.], [2., 0.], [3., 0.]]], &Device::Cpu)?;
        let out = scaled_dot_product_attention(&q, &k, &v)?;
        let vals = out.flatten_all()?.to_vec1::<f32>()?;
        assert!((vals[0] - 2.0).abs() < 1e-5);
        assert!((vals[2] - 2.0).abs() < 1e-5);
        Ok(())
    }
}
