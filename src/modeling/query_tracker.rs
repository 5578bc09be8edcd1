use std::path::Path;

use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{Activation, Conv2d, Conv2dConfig, Embedding, LayerNorm, Linear, Module, VarBuilder};

use crate::config::QueryTrackerConfig;
use crate::modeling::transformer::{CrossAttentionLayer, FFNLayer, SelfAttentionLayer};
use crate::modeling::utils::{forward_flattened, MLP};

macro_rules! get_scalar {
    ($ty:ty, $tensors:expr, $key:expr, $default:expr) => {
        $tensors
            .get($key)
            .and_then(|t| t.to_scalar::<$ty>().ok())
            .unwrap_or($default)
    };
}

macro_rules! get_bool {
    ($tensors:expr, $key:expr, $default:expr) => {
        $tensors
            .get($key)
            .and_then(|t| t.to_scalar::<u8>().ok())
            .map(|v| v > 0)
            .unwrap_or($default)
    };
}

/// Which predictions a forward pass has to materialize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Every decoder layer is decoded into logits and masks for deep supervision.
    Training,
    /// Only the last decoder layer is decoded.
    Inference,
}

/// Predictions from one intermediate decoder layer.
#[derive(Debug, Clone)]
pub struct AuxOutput {
    pub pred_logits: Tensor,
    pub pred_masks: Tensor,
}

#[derive(Debug, Clone)]
pub struct TrackerOutput {
    /// (batch, queries, time, classes + 1)
    pub pred_logits: Tensor,
    /// (batch, queries, time, height, width)
    pub pred_masks: Tensor,
    /// Last layer state per frame, (batch, channels, time, queries)
    pub pred_embds: Tensor,
    /// Non-final layers, shallowest first. Empty in inference mode.
    pub aux_outputs: Vec<AuxOutput>,
}

impl TrackerOutput {
    /// Query state of the last frame, (queries, batch, channels), used to seed the next window.
    pub fn last_frame_query(&self) -> Result<Tensor> {
        last_frame_query(&self.pred_embds)
    }
}

/// (batch, channels, time, queries) -> last frame as (queries, batch, channels)
pub fn last_frame_query(pred_embds: &Tensor) -> Result<Tensor> {
    let t = pred_embds.dim(2)?;
    pred_embds.permute((2, 3, 0, 1))?.get(t - 1)?.contiguous()
}

/// cross-attend -> self-attend -> feed-forward
#[derive(Debug, Clone)]
struct DecoderLayer {
    cross_attn: CrossAttentionLayer,
    self_attn: SelfAttentionLayer,
    ffn: FFNLayer,
}

impl DecoderLayer {
    fn forward(
        &self,
        output: &Tensor,
        frame_embeds: &Tensor,
        frame_pos: &Tensor,
        query_pos: &Tensor,
    ) -> Result<Tensor> {
        let output = self
            .cross_attn
            .forward(output, frame_embeds, Some(frame_pos), Some(query_pos))?;
        let output = self.self_attn.forward(&output, Some(query_pos))?;
        self.ffn.forward(&output)
    }
}

/// Recurrent transformer decoder propagating a fixed set of object queries through time.
pub struct QueryTracker {
    query_feat: Embedding,
    query_embed: Embedding,
    frame_pos_embed: Embedding,
    layers: Vec<DecoderLayer>,
    decoder_norm: LayerNorm,
    class_embed: Linear,
    mask_embed: MLP,
    mask_feature_proj: Conv2d,
    frame_proj: Linear,

    config: QueryTrackerConfig,
}

impl QueryTracker {
    pub fn new(config: QueryTrackerConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = config.hidden_channel;

        let query_feat = candle_nn::embedding(config.num_object_query, hidden, vb.pp("query_feat"))?;
        let query_embed =
            candle_nn::embedding(config.num_object_query, hidden, vb.pp("query_embed"))?;
        let frame_pos_embed =
            candle_nn::embedding(config.frame_pos_table_size, hidden, vb.pp("frame_pos_embed"))?;

        let mut layers = Vec::with_capacity(config.decoder_layer_num);
        for j in 0..config.decoder_layer_num {
            layers.push(DecoderLayer {
                cross_attn: CrossAttentionLayer::new(
                    hidden,
                    config.num_head,
                    vb.pp(format!("transformer_cross_attention_layers.{j}")),
                )?,
                self_attn: SelfAttentionLayer::new(
                    hidden,
                    config.num_head,
                    vb.pp(format!("transformer_self_attention_layers.{j}")),
                )?,
                ffn: FFNLayer::new(
                    hidden,
                    config.feedforward_channel,
                    vb.pp(format!("transformer_ffn_layers.{j}")),
                )?,
            });
        }

        let decoder_norm = candle_nn::layer_norm(hidden, 1e-5, vb.pp("decoder_norm"))?;
        let class_embed = candle_nn::linear(hidden, config.class_num + 1, vb.pp("class_embed"))?;
        let mask_embed = MLP::new(
            vb.pp("mask_embed"),
            hidden,
            hidden,
            config.mask_dim,
            3,
            Activation::Relu,
        )?;
        let mask_feature_proj = candle_nn::conv2d(
            config.mask_dim,
            config.mask_dim,
            1,
            Conv2dConfig::default(),
            vb.pp("mask_feature_proj"),
        )?;
        let frame_proj = candle_nn::linear(hidden, hidden, vb.pp("frame_proj"))?;

        Ok(Self {
            query_feat,
            query_embed,
            frame_pos_embed,
            layers,
            decoder_norm,
            class_embed,
            mask_embed,
            mask_feature_proj,
            frame_proj,
            config,
        })
    }

    /// Loads weights stored under `tracker.`; `config.tracker.*` scalars override `config`.
    pub fn from_safetensors<P: AsRef<Path>>(
        checkpoint_path: P,
        config: QueryTrackerConfig,
        device: &Device,
    ) -> Result<Self> {
        let tensors = candle_core::safetensors::load(checkpoint_path, device)?;
        let prefix = "config.tracker";

        let defaults = config;
        let config = QueryTrackerConfig {
            num_object_query: get_scalar!(
                i64,
                &tensors,
                &format!("{prefix}.num_object_query"),
                defaults.num_object_query as i64
            ) as usize,
            hidden_channel: get_scalar!(
                i64,
                &tensors,
                &format!("{prefix}.hidden_channel"),
                defaults.hidden_channel as i64
            ) as usize,
            feedforward_channel: get_scalar!(
                i64,
                &tensors,
                &format!("{prefix}.feedforward_channel"),
                defaults.feedforward_channel as i64
            ) as usize,
            num_head: get_scalar!(
                i64,
                &tensors,
                &format!("{prefix}.num_head"),
                defaults.num_head as i64
            ) as usize,
            decoder_layer_num: get_scalar!(
                i64,
                &tensors,
                &format!("{prefix}.decoder_layer_num"),
                defaults.decoder_layer_num as i64
            ) as usize,
            mask_dim: get_scalar!(
                i64,
                &tensors,
                &format!("{prefix}.mask_dim"),
                defaults.mask_dim as i64
            ) as usize,
            class_num: get_scalar!(
                i64,
                &tensors,
                &format!("{prefix}.class_num"),
                defaults.class_num as i64
            ) as usize,
            detach_frame_connection: get_bool!(
                &tensors,
                &format!("{prefix}.detach_frame_connection"),
                defaults.detach_frame_connection
            ),
            frame_pos_table_size: get_scalar!(
                i64,
                &tensors,
                &format!("{prefix}.frame_pos_table_size"),
                defaults.frame_pos_table_size as i64
            ) as usize,
        };

        tracing::info!(
            queries = config.num_object_query,
            layers = config.decoder_layer_num,
            classes = config.class_num,
            "loaded query tracker checkpoint"
        );

        let vb = VarBuilder::from_tensors(tensors, DType::F32, device);
        Self::new(config, vb.pp("tracker"))
    }

    pub fn config(&self) -> &QueryTrackerConfig {
        &self.config
    }

    pub fn num_queries(&self) -> usize {
        self.config.num_object_query
    }

    pub fn num_classes(&self) -> usize {
        self.config.class_num
    }

    /// Full forward pass with auxiliary outputs.
    ///
    /// * `frame_embeds` - (batch, channels, time, queries)
    /// * `mask_features` - (batch, time, mask_dim, height, width)
    /// * `init_query` - optional seed state (queries, batch, channels) from a previous window
    pub fn forward(
        &self,
        frame_embeds: &Tensor,
        mask_features: &Tensor,
        init_query: Option<&Tensor>,
    ) -> Result<TrackerOutput> {
        self.forward_with_mode(frame_embeds, mask_features, init_query, Mode::Training)
    }

    pub fn forward_with_mode(
        &self,
        frame_embeds: &Tensor,
        mask_features: &Tensor,
        init_query: Option<&Tensor>,
        mode: Mode,
    ) -> Result<TrackerOutput> {
        let (b, t, c, h, w) = mask_features.dims5()?;
        let mask_features = self
            .mask_feature_proj
            .forward(&mask_features.flatten(0, 1)?)?
            .reshape((b, t, c, h, w))?;

        let frame_embeds = frame_embeds.permute((2, 3, 0, 1))?.contiguous()?; // t, q, b, c
        let (n_frame, n_q, bs, _) = frame_embeds.dims4()?;
        tracing::debug!(
            frames = n_frame,
            queries = n_q,
            seeded = init_query.is_some(),
            "query tracker forward"
        );

        let mut output = match init_query {
            None => self
                .query_feat
                .embeddings()
                .unsqueeze(1)?
                .repeat((1, bs, 1))?,
            Some(seed) => self.frame_proj.forward(seed)?,
        };
        let output_pos = self
            .query_embed
            .embeddings()
            .unsqueeze(1)?
            .repeat((1, bs, 1))?;
        let frame_pos = self
            .frame_pos_embed
            .embeddings()
            .narrow(0, 0, n_q)?
            .unsqueeze(1)?
            .repeat((1, bs, 1))?;

        let mut frame_outputs = Vec::with_capacity(n_frame);
        for i in 0..n_frame {
            let single_frame_embeds = frame_embeds.get(i)?;
            let mut layer_outputs = Vec::with_capacity(self.layers.len());
            for layer in self.layers.iter() {
                output = layer.forward(&output, &single_frame_embeds, &frame_pos, &output_pos)?;
                layer_outputs.push(output.clone());
            }
            if self.config.detach_frame_connection {
                output = output.detach();
            }
            output = self.frame_proj.forward(&output)?;
            frame_outputs.push(Tensor::stack(&layer_outputs, 0)?);
        }
        let outputs = Tensor::stack(&frame_outputs, 0)?; // t, layer, q, b, c
        let num_layers = outputs.dim(1)?;

        let pred_embds = outputs
            .narrow(1, num_layers - 1, 1)?
            .squeeze(1)?
            .permute((2, 3, 0, 1))?
            .contiguous()?;

        let decoded = match mode {
            Mode::Training => outputs,
            Mode::Inference => outputs.narrow(1, num_layers - 1, 1)?,
        };
        let (outputs_class, outputs_mask) = self.prediction(&decoded, &mask_features)?;
        let decoded_layers = outputs_class.dim(0)?;

        let mut aux_outputs = Vec::with_capacity(decoded_layers.saturating_sub(1));
        for l in 0..decoded_layers - 1 {
            aux_outputs.push(AuxOutput {
                pred_logits: outputs_class.get(l)?,
                pred_masks: outputs_mask.get(l)?,
            });
        }

        Ok(TrackerOutput {
            pred_logits: outputs_class.get(decoded_layers - 1)?,
            pred_masks: outputs_mask.get(decoded_layers - 1)?,
            pred_embds,
            aux_outputs,
        })
    }

    /// Decodes (time, layer, q, b, c) states into per-layer logits (layer, b, q, t, cls + 1)
    /// and masks (layer, b, q, t, h, w).
    fn prediction(&self, outputs: &Tensor, mask_features: &Tensor) -> Result<(Tensor, Tensor)> {
        let decoder_output = self.decoder_norm.forward(&outputs.contiguous()?)?;
        let decoder_output = decoder_output.permute(vec![1, 3, 0, 2, 4])?.contiguous()?; // l, b, t, q, c
        let (l, b, t, q, _) = decoder_output.dims5()?;

        let outputs_class = forward_flattened(&self.class_embed, &decoder_output)?
            .transpose(2, 3)?
            .contiguous()?;

        let mask_embed = forward_flattened(&self.mask_embed, &decoder_output)?; // l, b, t, q, d
        let d = mask_embed.dim(4)?;
        let (_, _, _, h, w) = mask_features.dims5()?;

        // einsum "lbtqc,btchw->lbqthw" as one batched matmul over (b t)
        let mask_embed = mask_embed
            .permute(vec![1, 2, 0, 3, 4])?
            .contiguous()?
            .reshape((b * t, l * q, d))?;
        let mask_features = mask_features.contiguous()?.reshape((b * t, d, h * w))?;
        let outputs_mask = mask_embed
            .matmul(&mask_features)?
            .reshape(vec![b, t, l, q, h, w])?
            .permute(vec![2, 0, 3, 1, 4, 5])?
            .contiguous()?;

        Ok((outputs_class, outputs_mask))
    }
}
