use std::cell::Cell;
use std::collections::HashMap;

use candle_core::{Device, Tensor};
use minvis::frame_loader::{FrameLoader, ImageLoader};
use minvis::{
    FrameFeatureProvider, FrameFeatures, Mode, VideoInput, VideoMaskFormer,
    VideoMaskFormerConfig, VideoOutput,
};
use tracing_subscriber::EnvFilter;

/// Replays per-frame features exported from an image-level segmenter, in frame order.
struct PrecomputedFeatures {
    frame_embeds: Tensor,  // 1 c t q
    mask_features: Tensor, // 1 t c h w
    cursor: Cell<usize>,
}

impl PrecomputedFeatures {
    fn load(path: &str, device: &Device) -> candle_core::Result<Self> {
        let tensors = candle_core::safetensors::load(path, device)?;
        let get = |name: &str| {
            tensors
                .get(name)
                .cloned()
                .ok_or_else(|| candle_core::Error::msg(format!("missing `{name}` in {path}")))
        };
        Ok(Self {
            frame_embeds: get("frame_embeds")?,
            mask_features: get("mask_features")?,
            cursor: Cell::new(0),
        })
    }
}

impl FrameFeatureProvider for PrecomputedFeatures {
    fn extract(&self, images: &Tensor, _num_videos: usize) -> candle_core::Result<FrameFeatures> {
        let start = self.cursor.get();
        let len = images.dim(0)?;
        self.cursor.set(start + len);
        Ok(FrameFeatures {
            frame_embeds: self.frame_embeds.narrow(2, start, len)?,
            mask_features: self.mask_features.narrow(1, start, len)?,
        })
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let device = Device::cuda_if_available(0)?;

    let config = match std::env::args().nth(1) {
        Some(path) => VideoMaskFormerConfig::from_json_file(path)?,
        None => VideoMaskFormerConfig {
            window_inference: true,
            ..Default::default()
        },
    };

    let frame_loader = ImageLoader::new("data/bedroom")?;
    let frames = frame_loader.load_clip(&device)?;
    let (height, width) = frame_loader.frame_size();

    let provider = PrecomputedFeatures::load("checkpoints/bedroom_features.safetensors", &device)?;
    let model = VideoMaskFormer::load(
        Box::new(provider),
        "checkpoints/minvis_tracker.safetensors",
        config,
        device,
    )?;

    let input = VideoInput::new(frames).with_output_size(height, width);
    let VideoOutput::Inference(prediction) = model.forward(&[input], Mode::Inference)? else {
        unreachable!("inference mode returns a prediction");
    };

    let mut masks = HashMap::new();
    for (i, ((score, label), mask)) in prediction
        .pred_scores
        .iter()
        .zip(prediction.pred_labels.iter())
        .zip(prediction.pred_masks.iter())
        .enumerate()
    {
        println!("instance {i}: class {label} score {score:.3}");
        masks.insert(format!("instance.{i}"), mask.clone());
    }
    candle_core::safetensors::save(&masks, "bedroom_instances.safetensors")?;

    Ok(())
}
