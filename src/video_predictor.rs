use std::path::Path;

use candle_core::{Device, Tensor};

use crate::config::VideoMaskFormerConfig;
use crate::error::{Result, VisError};
use crate::frame_loader::{normalize_frame, ImageList};
use crate::matching::associate_tracks;
use crate::modeling::query_tracker::{last_frame_query, Mode, QueryTracker, TrackerOutput};
use crate::postprocess::{inference_video, retry_if_oom, ResizeSpec, VideoPrediction};
use crate::targets::{prepare_targets, FrameInstances, VideoTargets};

/// Per-frame outputs of the image-level segmenter that feeds the tracker.
#[derive(Debug, Clone)]
pub struct FrameFeatures {
    /// (batch, channels, time, queries)
    pub frame_embeds: Tensor,
    /// (batch, time, mask_dim, height, width)
    pub mask_features: Tensor,
}

/// Backbone plus segmentation head run independently on every frame.
pub trait FrameFeatureProvider {
    /// `images` is (num_videos * time, 3, h, w), frames of one video contiguous.
    fn extract(&self, images: &Tensor, num_videos: usize) -> candle_core::Result<FrameFeatures>;
}

/// One clip as handed to the model.
#[derive(Debug, Clone)]
pub struct VideoInput {
    /// Raw (3, h, w) frames with values in [0, 255].
    pub frames: Vec<Tensor>,
    /// Requested output height, defaults to the first frame's height.
    pub height: Option<usize>,
    /// Requested output width, defaults to the first frame's width.
    pub width: Option<usize>,
    /// Per-frame annotations, required for training.
    pub instances: Option<Vec<FrameInstances>>,
}

impl VideoInput {
    pub fn new(frames: Vec<Tensor>) -> Self {
        Self {
            frames,
            height: None,
            width: None,
            instances: None,
        }
    }

    pub fn with_output_size(mut self, height: usize, width: usize) -> Self {
        self.height = Some(height);
        self.width = Some(width);
        self
    }

    pub fn with_instances(mut self, instances: Vec<FrameInstances>) -> Self {
        self.instances = Some(instances);
        self
    }
}

#[derive(Debug, Clone)]
pub struct TrainingOutput {
    pub outputs: TrackerOutput,
    pub targets: Vec<VideoTargets>,
}

#[derive(Debug, Clone)]
pub enum VideoOutput {
    Training(TrainingOutput),
    Inference(VideoPrediction),
}

/// The part of a window's tracker output kept once the window is done.
#[derive(Debug, Clone)]
pub struct WindowChunk {
    /// (batch, queries, time, classes + 1)
    pub pred_logits: Tensor,
    /// (batch, queries, time, height, width)
    pub pred_masks: Tensor,
    /// (batch, channels, time, queries)
    pub pred_embds: Tensor,
}

impl WindowChunk {
    pub fn num_frames(&self) -> candle_core::Result<usize> {
        self.pred_logits.dim(2)
    }

    pub fn last_frame_query(&self) -> candle_core::Result<Tensor> {
        last_frame_query(&self.pred_embds)
    }

    fn cat(chunks: &[WindowChunk]) -> candle_core::Result<Self> {
        let logits: Vec<&Tensor> = chunks.iter().map(|c| &c.pred_logits).collect();
        let masks: Vec<&Tensor> = chunks.iter().map(|c| &c.pred_masks).collect();
        let embds: Vec<&Tensor> = chunks.iter().map(|c| &c.pred_embds).collect();
        Ok(Self {
            pred_logits: Tensor::cat(&logits, 2)?.detach(),
            pred_masks: Tensor::cat(&masks, 2)?.detach(),
            pred_embds: Tensor::cat(&embds, 2)?.detach(),
        })
    }
}

impl From<TrackerOutput> for WindowChunk {
    fn from(out: TrackerOutput) -> Self {
        Self {
            pred_logits: out.pred_logits,
            pred_masks: out.pred_masks,
            pred_embds: out.pred_embds,
        }
    }
}

/// Video instance segmenter: a per-frame feature provider followed by the query tracker.
pub struct VideoMaskFormer {
    provider: Box<dyn FrameFeatureProvider>,
    tracker: QueryTracker,
    config: VideoMaskFormerConfig,
    device: Device,
}

impl VideoMaskFormer {
    pub fn new(
        provider: Box<dyn FrameFeatureProvider>,
        tracker: QueryTracker,
        config: VideoMaskFormerConfig,
        device: Device,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            provider,
            tracker,
            config,
            device,
        })
    }

    /// Builds the tracker from a safetensors checkpoint.
    pub fn load<P: AsRef<Path>>(
        provider: Box<dyn FrameFeatureProvider>,
        checkpoint_path: P,
        config: VideoMaskFormerConfig,
        device: Device,
    ) -> Result<Self> {
        config.validate()?;
        let tracker = QueryTracker::from_safetensors(checkpoint_path, config.tracker.clone(), &device)?;
        let mut config = config;
        config.tracker = tracker.config().clone();
        Self::new(provider, tracker, config, device)
    }

    pub fn config(&self) -> &VideoMaskFormerConfig {
        &self.config
    }

    pub fn tracker(&self) -> &QueryTracker {
        &self.tracker
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Normalizes and pads every frame of every clip into one batch.
    pub fn preprocess(&self, inputs: &[VideoInput]) -> Result<ImageList> {
        let mut frames = Vec::new();
        for video in inputs {
            for frame in &video.frames {
                let frame = frame.to_device(&self.device)?;
                frames.push(normalize_frame(
                    &frame,
                    &self.config.pixel_mean,
                    &self.config.pixel_std,
                )?);
            }
        }
        Ok(ImageList::from_tensors(
            &frames,
            self.config.size_divisibility,
        )?)
    }

    pub fn forward(&self, inputs: &[VideoInput], mode: Mode) -> Result<VideoOutput> {
        if inputs.is_empty() {
            return Err(VisError::Config("no input video".into()));
        }
        let images = self.preprocess(inputs)?;

        match mode {
            Mode::Training => {
                let outputs = self.run_full(&images.tensor, inputs.len(), Mode::Training)?;
                let annotations = inputs
                    .iter()
                    .map(|v| {
                        v.instances
                            .clone()
                            .ok_or_else(|| VisError::Config("training input without instances".into()))
                    })
                    .collect::<Result<Vec<_>>>()?;
                let targets = prepare_targets(
                    &annotations,
                    images.padded_size(),
                    self.config.num_frames,
                    &self.device,
                )?;
                Ok(VideoOutput::Training(TrainingOutput { outputs, targets }))
            }
            Mode::Inference => {
                if inputs.len() != 1 {
                    return Err(VisError::Config(format!(
                        "video inference takes one clip at a time, got {}",
                        inputs.len()
                    )));
                }
                let chunk = if self.config.window_inference {
                    self.run_window_inference(&images.tensor, self.config.window_size)?
                } else {
                    self.run_full(&images.tensor, 1, Mode::Inference)?.into()
                };
                let prediction = self.postprocess(&chunk, &images, &inputs[0])?;
                Ok(VideoOutput::Inference(prediction))
            }
        }
    }

    /// Whole clip in one provider call; features are treated as frozen.
    fn run_full(&self, images: &Tensor, num_videos: usize, mode: Mode) -> Result<TrackerOutput> {
        let features = self.provider.extract(images, num_videos)?;
        let frame_embeds = features.frame_embeds.detach();
        let mask_features = features.mask_features.detach();
        drop(features);
        Ok(self
            .tracker
            .forward_with_mode(&frame_embeds, &mask_features, None, mode)?)
    }

    /// Runs provider and tracker over consecutive windows of `window_size` frames.
    ///
    /// Each window after the first is seeded with the previous window's last frame query
    /// state, so the result covers the whole clip with bounded feature memory.
    pub fn run_window_inference(&self, images: &Tensor, window_size: usize) -> Result<WindowChunk> {
        if window_size == 0 {
            return Err(VisError::InvalidWindow);
        }
        let n_frames = images.dim(0)?;
        if n_frames == 0 {
            return Err(VisError::Config("cannot run inference on an empty clip".into()));
        }

        let iters = n_frames.div_ceil(window_size);
        let mut chunks: Vec<WindowChunk> = Vec::with_capacity(iters);
        for i in 0..iters {
            let start = i * window_size;
            let len = window_size.min(n_frames - start);
            tracing::debug!(window = i, start, len, "window inference");

            let features = self.provider.extract(&images.narrow(0, start, len)?, 1)?;
            let seed = chunks.last().map(|c| c.last_frame_query()).transpose()?;
            let out = self.tracker.forward_with_mode(
                &features.frame_embeds,
                &features.mask_features,
                seed.as_ref(),
                Mode::Inference,
            )?;
            drop(features);
            chunks.push(out.into());
        }

        Ok(WindowChunk::cat(&chunks)?)
    }

    fn postprocess(
        &self,
        chunk: &WindowChunk,
        images: &ImageList,
        input: &VideoInput,
    ) -> Result<VideoPrediction> {
        let tracks = associate_tracks(
            &chunk.pred_logits,
            &chunk.pred_masks,
            &chunk.pred_embds,
            &self.config.matcher,
        )?;
        let mask_cls = tracks.pred_logits.get(0)?;
        let mask_pred = tracks.pred_masks.get(0)?;

        let image_size = images.image_sizes[0];
        let sizes = ResizeSpec {
            padded_size: images.padded_size(),
            image_size,
            output_size: (
                input.height.unwrap_or(image_size.0),
                input.width.unwrap_or(image_size.1),
            ),
        };
        let topk = self.config.test_topk_per_video;
        retry_if_oom(&self.device, |device| {
            inference_video(
                &mask_cls.to_device(device)?,
                &mask_pred.to_device(device)?,
                sizes,
                topk,
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueryTrackerConfig;
    use candle_core::DType;
    use candle_nn::{VarBuilder, VarMap};

    /// Features depend only on each frame's mean value.
    struct MeanProvider {
        query_base: Tensor,
        mask_base: Tensor,
    }

    impl MeanProvider {
        fn new(queries: usize, channels: usize) -> candle_core::Result<Self> {
            let dev = Device::Cpu;
            Ok(Self {
                query_base: Tensor::randn(0f32, 1.0, (queries, channels), &dev)?,
                mask_base: Tensor::randn(0f32, 1.0, (channels, 4, 4), &dev)?,
            })
        }
    }

    impl FrameFeatureProvider for MeanProvider {
        fn extract(&self, images: &Tensor, num_videos: usize) -> candle_core::Result<FrameFeatures> {
            let total = images.dim(0)?;
            let t = total / num_videos;
            let s = images.flatten_from(1)?.mean(1)?; // (b t)
            let (q, c) = self.query_base.dims2()?;
            let frame_embeds = self
                .query_base
                .unsqueeze(0)?
                .broadcast_mul(&s.reshape((total, 1, 1))?)?
                .reshape((num_videos, t, q, c))?
                .permute((0, 3, 1, 2))?
                .contiguous()?;
            let (_, h, w) = self.mask_base.dims3()?;
            let mask_features = self
                .mask_base
                .unsqueeze(0)?
                .broadcast_add(&s.reshape((total, 1, 1, 1))?)?
                .reshape(vec![num_videos, t, c, h, w])?;
            Ok(FrameFeatures {
                frame_embeds,
                mask_features,
            })
        }
    }

    fn tiny_model(window: usize) -> Result<VideoMaskFormer> {
        let tracker_config = QueryTrackerConfig {
            num_object_query: 3,
            hidden_channel: 8,
            feedforward_channel: 16,
            num_head: 2,
            decoder_layer_num: 2,
            mask_dim: 8,
            class_num: 2,
            detach_frame_connection: true,
            frame_pos_table_size: 3,
        };
        let config = VideoMaskFormerConfig {
            window_inference: true,
            window_size: window,
            num_frames: 3,
            tracker: tracker_config.clone(),
            ..Default::default()
        };
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let tracker = QueryTracker::new(tracker_config, vb)?;
        let provider = MeanProvider::new(3, 8)?;
        VideoMaskFormer::new(Box::new(provider), tracker, config, Device::Cpu)
    }

    fn clip(n: usize) -> candle_core::Result<Vec<Tensor>> {
        (0..n)
            .map(|i| Tensor::full(40f32 * i as f32, (3, 20, 24), &Device::Cpu))
            .collect()
    }

    #[test]
    fn test_window_zero_rejected() -> Result<()> {
        let model = tiny_model(2)?;
        let images = model.preprocess(&[VideoInput::new(clip(2)?)])?;
        assert!(matches!(
            model.run_window_inference(&images.tensor, 0),
            Err(VisError::InvalidWindow)
        ));
        Ok(())
    }

    #[test]
    fn test_window_chunks_cover_clip() -> Result<()> {
        let model = tiny_model(2)?;
        let images = model.preprocess(&[VideoInput::new(clip(5)?)])?;
        for window in 1..=6 {
            let chunk = model.run_window_inference(&images.tensor, window)?;
            assert_eq!(chunk.num_frames()?, 5);
            assert_eq!(chunk.pred_logits.dims(), &[1, 3, 5, 3]);
            assert_eq!(chunk.pred_masks.dims(), &[1, 3, 5, 4, 4]);
            assert_eq!(chunk.pred_embds.dims(), &[1, 8, 5, 3]);
        }
        Ok(())
    }

    #[test]
    fn test_inference_output() -> Result<()> {
        let model = tiny_model(2)?;
        let input = VideoInput::new(clip(3)?).with_output_size(10, 12);
        let out = model.forward(&[input], Mode::Inference)?;
        let VideoOutput::Inference(pred) = out else {
            panic!("expected inference output")
        };
        // 3 queries x 2 classes
        assert_eq!(pred.len(), 6);
        assert_eq!(pred.image_size, (10, 12));
        assert!(pred.pred_scores.windows(2).all(|w| w[0] >= w[1]));
        assert!(pred.pred_labels.iter().all(|&l| l < 2));
        for mask in &pred.pred_masks {
            assert_eq!(mask.dims(), &[3, 10, 12]);
            assert_eq!(mask.dtype(), DType::U8);
        }
        Ok(())
    }

    #[test]
    fn test_inference_rejects_batches() -> Result<()> {
        let model = tiny_model(2)?;
        let inputs = [VideoInput::new(clip(2)?), VideoInput::new(clip(2)?)];
        assert!(model.forward(&inputs, Mode::Inference).is_err());
        Ok(())
    }

    #[test]
    fn test_training_requires_instances() -> Result<()> {
        let model = tiny_model(2)?;
        let inputs = [VideoInput::new(clip(3)?)];
        assert!(matches!(
            model.forward(&inputs, Mode::Training),
            Err(VisError::Config(_))
        ));
        Ok(())
    }
}
