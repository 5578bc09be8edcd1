use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, VisError};

/// Hyper-parameters of the query tracker decoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryTrackerConfig {
    pub num_object_query: usize,
    pub hidden_channel: usize,
    pub feedforward_channel: usize,
    pub num_head: usize,
    pub decoder_layer_num: usize,
    pub mask_dim: usize,
    pub class_num: usize,
    /// Cut the gradient path between consecutive frames.
    pub detach_frame_connection: bool,
    /// Rows in the frame positional embedding table.
    pub frame_pos_table_size: usize,
}

impl Default for QueryTrackerConfig {
    fn default() -> Self {
        Self {
            num_object_query: 100,
            hidden_channel: 256,
            feedforward_channel: 2048,
            num_head: 8,
            decoder_layer_num: 6,
            mask_dim: 256,
            class_num: 25,
            detach_frame_connection: true,
            frame_pos_table_size: 100,
        }
    }
}

impl QueryTrackerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_head == 0 || self.hidden_channel % self.num_head != 0 {
            return Err(VisError::Config(format!(
                "hidden_channel {} not divisible by num_head {}",
                self.hidden_channel, self.num_head
            )));
        }
        if self.decoder_layer_num == 0 {
            return Err(VisError::Config("decoder_layer_num must be >= 1".into()));
        }
        if self.frame_pos_table_size < self.num_object_query {
            return Err(VisError::Config(format!(
                "frame_pos_table_size {} smaller than num_object_query {}",
                self.frame_pos_table_size, self.num_object_query
            )));
        }
        Ok(())
    }
}

/// Cross-frame matcher settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    /// Blending weights for the reference frames, oldest first.
    pub history_weights: Vec<f32>,
    /// Scale each reference cost by that frame's per-query confidence.
    pub use_scores: bool,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            history_weights: vec![0.1, 0.3, 0.6],
            use_scores: false,
        }
    }
}

impl MatcherConfig {
    pub fn history_len(&self) -> usize {
        self.history_weights.len()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoMaskFormerConfig {
    /// Frames are zero-padded so both sides divide this value.
    pub size_divisibility: usize,
    pub pixel_mean: [f32; 3],
    pub pixel_std: [f32; 3],
    /// Frames per clip during training.
    pub num_frames: usize,
    pub window_inference: bool,
    pub window_size: usize,
    pub test_topk_per_video: usize,
    pub tracker: QueryTrackerConfig,
    pub matcher: MatcherConfig,
}

impl Default for VideoMaskFormerConfig {
    fn default() -> Self {
        Self {
            size_divisibility: 32,
            pixel_mean: crate::PIXEL_MEAN,
            pixel_std: crate::PIXEL_STD,
            num_frames: 2,
            window_inference: false,
            window_size: 3,
            test_topk_per_video: 20,
            tracker: QueryTrackerConfig::default(),
            matcher: MatcherConfig::default(),
        }
    }
}

impl VideoMaskFormerConfig {
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let raw = serde_json::to_string_pretty(self)?;
        std::fs::write(path, raw)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.window_size == 0 {
            return Err(VisError::InvalidWindow);
        }
        if self.matcher.history_weights.is_empty() {
            return Err(VisError::Config("matcher needs at least one history weight".into()));
        }
        if self.pixel_std.iter().any(|s| *s == 0.0) {
            return Err(VisError::Config("pixel_std must be non-zero".into()));
        }
        self.tracker.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_reference_wiring() {
        let config = VideoMaskFormerConfig::default();
        assert_eq!(config.tracker.num_object_query, 100);
        assert_eq!(config.tracker.decoder_layer_num, 6);
        assert_eq!(config.window_size, 3);
        assert_eq!(config.matcher.history_weights, vec![0.1, 0.3, 0.6]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: VideoMaskFormerConfig =
            serde_json::from_str(r#"{"window_size": 5, "tracker": {"class_num": 40}}"#).unwrap();
        assert_eq!(config.window_size, 5);
        assert_eq!(config.tracker.class_num, 40);
        assert_eq!(config.tracker.hidden_channel, 256);
    }

    #[test]
    fn test_json_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vis.json");
        let mut config = VideoMaskFormerConfig::default();
        config.window_inference = true;
        config.to_json_file(&path).unwrap();
        let loaded = VideoMaskFormerConfig::from_json_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_zero_window_rejected() {
        let mut config = VideoMaskFormerConfig::default();
        config.window_size = 0;
        assert!(matches!(config.validate(), Err(VisError::InvalidWindow)));
    }

    #[test]
    fn test_heads_must_divide_channels() {
        let mut config = QueryTrackerConfig::default();
        config.num_head = 7;
        assert!(config.validate().is_err());
    }
}
