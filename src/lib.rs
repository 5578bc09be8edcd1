pub mod config;
pub mod error;
pub mod frame_loader;
pub mod matching;
pub mod modeling;
pub mod postprocess;
pub mod targets;
pub mod video_predictor;

pub use config::{MatcherConfig, QueryTrackerConfig, VideoMaskFormerConfig};
pub use error::{Result, VisError};
pub use modeling::query_tracker::{Mode, QueryTracker, TrackerOutput};
pub use postprocess::VideoPrediction;
pub use video_predictor::{
    FrameFeatureProvider, FrameFeatures, VideoInput, VideoMaskFormer, VideoOutput,
};

/// Per-channel pixel statistics on the 0-255 scale.
pub const PIXEL_MEAN: [f32; 3] = [123.675, 116.28, 103.53];
pub const PIXEL_STD: [f32; 3] = [58.395, 57.12, 57.375];
