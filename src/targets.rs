//! Ground-truth preparation for clip-level training.
//!
//! Per-frame annotations are aligned by instance slot: slot `k` refers to the same object
//! in every frame, and its id is `-1` in frames where the object is not visible.

use candle_core::{DType, Device, Result, Tensor};

/// Annotations of a single frame.
#[derive(Debug, Clone)]
pub struct FrameInstances {
    /// Unpadded (height, width) of the frame.
    pub image_size: (usize, usize),
    /// Track id per instance slot, `-1` when absent from this frame.
    pub gt_ids: Vec<i64>,
    pub gt_classes: Vec<u32>,
    /// (instances, height, width), any numeric dtype.
    pub gt_masks: Tensor,
}

impl FrameInstances {
    pub fn len(&self) -> usize {
        self.gt_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gt_ids.is_empty()
    }
}

/// Padded per-instance targets for one clip.
#[derive(Debug, Clone)]
pub struct VideoTargets {
    /// (instances,) u32
    pub labels: Tensor,
    /// (instances, frames) i64, `-1` where absent
    pub ids: Tensor,
    /// (instances, frames, padded_h, padded_w) f32
    pub masks: Tensor,
}

impl VideoTargets {
    pub fn num_instances(&self) -> Result<usize> {
        self.labels.dim(0)
    }
}

fn prepare_video(
    frames: &[FrameInstances],
    padded_size: (usize, usize),
    num_frames: usize,
    device: &Device,
) -> Result<VideoTargets> {
    let (h_pad, w_pad) = padded_size;
    if frames.len() > num_frames {
        candle_core::bail!(
            "clip has {} annotated frames, expected at most {num_frames}",
            frames.len()
        )
    }
    let num_instances = frames.first().map(|f| f.len()).unwrap_or(0);
    if let Some(bad) = frames.iter().find(|f| f.len() != num_instances) {
        candle_core::bail!(
            "instance slots differ across frames: {} != {num_instances}",
            bad.len()
        )
    }

    // (instances, frames) ids, missing trailing frames count as absent
    let mut ids = vec![-1i64; num_instances * num_frames];
    for (f_i, frame) in frames.iter().enumerate() {
        for (k, &id) in frame.gt_ids.iter().enumerate() {
            ids[k * num_frames + f_i] = id;
        }
    }
    let valid: Vec<usize> = (0..num_instances)
        .filter(|&k| ids[k * num_frames..(k + 1) * num_frames].iter().any(|&id| id != -1))
        .collect();

    if valid.is_empty() {
        return Ok(VideoTargets {
            labels: Tensor::from_vec(Vec::<u32>::new(), 0, device)?,
            ids: Tensor::from_vec(Vec::<i64>::new(), (0, num_frames), device)?,
            masks: Tensor::zeros((0, num_frames, h_pad, w_pad), DType::F32, device)?,
        });
    }

    // classes follow the last annotated frame
    let labels: Vec<u32> = match frames.last() {
        Some(last) => valid.iter().map(|&k| last.gt_classes[k]).collect(),
        None => Vec::new(),
    };
    let valid_ids: Vec<i64> = valid
        .iter()
        .flat_map(|&k| ids[k * num_frames..(k + 1) * num_frames].iter().copied())
        .collect();

    let mut per_frame = Vec::with_capacity(num_frames);
    for f_i in 0..num_frames {
        let masks = match frames.get(f_i) {
            Some(frame) => {
                let (h, w) = frame.image_size;
                let masks = frame
                    .gt_masks
                    .to_device(device)?
                    .to_dtype(DType::F32)?
                    .narrow(1, 0, h.min(h_pad))?
                    .narrow(2, 0, w.min(w_pad))?;
                let (_, h, w) = masks.dims3()?;
                masks
                    .pad_with_zeros(1, 0, h_pad - h)?
                    .pad_with_zeros(2, 0, w_pad - w)?
            }
            None => Tensor::zeros((num_instances, h_pad, w_pad), DType::F32, device)?,
        };
        per_frame.push(masks);
    }
    let masks = Tensor::stack(&per_frame, 1)?;
    let keep: Vec<u32> = valid.iter().map(|&k| k as u32).collect();
    let keep = Tensor::new(keep.as_slice(), device)?;
    let masks = masks.index_select(&keep, 0)?;

    let n = valid.len();
    Ok(VideoTargets {
        labels: Tensor::from_vec(labels, n, device)?,
        ids: Tensor::from_vec(valid_ids, (n, num_frames), device)?,
        masks,
    })
}

/// Builds padded training targets for every clip in a batch.
///
/// Instances whose id is `-1` in every frame are dropped.
pub fn prepare_targets(
    videos: &[Vec<FrameInstances>],
    padded_size: (usize, usize),
    num_frames: usize,
    device: &Device,
) -> Result<Vec<VideoTargets>> {
    videos
        .iter()
        .map(|frames| prepare_video(frames, padded_size, num_frames, device))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(ids: Vec<i64>, classes: Vec<u32>, size: (usize, usize)) -> Result<FrameInstances> {
        let n = ids.len();
        Ok(FrameInstances {
            image_size: size,
            gt_ids: ids,
            gt_classes: classes,
            gt_masks: Tensor::ones((n, size.0, size.1), DType::U8, &Device::Cpu)?,
        })
    }

    #[test]
    fn test_drops_instances_absent_everywhere() -> Result<()> {
        let frames = vec![
            frame(vec![3, -1, -1], vec![1, 2, 0], (4, 5))?,
            frame(vec![3, -1, 7], vec![1, 2, 4], (4, 5))?,
        ];
        let targets = prepare_targets(&[frames], (8, 8), 2, &Device::Cpu)?;
        assert_eq!(targets.len(), 1);
        let t = &targets[0];
        assert_eq!(t.num_instances()?, 2);
        assert_eq!(t.labels.to_vec1::<u32>()?, vec![1, 4]);
        assert_eq!(t.ids.to_vec2::<i64>()?, vec![vec![3, 3], vec![-1, 7]]);
        assert_eq!(t.masks.dims(), &[2, 2, 8, 8]);
        assert_eq!(t.masks.dtype(), DType::F32);
        Ok(())
    }

    #[test]
    fn test_masks_padded_with_zeros() -> Result<()> {
        let frames = vec![frame(vec![0], vec![2], (3, 2))?];
        let targets = prepare_targets(&[frames], (4, 4), 1, &Device::Cpu)?;
        let masks = targets[0].masks.get(0)?.get(0)?.to_vec2::<f32>()?;
        assert_eq!(masks[0], vec![1.0, 1.0, 0.0, 0.0]);
        assert_eq!(masks[2], vec![1.0, 1.0, 0.0, 0.0]);
        assert_eq!(masks[3], vec![0.0; 4]);
        Ok(())
    }

    #[test]
    fn test_all_absent_gives_empty_targets() -> Result<()> {
        let frames = vec![frame(vec![-1, -1], vec![0, 1], (2, 2))?];
        let targets = prepare_targets(&[frames], (4, 4), 1, &Device::Cpu)?;
        assert_eq!(targets[0].num_instances()?, 0);
        assert_eq!(targets[0].masks.dims(), &[0, 1, 4, 4]);
        assert_eq!(targets[0].ids.dims(), &[0, 1]);
        Ok(())
    }

    #[test]
    fn test_mismatched_slots_rejected() -> Result<()> {
        let frames = vec![
            frame(vec![0, 1], vec![0, 1], (2, 2))?,
            frame(vec![0], vec![0], (2, 2))?,
        ];
        assert!(prepare_targets(&[frames], (2, 2), 2, &Device::Cpu).is_err());
        Ok(())
    }
}
