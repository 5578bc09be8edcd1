use candle_core::{DType, Device, Tensor, D};

use crate::error::{Result, VisError};
use crate::modeling::interpolation::bilinear_interpolate_tensor;

/// Ranked instance predictions for one video.
#[derive(Debug, Clone)]
pub struct VideoPrediction {
    /// (height, width) of the returned masks.
    pub image_size: (usize, usize),
    pub pred_scores: Vec<f32>,
    pub pred_labels: Vec<usize>,
    /// One `u8` tensor of shape (time, height, width) per prediction, on the CPU.
    pub pred_masks: Vec<Tensor>,
}

impl VideoPrediction {
    pub fn empty(image_size: (usize, usize)) -> Self {
        Self {
            image_size,
            pred_scores: Vec::new(),
            pred_labels: Vec::new(),
            pred_masks: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.pred_scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pred_scores.is_empty()
    }
}

/// Resolutions involved in mapping decoder masks back to the caller's frame size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResizeSpec {
    /// Padded network input size.
    pub padded_size: (usize, usize),
    /// Valid region inside the padded input.
    pub image_size: (usize, usize),
    /// Requested output size.
    pub output_size: (usize, usize),
}

/// Top-k (query, class) selection over time-averaged logits.
///
/// * `pred_cls` - (queries, classes + 1), "no object" last
/// * `pred_masks` - (queries, time, height, width)
pub fn inference_video(
    pred_cls: &Tensor,
    pred_masks: &Tensor,
    sizes: ResizeSpec,
    max_num: usize,
) -> Result<VideoPrediction> {
    let (num_queries, num_logits) = pred_cls.dims2()?;
    if num_queries == 0 || num_logits < 2 || max_num == 0 {
        return Ok(VideoPrediction::empty(sizes.output_size));
    }
    let num_classes = num_logits - 1;

    let scores = candle_nn::ops::softmax(&pred_cls.to_dtype(DType::F32)?, D::Minus1)?
        .narrow(1, 0, num_classes)?
        .flatten_all()?
        .to_vec1::<f32>()?;

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]).then(a.cmp(&b)));
    order.truncate(max_num.min(scores.len()));

    let pred_scores: Vec<f32> = order.iter().map(|&i| scores[i]).collect();
    let pred_labels: Vec<usize> = order.iter().map(|&i| i % num_classes).collect();
    let query_idx: Vec<u32> = order.iter().map(|&i| (i / num_classes) as u32).collect();

    let query_idx = Tensor::new(query_idx.as_slice(), pred_masks.device())?;
    let masks = pred_masks.index_select(&query_idx, 0)?;

    let (pad_h, pad_w) = sizes.padded_size;
    let (img_h, img_w) = sizes.image_size;
    let (out_h, out_w) = sizes.output_size;
    let masks = bilinear_interpolate_tensor(&masks, pad_h, pad_w)?;
    let masks = masks
        .narrow(2, 0, img_h.min(pad_h))?
        .narrow(3, 0, img_w.min(pad_w))?
        .contiguous()?;
    let masks = bilinear_interpolate_tensor(&masks, out_h, out_w)?;
    let masks = masks.gt(0f32)?.to_device(&Device::Cpu)?;

    let pred_masks = (0..order.len())
        .map(|i| masks.get(i))
        .collect::<candle_core::Result<Vec<_>>>()?;

    Ok(VideoPrediction {
        image_size: sizes.output_size,
        pred_scores,
        pred_labels,
        pred_masks,
    })
}

/// Runs `f` on `device`; on memory exhaustion retries once on the CPU.
pub fn retry_if_oom<T, F>(device: &Device, mut f: F) -> Result<T>
where
    F: FnMut(&Device) -> Result<T>,
{
    match f(device) {
        Err(e) if e.is_out_of_memory() => {
            tracing::warn!("out of memory during video inference, retrying on cpu: {e}");
            f(&Device::Cpu)
        }
        other => other,
    }
}
