//! Cross-frame association of query slots.
//!
//! Each frame's queries are matched against a short, weighted history of already-aligned
//! frames by cosine distance between their embeddings; the optimal one-to-one assignment
//! reorders the frame so that slot `j` keeps describing the same object over the clip.

use std::collections::VecDeque;

use candle_core::{DType, Device, Tensor, D};
use lapjv::{lapjv, Matrix};

use crate::config::MatcherConfig;
use crate::error::{Result, VisError};

const NORM_EPS: f64 = 1e-12;
const SCORE_EPS: f64 = 1e-6;

fn l2_normalize(x: &Tensor) -> candle_core::Result<Tensor> {
    let norm = (x.sqr()?.sum_keepdim(D::Minus1)?.sqrt()? + NORM_EPS)?;
    x.broadcast_div(&norm)
}

/// Weighted multi-reference cost, shape (reference slot, current slot).
///
/// `ref_embds` are (queries, channels) tensors ordered oldest first and paired with `weights`
/// in the same order; extra entries on either side are ignored.
pub fn embedding_cost(
    ref_embds: &[Tensor],
    cur_embds: &Tensor,
    weights: &[f32],
    scores: Option<&[Tensor]>,
) -> Result<Tensor> {
    let cur = l2_normalize(&cur_embds.to_dtype(DType::F32)?)?;
    let (n_cur, _) = cur.dims2()?;
    let n_ref = ref_embds.first().map(|t| t.dim(0)).transpose()?.unwrap_or(n_cur);

    let mut cost = Tensor::zeros((n_cur, n_ref), DType::F32, cur.device())?;
    for (i, (weight, tgt)) in weights.iter().zip(ref_embds.iter()).enumerate() {
        let tgt = l2_normalize(&tgt.to_dtype(DType::F32)?)?;
        let cos_sim = cur.matmul(&tgt.t()?)?;
        // weight * (1 - cos)
        let mut c = cos_sim.affine(-(*weight as f64), *weight as f64)?;
        if let Some(scores) = scores {
            c = c.broadcast_mul(&scores[i].to_dtype(DType::F32)?.unsqueeze(0)?)?;
        }
        cost = (cost + c)?;
    }

    if let Some(scores) = scores {
        let used = weights.len().min(ref_embds.len()).min(scores.len());
        let score_sum = Tensor::stack(&scores[..used], 0)?
            .to_dtype(DType::F32)?
            .sum(0)?;
        cost = cost.broadcast_div(&(score_sum + SCORE_EPS)?.unsqueeze(0)?)?;
    }

    Ok(cost.t()?.contiguous()?)
}

/// Minimum-cost perfect matching on a square cost matrix; `result[row] = col`.
pub fn linear_sum_assignment(cost: &Tensor) -> Result<Vec<usize>> {
    let (rows, cols) = cost.dims2()?;
    if rows != cols {
        return Err(VisError::Assignment(format!(
            "expected a square cost matrix, got {rows}x{cols}"
        )));
    }
    match rows {
        0 => return Ok(Vec::new()),
        1 => return Ok(vec![0]),
        _ => {}
    }

    let data: Vec<f64> = cost
        .to_device(&Device::Cpu)?
        .to_dtype(DType::F64)?
        .flatten_all()?
        .to_vec1::<f64>()?;
    if data.iter().any(|v| !v.is_finite()) {
        return Err(VisError::Assignment("cost matrix is not finite".into()));
    }
    let matrix = Matrix::from_shape_vec((rows, cols), data)
        .map_err(|e| VisError::Assignment(e.to_string()))?;
    let (row_to_col, _) = lapjv(&matrix).map_err(|e| VisError::Assignment(format!("{e:?}")))?;
    Ok(row_to_col)
}

/// Permutation that aligns `cur_embds` to the reference history: the aligned frame is
/// `cur[perm[0]], cur[perm[1]], ...`.
pub fn match_embeddings(
    ref_embds: &[Tensor],
    cur_embds: &Tensor,
    weights: &[f32],
    scores: Option<&[Tensor]>,
) -> Result<Vec<usize>> {
    let cost = embedding_cost(ref_embds, cur_embds, weights, scores)?;
    linear_sum_assignment(&cost)
}

/// Reorders the first dim of `xs` by `perm`.
pub fn permute_rows(xs: &Tensor, perm: &[usize]) -> Result<Tensor> {
    let idx: Vec<u32> = perm.iter().map(|&i| i as u32).collect();
    let idx = Tensor::new(idx.as_slice(), xs.device())?;
    Ok(xs.index_select(&idx, 0)?)
}

/// Bounded history of aligned per-frame embeddings, fed strictly in temporal order.
pub struct EmbeddingMatcher {
    weights: Vec<f32>,
    use_scores: bool,
    history: VecDeque<Tensor>,
    score_history: VecDeque<Tensor>,
}

impl EmbeddingMatcher {
    pub fn new(config: &MatcherConfig) -> Self {
        Self {
            weights: config.history_weights.clone(),
            use_scores: config.use_scores,
            history: VecDeque::with_capacity(config.history_len()),
            score_history: VecDeque::with_capacity(config.history_len()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.weights.len()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn reset(&mut self) {
        self.history.clear();
        self.score_history.clear();
    }

    /// Seeds the history with the first frame, repeated to fill every slot.
    pub fn anchor(&mut self, embds: &Tensor, scores: Option<&Tensor>) {
        self.reset();
        for _ in 0..self.capacity() {
            self.history.push_back(embds.clone());
            if let Some(s) = scores {
                self.score_history.push_back(s.clone());
            }
        }
    }

    /// Matches the next frame against the history, records its aligned embedding and
    /// returns the permutation that was applied.
    pub fn step(&mut self, embds: &Tensor, scores: Option<&Tensor>) -> Result<Vec<usize>> {
        if self.history.is_empty() {
            let n = embds.dim(0)?;
            self.anchor(embds, scores);
            return Ok((0..n).collect());
        }

        let refs: Vec<Tensor> = self.history.iter().cloned().collect();
        let ref_scores: Vec<Tensor> = self.score_history.iter().cloned().collect();
        let score_refs = (self.use_scores && ref_scores.len() == refs.len())
            .then_some(ref_scores.as_slice());

        let perm = match_embeddings(&refs, embds, &self.weights, score_refs)?;

        self.push(permute_rows(embds, &perm)?, scores.map(|s| permute_rows(s, &perm)).transpose()?);
        Ok(perm)
    }

    fn push(&mut self, embds: Tensor, scores: Option<Tensor>) {
        self.history.push_back(embds);
        while self.history.len() > self.capacity() {
            self.history.pop_front();
        }
        if let Some(s) = scores {
            self.score_history.push_back(s);
            while self.score_history.len() > self.capacity() {
                self.score_history.pop_front();
            }
        }
    }
}

/// Whole-clip predictions after track association.
#[derive(Debug, Clone)]
pub struct TrackAssociation {
    /// Logits averaged over time, (1, queries, classes + 1).
    pub pred_logits: Tensor,
    /// Aligned masks, (1, queries, time, height, width).
    pub pred_masks: Tensor,
    /// Per-frame permutation applied to the raw predictions; frame 0 is the identity.
    pub permutations: Vec<Vec<usize>>,
}

/// Aligns every frame of a single-video clip to a consistent query ordering.
///
/// * `pred_logits` - (1, queries, time, classes + 1)
/// * `pred_masks` - (1, queries, time, height, width)
/// * `pred_embds` - (1, channels, time, queries)
pub fn associate_tracks(
    pred_logits: &Tensor,
    pred_masks: &Tensor,
    pred_embds: &Tensor,
    config: &MatcherConfig,
) -> Result<TrackAssociation> {
    let pred_logits = pred_logits.get(0)?.transpose(0, 1)?.contiguous()?; // t, q, c
    let pred_masks = pred_masks.get(0)?.transpose(0, 1)?.contiguous()?; // t, q, h, w
    let pred_embds = pred_embds.get(0)?.permute((1, 2, 0))?.contiguous()?; // t, q, c

    let n_frames = pred_logits.dim(0)?;
    let pred_scores = if config.use_scores {
        let probs = candle_nn::ops::softmax(&pred_logits, D::Minus1)?;
        let n_cls = probs.dim(D::Minus1)?;
        Some(probs.narrow(D::Minus1, 0, n_cls - 1)?.max(D::Minus1)?)
    } else {
        None
    };

    let mut matcher = EmbeddingMatcher::new(config);
    let mut out_logits = Vec::with_capacity(n_frames);
    let mut out_masks = Vec::with_capacity(n_frames);
    let mut permutations = Vec::with_capacity(n_frames);

    for i in 0..n_frames {
        let logits = pred_logits.get(i)?;
        let masks = pred_masks.get(i)?;
        let embds = pred_embds.get(i)?;
        let scores = pred_scores.as_ref().map(|s| s.get(i)).transpose()?;

        if i == 0 {
            matcher.anchor(&embds, scores.as_ref());
            permutations.push((0..logits.dim(0)?).collect());
            out_logits.push(logits);
            out_masks.push(masks);
            continue;
        }

        let perm = matcher.step(&embds, scores.as_ref())?;
        out_logits.push(permute_rows(&logits, &perm)?);
        out_masks.push(permute_rows(&masks, &perm)?);
        permutations.push(perm);
    }
    tracing::debug!(frames = n_frames, "associated query tracks");

    let mean_logits = (Tensor::stack(&out_logits, 0)?.sum(0)? / n_frames as f64)?;
    let masks = Tensor::stack(&out_masks, 1)?; // q, t, h, w

    Ok(TrackAssociation {
        pred_logits: mean_logits.unsqueeze(0)?,
        pred_masks: masks.unsqueeze(0)?,
        permutations,
    })
}
