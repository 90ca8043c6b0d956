//! Candidate scoring and top-k selection.
//!
//! Joint scores are computed on tensors for the whole flattened set of live
//! beams, the per batch element selection then runs on the host.
use candle::{DType, Tensor};

use crate::error::{Error, Result};

/// Value written in place of the log-probability of tokens that must not be
/// picked. Large enough to lose against any real candidate, small enough to
/// stay finite once cumulative scores are added.
pub const MASKED_LOG_PROB: f32 = -1e20;

/// Length normalization applied to the joint log-probability of a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LengthPenalty {
    /// GNMT penalty `((5 + len) / 6) ^ alpha`, see https://arxiv.org/abs/1609.08144
    #[default]
    Wu,
    /// Raw log-probabilities.
    None,
}

/// A continuation picked for one batch element.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Selection {
    /// Length normalized score, used for ranking and reported on hypotheses.
    pub score: f32,
    /// Cumulative log-probability carried to the next step.
    pub log_prob: f32,
    /// Parent beam, relative to the start of its batch element's group.
    pub beam: usize,
    pub token: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GlobalScorer {
    alpha: f64,
    length_penalty: LengthPenalty,
}

impl GlobalScorer {
    pub fn new(alpha: f64, length_penalty: LengthPenalty) -> Self {
        Self {
            alpha,
            length_penalty,
        }
    }

    /// The divisor applied at `step`, the sequence produced by that step having
    /// `step + 1` tokens.
    pub fn penalty(&self, step: usize) -> f64 {
        match self.length_penalty {
            LengthPenalty::None => 1.0,
            LengthPenalty::Wu => ((5.0 + (step + 1) as f64) / 6.0).powf(self.alpha),
        }
    }

    /// Picks the best `k` continuations of every batch element.
    ///
    /// `log_probs` has shape `(n_beams, vocab_size)` and holds one row per live
    /// beam, with beams of the same batch element in consecutive rows.
    /// `group_sizes` gives the number of rows of each batch element and must
    /// sum to `n_beams`. The returned selections are ordered by decreasing
    /// score; equal scores keep the order of their flat candidate index.
    pub fn score_and_select(
        &self,
        log_probs: &Tensor,
        cumulative: &[f32],
        step: usize,
        group_sizes: &[usize],
        k: usize,
    ) -> Result<Vec<Vec<Selection>>> {
        let (n_beams, vocab_size) = log_probs.dims2()?;
        let total: usize = group_sizes.iter().sum();
        if cumulative.len() != n_beams || total != n_beams {
            return Err(Error::shape(
                "score-and-select",
                &[n_beams, n_beams],
                &[total, cumulative.len()],
            ));
        }
        let penalty = self.penalty(step);
        let cumulative = Tensor::from_slice(cumulative, (n_beams, 1), log_probs.device())?;
        let joint = log_probs.to_dtype(DType::F32)?.broadcast_add(&cumulative)?;
        let curr_scores = (joint / penalty)?;
        let curr_scores = curr_scores.flatten_all()?.to_vec1::<f32>()?;

        let mut selections = Vec::with_capacity(group_sizes.len());
        let mut offset = 0;
        for &size in group_sizes {
            let candidates = &curr_scores[offset * vocab_size..(offset + size) * vocab_size];
            let picked = top_k(candidates, k)
                .into_iter()
                .map(|flat| {
                    let score = candidates[flat];
                    Selection {
                        score,
                        log_prob: (score as f64 * penalty) as f32,
                        beam: flat / vocab_size,
                        token: (flat % vocab_size) as u32,
                    }
                })
                .collect();
            selections.push(picked);
            offset += size;
        }
        Ok(selections)
    }
}

/// Replaces the column of `token` with [`MASKED_LOG_PROB`].
pub fn mask_token(log_probs: &Tensor, token: u32) -> Result<Tensor> {
    let (n_beams, vocab_size) = log_probs.dims2()?;
    let token = token as usize;
    if token >= vocab_size {
        return Err(Error::shape("mask-token", &[token + 1], &[vocab_size]));
    }
    let keep: Vec<u8> = (0..vocab_size).map(|i| u8::from(i != token)).collect();
    let keep = Tensor::from_vec(keep, (1, vocab_size), log_probs.device())?
        .broadcast_as((n_beams, vocab_size))?;
    let masked = Tensor::full(MASKED_LOG_PROB, (n_beams, vocab_size), log_probs.device())?
        .to_dtype(log_probs.dtype())?;
    Ok(keep.where_cond(log_probs, &masked)?)
}

/// Indexes of the `k` largest values, largest first.
fn top_k(scores: &[f32], k: usize) -> Vec<usize> {
    let k = k.min(scores.len());
    if k == 0 {
        return vec![];
    }
    let cmp = |&a: &usize, &b: &usize| scores[b].total_cmp(&scores[a]).then(a.cmp(&b));
    let mut ids: Vec<usize> = (0..scores.len()).collect();
    if k < ids.len() {
        ids.select_nth_unstable_by(k - 1, cmp);
        ids.truncate(k);
    }
    ids.sort_unstable_by(cmp);
    ids
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle::Device;

    #[test]
    fn wu_penalty() {
        let scorer = GlobalScorer::new(1.0, LengthPenalty::Wu);
        assert_eq!(scorer.penalty(0), 1.0);
        assert_eq!(scorer.penalty(1), 7.0 / 6.0);
        let scorer = GlobalScorer::new(0.0, LengthPenalty::Wu);
        assert!((0..50).all(|step| scorer.penalty(step) == 1.0));
        let scorer = GlobalScorer::new(2.0, LengthPenalty::None);
        assert_eq!(scorer.penalty(10), 1.0);
    }

    #[test]
    fn top_k_is_exact() {
        let scores = [0.1, 0.9, -3.0, 0.9, 0.5];
        assert_eq!(top_k(&scores, 3), [1, 3, 4]);
        assert_eq!(top_k(&scores, 10), [1, 3, 4, 0, 2]);
        assert!(top_k(&scores, 0).is_empty());
    }

    #[test]
    fn select_per_group() -> Result<()> {
        let scorer = GlobalScorer::new(1.0, LengthPenalty::Wu);
        let log_probs = Tensor::new(
            &[[-1f32, -2., -3.], [-0.5, -4., -1.], [-2., -0.1, -9.]],
            &Device::Cpu,
        )?;
        // Two beams for the first element, one for the second.
        let picked = scorer.score_and_select(&log_probs, &[0., -1., 0.], 1, &[2, 1], 2)?;
        assert_eq!(picked.len(), 2);
        let tokens: Vec<_> = picked[0].iter().map(|s| (s.beam, s.token)).collect();
        assert_eq!(tokens, [(0, 0), (1, 0)]);
        let lp = 7.0 / 6.0;
        assert!((picked[0][0].score - (-1.0 / lp) as f32).abs() < 1e-6);
        assert!((picked[0][0].log_prob + 1.0).abs() < 1e-6);
        assert!((picked[0][1].log_prob + 1.5).abs() < 1e-6);
        let tokens: Vec<_> = picked[1].iter().map(|s| (s.beam, s.token)).collect();
        assert_eq!(tokens, [(0, 1), (0, 0)]);
        Ok(())
    }

    #[test]
    fn group_sizes_must_cover_the_beams() -> Result<()> {
        let scorer = GlobalScorer::new(0.0, LengthPenalty::Wu);
        let log_probs = Tensor::new(&[[-1f32, -2.], [-0.5, -4.]], &Device::Cpu)?;
        let err = scorer.score_and_select(&log_probs, &[0., 0.], 0, &[1], 1);
        assert!(matches!(
            err,
            Err(Error::ShapeMismatch { ref expected, ref got, .. })
                if expected == &[2, 2] && got == &[1, 2]
        ));
        Ok(())
    }

    #[test]
    fn masked_token_is_never_picked() -> Result<()> {
        let log_probs = Tensor::new(&[[-0.1f32, -5., -0.2]], &Device::Cpu)?;
        let masked = mask_token(&log_probs, 0)?;
        assert_eq!(masked.to_vec2::<f32>()?, [[MASKED_LOG_PROB, -5., -0.2]]);
        let scorer = GlobalScorer::new(0.0, LengthPenalty::Wu);
        let picked = scorer.score_and_select(&masked, &[0.], 0, &[1], 2)?;
        assert_eq!(picked[0][0].token, 2);
        assert_eq!(picked[0][1].token, 1);
        assert!(mask_token(&log_probs, 3).is_err());
        Ok(())
    }
}
