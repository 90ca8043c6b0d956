//! Batched beam search over an encoder/decoder model.
//!
//! Every example starts from a single root beam holding the start token. The
//! first step expands it to `beam_size` beams, later steps keep `beam_size`
//! continuations per example out of its `beam_size * vocab_size` candidates.
//! An example stops as soon as its best beam finishes, its beams being removed
//! from the batch so that later steps only run the examples still alive.
use candle::Tensor;

use crate::beam::{ActiveBatch, DecodedExample, StepRules};
use crate::config::BeamSearchConfig;
use crate::error::{Error, Result};
use crate::model::{
    last_tokens, BatchedTensor, Decoder, Encoder, EncoderOutput, Generator, Reorderable,
};
use crate::scorer::{mask_token, GlobalScorer};
use crate::trace::BeamTrace;

#[derive(Debug, Clone)]
pub struct BeamSearch {
    config: BeamSearchConfig,
    scorer: GlobalScorer,
}

/// Everything that has one row per live beam and lives outside the beam manager.
struct BeamMemory<S> {
    features: BatchedTensor,
    mask: BatchedTensor,
    state: S,
}

impl<S: Reorderable> Reorderable for BeamMemory<S> {
    fn tile(&mut self, n: usize) -> Result<()> {
        self.features.tile(n)?;
        self.mask.tile(n)?;
        self.state.tile(n)
    }

    fn select(&mut self, indices: &[u32]) -> Result<()> {
        self.features.select(indices)?;
        self.mask.select(indices)?;
        self.state.select(indices)
    }
}

impl BeamSearch {
    pub fn new(config: BeamSearchConfig) -> Result<Self> {
        config.validate()?;
        let scorer = config.scorer();
        Ok(Self { config, scorer })
    }

    pub fn config(&self) -> &BeamSearchConfig {
        &self.config
    }

    pub fn scorer(&self) -> &GlobalScorer {
        &self.scorer
    }

    /// Decodes a batch of sources, returning one entry per example in batch order.
    ///
    /// `src` is batch major: `(batch, src_len)`, or `(batch, n_paragraphs,
    /// paragraph_len)` for hierarchical sources.
    pub fn decode<M>(&self, model: &mut M, src: &Tensor) -> Result<Vec<DecodedExample>>
    where
        M: Encoder + Decoder + Generator,
    {
        let (decoded, _) = self.run(model, src, None)?;
        Ok(decoded)
    }

    /// Same as [`BeamSearch::decode`], also returning the per step selections
    /// when [`BeamSearchConfig::trace`] is set.
    pub fn decode_with_trace<M>(
        &self,
        model: &mut M,
        src: &Tensor,
    ) -> Result<(Vec<DecodedExample>, Option<BeamTrace>)>
    where
        M: Encoder + Decoder + Generator,
    {
        let trace = self.config.trace.then(BeamTrace::default);
        self.run(model, src, trace)
    }

    fn run<M>(
        &self,
        model: &mut M,
        src: &Tensor,
        mut trace: Option<BeamTrace>,
    ) -> Result<(Vec<DecodedExample>, Option<BeamTrace>)>
    where
        M: Encoder + Decoder + Generator,
    {
        let cfg = &self.config;
        let batch_size = src.dim(0)?;
        let span = tracing::span!(tracing::Level::TRACE, "beam-search", batch_size);
        let _enter = span.enter();
        if batch_size == 0 {
            return Ok((vec![], trace));
        }

        let EncoderOutput { features, mask } = model.encode(src)?;
        let state = model.init_state(src, &features, true)?;
        let mut memory = BeamMemory {
            features: BatchedTensor::new(features, model.features_dim())?,
            mask: BatchedTensor::new(mask, 0)?,
            state,
        };
        for rows in [memory.features.batch_size()?, memory.mask.batch_size()?] {
            if rows != batch_size {
                return Err(Error::shape("encode", &[batch_size], &[rows]));
            }
        }
        let device = src.device().clone();

        let mut active = ActiveBatch::new(batch_size, cfg.start_token);
        let mut results: Vec<Option<DecodedExample>> = vec![None; batch_size];
        for step in 0..cfg.max_length {
            let step_span = tracing::span!(
                tracing::Level::TRACE,
                "step",
                step,
                active = active.n_groups()
            );
            let _enter = step_span.enter();

            let n_beams = active.n_beams();
            memory.state.check_rows(n_beams)?;
            let tokens = last_tokens(active.last_tokens(), &device)?;
            let mask = cfg.hierarchical.then(|| memory.mask.tensor());
            let dec_out = model.step(
                &tokens,
                memory.features.tensor(),
                mask,
                &mut memory.state,
                step,
            )?;
            let log_probs = Generator::forward(model, &dec_out)?;
            let dims = log_probs.dims().to_vec();
            let log_probs = match dims.as_slice() {
                [n, 1, _] if *n == n_beams => log_probs.squeeze(1)?,
                [n, _] if *n == n_beams => log_probs,
                _ => return Err(Error::shape("generator", &[n_beams], &dims)),
            };
            let log_probs = if step < cfg.min_length {
                mask_token(&log_probs, cfg.end_token)?
            } else {
                log_probs
            };

            let picked = self.scorer.score_and_select(
                &log_probs,
                &active.cumulative(),
                step,
                &active.group_sizes(),
                cfg.beam_size,
            )?;
            if let Some(trace) = trace.as_mut() {
                trace.record(step, active.batch_indices(), &picked);
            }
            // After the first step every example holds the same number of beams.
            let expanded = picked.first().map_or(0, |p| p.len());
            let rules = StepRules {
                end_token: cfg.end_token,
                last_step: step + 1 == cfg.max_length,
                n_best: cfg.n_best,
            };
            let n_groups = active.n_groups();
            let outcome = active.advance(picked, step, rules);
            for done in outcome.finished {
                tracing::debug!(
                    batch_index = done.batch_index,
                    steps = done.steps,
                    forced = done.forced,
                    hypotheses = done.hypotheses.len(),
                    "example finished"
                );
                let batch_index = done.batch_index;
                results[batch_index] = Some(done);
            }
            if active.is_empty() {
                break;
            }

            if step == 0 {
                // Every root beam is its own parent, so the expansion is a plain tile.
                memory.tile(expanded)?;
                if outcome.survivors.len() < n_groups {
                    let rows: Vec<u32> = outcome
                        .survivors
                        .iter()
                        .flat_map(|&g| (g * expanded) as u32..((g + 1) * expanded) as u32)
                        .collect();
                    memory.select(&rows)?;
                }
            } else {
                memory.select(&outcome.parents)?;
            }
        }

        let decoded = results
            .into_iter()
            .enumerate()
            .map(|(batch_index, r)| {
                r.unwrap_or(DecodedExample {
                    batch_index,
                    ..Default::default()
                })
            })
            .collect();
        Ok((decoded, trace))
    }
}
