//! Beam bookkeeping for a batch being decoded.
//!
//! Live beams are stored per batch element in contiguous groups, the groups
//! being kept in the order of the still active elements. Row `r` of any
//! external per-beam structure is the `r`-th beam when walking the groups in
//! order, so every reorder the search performs is expressed as a list of row
//! indexes into that layout.
use crate::scorer::Selection;

/// A finished beam.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Hypothesis {
    /// Length normalized score at the step the beam finished.
    pub score: f32,
    /// Generated tokens, without the start token and stopping before the
    /// first end token.
    pub tokens: Vec<u32>,
}

/// Decoding result of one example of the batch.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct DecodedExample {
    /// Index of the example in the input batch.
    pub batch_index: usize,
    /// Best hypotheses, highest score first.
    pub hypotheses: Vec<Hypothesis>,
    /// Number of decoding steps run before the best beam finished.
    pub steps: usize,
    /// The best beam hit the length budget instead of emitting the end token.
    pub forced: bool,
}

impl DecodedExample {
    pub fn best(&self) -> Option<&Hypothesis> {
        self.hypotheses.first()
    }
}

#[derive(Debug, Clone)]
struct Beam {
    tokens: Vec<u32>,
    log_prob: f32,
}

#[derive(Debug, Clone)]
struct BeamGroup {
    batch_index: usize,
    beams: Vec<Beam>,
    pool: Vec<Hypothesis>,
}

impl BeamGroup {
    fn finalize(mut self, n_best: usize, steps: usize, forced: bool) -> DecodedExample {
        self.pool.sort_by(|a, b| b.score.total_cmp(&a.score));
        self.pool.truncate(n_best);
        DecodedExample {
            batch_index: self.batch_index,
            hypotheses: self.pool,
            steps,
            forced,
        }
    }
}

/// What a step changed in the active set.
#[derive(Debug, Default)]
pub(crate) struct StepOutcome {
    /// Examples whose best beam finished at this step.
    pub finished: Vec<DecodedExample>,
    /// For every beam still alive, the row of its parent before the step.
    pub parents: Vec<u32>,
    /// Positions, in the group order before the step, of the groups still alive.
    pub survivors: Vec<usize>,
}

/// Termination rules of a step.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StepRules {
    pub end_token: u32,
    pub last_step: bool,
    pub n_best: usize,
}

/// The live beams of all examples that are still being decoded.
#[derive(Debug, Clone)]
pub(crate) struct ActiveBatch {
    groups: Vec<BeamGroup>,
}

impl ActiveBatch {
    /// One root beam per example, holding only the start token.
    pub fn new(batch_size: usize, start_token: u32) -> Self {
        let groups = (0..batch_size)
            .map(|batch_index| BeamGroup {
                batch_index,
                beams: vec![Beam {
                    tokens: vec![start_token],
                    log_prob: 0.0,
                }],
                pool: vec![],
            })
            .collect();
        Self { groups }
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn n_groups(&self) -> usize {
        self.groups.len()
    }

    pub fn n_beams(&self) -> usize {
        self.groups.iter().map(|g| g.beams.len()).sum()
    }

    pub fn group_sizes(&self) -> Vec<usize> {
        self.groups.iter().map(|g| g.beams.len()).collect()
    }

    pub fn batch_indices(&self) -> Vec<usize> {
        self.groups.iter().map(|g| g.batch_index).collect()
    }

    pub fn last_tokens(&self) -> Vec<u32> {
        self.beams().map(|b| b.tokens[b.tokens.len() - 1]).collect()
    }

    pub fn cumulative(&self) -> Vec<f32> {
        self.beams().map(|b| b.log_prob).collect()
    }

    fn beams(&self) -> impl Iterator<Item = &Beam> {
        self.groups.iter().flat_map(|g| g.beams.iter())
    }

    /// Replaces the beams of every group by the continuations selected for it,
    /// harvests the finished ones and drops the groups whose best beam finished.
    ///
    /// `selections` holds one list per group, best first, as produced by
    /// [`crate::scorer::GlobalScorer::score_and_select`].
    pub fn advance(
        &mut self,
        selections: Vec<Vec<Selection>>,
        step: usize,
        rules: StepRules,
    ) -> StepOutcome {
        let mut outcome = StepOutcome::default();
        let mut kept = Vec::with_capacity(self.groups.len());
        let mut offset = 0;
        let groups = std::mem::take(&mut self.groups);
        for (position, (mut group, picked)) in groups.into_iter().zip(selections).enumerate() {
            let size = group.beams.len();
            let beams: Vec<Beam> = picked
                .iter()
                .map(|sel| {
                    let parent = &group.beams[sel.beam];
                    let mut tokens = Vec::with_capacity(parent.tokens.len() + 1);
                    tokens.extend_from_slice(&parent.tokens);
                    tokens.push(sel.token);
                    Beam {
                        tokens,
                        log_prob: sel.log_prob,
                    }
                })
                .collect();
            let is_finished: Vec<bool> = picked
                .iter()
                .map(|sel| rules.last_step || sel.token == rules.end_token)
                .collect();
            let done = is_finished.first().copied().unwrap_or(true);
            for ((beam, sel), finished) in beams.iter().zip(picked.iter()).zip(is_finished) {
                if done || finished {
                    group.pool.push(Hypothesis {
                        score: sel.score,
                        tokens: strip(&beam.tokens, rules.end_token),
                    });
                }
            }
            if done {
                let forced = picked.first().map_or(true, |s| s.token != rules.end_token);
                outcome
                    .finished
                    .push(group.finalize(rules.n_best, step + 1, forced));
            } else {
                outcome
                    .parents
                    .extend(picked.iter().map(|sel| (offset + sel.beam) as u32));
                outcome.survivors.push(position);
                group.beams = beams;
                kept.push(group);
            }
            offset += size;
        }
        self.groups = kept;
        outcome
    }
}

/// Drops the start token and everything from the first end token on.
fn strip(tokens: &[u32], end_token: u32) -> Vec<u32> {
    tokens[1..]
        .iter()
        .copied()
        .take_while(|&t| t != end_token)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const EOS: u32 = 2;

    fn sel(beam: usize, token: u32, score: f32) -> Selection {
        Selection {
            score,
            log_prob: score,
            beam,
            token,
        }
    }

    fn rules(last_step: bool) -> StepRules {
        StepRules {
            end_token: EOS,
            last_step,
            n_best: 2,
        }
    }

    #[test]
    fn root_expansion() {
        let mut active = ActiveBatch::new(2, 0);
        assert_eq!(active.group_sizes(), [1, 1]);
        assert_eq!(active.last_tokens(), [0, 0]);
        let outcome = active.advance(
            vec![
                vec![sel(0, 5, -0.1), sel(0, 6, -0.2)],
                vec![sel(0, 7, -0.3), sel(0, 8, -0.4)],
            ],
            0,
            rules(false),
        );
        assert!(outcome.finished.is_empty());
        assert_eq!(outcome.parents, [0, 0, 1, 1]);
        assert_eq!(outcome.survivors, [0, 1]);
        assert_eq!(active.last_tokens(), [5, 6, 7, 8]);
        assert_eq!(active.cumulative(), [-0.1, -0.2, -0.3, -0.4]);
    }

    #[test]
    fn finished_group_is_removed() {
        let mut active = ActiveBatch::new(2, 0);
        active.advance(
            vec![
                vec![sel(0, 5, -0.1), sel(0, 6, -0.2)],
                vec![sel(0, 7, -0.3), sel(0, 8, -0.4)],
            ],
            0,
            rules(false),
        );
        // First example: best beam emits the end token. Second example: the
        // runner-up finishes, which only harvests it.
        let outcome = active.advance(
            vec![
                vec![sel(1, EOS, -0.5), sel(0, 9, -0.6)],
                vec![sel(1, 3, -0.7), sel(0, EOS, -0.8)],
            ],
            1,
            rules(false),
        );
        assert_eq!(outcome.finished.len(), 1);
        let done = &outcome.finished[0];
        assert_eq!(done.batch_index, 0);
        assert_eq!(done.steps, 2);
        assert!(!done.forced);
        assert_eq!(done.hypotheses.len(), 2);
        assert_eq!(done.hypotheses[0].tokens, [6]);
        assert_eq!(done.hypotheses[1].tokens, [5, 9]);
        assert_eq!(outcome.survivors, [1]);
        assert_eq!(outcome.parents, [3, 2]);
        assert_eq!(active.batch_indices(), [1]);
        assert_eq!(active.last_tokens(), [3, EOS]);

        let outcome = active.advance(vec![vec![sel(0, 4, -0.9), sel(1, 4, -1.0)]], 2, rules(true));
        assert!(active.is_empty());
        let done = &outcome.finished[0];
        assert!(done.forced);
        let tokens: Vec<_> = done.hypotheses.iter().map(|h| h.tokens.clone()).collect();
        assert_eq!(tokens, [vec![7], vec![8, 3, 4]]);
        assert_eq!(done.hypotheses[0].score, -0.8);
    }

    #[test]
    fn strip_start_and_end() {
        assert_eq!(strip(&[0, 4, 5, EOS], EOS), [4, 5]);
        assert_eq!(strip(&[0, 4, EOS, 5, EOS], EOS), [4]);
        assert!(strip(&[0], EOS).is_empty());
    }
}
