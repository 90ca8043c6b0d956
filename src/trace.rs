//! Step by step record of the choices made by a beam search.
use crate::scorer::Selection;

/// The selections of one decoding step, one entry per active example.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TraceStep {
    pub step: usize,
    /// Input batch index of every active example.
    pub batch_indices: Vec<usize>,
    pub predicted_ids: Vec<Vec<u32>>,
    /// Parent of every selected beam, relative to its example's beams.
    pub beam_parent_ids: Vec<Vec<usize>>,
    pub scores: Vec<Vec<f32>>,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BeamTrace {
    pub steps: Vec<TraceStep>,
}

impl BeamTrace {
    pub(crate) fn record(
        &mut self,
        step: usize,
        batch_indices: Vec<usize>,
        picked: &[Vec<Selection>],
    ) {
        self.steps.push(TraceStep {
            step,
            batch_indices,
            predicted_ids: picked
                .iter()
                .map(|s| s.iter().map(|s| s.token).collect())
                .collect(),
            beam_parent_ids: picked
                .iter()
                .map(|s| s.iter().map(|s| s.beam).collect())
                .collect(),
            scores: picked
                .iter()
                .map(|s| s.iter().map(|s| s.score).collect())
                .collect(),
        });
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Follows the parent pointers back from `beam` at the last recorded step
    /// of the example `batch_index`, returning the tokens along the way.
    pub fn backtrack(&self, batch_index: usize, beam: usize) -> Option<Vec<u32>> {
        let steps = self.steps.iter().rev().filter_map(|s| {
            let group = s.batch_indices.iter().position(|&b| b == batch_index)?;
            Some((s, group))
        });
        let mut tokens = vec![];
        let mut beam = beam;
        for (step, group) in steps {
            tokens.push(*step.predicted_ids[group].get(beam)?);
            beam = step.beam_parent_ids[group][beam];
        }
        if tokens.is_empty() {
            return None;
        }
        tokens.reverse();
        Some(tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sel(beam: usize, token: u32) -> Selection {
        Selection {
            score: 0.,
            log_prob: 0.,
            beam,
            token,
        }
    }

    #[test]
    fn backtrack_follows_parents() {
        let mut trace = BeamTrace::default();
        trace.record(0, vec![0, 1], &[vec![sel(0, 4), sel(0, 5)], vec![sel(0, 6)]]);
        trace.record(1, vec![0], &[vec![sel(1, 7), sel(0, 8)]]);
        assert_eq!(trace.len(), 2);
        assert_eq!(trace.steps[1].predicted_ids, [vec![7, 8]]);
        assert_eq!(trace.backtrack(0, 0), Some(vec![5, 7]));
        assert_eq!(trace.backtrack(0, 1), Some(vec![4, 8]));
        assert_eq!(trace.backtrack(1, 0), Some(vec![6]));
        assert_eq!(trace.backtrack(2, 0), None);
        assert_eq!(trace.backtrack(0, 3), None);
    }
}
