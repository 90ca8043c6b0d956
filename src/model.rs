//! The collaborators a beam search drives.
//!
//! The search never looks inside the model: it sees an [`Encoder`] producing
//! source features, a [`Decoder`] advancing one token at a time, a [`Generator`]
//! mapping decoder outputs to log-probabilities and a [`Vocabulary`] for
//! turning ids back into text. Everything the model keeps per beam has to be
//! [`Reorderable`] so it can follow the beams when they are reordered.
use candle::{Device, Module, Tensor, D};
use candle_nn::{Linear, VarBuilder};

use crate::error::{Error, Result};

/// Per-beam state that can follow the beams around.
///
/// Both operations act on the batch dimension only and must keep every row
/// aligned with the row of the same index in the beam manager.
pub trait Reorderable {
    /// Replicates every row `n` times, row `i` becoming rows `i * n .. (i + 1) * n`.
    fn tile(&mut self, n: usize) -> Result<()>;

    /// Keeps the rows named by `indices`, in that order. Indices may repeat.
    fn select(&mut self, indices: &[u32]) -> Result<()>;

    /// Number of rows along the batch dimension, `None` when the state has no
    /// rows to check.
    fn rows(&self) -> Option<usize> {
        None
    }

    /// Fails with a shape mismatch when some part of the state does not hold
    /// `expected` rows.
    fn check_rows(&self, expected: usize) -> Result<()> {
        match self.rows() {
            Some(rows) if rows != expected => {
                Err(Error::shape("decoder-state", &[expected], &[rows]))
            }
            _ => Ok(()),
        }
    }
}

/// Indexes turning `rows` rows into `rows * n` rows, each repeated contiguously.
fn tile_indices(rows: usize, n: usize) -> Vec<u32> {
    (0..rows as u32)
        .flat_map(|row| std::iter::repeat(row).take(n))
        .collect()
}

fn index_select(xs: &Tensor, indices: &[u32], dim: usize) -> Result<Tensor> {
    let indices = Tensor::new(indices, xs.device())?;
    Ok(xs.index_select(&indices, dim)?)
}

/// Batch major tensors, e.g. a per-layer kv cache of shape `(batch, heads, seq, dim)`.
impl Reorderable for Tensor {
    fn tile(&mut self, n: usize) -> Result<()> {
        let rows = self.dim(0)?;
        *self = index_select(self, &tile_indices(rows, n), 0)?;
        Ok(())
    }

    fn select(&mut self, indices: &[u32]) -> Result<()> {
        *self = index_select(self, indices, 0)?;
        Ok(())
    }

    fn rows(&self) -> Option<usize> {
        self.dims().first().copied()
    }
}

/// A tensor together with the dimension its batch lives on.
#[derive(Debug, Clone)]
pub struct BatchedTensor {
    tensor: Tensor,
    dim: usize,
}

impl BatchedTensor {
    pub fn new(tensor: Tensor, dim: usize) -> Result<Self> {
        if dim >= tensor.rank() {
            return Err(Error::shape("batched-tensor", &[dim + 1], tensor.dims()));
        }
        Ok(Self { tensor, dim })
    }

    pub fn tensor(&self) -> &Tensor {
        &self.tensor
    }

    pub fn batch_size(&self) -> Result<usize> {
        Ok(self.tensor.dim(self.dim)?)
    }
}

impl Reorderable for BatchedTensor {
    fn tile(&mut self, n: usize) -> Result<()> {
        let rows = self.batch_size()?;
        self.tensor = index_select(&self.tensor, &tile_indices(rows, n), self.dim)?;
        Ok(())
    }

    fn select(&mut self, indices: &[u32]) -> Result<()> {
        self.tensor = index_select(&self.tensor, indices, self.dim)?;
        Ok(())
    }

    fn rows(&self) -> Option<usize> {
        self.tensor.dims().get(self.dim).copied()
    }
}

impl<T: Reorderable> Reorderable for Vec<T> {
    fn tile(&mut self, n: usize) -> Result<()> {
        self.iter_mut().try_for_each(|t| t.tile(n))
    }

    fn select(&mut self, indices: &[u32]) -> Result<()> {
        self.iter_mut().try_for_each(|t| t.select(indices))
    }

    fn rows(&self) -> Option<usize> {
        self.iter().find_map(Reorderable::rows)
    }

    fn check_rows(&self, expected: usize) -> Result<()> {
        self.iter().try_for_each(|t| t.check_rows(expected))
    }
}

impl<T: Reorderable> Reorderable for Option<T> {
    fn tile(&mut self, n: usize) -> Result<()> {
        match self {
            Some(t) => t.tile(n),
            None => Ok(()),
        }
    }

    fn select(&mut self, indices: &[u32]) -> Result<()> {
        match self {
            Some(t) => t.select(indices),
            None => Ok(()),
        }
    }

    fn rows(&self) -> Option<usize> {
        self.as_ref().and_then(Reorderable::rows)
    }

    fn check_rows(&self, expected: usize) -> Result<()> {
        match self {
            Some(t) => t.check_rows(expected),
            None => Ok(()),
        }
    }
}

impl<A: Reorderable, B: Reorderable> Reorderable for (A, B) {
    fn tile(&mut self, n: usize) -> Result<()> {
        self.0.tile(n)?;
        self.1.tile(n)
    }

    fn select(&mut self, indices: &[u32]) -> Result<()> {
        self.0.select(indices)?;
        self.1.select(indices)
    }

    fn rows(&self) -> Option<usize> {
        self.0.rows().or_else(|| self.1.rows())
    }

    fn check_rows(&self, expected: usize) -> Result<()> {
        self.0.check_rows(expected)?;
        self.1.check_rows(expected)
    }
}

/// Stateless models still need a state type.
impl Reorderable for () {
    fn tile(&mut self, _n: usize) -> Result<()> {
        Ok(())
    }

    fn select(&mut self, _indices: &[u32]) -> Result<()> {
        Ok(())
    }
}

/// Encoded source batch.
#[derive(Debug, Clone)]
pub struct EncoderOutput {
    /// Source features, one batch entry per example on [`Encoder::features_dim`].
    pub features: Tensor,
    /// Source mask, batch major. For hierarchical sources it covers every
    /// token of every paragraph.
    pub mask: Tensor,
}

pub trait Encoder {
    fn encode(&mut self, src: &Tensor) -> Result<EncoderOutput>;

    /// The batch dimension of [`EncoderOutput::features`].
    fn features_dim(&self) -> usize {
        0
    }
}

pub trait Decoder {
    type State: Reorderable;

    /// Builds the state for a fresh batch, one row per example.
    fn init_state(&mut self, src: &Tensor, features: &Tensor, with_cache: bool)
        -> Result<Self::State>;

    /// Runs one decoding step.
    ///
    /// `tokens` has shape `(n_beams, 1)` and holds the last token of every
    /// live beam, `features` and `state` have one row per beam in the same
    /// order. `mask` is only given when decoding hierarchical sources.
    fn step(
        &mut self,
        tokens: &Tensor,
        features: &Tensor,
        mask: Option<&Tensor>,
        state: &mut Self::State,
        step: usize,
    ) -> Result<Tensor>;
}

pub trait Generator {
    /// Maps decoder outputs to log-probabilities of shape `(n_beams, vocab_size)`.
    fn forward(&self, dec_out: &Tensor) -> Result<Tensor>;
}

/// Output projection followed by a log-softmax over the vocabulary.
#[derive(Debug, Clone)]
pub struct LogSoftmaxGenerator {
    proj: Linear,
}

impl LogSoftmaxGenerator {
    pub fn new(proj: Linear) -> Self {
        Self { proj }
    }

    pub fn load(hidden_size: usize, vocab_size: usize, vb: VarBuilder) -> Result<Self> {
        let proj = candle_nn::linear(hidden_size, vocab_size, vb.pp("0"))?;
        Ok(Self { proj })
    }
}

impl Generator for LogSoftmaxGenerator {
    fn forward(&self, dec_out: &Tensor) -> Result<Tensor> {
        let logits = self.proj.forward(dec_out)?;
        Ok(candle_nn::ops::log_softmax(&logits, D::Minus1)?)
    }
}

pub trait Vocabulary {
    fn decode_ids(&self, ids: &[u32]) -> Result<String>;

    /// Number of ids the vocabulary can decode.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Word level vocabulary, the id being the index in the list.
impl<S: AsRef<str>> Vocabulary for Vec<S> {
    fn decode_ids(&self, ids: &[u32]) -> Result<String> {
        let words = ids
            .iter()
            .map(|&id| {
                self.get(id as usize)
                    .map(|w| w.as_ref())
                    .ok_or_else(|| Error::Vocabulary(format!("unknown id {id}")))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(words.join(" "))
    }

    fn len(&self) -> usize {
        self.len()
    }
}

#[cfg(feature = "tokenizers")]
impl Vocabulary for tokenizers::Tokenizer {
    fn decode_ids(&self, ids: &[u32]) -> Result<String> {
        self.decode(ids, false)
            .map_err(|e| Error::Vocabulary(e.to_string()))
    }

    fn len(&self) -> usize {
        self.get_vocab_size(true)
    }
}

/// Token ids of the last position of every beam, shape `(n_beams, 1)`.
pub(crate) fn last_tokens(tokens: Vec<u32>, device: &Device) -> Result<Tensor> {
    let n = tokens.len();
    Ok(Tensor::from_vec(tokens, (n, 1), device)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle::DType;

    #[test]
    fn tile_then_select() -> Result<()> {
        // Batch along the second dimension, as for sequence major features.
        let xs = Tensor::new(&[[1u32, 3], [2, 4]], &Device::Cpu)?;
        let mut batched = BatchedTensor::new(xs, 1)?;
        batched.tile(2)?;
        assert_eq!(
            batched.tensor().to_vec2::<u32>()?,
            [[1, 1, 3, 3], [2, 2, 4, 4]]
        );
        batched.select(&[3, 0])?;
        assert_eq!(batched.tensor().to_vec2::<u32>()?, [[3, 1], [4, 2]]);
        assert!(BatchedTensor::new(Tensor::new(&[1u32], &Device::Cpu)?, 1).is_err());
        Ok(())
    }

    #[test]
    fn nested_state_follows_selection() -> Result<()> {
        let k = Tensor::new(&[[0f32], [1.], [2.]], &Device::Cpu)?;
        let mask = Tensor::new(&[5u32, 6, 7], &Device::Cpu)?;
        let mut state = (vec![k.clone(), k], Some(mask));
        state.select(&[2, 2, 0])?;
        assert_eq!(state.0[1].to_vec2::<f32>()?, [[2.], [2.], [0.]]);
        let mask = state.1.as_ref().map(|t| t.to_vec1::<u32>());
        assert_eq!(mask.transpose()?, Some(vec![7, 7, 5]));
        state.tile(2)?;
        assert_eq!(state.0[0].dims(), [6, 1]);
        assert_eq!(state.rows(), Some(6));
        state.check_rows(6)?;
        assert!(matches!(
            state.check_rows(3),
            Err(Error::ShapeMismatch { op: "decoder-state", .. })
        ));

        // Layers disagreeing on the row count are caught even when the first
        // one matches.
        let ragged = vec![
            Tensor::zeros((3, 2), DType::F32, &Device::Cpu)?,
            Tensor::zeros((2, 2), DType::F32, &Device::Cpu)?,
        ];
        assert_eq!(ragged.rows(), Some(3));
        assert!(ragged.check_rows(3).is_err());
        assert!(().check_rows(3).is_ok());
        Ok(())
    }

    #[test]
    fn log_softmax_generator() -> Result<()> {
        let dev = Device::Cpu;
        let mut ts = std::collections::HashMap::new();
        ts.insert(
            "0.weight".to_string(),
            Tensor::new(&[[1f32, 0.], [0., 1.], [1., 1.]], &dev)?,
        );
        ts.insert("0.bias".to_string(), Tensor::new(&[0f32, 0.5, -1.], &dev)?);
        let vb = VarBuilder::from_tensors(ts, DType::F32, &dev);
        let generator = LogSoftmaxGenerator::load(2, 3, vb)?;

        let dec_out = Tensor::new(&[[-1f32, 1.], [2., 0.5]], &dev)?;
        let log_probs = generator.forward(&dec_out)?;
        assert_eq!(log_probs.dims(), [2, 3]);
        let sums: Vec<f32> = log_probs.exp()?.sum(1)?.to_vec1()?;
        for sum in sums {
            assert!((sum - 1.0).abs() < 1e-5, "{sum}");
        }
        // Logits are [-1, 1.5, -1] and [2, 1, 1.5].
        let best: Vec<u32> = log_probs.argmax(1)?.to_vec1()?;
        assert_eq!(best, [1, 0]);
        Ok(())
    }

    #[test]
    fn word_vocabulary() -> Result<()> {
        let vocab = vec!["[PAD]", "hello", "world"];
        assert_eq!(vocab.decode_ids(&[1, 2])?, "hello world");
        assert!(vocab.decode_ids(&[3]).is_err());
        assert_eq!(Vocabulary::len(&vocab), 3);
        Ok(())
    }
}
