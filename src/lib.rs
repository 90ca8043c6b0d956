//! Batched beam search decoding for candle sequence-to-sequence models.
//!
//! Given a model exposing an [`Encoder`], a [`Decoder`] and a [`Generator`],
//! [`BeamSearch`] produces the `n_best` highest scoring outputs of every
//! example of a batch. Scores are length normalized with the GNMT penalty and
//! an example stops as soon as its best beam emits the end token, the
//! remaining examples carrying on with a compacted batch.
//!
//! ```ignore
//! use candle_beam_search::{BeamSearch, BeamSearchConfig};
//!
//! let config = BeamSearchConfig::new(5, 50, 200, 0.95).n_best(1).tokens(bos, eos);
//! let search = BeamSearch::new(config)?;
//! for example in search.decode(&mut model, &src)? {
//!     println!("{:?}", example.best());
//! }
//! ```
pub mod beam;
pub mod config;
pub mod error;
pub mod model;
pub mod scorer;
pub mod search;
pub mod trace;
pub mod translator;

pub use beam::{DecodedExample, Hypothesis};
pub use config::BeamSearchConfig;
pub use error::{Error, Result};
pub use model::{
    BatchedTensor, Decoder, Encoder, EncoderOutput, Generator, LogSoftmaxGenerator, Reorderable,
    Vocabulary,
};
pub use scorer::{GlobalScorer, LengthPenalty, Selection};
pub use search::BeamSearch;
pub use trace::{BeamTrace, TraceStep};
pub use translator::{Batch, Translation, TranslationLines, Translator};
