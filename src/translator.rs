//! Turning decoded token ids back into text.
//!
//! The [`Translator`] runs a [`BeamSearch`] over batches of sources and pairs
//! every prediction with its reference and source text, ready to be written
//! out or handed to an evaluation tool.
use candle::{DType, Tensor};

use crate::beam::DecodedExample;
use crate::error::{Error, Result};
use crate::model::{Decoder, Encoder, Generator, Vocabulary};
use crate::search::BeamSearch;

/// Separator placed between the paragraphs of a hierarchical source.
pub const PARAGRAPH_SEPARATOR: &str = "<PARA>";

/// A batch of sources with their reference texts.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Source token ids, `(batch, src_len)` or `(batch, n_paragraphs, paragraph_len)`.
    pub src: Tensor,
    /// Reference text of every example.
    pub tgt_str: Vec<String>,
}

impl Batch {
    pub fn new(src: Tensor, tgt_str: Vec<String>) -> Self {
        Self { src, tgt_str }
    }

    pub fn batch_size(&self) -> Result<usize> {
        Ok(self.src.dim(0)?)
    }
}

/// Prediction, reference and source of one example.
#[derive(Debug, Clone, PartialEq)]
pub struct Translation {
    /// Tokens of the kept hypotheses, concatenated best first.
    pub prediction: Vec<String>,
    pub gold: Vec<String>,
    pub source: String,
}

impl Translation {
    pub fn raw_candidate_line(&self) -> String {
        self.prediction.join(" ").trim().to_string()
    }

    pub fn raw_gold_line(&self) -> String {
        self.gold.join(" ").trim().to_string()
    }

    /// The prediction with sentence markers turned into spaces and unknown
    /// tokens spelled `UNK`.
    pub fn candidate_line(&self) -> String {
        let line = self.prediction.join(" ").replace("<Q>", " ");
        collapse_spaces(&line).replace("<unk>", "UNK")
    }

    /// The reference without sentence tags, lower-cased.
    pub fn gold_line(&self) -> String {
        let line = self
            .gold
            .join(" ")
            .replace("<t>", "")
            .replace("</t>", "")
            .replace("<Q>", " ");
        collapse_spaces(&line).to_lowercase()
    }

    pub fn lines(&self) -> TranslationLines {
        TranslationLines {
            candidate: self.candidate_line(),
            gold: self.gold_line(),
            raw_candidate: self.raw_candidate_line(),
            raw_gold: self.raw_gold_line(),
            source: self.source.trim().to_string(),
        }
    }
}

/// The text lines produced for one example.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TranslationLines {
    pub candidate: String,
    pub gold: String,
    pub raw_candidate: String,
    pub raw_gold: String,
    pub source: String,
}

fn collapse_spaces(line: &str) -> String {
    line.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub struct Translator<V> {
    search: BeamSearch,
    vocab: V,
}

impl<V: Vocabulary> Translator<V> {
    pub fn new(search: BeamSearch, vocab: V) -> Self {
        Self { search, vocab }
    }

    pub fn search(&self) -> &BeamSearch {
        &self.search
    }

    pub fn vocab(&self) -> &V {
        &self.vocab
    }

    /// Decodes the ids of a hypothesis into words.
    ///
    /// Ids are cut at the first end token and ids the vocabulary does not know
    /// are dropped.
    pub fn build_target_tokens(&self, pred: &[u32]) -> Result<Vec<String>> {
        let end_token = self.search.config().end_token;
        let vocab_size = self.vocab.len();
        let ids: Vec<u32> = pred
            .iter()
            .copied()
            .take_while(|&t| t != end_token)
            .filter(|&t| (t as usize) < vocab_size)
            .collect();
        let text = self.vocab.decode_ids(&ids)?;
        Ok(text.split(' ').map(String::from).collect())
    }

    fn source_text(&self, src: &[Vec<u32>]) -> Result<String> {
        let paragraphs = src
            .iter()
            .map(|p| self.vocab.decode_ids(p))
            .collect::<Result<Vec<_>>>()?;
        Ok(paragraphs.join(PARAGRAPH_SEPARATOR))
    }

    /// Pairs the decoded hypotheses of a batch with their reference and source.
    #[allow(clippy::wrong_self_convention)]
    pub fn from_batch(
        &self,
        batch: &Batch,
        decoded: &[DecodedExample],
    ) -> Result<Vec<Translation>> {
        let batch_size = batch.batch_size()?;
        if decoded.len() != batch_size || batch.tgt_str.len() != batch_size {
            return Err(Error::shape(
                "from-batch",
                &[batch_size, batch_size],
                &[decoded.len(), batch.tgt_str.len()],
            ));
        }
        let src = batch.src.to_dtype(DType::U32)?;
        let sources: Vec<Vec<Vec<u32>>> = if self.search.config().hierarchical {
            src.to_vec3()?
        } else {
            src.to_vec2()?.into_iter().map(|s| vec![s]).collect()
        };

        decoded
            .iter()
            .zip(batch.tgt_str.iter())
            .zip(sources.iter())
            .map(|((example, tgt), src)| -> Result<Translation> {
                let mut prediction = vec![];
                for hyp in example.hypotheses.iter() {
                    prediction.extend(self.build_target_tokens(&hyp.tokens)?);
                }
                Ok(Translation {
                    prediction,
                    gold: tgt.split_whitespace().map(String::from).collect(),
                    source: self.source_text(src)?,
                })
            })
            .collect()
    }

    /// Decodes a single batch and builds its translations.
    pub fn translate_batch<M>(&self, model: &mut M, batch: &Batch) -> Result<Vec<Translation>>
    where
        M: Encoder + Decoder + Generator,
    {
        let decoded = self.search.decode(model, &batch.src)?;
        self.from_batch(batch, &decoded)
    }

    /// Translates batches until they run out or the configured number of
    /// examples has been produced.
    pub fn translate<M, I>(&self, model: &mut M, batches: I) -> Result<Vec<TranslationLines>>
    where
        M: Encoder + Decoder + Generator,
        I: IntoIterator<Item = Batch>,
    {
        let max_examples = self.search.config().max_examples;
        let mut lines = vec![];
        for (index, batch) in batches.into_iter().enumerate() {
            if max_examples.is_some_and(|max| lines.len() >= max) {
                break;
            }
            let translations = self.translate_batch(model, &batch)?;
            tracing::debug!(
                batch = index,
                examples = translations.len(),
                "translated batch"
            );
            for translation in translations {
                if max_examples.is_some_and(|max| lines.len() >= max) {
                    break;
                }
                lines.push(translation.lines());
            }
        }
        Ok(lines)
    }
}
