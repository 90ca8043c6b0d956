use crate::error::{Error, Result};
use crate::scorer::LengthPenalty;

fn default_beam_size() -> usize {
    5
}

fn default_max_length() -> usize {
    150
}

fn default_n_best() -> usize {
    1
}

fn default_alpha() -> f64 {
    0.6
}

fn default_start_token() -> u32 {
    1
}

fn default_end_token() -> u32 {
    2
}

/// Configuration for batched beam search decoding.
///
/// Field names follow the predictor's command line options, so a config can be
/// read straight from the JSON dump of a training run.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BeamSearchConfig {
    /// Number of beams kept per batch element.
    #[serde(default = "default_beam_size")]
    pub beam_size: usize,
    /// The end token is masked out for all steps below this value.
    #[serde(default)]
    pub min_length: usize,
    /// Step budget. Every beam still alive at the last step is force-finished.
    #[serde(default = "default_max_length")]
    pub max_length: usize,
    /// Number of hypotheses returned per batch element.
    #[serde(default = "default_n_best")]
    pub n_best: usize,
    /// Length penalty exponent.
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    #[serde(default)]
    pub length_penalty: LengthPenalty,
    /// Sources are split into paragraphs and the decoder attends through the
    /// hierarchical mask.
    #[serde(default, alias = "hier")]
    pub hierarchical: bool,
    #[serde(default = "default_start_token", alias = "bos_token_id")]
    pub start_token: u32,
    #[serde(default = "default_end_token", alias = "eos_token_id")]
    pub end_token: u32,
    /// Record the selected tokens, parents and scores of every step.
    #[serde(default)]
    pub trace: bool,
    /// Stop translating once this many examples have been produced.
    #[serde(default, alias = "max_wiki")]
    pub max_examples: Option<usize>,
}

impl Default for BeamSearchConfig {
    fn default() -> Self {
        Self {
            beam_size: default_beam_size(),
            min_length: 0,
            max_length: default_max_length(),
            n_best: default_n_best(),
            alpha: default_alpha(),
            length_penalty: LengthPenalty::default(),
            hierarchical: false,
            start_token: default_start_token(),
            end_token: default_end_token(),
            trace: false,
            max_examples: None,
        }
    }
}

impl BeamSearchConfig {
    pub fn new(beam_size: usize, min_length: usize, max_length: usize, alpha: f64) -> Self {
        Self {
            beam_size,
            min_length,
            max_length,
            alpha,
            ..Default::default()
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let cfg: Self = serde_json::from_str(json)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn n_best(mut self, n_best: usize) -> Self {
        self.n_best = n_best;
        self
    }

    pub fn tokens(mut self, start_token: u32, end_token: u32) -> Self {
        self.start_token = start_token;
        self.end_token = end_token;
        self
    }

    pub fn hierarchical(mut self, hierarchical: bool) -> Self {
        self.hierarchical = hierarchical;
        self
    }

    pub fn length_penalty(mut self, length_penalty: LengthPenalty) -> Self {
        self.length_penalty = length_penalty;
        self
    }

    pub fn trace(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }

    pub fn max_examples(mut self, max_examples: Option<usize>) -> Self {
        self.max_examples = max_examples;
        self
    }

    /// Checks the options that would otherwise corrupt the search. Called before
    /// any model work is done.
    pub fn validate(&self) -> Result<()> {
        if self.beam_size == 0 {
            return Err(Error::config("beam_size", "must be at least 1"));
        }
        if self.n_best == 0 {
            return Err(Error::config("n_best", "must be at least 1"));
        }
        if self.n_best > self.beam_size {
            return Err(Error::config(
                "n_best",
                format!("{} is larger than beam_size {}", self.n_best, self.beam_size),
            ));
        }
        if self.max_length == 0 {
            return Err(Error::config("max_length", "must be at least 1"));
        }
        if !self.alpha.is_finite() || self.alpha < 0.0 {
            return Err(Error::config(
                "alpha",
                format!("expected a finite non-negative value, got {}", self.alpha),
            ));
        }
        if self.start_token == self.end_token {
            tracing::warn!(
                token = self.start_token,
                "start and end tokens are identical"
            );
        }
        if self.min_length >= self.max_length {
            tracing::warn!(
                min_length = self.min_length,
                max_length = self.max_length,
                "min_length is not below max_length, every hypothesis will be force-finished"
            );
        }
        Ok(())
    }

    pub(crate) fn scorer(&self) -> crate::scorer::GlobalScorer {
        crate::scorer::GlobalScorer::new(self.alpha, self.length_penalty)
    }
}
