use std::collections::{BTreeSet, HashMap};

use log::debug;
use rand::{SeedableRng, rngs::StdRng};
use serde::{Deserialize, Serialize};

use crate::{
    EncoderErr, Result,
    arch::{
        EmbeddingsMap, Initializer, KeyExtractor,
        activations::ActFn,
        layers::{AttentionParams, BiRnnParams, DenseParams, SelfAttentionParams},
    },
    encoders::{
        CharsModel, Component, EmbeddingsModel, EncoderModel, EnsembleModel, MergeModel,
        MorphoModel, ReductionModel, TransformerModel,
    },
    sentence::Sentence,
};

fn default_extractor() -> KeyExtractor {
    KeyExtractor::Form
}

fn default_trainable() -> bool {
    true
}

/// The description of an `EncoderModel`, resolved by the `ModelBuilder`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncoderSpec {
    Embeddings {
        width: usize,
        #[serde(default = "default_extractor")]
        extractor: KeyExtractor,
        #[serde(default)]
        fallbacks: Vec<KeyExtractor>,
        #[serde(default)]
        dropout: f32,
        /// Whether the dropout decreases with the frequency of the word in the corpus.
        #[serde(default)]
        frequency_dropout: bool,
    },
    CharsBiRnn {
        char_width: usize,
        hidden: usize,
    },
    CharsAttention {
        char_width: usize,
        attention: usize,
        output: usize,
    },
    Transformer {
        width: usize,
        #[serde(default = "default_extractor")]
        extractor: KeyExtractor,
        #[serde(default)]
        fine_tuning: bool,
    },
    Morpho {
        output: usize,
        #[serde(default)]
        act_fn: Option<ActFn>,
    },
    Reduction {
        input: Box<EncoderSpec>,
        output: usize,
        #[serde(default)]
        act_fn: Option<ActFn>,
        #[serde(default)]
        optimize_input: bool,
    },
    Ensemble {
        components: Vec<ComponentSpec>,
        merge: MergeSpec,
    },
}

/// The description of a branch of an ensemble.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentSpec {
    pub encoder: EncoderSpec,
    #[serde(default = "default_trainable")]
    pub trainable: bool,
}

/// The description of a `MergeModel`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeSpec {
    Concat,
    Affine {
        output: usize,
        #[serde(default)]
        act_fn: Option<ActFn>,
    },
    ConcatFeedforward {
        output: usize,
        #[serde(default)]
        act_fn: Option<ActFn>,
    },
    Sum,
    Avg,
    Product,
}

/// Builds `EncoderModel`s from an `EncoderSpec` and a training corpus.
///
/// The vocabularies of the models (words, characters and morphological features) are collected
/// from the corpus.
pub struct ModelBuilder<'a> {
    corpus: &'a [Sentence],
    init: Initializer,
    rng: StdRng,
}

impl<'a> ModelBuilder<'a> {
    /// Creates a new `ModelBuilder`.
    ///
    /// # Arguments
    /// * `corpus` - The sentences the vocabularies are collected from.
    /// * `seed` - The seed of the parameters initialization, taken from the OS if not given.
    pub fn new(corpus: &'a [Sentence], seed: Option<u64>) -> Self {
        Self {
            corpus,
            init: Initializer::default(),
            rng: Self::generate_rng(seed),
        }
    }

    /// Sets the initializer of every weight matrix and embedding.
    pub fn with_initializer(mut self, init: Initializer) -> Self {
        self.init = init;
        self
    }

    /// Builds a new validated model following a spec.
    pub fn build(&mut self, spec: &EncoderSpec) -> Result<EncoderModel> {
        let model = self.resolve_encoder(spec)?;
        debug!(kind = model.kind(), encoding_size = model.encoding_size(); "built encoder model");
        Ok(model)
    }

    fn resolve_encoder(&mut self, spec: &EncoderSpec) -> Result<EncoderModel> {
        let model = match spec {
            EncoderSpec::Embeddings {
                width,
                extractor,
                fallbacks,
                dropout,
                frequency_dropout,
            } => {
                let frequencies = self.frequencies(*extractor);
                if frequencies.is_empty() {
                    return Err(EncoderErr::EmptyVocabulary { kind: "embeddings" });
                }

                let keys = sorted_keys(&frequencies);
                let embeddings = EmbeddingsMap::new(*width, keys, &self.init, &mut self.rng)?;
                EmbeddingsModel::new(embeddings, *extractor)
                    .with_fallbacks(fallbacks.clone())
                    .with_dropout(*dropout, frequency_dropout.then_some(frequencies))?
                    .into()
            }
            EncoderSpec::CharsBiRnn { char_width, hidden } => {
                let chars = self.chars(*char_width)?;
                let network = BiRnnParams::new(*char_width, *hidden, &self.init, &mut self.rng)?;
                CharsModel::new(chars, network)?.into()
            }
            EncoderSpec::CharsAttention {
                char_width,
                attention,
                output,
            } => {
                let chars = self.chars(*char_width)?;
                let network = AttentionParams::new(
                    *char_width,
                    *attention,
                    *output,
                    &self.init,
                    &mut self.rng,
                )?;
                CharsModel::new(chars, network)?.into()
            }
            EncoderSpec::Transformer {
                width,
                extractor,
                fine_tuning,
            } => {
                let frequencies = self.frequencies(*extractor);
                if frequencies.is_empty() {
                    return Err(EncoderErr::EmptyVocabulary { kind: "transformer" });
                }

                let keys = sorted_keys(&frequencies);
                let embeddings = EmbeddingsMap::new(*width, keys, &self.init, &mut self.rng)?;
                let layer = SelfAttentionParams::new(*width, &self.init, &mut self.rng)?;
                TransformerModel::new(embeddings, *extractor, layer, *fine_tuning)?.into()
            }
            EncoderSpec::Morpho { output, act_fn } => {
                let features = MorphoModel::collect_features(self.corpus);
                let dense =
                    DenseParams::linear(features.len(), *output, *act_fn, &self.init, &mut self.rng)?;
                MorphoModel::new(features, dense)?.into()
            }
            EncoderSpec::Reduction {
                input,
                output,
                act_fn,
                optimize_input,
            } => {
                let input = self.resolve_encoder(input)?;
                let dense = DenseParams::linear(
                    input.encoding_size(),
                    *output,
                    *act_fn,
                    &self.init,
                    &mut self.rng,
                )?;
                ReductionModel::new(input, dense, *optimize_input)?.into()
            }
            EncoderSpec::Ensemble { components, merge } => {
                if components.is_empty() {
                    return Err(EncoderErr::EmptyEnsemble);
                }

                let components = components
                    .iter()
                    .map(|c| {
                        Ok(Component {
                            model: self.resolve_encoder(&c.encoder)?,
                            trainable: c.trainable,
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;

                let widths: Vec<_> = components.iter().map(|c| c.model.encoding_size()).collect();
                let merge = self.resolve_merge(*merge, &widths)?;
                EnsembleModel::new(components, merge)?.into()
            }
        };

        Ok(model)
    }

    fn resolve_merge(&mut self, spec: MergeSpec, widths: &[usize]) -> Result<MergeModel> {
        let merge = match spec {
            MergeSpec::Concat => MergeModel::Concat,
            MergeSpec::Affine { output, act_fn } => {
                MergeModel::affine(widths, output, act_fn, &self.init, &mut self.rng)?
            }
            MergeSpec::ConcatFeedforward { output, act_fn } => {
                MergeModel::concat_feedforward(widths, output, act_fn, &self.init, &mut self.rng)?
            }
            MergeSpec::Sum => MergeModel::Sum,
            MergeSpec::Avg => MergeModel::Avg,
            MergeSpec::Product => MergeModel::Product,
        };

        Ok(merge)
    }

    /// The occurrences of every key of the corpus.
    fn frequencies(&self, extractor: KeyExtractor) -> HashMap<String, usize> {
        let mut frequencies = HashMap::new();

        for token in self.corpus.iter().flat_map(Sentence::tokens) {
            *frequencies.entry(extractor.extract(token)).or_insert(0) += 1;
        }

        frequencies
    }

    fn chars(&mut self, width: usize) -> Result<EmbeddingsMap<char>> {
        let chars: BTreeSet<char> = self
            .corpus
            .iter()
            .flat_map(Sentence::tokens)
            .flat_map(|token| token.form().chars())
            .collect();

        if chars.is_empty() {
            return Err(EncoderErr::EmptyVocabulary { kind: "chars" });
        }

        EmbeddingsMap::new(width, chars, &self.init, &mut self.rng)
    }

    fn generate_rng(seed: Option<u64>) -> StdRng {
        match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        }
    }
}

/// The keys of a frequency dictionary in a deterministic order.
fn sorted_keys(frequencies: &HashMap<String, usize>) -> Vec<String> {
    let keys: BTreeSet<_> = frequencies.keys().cloned().collect();
    keys.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sentence::Token;

    fn corpus() -> Vec<Sentence> {
        vec![
            Sentence::from_forms(["The", "cat", "sat"]),
            Sentence::new([
                Token::with_features("the", ["p:det"]),
                Token::with_features("dogs", ["p:noun", "n:pl"]),
            ]),
        ]
    }

    const SPEC: &str = r#"{
        "ensemble": {
            "components": [
                { "encoder": { "embeddings": { "width": 4, "extractor": "lowercase", "dropout": 0.5, "frequency_dropout": true } } },
                { "encoder": { "chars_bi_rnn": { "char_width": 3, "hidden": 2 } }, "trainable": false },
                { "encoder": { "morpho": { "output": 2, "act_fn": { "sigmoid": { "amp": 1.0 } } } } }
            ],
            "merge": { "affine": { "output": 5, "act_fn": "tanh" } }
        }
    }"#;

    #[test]
    fn specs_resolve_into_validated_models() {
        let corpus = corpus();
        let spec: EncoderSpec = serde_json::from_str(SPEC).unwrap();
        let model = ModelBuilder::new(&corpus, Some(1)).build(&spec).unwrap();

        let EncoderModel::Ensemble(ensemble) = &model else {
            panic!("expected an ensemble, got {}", model.kind());
        };

        assert_eq!(model.encoding_size(), 5);
        assert_eq!(ensemble.widths(), [4, 4, 2]);
        assert!(!ensemble.components()[1].trainable);

        let EncoderModel::Embeddings(embeddings) = &ensemble.components()[0].model else {
            panic!("expected embeddings");
        };
        // "the", "cat", "sat", "dogs" and the unknown row
        assert_eq!(embeddings.embeddings().rows(), 5);
    }

    #[test]
    fn seeded_builds_are_reproducible() {
        let corpus = corpus();
        let spec = EncoderSpec::CharsAttention {
            char_width: 2,
            attention: 3,
            output: 2,
        };

        let a = ModelBuilder::new(&corpus, Some(7)).build(&spec).unwrap();
        let b = ModelBuilder::new(&corpus, Some(7)).build(&spec).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn empty_corpora_have_no_vocabulary() {
        let spec = EncoderSpec::CharsBiRnn {
            char_width: 2,
            hidden: 2,
        };

        assert!(matches!(
            ModelBuilder::new(&[], Some(0)).build(&spec),
            Err(EncoderErr::EmptyVocabulary { kind: "chars" })
        ));
    }

    #[test]
    fn ensembles_require_components() {
        let corpus = corpus();
        let spec = EncoderSpec::Ensemble {
            components: Vec::new(),
            merge: MergeSpec::Concat,
        };

        assert!(matches!(
            ModelBuilder::new(&corpus, Some(0)).build(&spec),
            Err(EncoderErr::EmptyEnsemble)
        ));
    }

    #[test]
    fn order_independent_merges_reject_mismatched_widths() {
        let corpus = corpus();
        let spec = EncoderSpec::Ensemble {
            components: vec![
                ComponentSpec {
                    encoder: EncoderSpec::Morpho {
                        output: 3,
                        act_fn: None,
                    },
                    trainable: true,
                },
                ComponentSpec {
                    encoder: EncoderSpec::CharsBiRnn {
                        char_width: 2,
                        hidden: 2,
                    },
                    trainable: true,
                },
            ],
            merge: MergeSpec::Sum,
        };

        assert!(matches!(
            ModelBuilder::new(&corpus, Some(0)).build(&spec),
            Err(EncoderErr::WidthMismatch { got: 4, expected: 3, .. })
        ));
    }
}
