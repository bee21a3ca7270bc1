use std::collections::BTreeSet;

/// A single token of a sentence.
///
/// Besides its surface form a token carries the set of morphological feature keys the
/// features extraction collaborator attached to it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Token {
    form: String,
    features: BTreeSet<String>,
}

impl Token {
    /// Creates a new `Token` with no features.
    ///
    /// # Arguments
    /// * `form` - The surface form of the token.
    pub fn new(form: impl Into<String>) -> Self {
        Self {
            form: form.into(),
            features: BTreeSet::new(),
        }
    }

    /// Creates a new `Token` carrying the given feature keys.
    pub fn with_features<I, S>(form: impl Into<String>, features: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            form: form.into(),
            features: features.into_iter().map(Into::into).collect(),
        }
    }

    pub fn form(&self) -> &str {
        &self.form
    }

    pub fn features(&self) -> &BTreeSet<String> {
        &self.features
    }
}

/// An ordered sequence of tokens, fixed for the duration of a forward call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sentence {
    tokens: Vec<Token>,
}

impl Sentence {
    /// Creates a new `Sentence`.
    ///
    /// # Arguments
    /// * `tokens` - The tokens of the sentence, in order.
    pub fn new<I>(tokens: I) -> Self
    where
        I: IntoIterator<Item = Token>,
    {
        Self {
            tokens: tokens.into_iter().collect(),
        }
    }

    /// Creates a new `Sentence` of featureless tokens from their forms.
    pub fn from_forms<I, S>(forms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(forms.into_iter().map(Token::new))
    }

    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Replaces the features of every token with the ones given by an extractor.
    ///
    /// # Arguments
    /// * `extractor` - The features extraction collaborator.
    ///
    /// # Returns
    /// The annotated sentence.
    pub fn annotate<E>(mut self, extractor: &E) -> Self
    where
        E: FeaturesExtractor + ?Sized,
    {
        let features: Vec<_> = (0..self.tokens.len())
            .map(|i| extractor.extract(&self, i))
            .collect();

        for (token, features) in self.tokens.iter_mut().zip(features) {
            token.features = features;
        }

        self
    }
}

/// Maps a token of a sentence to the set of its string feature keys.
///
/// Implementations usually wrap linguistic dictionaries that live outside this crate.
pub trait FeaturesExtractor {
    fn extract(&self, sentence: &Sentence, index: usize) -> BTreeSet<String>;
}
