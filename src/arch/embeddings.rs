use std::{collections::HashMap, hash::Hash};

use ndarray::{Array1, ArrayView1};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{EncoderErr, Result, arch::Initializer, error::check_len, sentence::Token};

const KIND: &str = "embeddings";

/// The row every unknown key is mapped to.
pub const UNKNOWN: usize = 0;

/// A table of dense vectors indexed by key, with a reserved row for unknown keys.
///
/// Rows are kept in a single flat block; row `UNKNOWN` comes first and the known keys follow in
/// insertion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    try_from = "EmbeddingsRepr<K>",
    into = "EmbeddingsRepr<K>",
    bound(
        serialize = "K: Serialize + Clone",
        deserialize = "K: Deserialize<'de> + Clone"
    )
)]
pub struct EmbeddingsMap<K: Eq + Hash> {
    width: usize,
    keys: Vec<K>,
    index: HashMap<K, usize>,
    values: Vec<f32>,
}

#[derive(Serialize, Deserialize)]
struct EmbeddingsRepr<K> {
    width: usize,
    keys: Vec<K>,
    values: Vec<f32>,
}

impl<K: Eq + Hash> From<EmbeddingsMap<K>> for EmbeddingsRepr<K> {
    fn from(map: EmbeddingsMap<K>) -> Self {
        Self {
            width: map.width,
            keys: map.keys,
            values: map.values,
        }
    }
}

impl<K: Eq + Hash + Clone> TryFrom<EmbeddingsRepr<K>> for EmbeddingsMap<K> {
    type Error = EncoderErr;

    fn try_from(repr: EmbeddingsRepr<K>) -> Result<Self> {
        let map = Self {
            width: repr.width,
            index: indices(&repr.keys),
            keys: repr.keys,
            values: repr.values,
        };

        map.validate()?;
        Ok(map)
    }
}

fn indices<K: Eq + Hash + Clone>(keys: &[K]) -> HashMap<K, usize> {
    keys.iter()
        .enumerate()
        .map(|(i, k)| (k.clone(), i + 1))
        .collect()
}

impl<K: Eq + Hash + Clone> EmbeddingsMap<K> {
    /// Creates a new `EmbeddingsMap`.
    ///
    /// # Arguments
    /// * `width` - The width of every embedding.
    /// * `keys` - The known keys, duplicates are ignored.
    /// * `init` - The initializer of every row, the unknown one included.
    /// * `rng` - A random number generator.
    pub fn new<I, R>(width: usize, keys: I, init: &Initializer, rng: &mut R) -> Result<Self>
    where
        I: IntoIterator<Item = K>,
        R: Rng,
    {
        let mut unique = Vec::new();
        let mut index = HashMap::new();

        for key in keys {
            if !index.contains_key(&key) {
                index.insert(key.clone(), unique.len() + 1);
                unique.push(key);
            }
        }

        let rows = unique.len() + 1;
        let values = init.sample(rng, rows * width, rows, width)?.to_vec();
        let map = Self {
            width,
            keys: unique,
            index,
            values,
        };

        map.validate()?;
        Ok(map)
    }

    pub fn validate(&self) -> Result<()> {
        if self.width == 0 {
            return Err(EncoderErr::ZeroWidth {
                kind: KIND,
                what: "embedding",
            });
        }

        check_len(KIND, "keys", self.index.len(), self.keys.len())?;
        check_len(
            KIND,
            "parameters",
            self.values.len(),
            self.rows() * self.width,
        )
    }

    /// The row of `key`, `UNKNOWN` if the key isn't in the table.
    pub fn index(&self, key: &K) -> usize {
        self.index.get(key).copied().unwrap_or(UNKNOWN)
    }

    /// The row of the first known key along with the key, `UNKNOWN` if none is known.
    pub fn first_index<I>(&self, keys: I) -> (usize, Option<K>)
    where
        I: IntoIterator<Item = K>,
    {
        keys.into_iter()
            .find_map(|key| self.index.get(&key).map(|&row| (row, Some(key))))
            .unwrap_or((UNKNOWN, None))
    }

    pub fn keys(&self) -> &[K] {
        &self.keys
    }

    /// The amount of rows, the unknown one included.
    pub fn rows(&self) -> usize {
        self.keys.len() + 1
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// The embedding at the given row.
    pub fn row(&self, index: usize) -> ArrayView1<'_, f32> {
        let start = index * self.width;
        ArrayView1::from(&self.values[start..start + self.width])
    }

    /// Returns a copy of the embedding of `key`.
    pub fn get(&self, key: &K) -> Array1<f32> {
        self.row(self.index(key)).to_owned()
    }

    /// A mutable slice over the given row, used by optimizers to update it in place.
    pub fn row_mut(&mut self, index: usize) -> &mut [f32] {
        let start = index * self.width;
        &mut self.values[start..start + self.width]
    }
}

/// Derives the key a token is looked up with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyExtractor {
    Form,
    Lowercase,
    /// The lowercase form with every digit folded into `0`.
    Normalized,
}

impl KeyExtractor {
    pub fn extract(&self, token: &Token) -> String {
        let form = token.form();

        match self {
            KeyExtractor::Form => form.to_string(),
            KeyExtractor::Lowercase => form.to_lowercase(),
            KeyExtractor::Normalized => form
                .to_lowercase()
                .chars()
                .map(|c| if c.is_ascii_digit() { '0' } else { c })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{SeedableRng, rngs::StdRng};

    fn map() -> EmbeddingsMap<String> {
        let mut rng = StdRng::seed_from_u64(1);
        let keys = ["a", "b", "a", "c"].map(String::from);
        EmbeddingsMap::new(2, keys, &Initializer::default(), &mut rng).unwrap()
    }

    #[test]
    fn duplicate_keys_share_a_row() {
        let map = map();

        assert_eq!(map.rows(), 4);
        assert_eq!(map.index(&"a".to_string()), 1);
        assert_eq!(map.index(&"c".to_string()), 3);
        assert_eq!(map.index(&"z".to_string()), UNKNOWN);
    }

    #[test]
    fn first_known_key_wins() {
        let map = map();
        let keys = ["Z".to_string(), "b".to_string(), "a".to_string()];

        assert_eq!(map.first_index(keys.clone()), (2, Some("b".to_string())));
        assert_eq!(map.first_index(keys.into_iter().take(1)), (UNKNOWN, None));
    }

    #[test]
    fn serde_keeps_the_index() {
        let map = map();
        let json = serde_json::to_string(&map).unwrap();
        let loaded: EmbeddingsMap<String> = serde_json::from_str(&json).unwrap();

        assert_eq!(loaded, map);
        assert_eq!(loaded.get(&"b".to_string()), map.get(&"b".to_string()));
    }

    #[test]
    fn corrupted_tables_are_rejected() {
        let json = r#"{"width":2,"keys":["a"],"values":[0.0,1.0]}"#;
        assert!(serde_json::from_str::<EmbeddingsMap<String>>(json).is_err());
    }

    #[test]
    fn extractors_fold_case_and_digits() {
        let token = Token::new("Año-2024");

        assert_eq!(KeyExtractor::Form.extract(&token), "Año-2024");
        assert_eq!(KeyExtractor::Lowercase.extract(&token), "año-2024");
        assert_eq!(KeyExtractor::Normalized.extract(&token), "año-0000");
    }
}
