//! Word-level caption vocabulary.
//!
//! Ids are assigned as follows:
//!
//! * `0` is always `<pad>`.
//! * `1..=N` are the corpus words whose frequency is strictly above the configured minimum, in
//!   the order they were first seen.
//! * `N + 1`, `N + 2` and `N + 3` are `<unk>`, `<start>` and `<end>`.

use std::{
    collections::{HashMap, hash_map::Entry},
    fmt, fs,
    path::Path,
};

use anyhow::{Context, Result, bail, ensure};
use serde::{
    Deserialize, Deserializer, Serialize, Serializer,
    de::{self, MapAccess, Visitor},
    ser::SerializeMap,
};
use tracing::{info, warn};

pub const PAD_TOKEN: &str = "<pad>";
pub const UNK_TOKEN: &str = "<unk>";
pub const START_TOKEN: &str = "<start>";
pub const END_TOKEN: &str = "<end>";

const RESERVED_TOKENS: [&str; 4] = [PAD_TOKEN, UNK_TOKEN, START_TOKEN, END_TOKEN];

/// Token frequency table that remembers the order in which tokens were first seen.
#[derive(Debug, Clone, Default)]
pub struct TokenCounter {
    order: Vec<String>,
    counts: HashMap<String, usize>,
}

impl TokenCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update<I, S>(&mut self, tokens: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for token in tokens {
            let token = token.as_ref();
            match self.counts.entry(token.to_owned()) {
                Entry::Occupied(mut slot) => *slot.get_mut() += 1,
                Entry::Vacant(slot) => {
                    slot.insert(1);
                    self.order.push(token.to_owned());
                }
            }
        }
    }

    pub fn count(&self, token: &str) -> usize {
        self.counts.get(token).copied().unwrap_or(0)
    }

    /// Number of distinct tokens.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Distinct tokens with their counts, in first-seen order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, usize)> + '_ {
        self.order
            .iter()
            .map(|token| (token.as_str(), self.counts[token]))
    }
}

/// A caption encoded against a [`Vocabulary`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedCaption {
    /// `<start>`, token ids, `<end>`, then `<pad>` up to `max_len + 2` entries.
    pub ids: Vec<u32>,
    /// Number of non-pad entries (`tokens + 2`).
    pub length: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vocabulary {
    words: Vec<String>,
    index: HashMap<String, u32>,
}

impl Vocabulary {
    /// Build the vocabulary from a frequency table, keeping tokens seen more than
    /// `min_word_freq` times.
    pub fn build(counter: &TokenCounter, min_word_freq: usize) -> Result<Self> {
        ensure!(
            !counter.is_empty(),
            "cannot build a vocabulary from an empty caption corpus"
        );
        let mut words = vec![PAD_TOKEN.to_string()];
        for (token, count) in counter.iter() {
            if count <= min_word_freq {
                continue;
            }
            if RESERVED_TOKENS.contains(&token) {
                warn!(token, "corpus token collides with a reserved token; skipping");
                continue;
            }
            words.push(token.to_string());
        }
        let kept = words.len() - 1;
        words.extend(
            [UNK_TOKEN, START_TOKEN, END_TOKEN]
                .into_iter()
                .map(str::to_string),
        );
        info!(
            distinct = counter.len(),
            kept, min_word_freq, "built caption vocabulary"
        );
        Ok(Self::from_words(words))
    }

    /// Count every caption and build the vocabulary in one go.
    pub fn from_captions<C, S>(captions: &[C], min_word_freq: usize) -> Result<Self>
    where
        C: AsRef<[S]>,
        S: AsRef<str>,
    {
        let mut counter = TokenCounter::new();
        for caption in captions {
            counter.update(caption.as_ref());
        }
        Self::build(&counter, min_word_freq)
    }

    fn from_words(words: Vec<String>) -> Self {
        let index = words
            .iter()
            .enumerate()
            .map(|(id, word)| (word.clone(), id as u32))
            .collect();
        Self { words, index }
    }

    /// Total number of ids, reserved tokens included.
    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn id(&self, word: &str) -> Option<u32> {
        self.index.get(word).copied()
    }

    pub fn word(&self, id: u32) -> Option<&str> {
        self.words.get(id as usize).map(String::as_str)
    }

    pub fn pad_id(&self) -> u32 {
        0
    }

    pub fn unk_id(&self) -> u32 {
        self.index[UNK_TOKEN]
    }

    pub fn start_id(&self) -> u32 {
        self.index[START_TOKEN]
    }

    pub fn end_id(&self) -> u32 {
        self.index[END_TOKEN]
    }

    /// Encode `tokens` as `<start> ids.. <end> <pad>..` with a fixed total length of
    /// `max_len + 2`. Out-of-vocabulary tokens map to `<unk>`.
    pub fn encode<S: AsRef<str>>(&self, tokens: &[S], max_len: usize) -> Result<EncodedCaption> {
        ensure!(
            tokens.len() <= max_len,
            "caption has {} tokens but the maximum is {max_len}",
            tokens.len()
        );
        let unk = self.unk_id();
        let mut ids = Vec::with_capacity(max_len + 2);
        ids.push(self.start_id());
        ids.extend(
            tokens
                .iter()
                .map(|token| self.id(token.as_ref()).unwrap_or(unk)),
        );
        ids.push(self.end_id());
        let length = ids.len();
        ids.resize(max_len + 2, self.pad_id());
        Ok(EncodedCaption { ids, length })
    }

    /// Inverse of [`Vocabulary::encode`]: drops the leading `<start>`, stops at the first
    /// `<end>` and skips padding. Unknown tokens come back as `<unk>`.
    pub fn decode(&self, ids: &[u32]) -> Vec<String> {
        let start = self.start_id();
        let end = self.end_id();
        let pad = self.pad_id();
        let body = match ids.first() {
            Some(&first) if first == start => &ids[1..],
            _ => ids,
        };
        body.iter()
            .take_while(|&&id| id != end)
            .filter(|&&id| id != pad)
            .map(|&id| self.word(id).unwrap_or(UNK_TOKEN).to_string())
            .collect()
    }

    /// Persist as a JSON object mapping every word (reserved tokens included) to its id.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string(self)?;
        fs::write(path, json)
            .with_context(|| format!("failed to write vocabulary to {}", path.display()))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path)
            .with_context(|| format!("failed to read vocabulary {}", path.display()))?;
        let vocab = serde_json::from_str(&data)
            .with_context(|| format!("failed to parse vocabulary {}", path.display()))?;
        Ok(vocab)
    }

    fn from_mapping(mapping: HashMap<String, u32>) -> Result<Self> {
        let mut words = vec![None; mapping.len()];
        for (word, id) in mapping {
            let slot = words
                .get_mut(id as usize)
                .with_context(|| format!("id {id} for `{word}` is outside the dense id range"))?;
            if slot.is_some() {
                bail!("id {id} is assigned to more than one word");
            }
            *slot = Some(word);
        }
        let words: Vec<String> = words.into_iter().flatten().collect();
        ensure!(
            words.first().map(String::as_str) == Some(PAD_TOKEN),
            "`{PAD_TOKEN}` must map to id 0"
        );
        let vocab = Self::from_words(words);
        for token in RESERVED_TOKENS {
            ensure!(
                vocab.index.contains_key(token),
                "reserved token `{token}` missing from vocabulary"
            );
        }
        Ok(vocab)
    }
}

impl Serialize for Vocabulary {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.words.len()))?;
        // `<pad>` goes last so the file reads like the id table it describes.
        for (id, word) in self.words.iter().enumerate().skip(1) {
            map.serialize_entry(word, &id)?;
        }
        map.serialize_entry(PAD_TOKEN, &0u32)?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for Vocabulary {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct MappingVisitor;

        impl<'de> Visitor<'de> for MappingVisitor {
            type Value = HashMap<String, u32>;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("an object mapping words to integer ids")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut mapping = HashMap::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((word, id)) = access.next_entry::<String, u32>()? {
                    if mapping.insert(word.clone(), id).is_some() {
                        return Err(de::Error::custom(format!("duplicate word `{word}`")));
                    }
                }
                Ok(mapping)
            }
        }

        let mapping = deserializer.deserialize_map(MappingVisitor)?;
        Vocabulary::from_mapping(mapping).map_err(|err| de::Error::custom(format!("{err:#}")))
    }
}
