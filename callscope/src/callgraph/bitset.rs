//! Dense set of traceable indices.

use serde::{Serialize, Serializer};

const WORD_BITS: usize = 64;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SampleSet {
    words: Vec<u64>,
    len: usize,
}

impl SampleSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `index`, returning whether it was newly inserted.
    pub fn insert(&mut self, index: usize) -> bool {
        let (word, bit) = (index / WORD_BITS, index % WORD_BITS);
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }

        let mask = 1u64 << bit;
        if self.words[word] & mask != 0 {
            return false;
        }
        self.words[word] |= mask;
        self.len += 1;
        true
    }

    #[must_use]
    pub fn contains(&self, index: usize) -> bool {
        self.words
            .get(index / WORD_BITS)
            .is_some_and(|word| word & (1u64 << (index % WORD_BITS)) != 0)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Keep only indices also in `other`.
    pub fn intersect_with(&mut self, other: &SampleSet) {
        self.words.truncate(other.words.len());
        for (word, theirs) in self.words.iter_mut().zip(&other.words) {
            *word &= theirs;
        }
        self.recount();
    }

    pub fn union_with(&mut self, other: &SampleSet) {
        if other.words.len() > self.words.len() {
            self.words.resize(other.words.len(), 0);
        }
        for (word, theirs) in self.words.iter_mut().zip(&other.words) {
            *word |= theirs;
        }
        self.recount();
    }

    fn recount(&mut self) {
        self.len = self.words.iter().map(|w| w.count_ones() as usize).sum();
    }

    /// Indices in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(i, &word)| {
            let mut remaining = word;
            std::iter::from_fn(move || {
                if remaining == 0 {
                    return None;
                }
                let bit = remaining.trailing_zeros() as usize;
                remaining &= remaining - 1;
                Some(i * WORD_BITS + bit)
            })
        })
    }

    #[must_use]
    pub fn to_vec(&self) -> Vec<usize> {
        self.iter().collect()
    }
}

impl FromIterator<usize> for SampleSet {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        let mut set = Self::new();
        for index in iter {
            set.insert(index);
        }
        set
    }
}

impl Serialize for SampleSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_contains() {
        let mut set = SampleSet::new();
        assert!(set.insert(3));
        assert!(set.insert(200));
        assert!(!set.insert(3));

        assert!(set.contains(3));
        assert!(set.contains(200));
        assert!(!set.contains(4));
        assert!(!set.contains(10_000));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_iter_ascending() {
        let set: SampleSet = [130, 0, 63, 64, 7].into_iter().collect();
        assert_eq!(set.to_vec(), vec![0, 7, 63, 64, 130]);
    }

    #[test]
    fn test_intersect_and_union() {
        let mut a: SampleSet = [1, 2, 3, 100].into_iter().collect();
        let b: SampleSet = [2, 3, 4].into_iter().collect();

        let mut union = a.clone();
        union.union_with(&b);
        assert_eq!(union.to_vec(), vec![1, 2, 3, 4, 100]);

        a.intersect_with(&b);
        assert_eq!(a.to_vec(), vec![2, 3]);
        assert_eq!(a.len(), 2);
    }

    #[test]
    fn test_serialize_as_list() {
        let set: SampleSet = [5, 1].into_iter().collect();
        assert_eq!(serde_json::to_string(&set).unwrap(), "[1,5]");
    }
}
