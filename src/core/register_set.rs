//! Register bit sets.
//!
//! Tracks sets of physical registers across register files with one bit per
//! register. Used by the resource manager for reserved registers (values live
//! across the scheduling region) and by the copy adder for scratch pools.

use crate::machine::{RegisterRef, RfId};
use hashbrown::HashMap;

/// Bits per storage word.
const WORD_BITS: usize = 64;

/// Bit set for efficiently tracking register sets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterSet {
    /// Bit words for each register file that has at least one member.
    files: HashMap<RfId, Vec<u64>>,
}

impl RegisterSet {
    /// Create empty register set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create register set with the first `count` registers of `rf` marked.
    pub fn all_in_file(rf: RfId, count: u16) -> Self {
        let mut set = Self::new();
        for index in 0..count {
            set.insert(RegisterRef::new(rf, index));
        }
        set
    }

    /// Check if register is set.
    pub fn contains(&self, reg: RegisterRef) -> bool {
        let (word, bit) = Self::locate(reg);
        self.files
            .get(&reg.rf)
            .and_then(|words| words.get(word))
            .is_some_and(|w| w & (1u64 << bit) != 0)
    }

    /// Set a register. Returns false if it was already set.
    pub fn insert(&mut self, reg: RegisterRef) -> bool {
        let (word, bit) = Self::locate(reg);
        let words = self.files.entry(reg.rf).or_default();
        if words.len() <= word {
            words.resize(word + 1, 0);
        }
        let was_set = words[word] & (1u64 << bit) != 0;
        words[word] |= 1u64 << bit;
        !was_set
    }

    /// Clear a register. Returns false if it was not set.
    pub fn remove(&mut self, reg: RegisterRef) -> bool {
        let (word, bit) = Self::locate(reg);
        match self.files.get_mut(&reg.rf).and_then(|words| words.get_mut(word)) {
            Some(w) if *w & (1u64 << bit) != 0 => {
                *w &= !(1u64 << bit);
                true
            }
            _ => false,
        }
    }

    /// Set union with another set.
    pub fn union(&mut self, other: &RegisterSet) {
        for (rf, words) in &other.files {
            let mine = self.files.entry(*rf).or_default();
            if mine.len() < words.len() {
                mine.resize(words.len(), 0);
            }
            for (i, w) in words.iter().enumerate() {
                mine[i] |= w;
            }
        }
    }

    /// Set difference: drop every register also set in `other`.
    pub fn subtract(&mut self, other: &RegisterSet) {
        for (rf, words) in self.files.iter_mut() {
            if let Some(theirs) = other.files.get(rf) {
                for (i, w) in words.iter_mut().enumerate() {
                    if let Some(t) = theirs.get(i) {
                        *w &= !t;
                    }
                }
            }
        }
    }

    /// Find first set register in the given file, excluding specified registers.
    pub fn find_first_in_file(&self, rf: RfId, exclude: &RegisterSet) -> Option<RegisterRef> {
        let words = self.files.get(&rf)?;
        let empty = Vec::new();
        let excluded = exclude.files.get(&rf).unwrap_or(&empty);
        for (i, w) in words.iter().enumerate() {
            let available = w & !excluded.get(i).copied().unwrap_or(0);
            if available != 0 {
                let index = i * WORD_BITS + available.trailing_zeros() as usize;
                return Some(RegisterRef::new(rf, index as u16));
            }
        }
        None
    }

    /// Count number of set registers in file.
    pub fn count_in_file(&self, rf: RfId) -> u32 {
        self.files
            .get(&rf)
            .map(|words| words.iter().map(|w| w.count_ones()).sum())
            .unwrap_or(0)
    }

    /// Total number of set registers.
    pub fn len(&self) -> usize {
        self.files
            .values()
            .flat_map(|words| words.iter())
            .map(|w| w.count_ones() as usize)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registers in ascending (file, index) order.
    pub fn iter(&self) -> impl Iterator<Item = RegisterRef> + '_ {
        let mut files: Vec<_> = self.files.keys().copied().collect();
        files.sort();
        files.into_iter().flat_map(move |rf| {
            let words = &self.files[&rf];
            words.iter().enumerate().flat_map(move |(i, w)| {
                (0..WORD_BITS)
                    .filter(move |bit| w & (1u64 << bit) != 0)
                    .map(move |bit| RegisterRef::new(rf, (i * WORD_BITS + bit) as u16))
            })
        })
    }

    /// Clear all registers.
    pub fn clear(&mut self) {
        self.files.clear();
    }

    fn locate(reg: RegisterRef) -> (usize, usize) {
        let index = reg.index as usize;
        (index / WORD_BITS, index % WORD_BITS)
    }
}

impl FromIterator<RegisterRef> for RegisterSet {
    fn from_iter<I: IntoIterator<Item = RegisterRef>>(iter: I) -> Self {
        let mut set = RegisterSet::new();
        for reg in iter {
            set.insert(reg);
        }
        set
    }
}
