//! src/shuffle.rs
//!
//! A set with O(1) uniform random choice, used for the per-status member
//! indexes. Elements live in a dense vector for selection and a position map
//! for membership tests; removal swaps the victim with the last element so
//! the vector stays dense.

use rand::Rng;
use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;

#[derive(Debug, Default)]
pub struct Shuffle<T> {
    positions: HashMap<T, usize>,
    values: Vec<T>,
}

impl<T: Clone + Eq + Hash> Shuffle<T> {
    pub fn new() -> Self {
        Self {
            positions: HashMap::new(),
            values: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn contains<Q>(&self, value: &Q) -> bool
    where
        T: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.positions.contains_key(value)
    }

    /// Adds `value` to the set. Returns false if it was already present.
    pub fn add(&mut self, value: T) -> bool {
        if self.positions.contains_key(&value) {
            return false;
        }
        self.positions.insert(value.clone(), self.values.len());
        self.values.push(value);
        true
    }

    /// Removes `value` from the set, swapping the last element into its slot.
    /// Returns false if it was not present.
    pub fn discard<Q>(&mut self, value: &Q) -> bool
    where
        T: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let Some(index) = self.positions.remove(value) else {
            return false;
        };
        let last = self.values.len() - 1;
        self.values.swap(index, last);
        self.values.pop();
        if index < last {
            self.positions.insert(self.values[index].clone(), index);
        }
        true
    }

    /// Chooses an element uniformly at random without removing it, or `None`
    /// if the set is empty.
    pub fn choice(&self) -> Option<&T> {
        if self.values.is_empty() {
            return None;
        }
        let index = rand::thread_rng().gen_range(0..self.values.len());
        Some(&self.values[index])
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.values.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_empty() {
        let shuffle: Shuffle<String> = Shuffle::new();
        assert_eq!(0, shuffle.len());
        assert!(shuffle.is_empty());
        assert!(shuffle.choice().is_none());
    }

    #[test]
    fn test_add_one() {
        let mut shuffle = Shuffle::new();
        assert!(shuffle.add("a".to_string()));
        assert!(!shuffle.add("a".to_string()));
        assert_eq!(1, shuffle.len());
        assert!(shuffle.contains("a"));
        assert_eq!(Some(&"a".to_string()), shuffle.choice());
    }

    #[test]
    fn test_add_many() {
        let mut shuffle = Shuffle::new();
        for name in ["a", "b", "c"] {
            shuffle.add(name.to_string());
        }
        assert_eq!(3, shuffle.len());
        for _ in 0..100 {
            let pick = shuffle.choice().unwrap();
            assert!(shuffle.contains(pick.as_str()));
        }
    }

    #[test]
    fn test_discard() {
        let mut shuffle = Shuffle::new();
        for name in ["a", "b", "c"] {
            shuffle.add(name.to_string());
        }
        assert!(shuffle.discard("b"));
        assert!(!shuffle.discard("b"));
        assert_eq!(2, shuffle.len());
        assert!(!shuffle.contains("b"));
        for _ in 0..100 {
            assert_ne!("b", shuffle.choice().unwrap().as_str());
        }
        assert!(shuffle.discard("c"));
        assert!(shuffle.discard("a"));
        assert!(shuffle.is_empty());
        assert!(shuffle.choice().is_none());
    }

    #[test]
    fn test_choice_is_uniform() {
        let mut shuffle = Shuffle::new();
        for name in ["a", "b", "c"] {
            shuffle.add(name.to_string());
        }
        let mut counts: HashMap<String, u32> = HashMap::new();
        const DRAWS: u32 = 6_000;
        for _ in 0..DRAWS {
            *counts.entry(shuffle.choice().unwrap().clone()).or_default() += 1;
        }
        // Each of the three elements should land close to DRAWS / 3; the
        // bounds are ~8 standard deviations wide, so a fair chooser fails
        // this with negligible probability.
        for (name, count) in counts {
            assert!(
                (1_700..=2_300).contains(&count),
                "element {name} drawn {count} times out of {DRAWS}"
            );
        }
    }
}
