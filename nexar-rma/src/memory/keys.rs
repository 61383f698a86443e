use crate::md::MdKey;
use crate::types::{MAX_MDS, MdIndex, MdMap};

/// Per-domain registration keys stored densely: the key for domain `i` lives
/// at slot `map.rank(i)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MdKeyArray {
    map: MdMap,
    keys: Vec<MdKey>,
}

impl MdKeyArray {
    pub fn new() -> Self {
        Self::default()
    }

    /// Domains currently holding a key.
    pub fn md_map(&self) -> MdMap {
        self.map
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn get(&self, md: MdIndex) -> Option<MdKey> {
        if self.map.contains(md) {
            Some(self.keys[self.map.rank(md)])
        } else {
            None
        }
    }

    /// Set the key for `md`, returning the key it replaced.
    pub fn insert(&mut self, md: MdIndex, key: MdKey) -> Option<MdKey> {
        assert!((md as usize) < MAX_MDS, "md {md} out of range");
        let slot = self.map.rank(md);
        if self.map.contains(md) {
            return Some(std::mem::replace(&mut self.keys[slot], key));
        }
        self.keys.insert(slot, key);
        self.map.insert(md);
        None
    }

    pub fn remove(&mut self, md: MdIndex) -> Option<MdKey> {
        if !self.map.contains(md) {
            return None;
        }
        let key = self.keys.remove(self.map.rank(md));
        self.map.remove(md);
        Some(key)
    }

    /// `(md, key)` pairs in ascending domain order.
    pub fn iter(&self) -> impl Iterator<Item = (MdIndex, MdKey)> + '_ {
        self.map.iter().zip(self.keys.iter().copied())
    }

    /// Remove every key, in ascending domain order.
    pub fn drain(&mut self) -> Vec<(MdIndex, MdKey)> {
        let out = self.iter().collect();
        self.map = MdMap::EMPTY;
        self.keys.clear();
        out
    }
}
