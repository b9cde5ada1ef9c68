//! Crit-bit tree based dictionary supporting exact lookups, ordered
//! iteration and prefix queries.
//!
//! Every internal node selects one of its two children by a single bit of a
//! single key byte; the unique leaf reached by following those selections is
//! the closest existing key. Bytes past the end of a key read as zero, so
//! shorter keys sort before their extensions and the tree needs no terminator
//! bytes. Iteration yields entries in bitwise-lexicographic key order.

use std::mem;

/// Ordered map from byte-string keys to values.
#[derive(Debug)]
pub struct Dict<V> {
    root: Option<Box<Node<V>>>,
    len: usize,
}

impl<V> Default for Dict<V> {
    fn default() -> Self {
        Self {
            root: None,
            len: 0,
        }
    }
}

#[derive(Debug)]
enum Node<V> {
    Leaf {
        key: Box<[u8]>,
        value: V,
    },
    Inner {
        /// Byte index where the two subtrees first differ.
        byte: usize,
        /// Bit index within that byte, 7 = most significant.
        bit: u8,
        children: [Box<Node<V>>; 2],
    },
}

fn byte_at(key: &[u8], idx: usize) -> u8 {
    key.get(idx).copied().unwrap_or(0)
}

fn direction(key: &[u8], byte: usize, bit: u8) -> usize {
    usize::from((byte_at(key, byte) >> bit) & 1)
}

/// Two keys are the same entry when they agree byte-for-byte under
/// zero-extension (the discriminator never looks past that).
fn keys_equivalent(a: &[u8], b: &[u8]) -> bool {
    let n = a.len().max(b.len());
    (0..n).all(|i| byte_at(a, i) == byte_at(b, i))
}

/// First position where the keys differ, as `(byte index, bit index)`.
fn diverge(a: &[u8], b: &[u8]) -> Option<(usize, u8)> {
    let n = a.len().max(b.len());
    for i in 0..n {
        let diff = byte_at(a, i) ^ byte_at(b, i);
        if diff != 0 {
            return Some((i, diff.ilog2() as u8));
        }
    }
    None
}

impl<V> Dict<V> {
    #[must_use]
    pub fn new() -> Self {
        Self { root: None, len: 0 }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.root = None;
        self.len = 0;
    }

    pub fn get(&self, key: &[u8]) -> Option<&V> {
        let mut node = self.root.as_deref()?;
        loop {
            match node {
                Node::Inner {
                    byte,
                    bit,
                    children,
                } => node = &children[direction(key, *byte, *bit)],
                Node::Leaf { key: leaf, value } => {
                    return keys_equivalent(key, leaf).then_some(value)
                }
            }
        }
    }

    pub fn get_mut(&mut self, key: &[u8]) -> Option<&mut V> {
        let mut node = self.root.as_deref_mut()?;
        loop {
            match node {
                Node::Inner {
                    byte,
                    bit,
                    children,
                } => node = &mut children[direction(key, *byte, *bit)],
                Node::Leaf { key: leaf, value } => {
                    return keys_equivalent(key, leaf).then_some(value)
                }
            }
        }
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.get(key).is_some()
    }

    /// Insert a key/value pair. An existing key is overwritten and its old
    /// value returned; the size is unchanged in that case.
    pub fn insert(&mut self, key: &[u8], value: V) -> Option<V> {
        if self.root.is_none() {
            self.root = Some(Box::new(Node::Leaf {
                key: key.into(),
                value,
            }));
            self.len = 1;
            return None;
        }

        let divergence = {
            let mut node = self.root.as_deref()?;
            loop {
                match node {
                    Node::Inner {
                        byte,
                        bit,
                        children,
                    } => node = &children[direction(key, *byte, *bit)],
                    Node::Leaf { key: leaf, .. } => break diverge(key, leaf),
                }
            }
        };

        let Some((byte_idx, bit_idx)) = divergence else {
            // Same key: overwrite in place.
            let mut node = self.root.as_deref_mut()?;
            loop {
                match node {
                    Node::Inner {
                        byte,
                        bit,
                        children,
                    } => node = &mut children[direction(key, *byte, *bit)],
                    Node::Leaf { value: slot, .. } => return Some(mem::replace(slot, value)),
                }
            }
        };

        let new_dir = direction(key, byte_idx, bit_idx);
        let leaf = Box::new(Node::Leaf {
            key: key.into(),
            value,
        });
        let root = self.root.take()?;
        self.root = Some(splice(root, leaf, key, byte_idx, bit_idx, new_dir));
        self.len += 1;
        None
    }

    /// Remove a key, returning its value if it was present.
    pub fn remove(&mut self, key: &[u8]) -> Option<V> {
        let root = self.root.take()?;
        let (rest, removed) = remove_node(root, key);
        self.root = rest;
        if removed.is_some() {
            self.len -= 1;
        }
        removed
    }

    /// Does any key start with `prefix`?
    pub fn has_prefix(&self, prefix: &[u8]) -> bool {
        self.prefix_root(prefix).is_some()
    }

    /// Iterate all entries in bitwise-lexicographic key order.
    pub fn iter(&self) -> Iter<'_, V> {
        Iter {
            stack: self.root.as_deref().into_iter().collect(),
        }
    }

    /// Iterate exactly the entries whose keys start with `prefix`, in the
    /// same order as [`Dict::iter`].
    pub fn prefix_iter(&self, prefix: &[u8]) -> Iter<'_, V> {
        Iter {
            stack: self.prefix_root(prefix).into_iter().collect(),
        }
    }

    /// Smallest subtree containing every key with the given prefix.
    ///
    /// Walk toward the prefix taking direction 0 for bytes past its end,
    /// remembering the deepest child entered from a discriminator that is
    /// still inside the prefix; the terminal leaf then verifies the match.
    fn prefix_root(&self, prefix: &[u8]) -> Option<&Node<V>> {
        let mut node = self.root.as_deref()?;
        let mut top = node;
        loop {
            match node {
                Node::Inner {
                    byte,
                    bit,
                    children,
                } => {
                    let within = *byte < prefix.len();
                    node = &children[direction(prefix, *byte, *bit)];
                    if within {
                        top = node;
                    }
                }
                Node::Leaf { key, .. } => {
                    let matches =
                        key.len() >= prefix.len() && &key[..prefix.len()] == prefix;
                    return matches.then_some(top);
                }
            }
        }
    }
}

/// Wrap the subtree at the first node whose discriminator is strictly
/// shallower than `(byte_idx, bit_idx)` in a new internal node holding the
/// new leaf on side `new_dir`. Lower bit index means deeper: descend while
/// the node's discriminator byte is smaller, or equal with a higher bit.
fn splice<V>(
    node: Box<Node<V>>,
    leaf: Box<Node<V>>,
    key: &[u8],
    byte_idx: usize,
    bit_idx: u8,
    new_dir: usize,
) -> Box<Node<V>> {
    match *node {
        Node::Inner {
            byte,
            bit,
            children,
        } if byte < byte_idx || (byte == byte_idx && bit >= bit_idx) => {
            let dir = direction(key, byte, bit);
            let [c0, c1] = children;
            let children = if dir == 0 {
                [splice(c0, leaf, key, byte_idx, bit_idx, new_dir), c1]
            } else {
                [c0, splice(c1, leaf, key, byte_idx, bit_idx, new_dir)]
            };
            Box::new(Node::Inner {
                byte,
                bit,
                children,
            })
        }
        other => {
            let other = Box::new(other);
            let children = if new_dir == 0 {
                [leaf, other]
            } else {
                [other, leaf]
            };
            Box::new(Node::Inner {
                byte: byte_idx,
                bit: bit_idx,
                children,
            })
        }
    }
}

fn remove_node<V>(node: Box<Node<V>>, key: &[u8]) -> (Option<Box<Node<V>>>, Option<V>) {
    match *node {
        Node::Leaf { key: leaf, value } => {
            if keys_equivalent(key, &leaf) {
                (None, Some(value))
            } else {
                (Some(Box::new(Node::Leaf { key: leaf, value })), None)
            }
        }
        Node::Inner {
            byte,
            bit,
            children,
        } => {
            let dir = direction(key, byte, bit);
            let [c0, c1] = children;
            let (target, other) = if dir == 0 { (c0, c1) } else { (c1, c0) };
            let (rest, removed) = remove_node(target, key);
            match rest {
                // The removed leaf's sibling takes the parent's place.
                None => (Some(other), removed),
                Some(kept) => {
                    let children = if dir == 0 { [kept, other] } else { [other, kept] };
                    (
                        Some(Box::new(Node::Inner {
                            byte,
                            bit,
                            children,
                        })),
                        removed,
                    )
                }
            }
        }
    }
}

/// Ordered iterator over dictionary entries.
pub struct Iter<'a, V> {
    stack: Vec<&'a Node<V>>,
}

impl<'a, V> Iterator for Iter<'a, V> {
    type Item = (&'a [u8], &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.stack.pop()? {
                Node::Inner { children, .. } => {
                    self.stack.push(&children[1]);
                    self.stack.push(&children[0]);
                }
                Node::Leaf { key, value } => return Some((key, value)),
            }
        }
    }
}

impl<'a, V> IntoIterator for &'a Dict<V> {
    type Item = (&'a [u8], &'a V);
    type IntoIter = Iter<'a, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use rand::{seq::SliceRandom, Rng, SeedableRng};

    use super::Dict;

    const PAIRS: &[(&str, i32)] = &[
        ("app", 0),
        ("apple", 1),
        ("appleby", 2),
        ("apply", 3),
        ("ape", 4),
        ("bob", 5),
        ("bobby", 6),
        ("boy", 7),
        ("box", 8),
    ];

    const IN_ORDER: &[(&str, i32)] = &[
        ("ape", 4),
        ("app", 0),
        ("apple", 1),
        ("appleby", 2),
        ("apply", 3),
        ("bob", 5),
        ("bobby", 6),
        ("box", 8),
        ("boy", 7),
    ];

    fn sample() -> Dict<i32> {
        let mut dict = Dict::new();
        for (key, value) in PAIRS {
            assert!(dict.insert(key.as_bytes(), *value).is_none());
        }
        dict
    }

    #[test]
    fn basic_operations() {
        let mut dict = sample();
        assert_eq!(dict.len(), PAIRS.len());

        for (key, value) in PAIRS {
            assert_eq!(dict.get(key.as_bytes()), Some(value));
        }
        assert!(dict.contains_key(b"box"));
        assert!(dict.has_prefix(b"ap"));
        assert!(!dict.contains_key(b"nope"));
        assert!(!dict.has_prefix(b"nope"));

        // Overwriting keeps the size and returns the old value.
        assert_eq!(dict.insert(b"box", 10), Some(8));
        assert_eq!(dict.get(b"box"), Some(&10));
        assert_eq!(dict.len(), PAIRS.len());

        assert_eq!(dict.remove(b"apple"), Some(1));
        assert!(!dict.contains_key(b"apple"));
        assert_eq!(dict.remove(b"apple"), None);
        assert_eq!(dict.len(), PAIRS.len() - 1);

        dict.clear();
        assert_eq!(dict.len(), 0);
        assert!(!dict.contains_key(b"box"));
        assert!(!dict.has_prefix(b"ap"));
    }

    #[test]
    fn ordered_iteration() {
        let dict = sample();
        let got = dict
            .iter()
            .map(|(k, v)| (std::str::from_utf8(k).unwrap().to_owned(), *v))
            .collect::<Vec<_>>();
        let want = IN_ORDER
            .iter()
            .map(|(k, v)| ((*k).to_owned(), *v))
            .collect::<Vec<_>>();
        assert_eq!(got, want);
    }

    #[test]
    fn prefix_iteration() {
        let dict = sample();

        let keys = |prefix: &[u8]| {
            dict.prefix_iter(prefix)
                .map(|(k, _)| std::str::from_utf8(k).unwrap().to_owned())
                .collect::<Vec<_>>()
        };

        assert_eq!(keys(b"app"), ["app", "apple", "appleby", "apply"]);
        assert_eq!(keys(b"ap"), ["ape", "app", "apple", "appleby", "apply"]);
        assert_eq!(keys(b"bo"), ["bob", "bobby", "box", "boy"]);
        assert_eq!(keys(b"bobby"), ["bobby"]);
        assert!(keys(b"nope").is_empty());
        assert_eq!(keys(b"").len(), PAIRS.len());
    }

    #[test]
    fn empty_dict_empty_prefix() {
        let dict: Dict<i32> = Dict::new();
        assert_eq!(dict.len(), 0);
        assert!(dict.prefix_iter(b"").next().is_none());
    }

    #[test]
    fn random_round_trip() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);
        let mut keys = (0..200)
            .map(|_| {
                let len = rng.gen_range(1..16);
                (0..len).map(|_| rng.gen_range(b'a'..=b'z')).collect::<Vec<u8>>()
            })
            .collect::<Vec<_>>();
        keys.sort();
        keys.dedup();

        let mut shuffled = keys.clone();
        shuffled.shuffle(&mut rng);

        let mut dict = Dict::new();
        for (i, key) in shuffled.iter().enumerate() {
            dict.insert(key, i);
        }
        assert_eq!(dict.len(), keys.len());

        let iterated = dict.iter().map(|(k, _)| k.to_vec()).collect::<Vec<_>>();
        assert_eq!(iterated, keys);

        // Delete a random half and verify the remainder is still sorted.
        shuffled.shuffle(&mut rng);
        let (gone, kept) = shuffled.split_at(shuffled.len() / 2);
        for key in gone {
            assert!(dict.remove(key).is_some());
        }
        assert_eq!(dict.len(), kept.len());

        let mut kept = kept.to_vec();
        kept.sort();
        let iterated = dict.iter().map(|(k, _)| k.to_vec()).collect::<Vec<_>>();
        assert_eq!(iterated, kept);

        for key in gone {
            assert!(!dict.contains_key(key));
        }
    }

    #[test]
    fn prefix_query_matches_filter() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        let mut dict = Dict::new();
        let mut keys = Vec::new();
        for i in 0..300 {
            let len = rng.gen_range(1..8);
            let key = (0..len)
                .map(|_| rng.gen_range(b'a'..=b'c'))
                .collect::<Vec<u8>>();
            if dict.insert(&key, i).is_none() {
                keys.push(key);
            }
        }
        keys.sort();

        for prefix in [&b"a"[..], b"ab", b"abc", b"c", b"cc", b""] {
            let got = dict
                .prefix_iter(prefix)
                .map(|(k, _)| k.to_vec())
                .collect::<Vec<_>>();
            let want = keys
                .iter()
                .filter(|k| k.starts_with(prefix))
                .cloned()
                .collect::<Vec<_>>();
            assert_eq!(got, want, "prefix {prefix:?}");
        }
    }
}
