//! Trie nodes. Every operation copies only the path from the root to the
//! touched slot; sibling subtrees are shared by `Arc`.

use std::borrow::Borrow;
use std::hash::Hash;
use std::sync::Arc;

pub(crate) const BITS: u32 = 5;
const MASK: u64 = (1 << BITS) - 1;

pub(crate) enum Node<K, V> {
    Branch {
        bitmap: u32,
        children: Vec<Entry<K, V>>,
    },
    /// Keys whose full 64-bit hashes are identical.
    Collision { hash: u64, entries: Vec<(K, V)> },
}

pub(crate) enum Entry<K, V> {
    Leaf { hash: u64, key: K, value: V },
    Node(Arc<Node<K, V>>),
}

impl<K: Clone, V: Clone> Clone for Entry<K, V> {
    fn clone(&self) -> Self {
        match self {
            Entry::Leaf { hash, key, value } => Entry::Leaf {
                hash: *hash,
                key: key.clone(),
                value: value.clone(),
            },
            Entry::Node(node) => Entry::Node(Arc::clone(node)),
        }
    }
}

impl<K: Clone, V: Clone> Clone for Node<K, V> {
    fn clone(&self) -> Self {
        match self {
            Node::Branch { bitmap, children } => Node::Branch {
                bitmap: *bitmap,
                children: children.clone(),
            },
            Node::Collision { hash, entries } => Node::Collision {
                hash: *hash,
                entries: entries.clone(),
            },
        }
    }
}

fn fragment(hash: u64, shift: u32) -> u32 {
    if shift >= u64::BITS {
        return 0;
    }
    ((hash >> shift) & MASK) as u32
}

fn key_eq<K: Borrow<Q>, Q: Eq + ?Sized>(stored: &K, key: &Q) -> bool {
    <K as Borrow<Q>>::borrow(stored) == key
}

fn slot(bitmap: u32, bit: u32) -> usize {
    (bitmap & (bit - 1)).count_ones() as usize
}

impl<K, V> Node<K, V>
where
    K: Clone + Eq + Hash,
    V: Clone,
{
    pub(crate) fn single(hash: u64, key: K, value: V) -> Self {
        Node::Branch {
            bitmap: 1 << fragment(hash, 0),
            children: vec![Entry::Leaf { hash, key, value }],
        }
    }

    pub(crate) fn get<Q>(&self, shift: u32, hash: u64, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        match self {
            Node::Branch { bitmap, children } => {
                let bit = 1u32 << fragment(hash, shift);
                if bitmap & bit == 0 {
                    return None;
                }
                match &children[slot(*bitmap, bit)] {
                    Entry::Leaf {
                        hash: h,
                        key: k,
                        value,
                    } => (*h == hash && key_eq(k, key)).then_some(value),
                    Entry::Node(child) => child.get(shift + BITS, hash, key),
                }
            }
            Node::Collision { hash: h, entries } => {
                if *h != hash {
                    return None;
                }
                entries
                    .iter()
                    .find(|(k, _)| key_eq(k, key))
                    .map(|(_, v)| v)
            }
        }
    }

    /// Returns the rebuilt node and whether a new key was added.
    pub(crate) fn insert(&self, shift: u32, hash: u64, key: K, value: V) -> (Self, bool) {
        match self {
            Node::Branch { bitmap, children } => {
                let bit = 1u32 << fragment(hash, shift);
                let idx = slot(*bitmap, bit);
                let mut children = children.clone();
                if bitmap & bit == 0 {
                    children.insert(idx, Entry::Leaf { hash, key, value });
                    return (
                        Node::Branch {
                            bitmap: bitmap | bit,
                            children,
                        },
                        true,
                    );
                }
                let (entry, added) = match &children[idx] {
                    Entry::Leaf {
                        hash: h,
                        key: k,
                        value: v,
                    } => {
                        if *h == hash && *k == key {
                            (Entry::Leaf { hash, key, value }, false)
                        } else {
                            let merged =
                                merge(shift + BITS, (*h, k.clone(), v.clone()), (hash, key, value));
                            (Entry::Node(Arc::new(merged)), true)
                        }
                    }
                    Entry::Node(child) => {
                        let (node, added) = child.insert(shift + BITS, hash, key, value);
                        (Entry::Node(Arc::new(node)), added)
                    }
                };
                children[idx] = entry;
                (
                    Node::Branch {
                        bitmap: *bitmap,
                        children,
                    },
                    added,
                )
            }
            Node::Collision { hash: h, entries } => {
                if *h != hash {
                    // A different hash reached this depth: split into a branch
                    // holding the collision bucket, then insert normally.
                    let branch = Node::Branch {
                        bitmap: 1 << fragment(*h, shift),
                        children: vec![Entry::Node(Arc::new(self.clone()))],
                    };
                    return branch.insert(shift, hash, key, value);
                }
                let mut entries = entries.clone();
                let added = match entries.iter().position(|(k, _)| *k == key) {
                    Some(pos) => {
                        entries[pos] = (key, value);
                        false
                    }
                    None => {
                        entries.push((key, value));
                        true
                    }
                };
                (Node::Collision { hash: *h, entries }, added)
            }
        }
    }

    /// `None` when the key is absent, `Some(None)` when the subtree became
    /// empty, otherwise the entry that replaces this subtree in its parent.
    pub(crate) fn remove<Q>(&self, shift: u32, hash: u64, key: &Q) -> Option<Option<Entry<K, V>>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        match self {
            Node::Branch { bitmap, children } => {
                let bit = 1u32 << fragment(hash, shift);
                if bitmap & bit == 0 {
                    return None;
                }
                let idx = slot(*bitmap, bit);
                let replacement = match &children[idx] {
                    Entry::Leaf { hash: h, key: k, .. } => {
                        if *h != hash || !key_eq(k, key) {
                            return None;
                        }
                        None
                    }
                    Entry::Node(child) => child.remove(shift + BITS, hash, key)?,
                };

                let mut children = children.clone();
                let mut bitmap = *bitmap;
                match replacement {
                    Some(entry) => children[idx] = entry,
                    None => {
                        children.remove(idx);
                        bitmap &= !bit;
                    }
                }

                if children.is_empty() {
                    return Some(None);
                }
                if shift > 0 && children.len() == 1 && matches!(children[0], Entry::Leaf { .. }) {
                    return Some(children.pop());
                }
                Some(Some(Entry::Node(Arc::new(Node::Branch { bitmap, children }))))
            }
            Node::Collision { hash: h, entries } => {
                if *h != hash {
                    return None;
                }
                let pos = entries.iter().position(|(k, _)| key_eq(k, key))?;
                let mut entries = entries.clone();
                entries.remove(pos);
                if entries.len() == 1 {
                    let (key, value) = entries.remove(0);
                    return Some(Some(Entry::Leaf {
                        hash: *h,
                        key,
                        value,
                    }));
                }
                Some(Some(Entry::Node(Arc::new(Node::Collision {
                    hash: *h,
                    entries,
                }))))
            }
        }
    }
}

fn merge<K, V>(shift: u32, a: (u64, K, V), b: (u64, K, V)) -> Node<K, V> {
    if a.0 == b.0 || shift >= u64::BITS {
        return Node::Collision {
            hash: a.0,
            entries: vec![(a.1, a.2), (b.1, b.2)],
        };
    }
    let fa = fragment(a.0, shift);
    let fb = fragment(b.0, shift);
    if fa == fb {
        let child = merge(shift + BITS, a, b);
        return Node::Branch {
            bitmap: 1 << fa,
            children: vec![Entry::Node(Arc::new(child))],
        };
    }
    let leaf = |(hash, key, value): (u64, K, V)| Entry::Leaf { hash, key, value };
    let children = if fa < fb {
        vec![leaf(a), leaf(b)]
    } else {
        vec![leaf(b), leaf(a)]
    };
    Node::Branch {
        bitmap: (1 << fa) | (1 << fb),
        children,
    }
}
