use std::slice;

use crate::node::{Entry, Node};

/// Depth-first iterator over `(key, value)` pairs. Order is unspecified but
/// stable for a given map version.
pub struct Iter<'a, K, V> {
    stack: Vec<slice::Iter<'a, Entry<K, V>>>,
    bucket: Option<slice::Iter<'a, (K, V)>>,
    remaining: usize,
}

impl<'a, K, V> Iter<'a, K, V> {
    pub(crate) fn new(root: Option<&'a Node<K, V>>, len: usize) -> Self {
        let mut iter = Self {
            stack: Vec::new(),
            bucket: None,
            remaining: len,
        };
        if let Some(node) = root {
            iter.descend(node);
        }
        iter
    }

    fn descend(&mut self, node: &'a Node<K, V>) {
        match node {
            Node::Branch { children, .. } => self.stack.push(children.iter()),
            Node::Collision { entries, .. } => self.bucket = Some(entries.iter()),
        }
    }
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(bucket) = self.bucket.as_mut() {
                if let Some((k, v)) = bucket.next() {
                    self.remaining -= 1;
                    return Some((k, v));
                }
                self.bucket = None;
            }
            let top = self.stack.last_mut()?;
            match top.next() {
                Some(Entry::Leaf { key, value, .. }) => {
                    self.remaining -= 1;
                    return Some((key, value));
                }
                Some(Entry::Node(node)) => self.descend(node),
                None => {
                    self.stack.pop();
                }
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<K, V> ExactSizeIterator for Iter<'_, K, V> {}

pub struct Keys<'a, K, V> {
    inner: Iter<'a, K, V>,
}

impl<'a, K, V> Keys<'a, K, V> {
    pub(crate) fn new(inner: Iter<'a, K, V>) -> Self {
        Self { inner }
    }
}

impl<'a, K, V> Iterator for Keys<'a, K, V> {
    type Item = &'a K;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|(k, _)| k)
    }
}

pub struct Values<'a, K, V> {
    inner: Iter<'a, K, V>,
}

impl<'a, K, V> Values<'a, K, V> {
    pub(crate) fn new(inner: Iter<'a, K, V>) -> Self {
        Self { inner }
    }
}

impl<'a, K, V> Iterator for Values<'a, K, V> {
    type Item = &'a V;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|(_, v)| v)
    }
}
