//! Least-recently-inserted replacement set: a doubly-linked list threaded
//! through an arena of nodes, with an extendible-hash side index for O(1)
//! erase. The list head is the next victim; fresh and refreshed values go to
//! the tail.

use crate::extendible_hash::{Directory, Key, FNV1};
use crate::sync::Mutex;

const NIL: usize = usize::MAX;

/// Bucket capacity for the value -> node side index.
const INDEX_BUCKET_SIZE: usize = 32;

struct Node<T> {
    value: T,
    prev: usize,
    next: usize,
}

struct LruInner<T> {
    nodes: Vec<Node<T>>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
    index: Directory<T, usize, FNV1>,
}

pub struct LruReplacer<T: Key> {
    inner: Mutex<LruInner<T>>,
}

impl<T: Key> Default for LruReplacer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Key> LruReplacer<T> {
    pub fn new() -> Self {
        LruReplacer {
            inner: Mutex::new(LruInner {
                nodes: Vec::new(),
                free: Vec::new(),
                head: NIL,
                tail: NIL,
                index: Directory::new(INDEX_BUCKET_SIZE, FNV1),
            }),
        }
    }

    /// Add `value` as the most recently inserted element. A value already
    /// present is refreshed: unlinked and re-linked at the tail.
    pub fn insert(&self, value: T) {
        let mut inner = self.inner.lock().unwrap();
        match inner.index.find(value) {
            Some(n) => {
                inner.unlink(n);
                inner.push_tail(n);
            }
            None => {
                let n = inner.alloc(value);
                inner.push_tail(n);
                inner.index.insert(value, n);
            }
        }
    }

    /// Remove and return the least recently inserted element, or `None` if
    /// the set is empty.
    pub fn victim(&self) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        if inner.head == NIL {
            return None;
        }
        let n = inner.head;
        let value = inner.nodes[n].value;
        inner.unlink(n);
        inner.free.push(n);
        inner.index.remove(value);
        Some(value)
    }

    /// Remove `value` if present.
    pub fn erase(&self, value: T) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.index.find(value) {
            Some(n) => {
                inner.unlink(n);
                inner.free.push(n);
                inner.index.remove(value);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Key> LruInner<T> {
    fn alloc(&mut self, value: T) -> usize {
        match self.free.pop() {
            Some(n) => {
                self.nodes[n].value = value;
                n
            }
            None => {
                self.nodes.push(Node {
                    value,
                    prev: NIL,
                    next: NIL,
                });
                self.nodes.len() - 1
            }
        }
    }

    fn unlink(&mut self, n: usize) {
        let Node { prev, next, .. } = self.nodes[n];
        if prev == NIL {
            self.head = next;
        } else {
            self.nodes[prev].next = next;
        }
        if next == NIL {
            self.tail = prev;
        } else {
            self.nodes[next].prev = prev;
        }
    }

    fn push_tail(&mut self, n: usize) {
        self.nodes[n].prev = self.tail;
        self.nodes[n].next = NIL;
        if self.tail == NIL {
            self.head = n;
        } else {
            self.nodes[self.tail].next = n;
        }
        self.tail = n;
    }
}
