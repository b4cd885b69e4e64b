//! Arena-backed recency list
//!
//! Values live in a slot arena addressed by [`Handle`]s. Any value may be
//! linked into a doubly linked recency chain (head = most recently used) or
//! stay detached, which is how in-flight entries are kept out of eviction.
//! Move-to-front, unlink and remove are O(1).

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct Handle(usize);

#[derive(Debug)]
struct Node<T> {
    value: T,
    prev: Option<Handle>,
    next: Option<Handle>,
    linked: bool,
}

#[derive(Debug)]
pub(crate) struct RecencyList<T> {
    nodes: Vec<Option<Node<T>>>,
    free: Vec<usize>,
    head: Option<Handle>,
    tail: Option<Handle>,
    linked: usize,
}

impl<T> RecencyList<T> {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            linked: 0,
        }
    }

    /// Store a value without linking it into the chain
    pub fn insert(&mut self, value: T) -> Handle {
        let node = Node {
            value,
            prev: None,
            next: None,
            linked: false,
        };
        match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = Some(node);
                Handle(idx)
            }
            None => {
                self.nodes.push(Some(node));
                Handle(self.nodes.len() - 1)
            }
        }
    }

    pub fn remove(&mut self, handle: Handle) -> Option<T> {
        self.unlink(handle);
        let node = self.nodes.get_mut(handle.0)?.take()?;
        self.free.push(handle.0);
        Some(node.value)
    }

    pub fn get(&self, handle: Handle) -> Option<&T> {
        self.node(handle).map(|n| &n.value)
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        self.nodes
            .get_mut(handle.0)
            .and_then(|n| n.as_mut())
            .map(|n| &mut n.value)
    }

    /// Link at the head, moving the value there if it is already linked
    pub fn move_to_front(&mut self, handle: Handle) {
        if self.node(handle).is_none() || self.head == Some(handle) {
            return;
        }
        self.unlink(handle);

        let old_head = self.head;
        if let Some(node) = self.node_mut(handle) {
            node.prev = None;
            node.next = old_head;
            node.linked = true;
        }
        match old_head {
            Some(h) => {
                if let Some(node) = self.node_mut(h) {
                    node.prev = Some(handle);
                }
            }
            None => self.tail = Some(handle),
        }
        self.head = Some(handle);
        self.linked += 1;
    }

    /// Detach from the chain; the value stays in the arena
    pub fn unlink(&mut self, handle: Handle) {
        let (prev, next) = match self.node(handle) {
            Some(node) if node.linked => (node.prev, node.next),
            _ => return,
        };

        match prev {
            Some(p) => {
                if let Some(node) = self.node_mut(p) {
                    node.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(n) => {
                if let Some(node) = self.node_mut(n) {
                    node.prev = prev;
                }
            }
            None => self.tail = prev,
        }

        if let Some(node) = self.node_mut(handle) {
            node.prev = None;
            node.next = None;
            node.linked = false;
        }
        self.linked -= 1;
    }

    /// Least recently used linked value
    pub fn back(&self) -> Option<Handle> {
        self.tail
    }

    /// Number of linked values
    pub fn len(&self) -> usize {
        self.linked
    }

    /// Linked values from most to least recently used
    pub fn iter(&self) -> impl Iterator<Item = (Handle, &T)> + '_ {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            let handle = cursor?;
            let node = self.node(handle)?;
            cursor = node.next;
            Some((handle, &node.value))
        })
    }

    /// Every stored value, linked or not, in arena order
    pub fn iter_all(&self) -> impl Iterator<Item = (Handle, &T)> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(idx, n)| n.as_ref().map(|n| (Handle(idx), &n.value)))
    }

    fn node(&self, handle: Handle) -> Option<&Node<T>> {
        self.nodes.get(handle.0).and_then(|n| n.as_ref())
    }

    fn node_mut(&mut self, handle: Handle) -> Option<&mut Node<T>> {
        self.nodes.get_mut(handle.0).and_then(|n| n.as_mut())
    }
}
