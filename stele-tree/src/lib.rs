//! Handle-linked binary tree on a [`stele_heap::Heap`].
//!
//! The canonical consumer of the heap's relocation protocol: nodes link to
//! their children through handles rather than references, so a whole tree
//! serializes with its heap and comes back traversable in another process.
//! Traversals thread the owning heap explicitly - nothing here touches
//! process-wide state.

#![warn(missing_docs)]

use std::fmt::Write as _;

use stele_heap::{Handle, Heap, HeapError, Relocate, Relocator, Wire, WireError};

/// Handle to a tree node.
pub type NodeHandle = Handle<Node>;

/// A binary tree node; children are null handles where absent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Node {
    /// Payload value.
    pub value: i64,
    /// Left child, or null.
    pub left: NodeHandle,
    /// Right child, or null.
    pub right: NodeHandle,
}

impl Relocate for Node {
    fn relocate(&mut self, reloc: &Relocator<Self>) {
        self.left = reloc.reloc(self.left);
        self.right = reloc.reloc(self.right);
    }
}

impl Wire for Node {
    const WIDTH: usize = 8 + 8 + 8;

    fn encode(&self, out: &mut Vec<u8>) {
        self.value.encode(out);
        self.left.encode(out);
        self.right.encode(out);
    }

    fn decode(buf: &[u8]) -> Result<Self, WireError> {
        Ok(Node {
            value: i64::decode(buf)?,
            left: NodeHandle::decode(&buf[8..])?,
            right: NodeHandle::decode(&buf[16..])?,
        })
    }
}

/// Builds a complete tree of the given depth rooted at `value`.
///
/// Children carry `2v - 1` and `2v + 1`; a depth of `d` yields
/// `2^(d+1) - 1` nodes.
pub fn build(heap: &mut Heap<Node>, value: i64, depth: u32) -> Result<NodeHandle, HeapError> {
    let node = heap.insert(Node {
        value,
        ..Node::default()
    })?;

    if depth > 0 {
        let left = build(heap, 2 * value - 1, depth - 1)?;
        let right = build(heap, 2 * value + 1, depth - 1)?;
        let slot = heap.get_mut(node).expect("freshly inserted node");
        slot.left = left;
        slot.right = right;
    }

    Ok(node)
}

/// Frees the subtree rooted at `handle`; null handles are no-ops.
pub fn free(heap: &mut Heap<Node>, handle: NodeHandle) {
    let Some(node) = heap.get(handle).copied() else {
        return;
    };
    free(heap, node.left);
    free(heap, node.right);
    heap.free(handle);
}

/// Sums every value in the subtree rooted at `handle`.
pub fn fold(heap: &Heap<Node>, handle: NodeHandle) -> i64 {
    match heap.get(handle) {
        None => 0,
        Some(node) => node.value + fold(heap, node.left) + fold(heap, node.right),
    }
}

/// Counts the nodes in the subtree rooted at `handle`.
pub fn count(heap: &Heap<Node>, handle: NodeHandle) -> usize {
    match heap.get(handle) {
        None => 0,
        Some(node) => 1 + count(heap, node.left) + count(heap, node.right),
    }
}

/// Renders the subtree in-order, one value per line, indented by depth.
pub fn render(heap: &Heap<Node>, handle: NodeHandle) -> String {
    let mut out = String::new();
    render_into(&mut out, heap, handle, 0);
    out
}

fn render_into(out: &mut String, heap: &Heap<Node>, handle: NodeHandle, depth: usize) {
    let Some(node) = heap.get(handle) else {
        return;
    };
    let (left, right, value) = (node.left, node.right, node.value);

    render_into(out, heap, left, depth + 1);
    let _ = writeln!(out, "{:indent$}{value:4}", "", indent = depth * 4);
    render_into(out, heap, right, depth + 1);
}
