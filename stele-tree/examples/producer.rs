//! Builds a tree, then writes the root handle and the whole heap to a file.
//!
//! Run the consumer afterwards to restore and traverse it:
//!
//! ```text
//! cargo run --example producer -- /tmp/stele-tree.bin
//! cargo run --example consumer -- /tmp/stele-tree.bin
//! ```

use stele_heap::{Heap, Wire};
use stele_tree::Node;

fn main() {
    tracing_subscriber::fmt::init();

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/tmp/stele-tree.bin".to_string());

    let mut heap = Heap::<Node>::new(8).unwrap();
    let root = stele_tree::build(&mut heap, 0, 4).unwrap();

    let mut bytes = Vec::new();
    root.encode(&mut bytes);
    bytes.extend_from_slice(&heap.to_bytes());
    std::fs::write(&path, &bytes).unwrap();

    println!(
        "stored {} nodes (sum {}) in {} bytes at {path}",
        stele_tree::count(&heap, root),
        stele_tree::fold(&heap, root),
        bytes.len(),
    );
}
