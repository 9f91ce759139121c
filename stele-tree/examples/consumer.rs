//! Restores the heap written by the producer and traverses the tree.

use stele_heap::{Handle, Heap, Wire};
use stele_tree::Node;

fn main() {
    tracing_subscriber::fmt::init();

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/tmp/stele-tree.bin".to_string());

    let bytes = std::fs::read(&path).unwrap();
    let root = Handle::<Node>::decode(&bytes).unwrap();
    let heap = Heap::<Node>::from_bytes(&bytes[8..]).unwrap();

    let root = heap.reloc(root);
    println!(
        "restored {} nodes (sum {})",
        stele_tree::count(&heap, root),
        stele_tree::fold(&heap, root),
    );
    print!("{}", stele_tree::render(&heap, root));
}
