//! Structural dump of the locally materialized tree.
use crate::{
    bits::Depth,
    error::Error,
    node::{NodeBox, NodePtrRef},
    tree::Tree,
};
use std::io::Write;

impl Tree {
    /// Writes a textual rendering of the tree to `w`, descending at most
    /// `max_depth` levels (zero meaning unlimited). Only locally resident
    /// nodes are shown; unresolved subtrees print as their digest.
    pub fn dump_local(&self, w: &mut dyn Write, max_depth: Depth) -> Result<(), Error> {
        self.ensure_open()?;
        let root = self.cache.borrow().pending_root.clone();
        dump_ptr(w, root.as_ref(), 0, max_depth)?;
        Ok(())
    }
}

fn dump_ptr(
    w: &mut dyn Write,
    ptr: Option<&NodePtrRef>,
    depth: Depth,
    max_depth: Depth,
) -> Result<(), Error> {
    let indent = "  ".repeat(depth as usize);
    let Some(ptr) = ptr else {
        writeln!(w, "{indent}<nil>")?;
        return Ok(());
    };
    let ptr = ptr.borrow();
    let Some(ref node) = ptr.node else {
        writeln!(w, "{indent}* {} <unresolved>", ptr.hash)?;
        return Ok(());
    };
    match *node.borrow() {
        NodeBox::Leaf(ref leaf) => {
            writeln!(
                w,
                "{indent}- {:02x?} -> {:02x?} [v{}]",
                leaf.key,
                leaf.value.as_deref().unwrap_or(&[]),
                leaf.version,
            )?;
        }
        NodeBox::Internal(ref n) => {
            writeln!(
                w,
                "{indent}* label {:02x?} ({} bits) [v{}] {}",
                n.label, n.label_bit_length, n.version, ptr.hash,
            )?;
            if max_depth == 0 || depth < max_depth {
                dump_ptr(w, n.leaf_node.as_ref(), depth + 1, max_depth)?;
                dump_ptr(w, n.left.as_ref(), depth + 1, max_depth)?;
                dump_ptr(w, n.right.as_ref(), depth + 1, max_depth)?;
            }
        }
    }
    Ok(())
}
