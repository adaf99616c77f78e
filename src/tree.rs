//! Arena-based layer hierarchy.
//!
//! The LayerTree stores every layer of the coordinating thread using a
//! sparse-set architecture with generational indices.
//!
//! ## Key Features
//!
//! - **Generational Indices**: LayerId contains index + generation, so a
//!   completion that outlives its layer addresses a dead slot and becomes a
//!   no-op instead of writing into whatever layer reused the slot.
//!
//! - **Dense Storage**: Nodes are stored contiguously; removal is a
//!   swap-remove with a sparse-map fixup.
//!
//! - **Auxiliary Attachments**: Each node can carry a transaction group.
//!   Drawing layers find their batching scope by walking ancestors for the
//!   nearest attachment, and memoize the result on their parent.
//!
//! - **Presented Contents**: Drawing layers keep their current bitmap on their
//!   node, together with a serial that increases on every assignment.

use std::cell::RefCell;
use std::marker::PhantomData;
use std::rc::Rc;

use crate::drawing_layer::{Contents, DrawingMode};
use crate::transaction::TransactionGroup;

/// Unique identifier for a layer in the tree.
///
/// Uses a generational index design:
/// - `index`: Position in the sparse array (reusable after removal)
/// - `generation`: Version counter that increments when a slot is reused
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct LayerId {
    index: u32,
    generation: u32,
}

impl LayerId {
    fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }
}

/// Entry in the sparse map, pointing to a dense array slot.
struct SparseEntry {
    dense_index: usize,
    generation: u32,
}

/// A node in the tree.
struct Node {
    parent: Option<LayerId>,
    children: Vec<LayerId>,
    /// Some for drawing layers, None for plain container layers
    drawing_mode: Option<DrawingMode>,
    /// Batching scope attached to this node
    transaction_group: Option<Rc<TransactionGroup>>,
    contents: Option<Contents>,
    contents_serial: u64,
    /// Back-pointer to sparse array index (for swap-remove fixup)
    sparse_index: u32,
}

/// Central storage for the layer hierarchy of one coordinating thread.
pub struct LayerTree {
    dense: Vec<Node>,
    sparse: Vec<Option<SparseEntry>>,
    /// Released sparse slots with the generation their next occupant gets
    free_indices: Vec<(u32, u32)>,
}

impl LayerTree {
    /// Create a new empty tree.
    pub fn new() -> Self {
        Self {
            dense: Vec::new(),
            sparse: Vec::new(),
            free_indices: Vec::new(),
        }
    }

    /// Register a layer and return its unique ID.
    ///
    /// `drawing_mode` is `Some` for drawing layers.
    pub fn register(&mut self, drawing_mode: Option<DrawingMode>) -> LayerId {
        // Reuse a freed slot (its generation was bumped on release), or allocate a new one
        let (sparse_index, generation) = if let Some(slot) = self.free_indices.pop() {
            slot
        } else {
            let idx = self.sparse.len() as u32;
            self.sparse.push(None);
            (idx, 0)
        };

        let dense_index = self.dense.len();
        self.dense.push(Node {
            parent: None,
            children: Vec::new(),
            drawing_mode,
            transaction_group: None,
            contents: None,
            contents_serial: 0,
            sparse_index,
        });
        self.sparse[sparse_index as usize] = Some(SparseEntry {
            dense_index,
            generation,
        });

        LayerId::new(sparse_index, generation)
    }

    /// Remove a layer from the tree.
    ///
    /// The layer is detached from its parent and its children become roots.
    pub fn unregister(&mut self, id: LayerId) {
        let Some(dense_index) = self.get_dense_index(id) else {
            return;
        };

        if let Some(parent_id) = self.dense[dense_index].parent {
            if let Some(parent_dense) = self.get_dense_index(parent_id) {
                self.dense[parent_dense].children.retain(|&c| c != id);
            }
        }
        for child in std::mem::take(&mut self.dense[dense_index].children) {
            if let Some(child_dense) = self.get_dense_index(child) {
                self.dense[child_dense].parent = None;
            }
        }

        let last_dense_index = self.dense.len() - 1;
        let removed_node = self.dense.swap_remove(dense_index);

        // Fix up the moved node's sparse entry
        if dense_index != last_dense_index {
            let moved_sparse_idx = self.dense[dense_index].sparse_index;
            if let Some(ref mut entry) = self.sparse[moved_sparse_idx as usize] {
                entry.dense_index = dense_index;
            }
        }

        self.sparse[id.index as usize] = None;
        self.free_indices
            .push((id.index, id.generation.wrapping_add(1)));

        drop(removed_node);
    }

    fn get_dense_index(&self, id: LayerId) -> Option<usize> {
        self.sparse
            .get(id.index as usize)
            .and_then(|e| e.as_ref())
            .filter(|e| e.generation == id.generation)
            .map(|e| e.dense_index)
    }

    fn node(&self, id: LayerId) -> Option<&Node> {
        self.get_dense_index(id).map(|idx| &self.dense[idx])
    }

    fn node_mut(&mut self, id: LayerId) -> Option<&mut Node> {
        self.get_dense_index(id).map(move |idx| &mut self.dense[idx])
    }

    /// Check if a layer is registered.
    pub fn contains(&self, id: LayerId) -> bool {
        self.get_dense_index(id).is_some()
    }

    /// Make `child` a sublayer of `parent`, detaching it from any previous
    /// parent.
    ///
    /// Returns false if either layer is unknown or the link would create a
    /// cycle.
    pub fn set_parent(&mut self, child: LayerId, parent: LayerId) -> bool {
        if !self.contains(child) || !self.contains(parent) {
            return false;
        }
        if child == parent || self.ancestors(parent).any(|a| a == child) {
            log::warn!("Refusing to parent {:?} under its own descendant {:?}", child, parent);
            return false;
        }

        self.remove_from_parent(child);
        if let Some(node) = self.node_mut(child) {
            node.parent = Some(parent);
        }
        if let Some(node) = self.node_mut(parent) {
            node.children.push(child);
        }
        true
    }

    /// Detach a layer from its parent.
    pub fn remove_from_parent(&mut self, child: LayerId) {
        let Some(parent) = self.node_mut(child).and_then(|node| node.parent.take()) else {
            return;
        };
        if let Some(node) = self.node_mut(parent) {
            node.children.retain(|&c| c != child);
        }
    }

    /// Get the parent of a layer.
    pub fn parent(&self, id: LayerId) -> Option<LayerId> {
        self.node(id)
            .and_then(|node| node.parent)
            .filter(|parent| self.contains(*parent))
    }

    /// Get the children of a layer.
    pub fn children(&self, id: LayerId) -> Vec<LayerId> {
        self.node(id)
            .map(|node| node.children.clone())
            .unwrap_or_default()
    }

    /// Iterate over the ancestors of a layer, nearest first.
    pub fn ancestors(&self, id: LayerId) -> Ancestors<'_> {
        Ancestors {
            tree: self,
            next: self.parent(id),
        }
    }

    /// Drawing mode of a drawing layer, None for plain layers.
    pub fn drawing_mode(&self, id: LayerId) -> Option<DrawingMode> {
        self.node(id).and_then(|node| node.drawing_mode)
    }

    pub fn set_drawing_mode(&mut self, id: LayerId, mode: DrawingMode) {
        if let Some(node) = self.node_mut(id) {
            if node.drawing_mode.is_some() {
                node.drawing_mode = Some(mode);
            }
        }
    }

    /// Mode of the nearest ancestor that is a drawing layer.
    pub fn nearest_drawing_ancestor_mode(&self, id: LayerId) -> Option<DrawingMode> {
        self.ancestors(id).find_map(|a| self.drawing_mode(a))
    }

    /// The transaction group attached directly to a layer.
    pub fn transaction_group(&self, id: LayerId) -> Option<Rc<TransactionGroup>> {
        self.node(id).and_then(|node| node.transaction_group.clone())
    }

    /// Attach (or detach, with None) a transaction group to a layer.
    pub fn set_transaction_group(&mut self, id: LayerId, group: Option<Rc<TransactionGroup>>) {
        if let Some(node) = self.node_mut(id) {
            node.transaction_group = group;
        }
    }

    /// Find the batching scope for a layer.
    ///
    /// Walks the ancestors for the nearest attached group. The result is
    /// memoized on the immediate parent so later lookups stop there. When no
    /// ancestor has a group the main group of the thread is attached to the
    /// parent, or to the layer itself if it is a root.
    pub fn resolve_transaction_group(&mut self, id: LayerId) -> Rc<TransactionGroup> {
        let parent = self.parent(id);
        let found = self
            .ancestors(id)
            .find_map(|a| self.transaction_group(a))
            .or_else(|| match parent {
                None => self.transaction_group(id),
                Some(_) => None,
            });

        let group = match found {
            Some(group) => group,
            None => {
                log::debug!("No transaction group above {:?}, using the main group", id);
                TransactionGroup::main()
            }
        };

        let target = parent.unwrap_or(id);
        if self.transaction_group(target).is_none() {
            self.set_transaction_group(target, Some(group.clone()));
        }
        group
    }

    /// Current contents of a layer.
    pub fn contents(&self, id: LayerId) -> Option<Contents> {
        self.node(id).and_then(|node| node.contents.clone())
    }

    /// Replace the contents of a layer. Returns false for unknown layers.
    pub fn set_contents(&mut self, id: LayerId, contents: Option<Contents>) -> bool {
        match self.node_mut(id) {
            Some(node) => {
                node.contents = contents;
                node.contents_serial += 1;
                true
            }
            None => false,
        }
    }

    /// Number of contents assignments made to a layer.
    pub fn contents_serial(&self, id: LayerId) -> u64 {
        self.node(id).map(|node| node.contents_serial).unwrap_or(0)
    }

    /// Get the number of registered layers.
    pub fn layer_count(&self) -> usize {
        self.dense.len()
    }
}

impl Default for LayerTree {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator over a layer's ancestors.
pub struct Ancestors<'a> {
    tree: &'a LayerTree,
    next: Option<LayerId>,
}

impl Iterator for Ancestors<'_> {
    type Item = LayerId;

    fn next(&mut self) -> Option<LayerId> {
        let current = self.next?;
        self.next = self.tree.parent(current);
        Some(current)
    }
}

thread_local! {
    static LAYER_TREE: RefCell<LayerTree> = RefCell::new(LayerTree::new());
}

/// Access the layer tree of the current thread.
pub fn with_layer_tree<F, R>(f: F) -> R
where
    F: FnOnce(&LayerTree) -> R,
{
    LAYER_TREE.with(|tree| f(&tree.borrow()))
}

/// Mutably access the layer tree of the current thread.
pub fn with_layer_tree_mut<F, R>(f: F) -> R
where
    F: FnOnce(&mut LayerTree) -> R,
{
    LAYER_TREE.with(|tree| f(&mut tree.borrow_mut()))
}

/// Unregister a layer, tolerating thread teardown.
pub(crate) fn release_layer(id: LayerId) {
    // Removing the node may drop the last reference to a transaction group
    // whose pending completions are dropped with it; none of them touch the
    // tree, so holding the borrow is fine.
    let _ = LAYER_TREE.try_with(|tree| {
        if let Ok(mut tree) = tree.try_borrow_mut() {
            tree.unregister(id);
        }
    });
}

/// Operations shared by every kind of layer handle.
pub trait AsLayer {
    fn layer_id(&self) -> LayerId;

    /// Append `sublayer` to this layer's children.
    fn add_sublayer(&self, sublayer: &dyn AsLayer) -> bool {
        let parent = self.layer_id();
        let child = sublayer.layer_id();
        with_layer_tree_mut(|tree| tree.set_parent(child, parent))
    }

    fn remove_from_superlayer(&self) {
        let id = self.layer_id();
        with_layer_tree_mut(|tree| tree.remove_from_parent(id));
    }

    fn superlayer(&self) -> Option<LayerId> {
        let id = self.layer_id();
        with_layer_tree(|tree| tree.parent(id))
    }

    fn sublayers(&self) -> Vec<LayerId> {
        let id = self.layer_id();
        with_layer_tree(|tree| tree.children(id))
    }

    /// Make `group` the batching scope for drawing layers below this one.
    fn set_transaction_group(&self, group: Option<Rc<TransactionGroup>>) {
        let id = self.layer_id();
        with_layer_tree_mut(|tree| tree.set_transaction_group(id, group));
    }

    fn transaction_group(&self) -> Option<Rc<TransactionGroup>> {
        let id = self.layer_id();
        with_layer_tree(|tree| tree.transaction_group(id))
    }
}

/// A plain container layer.
///
/// Container layers take part in the hierarchy and can carry a transaction
/// group, but draw nothing themselves.
pub struct Layer {
    id: LayerId,
    // The id is only meaningful in the tree of the creating thread
    _not_send: PhantomData<Rc<()>>,
}

impl Layer {
    pub fn new() -> Self {
        Self {
            id: with_layer_tree_mut(|tree| tree.register(None)),
            _not_send: PhantomData,
        }
    }
}

impl Default for Layer {
    fn default() -> Self {
        Self::new()
    }
}

impl AsLayer for Layer {
    fn layer_id(&self) -> LayerId {
        self.id
    }
}

impl Drop for Layer {
    fn drop(&mut self) {
        release_layer(self.id);
    }
}

/// Compile-time check that a type is not `Send`.
///
/// `<T as AmbiguousIfSend<_>>::check` only resolves when exactly one impl
/// applies, which is the case when `T` is not `Send`.
#[cfg(test)]
pub(crate) trait AmbiguousIfSend<A> {
    fn check() {}
}

#[cfg(test)]
impl<T: ?Sized> AmbiguousIfSend<()> for T {}

#[cfg(test)]
impl<T: ?Sized + Send> AmbiguousIfSend<u8> for T {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tree_register_unregister() {
        let mut tree = LayerTree::new();
        let id = tree.register(None);
        assert!(tree.contains(id));

        tree.unregister(id);
        assert!(!tree.contains(id));
    }

    #[test]
    fn test_tree_generational_index() {
        let mut tree = LayerTree::new();

        let id1 = tree.register(None);
        tree.unregister(id1);
        let id2 = tree.register(None);

        assert!(!tree.contains(id1));
        assert!(tree.contains(id2));
        assert_eq!(id1.index, id2.index);
        assert_ne!(id1.generation, id2.generation);
    }

    #[test]
    fn test_stale_id_cannot_write_contents() {
        let mut tree = LayerTree::new();
        let id1 = tree.register(Some(DrawingMode::Async));
        tree.unregister(id1);
        let id2 = tree.register(Some(DrawingMode::Async));

        let image = Contents::new(image::RgbaImage::new(1, 1));
        assert!(!tree.set_contents(id1, Some(image)));
        assert!(tree.contents(id2).is_none());
        assert_eq!(tree.contents_serial(id2), 0);
    }

    #[test]
    fn test_tree_parent_child() {
        let mut tree = LayerTree::new();
        let parent = tree.register(None);
        let child = tree.register(None);

        assert!(tree.set_parent(child, parent));
        assert_eq!(tree.parent(child), Some(parent));
        assert_eq!(tree.children(parent), vec![child]);
    }

    #[test]
    fn test_reparent_detaches_from_old_parent() {
        let mut tree = LayerTree::new();
        let a = tree.register(None);
        let b = tree.register(None);
        let child = tree.register(None);

        tree.set_parent(child, a);
        tree.set_parent(child, b);

        assert!(tree.children(a).is_empty());
        assert_eq!(tree.children(b), vec![child]);
    }

    #[test]
    fn test_cycles_are_rejected() {
        let mut tree = LayerTree::new();
        let root = tree.register(None);
        let child = tree.register(None);
        tree.set_parent(child, root);

        assert!(!tree.set_parent(root, child));
        assert!(!tree.set_parent(root, root));
        assert_eq!(tree.parent(root), None);
    }

    #[test]
    fn test_ancestors_nearest_first() {
        let mut tree = LayerTree::new();
        let root = tree.register(None);
        let mid = tree.register(None);
        let leaf = tree.register(None);
        tree.set_parent(mid, root);
        tree.set_parent(leaf, mid);

        assert_eq!(tree.ancestors(leaf).collect::<Vec<_>>(), vec![mid, root]);
        assert_eq!(tree.ancestors(root).count(), 0);
    }

    #[test]
    fn test_unregister_orphans_children() {
        let mut tree = LayerTree::new();
        let root = tree.register(None);
        let child = tree.register(None);
        tree.set_parent(child, root);

        tree.unregister(root);
        assert_eq!(tree.parent(child), None);
        assert_eq!(tree.ancestors(child).count(), 0);
    }

    #[test]
    fn test_swap_remove_fixup() {
        let mut tree = LayerTree::new();
        let id1 = tree.register(None);
        let id2 = tree.register(Some(DrawingMode::Sync));
        let id3 = tree.register(Some(DrawingMode::Async));

        tree.unregister(id1);

        assert!(!tree.contains(id1));
        assert_eq!(tree.drawing_mode(id2), Some(DrawingMode::Sync));
        assert_eq!(tree.drawing_mode(id3), Some(DrawingMode::Async));
        assert_eq!(tree.layer_count(), 2);
    }

    #[test]
    fn test_nearest_drawing_ancestor_skips_plain_layers() {
        let mut tree = LayerTree::new();
        let drawing = tree.register(Some(DrawingMode::Sync));
        let plain = tree.register(None);
        let leaf = tree.register(Some(DrawingMode::Auto));
        tree.set_parent(plain, drawing);
        tree.set_parent(leaf, plain);

        assert_eq!(
            tree.nearest_drawing_ancestor_mode(leaf),
            Some(DrawingMode::Sync)
        );
        assert_eq!(tree.nearest_drawing_ancestor_mode(drawing), None);
    }

    #[test]
    fn test_resolve_group_finds_ancestor_and_memoizes_on_parent() {
        let mut tree = LayerTree::new();
        let root = tree.register(None);
        let mid = tree.register(None);
        let leaf = tree.register(Some(DrawingMode::Async));
        tree.set_parent(mid, root);
        tree.set_parent(leaf, mid);

        let custom = Rc::new(TransactionGroup::new());
        tree.set_transaction_group(root, Some(custom.clone()));

        let resolved = tree.resolve_transaction_group(leaf);
        assert!(Rc::ptr_eq(&resolved, &custom));
        let cached = tree.transaction_group(mid).unwrap();
        assert!(Rc::ptr_eq(&cached, &custom));
        assert!(tree.transaction_group(leaf).is_none());
    }

    #[test]
    fn test_resolve_group_defaults_to_main_on_parent() {
        let mut tree = LayerTree::new();
        let root = tree.register(None);
        let leaf = tree.register(Some(DrawingMode::Async));
        tree.set_parent(leaf, root);

        let resolved = tree.resolve_transaction_group(leaf);
        assert!(Rc::ptr_eq(&resolved, &TransactionGroup::main()));
        assert!(tree.transaction_group(root).is_some());
    }

    #[test]
    fn test_resolve_group_for_root_caches_on_itself() {
        let mut tree = LayerTree::new();
        let root = tree.register(Some(DrawingMode::Async));

        let first = tree.resolve_transaction_group(root);
        assert!(tree.transaction_group(root).is_some());

        let custom = Rc::new(TransactionGroup::new());
        tree.set_transaction_group(root, Some(custom.clone()));
        let second = tree.resolve_transaction_group(root);

        assert!(Rc::ptr_eq(&first, &TransactionGroup::main()));
        assert!(Rc::ptr_eq(&second, &custom));
    }

    #[test]
    fn test_layer_handles_register_and_release() {
        let before = with_layer_tree(|tree| tree.layer_count());
        let parent = Layer::new();
        let child = Layer::new();
        assert!(parent.add_sublayer(&child));
        assert_eq!(child.superlayer(), Some(parent.layer_id()));
        assert_eq!(parent.sublayers(), vec![child.layer_id()]);

        child.remove_from_superlayer();
        assert!(parent.sublayers().is_empty());

        drop(parent);
        drop(child);
        assert_eq!(with_layer_tree(|tree| tree.layer_count()), before);
    }

    #[test]
    fn test_layer_handle_is_not_send() {
        let _ = <Layer as AmbiguousIfSend<_>>::check;
    }

    #[test]
    fn test_layers_of_other_threads_live_in_their_own_tree() {
        let keep = Layer::new();
        let child = Layer::new();
        keep.add_sublayer(&child);

        std::thread::spawn(|| {
            let other = Layer::new();
            drop(other);
        })
        .join()
        .unwrap();

        assert!(with_layer_tree(|tree| tree.contains(keep.layer_id())));
        assert_eq!(child.superlayer(), Some(keep.layer_id()));
    }
}
