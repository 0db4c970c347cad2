//! Arena-backed dependency tree
//!
//! The same module can appear at many tree positions, so nodes hold `Arc`
//! references into the module cache rather than owning records. Parent
//! links are plain indices into the arena: non-owning on purpose, they only
//! exist for error propagation and path reconstruction and must not keep
//! subtrees alive or form ownership cycles.

use std::sync::Arc;

use crate::cache::{ModuleFlag, ModuleInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

#[derive(Debug)]
pub struct DependencyNode {
    module: Arc<ModuleInfo>,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    depth: usize,
    /// Children are known to exist but have not been computed for this
    /// position yet, either because the module was already realized
    /// elsewhere or because a depth limit stopped the expansion
    unrealized: bool,
}

impl DependencyNode {
    pub fn module(&self) -> &Arc<ModuleInfo> {
        &self.module
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn has_unrealized_children(&self) -> bool {
        self.unrealized
    }
}

#[derive(Debug, Default)]
pub struct DependencyTree {
    nodes: Vec<DependencyNode>,
}

impl DependencyTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn root(&self) -> Option<NodeId> {
        (!self.nodes.is_empty()).then_some(NodeId(0))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> &DependencyNode {
        &self.nodes[id.0]
    }

    pub fn add_root(&mut self, module: Arc<ModuleInfo>) -> NodeId {
        debug_assert!(self.nodes.is_empty(), "tree already has a root");
        self.nodes.push(DependencyNode {
            module,
            parent: None,
            children: Vec::new(),
            depth: 0,
            unrealized: false,
        });
        NodeId(0)
    }

    pub fn add_child(&mut self, parent: NodeId, module: Arc<ModuleInfo>, unrealized: bool) -> NodeId {
        let id = NodeId(self.nodes.len());
        let depth = self.nodes[parent.0].depth + 1;
        self.nodes.push(DependencyNode {
            module,
            parent: Some(parent),
            children: Vec::new(),
            depth,
            unrealized,
        });
        self.nodes[parent.0].children.push(id);
        id
    }

    pub fn set_unrealized(&mut self, id: NodeId, unrealized: bool) {
        self.nodes[id.0].unrealized = unrealized;
    }

    /// Mark every ancestor of `id` as having a failing descendant
    ///
    /// The failing node itself is left untouched; its own flags already
    /// say what went wrong.
    pub fn propagate_child_error(&self, id: NodeId) {
        let mut current = self.nodes[id.0].parent;
        while let Some(ancestor) = current {
            let node = &self.nodes[ancestor.0];
            node.module.add_flags(ModuleFlag::CHILDREN_ERROR);
            current = node.parent;
        }
    }

    /// Preorder walk of the subtree rooted at `from`
    pub fn visit_depth_first(&self, from: NodeId, f: &mut impl FnMut(NodeId, &DependencyNode)) {
        let node = self.node(from);
        f(from, node);
        for &child in &node.children {
            self.visit_depth_first(child, f);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ModuleFlag;
    use crate::search::ModuleSearchStrategy;

    fn info(name: &str, flags: ModuleFlag) -> Arc<ModuleInfo> {
        Arc::new(ModuleInfo::new(
            name,
            ModuleSearchStrategy::ApplicationDirectory,
            None,
            None,
            flags,
        ))
    }

    #[test]
    fn errors_reach_every_ancestor_but_no_sibling() {
        let mut tree = DependencyTree::new();
        let root = tree.add_root(info("root.exe", ModuleFlag::empty()));
        let child = tree.add_child(root, info("child.dll", ModuleFlag::empty()), false);
        let sibling = tree.add_child(root, info("sibling.dll", ModuleFlag::empty()), false);
        let grandchild = tree.add_child(
            child,
            info("missing.dll", ModuleFlag::NOT_FOUND),
            false,
        );

        tree.propagate_child_error(grandchild);

        assert!(tree
            .node(child)
            .module()
            .flags()
            .contains(ModuleFlag::CHILDREN_ERROR));
        assert!(tree
            .node(root)
            .module()
            .flags()
            .contains(ModuleFlag::CHILDREN_ERROR));
        assert!(!tree
            .node(sibling)
            .module()
            .flags()
            .contains(ModuleFlag::CHILDREN_ERROR));
        // the failing node keeps only its own flags
        assert_eq!(
            tree.node(grandchild).module().flags(),
            ModuleFlag::NOT_FOUND
        );
    }

    #[test]
    fn depth_follows_the_parent_chain() {
        let mut tree = DependencyTree::new();
        let root = tree.add_root(info("root.exe", ModuleFlag::empty()));
        let child = tree.add_child(root, info("a.dll", ModuleFlag::empty()), true);
        let grandchild = tree.add_child(child, info("b.dll", ModuleFlag::empty()), false);

        assert_eq!(tree.node(root).depth(), 0);
        assert_eq!(tree.node(child).depth(), 1);
        assert_eq!(tree.node(grandchild).depth(), 2);
        assert_eq!(tree.node(grandchild).parent(), Some(child));
        assert!(tree.node(child).has_unrealized_children());

        tree.set_unrealized(child, false);
        assert!(!tree.node(child).has_unrealized_children());
    }

    #[test]
    fn depth_first_visit_linearizes_the_tree() {
        let mut tree = DependencyTree::new();
        let root = tree.add_root(info("root.exe", ModuleFlag::empty()));
        let a = tree.add_child(root, info("a.dll", ModuleFlag::empty()), false);
        tree.add_child(a, info("a1.dll", ModuleFlag::empty()), false);
        tree.add_child(root, info("b.dll", ModuleFlag::empty()), false);

        let mut names = Vec::new();
        tree.visit_depth_first(root, &mut |_, node| names.push(node.module().name.clone()));
        assert_eq!(names, ["root.exe", "a.dll", "a1.dll", "b.dll"]);
    }
}
