//! In-memory model of a container hierarchy.
//!
//! Nodes live in an arena owned by [`Tree`] and refer to each other by
//! [`NodeId`]. The parent of a node is fixed when the node is created.

use crate::acl::{AclEntry, AclSet};
use crate::config::ContainerConfig;
use crate::error::ValidationError;
use std::collections::{HashSet, VecDeque};

#[cfg(test)]
mod tests;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(usize);

/// Root nodes map to a storage container, everything else to a directory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeKind {
    Root,
    Directory,
}

#[derive(Clone, Debug)]
pub struct Node {
    name: String,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    acls: AclSet,
}

impl Node {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    /// Children in declaration order.
    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn acls(&self) -> &AclSet {
        &self.acls
    }

    pub fn acls_mut(&mut self) -> &mut AclSet {
        &mut self.acls
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn kind(&self) -> NodeKind {
        if self.is_root() {
            NodeKind::Root
        } else {
            NodeKind::Directory
        }
    }
}

#[derive(Clone, Debug)]
pub struct Tree {
    nodes: Vec<Node>,
}

impl Tree {
    pub fn new(root_name: impl Into<String>) -> Self {
        Self {
            nodes: vec![Node {
                name: root_name.into(),
                parent: None,
                children: Vec::new(),
                acls: AclSet::new(),
            }],
        }
    }

    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Panics if `id` was not issued by this tree.
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0]
    }

    /// Create a node under `parent` and register it as the last child.
    pub fn add_child(&mut self, parent: NodeId, name: impl Into<String>) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            name: name.into(),
            parent: Some(parent),
            children: Vec::new(),
            acls: AclSet::new(),
        });
        self.nodes[parent.0].children.push(id);
        id
    }

    pub fn add_acl(&mut self, id: NodeId, entry: AclEntry) -> Option<AclEntry> {
        self.node_mut(id).acls.insert(entry)
    }

    pub fn name(&self, id: NodeId) -> &str {
        &self.node(id).name
    }

    pub fn is_root(&self, id: NodeId) -> bool {
        self.node(id).is_root()
    }

    pub fn kind(&self, id: NodeId) -> NodeKind {
        self.node(id).kind()
    }

    pub fn get_root(&self, id: NodeId) -> NodeId {
        let mut current = id;
        while let Some(parent) = self.node(current).parent {
            current = parent;
        }
        current
    }

    /// Names from just below the root down to `id`; the root's own name for
    /// the root.
    pub fn path(&self, id: NodeId) -> String {
        if self.is_root(id) {
            self.node(id).name.clone()
        } else {
            self.path_in_filesystem(id)
        }
    }

    /// Location of the node inside its container. Empty for the root, which
    /// is addressed as the container itself.
    pub fn path_in_filesystem(&self, id: NodeId) -> String {
        let mut segments = Vec::new();
        let mut current = id;
        while let Some(parent) = self.node(current).parent {
            segments.push(self.node(current).name.as_str());
            current = parent;
        }
        segments.reverse();
        segments.join("/")
    }

    /// `container/dir/sub`, for log and error messages.
    pub fn display_path(&self, id: NodeId) -> String {
        let root = self.name(self.get_root(id));
        let path = self.path_in_filesystem(id);
        if path.is_empty() {
            root.to_string()
        } else {
            format!("{}/{}", root, path)
        }
    }

    pub fn walk(&self, order: Order) -> Walk {
        Walk::new(self.root(), order)
    }

    /// Level order, children in declaration order.
    pub fn breadth_first(&self) -> Iter<'_> {
        Iter {
            tree: self,
            walk: self.walk(Order::BreadthFirst),
        }
    }

    /// Stack order: children are pushed in declaration order and popped in
    /// reverse, so the last-declared subtree is visited first.
    pub fn depth_first(&self) -> Iter<'_> {
        Iter {
            tree: self,
            walk: self.walk(Order::DepthFirst),
        }
    }

    /// Follow `path` (slash separated) down from `from`. An empty path
    /// returns `from`.
    pub fn find_by_relative_path(&self, from: NodeId, path: &str) -> Option<NodeId> {
        if path.is_empty() {
            return Some(from);
        }
        let mut current = from;
        for segment in path.split('/') {
            current = *self
                .node(current)
                .children
                .iter()
                .find(|child| self.node(**child).name == segment)?;
        }
        Some(current)
    }

    /// Document form of the subtree rooted at `id`.
    pub fn to_document(&self, id: NodeId) -> ContainerConfig {
        let node = self.node(id);
        ContainerConfig {
            name: node.name.clone(),
            acls: node.acls.iter().map(AclEntry::to_config).collect(),
            folders: node
                .children
                .iter()
                .map(|child| self.to_document(*child))
                .collect(),
        }
    }

    /// Build a tree from a container declaration.
    pub fn from_config(config: &ContainerConfig) -> Result<Self, ValidationError> {
        Self::from_config_at(config, "container")
    }

    pub(crate) fn from_config_at(
        config: &ContainerConfig,
        location: &str,
    ) -> Result<Self, ValidationError> {
        check_name(config, location)?;
        let mut tree = Tree::new(config.name.clone());
        let root = tree.root();
        tree.attach(root, config, location)?;
        Ok(tree)
    }

    fn attach(
        &mut self,
        id: NodeId,
        config: &ContainerConfig,
        location: &str,
    ) -> Result<(), ValidationError> {
        for (i, entry) in config.acls.iter().enumerate() {
            let entry = AclEntry::from_config(entry, &format!("{}.acls[{}]", location, i))?;
            self.add_acl(id, entry);
        }

        let mut seen = HashSet::new();
        for (i, folder) in config.folders.iter().enumerate() {
            let folder_location = format!("{}.folders[{}]", location, i);
            check_name(folder, &folder_location)?;
            if !seen.insert(folder.name.as_str()) {
                return Err(ValidationError::new(
                    folder_location,
                    "folder names must be unique among siblings",
                    folder.describe(),
                ));
            }
            let child = self.add_child(id, folder.name.clone());
            self.attach(child, folder, &folder_location)?;
        }
        Ok(())
    }
}

fn check_name(config: &ContainerConfig, location: &str) -> Result<(), ValidationError> {
    if config.name.is_empty() {
        return Err(ValidationError::new(
            location,
            "missing required key `name`",
            config.describe(),
        ));
    }
    if config.name.contains('/') {
        return Err(ValidationError::new(
            location,
            "`name` must be a single path segment",
            config.describe(),
        ));
    }
    Ok(())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Order {
    BreadthFirst,
    DepthFirst,
}

/// Traversal cursor that does not borrow the tree between steps, so the
/// caller may modify entry sets while walking.
#[derive(Clone, Debug)]
pub struct Walk {
    frontier: VecDeque<NodeId>,
    order: Order,
}

impl Walk {
    pub fn new(start: NodeId, order: Order) -> Self {
        Self {
            frontier: VecDeque::from([start]),
            order,
        }
    }

    pub fn next(&mut self, tree: &Tree) -> Option<NodeId> {
        let id = match self.order {
            Order::BreadthFirst => self.frontier.pop_front(),
            Order::DepthFirst => self.frontier.pop_back(),
        }?;
        self.frontier.extend(tree.node(id).children.iter().copied());
        Some(id)
    }
}

pub struct Iter<'a> {
    tree: &'a Tree,
    walk: Walk,
}

impl Iterator for Iter<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        self.walk.next(self.tree)
    }
}
