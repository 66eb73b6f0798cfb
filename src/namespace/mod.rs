pub mod codec;
pub mod path;
pub mod types;

use crate::{Result, ShardError};
pub use types::{bucket_of, Node, NodeId, NodeKind, NodeTable, Permissions, TABLE_SIZE};

/// Hash-bucketed namespace tree stored in an arena.
///
/// The same structure is the authoritative namespace on a storage node and
/// the mirror of that namespace on the naming server. Parent links are
/// plain `NodeId` handles into the arena, never ownership edges.
#[derive(Debug, Clone)]
pub struct NamespaceTree {
    nodes: Vec<Option<Node>>,
    free: Vec<usize>,
    root: NodeId,
    len: usize,
}

/// Location of a child given its parent's location.
pub fn child_location(parent_location: &str, name: &str) -> String {
    if parent_location.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", parent_location.trim_end_matches('/'), name)
    }
}

impl NamespaceTree {
    /// Create a tree holding only a root directory.
    pub fn new(location: &str) -> Self {
        Self::with_root("/", Permissions::all() - Permissions::APPEND, location)
    }

    pub fn with_root(name: &str, permissions: Permissions, location: &str) -> Self {
        let root = Node {
            name: name.to_string(),
            kind: NodeKind::Directory,
            permissions,
            location: location.to_string(),
            parent: None,
            children: Some(NodeTable::default()),
        };
        Self {
            nodes: vec![Some(root)],
            free: Vec::new(),
            root: NodeId(0),
            len: 1,
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Number of live nodes, root included.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0).and_then(Option::as_ref)
    }

    pub fn node(&self, id: NodeId) -> Result<&Node> {
        self.get(id)
            .ok_or_else(|| ShardError::Other(format!("stale node handle {}", id.0)))
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        self.nodes
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .ok_or_else(|| ShardError::Other(format!("stale node handle {}", id.0)))
    }

    /// Find a direct child of `dir` by name. Returns `None` for files.
    pub fn lookup_child(&self, dir: NodeId, name: &str) -> Option<NodeId> {
        let table = self.get(dir)?.children.as_ref()?;
        table.buckets[bucket_of(name)]
            .iter()
            .copied()
            .find(|&id| self.get(id).is_some_and(|n| n.name == name))
    }

    /// Walk `path` from the root. Every intermediate segment must be a
    /// directory.
    pub fn resolve_path(&self, path: &str) -> Result<NodeId> {
        let mut current = self.root;
        for segment in path::segments(path)? {
            current = self
                .lookup_child(current, segment)
                .ok_or_else(|| ShardError::PathNotFound(path.to_string()))?;
        }
        Ok(current)
    }

    pub fn contains_path(&self, path: &str) -> bool {
        self.resolve_path(path).is_ok()
    }

    /// Absolute path of a node, rebuilt from its parent links.
    pub fn path_of(&self, id: NodeId) -> Result<String> {
        let mut names = Vec::new();
        let mut current = id;
        loop {
            let node = self.node(current)?;
            match node.parent {
                Some(parent) => {
                    names.push(node.name.as_str());
                    current = parent;
                }
                None => break,
            }
        }
        names.reverse();
        Ok(format!("/{}", names.join("/")))
    }

    fn alloc(&mut self, node: Node) -> NodeId {
        self.len += 1;
        match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = Some(node);
                NodeId(slot)
            }
            None => {
                self.nodes.push(Some(node));
                NodeId(self.nodes.len() - 1)
            }
        }
    }

    /// Check that `name` may be added under `parent`.
    fn check_insert(&self, parent: NodeId, name: &str) -> Result<()> {
        path::validate_name(name)?;
        let dir = self.node(parent)?;
        if !dir.is_dir() {
            return Err(ShardError::ParentNotDirectory(self.path_of(parent)?));
        }
        if self.lookup_child(parent, name).is_some() {
            return Err(ShardError::DuplicateName(path::join(
                &self.path_of(parent)?,
                name,
            )));
        }
        Ok(())
    }

    /// Append a node to the chain of `bucket` under `parent`. Callers have
    /// already validated the name.
    pub(crate) fn attach(
        &mut self,
        parent: NodeId,
        bucket: usize,
        name: String,
        kind: NodeKind,
        permissions: Permissions,
        location: String,
    ) -> Result<NodeId> {
        let node = Node {
            name,
            kind,
            permissions,
            location,
            parent: Some(parent),
            children: (kind == NodeKind::Directory).then(NodeTable::default),
        };
        let id = self.alloc(node);
        let table = self.node_mut(parent)?.children.as_mut().ok_or_else(|| {
            ShardError::ParentNotDirectory(format!("node {}", parent.0))
        })?;
        table.buckets[bucket].push(id);
        Ok(id)
    }

    /// Add a node with explicit permissions. Its location is derived from
    /// the parent's location.
    pub fn insert_node(
        &mut self,
        parent: NodeId,
        name: &str,
        kind: NodeKind,
        permissions: Permissions,
    ) -> Result<NodeId> {
        self.check_insert(parent, name)?;
        let location = child_location(&self.node(parent)?.location, name);
        self.attach(
            parent,
            bucket_of(name),
            name.to_string(),
            kind,
            permissions,
            location,
        )
    }

    /// Add an empty file or directory with default permissions (Read|Write).
    pub fn create_empty_node(
        &mut self,
        parent: NodeId,
        name: &str,
        kind: NodeKind,
    ) -> Result<NodeId> {
        self.insert_node(parent, name, kind, Permissions::default())
    }

    /// Nodes of the subtree rooted at `id`, parents before children,
    /// siblings in bucket order.
    pub fn pre_order(&self, id: NodeId) -> Result<Vec<NodeId>> {
        self.node(id)?;
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            out.push(current);
            if let Some(table) = self.node(current)?.children.as_ref() {
                let children: Vec<NodeId> = table.iter().collect();
                stack.extend(children.into_iter().rev());
            }
        }
        Ok(out)
    }

    /// Nodes of the subtree rooted at `id`, every child before its parent.
    pub fn post_order(&self, id: NodeId) -> Result<Vec<NodeId>> {
        let mut order = self.pre_order(id)?;
        order.reverse();
        Ok(order)
    }

    /// Remove a node and everything below it. Returns how many nodes were
    /// removed. The root cannot be deleted.
    pub fn delete_node(&mut self, id: NodeId) -> Result<usize> {
        let parent = self.node(id)?.parent.ok_or(ShardError::CannotDeleteRoot)?;
        let doomed = self.post_order(id)?;
        for victim in &doomed {
            self.nodes[victim.0] = None;
            self.free.push(victim.0);
        }
        self.len -= doomed.len();

        if let Some(table) = self.node_mut(parent)?.children.as_mut() {
            for chain in table.buckets.iter_mut() {
                chain.retain(|&child| child != id);
            }
        }
        Ok(doomed.len())
    }

    /// Detached copy of the subtree rooted at `id`. Locations are kept as
    /// they are in this tree.
    pub fn extract(&self, id: NodeId) -> Result<NamespaceTree> {
        let top = self.node(id)?;
        let mut out = NamespaceTree::with_root(&top.name, top.permissions, &top.location);
        if top.kind == NodeKind::File {
            out.nodes[0] = Some(Node {
                name: top.name.clone(),
                kind: NodeKind::File,
                permissions: top.permissions,
                location: top.location.clone(),
                parent: None,
                children: None,
            });
            return Ok(out);
        }

        let mut stack = vec![(id, out.root)];
        while let Some((src, dst)) = stack.pop() {
            let Some(table) = self.node(src)?.children.as_ref() else {
                continue;
            };
            for (bucket, chain) in table.buckets.iter().enumerate() {
                for &child in chain {
                    let node = self.node(child)?;
                    let copied = out.attach(
                        dst,
                        bucket,
                        node.name.clone(),
                        node.kind,
                        node.permissions,
                        node.location.clone(),
                    )?;
                    if node.is_dir() {
                        stack.push((child, copied));
                    }
                }
            }
        }
        Ok(out)
    }

    /// Insert a copy of `subtree` under `dest_parent` as `new_name`.
    /// Metadata only; locations are re-derived from the new parent.
    pub fn graft(
        &mut self,
        dest_parent: NodeId,
        new_name: &str,
        subtree: &NamespaceTree,
    ) -> Result<NodeId> {
        self.check_insert(dest_parent, new_name)?;
        let top = subtree.node(subtree.root)?;
        let new_top = self.insert_node(dest_parent, new_name, top.kind, top.permissions)?;

        let mut stack = vec![(subtree.root, new_top)];
        while let Some((src, dst)) = stack.pop() {
            let Some(table) = subtree.node(src)?.children.as_ref() else {
                continue;
            };
            for child in table.iter() {
                let node = subtree.node(child)?;
                let copied = self.insert_node(dst, &node.name, node.kind, node.permissions)?;
                if node.is_dir() {
                    stack.push((child, copied));
                }
            }
        }
        Ok(new_top)
    }

    /// Structural copy of `source` into `dest_parent` under `new_name`.
    /// Byte content is not touched.
    pub fn copy_subtree(
        &mut self,
        source: NodeId,
        dest_parent: NodeId,
        new_name: &str,
    ) -> Result<NodeId> {
        let snapshot = self.extract(source)?;
        self.graft(dest_parent, new_name, &snapshot)
    }

    /// Every node under `id` (inclusive) as (absolute path, kind), pre-order.
    pub fn list(&self, id: NodeId) -> Result<Vec<(String, NodeKind)>> {
        let mut out = Vec::new();
        let mut stack = vec![(id, self.path_of(id)?)];
        while let Some((current, current_path)) = stack.pop() {
            let node = self.node(current)?;
            if let Some(table) = node.children.as_ref() {
                let children: Vec<NodeId> = table.iter().collect();
                for child in children.into_iter().rev() {
                    let name = &self.node(child)?.name;
                    stack.push((child, path::join(&current_path, name)));
                }
            }
            out.push((current_path, node.kind));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> NamespaceTree {
        let mut tree = NamespaceTree::new("/srv/data");
        let home = tree
            .create_empty_node(tree.root(), "home", NodeKind::Directory)
            .unwrap();
        tree.create_empty_node(home, "a.txt", NodeKind::File).unwrap();
        let docs = tree
            .create_empty_node(home, "docs", NodeKind::Directory)
            .unwrap();
        tree.create_empty_node(docs, "b.txt", NodeKind::File).unwrap();
        tree
    }

    #[test]
    fn test_root_resolves() {
        let tree = NamespaceTree::new("/srv");
        assert_eq!(tree.resolve_path("/").unwrap(), tree.root());
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_create_then_resolve() {
        let tree = sample();
        let id = tree.resolve_path("/home/docs/b.txt").unwrap();
        let node = tree.node(id).unwrap();
        assert_eq!(node.name, "b.txt");
        assert_eq!(node.kind, NodeKind::File);
        assert_eq!(node.permissions, Permissions::READ | Permissions::WRITE);
        assert_eq!(node.location, "/srv/data/home/docs/b.txt");
        assert_eq!(tree.path_of(id).unwrap(), "/home/docs/b.txt");
        assert!(tree.children_have_parent_links());
    }

    #[test]
    fn test_missing_segment_and_file_intermediate() {
        let tree = sample();
        assert!(matches!(
            tree.resolve_path("/home/missing"),
            Err(ShardError::PathNotFound(_))
        ));
        assert!(matches!(
            tree.resolve_path("/home/a.txt/inner"),
            Err(ShardError::PathNotFound(_))
        ));
        assert!(matches!(
            tree.resolve_path("home"),
            Err(ShardError::InvalidPathFormat(_))
        ));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut tree = sample();
        let home = tree.resolve_path("/home").unwrap();
        let before = tree.node(home).unwrap().children().unwrap().len();
        let err = tree
            .create_empty_node(home, "a.txt", NodeKind::Directory)
            .unwrap_err();
        assert!(matches!(err, ShardError::DuplicateName(_)));
        assert_eq!(tree.node(home).unwrap().children().unwrap().len(), before);
    }

    #[test]
    fn test_create_under_file_rejected() {
        let mut tree = sample();
        let file = tree.resolve_path("/home/a.txt").unwrap();
        assert!(matches!(
            tree.create_empty_node(file, "x", NodeKind::File),
            Err(ShardError::ParentNotDirectory(_))
        ));
    }

    #[test]
    fn test_delete_directory_removes_descendants() {
        let mut tree = sample();
        let docs = tree.resolve_path("/home/docs").unwrap();
        assert_eq!(tree.delete_node(docs).unwrap(), 2);
        assert!(tree.resolve_path("/home/docs").is_err());
        assert!(tree.resolve_path("/home/docs/b.txt").is_err());
        assert!(tree.resolve_path("/home/a.txt").is_ok());
        assert_eq!(tree.len(), 3);

        // Freed slots are reused.
        let home = tree.resolve_path("/home").unwrap();
        tree.create_empty_node(home, "c.txt", NodeKind::File).unwrap();
        assert_eq!(tree.len(), 4);
        assert!(tree.resolve_path("/home/c.txt").is_ok());
    }

    #[test]
    fn test_delete_root_rejected() {
        let mut tree = sample();
        assert!(matches!(
            tree.delete_node(tree.root()),
            Err(ShardError::CannotDeleteRoot)
        ));
    }

    #[test]
    fn test_copy_subtree() {
        let mut tree = sample();
        let docs = tree.resolve_path("/home/docs").unwrap();
        let root = tree.root();
        tree.copy_subtree(docs, root, "backup").unwrap();

        let copied = tree.resolve_path("/backup/b.txt").unwrap();
        assert_eq!(tree.node(copied).unwrap().location, "/srv/data/backup/b.txt");
        // Source untouched.
        assert!(tree.resolve_path("/home/docs/b.txt").is_ok());
    }

    #[test]
    fn test_copy_into_own_subtree_terminates() {
        let mut tree = sample();
        let home = tree.resolve_path("/home").unwrap();
        let docs = tree.resolve_path("/home/docs").unwrap();
        tree.copy_subtree(home, docs, "again").unwrap();
        assert!(tree.resolve_path("/home/docs/again/docs/b.txt").is_ok());
        assert!(tree.resolve_path("/home/docs/again/docs/again").is_err());
    }

    #[test]
    fn test_list_is_pre_order() {
        let tree = sample();
        let home = tree.resolve_path("/home").unwrap();
        let listing = tree.list(home).unwrap();
        assert_eq!(listing[0], ("/home".to_string(), NodeKind::Directory));
        assert_eq!(listing.len(), 4);
        let docs_pos = listing.iter().position(|(p, _)| p == "/home/docs").unwrap();
        let b_pos = listing
            .iter()
            .position(|(p, _)| p == "/home/docs/b.txt")
            .unwrap();
        assert!(docs_pos < b_pos);
    }

    impl NamespaceTree {
        fn children_have_parent_links(&self) -> bool {
            self.pre_order(self.root()).unwrap().into_iter().all(|id| {
                self.node(id)
                    .unwrap()
                    .children()
                    .map(|t| t.iter().all(|c| self.node(c).unwrap().parent() == Some(id)))
                    .unwrap_or(true)
            })
        }
    }
}
