use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Kind of namespace node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum NodeKind {
    File = 0,
    Directory = 1,
}

impl NodeKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::File),
            1 => Some(Self::Directory),
            _ => None,
        }
    }

    /// Human-readable label used in listings and metadata replies.
    pub fn label(self) -> &'static str {
        match self {
            Self::File => "File",
            Self::Directory => "Directory",
        }
    }
}

bitflags! {
    /// Access bits carried by every node.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Permissions: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
        const APPEND = 1 << 3;
    }
}

impl Default for Permissions {
    fn default() -> Self {
        Self::READ | Self::WRITE
    }
}

impl std::fmt::Display for Permissions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names = Vec::new();
        if self.contains(Self::READ) {
            names.push("READ");
        }
        if self.contains(Self::WRITE) {
            names.push("WRITE");
        }
        if self.contains(Self::EXECUTE) {
            names.push("EXECUTE");
        }
        if self.contains(Self::APPEND) {
            names.push("APPEND");
        }
        f.write_str(&names.join(" "))
    }
}

/// Arena handle for a node. Handles are only meaningful for the tree that
/// produced them and become stale once the node is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

/// A file or directory in a namespace tree.
#[derive(Debug, Clone)]
pub struct Node {
    pub name: String,
    pub kind: NodeKind,
    pub permissions: Permissions,
    /// Backing-store location. Only meaningful on the owning storage node;
    /// the naming server carries it as an opaque string.
    pub location: String,
    pub(crate) parent: Option<NodeId>,
    pub(crate) children: Option<NodeTable>,
}

impl Node {
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn is_dir(&self) -> bool {
        self.kind == NodeKind::Directory
    }

    pub fn children(&self) -> Option<&NodeTable> {
        self.children.as_ref()
    }
}

/// Number of hash buckets in every directory's child table.
pub const TABLE_SIZE: usize = 10;

/// A directory's children, bucketed by `bucket_of(name)`. Each bucket keeps
/// its chain in insertion order.
#[derive(Debug, Clone, Default)]
pub struct NodeTable {
    pub(crate) buckets: [Vec<NodeId>; TABLE_SIZE],
}

impl NodeTable {
    pub fn bucket(&self, index: usize) -> &[NodeId] {
        &self.buckets[index]
    }

    /// All children in bucket-index order, then chain order.
    pub fn iter(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.buckets.iter().flatten().copied()
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(Vec::is_empty)
    }
}

/// Bucket index for a sibling name.
pub fn bucket_of(name: &str) -> usize {
    let hash = name
        .bytes()
        .fold(0u32, |h, b| h.wrapping_mul(31).wrapping_add(b as u32));
    hash as usize % TABLE_SIZE
}
