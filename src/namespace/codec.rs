//! Bulk encoding of a whole namespace tree, sent once when a storage node
//! registers.
//!
//! The tree is flattened pre-order per bucket: for each directory table,
//! bucket 0's chain is emitted first, then bucket 1's and so on. Each node
//! record is immediately followed by its own table (if it has one) before the
//! chain continues, and every chain ends with [`TreeRecord::EndOfChain`]. The
//! outermost chain holds only the root. The record list travels as a single
//! postcard payload inside one frame, so a transfer is either complete or
//! rejected as a whole.

use serde::{Deserialize, Serialize};

use super::path;
use super::types::{bucket_of, NodeId, NodeKind, Permissions, TABLE_SIZE};
use super::NamespaceTree;
use crate::{Result, ShardError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TreeRecord {
    Node {
        name: String,
        kind: u8,
        permissions: u8,
        location: String,
        has_children: bool,
    },
    EndOfChain,
}

enum Step {
    Emit(NodeId),
    End,
}

/// Flatten a tree into its record sequence.
pub fn encode_records(tree: &NamespaceTree) -> Result<Vec<TreeRecord>> {
    let mut records = Vec::with_capacity(tree.len() * 2 + 1);
    let mut stack = vec![Step::End, Step::Emit(tree.root())];

    while let Some(step) = stack.pop() {
        let id = match step {
            Step::End => {
                records.push(TreeRecord::EndOfChain);
                continue;
            }
            Step::Emit(id) => id,
        };
        let node = tree.node(id)?;
        records.push(TreeRecord::Node {
            name: node.name.clone(),
            kind: node.kind as u8,
            permissions: node.permissions.bits(),
            location: node.location.clone(),
            has_children: node.children.is_some(),
        });
        if let Some(table) = node.children.as_ref() {
            for bucket in (0..TABLE_SIZE).rev() {
                stack.push(Step::End);
                stack.extend(table.bucket(bucket).iter().rev().map(|&c| Step::Emit(c)));
            }
        }
    }
    Ok(records)
}

/// Encode a tree into the bytes carried by a registration message.
pub fn encode_tree(tree: &NamespaceTree) -> Result<Vec<u8>> {
    Ok(postcard::to_stdvec(&encode_records(tree)?)?)
}

#[derive(Clone, Copy)]
struct Frame {
    parent: NodeId,
    bucket: usize,
}

fn malformed(reason: impl Into<String>) -> ShardError {
    ShardError::MalformedTree(reason.into())
}

fn node_fields(kind: u8, permissions: u8, has_children: bool) -> Result<(NodeKind, Permissions)> {
    let kind = NodeKind::from_u8(kind).ok_or_else(|| malformed(format!("unknown kind {kind}")))?;
    let permissions = Permissions::from_bits(permissions)
        .ok_or_else(|| malformed(format!("unknown permission bits {permissions:#x}")))?;
    if kind == NodeKind::File && has_children {
        return Err(malformed("file record claims children"));
    }
    Ok((kind, permissions))
}

/// Rebuild a tree from its record sequence. Any inconsistency rejects the
/// whole sequence; no partial tree is returned.
pub fn decode_records(records: Vec<TreeRecord>) -> Result<NamespaceTree> {
    let mut records = records.into_iter();

    let Some(TreeRecord::Node {
        name,
        kind,
        permissions,
        location,
        has_children,
    }) = records.next()
    else {
        return Err(malformed("missing root record"));
    };
    let (kind, permissions) = node_fields(kind, permissions, has_children)?;
    if kind != NodeKind::Directory {
        return Err(malformed("root is not a directory"));
    }
    let mut tree = NamespaceTree::with_root(&name, permissions, &location);

    let mut stack = Vec::new();
    if has_children {
        stack.push(Frame {
            parent: tree.root(),
            bucket: 0,
        });
    }

    while let Some(frame) = stack.last().copied() {
        let record = records
            .next()
            .ok_or_else(|| malformed("truncated record stream"))?;
        match record {
            TreeRecord::EndOfChain => {
                if frame.bucket + 1 == TABLE_SIZE {
                    stack.pop();
                } else if let Some(top) = stack.last_mut() {
                    top.bucket += 1;
                }
            }
            TreeRecord::Node {
                name,
                kind,
                permissions,
                location,
                has_children,
            } => {
                let (kind, permissions) = node_fields(kind, permissions, has_children)?;
                path::validate_name(&name).map_err(|_| malformed(format!("bad name {name:?}")))?;
                if bucket_of(&name) != frame.bucket {
                    return Err(malformed(format!(
                        "{name:?} found in bucket {}",
                        frame.bucket
                    )));
                }
                if tree.lookup_child(frame.parent, &name).is_some() {
                    return Err(malformed(format!("duplicate sibling {name:?}")));
                }
                let id = tree.attach(frame.parent, frame.bucket, name, kind, permissions, location)?;
                if has_children {
                    stack.push(Frame {
                        parent: id,
                        bucket: 0,
                    });
                }
            }
        }
    }

    match records.next() {
        Some(TreeRecord::EndOfChain) => {}
        Some(TreeRecord::Node { .. }) => return Err(malformed("more than one root")),
        None => return Err(malformed("root chain not terminated")),
    }
    if records.next().is_some() {
        return Err(malformed("trailing records after root chain"));
    }
    Ok(tree)
}

/// Decode the bytes of a registration message into a tree.
pub fn decode_tree(bytes: &[u8]) -> Result<NamespaceTree> {
    let records: Vec<TreeRecord> =
        postcard::from_bytes(bytes).map_err(|e| malformed(format!("undecodable payload: {e}")))?;
    decode_records(records)
}
