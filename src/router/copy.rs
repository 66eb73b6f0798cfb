use std::sync::Arc;

use tracing::{info, warn};

use crate::namespace::path;
use crate::net::protocol::{ControlReply, ControlRequest};
use crate::registry::StorageServerRecord;
use crate::{Result, ShardError};

/// Rendezvous for a copy whose source and destination live on different
/// storage nodes. The naming server only introduces the two nodes; the bytes
/// go directly from source to destination.
///
/// At most one record lock is held at any time: the destination is
/// validated, then the source runs the transfer, then the destination mirror
/// is updated from a snapshot of the source subtree.
pub struct CopyCoordinator {
    source: Arc<StorageServerRecord>,
    dest: Arc<StorageServerRecord>,
}

impl CopyCoordinator {
    pub fn new(source: Arc<StorageServerRecord>, dest: Arc<StorageServerRecord>) -> Self {
        Self { source, dest }
    }

    /// Copy `source_path` to `dest_parent/name`. Returns the number of bytes
    /// the source node reports having sent.
    ///
    /// A failure after the transfer started is reported as-is; whatever
    /// already reached the destination stays there.
    pub async fn run(&self, source_path: &str, dest_parent: &str, name: &str) -> Result<u64> {
        let dest_path = path::join(dest_parent, name);
        self.check_destination(dest_parent, name).await?;

        let (snapshot, bytes) = {
            let mut state = self.source.lock().await;
            let source_id = state.mirror.resolve_path(source_path)?;
            let peer = self.dest.address.data_addr();
            info!(
                source = %self.source.address,
                dest = %self.dest.address,
                from = %source_path,
                to = %dest_path,
                "Starting cross-node copy"
            );

            let request = ControlRequest::CopyToPeer {
                source: source_path.to_string(),
                dest: dest_path.clone(),
            };
            match state.call(&request).await? {
                ControlReply::CopyReady => {}
                ControlReply::Failed { kind, reason } => {
                    return Err(ShardError::from_remote(kind, reason))
                }
                other => return Err(state.unexpected(other)),
            }

            state
                .send(&ControlRequest::PeerInfo {
                    ip: peer.ip(),
                    port: peer.port(),
                })
                .await?;
            let bytes = match state.recv().await? {
                ControlReply::CopyDone { bytes } => bytes,
                ControlReply::Failed { kind, reason } => {
                    warn!(
                        source = %self.source.address,
                        dest = %self.dest.address,
                        %reason,
                        "Cross-node copy failed, destination may hold partial data"
                    );
                    return Err(ShardError::from_remote(kind, reason));
                }
                other => return Err(state.unexpected(other)),
            };
            (state.mirror.extract(source_id)?, bytes)
        };

        let mut state = self.dest.lock().await;
        let parent = state.mirror.resolve_path(dest_parent)?;
        state.mirror.graft(parent, name, &snapshot)?;
        info!(dest = %self.dest.address, path = %dest_path, bytes, "Cross-node copy done");
        Ok(bytes)
    }

    async fn check_destination(&self, dest_parent: &str, name: &str) -> Result<()> {
        let state = self.dest.lock().await;
        if !state.is_active() {
            return Err(ShardError::ServerInactive(self.dest.address.to_string()));
        }
        let parent = state.mirror.resolve_path(dest_parent)?;
        if !state.mirror.node(parent)?.is_dir() {
            return Err(ShardError::ParentNotDirectory(dest_parent.to_string()));
        }
        if state.mirror.lookup_child(parent, name).is_some() {
            return Err(ShardError::DuplicateName(path::join(dest_parent, name)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespace::{NamespaceTree, NodeKind};
    use crate::registry::tests::{address, register, tree_with};
    use crate::registry::ServerRegistry;
    use crate::router::tests::fake_node;
    use crate::ErrorKind;

    #[tokio::test]
    async fn test_directory_copy_grafts_whole_subtree() {
        let registry = ServerRegistry::new();
        let (a, far_a) = register(
            &registry,
            address(1, 8080),
            tree_with(&[
                ("/proj", NodeKind::Directory),
                ("/proj/src", NodeKind::Directory),
                ("/proj/src/main.rs", NodeKind::File),
            ]),
        );
        let (b, far_b) = register(
            &registry,
            address(2, 8080),
            tree_with(&[("/mnt", NodeKind::Directory)]),
        );
        fake_node(far_a, |req| {
            Some(match req {
                ControlRequest::CopyToPeer { .. } => ControlReply::CopyReady,
                _ => ControlReply::CopyDone { bytes: 42 },
            })
        });
        let seen_b = fake_node(far_b, |_| None);

        let bytes = CopyCoordinator::new(a.clone(), b.clone())
            .run("/proj", "/mnt", "proj")
            .await
            .unwrap();
        assert_eq!(bytes, 42);

        let state = b.lock().await;
        assert!(state.mirror.contains_path("/mnt/proj/src/main.rs"));
        let id = state.mirror.resolve_path("/mnt/proj/src/main.rs").unwrap();
        assert_eq!(state.mirror.node(id).unwrap().location, "/srv/mnt/proj/src/main.rs");
        assert!(seen_b.lock().is_empty());
    }

    #[tokio::test]
    async fn test_peer_failure_leaves_destination_mirror() {
        let registry = ServerRegistry::new();
        let (a, far_a) = register(
            &registry,
            address(1, 8080),
            tree_with(&[("/x", NodeKind::File)]),
        );
        let (b, _far_b) = register(&registry, address(2, 8080), NamespaceTree::new("/srv"));
        fake_node(far_a, |req| {
            Some(match req {
                ControlRequest::CopyToPeer { .. } => ControlReply::CopyReady,
                _ => ControlReply::Failed {
                    kind: ErrorKind::PeerUnreachable,
                    reason: "10.0.0.2:8082".into(),
                },
            })
        });

        let err = CopyCoordinator::new(a.clone(), b.clone())
            .run("/x", "/", "y")
            .await
            .unwrap_err();
        assert!(matches!(err, ShardError::PeerUnreachable(_)));
        assert!(!b.lock().await.mirror.contains_path("/y"));
        // The source answered, so its channel is still good.
        assert!(a.is_active().await);
    }

    #[tokio::test]
    async fn test_destination_parent_must_be_directory() {
        let registry = ServerRegistry::new();
        let (a, far_a) = register(
            &registry,
            address(1, 8080),
            tree_with(&[("/x", NodeKind::File)]),
        );
        let (b, _far_b) = register(
            &registry,
            address(2, 8080),
            tree_with(&[("/f", NodeKind::File)]),
        );
        let seen_a = fake_node(far_a, |_| None);

        let err = CopyCoordinator::new(a, b)
            .run("/x", "/f", "y")
            .await
            .unwrap_err();
        assert!(matches!(err, ShardError::ParentNotDirectory(_)));
        assert!(seen_a.lock().is_empty());
    }
}
