pub mod copy;

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::namespace::{path, NodeKind};
use crate::net::protocol::{Command, ControlReply, ControlRequest, ListEntry, Response};
use crate::registry::{ServerRegistry, StorageServerRecord};
use crate::{Result, ShardError};

pub use copy::CopyCoordinator;

/// Turns client commands into registry lookups and control-channel calls.
#[derive(Clone)]
pub struct Router {
    registry: Arc<ServerRegistry>,
}

impl Router {
    pub fn new(registry: Arc<ServerRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.registry
    }

    /// Execute one command. Failures become an error response; nothing here
    /// ends the client session except `EXIT`.
    pub async fn dispatch(&self, command: Command) -> Response {
        debug!(?command, "Dispatching");
        match self.execute(command).await {
            Ok(response) => response,
            Err(e) => {
                debug!(error = %e, "Command failed");
                Response::error(&e)
            }
        }
    }

    async fn execute(&self, command: Command) -> Result<Response> {
        match command {
            Command::Read { path }
            | Command::Write { path }
            | Command::Meta { path }
            | Command::Stream { path } => self.locate(&path).await,
            Command::Create {
                kind,
                ordinal,
                path,
            } => self.create(kind, ordinal, &path).await,
            Command::Delete { path } => self.delete(&path).await,
            Command::Copy { source, dest } => self.copy(&source, &dest).await,
            Command::List { path } => self.list(path.as_deref().unwrap_or("/")).await,
            Command::Exit => Ok(Response::Bye),
        }
    }

    /// Data commands: hand back the owner's data-plane address.
    async fn locate(&self, path: &str) -> Result<Response> {
        let path = path::normalize(path)?;
        let owner = self
            .registry
            .find_owner_of_path(&path)
            .await
            .ok_or(ShardError::PathNotFound(path))?;
        Ok(Response::StorageServer {
            ip: owner.address.ip,
            port: owner.address.data_port,
        })
    }

    async fn create(&self, kind: NodeKind, ordinal: Option<usize>, path: &str) -> Result<Response> {
        let path = path::normalize(path)?;
        let (parent_path, name) = path::split_parent(&path)?;

        if self.registry.find_owner_of_path(&path).await.is_some() {
            return Err(ShardError::DuplicateName(path));
        }
        let record = match ordinal {
            Some(n) => self.registry.select_by_ordinal(n).await?,
            None => self
                .registry
                .find_owner_of_path(&parent_path)
                .await
                .ok_or_else(|| ShardError::PathNotFound(parent_path.clone()))?,
        };

        let mut state = record.lock().await;
        let parent = state.mirror.resolve_path(&parent_path)?;
        if !state.mirror.node(parent)?.is_dir() {
            return Err(ShardError::ParentNotDirectory(parent_path));
        }
        if state.mirror.lookup_child(parent, &name).is_some() {
            return Err(ShardError::DuplicateName(path));
        }

        let request = ControlRequest::Create {
            kind,
            path: path.clone(),
        };
        match state.call(&request).await? {
            ControlReply::CreateDone => {
                state.mirror.create_empty_node(parent, &name, kind)?;
                info!(storage = %record.address, %path, kind = kind.label(), "Created");
                Ok(Response::Done("CREATE DONE".into()))
            }
            ControlReply::Failed { kind, reason } => Err(ShardError::from_remote(kind, reason)),
            other => Err(state.unexpected(other)),
        }
    }

    /// Delete on every node that holds the path. A shared directory goes away
    /// everywhere.
    async fn delete(&self, path: &str) -> Result<Response> {
        let path = path::normalize(path)?;
        if path == "/" {
            return Err(ShardError::CannotDeleteRoot);
        }
        let owners = self.registry.find_owners_of_path(&path).await;
        if owners.is_empty() {
            return Err(ShardError::PathNotFound(path));
        }

        for record in owners {
            let mut state = record.lock().await;
            // Gone since the scan.
            let Ok(id) = state.mirror.resolve_path(&path) else {
                continue;
            };
            let request = ControlRequest::Delete { path: path.clone() };
            match state.call(&request).await? {
                ControlReply::DeleteDone => {
                    let removed = state.mirror.delete_node(id)?;
                    info!(storage = %record.address, %path, removed, "Deleted");
                }
                ControlReply::Failed { kind, reason } => {
                    return Err(ShardError::from_remote(kind, reason))
                }
                other => return Err(state.unexpected(other)),
            }
        }
        Ok(Response::Done("DELETE DONE".into()))
    }

    /// Work out the directory and name a copy lands at.
    ///
    /// An existing directory receives the source under its own name; a
    /// missing path names the copy itself; an existing file is a collision.
    async fn copy_target(&self, source: &str, dest: &str) -> Result<(String, String)> {
        let owners = self.registry.find_owners_of_path(dest).await;
        let Some(first) = owners.first() else {
            return path::split_parent(dest);
        };
        let is_dir = {
            let state = first.lock().await;
            let id = state.mirror.resolve_path(dest)?;
            state.mirror.node(id)?.is_dir()
        };
        if !is_dir {
            return Err(ShardError::DuplicateName(dest.to_string()));
        }
        let name = path::file_name(source)
            .ok_or_else(|| ShardError::InvalidPathFormat(source.to_string()))?;
        Ok((dest.to_string(), name.to_string()))
    }

    async fn copy(&self, source: &str, dest: &str) -> Result<Response> {
        let source = path::normalize(source)?;
        let dest = path::normalize(dest)?;
        if source == "/" {
            return Err(ShardError::InvalidPathFormat(source));
        }

        let source_record = self
            .registry
            .find_owner_of_path(&source)
            .await
            .ok_or_else(|| ShardError::PathNotFound(source.clone()))?;

        let (dest_parent, name) = self.copy_target(&source, &dest).await?;
        let target = path::join(&dest_parent, &name);
        if self.registry.find_owner_of_path(&target).await.is_some() {
            return Err(ShardError::DuplicateName(target));
        }

        let candidates = self.registry.find_owners_of_path(&dest_parent).await;
        let dest_record = candidates
            .iter()
            .find(|r| !Arc::ptr_eq(r, &source_record))
            .or_else(|| candidates.first())
            .cloned()
            .ok_or_else(|| ShardError::PathNotFound(dest_parent.clone()))?;

        let bytes = if Arc::ptr_eq(&dest_record, &source_record) {
            // Only a copy within one node can land inside its own source.
            if path::is_within(&target, &source) {
                return Err(ShardError::InvalidPathFormat(format!(
                    "cannot copy {} into itself",
                    source
                )));
            }
            self.copy_local(&source_record, &source, &dest_parent, &name)
                .await?
        } else {
            CopyCoordinator::new(source_record, dest_record)
                .run(&source, &dest_parent, &name)
                .await?
        };
        Ok(Response::Done(format!(
            "COPY DONE: {} -> {} ({} bytes)",
            source, target, bytes
        )))
    }

    async fn copy_local(
        &self,
        record: &StorageServerRecord,
        source: &str,
        dest_parent: &str,
        name: &str,
    ) -> Result<u64> {
        let target = path::join(dest_parent, name);
        let mut state = record.lock().await;
        let source_id = state.mirror.resolve_path(source)?;
        let parent = state.mirror.resolve_path(dest_parent)?;
        if !state.mirror.node(parent)?.is_dir() {
            return Err(ShardError::ParentNotDirectory(dest_parent.to_string()));
        }
        if state.mirror.lookup_child(parent, name).is_some() {
            return Err(ShardError::DuplicateName(target));
        }

        let request = ControlRequest::Copy {
            source: source.to_string(),
            dest: target.clone(),
        };
        match state.call(&request).await? {
            ControlReply::CopyDone { bytes } => {
                state.mirror.copy_subtree(source_id, parent, name)?;
                info!(storage = %record.address, %source, dest = %target, bytes, "Copied within node");
                Ok(bytes)
            }
            ControlReply::Failed { kind, reason } => Err(ShardError::from_remote(kind, reason)),
            other => Err(state.unexpected(other)),
        }
    }

    /// Listing straight from the mirrors. Paths present on several nodes
    /// (shared directories) appear once.
    async fn list(&self, path: &str) -> Result<Response> {
        let path = path::normalize(path)?;
        let owners = self.registry.find_owners_of_path(&path).await;
        if owners.is_empty() {
            return Err(ShardError::PathNotFound(path));
        }

        let mut seen = HashSet::new();
        let mut entries = Vec::new();
        for record in owners {
            let state = record.lock().await;
            let Ok(id) = state.mirror.resolve_path(&path) else {
                warn!(storage = %record.address, %path, "Listing target vanished");
                continue;
            };
            for (entry_path, kind) in state.mirror.list(id)? {
                if seen.insert(entry_path.clone()) {
                    entries.push(ListEntry {
                        path: entry_path,
                        kind,
                    });
                }
            }
        }
        Ok(Response::Listing(entries))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::namespace::NamespaceTree;
    use crate::net::protocol::{self, StorageAddress};
    use crate::registry::tests::{address, register, tree_with};
    use crate::ErrorKind;
    use parking_lot::Mutex;
    use tokio::io::DuplexStream;

    pub(crate) type Seen = Arc<Mutex<Vec<ControlRequest>>>;

    /// Play a storage node on the far end of a control channel. Returning
    /// `None` from `answer` hangs up.
    pub(crate) fn fake_node<F>(mut far: DuplexStream, mut answer: F) -> Seen
    where
        F: FnMut(&ControlRequest) -> Option<ControlReply> + Send + 'static,
    {
        let seen: Seen = Arc::default();
        let log = seen.clone();
        tokio::spawn(async move {
            while let Ok(Some(req)) = protocol::read_message_opt::<_, ControlRequest>(&mut far).await {
                log.lock().push(req.clone());
                let Some(reply) = answer(&req) else { break };
                if protocol::write_message(&mut far, &reply).await.is_err() {
                    break;
                }
            }
        });
        seen
    }

    fn always_ok(req: &ControlRequest) -> Option<ControlReply> {
        Some(match req {
            ControlRequest::Create { .. } => ControlReply::CreateDone,
            ControlRequest::Delete { .. } => ControlReply::DeleteDone,
            ControlRequest::Copy { .. } => ControlReply::CopyDone { bytes: 5 },
            ControlRequest::CopyToPeer { .. } => ControlReply::CopyReady,
            ControlRequest::PeerInfo { .. } => ControlReply::CopyDone { bytes: 5 },
            ControlRequest::Ping => ControlReply::Pong,
        })
    }

    fn router_with(
        nodes: Vec<(StorageAddress, NamespaceTree)>,
    ) -> (Router, Vec<(Arc<StorageServerRecord>, Seen)>) {
        let registry = Arc::new(ServerRegistry::new());
        let mut out = Vec::new();
        for (addr, tree) in nodes {
            let (record, far) = register(&registry, addr, tree);
            out.push((record, fake_node(far, always_ok)));
        }
        (Router::new(registry), out)
    }

    fn error_kind(response: &Response) -> Option<ErrorKind> {
        match response {
            Response::Error { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_read_routes_to_data_port() {
        let a = address(1, 8080);
        let (router, _nodes) = router_with(vec![(
            a,
            tree_with(&[("/home", NodeKind::Directory), ("/home/a.txt", NodeKind::File)]),
        )]);

        let reply = router.dispatch(Command::parse("READ /home/a.txt").unwrap()).await;
        assert_eq!(reply.to_string(), format!("StorageServer: {} : {}", a.ip, a.data_port));

        let reply = router.dispatch(Command::parse("READ /home/missing").unwrap()).await;
        assert_eq!(error_kind(&reply), Some(ErrorKind::PathNotFound));
    }

    #[tokio::test]
    async fn test_create_updates_mirror() {
        let (router, nodes) = router_with(vec![(
            address(1, 8080),
            tree_with(&[("/home", NodeKind::Directory)]),
        )]);
        let reply = router
            .dispatch(Command::parse("CREATE FILE /home/new.txt").unwrap())
            .await;
        assert_eq!(reply, Response::Done("CREATE DONE".into()));

        let (record, seen) = &nodes[0];
        let state = record.lock().await;
        let id = state.mirror.resolve_path("/home/new.txt").unwrap();
        assert_eq!(state.mirror.node(id).unwrap().name, "new.txt");
        assert_eq!(
            seen.lock().as_slice(),
            &[ControlRequest::Create {
                kind: NodeKind::File,
                path: "/home/new.txt".into()
            }]
        );
    }

    #[tokio::test]
    async fn test_duplicate_create_never_reaches_node() {
        let (router, nodes) = router_with(vec![(
            address(1, 8080),
            tree_with(&[("/home", NodeKind::Directory), ("/home/a.txt", NodeKind::File)]),
        )]);
        let reply = router
            .dispatch(Command::parse("CREATE DIR /home/a.txt").unwrap())
            .await;
        assert_eq!(error_kind(&reply), Some(ErrorKind::DuplicateName));
        assert!(nodes[0].1.lock().is_empty());

        let state = nodes[0].0.lock().await;
        let home = state.mirror.resolve_path("/home").unwrap();
        assert_eq!(state.mirror.node(home).unwrap().children().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_create_by_ordinal() {
        let (router, nodes) = router_with(vec![
            (address(1, 8080), NamespaceTree::new("/srv")),
            (address(2, 8080), NamespaceTree::new("/srv")),
        ]);
        let second = router.registry().select_by_ordinal(2).await.unwrap();
        let reply = router
            .dispatch(Command::parse("CREATE DIR 2 /projects").unwrap())
            .await;
        assert_eq!(reply, Response::Done("CREATE DONE".into()));
        assert!(second.lock().await.mirror.contains_path("/projects"));

        let holders = nodes
            .iter()
            .filter(|(_, seen)| !seen.lock().is_empty())
            .count();
        assert_eq!(holders, 1);

        let reply = router
            .dispatch(Command::parse("CREATE DIR 3 /other").unwrap())
            .await;
        assert_eq!(error_kind(&reply), Some(ErrorKind::NoSuchServer));
    }

    #[tokio::test]
    async fn test_create_under_file_rejected() {
        let (router, _nodes) = router_with(vec![(
            address(1, 8080),
            tree_with(&[("/a.txt", NodeKind::File)]),
        )]);
        let reply = router
            .dispatch(Command::parse("CREATE FILE /a.txt/x").unwrap())
            .await;
        assert_eq!(error_kind(&reply), Some(ErrorKind::ParentNotDirectory));
    }

    #[tokio::test]
    async fn test_failed_create_leaves_mirror() {
        let registry = Arc::new(ServerRegistry::new());
        let (record, far) = register(
            &registry,
            address(1, 8080),
            tree_with(&[("/home", NodeKind::Directory)]),
        );
        fake_node(far, |_| {
            Some(ControlReply::Failed {
                kind: ErrorKind::PermissionDenied,
                reason: "/home".into(),
            })
        });
        let router = Router::new(registry);
        let reply = router
            .dispatch(Command::parse("CREATE FILE /home/x").unwrap())
            .await;
        assert_eq!(error_kind(&reply), Some(ErrorKind::PermissionDenied));
        assert!(!record.lock().await.mirror.contains_path("/home/x"));
        assert!(record.is_active().await);
    }

    #[tokio::test]
    async fn test_hangup_tombstones_and_leaves_mirror() {
        let registry = Arc::new(ServerRegistry::new());
        let (record, far) = register(
            &registry,
            address(1, 8080),
            tree_with(&[("/home", NodeKind::Directory), ("/home/a", NodeKind::File)]),
        );
        fake_node(far, |_| None);
        let router = Router::new(registry);

        let reply = router.dispatch(Command::parse("DELETE /home/a").unwrap()).await;
        assert_eq!(error_kind(&reply), Some(ErrorKind::ProtocolDesync));
        assert!(!record.is_active().await);
        assert!(record.lock().await.mirror.contains_path("/home/a"));

        // Tombstoned nodes no longer route.
        let reply = router.dispatch(Command::parse("READ /home/a").unwrap()).await;
        assert_eq!(error_kind(&reply), Some(ErrorKind::PathNotFound));
    }

    #[tokio::test]
    async fn test_delete_directory_removes_descendants() {
        let (router, nodes) = router_with(vec![(
            address(1, 8080),
            tree_with(&[
                ("/home", NodeKind::Directory),
                ("/home/docs", NodeKind::Directory),
                ("/home/docs/a", NodeKind::File),
            ]),
        )]);
        let reply = router.dispatch(Command::parse("DELETE /home").unwrap()).await;
        assert_eq!(reply, Response::Done("DELETE DONE".into()));

        let state = nodes[0].0.lock().await;
        for gone in ["/home", "/home/docs", "/home/docs/a"] {
            assert!(!state.mirror.contains_path(gone));
        }
        drop(state);

        let reply = router.dispatch(Command::parse("DELETE /").unwrap()).await;
        assert_eq!(error_kind(&reply), Some(ErrorKind::CannotDeleteRoot));
    }

    #[tokio::test]
    async fn test_copy_same_node() {
        let (router, nodes) = router_with(vec![(
            address(1, 8080),
            tree_with(&[
                ("/home", NodeKind::Directory),
                ("/home/x", NodeKind::File),
                ("/backup", NodeKind::Directory),
            ]),
        )]);
        let reply = router.dispatch(Command::parse("COPY /home/x /backup").unwrap()).await;
        assert!(reply.to_string().starts_with("COPY DONE"), "{reply}");

        let (record, seen) = &nodes[0];
        assert!(record.lock().await.mirror.contains_path("/backup/x"));
        assert_eq!(
            seen.lock().as_slice(),
            &[ControlRequest::Copy {
                source: "/home/x".into(),
                dest: "/backup/x".into()
            }]
        );

        let reply = router.dispatch(Command::parse("COPY /home/x /backup/x").unwrap()).await;
        assert_eq!(error_kind(&reply), Some(ErrorKind::DuplicateName));

        let reply = router.dispatch(Command::parse("COPY /home /home/inner").unwrap()).await;
        assert_eq!(error_kind(&reply), Some(ErrorKind::InvalidPathFormat));
    }

    #[tokio::test]
    async fn test_copy_across_nodes_updates_destination_mirror() {
        let a = address(1, 8080);
        let b = address(2, 8080);
        let (router, nodes) = router_with(vec![
            (a, tree_with(&[("/home", NodeKind::Directory), ("/home/x", NodeKind::File)])),
            (b, tree_with(&[("/home", NodeKind::Directory)])),
        ]);

        let reply = router.dispatch(Command::parse("COPY /home/x /home/y").unwrap()).await;
        assert!(reply.to_string().starts_with("COPY DONE"), "{reply}");

        let (rec_a, seen_a) = &nodes[0];
        let (rec_b, seen_b) = &nodes[1];
        assert_eq!(
            seen_a.lock().as_slice(),
            &[
                ControlRequest::CopyToPeer {
                    source: "/home/x".into(),
                    dest: "/home/y".into()
                },
                ControlRequest::PeerInfo {
                    ip: b.ip,
                    port: b.data_port
                },
            ]
        );
        assert!(seen_b.lock().is_empty());
        assert!(rec_b.lock().await.mirror.contains_path("/home/y"));
        assert!(!rec_a.lock().await.mirror.contains_path("/home/y"));

        let reply = router.dispatch(Command::parse("LIST /home").unwrap()).await;
        let text = reply.to_string();
        assert!(text.contains("Path: /home/y, Type: File"), "{text}");
        assert_eq!(text.matches("Path: /home, ").count(), 1);
    }

    #[tokio::test]
    async fn test_copy_into_own_prefix_on_other_node() {
        let a = address(1, 8080);
        let b = address(2, 8080);
        let (router, nodes) = router_with(vec![
            (a, tree_with(&[("/a", NodeKind::Directory), ("/a/f", NodeKind::File)])),
            (b, tree_with(&[("/a", NodeKind::Directory)])),
        ]);

        let reply = router.dispatch(Command::parse("COPY /a /a/x").unwrap()).await;
        assert!(reply.to_string().starts_with("COPY DONE"), "{reply}");
        let (rec_a, _) = &nodes[0];
        let (rec_b, _) = &nodes[1];
        assert!(rec_b.lock().await.mirror.contains_path("/a/x/f"));
        assert!(!rec_a.lock().await.mirror.contains_path("/a/x"));
    }

    #[tokio::test]
    async fn test_list_merges_nodes() {
        let (router, _nodes) = router_with(vec![
            (address(1, 8080), tree_with(&[("/a", NodeKind::File)])),
            (address(2, 8080), tree_with(&[("/b", NodeKind::Directory)])),
        ]);
        let Response::Listing(entries) = router.dispatch(Command::List { path: None }).await else {
            panic!("expected listing");
        };
        let paths: Vec<&str> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths.iter().filter(|p| **p == "/").count(), 1);
        assert!(paths.contains(&"/a"));
        assert!(paths.contains(&"/b"));
    }
}
