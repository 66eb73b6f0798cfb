pub mod hasher;
pub mod store;
pub mod transfer;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::namespace::{child_location, codec, path, NamespaceTree, NodeKind, Permissions};
use crate::net::protocol::{
    self, ControlReply, ControlRequest, DataMessage, FileInfo, Registration, RegistrationReply,
    StorageAddress, CHUNK_SIZE,
};
use crate::{Result, ShardError};
use store::LocalStore;

fn reply_for<T>(result: Result<T>, ok: impl FnOnce(T) -> ControlReply) -> ControlReply {
    match result {
        Ok(value) => ok(value),
        Err(e) => {
            warn!(error = %e, "Control request failed");
            ControlReply::failed(&e)
        }
    }
}

/// A storage node: the authoritative namespace for everything under its root
/// directory.
pub struct StorageNode {
    name: String,
    address: StorageAddress,
    tree: Mutex<NamespaceTree>,
    store: LocalStore,
}

impl StorageNode {
    /// Open the root directory and build the namespace from what is on disk.
    pub fn open(name: String, address: StorageAddress, root: PathBuf) -> Result<Self> {
        let store = LocalStore::new(root)?;
        let tree = store.scan()?;
        info!(
            name = %name,
            root = ?store.root(),
            nodes = tree.len(),
            "Storage namespace scanned"
        );
        Ok(Self {
            name,
            address,
            tree: Mutex::new(tree),
            store,
        })
    }

    pub fn address(&self) -> StorageAddress {
        self.address
    }

    pub async fn tree(&self) -> MutexGuard<'_, NamespaceTree> {
        self.tree.lock().await
    }

    /// Register with the naming server and serve both planes until the
    /// control channel closes or the data listener fails.
    pub async fn run(self: Arc<Self>, naming: &str, data: TcpListener) -> Result<()> {
        let control = self.register(naming).await?;
        tokio::select! {
            r = self.clone().serve_data(data) => r,
            r = self.serve_control(control) => r,
        }
    }

    /// Send the whole namespace to the naming server. The returned stream
    /// is the control channel from then on.
    pub async fn register(&self, naming: &str) -> Result<TcpStream> {
        let mut stream = TcpStream::connect(naming).await?;
        let _ = stream.set_nodelay(true);
        let tree = codec::encode_tree(&*self.tree.lock().await)?;
        let registration = Registration {
            name: self.name.clone(),
            address: self.address,
            tree,
        };
        protocol::write_message(&mut stream, &registration).await?;
        match protocol::read_message(&mut stream).await? {
            RegistrationReply::Accepted => {
                info!(%naming, address = %self.address, "Registered with naming server");
                Ok(stream)
            }
            RegistrationReply::Rejected { reason } => Err(ShardError::Remote(reason)),
        }
    }

    // -----------------------------------------------------------------------
    // Control plane
    // -----------------------------------------------------------------------

    /// Answer control requests one at a time until the naming server hangs
    /// up.
    pub async fn serve_control<S>(&self, mut stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        while let Some(request) =
            protocol::read_message_opt::<_, ControlRequest>(&mut stream).await?
        {
            debug!(?request, "Control request");
            let reply = match request {
                ControlRequest::Create { kind, path } => {
                    reply_for(self.create(kind, &path).await, |_| ControlReply::CreateDone)
                }
                ControlRequest::Delete { path } => {
                    reply_for(self.delete(&path).await, |_| ControlReply::DeleteDone)
                }
                ControlRequest::Copy { source, dest } => {
                    reply_for(self.copy_local(&source, &dest).await, |bytes| {
                        ControlReply::CopyDone { bytes }
                    })
                }
                ControlRequest::CopyToPeer { source, dest } => {
                    self.copy_to_peer(&mut stream, &source, &dest).await?
                }
                ControlRequest::PeerInfo { .. } => ControlReply::failed(&ShardError::InvalidCommand(
                    "peer info without a pending copy".into(),
                )),
                ControlRequest::Ping => ControlReply::Pong,
            };
            protocol::write_message(&mut stream, &reply).await?;
        }
        info!("Naming server closed the control channel");
        Ok(())
    }

    pub async fn create(&self, kind: NodeKind, path: &str) -> Result<()> {
        let (parent_path, name) = path::split_parent(path)?;
        let mut tree = self.tree.lock().await;
        let parent = tree.resolve_path(&parent_path)?;
        let parent_node = tree.node(parent)?;
        if !parent_node.is_dir() {
            return Err(ShardError::ParentNotDirectory(parent_path));
        }
        if tree.lookup_child(parent, &name).is_some() {
            return Err(ShardError::DuplicateName(path.to_string()));
        }

        let location = child_location(&parent_node.location, &name);
        match kind {
            NodeKind::File => self.store.create_file(&location).await?,
            NodeKind::Directory => self.store.create_dir(&location).await?,
        }
        tree.create_empty_node(parent, &name, kind)?;
        info!(%path, kind = kind.label(), "Created");
        Ok(())
    }

    /// Remove `path` and everything under it, children first. Each node
    /// leaves the tree as soon as it is gone from disk, so a failure part way
    /// leaves the tree matching what is still on disk.
    pub async fn delete(&self, path: &str) -> Result<usize> {
        let mut tree = self.tree.lock().await;
        let id = tree.resolve_path(path)?;
        if tree.node(id)?.parent().is_none() {
            return Err(ShardError::CannotDeleteRoot);
        }

        let order = tree.post_order(id)?;
        let total = order.len();
        for victim in order {
            let (location, kind) = {
                let node = tree.node(victim)?;
                (node.location.clone(), node.kind)
            };
            self.store.remove(&location, kind).await?;
            tree.delete_node(victim)?;
        }
        info!(%path, removed = total, "Deleted");
        Ok(total)
    }

    /// Copy within this node: bytes first, then the tree.
    pub async fn copy_local(&self, source: &str, dest: &str) -> Result<u64> {
        if path::is_within(dest, source) {
            return Err(ShardError::InvalidPathFormat(format!(
                "cannot copy {} into itself",
                source
            )));
        }
        let (parent_path, name) = path::split_parent(dest)?;
        let mut tree = self.tree.lock().await;
        let source_id = tree.resolve_path(source)?;
        let parent = tree.resolve_path(&parent_path)?;
        if !tree.node(parent)?.is_dir() {
            return Err(ShardError::ParentNotDirectory(parent_path));
        }
        if tree.lookup_child(parent, &name).is_some() {
            return Err(ShardError::DuplicateName(dest.to_string()));
        }

        let snapshot = tree.extract(source_id)?;
        let top = child_location(&tree.node(parent)?.location, &name);
        let mut bytes = 0;
        let mut pending = vec![(snapshot.root(), top)];
        while let Some((id, target)) = pending.pop() {
            let node = snapshot.node(id)?;
            match node.kind {
                NodeKind::Directory => {
                    self.store.create_dir(&target).await?;
                    if let Some(table) = node.children() {
                        for child in table.iter() {
                            let child_name = &snapshot.node(child)?.name;
                            pending.push((child, child_location(&target, child_name)));
                        }
                    }
                }
                NodeKind::File => bytes += self.store.copy_file(&node.location, &target).await?,
            }
        }
        tree.graft(parent, &name, &snapshot)?;
        info!(%source, %dest, bytes, "Copied locally");
        Ok(bytes)
    }

    /// Source side of a cross-node copy: announce readiness, learn the peer
    /// address, push the subtree straight to the peer, report the outcome.
    async fn copy_to_peer<S>(&self, stream: &mut S, source: &str, dest: &str) -> Result<ControlReply>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let snapshot = {
            let tree = self.tree.lock().await;
            match tree.resolve_path(source).and_then(|id| tree.extract(id)) {
                Ok(snapshot) => snapshot,
                Err(e) => return Ok(ControlReply::failed(&e)),
            }
        };
        protocol::write_message(stream, &ControlReply::CopyReady).await?;

        let peer = match protocol::read_message(stream).await? {
            ControlRequest::PeerInfo { ip, port } => SocketAddr::new(ip, port),
            other => {
                return Err(ShardError::ProtocolDesync(format!(
                    "expected peer info, got {:?}",
                    other
                )))
            }
        };
        info!(%source, %dest, %peer, "SOURCE SERVER_INFO received, pushing");

        Ok(
            match transfer::push_to_peer(&self.store, peer, &snapshot, dest).await {
                Ok(bytes) => ControlReply::CopyDone { bytes },
                Err(e) => {
                    warn!(%source, %dest, %peer, error = %e, "Push to peer failed");
                    ControlReply::failed(&e)
                }
            },
        )
    }

    // -----------------------------------------------------------------------
    // Data plane
    // -----------------------------------------------------------------------

    pub async fn serve_data(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!(addr = %listener.local_addr()?, "Data plane listening");
        loop {
            let (stream, peer) = listener.accept().await?;
            let _ = stream.set_nodelay(true);
            let node = self.clone();
            tokio::spawn(async move {
                debug!(%peer, "Data session opened");
                if let Err(e) = node.data_session(stream).await {
                    warn!(%peer, error = %e, "Data session failed");
                }
            });
        }
    }

    /// One data-plane connection from a client or a peer storage node.
    pub async fn data_session<S>(&self, mut stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        while let Some(msg) = protocol::read_message_opt::<_, DataMessage>(&mut stream).await? {
            match msg {
                DataMessage::Read { path } => self.serve_read(&mut stream, &path, false).await?,
                DataMessage::Stream { path } => self.serve_read(&mut stream, &path, true).await?,
                DataMessage::Write { path } => self.serve_write(&mut stream, &path).await?,
                DataMessage::Meta { path } => {
                    let reply = match self.meta(&path).await {
                        Ok(info) => DataMessage::Info(info),
                        Err(e) => DataMessage::failed(&e),
                    };
                    protocol::write_message(&mut stream, &reply).await?;
                }
                DataMessage::CreateDir { path, permissions } => {
                    let reply = match self.receive_dir(&path, permissions).await {
                        Ok(()) => DataMessage::Ack,
                        Err(e) => DataMessage::failed(&e),
                    };
                    protocol::write_message(&mut stream, &reply).await?;
                }
                DataMessage::FileMeta {
                    path,
                    size,
                    permissions,
                } => {
                    self.receive_peer_file(&mut stream, &path, size, permissions)
                        .await?
                }
                other => {
                    let err = ShardError::InvalidCommand(format!("unexpected {:?}", other));
                    protocol::write_message(&mut stream, &DataMessage::failed(&err)).await?;
                }
            }
        }
        Ok(())
    }

    /// Location of the file at `path` if it grants `needed`.
    async fn file_location(&self, path: &str, needed: Permissions) -> Result<String> {
        let tree = self.tree.lock().await;
        let node = tree.node(tree.resolve_path(path)?)?;
        if node.kind != NodeKind::File {
            return Err(ShardError::InvalidPathFormat(format!("{path} is a directory")));
        }
        if !node.permissions.contains(needed) {
            return Err(ShardError::PermissionDenied(format!(
                "{path} ({})",
                node.permissions
            )));
        }
        Ok(node.location.clone())
    }

    async fn serve_read<S>(&self, stream: &mut S, path: &str, streaming: bool) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let location = match self.file_location(path, Permissions::READ).await {
            Ok(location) => location,
            Err(e) => return protocol::write_message(stream, &DataMessage::failed(&e)).await,
        };

        if !streaming {
            let size = self.store.info(&location).await?.size;
            protocol::write_message(stream, &DataMessage::FileSize(size)).await?;
            let bytes = transfer::send_file(stream, &self.store, &location).await?;
            debug!(%path, bytes, "Read served");
            return Ok(());
        }

        protocol::write_message(stream, &DataMessage::StartStream).await?;
        let mut file = self.store.open(&location).await?;
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            protocol::write_message(stream, &DataMessage::Chunk(buf[..n].to_vec())).await?;
        }
        protocol::write_message(stream, &DataMessage::EndStream).await
    }

    /// Replace the content of an existing file. The client waits for `Ack`
    /// before sending chunks.
    async fn serve_write<S>(&self, stream: &mut S, path: &str) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let location = match self.file_location(path, Permissions::WRITE).await {
            Ok(location) => location,
            Err(e) => return protocol::write_message(stream, &DataMessage::failed(&e)).await,
        };
        protocol::write_message(stream, &DataMessage::Ack).await?;

        let (temp, bytes) = match transfer::receive_file(stream, &self.store).await {
            Ok(received) => received,
            Err(e) => {
                let _ = protocol::write_message(stream, &DataMessage::failed(&e)).await;
                return Err(e);
            }
        };
        self.store.commit_temp(&temp, &location).await?;
        info!(%path, bytes, "Written");
        protocol::write_message(stream, &DataMessage::Written(bytes)).await
    }

    async fn meta(&self, path: &str) -> Result<FileInfo> {
        let (name, kind, permissions, location) = {
            let tree = self.tree.lock().await;
            let node = tree.node(tree.resolve_path(path)?)?;
            (
                node.name.clone(),
                node.kind,
                node.permissions,
                node.location.clone(),
            )
        };
        let disk = self.store.info(&location).await?;
        Ok(FileInfo {
            name,
            kind,
            size: disk.size,
            permissions: permissions.bits(),
            modified: disk.modified,
        })
    }

    /// Parent node and on-disk location for a new entry at `path`.
    fn placement(tree: &NamespaceTree, path: &str) -> Result<(crate::namespace::NodeId, String, String)> {
        let (parent_path, name) = path::split_parent(path)?;
        let parent = tree.resolve_path(&parent_path)?;
        let parent_node = tree.node(parent)?;
        if !parent_node.is_dir() {
            return Err(ShardError::ParentNotDirectory(parent_path));
        }
        if tree.lookup_child(parent, &name).is_some() {
            return Err(ShardError::DuplicateName(path.to_string()));
        }
        let location = child_location(&parent_node.location, &name);
        Ok((parent, name, location))
    }

    /// Peer push: create one directory.
    async fn receive_dir(&self, path: &str, permissions: u8) -> Result<()> {
        let mut tree = self.tree.lock().await;
        let (parent, name, location) = Self::placement(&tree, path)?;
        self.store.create_dir(&location).await?;
        tree.insert_node(
            parent,
            &name,
            NodeKind::Directory,
            Permissions::from_bits_truncate(permissions),
        )?;
        debug!(%path, "Directory received");
        Ok(())
    }

    /// Peer push: one file. The chunks are always consumed, even when the
    /// file is refused, so the session stays in step with the sender.
    async fn receive_peer_file<S>(
        &self,
        stream: &mut S,
        path: &str,
        size: u64,
        permissions: u8,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let checked = {
            let tree = self.tree.lock().await;
            Self::placement(&tree, path).map(|_| ())
        };
        let (temp, bytes) = match transfer::receive_file(stream, &self.store).await {
            Ok(received) => received,
            Err(e) => {
                let _ = protocol::write_message(stream, &DataMessage::failed(&e)).await;
                return Err(e);
            }
        };

        let outcome = match checked {
            Err(e) => Err(e),
            Ok(()) if bytes != size => Err(ShardError::TransferInterrupted(format!(
                "{path}: expected {size} bytes, got {bytes}"
            ))),
            Ok(()) => self.commit_peer_file(&temp, path, permissions).await,
        };
        let reply = match &outcome {
            Ok(()) => {
                info!(%path, bytes, "File received from peer");
                DataMessage::Ack
            }
            Err(e) => {
                self.store.discard_temp(&temp).await;
                DataMessage::failed(e)
            }
        };
        protocol::write_message(stream, &reply).await
    }

    async fn commit_peer_file(&self, temp: &std::path::Path, path: &str, permissions: u8) -> Result<()> {
        let mut tree = self.tree.lock().await;
        let (parent, name, location) = Self::placement(&tree, path)?;
        self.store.commit_temp(temp, &location).await?;
        tree.insert_node(
            parent,
            &name,
            NodeKind::File,
            Permissions::from_bits_truncate(permissions),
        )?;
        Ok(())
    }
}
