//! Byte movement on the data plane: streaming one file as chunks, receiving
//! one into a temp file, and pushing a whole subtree to another storage node.

use std::net::SocketAddr;
use std::path::PathBuf;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::hasher::{ChunkHasher, StreamingHasher};
use super::store::LocalStore;
use crate::namespace::{path, NamespaceTree, NodeKind};
use crate::net::protocol::{self, DataMessage, CHUNK_SIZE};
use crate::{Result, ShardError};

/// Stream the file at `location` as chunks followed by `EndOfFile`.
/// Returns the number of bytes sent.
pub async fn send_file<S>(stream: &mut S, store: &LocalStore, location: &str) -> Result<u64>
where
    S: AsyncWrite + Unpin + ?Sized,
{
    let mut file = store.open(location).await?;
    let mut tally = ChunkHasher::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        tally.update(&buf[..n]);
        protocol::write_message(stream, &DataMessage::Chunk(buf[..n].to_vec())).await?;
    }
    let (digest, bytes) = tally.finish();
    protocol::write_message(stream, &DataMessage::EndOfFile { digest }).await?;
    Ok(bytes)
}

/// Read chunks up to `EndOfFile` into a fresh temp file and check the digest.
/// On any failure the temp file is removed.
pub async fn receive_file<S>(stream: &mut S, store: &LocalStore) -> Result<(PathBuf, u64)>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let (temp, file) = store.create_temp().await?;
    match receive_into(stream, file).await {
        Ok(bytes) => Ok((temp, bytes)),
        Err(e) => {
            store.discard_temp(&temp).await;
            Err(e)
        }
    }
}

async fn receive_into<S>(stream: &mut S, file: tokio::fs::File) -> Result<u64>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let mut writer = StreamingHasher::new(file);
    loop {
        let msg: DataMessage = protocol::read_message(stream)
            .await
            .map_err(|e| ShardError::TransferInterrupted(e.to_string()))?;
        match msg {
            DataMessage::Chunk(bytes) => writer.write_chunk(&bytes).await?,
            DataMessage::EndOfFile { digest } => {
                let (actual, bytes, _file) = writer.finish().await?;
                if actual != digest {
                    warn!(
                        expected = %hex::encode(digest),
                        actual = %hex::encode(actual),
                        "Digest mismatch"
                    );
                    return Err(ShardError::TransferInterrupted(
                        "digest mismatch".to_string(),
                    ));
                }
                return Ok(bytes);
            }
            other => {
                return Err(ShardError::ProtocolDesync(format!(
                    "expected file data, got {:?}",
                    other
                )))
            }
        }
    }
}

/// Wait for the peer to accept one step of a push.
async fn expect_ack(stream: &mut TcpStream) -> Result<()> {
    match protocol::read_message(stream).await {
        Ok(DataMessage::Ack) => Ok(()),
        Ok(DataMessage::Failed { kind, reason }) => Err(ShardError::from_remote(kind, reason)),
        Ok(other) => Err(ShardError::ProtocolDesync(format!(
            "expected ack, got {:?}",
            other
        ))),
        Err(e) => Err(ShardError::TransferInterrupted(e.to_string())),
    }
}

/// Copy `snapshot` (a subtree of this node, with real locations) to the
/// storage node at `peer`, rooted at `dest`. Directories are created before
/// their contents. Returns the number of file bytes sent.
///
/// Nothing is undone on failure: directories and files already accepted by
/// the peer stay there.
pub async fn push_to_peer(
    store: &LocalStore,
    peer: SocketAddr,
    snapshot: &NamespaceTree,
    dest: &str,
) -> Result<u64> {
    let mut stream = TcpStream::connect(peer)
        .await
        .map_err(|e| ShardError::PeerUnreachable(format!("{peer}: {e}")))?;
    let _ = stream.set_nodelay(true);
    info!(%peer, %dest, nodes = snapshot.len(), "Pushing to peer");

    let mut total = 0u64;
    let mut pending = vec![(snapshot.root(), dest.to_string())];
    while let Some((id, target)) = pending.pop() {
        let node = snapshot.node(id)?;
        let permissions = node.permissions.bits();
        match node.kind {
            NodeKind::Directory => {
                let msg = DataMessage::CreateDir {
                    path: target.clone(),
                    permissions,
                };
                protocol::write_message(&mut stream, &msg)
                    .await
                    .map_err(|e| ShardError::TransferInterrupted(e.to_string()))?;
                expect_ack(&mut stream).await?;

                if let Some(table) = node.children() {
                    let children: Vec<_> = table.iter().collect();
                    for child in children.into_iter().rev() {
                        let name = &snapshot.node(child)?.name;
                        pending.push((child, path::join(&target, name)));
                    }
                }
            }
            NodeKind::File => {
                let size = store.info(&node.location).await?.size;
                let msg = DataMessage::FileMeta {
                    path: target.clone(),
                    size,
                    permissions,
                };
                protocol::write_message(&mut stream, &msg)
                    .await
                    .map_err(|e| ShardError::TransferInterrupted(e.to_string()))?;
                let sent = send_file(&mut stream, store, &node.location)
                    .await
                    .map_err(|e| match e {
                        ShardError::Io(_) | ShardError::ProtocolDesync(_) => {
                            ShardError::TransferInterrupted(e.to_string())
                        }
                        other => other,
                    })?;
                expect_ack(&mut stream).await?;
                debug!(%peer, path = %target, bytes = sent, "File pushed");
                total += sent;
            }
        }
    }
    Ok(total)
}
