//! Client side: a session with the naming server, plus direct data-plane
//! calls to whichever storage node it points at.

use std::net::SocketAddr;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::net::protocol::{self, Command, DataMessage, FileInfo, Response};
use crate::net::ByteStream;
use crate::storage::hasher::ChunkHasher;
use crate::{Result, ShardError};

/// Upper bound on the buffer reserved up front for a read. The size comes
/// from the storage node, so it only serves as a hint.
const READ_RESERVE_LIMIT: usize = 16 * protocol::CHUNK_SIZE;

pub struct NamingClient {
    stream: Box<dyn ByteStream>,
}

fn remote_error(response: Response) -> ShardError {
    match response {
        Response::Error { kind, message } => ShardError::from_remote(kind, message),
        other => ShardError::ProtocolDesync(format!("unexpected response {:?}", other)),
    }
}

fn data_error(msg: DataMessage) -> ShardError {
    match msg {
        DataMessage::Failed { kind, reason } => ShardError::from_remote(kind, reason),
        other => ShardError::ProtocolDesync(format!("unexpected data message {:?}", other)),
    }
}

impl NamingClient {
    pub async fn connect(naming: &str) -> Result<Self> {
        let stream = TcpStream::connect(naming).await?;
        let _ = stream.set_nodelay(true);
        Ok(Self::from_stream(stream))
    }

    pub fn from_stream(stream: impl ByteStream + 'static) -> Self {
        Self {
            stream: Box::new(stream),
        }
    }

    pub async fn execute(&mut self, command: &Command) -> Result<Response> {
        protocol::write_message(&mut self.stream, command).await?;
        protocol::read_message(&mut self.stream).await
    }

    pub async fn execute_line(&mut self, line: &str) -> Result<Response> {
        self.execute(&Command::parse(line)?).await
    }

    /// Ask the naming server which storage node serves a data command.
    async fn locate(&mut self, command: Command) -> Result<SocketAddr> {
        match self.execute(&command).await? {
            Response::StorageServer { ip, port } => Ok(SocketAddr::new(ip, port)),
            other => Err(remote_error(other)),
        }
    }

    async fn open_data(&mut self, command: Command) -> Result<TcpStream> {
        let addr = self.locate(command).await?;
        debug!(%addr, "Opening data connection");
        let stream = TcpStream::connect(addr).await?;
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }

    /// Fetch a whole file, verifying the digest sent with the end marker.
    pub async fn read_file(&mut self, path: &str) -> Result<Vec<u8>> {
        let mut data = self
            .open_data(Command::Read {
                path: path.to_string(),
            })
            .await?;
        protocol::write_message(&mut data, &DataMessage::Read { path: path.to_string() }).await?;

        let size = match protocol::read_message(&mut data).await? {
            DataMessage::FileSize(size) => size,
            other => return Err(data_error(other)),
        };
        let reserve = usize::try_from(size).map_or(READ_RESERVE_LIMIT, |n| n.min(READ_RESERVE_LIMIT));
        let mut content = Vec::with_capacity(reserve);
        let mut tally = ChunkHasher::new();
        loop {
            match protocol::read_message(&mut data).await? {
                DataMessage::Chunk(bytes) => {
                    tally.update(&bytes);
                    content.extend_from_slice(&bytes);
                }
                DataMessage::EndOfFile { digest } => {
                    let (actual, _) = tally.finish();
                    if actual != digest {
                        return Err(ShardError::TransferInterrupted(format!(
                            "{path}: digest mismatch"
                        )));
                    }
                    return Ok(content);
                }
                other => return Err(data_error(other)),
            }
        }
    }

    /// Copy a file's bytes into `out` as they arrive, between the stream
    /// markers. Returns the byte count.
    pub async fn stream_file<W>(&mut self, path: &str, out: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let mut data = self
            .open_data(Command::Stream {
                path: path.to_string(),
            })
            .await?;
        protocol::write_message(&mut data, &DataMessage::Stream { path: path.to_string() }).await?;
        match protocol::read_message(&mut data).await? {
            DataMessage::StartStream => {}
            other => return Err(data_error(other)),
        }
        let mut total = 0u64;
        loop {
            match protocol::read_message(&mut data).await? {
                DataMessage::Chunk(bytes) => {
                    out.write_all(&bytes).await?;
                    total += bytes.len() as u64;
                }
                DataMessage::EndStream => break,
                other => return Err(data_error(other)),
            }
        }
        out.flush().await?;
        Ok(total)
    }

    /// Replace the content of an existing file.
    pub async fn write_file(&mut self, path: &str, content: &[u8]) -> Result<u64> {
        let mut data = self
            .open_data(Command::Write {
                path: path.to_string(),
            })
            .await?;
        protocol::write_message(&mut data, &DataMessage::Write { path: path.to_string() }).await?;
        match protocol::read_message(&mut data).await? {
            DataMessage::Ack => {}
            other => return Err(data_error(other)),
        }

        let mut tally = ChunkHasher::new();
        for chunk in content.chunks(protocol::CHUNK_SIZE) {
            tally.update(chunk);
            protocol::write_message(&mut data, &DataMessage::Chunk(chunk.to_vec())).await?;
        }
        let (digest, _) = tally.finish();
        protocol::write_message(&mut data, &DataMessage::EndOfFile { digest }).await?;
        match protocol::read_message(&mut data).await? {
            DataMessage::Written(bytes) => Ok(bytes),
            other => Err(data_error(other)),
        }
    }

    pub async fn meta(&mut self, path: &str) -> Result<FileInfo> {
        let mut data = self
            .open_data(Command::Meta {
                path: path.to_string(),
            })
            .await?;
        protocol::write_message(&mut data, &DataMessage::Meta { path: path.to_string() }).await?;
        match protocol::read_message(&mut data).await? {
            DataMessage::Info(info) => Ok(info),
            other => Err(data_error(other)),
        }
    }

    /// Run one line typed at the interactive prompt and render the outcome.
    /// Data commands are carried out against the storage node; everything
    /// else is printed as the naming server answered.
    pub async fn run_line(&mut self, line: &str) -> Result<String> {
        let mut parts = line.trim().splitn(3, char::is_whitespace);
        let verb = parts.next().unwrap_or_default().to_ascii_uppercase();
        let path = parts.next();
        match (verb.as_str(), path) {
            ("READ", Some(path)) => {
                let bytes = self.read_file(path).await?;
                Ok(String::from_utf8_lossy(&bytes).into_owned())
            }
            ("STREAM", Some(path)) => {
                let mut buf = Vec::new();
                self.stream_file(path, &mut buf).await?;
                Ok(String::from_utf8_lossy(&buf).into_owned())
            }
            ("WRITE", Some(path)) => {
                let text = parts.next().unwrap_or_default();
                let bytes = self.write_file(path, text.as_bytes()).await?;
                Ok(format!("WRITE DONE ({bytes} bytes)"))
            }
            ("META", Some(path)) => {
                let info = self.meta(path).await?;
                Ok(format!(
                    "Name: {}, Type: {}, Size: {}, Permissions: {}, Modified: {}",
                    info.name,
                    info.kind.label(),
                    info.size,
                    info.permissions(),
                    info.modified
                ))
            }
            _ => Ok(self.execute_line(line).await?.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespace::NodeKind;
    use crate::net::protocol::ListEntry;
    use crate::ErrorKind;

    #[tokio::test]
    async fn test_execute_line_round_trip() {
        let (near, mut server) = tokio::io::duplex(4096);
        let mut client = NamingClient::from_stream(near);

        let fake = tokio::spawn(async move {
            let cmd: Command = protocol::read_message(&mut server).await.unwrap();
            assert_eq!(cmd, Command::List { path: None });
            let reply = Response::Listing(vec![ListEntry {
                path: "/".into(),
                kind: NodeKind::Directory,
            }]);
            protocol::write_message(&mut server, &reply).await.unwrap();
        });

        let response = client.execute_line("list").await.unwrap();
        assert_eq!(response.to_string(), "Path: /, Type: Directory\n");
        fake.await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_path_surfaces_error() {
        let (near, mut server) = tokio::io::duplex(4096);
        let mut client = NamingClient::from_stream(near);
        tokio::spawn(async move {
            let _: Command = protocol::read_message(&mut server).await.unwrap();
            let reply = Response::Error {
                kind: ErrorKind::PathNotFound,
                message: "/nope".into(),
            };
            protocol::write_message(&mut server, &reply).await.unwrap();
        });

        let err = client.read_file("/nope").await.unwrap_err();
        assert!(matches!(err, ShardError::PathNotFound(_)));
    }

    #[tokio::test]
    async fn test_bad_line_never_reaches_server() {
        let (near, _server) = tokio::io::duplex(4096);
        let mut client = NamingClient::from_stream(near);
        assert!(matches!(
            client.run_line("COPY onlyone").await,
            Err(ShardError::InvalidCommand(_))
        ));
    }

    #[tokio::test]
    async fn test_oversized_file_size_is_only_a_hint() {
        let storage = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let data_addr = storage.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = storage.accept().await.unwrap();
            let _: DataMessage = protocol::read_message(&mut stream).await.unwrap();
            protocol::write_message(&mut stream, &DataMessage::FileSize(u64::MAX))
                .await
                .unwrap();
            protocol::write_message(&mut stream, &DataMessage::Chunk(b"tiny".to_vec()))
                .await
                .unwrap();
            let digest = crate::sha256(b"tiny");
            protocol::write_message(&mut stream, &DataMessage::EndOfFile { digest })
                .await
                .unwrap();
        });

        let (near, mut server) = tokio::io::duplex(4096);
        let mut client = NamingClient::from_stream(near);
        tokio::spawn(async move {
            let _: Command = protocol::read_message(&mut server).await.unwrap();
            let reply = Response::StorageServer {
                ip: data_addr.ip(),
                port: data_addr.port(),
            };
            protocol::write_message(&mut server, &reply).await.unwrap();
        });

        assert_eq!(client.read_file("/big").await.unwrap(), b"tiny");
    }
}
