use std::fmt;
use std::net::{IpAddr, SocketAddr};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::namespace::{NodeKind, Permissions};
use crate::{Digest256, ErrorKind, Result, ShardError};

/// Maximum message size (16 MiB) to prevent unbounded allocations.
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// Payload size of one data-plane chunk.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Write a length-prefixed, postcard-serialized message.
pub async fn write_message<W, T>(writer: &mut W, msg: &T) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
    T: Serialize,
{
    let bytes = postcard::to_stdvec(msg)?;
    if bytes.len() > MAX_MESSAGE_SIZE as usize {
        return Err(ShardError::Other(format!(
            "message too large: {} bytes",
            bytes.len()
        )));
    }
    let len = bytes.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed message. A clean end of stream before the length
/// prefix yields `None`; a stream that ends anywhere else is a desync.
pub async fn read_message_opt<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncRead + Unpin + ?Sized,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        let n = reader.read(&mut len_buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(ShardError::ProtocolDesync(
                "stream closed inside length prefix".into(),
            ));
        }
        filled += n;
    }
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_MESSAGE_SIZE {
        return Err(ShardError::ProtocolDesync(format!(
            "message too large: {} bytes",
            len
        )));
    }

    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await.map_err(|e| {
        ShardError::ProtocolDesync(format!("stream closed before all bytes received: {e}"))
    })?;
    Ok(Some(postcard::from_bytes(&buf)?))
}

/// Read one length-prefixed message, treating end of stream as a desync.
pub async fn read_message<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin + ?Sized,
    T: DeserializeOwned,
{
    read_message_opt(reader)
        .await?
        .ok_or_else(|| ShardError::ProtocolDesync("peer closed the connection".into()))
}

/// Where a storage node can be reached. `(ip, control_port)` is its identity
/// in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StorageAddress {
    pub ip: IpAddr,
    pub control_port: u16,
    pub data_port: u16,
}

impl StorageAddress {
    pub fn data_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.data_port)
    }
}

impl fmt::Display for StorageAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.ip, self.control_port, self.data_port)
    }
}

// ---------------------------------------------------------------------------
// Storage node -> naming server: registration
// ---------------------------------------------------------------------------

/// First message on a storage node's control connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registration {
    pub name: String,
    pub address: StorageAddress,
    /// Bulk-encoded namespace tree (see `namespace::codec`).
    pub tree: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistrationReply {
    Accepted,
    Rejected { reason: String },
}

// ---------------------------------------------------------------------------
// Client -> naming server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    Read { path: String },
    Write { path: String },
    Meta { path: String },
    Stream { path: String },
    Create {
        kind: NodeKind,
        /// 1-based position among active storage nodes.
        ordinal: Option<usize>,
        path: String,
    },
    Delete { path: String },
    Copy { source: String, dest: String },
    List { path: Option<String> },
    Exit,
}

impl Command {
    /// Parse the line-oriented text form, e.g. `CREATE DIR 2 /home/new`.
    pub fn parse(line: &str) -> Result<Self> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some((verb, args)) = tokens.split_first() else {
            return Err(ShardError::InvalidCommand("empty command".into()));
        };
        let invalid = || ShardError::InvalidCommand(line.trim().to_string());
        let single = |args: &[&str]| match args {
            [path] => Ok(path.to_string()),
            _ => Err(invalid()),
        };

        match verb.to_ascii_uppercase().as_str() {
            "READ" => Ok(Self::Read { path: single(args)? }),
            "WRITE" => Ok(Self::Write { path: single(args)? }),
            "META" => Ok(Self::Meta { path: single(args)? }),
            "STREAM" => Ok(Self::Stream { path: single(args)? }),
            "DELETE" => Ok(Self::Delete { path: single(args)? }),
            "COPY" => match args {
                [source, dest] => Ok(Self::Copy {
                    source: source.to_string(),
                    dest: dest.to_string(),
                }),
                _ => Err(invalid()),
            },
            "LIST" => match args {
                [] => Ok(Self::List { path: None }),
                [path] => Ok(Self::List {
                    path: Some(path.to_string()),
                }),
                _ => Err(invalid()),
            },
            "CREATE" => {
                let (kind, rest) = args.split_first().ok_or_else(invalid)?;
                let kind = match kind.to_ascii_uppercase().as_str() {
                    "FILE" => NodeKind::File,
                    "DIR" | "DIRECTORY" => NodeKind::Directory,
                    _ => return Err(invalid()),
                };
                match rest {
                    [path] => Ok(Self::Create {
                        kind,
                        ordinal: None,
                        path: path.to_string(),
                    }),
                    [n, path] => Ok(Self::Create {
                        kind,
                        ordinal: Some(n.parse().map_err(|_| invalid())?),
                        path: path.to_string(),
                    }),
                    _ => Err(invalid()),
                }
            }
            "EXIT" if args.is_empty() => Ok(Self::Exit),
            _ => Err(invalid()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListEntry {
    pub path: String,
    pub kind: NodeKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    /// Data-plane address of the owning storage node.
    StorageServer { ip: IpAddr, port: u16 },
    /// Success line such as `CREATE DONE`.
    Done(String),
    Listing(Vec<ListEntry>),
    Error { kind: ErrorKind, message: String },
    Bye,
}

impl Response {
    pub fn error(err: &ShardError) -> Self {
        Self::Error {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StorageServer { ip, port } => write!(f, "StorageServer: {} : {}", ip, port),
            Self::Done(line) => f.write_str(line),
            Self::Listing(entries) => {
                for entry in entries {
                    writeln!(f, "Path: {}, Type: {}", entry.path, entry.kind.label())?;
                }
                Ok(())
            }
            Self::Error { message, .. } => write!(f, "ERROR: {}", message),
            Self::Bye => f.write_str("BYE"),
        }
    }
}

// ---------------------------------------------------------------------------
// Naming server -> storage node: control channel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlRequest {
    Create { kind: NodeKind, path: String },
    Delete { path: String },
    /// Copy within this node.
    Copy { source: String, dest: String },
    /// Copy `source` to another node as `dest`. The peer's address follows
    /// in a `PeerInfo` once the node answers `CopyReady`.
    CopyToPeer { source: String, dest: String },
    /// `SOURCE SERVER_INFO <ip> <port>`
    PeerInfo { ip: IpAddr, port: u16 },
    Ping,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlReply {
    CreateDone,
    DeleteDone,
    CopyReady,
    CopyDone { bytes: u64 },
    Pong,
    Failed { kind: ErrorKind, reason: String },
}

impl ControlReply {
    pub fn failed(err: &ShardError) -> Self {
        Self::Failed {
            kind: err.kind(),
            reason: err.detail(),
        }
    }
}

// ---------------------------------------------------------------------------
// Data plane: client <-> storage node and storage node <-> storage node
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub name: String,
    pub kind: NodeKind,
    pub size: u64,
    pub permissions: u8,
    /// Seconds since the Unix epoch.
    pub modified: u64,
}

impl FileInfo {
    pub fn permissions(&self) -> Permissions {
        Permissions::from_bits_truncate(self.permissions)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataMessage {
    // requests
    Read { path: String },
    Write { path: String },
    Meta { path: String },
    Stream { path: String },
    /// Node-to-node: create a directory at `path`.
    CreateDir { path: String, permissions: u8 },
    /// Node-to-node: a file at `path` follows as chunks and an end marker.
    FileMeta { path: String, size: u64, permissions: u8 },

    // payload
    Chunk(Vec<u8>),
    /// `END_OF_FILE`, carrying the digest of every chunk since the header.
    EndOfFile { digest: Digest256 },
    /// `START_STREAM`
    StartStream,
    /// `END_STREAM`
    EndStream,

    // replies
    FileSize(u64),
    Info(FileInfo),
    Written(u64),
    Ack,
    Failed { kind: ErrorKind, reason: String },
}

impl DataMessage {
    pub fn failed(err: &ShardError) -> Self {
        Self::Failed {
            kind: err.kind(),
            reason: err.detail(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(
            Command::parse("READ /home/a.txt").unwrap(),
            Command::Read {
                path: "/home/a.txt".into()
            }
        );
        assert_eq!(
            Command::parse("create dir 2 /home/new").unwrap(),
            Command::Create {
                kind: NodeKind::Directory,
                ordinal: Some(2),
                path: "/home/new".into()
            }
        );
        assert_eq!(
            Command::parse("CREATE FILE /home/x").unwrap(),
            Command::Create {
                kind: NodeKind::File,
                ordinal: None,
                path: "/home/x".into()
            }
        );
        assert_eq!(
            Command::parse("LIST").unwrap(),
            Command::List { path: None }
        );
        assert_eq!(Command::parse("exit").unwrap(), Command::Exit);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        for line in ["", "READ", "COPY /a", "CREATE LINK /a", "CREATE FILE x /a", "FROB /a"] {
            assert!(
                matches!(Command::parse(line), Err(ShardError::InvalidCommand(_))),
                "{line:?} should not parse"
            );
        }
    }

    #[test]
    fn test_response_markers() {
        let addr = Response::StorageServer {
            ip: "10.0.0.5".parse().unwrap(),
            port: 8082,
        };
        assert_eq!(addr.to_string(), "StorageServer: 10.0.0.5 : 8082");

        let listing = Response::Listing(vec![
            ListEntry {
                path: "/home".into(),
                kind: NodeKind::Directory,
            },
            ListEntry {
                path: "/home/y".into(),
                kind: NodeKind::File,
            },
        ]);
        assert_eq!(
            listing.to_string(),
            "Path: /home, Type: Directory\nPath: /home/y, Type: File\n"
        );
    }

    #[tokio::test]
    async fn test_framing_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let msg = ControlRequest::PeerInfo {
            ip: "127.0.0.1".parse().unwrap(),
            port: 9000,
        };
        write_message(&mut a, &msg).await.unwrap();
        let got: ControlRequest = read_message(&mut b).await.unwrap();
        assert_eq!(got, msg);

        drop(a);
        let eof: Option<ControlRequest> = read_message_opt(&mut b).await.unwrap();
        assert!(eof.is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&(MAX_MESSAGE_SIZE + 1).to_be_bytes())
            .await
            .unwrap();
        let result: Result<ControlReply> = read_message(&mut b).await;
        assert!(matches!(result, Err(ShardError::ProtocolDesync(_))));
    }
}
