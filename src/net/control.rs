use tokio::io::{AsyncRead, AsyncWrite};

use super::protocol::{self, ControlReply, ControlRequest};
use crate::{Result, ShardError};

/// Anything a control channel can run over: a TCP stream in production, an
/// in-memory duplex in tests.
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ByteStream for T {}

/// The persistent naming-server side of one storage node's control
/// connection. It has no internal locking: the owning registry record's
/// mutex is what keeps request/response pairs from interleaving.
pub struct ControlChannel {
    stream: Option<Box<dyn ByteStream>>,
}

impl std::fmt::Debug for ControlChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlChannel").finish_non_exhaustive()
    }
}

impl ControlChannel {
    pub fn new(stream: impl ByteStream + 'static) -> Self {
        Self {
            stream: Some(Box::new(stream)),
        }
    }

    /// Drop the connection. The storage node sees end of stream on its next
    /// read.
    pub fn close(&mut self) {
        self.stream = None;
    }

    fn stream(&mut self) -> Result<&mut Box<dyn ByteStream>> {
        self.stream
            .as_mut()
            .ok_or_else(|| ShardError::ProtocolDesync("control channel closed".to_string()))
    }

    pub async fn send(&mut self, request: &ControlRequest) -> Result<()> {
        protocol::write_message(self.stream()?, request).await
    }

    pub async fn recv(&mut self) -> Result<ControlReply> {
        protocol::read_message(self.stream()?).await
    }

    /// Send one request and wait for exactly one reply.
    pub async fn round_trip(&mut self, request: &ControlRequest) -> Result<ControlReply> {
        self.send(request).await?;
        self.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_round_trip() {
        let (near, mut far) = tokio::io::duplex(4096);
        let mut channel = ControlChannel::new(near);

        let node = tokio::spawn(async move {
            let req: ControlRequest = protocol::read_message(&mut far).await.unwrap();
            assert_eq!(req, ControlRequest::Ping);
            protocol::write_message(&mut far, &ControlReply::Pong)
                .await
                .unwrap();
        });

        let reply = channel.round_trip(&ControlRequest::Ping).await.unwrap();
        assert_eq!(reply, ControlReply::Pong);
        node.await.unwrap();
    }

    #[tokio::test]
    async fn test_hangup_is_desync() {
        let (near, far) = tokio::io::duplex(4096);
        let mut channel = ControlChannel::new(near);
        drop(far);
        let err = channel.round_trip(&ControlRequest::Ping).await.unwrap_err();
        assert!(matches!(err, ShardError::ProtocolDesync(_) | ShardError::Io(_)));
    }

    #[tokio::test]
    async fn test_close_hangs_up_far_end() {
        let (near, mut far) = tokio::io::duplex(4096);
        let mut channel = ControlChannel::new(near);
        channel.close();

        let next: Option<ControlRequest> = protocol::read_message_opt(&mut far).await.unwrap();
        assert!(next.is_none());
        let err = channel.round_trip(&ControlRequest::Ping).await.unwrap_err();
        assert!(matches!(err, ShardError::ProtocolDesync(_)));
    }
}
