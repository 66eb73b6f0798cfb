use sha2::{Digest, Sha256};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::Digest256;

/// Running SHA-256 and byte count over the chunks of one transfer.
#[derive(Default)]
pub struct ChunkHasher {
    hasher: Sha256,
    bytes: u64,
}

impl ChunkHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.bytes += chunk.len() as u64;
    }

    pub fn finish(self) -> (Digest256, u64) {
        (self.hasher.finalize().into(), self.bytes)
    }
}

/// Wraps an async writer and hashes every chunk written through it.
pub struct StreamingHasher<W> {
    inner: W,
    tally: ChunkHasher,
}

impl<W: AsyncWrite + Unpin> StreamingHasher<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            tally: ChunkHasher::new(),
        }
    }

    pub async fn write_chunk(&mut self, chunk: &[u8]) -> std::io::Result<()> {
        self.inner.write_all(chunk).await?;
        self.tally.update(chunk);
        Ok(())
    }

    /// Flush and return (digest, total bytes, inner writer).
    pub async fn finish(mut self) -> std::io::Result<(Digest256, u64, W)> {
        self.inner.flush().await?;
        let (digest, bytes) = self.tally.finish();
        Ok((digest, bytes, self.inner))
    }
}
