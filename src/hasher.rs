//! Stable content hashes used for upload-level and line-level deduplication
//! (spec §4.2). All three operations are pure with respect to their input
//! bytes: same bytes always produce the same hex-encoded SHA-256 digest,
//! stable across processes and deployments.

use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt};

/// Fixed buffer size for the streaming variant — memory use stays constant
/// regardless of file size.
const STREAM_BUFFER_SIZE: usize = 64 * 1024;

/// Hash of the entire file, used for upload-level deduplication
/// (`UploadRegistry::is_file_unique`).
pub fn hash_file(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}

/// Hash of one raw line, including any trailing whitespace that survived
/// trimming of the line terminator. Used as the per-line idempotency key.
pub fn hash_line(line: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(line);
    hex::encode(hasher.finalize())
}

/// Streaming variant for very large uploads: reads in fixed-size chunks so
/// memory use is independent of file size. If the stream is seekable, it is
/// rewound to offset 0 after hashing so a subsequent full read sees the
/// whole content again.
pub async fn hash_stream<S>(mut stream: S) -> std::io::Result<String>
where
    S: AsyncRead + AsyncSeek + Unpin,
{
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; STREAM_BUFFER_SIZE];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    stream.seek(std::io::SeekFrom::Start(0)).await?;
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn hash_file_is_deterministic() {
        let a = hash_file(b"hello world");
        let b = hash_file(b"hello world");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64); // 32 bytes hex-encoded
    }

    #[test]
    fn different_content_hashes_differ() {
        assert_ne!(hash_file(b"a"), hash_file(b"b"));
    }

    #[test]
    fn hash_line_includes_whitespace() {
        assert_ne!(hash_line(b"abc"), hash_line(b"abc "));
    }

    #[tokio::test]
    async fn hash_stream_matches_hash_file_and_rewinds() {
        let content = b"the quick brown fox".repeat(10_000);
        let mut cursor = Cursor::new(content.clone());
        let streamed = hash_stream(&mut cursor).await.unwrap();
        assert_eq!(streamed, hash_file(&content));
        assert_eq!(cursor.position(), 0);
    }
}
