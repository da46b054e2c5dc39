//! Content digests for the `Content-MD5` integrity header
//!
//! MD5 is what the service verifies uploads against. It only detects
//! corruption in transit; nothing here is used for authentication.
//!
//! Streaming variants feed the hasher chunk by chunk, so memory stays bounded
//! by the read buffer regardless of payload size.

use base64::Engine;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use md5::{Digest, Md5};
use std::io::SeekFrom;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt};

/// Read buffer for file and reader digests
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Output encoding of a digest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DigestEncoding {
    Hex,
    /// Standard base64, the form `Content-MD5` expects
    #[default]
    Base64,
}

impl DigestEncoding {
    fn encode(self, digest: &[u8]) -> String {
        match self {
            DigestEncoding::Hex => hex::encode(digest),
            DigestEncoding::Base64 => base64::engine::general_purpose::STANDARD.encode(digest),
        }
    }
}

/// Digest a whole buffer
pub fn digest_bytes(data: &[u8], encoding: DigestEncoding) -> String {
    encoding.encode(&Md5::digest(data))
}

/// Digest a chunk stream. Resolves once the stream ends; the first read error
/// is returned and the stream is not polled again.
pub async fn digest_stream<S>(stream: S, encoding: DigestEncoding) -> std::io::Result<String>
where
    S: Stream<Item = std::io::Result<Bytes>>,
{
    futures::pin_mut!(stream);
    let mut hasher = Md5::new();
    while let Some(chunk) = stream.next().await {
        hasher.update(&chunk?);
    }
    Ok(encoding.encode(&hasher.finalize()))
}

/// Digest everything `reader` yields. Returns the digest and the byte count.
pub async fn digest_reader<R>(
    reader: R,
    encoding: DigestEncoding,
) -> std::io::Result<(String, u64)>
where
    R: AsyncRead,
{
    futures::pin_mut!(reader);
    let mut hasher = Md5::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((encoding.encode(&hasher.finalize()), total))
}

/// Digest `len` bytes of a file starting at `offset`.
///
/// Opens its own handle, so the caller's cursor (if any) is untouched.
/// Returns the digest and the number of bytes actually read, which is short
/// when the file ends before `offset + len`.
pub async fn digest_file_range(
    path: &Path,
    offset: u64,
    len: u64,
    encoding: DigestEncoding,
) -> std::io::Result<(String, u64)> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    digest_reader(file.take(len), encoding).await
}

/// Digest a whole file
pub async fn digest_file(path: &Path, encoding: DigestEncoding) -> std::io::Result<String> {
    let file = tokio::fs::File::open(path).await?;
    digest_reader(file, encoding).await.map(|(digest, _)| digest)
}
