//! Streaming file digests.

use std::io;
use std::path::Path;

use md5::{Digest, Md5};
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use crate::core::message::FileId;

const READ_BUF: usize = 64 * 1024;

/// Compute the MD5 digest of a file by streaming it through the hasher.
/// Returns the digest and the file's length in bytes.
pub async fn digest_file(path: &Path) -> io::Result<(FileId, u64)> {
    let mut file = File::open(path).await?;
    let mut hasher = Md5::new();
    let mut buf = vec![0u8; READ_BUF];
    let mut total = 0u64;

    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }

    Ok((FileId::from_bytes(hasher.finalize().into()), total))
}
