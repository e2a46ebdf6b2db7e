//! Fallback merger.
//!
//! When the completion call returns raw chunk URLs, the server has
//! deferred merging to the caller. Downloads run with bounded
//! concurrency into temp part files; concatenation happens strictly in
//! original index order — never download-completion order — into a temp
//! output that is renamed into place only after the combined size
//! checks out. Any single download failure aborts the merge with no
//! partial output retained.

use futures::{StreamExt, TryStreamExt, stream};
use std::path::{Path, PathBuf};
use tokio::{
    fs::{self, File},
    io::{self, AsyncWriteExt},
};
use tracing::debug;
use uuid::Uuid;

use super::{ClientError, ClientResult, RelayClient};

/// Fallback merge knobs.
#[derive(Debug, Clone)]
pub struct FallbackOptions {
    /// Chunk downloads in flight at once.
    pub concurrency: usize,
}

impl Default for FallbackOptions {
    fn default() -> Self {
        Self { concurrency: 5 }
    }
}

/// Download every chunk URL and reproduce the artifact at `output`.
/// Returns the merged size in bytes.
pub async fn merge_chunk_urls(
    client: &RelayClient,
    chunk_urls: &[String],
    output: &Path,
    opts: &FallbackOptions,
) -> ClientResult<u64> {
    if chunk_urls.is_empty() {
        return Err(ClientError::MalformedResponse("empty chunk URL list".into()));
    }

    let parent = output.parent().filter(|p| !p.as_os_str().is_empty());
    if let Some(parent) = parent {
        fs::create_dir_all(parent).await?;
    }
    let parts_dir = parent
        .unwrap_or(Path::new("."))
        .join(format!(".parts-{}", Uuid::new_v4().simple()));
    fs::create_dir_all(&parts_dir).await?;

    let downloaded: ClientResult<Vec<(usize, PathBuf, u64)>> =
        stream::iter(chunk_urls.iter().enumerate().map(|(index, url)| {
            let part_path = parts_dir.join(format!("part-{:05}.bin", index));
            async move {
                let bytes = client.download(url).await?;
                fs::write(&part_path, &bytes).await?;
                debug!(index, %url, size = bytes.len(), "chunk downloaded");
                Ok((index, part_path, bytes.len() as u64))
            }
        }))
        .buffer_unordered(opts.concurrency.max(1))
        .try_collect()
        .await;

    let mut parts = match downloaded {
        Ok(parts) => parts,
        Err(err) => {
            let _ = fs::remove_dir_all(&parts_dir).await;
            return Err(err);
        }
    };

    // Results arrive in completion order; the artifact is index order.
    parts.sort_by_key(|(index, _, _)| *index);

    let result = concat_parts(&parts, output).await;

    for (_, path, _) in &parts {
        let _ = fs::remove_file(path).await;
    }
    let _ = fs::remove_dir(&parts_dir).await;

    result
}

/// Concatenate part files, in the order given, into `output` via a temp
/// file and rename. Verifies the written size equals the sum of part
/// sizes before committing.
async fn concat_parts(parts: &[(usize, PathBuf, u64)], output: &Path) -> ClientResult<u64> {
    let expected: u64 = parts.iter().map(|(_, _, size)| size).sum();
    let file_name = output
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("merged");
    let tmp = output
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."))
        .join(format!(".{}.tmp-{}", file_name, Uuid::new_v4().simple()));

    let write = async {
        let mut out = File::create(&tmp).await?;
        let mut written: u64 = 0;
        for (_, path, _) in parts {
            let mut part = File::open(path).await?;
            written += io::copy(&mut part, &mut out).await?;
        }
        out.flush().await?;
        out.sync_all().await?;
        Ok::<u64, std::io::Error>(written)
    };

    let written = match write.await {
        Ok(written) => written,
        Err(err) => {
            let _ = fs::remove_file(&tmp).await;
            return Err(err.into());
        }
    };

    if written != expected {
        let _ = fs::remove_file(&tmp).await;
        return Err(ClientError::SizeMismatch {
            expected,
            actual: written,
        });
    }

    fs::rename(&tmp, output).await?;
    Ok(written)
}
