use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::FeedError;

/// Downloads `url` into `dest`. Plain paths and `file://` URLs are copied,
/// which is how local feeds and tests are served. Returns bytes written.
pub async fn fetch_to(client: &reqwest::Client, url: &str, dest: &Path) -> Result<u64, FeedError> {
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        let local = url.strip_prefix("file://").unwrap_or(url);
        let bytes = tokio::fs::copy(local, dest).await?;
        debug!(url, bytes, "Copied local feed");
        return Ok(bytes);
    }

    let fetch_err = |source| FeedError::Fetch {
        url: url.to_string(),
        source,
    };
    let mut response = client.get(url).send().await.map_err(fetch_err)?;
    if !response.status().is_success() {
        return Err(FeedError::Status {
            url: url.to_string(),
            status: response.status(),
        });
    }

    let mut file = tokio::fs::File::create(dest).await?;
    let mut total = 0u64;
    while let Some(chunk) = response.chunk().await.map_err(fetch_err)? {
        file.write_all(&chunk).await?;
        total += chunk.len() as u64;
    }
    file.flush().await?;
    debug!(url, bytes = total, "Downloaded feed");
    Ok(total)
}

/// Downloaded feed that is deleted when dropped, whatever way the run ends.
pub struct TempFeed {
    path: PathBuf,
}

impl TempFeed {
    pub fn new(path: PathBuf) -> Self {
        TempFeed { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempFeed {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove temp feed {:?}: {}", self.path, e),
        }
    }
}
