use crate::{partial_path, Result};
use futures::StreamExt;
use serde::Serialize;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

const NO_CONNECTION_MESSAGE: &str =
    "No internet connection. Please check your network and try again.";

/// Coarse cause of a failed download, used to decide whether to offer a retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkErrorKind {
    NoConnection,
    HostUnresolvable,
    Timeout,
    Other,
}

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("download failed ({kind:?}): {message}")]
    Network {
        kind: NetworkErrorKind,
        message: String,
    },
    #[error("download cancelled")]
    Cancelled,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl DownloadError {
    fn network(kind: NetworkErrorKind, message: impl Into<String>) -> Self {
        Self::Network {
            kind,
            message: message.into(),
        }
    }

    fn transport(err: reqwest::Error) -> Self {
        let message = error_chain(&err);
        let kind = if err.is_timeout() {
            NetworkErrorKind::Timeout
        } else {
            match classify_message(&message) {
                NetworkErrorKind::Other if err.is_connect() => NetworkErrorKind::NoConnection,
                kind => kind,
            }
        };
        Self::network(kind, message)
    }

    pub fn network_kind(&self) -> Option<NetworkErrorKind> {
        match self {
            Self::Network { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Text suitable for showing next to a retry action.
    pub fn user_message(&self) -> String {
        match self {
            Self::Network {
                kind: NetworkErrorKind::Other,
                message,
            } => message.clone(),
            Self::Network { .. } => NO_CONNECTION_MESSAGE.to_string(),
            Self::Cancelled => "Download cancelled.".to_string(),
            Self::Io(e) => format!("Could not write the model file: {e}"),
        }
    }
}

/// Classify a transport error message into a [`NetworkErrorKind`].
pub fn classify_message(message: &str) -> NetworkErrorKind {
    let message = message.to_ascii_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| message.contains(n));

    if has(&[
        "unable to resolve host",
        "dns error",
        "failed to lookup address",
        "name or service not known",
        "nodename nor servname",
    ]) {
        NetworkErrorKind::HostUnresolvable
    } else if has(&["timeout", "timed out"]) {
        NetworkErrorKind::Timeout
    } else if has(&[
        "network request failed",
        "connection refused",
        "network is unreachable",
        "no route to host",
        "connection reset",
    ]) {
        NetworkErrorKind::NoConnection
    } else {
        NetworkErrorKind::Other
    }
}

fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// One progress tick of a download.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DownloadProgress {
    pub bytes_written: u64,
    /// Zero when the server did not announce a length.
    pub total_bytes: u64,
    pub percent: f64,
}

impl DownloadProgress {
    pub fn new(bytes_written: u64, total_bytes: u64) -> Self {
        let percent = if total_bytes > 0 {
            bytes_written as f64 / total_bytes as f64 * 100.0
        } else {
            0.0
        };
        Self {
            bytes_written,
            total_bytes,
            percent,
        }
    }
}

/// Fetches model artifacts over HTTP.
///
/// Downloads are not resumable: a failed or cancelled attempt removes its
/// partial file and the next attempt starts from zero.
#[derive(Debug, Clone, Default)]
pub struct DownloadManager {
    client: reqwest::Client,
}

impl DownloadManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    pub fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    pub async fn download<F>(
        &self,
        url: &str,
        dest: &Path,
        auth_token: Option<&str>,
        on_progress: F,
    ) -> Result<u64>
    where
        F: FnMut(DownloadProgress),
    {
        self.download_cancellable(url, dest, auth_token, &CancellationToken::new(), on_progress)
            .await
    }

    /// Download `url` to `dest`, returning the number of bytes written.
    ///
    /// Only HTTP 200 counts as success. The body is staged next to `dest` and
    /// renamed into place once complete.
    pub async fn download_cancellable<F>(
        &self,
        url: &str,
        dest: &Path,
        auth_token: Option<&str>,
        cancel: &CancellationToken,
        mut on_progress: F,
    ) -> Result<u64>
    where
        F: FnMut(DownloadProgress),
    {
        if cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        tracing::info!("Downloading {} to {:?}", url, dest);

        let mut request = self.client.get(url);
        if let Some(token) = auth_token {
            request = request.bearer_auth(token);
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
            res = request.send() => res.map_err(DownloadError::transport)?,
        };

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(DownloadError::network(
                NetworkErrorKind::Other,
                format!("HTTP {}: {}", status, url),
            ));
        }

        let total = response.content_length().unwrap_or(0);
        let tmp = partial_path(dest);

        match write_body(response, &tmp, total, cancel, &mut on_progress).await {
            Ok(written) => {
                tokio::fs::rename(&tmp, dest).await.inspect_err(|_| {
                    let _ = std::fs::remove_file(&tmp);
                })?;
                tracing::info!(bytes = written, "Download complete: {:?}", dest);
                Ok(written)
            }
            Err(e) => {
                if let Err(rm) = tokio::fs::remove_file(&tmp).await {
                    if rm.kind() != std::io::ErrorKind::NotFound {
                        tracing::warn!("Failed to remove partial download {:?}: {}", tmp, rm);
                    }
                }
                Err(e)
            }
        }
    }
}

async fn write_body<F>(
    response: reqwest::Response,
    tmp: &Path,
    total: u64,
    cancel: &CancellationToken,
    on_progress: &mut F,
) -> Result<u64>
where
    F: FnMut(DownloadProgress),
{
    let mut file = tokio::fs::File::create(tmp).await?;
    let mut stream = response.bytes_stream();
    let mut written = 0u64;
    let mut last_logged_decile = 0u64;

    on_progress(DownloadProgress::new(0, total));

    loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
            chunk = stream.next() => chunk,
        };
        let Some(chunk) = chunk else { break };
        let chunk = chunk.map_err(DownloadError::transport)?;

        file.write_all(&chunk).await?;
        written += chunk.len() as u64;

        let progress = DownloadProgress::new(written, total);
        let decile = (progress.percent / 10.0) as u64;
        if decile > last_logged_decile {
            last_logged_decile = decile;
            tracing::debug!("Download progress: {:.1}%", progress.percent);
        }
        on_progress(progress);
    }

    file.flush().await?;
    Ok(written)
}
