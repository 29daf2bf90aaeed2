//! Transfer Worker
//!
//! Streams one remote asset into its staging path. The staged file is removed on every
//! failure and on cancellation before control returns to the caller.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

use crate::error::JobError;
use crate::events::JobReporter;
use crate::fs_utils;
use crate::models::{RemoteRef, RemoteSource};

type ByteStream = BoxStream<'static, Result<Bytes, JobError>>;

/// Result of a finished transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TransferOutcome {
    pub bytes_written: u64,
    pub bytes_total: Option<u64>,
}

pub(crate) struct TransferWorker {
    client: reqwest::Client,
    chunk_size: usize,
    stall_timeout: Duration,
}

impl TransferWorker {
    pub(crate) fn new(
        connect_timeout: Duration,
        stall_timeout: Duration,
        chunk_size: usize,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .user_agent(concat!("romdeck/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("build http client")?;
        Ok(Self {
            client,
            chunk_size: chunk_size.max(4096),
            stall_timeout,
        })
    }

    /// Stream `remote` into `staged`.
    pub(crate) async fn run(
        &self,
        remote: &RemoteRef,
        staged: &Path,
        token: &CancellationToken,
        reporter: &mut JobReporter,
    ) -> Result<TransferOutcome, JobError> {
        let result = self.transfer(remote, staged, token, reporter).await;
        if let Err(e) = &result {
            log::info!("Transfer for {} ended: {}", reporter.item_id(), e);
            fs_utils::discard(staged).await;
        }
        result
    }

    async fn transfer(
        &self,
        remote: &RemoteRef,
        staged: &Path,
        token: &CancellationToken,
        reporter: &mut JobReporter,
    ) -> Result<TransferOutcome, JobError> {
        let (mut stream, reported) = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(JobError::Cancelled),
            opened = tokio::time::timeout(self.stall_timeout, self.open(remote)) => {
                opened.map_err(|_| {
                    JobError::Network(format!(
                        "timeout: no response from {} within {}s",
                        remote.describe(),
                        self.stall_timeout.as_secs()
                    ))
                })??
            }
        };

        let expected = match (remote.size_hint, reported) {
            (Some(hint), Some(len)) if hint != len => {
                log::warn!(
                    "Source {} reports {} bytes, catalog expects {}",
                    remote.describe(),
                    len,
                    hint
                );
                return Err(JobError::SizeMismatch {
                    expected: hint,
                    actual: len,
                });
            }
            (hint, len) => hint.or(len),
        };

        if let Some(parent) = staged.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| JobError::disk("create staging dir", e))?;
        }
        let mut file = fs::File::create(staged)
            .await
            .map_err(|e| JobError::disk("create staged file", e))?;

        reporter.transfer_progress(0, expected, true).await;

        let mut written: u64 = 0;
        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(JobError::Cancelled),
                next = tokio::time::timeout(self.stall_timeout, stream.next()) => next,
            };
            let chunk = match next {
                Err(_) => {
                    return Err(JobError::Network(format!(
                        "no data received for {}s",
                        self.stall_timeout.as_secs()
                    )))
                }
                Ok(None) => break,
                Ok(Some(chunk)) => chunk?,
            };

            written += chunk.len() as u64;
            if let Some(total) = expected {
                if written > total {
                    return Err(JobError::SizeMismatch {
                        expected: total,
                        actual: written,
                    });
                }
            }
            file.write_all(&chunk)
                .await
                .map_err(|e| JobError::disk("write staged file", e))?;
            reporter.transfer_progress(written, expected, false).await;
        }

        file.flush()
            .await
            .map_err(|e| JobError::disk("flush staged file", e))?;
        file.sync_all()
            .await
            .map_err(|e| JobError::disk("sync staged file", e))?;
        drop(file);

        if let Some(total) = expected {
            if written != total {
                log::warn!(
                    "Short transfer for {}: {} of {} bytes",
                    reporter.item_id(),
                    written,
                    total
                );
                return Err(JobError::SizeMismatch {
                    expected: total,
                    actual: written,
                });
            }
        }

        let bytes_total = expected.or(Some(written));
        reporter.transfer_progress(written, bytes_total, true).await;
        log::info!(
            "Transferred {} bytes for {} into {}",
            written,
            reporter.item_id(),
            staged.display()
        );

        Ok(TransferOutcome {
            bytes_written: written,
            bytes_total,
        })
    }

    async fn open(&self, remote: &RemoteRef) -> Result<(ByteStream, Option<u64>), JobError> {
        match &remote.source {
            RemoteSource::Http { url, headers } => {
                let response = self
                    .client
                    .get(url.clone())
                    .headers(headers.clone())
                    .send()
                    .await
                    .map_err(|e| JobError::Network(e.to_string()))?;

                let status = response.status();
                if !status.is_success() {
                    return Err(JobError::Network(format!(
                        "{} returned {}",
                        remote.describe(),
                        status
                    )));
                }

                let len = response.content_length();
                let stream = response
                    .bytes_stream()
                    .map(|chunk| chunk.map_err(|e| JobError::Network(e.to_string())))
                    .boxed();
                Ok((stream, len))
            }
            RemoteSource::Local(path) => {
                let file = fs::File::open(path).await.map_err(|e| {
                    JobError::Network(format!("open source {}: {}", path.display(), e))
                })?;
                let len = file.metadata().await.ok().map(|m| m.len());
                let stream = ReaderStream::with_capacity(file, self.chunk_size)
                    .map(|chunk| chunk.map_err(|e| JobError::Network(format!("read source: {e}"))))
                    .boxed();
                Ok((stream, len))
            }
        }
    }
}
