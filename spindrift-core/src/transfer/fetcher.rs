//! HTTP piece fetcher against the peer upload endpoint.

use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tracing::debug;

use super::{DownloadPieceRequest, FetchError, PieceFetcher};
use crate::task::TaskError;
use crate::task::digest::Md5Verifier;

/// Fetches piece bodies with ranged GETs against
/// `http://<addr>/download/<prefix>/<taskID>?peerId=<dstPid>`.
pub struct HttpPieceFetcher {
    client: reqwest::Client,
}

impl HttpPieceFetcher {
    /// Creates a fetcher with the given per-piece timeout.
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .connect_timeout(Duration::from_secs(2))
                .pool_idle_timeout(Duration::from_secs(90))
                .build()
                .expect("piece fetcher client construction"),
        }
    }

    fn piece_url(req: &DownloadPieceRequest) -> String {
        format!(
            "http://{}/download/{}/{}?peerId={}",
            req.dst_addr,
            req.task_id.prefix(),
            req.task_id,
            req.dst_peer_id
        )
    }
}

impl Default for HttpPieceFetcher {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[async_trait]
impl PieceFetcher for HttpPieceFetcher {
    async fn download_piece(&self, req: &DownloadPieceRequest) -> Result<Bytes, FetchError> {
        let url = Self::piece_url(req);
        let range_end = req.piece.range_start + req.piece.range_size as u64 - 1;
        debug!(
            "fetching piece {} of task {} from {}",
            req.piece.num, req.task_id, req.dst_addr
        );

        let response = self
            .client
            .get(&url)
            .header(
                reqwest::header::RANGE,
                format!("bytes={}-{range_end}", req.piece.range_start),
            )
            .send()
            .await
            .map_err(|source| FetchError::Connect {
                addr: req.dst_addr.clone(),
                source,
            })?;

        let status = response.status();
        if status.as_u16() >= 300 {
            return Err(FetchError::Status { status });
        }

        let expected = req.piece.range_size as usize;
        let mut body = BytesMut::with_capacity(expected);
        let mut verifier = req
            .calc_digest
            .then(|| Md5Verifier::new(req.piece.md5.clone()));

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let mut chunk = chunk.map_err(FetchError::Transfer)?;
            // identity framing: never consume past the advertised length
            let room = expected - body.len();
            if chunk.len() > room {
                chunk.truncate(room);
            }
            if let Some(verifier) = verifier.as_mut() {
                verifier.update(&chunk);
            }
            body.extend_from_slice(&chunk);
            if body.len() == expected {
                break;
            }
        }

        if body.len() < expected {
            return Err(FetchError::ShortBody {
                expected: req.piece.range_size,
                actual: body.len(),
            });
        }

        if let Some(verifier) = verifier {
            verifier.finish().map_err(|err| match err {
                TaskError::DigestMismatch { expected, actual } => {
                    FetchError::DigestMismatch { expected, actual }
                }
                other => FetchError::DigestMismatch {
                    expected: req.piece.md5.clone(),
                    actual: other.to_string(),
                },
            })?;
        }

        Ok(body.freeze())
    }
}
