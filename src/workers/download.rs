//! Download worker: pulls chunk fetches off the queue, streams them into
//! scratch slots, verifies on-wire checksums, and reports results.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use flate2::write::ZlibDecoder;
use log::{debug, error, warn};
use md5::{Digest, Md5};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use crate::engine::tasks::{
    DownloadKind, DownloadMessage, DownloadTaskResult, FailReason, V1Download, V2Download,
};
use crate::types::{Endpoint, SecureLink, SecureLinks};
use crate::utils::config::{DownloadConsts, ExecutorConsts};
use crate::utils::paths::{galaxy_path, merge_url_with_params, range_header};

enum FetchError {
    /// 401 from the CDN; terminal, no retries.
    Unauthorized,
    /// Anything else worth another attempt.
    Retry(anyhow::Error),
}

type FetchOutcome = Result<(u64, u64), FailReason>;

/// Worker body: one HTTP client per worker, cancellation polled between
/// queue waits and byte-range reads. Exits without a result when cancelled
/// mid-chunk; the orchestrator times out and proceeds to shutdown.
pub fn download_worker(
    rx: Receiver<DownloadMessage>,
    res_tx: Sender<DownloadTaskResult>,
    speed_tx: Sender<(u64, u64)>,
    secure_links: Arc<SecureLinks>,
    cancel: Arc<AtomicBool>,
) {
    let client = match Client::builder().timeout(DownloadConsts::HTTP_TIMEOUT).build() {
        Ok(client) => client,
        Err(e) => {
            error!("could not build HTTP client: {e}");
            return;
        }
    };

    loop {
        if cancel.load(Ordering::Relaxed) {
            debug!("download worker cancelled");
            return;
        }
        let msg = match rx.recv_timeout(ExecutorConsts::QUEUE_WAIT) {
            Ok(msg) => msg,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return,
        };
        let task = match msg {
            DownloadMessage::Terminate => break,
            DownloadMessage::Task(task) => task,
        };

        let outcome = match &task.kind {
            DownloadKind::V2(dl) => download_v2_chunk(&client, dl, &secure_links, &speed_tx, &cancel),
            DownloadKind::V1(dl) => download_v1_chunk(&client, dl, &secure_links, &speed_tx, &cancel),
        };
        let result = match outcome {
            Some(Ok((downloaded, decompressed))) => {
                DownloadTaskResult::ok(task, downloaded, decompressed)
            }
            Some(Err(reason)) => DownloadTaskResult::failed(task, reason),
            // Cancelled mid-stream.
            None => return,
        };
        if res_tx.send(result).is_err() {
            return;
        }
    }
    debug!("download worker exiting");
}

/// Fetch a V2 chunk: stream, hash the compressed bytes, decompress into the
/// scratch slot, verify against the chunk's CDN identity.
fn download_v2_chunk(
    client: &Client,
    dl: &V2Download,
    links: &SecureLinks,
    speed_tx: &Sender<(u64, u64)>,
    cancel: &AtomicBool,
) -> Option<FetchOutcome> {
    let Some(url) = resolve_v2_url(links, &dl.product_id, &dl.compressed_md5) else {
        warn!("no secure link for product {}", dl.product_id);
        return Some(Err(FailReason::MissingChunk));
    };

    let mut attempts = DownloadConsts::RETRIES;
    loop {
        if cancel.load(Ordering::Relaxed) {
            return None;
        }
        match stream_v2_once(client, &url, &dl.scratch, speed_tx, cancel) {
            Ok(None) => return None,
            Ok(Some((downloaded, decompressed, digest))) => {
                if digest != dl.compressed_md5 {
                    warn!("chunk {} arrived with a bad checksum", dl.compressed_md5);
                    return Some(Err(FailReason::Checksum));
                }
                return Some(Ok((downloaded, decompressed)));
            }
            Err(FetchError::Unauthorized) => return Some(Err(FailReason::Unauthorized)),
            Err(FetchError::Retry(e)) => {
                attempts -= 1;
                if attempts == 0 {
                    warn!("chunk {} failed after all retries: {e:#}", dl.compressed_md5);
                    return Some(Err(FailReason::Checksum));
                }
                warn!("connection failed ({e:#}), retrying");
                thread::sleep(DownloadConsts::RETRY_PAUSE);
            }
        }
    }
}

fn stream_v2_once(
    client: &Client,
    url: &str,
    scratch: &Path,
    speed_tx: &Sender<(u64, u64)>,
    cancel: &AtomicBool,
) -> Result<Option<(u64, u64, String)>, FetchError> {
    let mut response = client.get(url).send().map_err(|e| FetchError::Retry(e.into()))?;
    if response.status() == StatusCode::UNAUTHORIZED {
        return Err(FetchError::Unauthorized);
    }
    if !response.status().is_success() {
        return Err(FetchError::Retry(anyhow::anyhow!("HTTP {}", response.status())));
    }

    let out = File::create(scratch).map_err(|e| FetchError::Retry(e.into()))?;
    let mut decoder = ZlibDecoder::new(BufWriter::new(out));
    let mut hasher = Md5::new();
    let mut buf = vec![0u8; DownloadConsts::STREAM_CHUNK_SIZE];
    let mut downloaded = 0u64;

    loop {
        if cancel.load(Ordering::Relaxed) {
            return Ok(None);
        }
        let n = response.read(&mut buf).map_err(|e| FetchError::Retry(e.into()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        let out_before = decoder.total_out();
        decoder.write_all(&buf[..n]).map_err(|e| FetchError::Retry(e.into()))?;
        downloaded += n as u64;
        let _ = speed_tx.send((n as u64, decoder.total_out() - out_before));
    }
    decoder.try_finish().map_err(|e| FetchError::Retry(e.into()))?;
    let decompressed = decoder.total_out();
    let mut inner = decoder.finish().map_err(|e| FetchError::Retry(e.into()))?;
    inner.flush().map_err(|e| FetchError::Retry(e.into()))?;
    Ok(Some((downloaded, decompressed, hex::encode(hasher.finalize()))))
}

/// Fetch a V1 byte range. No decompression and no running hash: V1 content
/// is verified by whole-file hash when the writer closes the file; here only
/// the byte count is checked.
fn download_v1_chunk(
    client: &Client,
    dl: &V1Download,
    links: &SecureLinks,
    speed_tx: &Sender<(u64, u64)>,
    cancel: &AtomicBool,
) -> Option<FetchOutcome> {
    let Some(url) = resolve_v1_url(links, &dl.product_id) else {
        warn!("no secure link for product {}", dl.product_id);
        return Some(Err(FailReason::MissingChunk));
    };

    let mut attempts = DownloadConsts::RETRIES;
    loop {
        if cancel.load(Ordering::Relaxed) {
            return None;
        }
        match stream_v1_once(client, &url, dl, speed_tx, cancel) {
            Ok(None) => return None,
            Ok(Some(downloaded)) => {
                if downloaded != dl.size {
                    warn!(
                        "range {} returned {downloaded} of {} bytes",
                        dl.chunk_id, dl.size
                    );
                    return Some(Err(FailReason::Checksum));
                }
                return Some(Ok((downloaded, downloaded)));
            }
            Err(FetchError::Unauthorized) => return Some(Err(FailReason::Unauthorized)),
            Err(FetchError::Retry(e)) => {
                attempts -= 1;
                if attempts == 0 {
                    warn!("range {} failed after all retries: {e:#}", dl.chunk_id);
                    return Some(Err(FailReason::Checksum));
                }
                warn!("connection failed ({e:#}), retrying");
                thread::sleep(DownloadConsts::RETRY_PAUSE);
            }
        }
    }
}

fn stream_v1_once(
    client: &Client,
    url: &str,
    dl: &V1Download,
    speed_tx: &Sender<(u64, u64)>,
    cancel: &AtomicBool,
) -> Result<Option<u64>, FetchError> {
    let mut response = client
        .get(url)
        .header(reqwest::header::RANGE, range_header(dl.offset, dl.size))
        .send()
        .map_err(|e| FetchError::Retry(e.into()))?;
    if response.status() == StatusCode::UNAUTHORIZED {
        return Err(FetchError::Unauthorized);
    }
    if !response.status().is_success() {
        return Err(FetchError::Retry(anyhow::anyhow!("HTTP {}", response.status())));
    }

    let out = File::create(&dl.scratch).map_err(|e| FetchError::Retry(e.into()))?;
    let mut writer = BufWriter::new(out);
    let mut buf = vec![0u8; DownloadConsts::STREAM_CHUNK_SIZE];
    let mut downloaded = 0u64;

    loop {
        if cancel.load(Ordering::Relaxed) {
            return Ok(None);
        }
        let n = response.read(&mut buf).map_err(|e| FetchError::Retry(e.into()))?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).map_err(|e| FetchError::Retry(e.into()))?;
        downloaded += n as u64;
        let _ = speed_tx.send((n as u64, n as u64));
    }
    writer.flush().map_err(|e| FetchError::Retry(e.into()))?;
    Ok(Some(downloaded))
}

/// Resolve the CDN URL for a V2 chunk via its galaxy path.
fn resolve_v2_url(links: &SecureLinks, product_id: &str, compressed_md5: &str) -> Option<String> {
    let suffix = format!("/{}", galaxy_path(compressed_md5));
    match links.get(product_id)? {
        SecureLink::Url(base) => Some(format!("{base}{suffix}")),
        SecureLink::Endpoints(endpoints) => {
            endpoints.first().map(|ep| resolve_endpoint(ep, &suffix))
        }
    }
}

/// Resolve the product blob URL for a V1 ranged fetch.
fn resolve_v1_url(links: &SecureLinks, product_id: &str) -> Option<String> {
    match links.get(product_id)? {
        SecureLink::Url(url) => Some(url.clone()),
        SecureLink::Endpoints(endpoints) => {
            endpoints.first().map(|ep| resolve_endpoint(ep, "/main.bin"))
        }
    }
}

/// Append `suffix` to the endpoint's path parameter and render the URL.
/// Redist endpoints carry a literal `url` instead of a template.
fn resolve_endpoint(endpoint: &Endpoint, suffix: &str) -> String {
    if let Some(url) = &endpoint.url {
        return format!("{url}{suffix}");
    }
    let mut parameters = endpoint.parameters.clone();
    let path = parameters
        .get("path")
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    parameters.insert(
        "path".to_string(),
        serde_json::Value::String(format!("{path}{suffix}")),
    );
    merge_url_with_params(&endpoint.url_format, &parameters)
}
