//! Download/write throughput accounting for an external reporter.
//!
//! The coordinator loops feed per-event totals straight to the reporter;
//! the speed meter thread additionally drains the workers' fine-grained
//! slice updates into periodic rate snapshots. What the reporter does with
//! either is its business.

use crossbeam_channel::{Receiver, RecvTimeoutError};
use log::debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use crate::utils::config::ProgressConsts;

/// Consumer of install progress, identified and owned by the caller.
pub trait ProgressReporter: Send + Sync {
    /// A chunk finished downloading: compressed bytes received, bytes landed
    /// in scratch.
    fn downloaded(&self, compressed: u64, decompressed: u64);
    /// The writer committed bytes to the target tree.
    fn written(&self, bytes: u64);
    /// Periodic rate snapshot (bytes/s) from the speed meter.
    fn speeds(&self, _download_bps: f64, _write_bps: f64) {}
}

/// Reporter that logs rate snapshots at debug level; the CLI default.
#[derive(Default)]
pub struct LogReporter;

impl ProgressReporter for LogReporter {
    fn downloaded(&self, _compressed: u64, _decompressed: u64) {}

    fn written(&self, _bytes: u64) {}

    fn speeds(&self, download_bps: f64, write_bps: f64) {
        debug!(
            "down {}/s, write {}/s",
            crate::utils::paths::readable_size(download_bps as u64),
            crate::utils::paths::readable_size(write_bps as u64),
        );
    }
}

/// Drain the worker speed queues into windowed rates until `running` drops.
/// Slice updates are (raw, processed) byte pairs; only the raw side rates.
pub fn speed_meter_loop(
    download_speed_rx: Receiver<(u64, u64)>,
    writer_speed_rx: Receiver<(u64, u64)>,
    reporter: Arc<dyn ProgressReporter>,
    running: Arc<AtomicBool>,
) {
    let mut window_start = Instant::now();
    let mut downloaded: u64 = 0;
    let mut written: u64 = 0;

    while running.load(Ordering::Relaxed) {
        match download_speed_rx.recv_timeout(ProgressConsts::SPEED_WINDOW / 4) {
            Ok((raw, _)) => downloaded += raw,
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        while let Ok((raw, _)) = download_speed_rx.try_recv() {
            downloaded += raw;
        }
        while let Ok((raw, _)) = writer_speed_rx.try_recv() {
            written += raw;
        }

        let elapsed = window_start.elapsed();
        if elapsed >= ProgressConsts::SPEED_WINDOW {
            let secs = elapsed.as_secs_f64();
            reporter.speeds(downloaded as f64 / secs, written as f64 / secs);
            downloaded = 0;
            written = 0;
            window_start = Instant::now();
        }
    }
    debug!("speed meter exiting");
}
