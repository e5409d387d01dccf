//! Periodic reclamation of stalled dispatches.

use std::sync::mpsc::{channel, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::{HubConfig, DEFAULT_LOST_SCAN_PAGE_SIZE};
use crate::error::HubError;
use crate::model::Dispatch;
use crate::queue::Publisher;
use crate::repository::{ContinuationToken, Repository};
use crate::sink::EventSink;

/// Result of one full pass over the ongoing dispatches.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ScanReport {
    pub pages: usize,
    pub lost: Vec<Dispatch>,
}

/// Pages through every ongoing dispatch, marking stale ones lost.
pub struct LostDispatchScanner<R, P> {
    sink: Arc<EventSink<R, P>>,
    page_size: usize,
    threshold_seconds: Option<u64>,
}

impl<R, P> LostDispatchScanner<R, P>
where
    R: Repository,
    P: Publisher,
{
    /// Uses the sink's configured threshold.
    pub fn new(sink: Arc<EventSink<R, P>>) -> Self {
        Self {
            sink,
            page_size: DEFAULT_LOST_SCAN_PAGE_SIZE,
            threshold_seconds: None,
        }
    }

    pub fn from_config(sink: Arc<EventSink<R, P>>, config: &HubConfig) -> Self {
        Self::new(sink)
            .with_page_size(config.lost_scan_page_size)
            .with_threshold(config.lost_threshold_seconds)
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_threshold(mut self, seconds: u64) -> Self {
        self.threshold_seconds = Some(seconds);
        self
    }

    /// Follow continuation tokens until the listing is exhausted.
    pub fn scan_all(&self) -> Result<ScanReport, HubError> {
        let mut report = ScanReport::default();
        let mut token: Option<ContinuationToken> = None;

        loop {
            let page = self.sink.mark_lost_dispatches(
                Some(self.page_size),
                self.threshold_seconds,
                token.take(),
            )?;
            report.pages += 1;
            report.lost.extend(page.dispatches);

            match page.continuation {
                Some(next) => token = Some(next),
                None => break,
            }
        }

        tracing::debug!(
            pages = report.pages,
            lost = report.lost.len(),
            "lost-dispatch scan finished"
        );
        Ok(report)
    }
}

/// Statistics from the scanner thread.
#[derive(Debug, Default, Clone)]
pub struct ScannerStats {
    pub scans: usize,
    pub lost: usize,
    pub errors: usize,
}

/// Runs [`LostDispatchScanner::scan_all`] on an interval until stopped.
pub struct LostScannerThread {
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<ScannerStats>>,
}

impl LostScannerThread {
    /// Scan immediately, then once per `interval`.
    pub fn spawn<R, P>(scanner: LostDispatchScanner<R, P>, interval: Duration) -> Self
    where
        R: Repository + 'static,
        P: Publisher + 'static,
    {
        let (stop_tx, stop_rx) = channel();

        let handle = thread::spawn(move || {
            let mut stats = ScannerStats::default();

            loop {
                stats.scans += 1;
                match scanner.scan_all() {
                    Ok(report) => stats.lost += report.lost.len(),
                    Err(err) => {
                        stats.errors += 1;
                        tracing::error!(error = %err, "lost-dispatch scan failed");
                    }
                }

                match stop_rx.recv_timeout(interval) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => {}
                }
            }

            stats
        });

        Self {
            stop_tx,
            handle: Some(handle),
        }
    }

    /// Signal the scanner to stop and wait for the current pass to finish.
    pub fn stop(mut self) -> ScannerStats {
        let _ = self.stop_tx.send(());
        self.handle
            .take()
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default()
    }
}

impl Drop for LostScannerThread {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(());
    }
}
