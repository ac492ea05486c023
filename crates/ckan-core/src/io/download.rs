//! Concurrent multi-file downloader with shared cancellation and progress.
//!
//! Every batch runs one worker per URL. Workers share a cancellation token
//! and report into one progress aggregator. The last worker to settle fires
//! the completion callback and releases the one-shot barrier that
//! [`DownloadHandle::wait`] blocks on.
//!
//! Two backends implement the transfers:
//! - `Native`: async `reqwest` on a dedicated tokio runtime.
//! - `Threaded`: one OS thread per transfer using `reqwest::blocking`.

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use futures::StreamExt;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::Reporter;

const CHUNK_SIZE: usize = 64 * 1024;

/// Failure of a single transfer.
#[derive(Error, Debug)]
pub enum FileError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Server responded with status {0}")]
    Status(u16),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Cancelled")]
    Cancelled,
}

#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("Download cancelled by user")]
    UserCancelled,

    #[error("Missing SSL/TLS certificates, cannot download {0}")]
    MissingCertificate(String),

    #[error("Download failed: {}", summarize(.0))]
    DownloadErrors(Vec<(String, FileError)>),
}

fn summarize(errors: &[(String, FileError)]) -> String {
    errors
        .iter()
        .map(|(url, e)| format!("{url}: {e}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Full message of an error including its source chain.
fn error_chain(err: &dyn std::error::Error) -> String {
    let mut msg = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        msg.push_str(": ");
        msg.push_str(&inner.to_string());
        source = inner.source();
    }
    msg
}

fn is_certificate_error(err: &FileError) -> bool {
    const PATTERNS: [&str; 4] = [
        "authentication or decryption has failed",
        "certificate",
        "unknown issuer",
        "tls handshake",
    ];
    let msg = error_chain(err).to_lowercase();
    PATTERNS.iter().any(|p| msg.contains(p))
}

impl DownloadError {
    /// Classifies the failures of a settled batch.
    ///
    /// Cancellation wins over everything else, then certificate problems,
    /// then the aggregate of all failures.
    pub fn from_failures(failures: Vec<(String, FileError)>, cancelled: bool) -> Self {
        if cancelled {
            return Self::UserCancelled;
        }
        if let Some((url, _)) = failures.iter().find(|(_, e)| is_certificate_error(e)) {
            return Self::MissingCertificate(url.clone());
        }
        Self::DownloadErrors(failures)
    }
}

/// How transfers are performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadBackend {
    Native,
    Threaded,
}

impl DownloadBackend {
    /// The platform-native client on Windows, pooled threads elsewhere.
    pub fn for_host() -> Self {
        if cfg!(windows) {
            Self::Native
        } else {
            Self::Threaded
        }
    }
}

/// One URL to fetch, with the size the metadata claims for it.
#[derive(Debug, Clone)]
pub struct DownloadTarget {
    pub url: String,
    pub expected_size: Option<u64>,
}

impl DownloadTarget {
    pub fn new(url: impl Into<String>, expected_size: Option<u64>) -> Self {
        Self {
            url: url.into(),
            expected_size,
        }
    }
}

/// Terminal state of one transfer. On success the path is a kept temp file
/// the caller now owns.
#[derive(Debug)]
pub struct DownloadOutcome {
    pub url: String,
    pub result: Result<PathBuf, FileError>,
}

type CompletionCallback = Box<dyn FnOnce(&[DownloadOutcome]) + Send>;

#[derive(Debug)]
struct Part {
    received: u64,
    size: Option<u64>,
    last_report: Option<Instant>,
}

/// Aggregates per-file byte counts into batch-wide progress reports.
struct Progress {
    reporter: Arc<dyn Reporter>,
    interval: Duration,
    started: Instant,
    parts: Mutex<Vec<Part>>,
}

impl Progress {
    fn new(reporter: Arc<dyn Reporter>, interval: Duration, targets: &[DownloadTarget]) -> Self {
        let parts = targets
            .iter()
            .map(|t| Part {
                received: 0,
                size: t.expected_size,
                last_report: None,
            })
            .collect();
        Self {
            reporter,
            interval,
            started: Instant::now(),
            parts: Mutex::new(parts),
        }
    }

    fn parts(&self) -> MutexGuard<'_, Vec<Part>> {
        match self.parts.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn set_size(&self, index: usize, size: Option<u64>) {
        if let Some(size) = size {
            self.parts()[index].size = Some(size);
        }
    }

    fn advance(&self, index: usize, bytes: u64) {
        let now = Instant::now();
        let report = {
            let mut parts = self.parts();
            let part = &mut parts[index];
            part.received += bytes;
            let due = part
                .last_report
                .is_none_or(|last| now.duration_since(last) >= self.interval);
            if !due {
                return;
            }
            part.last_report = Some(now);

            let received: u64 = parts.iter().map(|p| p.received).sum();
            let total: u64 = parts
                .iter()
                .map(|p| p.size.unwrap_or(p.received).max(p.received))
                .sum();
            (received, total)
        };

        let (received, total) = report;
        let elapsed = now.duration_since(self.started).as_secs_f64().max(0.001);
        let kbps = (received as f64 / elapsed / 1024.0) as u64;
        let percent = if total == 0 {
            0
        } else {
            ((received * 100) / total).min(100) as u8
        };
        let mb_left = total.saturating_sub(received) as f64 / (1024.0 * 1024.0);
        self.reporter.progress(
            &format!("{kbps} kbps - downloading - {mb_left:.1} MB left"),
            percent,
        );
    }
}

struct BatchState {
    slots: Vec<Option<DownloadOutcome>>,
    remaining: usize,
    on_complete: Option<CompletionCallback>,
    done: Option<oneshot::Sender<Vec<DownloadOutcome>>>,
}

/// Completion barrier shared by the workers of one batch.
struct Batch {
    reporter: Arc<dyn Reporter>,
    state: Mutex<BatchState>,
}

impl Batch {
    fn finish(&self, index: usize, outcome: DownloadOutcome) {
        match &outcome.result {
            Ok(path) => debug!(url = %outcome.url, path = %path.display(), "Download finished"),
            Err(e) => warn!(url = %outcome.url, error = %e, "Download failed"),
        }

        let ready = {
            let mut state = match self.state.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            state.slots[index] = Some(outcome);
            state.remaining -= 1;
            if state.remaining == 0 {
                let slots = std::mem::take(&mut state.slots);
                Some((slots, state.on_complete.take(), state.done.take()))
            } else {
                None
            }
        };

        if let Some((slots, on_complete, done)) = ready {
            let outcomes: Vec<DownloadOutcome> = slots.into_iter().flatten().collect();
            Self::complete(&self.reporter, outcomes, on_complete, done);
        }
    }

    fn complete(
        reporter: &Arc<dyn Reporter>,
        outcomes: Vec<DownloadOutcome>,
        on_complete: Option<CompletionCallback>,
        done: Option<oneshot::Sender<Vec<DownloadOutcome>>>,
    ) {
        let failed = outcomes.iter().filter(|o| o.result.is_err()).count();
        reporter.downloads_completed(outcomes.len() - failed, failed);
        if let Some(callback) = on_complete {
            callback(&outcomes);
        }
        if let Some(done) = done {
            let _ = done.send(outcomes);
        }
    }
}

/// A running batch.
#[derive(Debug)]
pub struct DownloadHandle {
    done: oneshot::Receiver<Vec<DownloadOutcome>>,
    cancel: CancellationToken,
    urls: Vec<String>,
}

impl DownloadHandle {
    /// Cancels every transfer in the batch.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Blocks until every transfer has settled and returns the outcomes in request order.
    ///
    /// Must not be called from inside an async runtime.
    ///
    /// # Errors
    ///
    /// [`DownloadError::DownloadErrors`] naming every URL of the batch if the
    /// batch was torn down before it reported, e.g. by a panicking callback.
    pub fn wait(self) -> Result<Vec<DownloadOutcome>, DownloadError> {
        self.done.blocking_recv().map_err(|_| {
            warn!(count = self.urls.len(), "Download workers exited without reporting");
            let failures = self
                .urls
                .into_iter()
                .map(|url| (url, FileError::Io(io::Error::other("download batch was lost"))))
                .collect();
            DownloadError::DownloadErrors(failures)
        })
    }

    /// Waits, then turns any failure into a [`DownloadError`].
    ///
    /// On error, files from the successful transfers are deleted.
    pub fn wait_result(self) -> Result<Vec<PathBuf>, DownloadError> {
        let cancel = self.cancel.clone();
        let mut paths = Vec::new();
        let mut failures = Vec::new();
        for outcome in self.wait()? {
            match outcome.result {
                Ok(path) => paths.push(path),
                Err(e) => failures.push((outcome.url, e)),
            }
        }
        if failures.is_empty() && !cancel.is_cancelled() {
            return Ok(paths);
        }
        for path in &paths {
            let _ = fs::remove_file(path);
        }
        Err(DownloadError::from_failures(failures, cancel.is_cancelled()))
    }
}

#[derive(Debug)]
pub struct NetAsyncDownloader {
    reporter: Arc<dyn Reporter>,
    backend: DownloadBackend,
    progress_interval: Duration,
    temp_dir: Option<PathBuf>,
    current: Mutex<CancellationToken>,
}

impl NetAsyncDownloader {
    pub fn new(reporter: Arc<dyn Reporter>) -> Self {
        Self {
            reporter,
            backend: DownloadBackend::for_host(),
            progress_interval: Duration::from_secs(3),
            temp_dir: None,
            current: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn with_backend(mut self, backend: DownloadBackend) -> Self {
        self.backend = backend;
        self
    }

    /// Minimum time between progress reports triggered by the same file.
    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    /// Directory downloaded files are written to; the system temp dir otherwise.
    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = Some(dir.into());
        self
    }

    pub fn backend(&self) -> DownloadBackend {
        self.backend
    }

    /// Cancels the most recently started batch.
    pub fn cancel_download(&self) {
        let token = match self.current.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        info!("Cancelling downloads");
        token.cancel();
    }

    /// Starts downloading every target and returns immediately.
    ///
    /// `on_complete` runs exactly once, after every transfer has settled.
    pub fn download<F>(&self, targets: Vec<DownloadTarget>, on_complete: F) -> DownloadHandle
    where
        F: FnOnce(&[DownloadOutcome]) + Send + 'static,
    {
        let cancel = CancellationToken::new();
        match self.current.lock() {
            Ok(mut guard) => *guard = cancel.clone(),
            Err(poisoned) => *poisoned.into_inner() = cancel.clone(),
        }

        let (tx, rx) = oneshot::channel();
        let handle = DownloadHandle {
            done: rx,
            cancel: cancel.clone(),
            urls: targets.iter().map(|t| t.url.clone()).collect(),
        };

        info!(count = targets.len(), backend = ?self.backend, "Starting downloads");
        if targets.is_empty() {
            Batch::complete(&self.reporter, Vec::new(), Some(Box::new(on_complete)), Some(tx));
            return handle;
        }

        let progress = Arc::new(Progress::new(
            Arc::clone(&self.reporter),
            self.progress_interval,
            &targets,
        ));
        let batch = Arc::new(Batch {
            reporter: Arc::clone(&self.reporter),
            state: Mutex::new(BatchState {
                slots: targets.iter().map(|_| None).collect(),
                remaining: targets.len(),
                on_complete: Some(Box::new(on_complete)),
                done: Some(tx),
            }),
        });
        let job = Job {
            progress,
            batch,
            cancel,
            temp_dir: self.temp_dir.clone(),
        };

        match self.backend {
            DownloadBackend::Native => spawn_native(job, targets),
            DownloadBackend::Threaded => spawn_threaded(job, targets),
        }
        handle
    }

    /// Downloads every target and blocks until all have settled.
    ///
    /// # Errors
    ///
    /// - [`DownloadError::UserCancelled`] if the batch was cancelled.
    /// - [`DownloadError::MissingCertificate`] if a failure looks like a TLS trust problem.
    /// - [`DownloadError::DownloadErrors`] with every failure otherwise.
    pub fn download_and_wait(&self, targets: Vec<DownloadTarget>) -> Result<Vec<PathBuf>, DownloadError> {
        self.download(targets, |_| {}).wait_result()
    }
}

/// Shared state handed to each worker of a batch.
#[derive(Clone)]
struct Job {
    progress: Arc<Progress>,
    batch: Arc<Batch>,
    cancel: CancellationToken,
    temp_dir: Option<PathBuf>,
}

impl Job {
    fn settle(&self, index: usize, url: String, result: Result<PathBuf, FileError>) {
        // A transfer torn down by cancellation can surface as an IO error.
        let result = match result {
            Err(_) if self.cancel.is_cancelled() => Err(FileError::Cancelled),
            other => other,
        };
        self.batch.finish(index, DownloadOutcome { url, result });
    }
}

/// Settles one slot of the batch exactly once.
///
/// A worker that unwinds before settling marks its transfer failed on drop,
/// so the batch still completes.
struct Slot {
    job: Job,
    index: usize,
    url: Option<String>,
}

impl Slot {
    fn new(job: Job, index: usize, url: String) -> Self {
        Self {
            job,
            index,
            url: Some(url),
        }
    }

    fn settle(mut self, result: Result<PathBuf, FileError>) {
        if let Some(url) = self.url.take() {
            self.job.settle(self.index, url, result);
        }
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        if let Some(url) = self.url.take() {
            let err = io::Error::other("download worker panicked");
            self.job.settle(self.index, url, Err(FileError::Io(err)));
        }
    }
}

fn temp_file(dir: Option<&Path>) -> io::Result<tempfile::NamedTempFile> {
    let mut builder = tempfile::Builder::new();
    builder.prefix("ckan-download-");
    match dir {
        Some(dir) => builder.tempfile_in(dir),
        None => builder.tempfile(),
    }
}

fn keep(file: tempfile::NamedTempFile) -> Result<PathBuf, FileError> {
    file.into_temp_path()
        .keep()
        .map_err(|e| FileError::Io(e.error))
}

// ---- Threaded backend ----------------------------------------------------

fn spawn_threaded(job: Job, targets: Vec<DownloadTarget>) {
    for (index, target) in targets.into_iter().enumerate() {
        let slot = Slot::new(job.clone(), index, target.url.clone());
        std::thread::spawn(move || {
            let result = fetch_blocking(&slot.job, index, &target);
            slot.settle(result);
        });
    }
}

fn fetch_blocking(job: &Job, index: usize, target: &DownloadTarget) -> Result<PathBuf, FileError> {
    if job.cancel.is_cancelled() {
        return Err(FileError::Cancelled);
    }
    let client = reqwest::blocking::Client::builder()
        .user_agent(crate::USER_AGENT)
        .build()?;
    let mut response = client.get(&target.url).send()?;
    let status = response.status();
    if !status.is_success() {
        return Err(FileError::Status(status.as_u16()));
    }
    job.progress.set_size(index, response.content_length());

    let mut file = temp_file(job.temp_dir.as_deref())?;
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        if job.cancel.is_cancelled() {
            return Err(FileError::Cancelled);
        }
        let n = response.read(&mut buf)?;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n])?;
        job.progress.advance(index, n as u64);
    }
    file.flush()?;
    keep(file)
}

// ---- Native backend ------------------------------------------------------

fn spawn_native(job: Job, targets: Vec<DownloadTarget>) {
    std::thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build();
        let runtime = match runtime {
            Ok(rt) => rt,
            Err(e) => {
                let msg = e.to_string();
                for (index, target) in targets.into_iter().enumerate() {
                    job.settle(index, target.url, Err(FileError::Io(io::Error::other(msg.clone()))));
                }
                return;
            }
        };

        runtime.block_on(async move {
            let client = match reqwest::Client::builder().user_agent(crate::USER_AGENT).build() {
                Ok(client) => client,
                Err(e) => {
                    let msg = e.to_string();
                    for (index, target) in targets.into_iter().enumerate() {
                        job.settle(index, target.url, Err(FileError::Io(io::Error::other(msg.clone()))));
                    }
                    return;
                }
            };
            let transfers = targets.into_iter().enumerate().map(|(index, target)| {
                let slot = Slot::new(job.clone(), index, target.url.clone());
                let client = client.clone();
                async move {
                    let result = fetch_async(&client, &slot.job, index, &target).await;
                    slot.settle(result);
                }
            });
            futures::future::join_all(transfers).await;
        });
    });
}

async fn fetch_async(
    client: &reqwest::Client,
    job: &Job,
    index: usize,
    target: &DownloadTarget,
) -> Result<PathBuf, FileError> {
    let response = tokio::select! {
        () = job.cancel.cancelled() => return Err(FileError::Cancelled),
        response = client.get(&target.url).send() => response?,
    };
    let status = response.status();
    if !status.is_success() {
        return Err(FileError::Status(status.as_u16()));
    }
    job.progress.set_size(index, response.content_length());

    let temp = temp_file(job.temp_dir.as_deref())?;
    let mut file = tokio::fs::File::from_std(temp.reopen()?);
    let mut stream = response.bytes_stream();
    loop {
        let chunk = tokio::select! {
            () = job.cancel.cancelled() => return Err(FileError::Cancelled),
            chunk = stream.next() => chunk,
        };
        let Some(chunk) = chunk else { break };
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        job.progress.advance(index, chunk.len() as u64);
    }
    file.flush().await?;
    drop(file);
    keep(temp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_cancel_wins() {
        let failures = vec![("http://a".to_string(), FileError::Status(500))];
        assert!(matches!(
            DownloadError::from_failures(failures, true),
            DownloadError::UserCancelled
        ));
    }

    #[test]
    fn test_classify_certificate() {
        let failures = vec![
            ("http://a".to_string(), FileError::Status(404)),
            (
                "https://b".to_string(),
                FileError::Io(io::Error::other("invalid peer certificate: UnknownIssuer")),
            ),
        ];
        match DownloadError::from_failures(failures, false) {
            DownloadError::MissingCertificate(url) => assert_eq!(url, "https://b"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_classify_aggregate() {
        let failures = vec![("http://a".to_string(), FileError::Status(404))];
        let err = DownloadError::from_failures(failures, false);
        assert!(err.to_string().contains("http://a"));
        assert!(matches!(err, DownloadError::DownloadErrors(v) if v.len() == 1));
    }

    #[test]
    fn test_empty_batch_completes() {
        let downloader = NetAsyncDownloader::new(Arc::new(crate::NullReporter));
        let (tx, rx) = std::sync::mpsc::channel();
        let outcomes = downloader
            .download(Vec::new(), move |o| tx.send(o.len()).unwrap())
            .wait()
            .unwrap();
        assert!(outcomes.is_empty());
        assert_eq!(rx.recv().unwrap(), 0);
    }
}
