//! Multi-threaded check-then-upload blob publisher for the CAS.
//!
//! ```text
//!  add_missing ──► contained? ──yes──► done
//!       │no
//!       ▼
//!   pending map (one PendingUpload per digest, later callers subscribe)
//!       │owner enqueues
//!       ▼
//!  missing-check queue ──► find_missing (≤ missing_check_limit digests)
//!                               │present ──► resolve Ok
//!                               ▼missing
//!                        upload queue ──► batch_update (≤ upload_size_limit bytes)
//!                                              │per-digest status
//!                                              ▼
//!                                          resolve Ok/Err
//! ```
//!
//! A bounded pool of workers drains both queues in a loop and exits once both
//! are empty. Every digest confirmed present is cached, so repeated requests
//! for it never touch the network again.

use async_trait::async_trait;
use dbc_common::config::UploaderConfig;
use dbc_common::{DistBuildError, Digest, UploadError};
use serde::Serialize;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::watch;
use tracing::{debug, warn};

/// Lazily opened bytes of a blob.
pub type BlobSource = Arc<dyn Fn() -> std::io::Result<Vec<u8>> + Send + Sync>;

/// One blob a caller wants published.
#[derive(Clone)]
pub struct UploadRequest {
    pub digest: Digest,
    pub source: BlobSource,
}

impl UploadRequest {
    pub fn new(digest: Digest, source: BlobSource) -> Self {
        Self { digest, source }
    }

    /// Request backed by an in-memory buffer.
    pub fn from_bytes(digest: Digest, bytes: Vec<u8>) -> Self {
        let bytes = Arc::new(bytes);
        Self {
            digest,
            source: Arc::new(move || Ok(bytes.as_ref().clone())),
        }
    }
}

impl std::fmt::Debug for UploadRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadRequest")
            .field("digest", &self.digest)
            .finish_non_exhaustive()
    }
}

/// A blob handed to the CAS in a batch upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadData {
    pub digest: Digest,
    pub data: Vec<u8>,
}

/// Per-digest outcome of a batch upload. `status == 0` means success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadResult {
    pub digest: Digest,
    pub status: i32,
    pub message: Option<String>,
}

impl UploadResult {
    pub fn ok(digest: Digest) -> Self {
        Self {
            digest,
            status: 0,
            message: None,
        }
    }

    pub fn failed(digest: Digest, status: i32, message: impl Into<String>) -> Self {
        Self {
            digest,
            status,
            message: Some(message.into()),
        }
    }
}

/// Transport to the content-addressable store.
#[async_trait]
pub trait CasClient: Send + Sync {
    /// Hashes among `digests` that the CAS does not have.
    async fn find_missing(&self, digests: &[Digest]) -> Result<HashSet<String>, DistBuildError>;

    /// Upload blobs; one result per input, matched by digest.
    async fn batch_update(&self, blobs: Vec<UploadData>) -> Result<Vec<UploadResult>, DistBuildError>;
}

/// Uploader tuning.
#[derive(Debug, Clone)]
pub struct UploaderSettings {
    pub missing_check_limit: usize,
    pub upload_size_limit_bytes: u64,
    pub worker_count: usize,
}

impl Default for UploaderSettings {
    fn default() -> Self {
        Self::from(&UploaderConfig::default())
    }
}

impl From<&UploaderConfig> for UploaderSettings {
    fn from(config: &UploaderConfig) -> Self {
        Self {
            missing_check_limit: config.missing_check_limit.max(1),
            upload_size_limit_bytes: config.upload_size_limit_bytes.max(1),
            worker_count: config.worker_count.max(1),
        }
    }
}

/// Counters exposed for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UploadStats {
    pub missing_check_calls: u64,
    pub digests_checked: u64,
    pub batch_upload_calls: u64,
    pub blobs_uploaded: u64,
    pub bytes_uploaded: u64,
    pub contained_hits: u64,
    pub failures: u64,
}

#[derive(Default)]
struct Counters {
    missing_check_calls: AtomicU64,
    digests_checked: AtomicU64,
    batch_upload_calls: AtomicU64,
    blobs_uploaded: AtomicU64,
    bytes_uploaded: AtomicU64,
    contained_hits: AtomicU64,
    failures: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> UploadStats {
        UploadStats {
            missing_check_calls: self.missing_check_calls.load(Ordering::Relaxed),
            digests_checked: self.digests_checked.load(Ordering::Relaxed),
            batch_upload_calls: self.batch_upload_calls.load(Ordering::Relaxed),
            blobs_uploaded: self.blobs_uploaded.load(Ordering::Relaxed),
            bytes_uploaded: self.bytes_uploaded.load(Ordering::Relaxed),
            contained_hits: self.contained_hits.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

type Outcome = Option<Result<(), UploadError>>;

/// An in-flight upload shared by every caller asking for the same digest.
struct PendingUpload {
    request: UploadRequest,
    done: watch::Sender<Outcome>,
}

impl PendingUpload {
    fn new(request: UploadRequest) -> Self {
        let (done, _) = watch::channel(None);
        Self { request, done }
    }

    fn digest(&self) -> &Digest {
        &self.request.digest
    }

    /// Resolve the handle. Only the first call has any effect.
    fn complete(&self, result: Result<(), UploadError>) -> bool {
        self.done.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(result);
            true
        })
    }
}

/// Publishes blobs to the CAS with at most one upload in flight per digest.
#[derive(Clone)]
pub struct MultiThreadedBlobUploader {
    inner: Arc<Inner>,
}

struct Inner {
    cas: Arc<dyn CasClient>,
    settings: UploaderSettings,
    contained: RwLock<HashSet<Digest>>,
    pending: Mutex<HashMap<Digest, Arc<PendingUpload>>>,
    missing_check_queue: Mutex<VecDeque<Arc<PendingUpload>>>,
    upload_queue: Mutex<VecDeque<Arc<PendingUpload>>>,
    active_workers: AtomicUsize,
    counters: Counters,
}

impl MultiThreadedBlobUploader {
    pub fn new(cas: Arc<dyn CasClient>, settings: UploaderSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                cas,
                settings,
                contained: RwLock::new(HashSet::new()),
                pending: Mutex::new(HashMap::new()),
                missing_check_queue: Mutex::new(VecDeque::new()),
                upload_queue: Mutex::new(VecDeque::new()),
                active_workers: AtomicUsize::new(0),
                counters: Counters::default(),
            }),
        }
    }

    /// Ensure every requested blob is present in the CAS.
    ///
    /// Blocks until each digest is confirmed present (already there or
    /// freshly uploaded). Returns the first failure, in request order, if any
    /// digest could not be published.
    pub async fn add_missing(
        &self,
        requests: impl IntoIterator<Item = UploadRequest>,
    ) -> Result<(), UploadError> {
        let mut waiters = Vec::new();
        let mut enqueued = 0usize;

        for request in requests {
            match self.inner.register(request) {
                Registration::Contained => {
                    self.inner
                        .counters
                        .contained_hits
                        .fetch_add(1, Ordering::Relaxed);
                }
                Registration::Joined(pending) => waiters.push(pending),
                Registration::Owner(pending) => {
                    self.inner
                        .missing_check_queue
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .push_back(Arc::clone(&pending));
                    waiters.push(pending);
                    enqueued += 1;
                }
            }
        }

        if enqueued > 0 {
            debug!("Enqueued {} digests for missing check", enqueued);
            Inner::spawn_workers(&self.inner);
        }

        let mut first_error = None;
        for pending in waiters {
            let result = wait_for(&pending).await;
            if let Err(err) = result {
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Whether `digest` is known to be present in the CAS.
    pub fn contains(&self, digest: &Digest) -> bool {
        self.inner.is_contained(digest)
    }

    /// Digests currently being checked or uploaded.
    pub fn pending_count(&self) -> usize {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn stats(&self) -> UploadStats {
        self.inner.counters.snapshot()
    }
}

async fn wait_for(pending: &PendingUpload) -> Result<(), UploadError> {
    let mut rx = pending.done.subscribe();
    match rx.wait_for(Option::is_some).await {
        Ok(outcome) => outcome.clone().unwrap_or(Ok(())),
        Err(_) => Err(UploadError::Abandoned {
            digest: pending.digest().clone(),
        }),
    }
}

/// Run one CAS call on its own task. A panic in the client fails the call.
async fn run_cas_call<T, F>(what: &str, call: F) -> Result<T, DistBuildError>
where
    F: Future<Output = Result<T, DistBuildError>> + Send + 'static,
    T: Send + 'static,
{
    match tokio::spawn(call).await {
        Ok(result) => result,
        Err(err) => Err(DistBuildError::Interrupted(format!("{what} task failed: {err}"))),
    }
}

enum Registration {
    Contained,
    Joined(Arc<PendingUpload>),
    Owner(Arc<PendingUpload>),
}

impl Inner {
    fn is_contained(&self, digest: &Digest) -> bool {
        self.contained
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(digest)
    }

    fn register(&self, request: UploadRequest) -> Registration {
        if self.is_contained(&request.digest) {
            return Registration::Contained;
        }
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        // Resolution inserts into `contained` before leaving `pending`, so a
        // second look under the lock closes the gap.
        if self.is_contained(&request.digest) {
            return Registration::Contained;
        }
        match pending.entry(request.digest.clone()) {
            Entry::Occupied(entry) => Registration::Joined(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                let upload = Arc::new(PendingUpload::new(request));
                entry.insert(Arc::clone(&upload));
                Registration::Owner(upload)
            }
        }
    }

    fn has_work(&self) -> bool {
        let missing = !self
            .missing_check_queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty();
        missing
            || !self
                .upload_queue
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .is_empty()
    }

    fn try_reserve_worker(&self) -> bool {
        let max = self.settings.worker_count;
        self.active_workers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |active| {
                (active < max).then_some(active + 1)
            })
            .is_ok()
    }

    fn spawn_workers(this: &Arc<Self>) {
        while this.has_work() && this.try_reserve_worker() {
            let inner = Arc::clone(this);
            tokio::spawn(async move { inner.worker_loop().await });
        }
    }

    async fn worker_loop(self: Arc<Self>) {
        loop {
            if self.run_round().await {
                continue;
            }
            self.active_workers.fetch_sub(1, Ordering::SeqCst);
            // Work enqueued between the empty check and the decrement would
            // otherwise be stranded if every slot looked busy to the enqueuer.
            if self.has_work() && self.try_reserve_worker() {
                continue;
            }
            break;
        }
    }

    /// Process one batch. Returns false when both queues were empty.
    async fn run_round(&self) -> bool {
        if let Some(batch) = self.take_missing_check_batch() {
            self.check_missing(batch).await;
            return true;
        }
        if let Some(batch) = self.take_upload_batch() {
            self.upload(batch).await;
            return true;
        }
        false
    }

    fn take_missing_check_batch(&self) -> Option<Vec<Arc<PendingUpload>>> {
        let mut queue = self
            .missing_check_queue
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if queue.is_empty() {
            return None;
        }
        let take = queue.len().min(self.settings.missing_check_limit);
        Some(queue.drain(..take).collect())
    }

    fn take_upload_batch(&self) -> Option<Vec<Arc<PendingUpload>>> {
        let mut queue = self.upload_queue.lock().unwrap_or_else(|e| e.into_inner());
        let first = queue.pop_front()?;
        let mut total = first.digest().size_bytes;
        let mut batch = vec![first];
        while let Some(next) = queue.front() {
            let size = next.digest().size_bytes;
            if total.saturating_add(size) > self.settings.upload_size_limit_bytes {
                break;
            }
            total += size;
            if let Some(next) = queue.pop_front() {
                batch.push(next);
            }
        }
        Some(batch)
    }

    async fn check_missing(&self, batch: Vec<Arc<PendingUpload>>) {
        let digests: Vec<Digest> = batch.iter().map(|p| p.digest().clone()).collect();
        self.counters
            .missing_check_calls
            .fetch_add(1, Ordering::Relaxed);
        self.counters
            .digests_checked
            .fetch_add(digests.len() as u64, Ordering::Relaxed);

        let cas = Arc::clone(&self.cas);
        let query = digests.clone();
        let checked = run_cas_call("missing check", async move {
            cas.find_missing(&query).await
        })
        .await;
        match checked {
            Ok(missing) => {
                let mut to_upload = Vec::new();
                for pending in batch {
                    if missing.contains(&pending.digest().hash) {
                        to_upload.push(pending);
                    } else {
                        self.resolve(&pending, Ok(()));
                    }
                }
                debug!(
                    "Missing check: {} of {} digests need upload",
                    to_upload.len(),
                    digests.len()
                );
                if !to_upload.is_empty() {
                    self.upload_queue
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .extend(to_upload);
                }
            }
            Err(err) => {
                warn!("Missing check for {} digests failed: {}", digests.len(), err);
                let error = UploadError::MissingCheck {
                    count: digests.len(),
                    message: Arc::from(err.to_string()),
                };
                for pending in batch {
                    self.resolve(&pending, Err(error.clone()));
                }
            }
        }
    }

    async fn upload(&self, batch: Vec<Arc<PendingUpload>>) {
        let sources: Vec<BlobSource> = batch
            .iter()
            .map(|p| Arc::clone(&p.request.source))
            .collect();
        let reads = tokio::task::spawn_blocking(move || {
            sources.iter().map(|source| source()).collect::<Vec<_>>()
        })
        .await;
        let reads = match reads {
            Ok(reads) => reads,
            Err(err) => {
                warn!("Reading sources for {} blobs failed: {}", batch.len(), err);
                for pending in batch {
                    let error = UploadError::Source {
                        digest: pending.digest().clone(),
                        message: Arc::from(err.to_string()),
                    };
                    self.resolve(&pending, Err(error));
                }
                return;
            }
        };

        let mut blobs = Vec::with_capacity(batch.len());
        let mut ready = Vec::with_capacity(batch.len());
        for (pending, read) in batch.into_iter().zip(reads) {
            match read {
                Ok(data) => {
                    blobs.push(UploadData {
                        digest: pending.digest().clone(),
                        data,
                    });
                    ready.push(pending);
                }
                Err(err) => {
                    warn!("Failed to open source for {}: {}", pending.digest(), err);
                    let error = UploadError::Source {
                        digest: pending.digest().clone(),
                        message: Arc::from(err.to_string()),
                    };
                    self.resolve(&pending, Err(error));
                }
            }
        }
        if blobs.is_empty() {
            return;
        }

        let count = blobs.len();
        let bytes: u64 = blobs.iter().map(|b| b.data.len() as u64).sum();
        self.counters
            .batch_upload_calls
            .fetch_add(1, Ordering::Relaxed);
        debug!("Uploading batch of {} blobs ({} bytes)", count, bytes);

        let cas = Arc::clone(&self.cas);
        let uploaded =
            run_cas_call("batch upload", async move { cas.batch_update(blobs).await }).await;
        match uploaded {
            Ok(results) => {
                let by_digest: HashMap<Digest, UploadResult> = results
                    .into_iter()
                    .map(|r| (r.digest.clone(), r))
                    .collect();
                for pending in ready {
                    let digest = pending.digest().clone();
                    let outcome = match by_digest.get(&digest) {
                        Some(result) if result.status == 0 => {
                            self.counters.blobs_uploaded.fetch_add(1, Ordering::Relaxed);
                            self.counters
                                .bytes_uploaded
                                .fetch_add(digest.size_bytes, Ordering::Relaxed);
                            Ok(())
                        }
                        Some(result) => {
                            let message = result
                                .message
                                .clone()
                                .unwrap_or_else(|| "upload rejected".to_string());
                            warn!(
                                "Upload of {} failed with status {}: {}",
                                digest, result.status, message
                            );
                            Err(UploadError::Blob {
                                digest,
                                status: result.status,
                                message: Arc::from(message),
                            })
                        }
                        None => Err(UploadError::Blob {
                            digest,
                            status: -1,
                            message: Arc::from("no result returned for digest"),
                        }),
                    };
                    self.resolve(&pending, outcome);
                }
            }
            Err(err) => {
                warn!("Batch upload of {} blobs failed: {}", count, err);
                let error = UploadError::BatchUpload {
                    count,
                    message: Arc::from(err.to_string()),
                };
                for pending in ready {
                    self.resolve(&pending, Err(error.clone()));
                }
            }
        }
    }

    fn resolve(&self, pending: &Arc<PendingUpload>, result: Result<(), UploadError>) {
        let digest = pending.digest().clone();
        if result.is_ok() {
            self.contained
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .insert(digest.clone());
        } else {
            self.counters.failures.fetch_add(1, Ordering::Relaxed);
        }

        {
            let mut map = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            if map
                .get(&digest)
                .is_some_and(|current| Arc::ptr_eq(current, pending))
            {
                map.remove(&digest);
            }
        }

        pending.complete(result);
    }
}
