//! Keyed single-flight resource jobs.
//!
//! A [`ResourceController`] associates at most one active job with each
//! logical resource key. Launching a job for a key that is already taken
//! cancels the old job and blocks the new job's body until the old one has
//! fully unregistered, so two generations of work never race to write the
//! same output sink.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::pin::pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::{AbortHandle, Abortable, Aborted};
use futures_util::{Stream, StreamExt};
use loadstone_types::{Cause, ErrorReporter, Outcome};
use tokio::sync::{mpsc, oneshot, watch};

use crate::reporter::LogReporter;

/// Process-wide identity of a launched job. A fresh id is minted per launch;
/// ids are never reused, which is what makes the registry's
/// compare-and-remove discipline sound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(u64);

impl JobId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        JobId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Observer of a sequence of [`Outcome`] values.
///
/// Emission must be non-blocking; sinks that cannot keep up should buffer
/// (an unbounded channel) or conflate (a watch channel) on their own side.
pub trait OutcomeSink<T>: Send + Sync {
    /// Deliver one outcome.
    fn emit(&self, outcome: Outcome<T>);
}

/// A watch sink conflates: late observers see the latest outcome only.
impl<T: Send + Sync> OutcomeSink<T> for watch::Sender<Outcome<T>> {
    fn emit(&self, outcome: Outcome<T>) {
        // No receivers is not an error; the job keeps running.
        let _ = self.send(outcome);
    }
}

/// An unbounded sink preserves the full emission history.
impl<T: Send> OutcomeSink<T> for mpsc::UnboundedSender<Outcome<T>> {
    fn emit(&self, outcome: Outcome<T>) {
        let _ = self.send(outcome);
    }
}

struct ActiveJob {
    id: JobId,
    abort: AbortHandle,
    /// Fired by the job's wrapper task once it has unregistered. Taken by
    /// whoever removes the entry (a superseding launch or `cancel`).
    done: Option<oneshot::Receiver<()>>,
}

struct ControllerInner<K> {
    jobs: Mutex<HashMap<K, ActiveJob>>,
    reporter: Arc<dyn ErrorReporter>,
}

impl<K: Eq + Hash> ControllerInner<K> {
    fn lock_jobs(&self) -> MutexGuard<'_, HashMap<K, ActiveJob>> {
        // Jobs never panic while holding this lock; if one somehow did, the
        // map is still structurally valid.
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_current(&self, key: &K, id: JobId) -> bool {
        self.lock_jobs().get(key).is_some_and(|j| j.id == id)
    }

    /// Remove the entry for `key` only if `id` is still the registered job.
    /// Guards against a finished-but-stale job clobbering a newer
    /// registration.
    fn remove_if_current(&self, key: &K, id: JobId) {
        let mut jobs = self.lock_jobs();
        if jobs.get(key).is_some_and(|j| j.id == id) {
            jobs.remove(key);
        }
    }
}

/// Keyed single-flight job registry.
///
/// Cheap to clone; clones share the same registry and reporter.
pub struct ResourceController<K> {
    inner: Arc<ControllerInner<K>>,
}

impl<K> Clone for ResourceController<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K> Default for ResourceController<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> ResourceController<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    /// Controller reporting intercepted errors through [`LogReporter`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_reporter(Arc::new(LogReporter))
    }

    /// Controller with an explicit error-reporting collaborator.
    #[must_use]
    pub fn with_reporter(reporter: Arc<dyn ErrorReporter>) -> Self {
        Self {
            inner: Arc::new(ControllerInner {
                jobs: Mutex::new(HashMap::new()),
                reporter,
            }),
        }
    }

    /// Launch a job for `key`, superseding any job already registered there.
    ///
    /// The superseded job is aborted at once, but the new job's body does not
    /// start until the old job has unregistered. The new job then emits
    /// `Progress(seed)` and runs `block` with a [`TaskCx`] for further
    /// emissions.
    ///
    /// If `block` returns an error cause, `Error(cause, last_known_data)` is
    /// emitted and the cause is reported. If the job is superseded or
    /// cancelled, nothing terminal is emitted: ownership of the sink has
    /// passed to the newer job, which publishes its own `Progress`.
    pub fn launch<T, S, F, Fut>(&self, key: K, seed: Option<T>, sink: S, block: F) -> JobId
    where
        T: Clone + Send + Sync + 'static,
        S: OutcomeSink<T> + 'static,
        F: FnOnce(TaskCx<K, T>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), Cause>> + Send + 'static,
    {
        let id = JobId::next();
        let (abort, abort_registration) = AbortHandle::new_pair();
        let (done_tx, done_rx) = oneshot::channel();

        let prev = {
            let mut jobs = self.inner.lock_jobs();
            jobs.insert(
                key.clone(),
                ActiveJob {
                    id,
                    abort,
                    done: Some(done_rx),
                },
            )
        };

        // Abort the superseded job before our task is even scheduled, so its
        // cancellation and our wait overlap.
        if let Some(prev) = &prev {
            tracing::debug!(superseded = ?prev.id, new = ?id, "superseding resource job");
            prev.abort.abort();
        }

        let cx = TaskCx {
            inner: Arc::clone(&self.inner),
            key: key.clone(),
            id,
            sink: Arc::new(sink),
            last: Arc::new(Mutex::new(seed.clone())),
        };

        let body = {
            let cx = cx.clone();
            async move {
                if let Some(prev) = prev
                    && let Some(done) = prev.done
                {
                    // Bounded wait: the old job is being aborted concurrently
                    // and its wrapper always fires the signal.
                    let _ = done.await;
                }
                cx.emit(Outcome::progress(seed));
                block(cx).await
            }
        };

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            match Abortable::new(body, abort_registration).await {
                Ok(Ok(())) => {}
                Ok(Err(cause)) => {
                    inner.reporter.report(&cause);
                    cx.emit_failure(cause);
                }
                // Cooperative cancellation: silent, not reported.
                Err(Aborted) => {}
            }
            inner.remove_if_current(&cx.key, id);
            let _ = done_tx.send(());
        });

        id
    }

    /// Whether a job is currently registered for `key`.
    #[must_use]
    pub fn is_taken(&self, key: &K) -> bool {
        self.inner.lock_jobs().contains_key(key)
    }

    /// Read-only handle to the currently registered job, if any.
    ///
    /// Cancellation must go through [`ResourceController::cancel`]; this
    /// accessor exists for diagnostics and tests.
    #[must_use]
    pub fn current_job(&self, key: &K) -> Option<JobId> {
        self.inner.lock_jobs().get(key).map(|j| j.id)
    }

    /// Cancel and unregister the job for `key`, waiting until its work has
    /// fully stopped. Returns `false` if no job was registered.
    pub async fn cancel(&self, key: &K) -> bool {
        let prev = self.inner.lock_jobs().remove(key);
        let Some(prev) = prev else {
            return false;
        };
        prev.abort.abort();
        if let Some(done) = prev.done {
            let _ = done.await;
        }
        true
    }

    /// Cancel every registered job and wait for all of them to stop.
    pub async fn shutdown(&self) {
        let drained: Vec<ActiveJob> = {
            let mut jobs = self.inner.lock_jobs();
            jobs.drain().map(|(_, j)| j).collect()
        };
        for job in &drained {
            job.abort.abort();
        }
        for job in drained {
            if let Some(done) = job.done {
                let _ = done.await;
            }
        }
    }
}

/// Emission context handed to a job's body.
///
/// Every emission is gated on "am I still the registered job for this key",
/// so a superseded job that races a final emission through is a no-op at the
/// sink. Cloning is cheap; clones share the same last-known-data slot.
pub struct TaskCx<K, T> {
    inner: Arc<ControllerInner<K>>,
    key: K,
    id: JobId,
    sink: Arc<dyn OutcomeSink<T>>,
    last: Arc<Mutex<Option<T>>>,
}

impl<K: Clone, T> Clone for TaskCx<K, T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            key: self.key.clone(),
            id: self.id,
            sink: Arc::clone(&self.sink),
            last: Arc::clone(&self.last),
        }
    }
}

impl<K, T> TaskCx<K, T>
where
    K: Eq + Hash,
    T: Clone,
{
    /// This job's identity.
    #[must_use]
    pub fn job_id(&self) -> JobId {
        self.id
    }

    /// Emit an outcome, if this job is still the registered one for its key.
    pub fn emit(&self, outcome: Outcome<T>) {
        if !self.inner.is_current(&self.key, self.id) {
            tracing::trace!(job = ?self.id, "dropping emission from superseded job");
            return;
        }
        if let Some(data) = outcome.data() {
            *self.last.lock().unwrap_or_else(PoisonError::into_inner) = Some(data.clone());
        }
        self.sink.emit(outcome);
    }

    /// Forward every outcome of `stream` through this context.
    pub async fn forward(&self, stream: impl Stream<Item = Outcome<T>>) {
        let mut stream = pin!(stream);
        while let Some(outcome) = stream.next().await {
            self.emit(outcome);
        }
    }

    /// The most recent data seen by any emission through this context.
    #[must_use]
    pub fn last_known(&self) -> Option<T> {
        self.last
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn emit_failure(&self, cause: Cause) {
        let data = self.last_known();
        self.emit(Outcome::failure(cause, data));
    }
}
