//! Reference-counted multicast of a cold producer.
//!
//! [`share`] wraps a producer that is expensive to (re)start — it might open
//! a socket or register a platform listener — so that any number of
//! consumers observe one shared execution. The upstream runs exactly while
//! attached consumers exist, with a debounce grace window after the last one
//! detaches so a quick detach/re-attach never restarts it.

use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::future::{AbortHandle, Abortable};
use futures_util::stream::{BoxStream, unfold};
use futures_util::{Stream, StreamExt};
use loadstone_types::Cause;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::sleep;

/// A cold, replayable-from-scratch producer.
///
/// `start` is called once per shared execution; the returned stream must
/// stop promptly when dropped. Any `Fn() -> impl Stream<Item = Result<T,
/// Cause>>` closure qualifies.
pub trait ColdProducer<T>: Send + Sync + 'static {
    /// Begin a fresh execution of the producer.
    fn start(&self) -> BoxStream<'static, Result<T, Cause>>;
}

impl<T, S, F> ColdProducer<T> for F
where
    F: Fn() -> S + Send + Sync + 'static,
    S: Stream<Item = Result<T, Cause>> + Send + 'static,
{
    fn start(&self) -> BoxStream<'static, Result<T, Cause>> {
        (self)().boxed()
    }
}

/// Sharing behavior knobs.
#[derive(Debug, Clone, Copy)]
pub struct SharingConfig {
    /// Replay the most recent value to late attachers while the upstream
    /// keeps running. Never replays across a full stop/restart.
    pub conflate: bool,
    /// Grace period after the last consumer detaches before the upstream is
    /// actually torn down.
    pub debounce: Duration,
    /// Per-consumer fan-out buffer. A consumer that falls further behind
    /// than this skips the missed values (logged) rather than blocking
    /// faster consumers.
    pub buffer: usize,
}

impl Default for SharingConfig {
    fn default() -> Self {
        Self {
            conflate: false,
            debounce: Duration::ZERO,
            buffer: 64,
        }
    }
}

impl SharingConfig {
    /// Enable replay of the latest value to late attachers.
    #[must_use]
    pub fn with_conflation(mut self) -> Self {
        self.conflate = true;
        self
    }

    /// Set the teardown grace period.
    #[must_use]
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }
}

/// Wrap a cold producer into a shared, reference-counted hot stream.
pub fn share<T, P>(producer: P, config: SharingConfig) -> Shared<T>
where
    T: Clone + Send + 'static,
    P: ColdProducer<T>,
{
    Shared {
        inner: Arc::new(ShareInner {
            producer: Arc::new(producer),
            config,
            state: Mutex::new(ShareState {
                consumers: 0,
                running: None,
                last: None,
                debounce: None,
                debounce_seq: 0,
                next_run: 0,
            }),
        }),
    }
}

/// Handle to a shared producer session. Cheap to clone; all clones feed the
/// same session. When the last clone and the last attachment are gone the
/// session is gone too — there is no global registry keeping it alive.
pub struct Shared<T> {
    inner: Arc<ShareInner<T>>,
}

impl<T> Clone for Shared<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Running<T> {
    tx: broadcast::Sender<Result<T, Cause>>,
    abort: AbortHandle,
    run_id: u64,
}

struct ShareState<T> {
    consumers: usize,
    running: Option<Running<T>>,
    /// Conflation slot; populated only while the upstream runs.
    last: Option<T>,
    debounce: Option<AbortHandle>,
    /// Invalidates in-flight debounce tasks that lost an abort race.
    debounce_seq: u64,
    next_run: u64,
}

impl<T> ShareState<T> {
    fn run_is(&self, run_id: u64) -> bool {
        self.running.as_ref().is_some_and(|r| r.run_id == run_id)
    }
}

struct ShareInner<T> {
    producer: Arc<dyn ColdProducer<T>>,
    config: SharingConfig,
    state: Mutex<ShareState<T>>,
}

impl<T> ShareInner<T> {
    fn lock_state(&self) -> MutexGuard<'_, ShareState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> Shared<T>
where
    T: Clone + Send + 'static,
{
    /// Attach a consumer.
    ///
    /// The 0→1 transition starts the upstream in a task owned by the
    /// session, not by this consumer, so dropping one attachment never kills
    /// the producer for the others. With conflation on, the returned stream
    /// yields the most recent value first when the upstream has been running
    /// continuously.
    #[must_use]
    pub fn attach(&self) -> Attachment<T> {
        let inner = Arc::clone(&self.inner);
        let (rx, replay) = {
            let mut st = inner.lock_state();
            st.consumers += 1;
            // A pending teardown is void the moment someone attaches.
            st.debounce_seq += 1;
            if let Some(pending) = st.debounce.take() {
                pending.abort();
            }
            if st.running.is_none() {
                Self::start_upstream(&inner, &mut st);
            }
            let running = st
                .running
                .as_ref()
                .expect("upstream was started under this lock");
            let rx = running.tx.subscribe();
            // Snapshot under the same lock the producer publishes under:
            // the replayed value and the subscription never gap or overlap.
            let replay = if inner.config.conflate {
                st.last.clone()
            } else {
                None
            };
            (rx, replay)
        };

        Attachment {
            stream: attachment_stream(replay, rx).boxed(),
            _guard: AttachGuard { inner },
        }
    }

    /// Number of currently attached consumers (diagnostics).
    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.inner.lock_state().consumers
    }

    /// Whether an upstream execution is currently active.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.lock_state().running.is_some()
    }

    fn start_upstream(inner: &Arc<ShareInner<T>>, st: &mut ShareState<T>) {
        let run_id = st.next_run;
        st.next_run += 1;
        let (tx, _drop_now) = broadcast::channel(inner.config.buffer.max(1));
        let (abort, abort_registration) = AbortHandle::new_pair();
        st.running = Some(Running {
            tx: tx.clone(),
            abort,
            run_id,
        });
        tracing::debug!(run_id, "starting shared upstream");

        let session = Arc::clone(inner);
        let task = async move {
            let mut upstream = session.producer.start();
            while let Some(item) = upstream.next().await {
                let failed = item.is_err();
                {
                    let mut st = session.lock_state();
                    if !st.run_is(run_id) {
                        return;
                    }
                    if session.config.conflate
                        && let Ok(value) = &item
                    {
                        st.last = Some(value.clone());
                    }
                    // No receivers right now is fine; the value still lands
                    // in the conflation slot.
                    let _ = tx.send(item);
                }
                if failed {
                    break;
                }
            }
            // Upstream completed or failed: the session resets to idle and
            // the next attach starts a brand-new execution.
            let mut st = session.lock_state();
            if st.run_is(run_id) {
                tracing::debug!(run_id, "shared upstream finished; session idle");
                st.running = None;
                st.last = None;
            }
        };
        tokio::spawn(async move {
            let _ = Abortable::new(task, abort_registration).await;
        });
    }
}

fn attachment_stream<T>(
    replay: Option<T>,
    rx: broadcast::Receiver<Result<T, Cause>>,
) -> impl Stream<Item = Result<T, Cause>> + Send
where
    T: Clone + Send + 'static,
{
    unfold((replay, rx), |(mut replay, mut rx)| async move {
        if let Some(value) = replay.take() {
            return Some((Ok(value), (None, rx)));
        }
        loop {
            match rx.recv().await {
                Ok(item) => return Some((item, (None, rx))),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "shared stream consumer lagging; skipping");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    })
}

/// One consumer's view of a shared session.
///
/// Yields the upstream's values in upstream order; an upstream failure
/// arrives as a final `Err` item for every attached consumer. Dropping the
/// attachment detaches (and arms the teardown debounce if it was the last
/// one).
pub struct Attachment<T: Send + 'static> {
    stream: BoxStream<'static, Result<T, Cause>>,
    _guard: AttachGuard<T>,
}

impl<T: Send + 'static> Stream for Attachment<T> {
    type Item = Result<T, Cause>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.stream.as_mut().poll_next(cx)
    }
}

// `Send` here is what lets the drop-armed debounce task move the session
// into a spawned timer.
struct AttachGuard<T: Send + 'static> {
    inner: Arc<ShareInner<T>>,
}

impl<T: Send + 'static> Drop for AttachGuard<T> {
    fn drop(&mut self) {
        let mut st = self.inner.lock_state();
        st.consumers = st.consumers.saturating_sub(1);
        if st.consumers > 0 || st.running.is_none() {
            return;
        }

        // Last consumer gone: arm the grace timer instead of stopping the
        // upstream outright.
        st.debounce_seq += 1;
        let seq = st.debounce_seq;
        let inner = Arc::clone(&self.inner);
        let debounce = self.inner.config.debounce;
        let (abort, abort_registration) = AbortHandle::new_pair();
        st.debounce = Some(abort);
        drop(st);

        let expire = async move {
            sleep(debounce).await;
            let mut st = inner.lock_state();
            // A newer attach or a newer debounce supersedes this one.
            if st.debounce_seq != seq || st.consumers > 0 {
                return;
            }
            st.debounce = None;
            if let Some(running) = st.running.take() {
                tracing::debug!(run_id = running.run_id, "debounce elapsed; tearing down upstream");
                running.abort.abort();
            }
            st.last = None;
        };

        if let Ok(handle) = Handle::try_current() {
            handle.spawn(async move {
                let _ = Abortable::new(expire, abort_registration).await;
            });
        } else {
            // No runtime left to host the timer (owner dropped outside
            // async context): tear down immediately.
            let mut st = self.inner.lock_state();
            if st.debounce_seq == seq && st.consumers == 0 {
                st.debounce = None;
                if let Some(running) = st.running.take() {
                    running.abort.abort();
                }
                st.last = None;
            }
        }
    }
}
