//! Presentation-timing filter over an [`Outcome`] stream.
//!
//! UIs that switch to a spinner the instant a refresh starts, then back a few
//! milliseconds later, appear to blink. [`prevent_blinking`] suppresses that:
//! a `Progress` is only shown after it has been pending for `show_delay`, and
//! once shown it stays visible for at least `min_shown` before the terminal
//! value replaces it. Only timing is altered; every emitted value is a
//! genuine upstream terminal or a `Progress` carrying the latest known data.

use std::future::pending;
use std::pin::{Pin, pin};
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::future::{AbortHandle, Abortable};
use futures_util::{Stream, StreamExt};
use loadstone_types::Outcome;
use tokio::sync::mpsc;
use tokio::time::{Sleep, sleep};

/// Timing and behavior knobs for [`prevent_blinking`].
#[derive(Debug, Clone, Copy)]
pub struct BlinkConfig {
    /// How long a `Progress` must stay pending before it becomes visible.
    pub show_delay: Duration,
    /// Minimum time a visible loading state is kept on screen.
    pub min_shown: Duration,
    /// Once a `Success` has been observed, emit further `Progress` values
    /// immediately instead of delaying them. Interim refreshes over already
    /// visible content are not blinking-prone.
    pub pass_interim_after_success: bool,
    /// Whether an observed `Error` clears the "success seen" latch used by
    /// `pass_interim_after_success`.
    pub reset_on_error: bool,
}

impl Default for BlinkConfig {
    fn default() -> Self {
        Self {
            show_delay: Duration::from_millis(500),
            min_shown: Duration::from_millis(500),
            pass_interim_after_success: false,
            reset_on_error: false,
        }
    }
}

impl BlinkConfig {
    /// Set the delay before a loading state becomes visible.
    #[must_use]
    pub fn with_show_delay(mut self, delay: Duration) -> Self {
        self.show_delay = delay;
        self
    }

    /// Set the minimum time a visible loading state stays on screen.
    #[must_use]
    pub fn with_min_shown(mut self, min: Duration) -> Self {
        self.min_shown = min;
        self
    }

    /// Pass interim loadings through once content has been shown.
    #[must_use]
    pub fn passing_interim_after_success(mut self) -> Self {
        self.pass_interim_after_success = true;
        self
    }

    /// Clear the "success seen" latch when an error is observed.
    #[must_use]
    pub fn resetting_on_error(mut self) -> Self {
        self.reset_on_error = true;
        self
    }
}

enum State<T> {
    /// Nothing pending, nothing visible.
    Idle,
    /// A loading state is pending; `show_delay` timer armed, nothing emitted.
    PendingShow { buffered: Outcome<T> },
    /// Loading is visible; `min_shown` timer armed; the latest terminal (if
    /// any) is buffered until the timer elapses.
    Prolonging { terminal: Option<Outcome<T>> },
    /// Loading is visible and the minimum hold has elapsed; values pass
    /// through.
    Shown,
}

/// Smooth an outcome stream for display.
///
/// The returned stream owns a driver task; dropping it cancels the driver
/// and its subscription to `upstream`.
pub fn prevent_blinking<T, S>(upstream: S, config: BlinkConfig) -> BlinkStream<T>
where
    T: Send + 'static,
    S: Stream<Item = Outcome<T>> + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let (abort, abort_registration) = AbortHandle::new_pair();
    tokio::spawn(async move {
        let _ = Abortable::new(drive(upstream, config, tx), abort_registration).await;
    });
    BlinkStream { rx, abort }
}

/// Output of [`prevent_blinking`].
pub struct BlinkStream<T> {
    rx: mpsc::UnboundedReceiver<Outcome<T>>,
    abort: AbortHandle,
}

impl<T> Stream for BlinkStream<T> {
    type Item = Outcome<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl<T> Drop for BlinkStream<T> {
    fn drop(&mut self) {
        self.abort.abort();
    }
}

/// Await the armed timer, or pend forever when none is armed.
async fn tick(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => pending().await,
    }
}

async fn drive<T, S>(upstream: S, config: BlinkConfig, tx: mpsc::UnboundedSender<Outcome<T>>)
where
    S: Stream<Item = Outcome<T>> + Send,
{
    let mut upstream = pin!(upstream);
    let mut state = State::Idle;
    let mut timer: Option<Pin<Box<Sleep>>> = None;
    let mut success_seen = false;

    loop {
        tokio::select! {
            item = upstream.next() => {
                let Some(outcome) = item else { break };
                if tx.is_closed() {
                    return;
                }
                if outcome.is_terminal() {
                    if outcome.is_success() {
                        success_seen = true;
                    } else if config.reset_on_error {
                        success_seen = false;
                    }
                    state = on_terminal(state, outcome, &mut timer, &tx);
                } else {
                    state = on_progress(state, outcome, &config, success_seen, &mut timer, &tx);
                }
            }
            () = tick(&mut timer) => {
                timer = None;
                state = on_timer(state, &config, &mut timer, &tx);
            }
        }
    }

    // Upstream closed. A terminal buffered during prolongation still honours
    // the minimum hold before being released.
    if let State::Prolonging {
        terminal: Some(terminal),
    } = state
    {
        if let Some(sleep) = timer {
            sleep.await;
        }
        let _ = tx.send(terminal);
    }
}

fn arm(timer: &mut Option<Pin<Box<Sleep>>>, duration: Duration) {
    *timer = Some(Box::pin(sleep(duration)));
}

fn on_progress<T>(
    state: State<T>,
    progress: Outcome<T>,
    config: &BlinkConfig,
    success_seen: bool,
    timer: &mut Option<Pin<Box<Sleep>>>,
    tx: &mpsc::UnboundedSender<Outcome<T>>,
) -> State<T> {
    match state {
        State::Idle => {
            if config.pass_interim_after_success && success_seen {
                // Interim refresh over visible content: the caller opted out
                // of the delay, and of the minimum hold that comes with it.
                let _ = tx.send(progress);
                State::Shown
            } else {
                arm(timer, config.show_delay);
                State::PendingShow { buffered: progress }
            }
        }
        // Update the buffered data; the timer is NOT re-armed.
        State::PendingShow { .. } => State::PendingShow { buffered: progress },
        State::Prolonging { terminal } => {
            // Loading is already visible; no further suppression needed.
            let _ = tx.send(progress);
            State::Prolonging { terminal }
        }
        State::Shown => {
            let _ = tx.send(progress);
            State::Shown
        }
    }
}

fn on_terminal<T>(
    state: State<T>,
    terminal: Outcome<T>,
    timer: &mut Option<Pin<Box<Sleep>>>,
    tx: &mpsc::UnboundedSender<Outcome<T>>,
) -> State<T> {
    match state {
        State::Idle | State::Shown => {
            let _ = tx.send(terminal);
            State::Idle
        }
        State::PendingShow { .. } => {
            // The loading state never became visible, so there is nothing to
            // prolong: drop it and emit the result directly.
            *timer = None;
            let _ = tx.send(terminal);
            State::Idle
        }
        // Hold the terminal until min_shown elapses; only the latest one is
        // kept.
        State::Prolonging { .. } => State::Prolonging {
            terminal: Some(terminal),
        },
    }
}

fn on_timer<T>(
    state: State<T>,
    config: &BlinkConfig,
    timer: &mut Option<Pin<Box<Sleep>>>,
    tx: &mpsc::UnboundedSender<Outcome<T>>,
) -> State<T> {
    match state {
        State::PendingShow { buffered } => {
            let _ = tx.send(buffered);
            arm(timer, config.min_shown);
            State::Prolonging { terminal: None }
        }
        State::Prolonging { terminal: Some(t) } => {
            let _ = tx.send(t);
            State::Idle
        }
        State::Prolonging { terminal: None } => State::Shown,
        // A cancelled timer never fires; these are unreachable but harmless.
        other => other,
    }
}
