use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::select;
use tokio::sync::Notify;
use tokio::time::{self, Instant};

/// The paired short/long one-shot timers used on both sides of the
/// protocol.
///
/// Whichever deadline is reached first runs the action once and closes the
/// current window; the other deadline is implicitly disarmed. Appending
/// activity keeps a window open by pushing the short deadline out with
/// [`TimerPair::try_reset_short`], while the long deadline bounds the total
/// window length no matter how often the short one is reset.
///
/// The `expired` flag is the single authoritative "window closed" signal:
/// it is flipped under the same lock that resets consult, so a reset can
/// never succeed once the action has been committed to run.
pub(crate) struct TimerPair {
    state: Arc<Mutex<PairState>>,
    wakeup: Arc<Notify>,
    short: Duration,
    long: Duration,
}

struct PairState {
    short_deadline: Instant,
    long_deadline: Instant,
    expired: bool,
    cancelled: bool,
}

impl TimerPair {
    /// Spawns the watcher task. With `armed` the first window opens
    /// immediately, otherwise the pair idles until [`TimerPair::restart`].
    /// With `once` the task exits after its single firing (send groups
    /// never re-open their window).
    pub fn spawn<F, Fut>(
        short: Duration,
        long: Duration,
        armed: bool,
        once: bool,
        action: F,
    ) -> TimerPair
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let now = Instant::now();
        let state = Arc::new(Mutex::new(PairState {
            short_deadline: now + short,
            long_deadline: now + long,
            expired: !armed,
            cancelled: false,
        }));
        let wakeup = Arc::new(Notify::new());

        let task_state = state.clone();
        let task_wakeup = wakeup.clone();
        tokio::spawn(async move {
            loop {
                let deadline = {
                    let state = task_state.lock().expect("timer state poisoned");
                    if state.cancelled {
                        return;
                    }
                    if state.expired {
                        None
                    } else {
                        Some(state.short_deadline.min(state.long_deadline))
                    }
                };

                let Some(deadline) = deadline else {
                    // idle until a restart or cancel
                    task_wakeup.notified().await;
                    continue;
                };

                select! {
                    _ = time::sleep_until(deadline) => {
                        let fire = {
                            let mut state = task_state.lock().expect("timer state poisoned");
                            if state.cancelled {
                                return;
                            }
                            // a reset may have pushed the deadline out while
                            // we were sleeping
                            let due = Instant::now()
                                >= state.short_deadline.min(state.long_deadline);
                            if due && !state.expired {
                                state.expired = true;
                                true
                            } else {
                                false
                            }
                        };
                        if fire {
                            action().await;
                            if once {
                                return;
                            }
                        }
                    }
                    _ = task_wakeup.notified() => {}
                }
            }
        });

        TimerPair {
            state,
            wakeup,
            short,
            long,
        }
    }

    /// Pushes the short deadline out if the current window is still open.
    ///
    /// Returns false - without arming anything - once the window has
    /// closed; that result is the caller's signal to rotate to a new group
    /// or start a new ack cycle.
    pub fn try_reset_short(&self) -> bool {
        let mut state = self.state.lock().expect("timer state poisoned");
        if state.cancelled || state.expired {
            return false;
        }
        state.short_deadline = Instant::now() + self.short;
        drop(state);
        self.wakeup.notify_one();
        true
    }

    /// Opens a fresh window with both deadlines re-armed.
    pub fn restart(&self) {
        let mut state = self.state.lock().expect("timer state poisoned");
        if state.cancelled {
            return;
        }
        let now = Instant::now();
        state.short_deadline = now + self.short;
        state.long_deadline = now + self.long;
        state.expired = false;
        drop(state);
        self.wakeup.notify_one();
    }

    /// Permanently stops the pair; a pending action will not run.
    pub fn cancel(&self) {
        self.state.lock().expect("timer state poisoned").cancelled = true;
        self.wakeup.notify_one();
    }
}
