//! Event debouncing.
//!
//! The first event after a quiet period is dispatched immediately. Events that
//! arrive while the window is open replace each other and the most recent one
//! is dispatched once the window has been quiet for its full length.

use futures::future::BoxFuture;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Async event handler invoked by a [`Debouncer`].
pub type DebounceHandler<T> = Arc<dyn Fn(T) -> BoxFuture<'static, ()> + Send + Sync>;

struct DebounceState<T> {
    /// When the current window closes; `None` when quiet.
    quiet_at: Option<Instant>,

    /// Latest event coalesced inside the window.
    pending: Option<T>,
}

/// Leading-edge debouncer with a coalesced trailing dispatch.
pub struct Debouncer<T> {
    window: Duration,
    handler: DebounceHandler<T>,
    state: Arc<Mutex<DebounceState<T>>>,
}

impl<T: Send + 'static> Debouncer<T> {
    pub fn new(window: Duration, handler: DebounceHandler<T>) -> Self {
        Self {
            window,
            handler,
            state: Arc::new(Mutex::new(DebounceState {
                quiet_at: None,
                pending: None,
            })),
        }
    }

    /// Feed one event.
    ///
    /// Returns the handle of the dispatch when this call was a leading edge.
    pub fn call(&self, event: T) -> Option<JoinHandle<()>> {
        let now = Instant::now();
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let window_open = state.quiet_at.is_some_and(|quiet_at| now < quiet_at);
            state.quiet_at = Some(now + self.window);
            if window_open {
                state.pending = Some(event);
                return None;
            }
            // leftover from a window whose trailing timer has not run yet
            state.pending = None;
        }

        self.spawn_trailing_timer();
        Some(tokio::spawn((self.handler)(event)))
    }

    /// Whether a window is currently open.
    pub fn is_hot(&self) -> bool {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.quiet_at.is_some_and(|quiet_at| Instant::now() < quiet_at)
    }

    fn spawn_trailing_timer(&self) {
        let state = self.state.clone();
        let handler = self.handler.clone();

        tokio::spawn(async move {
            loop {
                let deadline = {
                    let state = state.lock().unwrap_or_else(|e| e.into_inner());
                    match state.quiet_at {
                        Some(deadline) => deadline,
                        None => return,
                    }
                };
                tokio::time::sleep_until(deadline).await;

                let fired = {
                    let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
                    if state.quiet_at.is_some_and(|quiet_at| quiet_at > Instant::now()) {
                        // window was extended while sleeping
                        None
                    } else {
                        state.quiet_at = None;
                        Some(state.pending.take())
                    }
                };

                match fired {
                    None => continue,
                    Some(Some(event)) => {
                        handler(event).await;
                        return;
                    }
                    Some(None) => return,
                }
            }
        });
    }
}
