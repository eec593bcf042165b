//! Blocking hand-off queue behind long polling.
//!
//! Producers `offer` values; consumers `wait` for one with a deadline. Each
//! blocked consumer parks on its own oneshot channel, so an offer wakes
//! exactly one of them and the rest stay parked.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;

pub struct HandoffQueue<T> {
    state: Mutex<QueueState<T>>,
}

struct QueueState<T> {
    pending: VecDeque<T>,
    waiters: VecDeque<Waiter>,
    next_ticket: u64,
}

struct Waiter {
    ticket: u64,
    wake: oneshot::Sender<()>,
}

impl<T> QueueState<T> {
    /// Signals the oldest waiter still listening. Waiters whose receiver is
    /// gone are discarded so the signal is never spent on them.
    fn wake_next(&mut self) {
        while let Some(waiter) = self.waiters.pop_front() {
            if waiter.wake.send(()).is_ok() {
                break;
            }
        }
    }

    /// Returns `false` if the waiter was already popped by `wake_next`.
    fn remove_waiter(&mut self, ticket: u64) -> bool {
        match self.waiters.iter().position(|w| w.ticket == ticket) {
            Some(index) => {
                self.waiters.remove(index);
                true
            }
            None => false,
        }
    }
}

/// A consumer's place in the waiter list while its future is suspended.
///
/// If the future is dropped mid-wait, the ticket is withdrawn. When an offer
/// had already picked this consumer, the wake is handed to the next waiter so
/// the value does not sit unclaimed until some deadline fires.
struct Registration<'a, T> {
    queue: &'a HandoffQueue<T>,
    ticket: u64,
    armed: bool,
}

impl<T> Drop for Registration<'_, T> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.queue.state.lock();
        if !state.remove_waiter(self.ticket) && !state.pending.is_empty() {
            state.wake_next();
        }
    }
}

impl<T> Default for HandoffQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> HandoffQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                waiters: VecDeque::new(),
                next_ticket: 0,
            }),
        }
    }

    /// Appends `value` and wakes the longest-blocked consumer, if any.
    pub fn offer(&self, value: T) {
        let mut state = self.state.lock();
        state.pending.push_back(value);
        state.wake_next();
    }

    /// Non-blocking pop of the oldest pending value.
    pub fn try_take(&self) -> Option<T> {
        self.state.lock().pending.pop_front()
    }

    /// Waits up to `timeout` for a value. Returns `None` once the deadline
    /// passes without one.
    pub async fn wait(&self, timeout: Duration) -> Option<T> {
        self.wait_until(Instant::now() + timeout).await
    }

    pub async fn wait_until(&self, deadline: Instant) -> Option<T> {
        loop {
            let (mut registration, woken) = {
                let mut state = self.state.lock();
                if let Some(value) = state.pending.pop_front() {
                    return Some(value);
                }
                let ticket = state.next_ticket;
                state.next_ticket = state.next_ticket.wrapping_add(1);
                let (wake, woken) = oneshot::channel();
                state.waiters.push_back(Waiter { ticket, wake });
                let registration = Registration {
                    queue: self,
                    ticket,
                    armed: true,
                };
                (registration, woken)
            };

            let outcome = tokio::time::timeout_at(deadline, woken).await;
            // No await point from here on, so the guard is no longer needed.
            registration.armed = false;

            let mut state = self.state.lock();
            match outcome {
                // A wake only means a value was offered; another consumer may
                // have taken it already, so look and re-register if empty.
                Ok(_) => {
                    if let Some(value) = state.pending.pop_front() {
                        return Some(value);
                    }
                }
                Err(_) => {
                    state.remove_waiter(registration.ticket);
                    // Whether or not an offer picked us as the deadline fired,
                    // a queued value is still ours to take.
                    return state.pending.pop_front();
                }
            }
        }
    }

    /// Number of consumers currently parked with nothing to take.
    pub fn blocked_consumers(&self) -> usize {
        self.state
            .lock()
            .waiters
            .iter()
            .filter(|waiter| !waiter.wake.is_closed())
            .count()
    }

    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
