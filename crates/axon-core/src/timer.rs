//! Deferred callbacks bound to a device gate
//!
//! A timer owns one tokio task that sleeps until its deadline and then runs
//! the callback on the blocking pool while holding the device gate. Rescheduling
//! keeps the same handle; a reschedule from inside the callback turns the timer
//! into a poll loop.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::bus::DeviceGate;

/// Stable identity of a timer across reschedules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Pending(Instant),
    Running,
    Fired,
    Cancelled,
}

struct TimerState {
    phase: Phase,
    task_alive: bool,
}

struct TimerShared {
    id: TimerId,
    gate: DeviceGate,
    state: Mutex<TimerState>,
    wake: Notify,
    callback: Mutex<Box<dyn FnMut() + Send>>,
    runtime: Handle,
}

/// Handle to a scheduled callback
#[derive(Clone)]
pub struct TimerHandle {
    shared: Arc<TimerShared>,
}

/// Factory for timers on a given runtime
#[derive(Clone)]
pub struct Timers {
    runtime: Handle,
    next_id: Arc<AtomicU64>,
}

impl Timers {
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Run `callback` once after `delay` under `gate`
    pub fn set<F>(&self, gate: DeviceGate, delay: Duration, callback: F) -> TimerHandle
    where
        F: FnMut() + Send + 'static,
    {
        let id = TimerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let shared = Arc::new(TimerShared {
            id,
            gate,
            state: Mutex::new(TimerState {
                phase: Phase::Pending(Instant::now() + delay),
                task_alive: true,
            }),
            wake: Notify::new(),
            callback: Mutex::new(Box::new(callback)),
            runtime: self.runtime.clone(),
        });
        debug!(timer = id.0, delay_ms = delay.as_millis() as u64, "Timer set");
        spawn_runner(shared.clone());
        TimerHandle { shared }
    }

    pub fn cancel(&self, handle: &TimerHandle) -> bool {
        handle.cancel()
    }

    pub fn reschedule(&self, handle: &TimerHandle, delay: Duration) {
        handle.reschedule(delay)
    }
}

impl TimerHandle {
    pub fn id(&self) -> TimerId {
        self.shared.id
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.shared.state.lock().phase, Phase::Pending(_))
    }

    /// Stop the timer; returns whether it was still pending
    ///
    /// Idempotent. When called while holding the device gate the callback is
    /// guaranteed not to run afterwards.
    pub fn cancel(&self) -> bool {
        let mut state = self.shared.state.lock();
        let was_pending = matches!(state.phase, Phase::Pending(_));
        if state.phase != Phase::Fired {
            state.phase = Phase::Cancelled;
        }
        drop(state);
        self.shared.wake.notify_one();
        was_pending
    }

    /// Move the deadline to `delay` from now, re-arming a fired or cancelled timer
    pub fn reschedule(&self, delay: Duration) {
        let mut state = self.shared.state.lock();
        state.phase = Phase::Pending(Instant::now() + delay);
        if state.task_alive {
            drop(state);
            self.shared.wake.notify_one();
        } else {
            state.task_alive = true;
            drop(state);
            spawn_runner(self.shared.clone());
        }
    }
}

fn spawn_runner(shared: Arc<TimerShared>) {
    let runtime = shared.runtime.clone();
    runtime.spawn(run(shared));
}

async fn run(shared: Arc<TimerShared>) {
    loop {
        let deadline = {
            let mut state = shared.state.lock();
            match state.phase {
                Phase::Pending(deadline) => deadline,
                _ => {
                    state.task_alive = false;
                    return;
                }
            }
        };

        tokio::select! {
            _ = tokio::time::sleep_until(deadline.into()) => {}
            _ = shared.wake.notified() => continue,
        }

        let firing = shared.clone();
        match tokio::task::spawn_blocking(move || fire(&firing)).await {
            Ok(true) => continue,
            Ok(false) => return,
            Err(e) => {
                warn!(timer = shared.id.0, error = %e, "Timer callback panicked");
                let mut state = shared.state.lock();
                state.phase = Phase::Fired;
                state.task_alive = false;
                return;
            }
        }
    }
}

/// Run the callback if still due; returns whether the runner should keep going
fn fire(shared: &TimerShared) -> bool {
    let _gate = shared.gate.lock();
    {
        let mut state = shared.state.lock();
        match state.phase {
            Phase::Pending(deadline) if deadline > Instant::now() => return true,
            Phase::Pending(_) => state.phase = Phase::Running,
            Phase::Running => return true,
            Phase::Fired | Phase::Cancelled => {
                state.task_alive = false;
                return false;
            }
        }
    }

    (shared.callback.lock())();

    let mut state = shared.state.lock();
    match state.phase {
        Phase::Running => {
            state.phase = Phase::Fired;
            state.task_alive = false;
            false
        }
        Phase::Pending(_) => true,
        Phase::Fired | Phase::Cancelled => {
            state.task_alive = false;
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::ReentrantMutex;
    use std::sync::atomic::AtomicUsize;

    fn gate() -> DeviceGate {
        Arc::new(ReentrantMutex::new(()))
    }

    fn counter() -> (Arc<AtomicUsize>, impl FnMut() + Send + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = count.clone();
        (count, move || {
            inner.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_fires_after_delay() {
        let timers = Timers::new(Handle::current());
        let (count, callback) = counter();
        let handle = timers.set(gate(), Duration::from_millis(50), callback);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(handle.is_pending());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!handle.is_pending());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_is_idempotent() {
        let timers = Timers::new(Handle::current());
        let (count, callback) = counter();
        let handle = timers.set(gate(), Duration::from_millis(50), callback);

        assert!(timers.cancel(&handle));
        assert!(!timers.cancel(&handle));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_after_fire_returns_false() {
        let timers = Timers::new(Handle::current());
        let (count, callback) = counter();
        let handle = timers.set(gate(), Duration::from_millis(5), callback);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!handle.cancel());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reschedule_keeps_id_and_moves_deadline() {
        let timers = Timers::new(Handle::current());
        let (count, callback) = counter();
        let handle = timers.set(gate(), Duration::from_millis(30), callback);
        let id = handle.id();

        timers.reschedule(&handle, Duration::from_millis(200));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(handle.id(), id);

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        handle.reschedule(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reschedule_from_callback_polls() {
        let timers = Timers::new(Handle::current());
        let count = Arc::new(AtomicUsize::new(0));
        let slot: Arc<Mutex<Option<TimerHandle>>> = Arc::new(Mutex::new(None));

        let inner_count = count.clone();
        let inner_slot = slot.clone();
        let handle = timers.set(gate(), Duration::from_millis(5), move || {
            let n = inner_count.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 {
                if let Some(h) = inner_slot.lock().as_ref() {
                    h.reschedule(Duration::from_millis(5));
                }
            }
        });
        *slot.lock() = Some(handle);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_callback_waits_for_gate() {
        let timers = Timers::new(Handle::current());
        let gate = gate();
        let released_at = Arc::new(Mutex::new(None::<Instant>));
        let fired_at = Arc::new(Mutex::new(None::<Instant>));

        let holder_gate = gate.clone();
        let holder_released = released_at.clone();
        let holder = std::thread::spawn(move || {
            let _g = holder_gate.lock();
            std::thread::sleep(Duration::from_millis(100));
            *holder_released.lock() = Some(Instant::now());
        });
        std::thread::sleep(Duration::from_millis(10));

        let fired = fired_at.clone();
        timers.set(gate, Duration::from_millis(5), move || {
            *fired.lock() = Some(Instant::now());
        });

        tokio::time::sleep(Duration::from_millis(300)).await;
        holder.join().unwrap();

        let released = released_at.lock().unwrap();
        let fired = fired_at.lock().unwrap();
        assert!(fired >= released);
    }
}
