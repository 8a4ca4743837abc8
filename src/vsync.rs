//! Display refresh signals.

use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::error::{Error, PlatformError};
use crate::time::{HostClock, HostTime};

/// Receives one call per display refresh.
pub trait TickTarget: Send + Sync {
    /// `timestamp` is the host time of the refresh that just happened and
    /// `duration` the refresh interval.
    fn tick(&self, timestamp: HostTime, duration: Duration);
}

/// A refresh signal such as a display link.
///
/// The signal holds its target through a [`Weak`] handle and never keeps it
/// alive. Owners unregister before they go away.
pub trait VsyncSignal: Send + Sync {
    fn register(&self, target: Weak<dyn TickTarget>);

    fn unregister(&self);

    fn set_paused(&self, paused: bool);

    fn is_paused(&self) -> bool;
}

struct State {
    target: Option<Weak<dyn TickTarget>>,
    paused: bool,
    shutdown: bool,
    ticks: u64,
}

struct Shared {
    state: Mutex<State>,
    wakeup: Condvar,
    interval: Duration,
    clock: HostClock,
}

/// Software display link: a dedicated thread ticking at a fixed interval.
///
/// Starts paused. The target is called without any internal lock held, so it
/// may pause or unregister the signal from inside `tick`.
pub struct ThreadVsync {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl ThreadVsync {
    pub fn new(interval: Duration) -> Result<Self, Error> {
        Self::with_clock(interval, HostClock::new())
    }

    /// Tick on `clock`, so timestamps line up with other users of it.
    pub fn with_clock(interval: Duration, clock: HostClock) -> Result<Self, Error> {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                target: None,
                paused: true,
                shutdown: false,
                ticks: 0,
            }),
            wakeup: Condvar::new(),
            interval,
            clock,
        });
        let worker = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("vsync".into())
            .spawn(move || run(&worker))
            .map_err(|e| Error::Platform(PlatformError::Message(e.to_string())))?;
        Ok(ThreadVsync {
            shared,
            thread: Some(thread),
        })
    }

    pub fn interval(&self) -> Duration {
        self.shared.interval
    }

    /// Refreshes delivered so far.
    pub fn ticks(&self) -> u64 {
        self.shared.state.lock().ticks
    }
}

fn run(shared: &Shared) {
    let interval = shared.interval;
    let mut deadline: Option<HostTime> = None;
    let mut state = shared.state.lock();
    loop {
        if state.shutdown {
            break;
        }
        if state.paused || state.target.is_none() {
            deadline = None;
            shared.wakeup.wait(&mut state);
            continue;
        }

        let now = shared.clock.now();
        let next = *deadline.get_or_insert(now + interval);
        if now < next {
            shared.wakeup.wait_for(&mut state, next - now);
            continue;
        }

        // Skip refreshes we slept through rather than bursting to catch up.
        deadline = Some(if now - next >= interval {
            now + interval
        } else {
            next + interval
        });

        let Some(target) = state.target.as_ref().and_then(Weak::upgrade) else {
            tracing::debug!("vsync target dropped, unregistering");
            state.target = None;
            continue;
        };
        state.ticks += 1;
        MutexGuard::unlocked(&mut state, || target.tick(next, interval));
    }
    tracing::trace!("vsync thread exiting");
}

impl VsyncSignal for ThreadVsync {
    fn register(&self, target: Weak<dyn TickTarget>) {
        self.shared.state.lock().target = Some(target);
        self.shared.wakeup.notify_all();
    }

    fn unregister(&self) {
        self.shared.state.lock().target = None;
    }

    fn set_paused(&self, paused: bool) {
        self.shared.state.lock().paused = paused;
        self.shared.wakeup.notify_all();
    }

    fn is_paused(&self) -> bool {
        self.shared.state.lock().paused
    }
}

impl Drop for ThreadVsync {
    fn drop(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.wakeup.notify_all();
        if let Some(thread) = self.thread.take() {
            // Dropped from inside a tick: the loop exits on its own.
            if thread.thread().id() != thread::current().id() {
                let _ = thread.join();
            }
        }
    }
}
