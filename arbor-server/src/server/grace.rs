//! Per container idle timers. A container that is not touched for its grace
//! time is destroyed. Destruction is strictly one way: a timer knows the
//! backend and a handle, the backend knows nothing about timers.

use crate::backend::Backend;
use log::{debug, warn};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use tokio::{sync::mpsc, task, time};

enum Command {
    Reset,
    Defuse,
}

struct Timer {
    tx: mpsc::UnboundedSender<Command>,
}

/// Registry of armed grace timers, one single-shot timer task per container.
pub(crate) struct GraceTimers {
    backend: Arc<dyn Backend>,
    timers: Arc<Mutex<HashMap<String, Timer>>>,
}

impl GraceTimers {
    pub(crate) fn new(backend: Arc<dyn Backend>) -> Arc<GraceTimers> {
        Arc::new(GraceTimers {
            backend,
            timers: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Arm a timer for `handle` that fires `grace_time` from now. A zero
    /// grace time disables the timer. Re-arming replaces any previous timer.
    pub(crate) fn arm(&self, handle: String, grace_time: Duration) {
        if grace_time.is_zero() {
            debug!("Grace time of container {} is disabled", handle);
            return;
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        self.lock().insert(handle.clone(), Timer { tx });

        debug!(
            "Armed grace timer of container {} with {:?}",
            handle, grace_time
        );

        let backend = self.backend.clone();
        let timers = self.timers.clone();
        task::spawn(async move {
            loop {
                tokio::select! {
                    _ = time::sleep(grace_time) => {
                        timers.lock().expect("timer lock poisoned").remove(&handle);
                        debug!("Grace time of container {} elapsed. Destroying", handle);
                        if let Err(e) = backend.destroy(&handle).await {
                            warn!("Failed to destroy container {}: {}", handle, e);
                        }
                        break;
                    }
                    command = rx.recv() => match command {
                        Some(Command::Reset) => continue,
                        Some(Command::Defuse) | None => break,
                    }
                }
            }
        });
    }

    /// Restart the timer of `handle`, if any. A reset that races a fire is
    /// allowed to lose.
    pub(crate) fn reset(&self, handle: &str) {
        if let Some(timer) = self.lock().get(handle) {
            timer.tx.send(Command::Reset).ok();
        }
    }

    /// Drop the timer of `handle` without destroying anything.
    pub(crate) fn defuse(&self, handle: &str) {
        if let Some(timer) = self.lock().remove(handle) {
            timer.tx.send(Command::Defuse).ok();
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Timer>> {
        self.timers.lock().expect("timer lock poisoned")
    }
}
