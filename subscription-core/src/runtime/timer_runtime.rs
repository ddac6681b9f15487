//! Runtime handles for the timer subsystem.

use crate::observability::events;
use crate::status::{Status, StatusCode};
use lazy_static::lazy_static;
use parking_lot::Mutex;
use std::fmt::{Debug, Formatter};
use std::future::Future;
use std::sync::{mpsc, Arc};
use std::thread;
use tokio::runtime::{Builder, Handle};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const COMPONENT: &str = "timer_runtime";
const SHARED_TIMER_RUNTIME_THREAD_NAME: &str = "subscription-timer";

lazy_static! {
    static ref SHARED_TIMER_RUNTIME: Result<TimerRuntime, Status> =
        TimerRuntime::dedicated(SHARED_TIMER_RUNTIME_THREAD_NAME);
}

/// Keeps a dedicated runtime thread alive until the last handle is dropped.
struct DedicatedRuntime {
    thread_name: String,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

impl Drop for DedicatedRuntime {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.lock().take() {
            let _ = shutdown.send(());
            debug!(
                component = COMPONENT,
                thread_name = %self.thread_name,
                "dedicated timer runtime released"
            );
        }
    }
}

/// Spawner for throttle ticks and reply timers.
#[derive(Clone)]
pub struct TimerRuntime {
    handle: Handle,
    _dedicated: Option<Arc<DedicatedRuntime>>,
}

impl TimerRuntime {
    /// Uses the tokio runtime the caller is currently running on.
    pub fn current() -> Result<Self, Status> {
        let handle = Handle::try_current().map_err(|e| {
            Status::fail_with_code(
                StatusCode::InvalidState,
                format!("no tokio runtime available: {e}"),
            )
        })?;
        Ok(Self::from_handle(handle))
    }

    pub fn from_handle(handle: Handle) -> Self {
        Self {
            handle,
            _dedicated: None,
        }
    }

    /// Spawns a named thread that owns a current-thread runtime.
    pub fn dedicated(thread_name: &str) -> Result<Self, Status> {
        debug!(
            event = events::RUNTIME_SPAWN_START,
            component = COMPONENT,
            thread_name,
            "spawning dedicated timer runtime"
        );

        let (handle_tx, handle_rx) = mpsc::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let spawn_result = thread::Builder::new()
            .name(thread_name.to_string())
            .spawn(move || {
                let runtime = match Builder::new_current_thread().enable_all().build() {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        let _ = handle_tx.send(Err(err.to_string()));
                        return;
                    }
                };
                let _ = handle_tx.send(Ok(runtime.handle().clone()));
                runtime.block_on(async move {
                    let _ = shutdown_rx.await;
                });
            });

        if let Err(err) = spawn_result {
            warn!(
                event = events::RUNTIME_SPAWN_FAILED,
                component = COMPONENT,
                thread_name,
                err = %err,
                "unable to spawn timer runtime thread"
            );
            return Err(Status::fail_with_code(
                StatusCode::ResourceExhausted,
                format!("unable to spawn timer runtime thread: {err}"),
            ));
        }

        let handle = match handle_rx.recv() {
            Ok(Ok(handle)) => handle,
            Ok(Err(reason)) => {
                warn!(
                    event = events::RUNTIME_SPAWN_FAILED,
                    component = COMPONENT,
                    thread_name,
                    err = %reason,
                    "unable to build timer runtime"
                );
                return Err(Status::fail_with_code(
                    StatusCode::ResourceExhausted,
                    format!("unable to build timer runtime: {reason}"),
                ));
            }
            Err(err) => {
                return Err(Status::fail_with_code(
                    StatusCode::ResourceExhausted,
                    format!("timer runtime thread exited early: {err}"),
                ));
            }
        };

        debug!(
            event = events::RUNTIME_SPAWN_OK,
            component = COMPONENT,
            thread_name,
            "dedicated timer runtime ready"
        );

        Ok(Self {
            handle,
            _dedicated: Some(Arc::new(DedicatedRuntime {
                thread_name: thread_name.to_string(),
                shutdown: Mutex::new(Some(shutdown_tx)),
            })),
        })
    }

    /// Process-wide dedicated runtime created on first use.
    pub fn shared() -> Result<Self, Status> {
        SHARED_TIMER_RUNTIME.clone()
    }

    pub(crate) fn spawn<F>(&self, future: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handle.spawn(future)
    }
}

impl Debug for TimerRuntime {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerRuntime")
            .field("dedicated", &self._dedicated.is_some())
            .finish_non_exhaustive()
    }
}
