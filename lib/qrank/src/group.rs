use anyhow::{anyhow, Result};
use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};
use std::sync::Mutex;
use std::thread;

/// Marker error for aborts caused by stage cancellation. Stage drivers use
/// it to tell a task that died because a sibling failed apart from the task
/// that actually caused the failure.
#[derive(Debug, Clone, Copy)]
pub struct Cancelled;

impl std::fmt::Display for Cancelled {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("cancelled")
    }
}

impl std::error::Error for Cancelled {}

pub fn is_cancelled(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| cause.downcast_ref::<Cancelled>().is_some())
}

/// Cloneable cancellation token shared by the tasks of one stage.
///
/// Built on a zero-capacity crossbeam channel: nothing is ever sent, so
/// `recv` on the token's channel blocks until the matching [`CancelHandle`]
/// is dropped, at which point every clone observes the disconnect. This
/// makes the token usable both for polling (`is_cancelled`) and inside
/// `select!` arms against a blocking send.
#[derive(Clone)]
pub struct CancelToken {
    rx: Receiver<()>,
}

/// Dropping the handle cancels every associated [`CancelToken`].
pub struct CancelHandle {
    _tx: Sender<()>,
}

pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = bounded::<()>(0);
    (CancelHandle { _tx: tx }, CancelToken { rx })
}

impl CancelHandle {
    pub fn cancel(self) {}
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        matches!(self.rx.try_recv(), Err(TryRecvError::Disconnected))
    }

    pub fn bail_if_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(anyhow::Error::new(Cancelled));
        }
        Ok(())
    }

    /// The raw channel, for `select!` against other operations. It only ever
    /// completes (with a disconnect error) once the stage is cancelled.
    pub fn channel(&self) -> &Receiver<()> {
        &self.rx
    }

    /// Blocking send that aborts when the stage is cancelled.
    pub fn send<T>(&self, tx: &Sender<T>, msg: T) -> Result<()> {
        crossbeam_channel::select! {
            send(tx, msg) -> res => res.map_err(|_| anyhow!("channel closed")),
            recv(self.rx) -> _ => Err(anyhow::Error::new(Cancelled)),
        }
    }
}

pub type Task<'a> = Box<dyn FnOnce(&CancelToken) -> Result<()> + Send + 'a>;

/// Runs each task on its own thread and fails fast: the first task to return
/// an error cancels the token seen by its siblings, and that first error is
/// the one reported. All tasks are joined before returning.
pub fn run_group(tasks: Vec<Task<'_>>) -> Result<()> {
    let (handle, token) = cancel_pair();
    let handle = Mutex::new(Some(handle));
    let first_err: Mutex<Option<anyhow::Error>> = Mutex::new(None);

    thread::scope(|s| {
        for task in tasks {
            let token = token.clone();
            let handle = &handle;
            let first_err = &first_err;
            s.spawn(move || {
                if let Err(err) = task(&token) {
                    let mut slot = first_err.lock().unwrap();
                    if slot.is_none() {
                        *slot = Some(err);
                    }
                    drop(slot);
                    // Dropping the handle wakes up everyone else.
                    handle.lock().unwrap().take();
                }
            });
        }
    });

    match first_err.into_inner().unwrap() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
