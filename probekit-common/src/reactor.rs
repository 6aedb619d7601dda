use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::runtime;
use tokio::sync::{mpsc, watch};
use tokio::task::LocalSet;

use crate::failure::{Failure, FailureKind};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A single-threaded cooperative scheduler.
///
/// All callbacks registered on the reactor execute on the thread that
/// called [`Reactor::run`] (or [`Reactor::block_on`]); a callback never
/// runs synchronously from the call that scheduled it. Built on a
/// current-thread tokio runtime so that async protocol code and queued
/// callbacks interleave on one loop.
pub struct Reactor {
    rt: runtime::Runtime,
    jobs_tx: mpsc::UnboundedSender<Job>,
    jobs_rx: Mutex<mpsc::UnboundedReceiver<Job>>,
    stop_tx: watch::Sender<bool>,
    running: AtomicBool,
}

impl Reactor {
    pub fn new() -> Result<Self, Failure> {
        let rt = runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| Failure::wrap(FailureKind::NotInitialized, err.into()))?;
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let (stop_tx, _) = watch::channel(false);
        Ok(Self {
            rt,
            jobs_tx,
            jobs_rx: Mutex::new(jobs_rx),
            stop_tx,
            running: AtomicBool::new(false),
        })
    }

    /// Enqueues `f` to run on the loop before the next poll. Never runs
    /// `f` synchronously.
    pub fn call_soon(&self, f: impl FnOnce() + Send + 'static) {
        let _ = self.jobs_tx.send(Box::new(f));
    }

    /// Runs `f` on the loop no earlier than `delay` from now. Two timers
    /// with deadlines d1 < d2 fire in that order.
    pub fn call_later(&self, delay: Duration, f: impl FnOnce() + Send + 'static) {
        let tx = self.jobs_tx.clone();
        self.rt.spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Box::new(f));
        });
    }

    /// Blocks the calling thread dispatching queued callbacks and timers
    /// until [`Reactor::stop`] is called.
    pub fn run(&self) -> Result<(), Failure> {
        let _guard = self.enter()?;
        let mut stop_rx = self.stop_tx.subscribe();
        self.stop_tx.send_replace(false);
        let mut jobs = self.jobs_rx.lock().expect("reactor queue poisoned");
        let local = LocalSet::new();
        self.rt.block_on(local.run_until(async {
            loop {
                tokio::select! {
                    biased;
                    _ = stop_rx.wait_for(|stopped| *stopped) => break,
                    job = jobs.recv() => match job {
                        Some(job) => job(),
                        None => break,
                    },
                }
            }
        }));
        Ok(())
    }

    /// [`Reactor::call_soon`] followed by [`Reactor::run`].
    pub fn run_with_initial(&self, f: impl FnOnce() + Send + 'static) -> Result<(), Failure> {
        self.call_soon(f);
        self.run()
    }

    /// Drives `fut` to completion on this reactor's thread. Local tasks
    /// spawned by `fut` run on the same loop.
    pub fn block_on<F: Future>(&self, fut: F) -> Result<F::Output, Failure> {
        let _guard = self.enter()?;
        let local = LocalSet::new();
        Ok(self.rt.block_on(local.run_until(fut)))
    }

    /// Requests the loop to unblock at the next safe point. Timers already
    /// due may or may not run.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    fn enter(&self) -> Result<RunGuard<'_>, Failure> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Failure::with_reason(
                FailureKind::Generic,
                "reactor is already running",
            ));
        }
        Ok(RunGuard { reactor: self })
    }
}

struct RunGuard<'a> {
    reactor: &'a Reactor,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.reactor.running.store(false, Ordering::SeqCst);
    }
}
