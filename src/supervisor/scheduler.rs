//! Supervisor background threads: event intake and the periodic timers.

use super::Inner;
use crate::error::SupervisorError;
use crossbeam::channel::{self, Receiver, Sender, select, tick};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error};

/// A named thread that runs until its stop channel disconnects
pub(super) struct Background {
    name: &'static str,
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Background {
    pub fn spawn<F>(name: &'static str, body: F) -> Result<Self, SupervisorError>
    where
        F: FnOnce(Receiver<()>) + Send + 'static,
    {
        let (stop, stop_rx) = channel::bounded(0);
        let thread = thread::Builder::new()
            .name(format!("rendershard-{name}"))
            .spawn(move || body(stop_rx))
            .map_err(|e| SupervisorError::Thread {
                name,
                reason: e.to_string(),
            })?;
        Ok(Self {
            name,
            stop: Some(stop),
            thread: Some(thread),
        })
    }

    /// Signals the thread and waits for it to finish.
    pub fn stop(&mut self) {
        self.stop = None;
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!(thread = self.name, "Supervisor thread panicked");
            } else {
                debug!(thread = self.name, "Supervisor thread stopped");
            }
        }
    }
}

impl Drop for Background {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Starts the rebalancing and health check timers.
pub(super) fn start_timers(inner: Arc<Inner>) -> Result<Background, SupervisorError> {
    let steal_every = inner.config.steal_interval;
    let health_every = inner.config.health_check_interval;
    Background::spawn("scheduler", move |stop| timer_loop(&inner, steal_every, health_every, stop))
}

fn timer_loop(inner: &Inner, steal_every: Duration, health_every: Duration, stop: Receiver<()>) {
    let steal = tick(steal_every);
    let health = tick(health_every);
    loop {
        select! {
            recv(steal) -> _ => inner.rebalance(),
            recv(health) -> _ => inner.health_check(),
            recv(stop) -> _ => return,
        }
    }
}

/// Starts the thread that handles every worker event.
pub(super) fn start_intake(inner: Arc<Inner>) -> Result<Background, SupervisorError> {
    let events = inner.events_rx.clone();
    Background::spawn("intake", move |stop| {
        loop {
            select! {
                recv(events) -> event => match event {
                    Ok(event) => inner.handle_event(event),
                    Err(_) => return,
                },
                recv(stop) -> _ => return,
            }
        }
    })
}
