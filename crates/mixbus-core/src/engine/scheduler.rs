//! Fixed-period mix worker
//!
//! One thread per running engine. Every period it mixes a tick, publishes the
//! level meters and handles stream fault notices. It holds only a weak
//! reference to the engine, so a dropped engine also ends the worker.
//!
//! Stopping is channel-driven: dropping the stop sender wakes the worker out
//! of its `recv_timeout` immediately rather than after the next period.

use std::sync::Weak;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, RecvTimeoutError, Sender};

use super::controller::EngineCore;
use crate::audio::{AudioError, AudioResult};

/// Handle to the running mix worker
pub struct MixScheduler {
    stop_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl MixScheduler {
    /// Start the worker with the given period
    pub(crate) fn spawn(core: Weak<EngineCore>, interval: Duration) -> AudioResult<Self> {
        let (stop_tx, stop_rx) = channel::bounded::<()>(1);

        let thread = thread::Builder::new()
            .name("mixbus-mixer".into())
            .spawn(move || {
                log::debug!("Mix worker started ({:?} period)", interval);
                let mut next = Instant::now() + interval;
                loop {
                    let wait = next.saturating_duration_since(Instant::now());
                    match stop_rx.recv_timeout(wait) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                    next += interval;

                    let Some(engine) = core.upgrade() else { break };
                    engine.tick();
                    engine.handle_faults();

                    // Fell more than a period behind: resync instead of bursting
                    let now = Instant::now();
                    if next < now {
                        next = now + interval;
                    }
                }
                log::debug!("Mix worker stopped");
            })
            .map_err(|e| {
                AudioError::StreamBuildError(format!("failed to spawn mix worker: {}", e))
            })?;

        Ok(Self {
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        })
    }

    /// Wake the worker and wait for it to exit
    pub fn stop(&mut self) {
        self.stop_tx.take();
        if let Some(thread) = self.thread.take() {
            if thread.thread().id() == thread::current().id() {
                return;
            }
            if thread.join().is_err() {
                log::error!("Mix worker panicked");
            }
        }
    }
}

impl Drop for MixScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
