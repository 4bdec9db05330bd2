//! # Execution Lanes
//!
//! A fixed pool of serialized executors. Each lane is a current-thread
//! tokio runtime on its own OS thread, so everything spawned on one lane
//! runs one task step at a time and lanes run in parallel with each other.
//!
//! A connection is pinned to lane `uid % N` for its whole life. The pool
//! also hands out uids so that the mapping is fixed at creation.

use crate::core::Uid;
use crate::error::constants::ERR_LANE_START;
use crate::error::{GatewayError, Result};
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::thread;
use tokio::runtime::{Builder, Handle};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

struct Lane {
    handle: Handle,
    stop: Mutex<Option<oneshot::Sender<()>>>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

pub struct LanePool {
    lanes: Vec<Lane>,
    next_uid: AtomicU32,
}

impl LanePool {
    /// Start `count` lanes (at least one).
    pub fn new(count: usize) -> Result<Self> {
        let count = count.max(1);
        let mut lanes = Vec::with_capacity(count);
        for index in 0..count {
            lanes.push(Self::start_lane(index)?);
        }
        debug!(lanes = count, "Execution lanes started");
        Ok(Self {
            lanes,
            next_uid: AtomicU32::new(1),
        })
    }

    fn start_lane(index: usize) -> Result<Lane> {
        let (handle_tx, handle_rx) = std::sync::mpsc::channel();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let thread = thread::Builder::new()
            .name(format!("gateway-lane-{index}"))
            .spawn(move || {
                let runtime = match Builder::new_current_thread().enable_all().build() {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = handle_tx.send(Err(e));
                        return;
                    }
                };
                let _ = handle_tx.send(Ok(runtime.handle().clone()));
                runtime.block_on(async {
                    let _ = stop_rx.await;
                });
            })?;

        let handle = handle_rx
            .recv()
            .map_err(|_| GatewayError::InvalidState(ERR_LANE_START))??;

        Ok(Lane {
            handle,
            stop: Mutex::new(Some(stop_tx)),
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn len(&self) -> usize {
        self.lanes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lanes.is_empty()
    }

    /// Fresh uid, never 0
    pub fn next_uid(&self) -> Uid {
        loop {
            let uid = self.next_uid.fetch_add(1, Ordering::Relaxed);
            if uid != 0 {
                return uid;
            }
        }
    }

    pub fn lane_index(&self, uid: Uid) -> usize {
        uid as usize % self.lanes.len()
    }

    pub fn handle_for(&self, uid: Uid) -> &Handle {
        &self.lanes[self.lane_index(uid)].handle
    }

    /// Run `future` on the lane owning `uid`.
    pub fn spawn<F>(&self, uid: Uid, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle_for(uid).spawn(future)
    }

    /// Stop every lane and wait for its thread. Tasks still running on a
    /// lane are dropped with its runtime. Must not be called from a lane.
    pub fn shutdown(&self) {
        self.signal_stop();
        let current = thread::current().id();
        for (index, lane) in self.lanes.iter().enumerate() {
            let thread = match lane.thread.lock() {
                Ok(mut guard) => guard.take(),
                Err(poisoned) => poisoned.into_inner().take(),
            };
            if let Some(thread) = thread {
                if thread.thread().id() == current {
                    warn!(lane = index, "Lane shutdown requested from inside the lane");
                    continue;
                }
                if thread.join().is_err() {
                    warn!(lane = index, "Lane thread panicked");
                }
            }
        }
        debug!("Execution lanes stopped");
    }

    fn signal_stop(&self) {
        for lane in &self.lanes {
            let stop = match lane.stop.lock() {
                Ok(mut guard) => guard.take(),
                Err(poisoned) => poisoned.into_inner().take(),
            };
            if let Some(stop) = stop {
                let _ = stop.send(());
            }
        }
    }
}

impl Drop for LanePool {
    fn drop(&mut self) {
        self.signal_stop();
    }
}
