//! Logical client sessions.
//!
//! A session is identified by a client-chosen guid and outlives any single
//! socket. While a connection is bound, frames forward straight to its
//! socket task; while detached, frames queue in order and an expiry timer
//! runs. Re-attaching flushes the queue before anything new is sent, so a
//! client that reconnects within the grace period misses nothing.
//!
//! All methods here run under the server lock and never block.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::warn;

use uplink_core::{ensure, ContractViolation, EventBus, RunMode, ServerFrame};

/// Sender half of a socket task's outbound channel.
pub(crate) type FrameSender = mpsc::UnboundedSender<ServerFrame>;

/// Wake-ups for the expiry reaper.
#[derive(Debug)]
pub(crate) enum SessionEvent {
    Expire { guid: String, epoch: u64 },
}

struct BoundConnection {
    id: u64,
    tx: FrameSender,
}

pub(crate) struct Session {
    guid: String,
    pub(crate) subscriptions: HashSet<String>,
    pub(crate) listeners: HashSet<String>,
    bound: Option<BoundConnection>,
    /// Frames held while detached, flushed FIFO on attach.
    queue: VecDeque<ServerFrame>,
    queue_limit: Option<usize>,
    /// Bumped on every attach and every timer arm; an expiry message whose
    /// epoch is stale is ignored.
    pub(crate) epoch: u64,
    timer: Option<AbortHandle>,
}

impl Session {
    /// A fresh session starts detached; the caller arms the first timer.
    pub(crate) fn new(guid: String, queue_limit: Option<usize>) -> Self {
        Self {
            guid,
            subscriptions: HashSet::new(),
            listeners: HashSet::new(),
            bound: None,
            queue: VecDeque::new(),
            queue_limit,
            epoch: 0,
            timer: None,
        }
    }

    pub(crate) fn is_attached(&self) -> bool {
        self.bound.is_some()
    }

    /// Id of the bound connection, if any.
    pub(crate) fn bound_id(&self) -> Option<u64> {
        self.bound.as_ref().map(|conn| conn.id)
    }

    /// Forward `frame` now, or queue it until the next attach.
    ///
    /// A send failure means the socket task is already gone; the frame is
    /// dropped and the disconnect path re-queues nothing, exactly as if the
    /// frame had been written to a socket that died in flight.
    pub(crate) fn emit(&mut self, frame: ServerFrame) {
        match &self.bound {
            Some(conn) => {
                let _ = conn.tx.send(frame);
            }
            None => {
                if let Some(limit) = self.queue_limit {
                    if self.queue.len() >= limit {
                        self.queue.pop_front();
                        warn!(
                            guid = %self.guid,
                            limit,
                            "detached queue full, dropping oldest frame"
                        );
                    }
                }
                self.queue.push_back(frame);
            }
        }
    }

    /// Bind a connection, flushing queued frames into it first.
    pub(crate) fn attach(&mut self, id: u64, tx: FrameSender) {
        self.cancel_timer();
        self.epoch += 1;
        for frame in self.queue.drain(..) {
            let _ = tx.send(frame);
        }
        self.bound = Some(BoundConnection { id, tx });
    }

    /// Unbind the connection and restart the expiry clock. Returns false if
    /// the session was already detached.
    pub(crate) fn detach(
        &mut self,
        timeout: Duration,
        events: &mpsc::UnboundedSender<SessionEvent>,
    ) -> bool {
        if self.bound.take().is_none() {
            return false;
        }
        self.arm_expiry(timeout, events);
        true
    }

    /// Start (or restart) the expiry timer for the current detached spell.
    pub(crate) fn arm_expiry(
        &mut self,
        timeout: Duration,
        events: &mpsc::UnboundedSender<SessionEvent>,
    ) {
        self.cancel_timer();
        self.epoch += 1;
        let epoch = self.epoch;
        let guid = self.guid.clone();
        let events = events.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = events.send(SessionEvent::Expire { guid, epoch });
        });
        self.timer = Some(handle.abort_handle());
    }

    pub(crate) fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    pub(crate) fn subscribe(
        &mut self,
        key: &str,
        bus: &mut EventBus,
        mode: RunMode,
    ) -> Result<(), ContractViolation> {
        ensure(
            mode,
            !self.subscriptions.contains(key),
            &format!("subscribeTo('{key}'): already subscribed."),
        )?;
        self.subscriptions.insert(key.to_string());
        bus.add_listener(key, &self.guid);
        Ok(())
    }

    pub(crate) fn unsubscribe(
        &mut self,
        key: &str,
        bus: &mut EventBus,
        mode: RunMode,
    ) -> Result<(), ContractViolation> {
        ensure(
            mode,
            self.subscriptions.contains(key),
            &format!("unsubscribeFrom('{key}'): not subscribed."),
        )?;
        self.subscriptions.remove(key);
        bus.remove_listener(key, &self.guid);
        Ok(())
    }

    pub(crate) fn listen(
        &mut self,
        name: &str,
        bus: &mut EventBus,
        mode: RunMode,
    ) -> Result<(), ContractViolation> {
        ensure(
            mode,
            !self.listeners.contains(name),
            &format!("listenTo('{name}'): already listening."),
        )?;
        self.listeners.insert(name.to_string());
        bus.add_listener(name, &self.guid);
        Ok(())
    }

    pub(crate) fn unlisten(
        &mut self,
        name: &str,
        bus: &mut EventBus,
        mode: RunMode,
    ) -> Result<(), ContractViolation> {
        ensure(
            mode,
            self.listeners.contains(name),
            &format!("unlistenFrom('{name}'): not listening."),
        )?;
        self.listeners.remove(name);
        bus.remove_listener(name, &self.guid);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn queued_len(&self) -> usize {
        self.queue.len()
    }
}
