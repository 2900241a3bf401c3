//! Engine Events
//!
//! Events flow from the real-time threads to whoever drives the engine.
//! The provider is an injected collaborator (never a global) so tests can
//! observe exactly the events a scenario produces.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};

/// Events emitted by the engine core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// A connection between a source and a sink became active.
    ConnectionEstablished { source_id: i32, sink_id: i32 },
    /// A connection was removed on request.
    ConnectionRemoved { source_id: i32, sink_id: i32 },
    /// A connection disappeared because its source was deleted.
    SourceDeleted { source_id: i32, sink_id: i32 },
    /// A sink device failed in a way the routing zone cannot recover from.
    UnrecoverableSinkDeviceError { device: String },
}

/// Queue handing engine events from the real-time threads to the control
/// side. Sending never blocks.
pub struct EventProvider {
    tx: Sender<EngineEvent>,
    rx: Receiver<EngineEvent>,
}

impl EventProvider {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = unbounded();
        Arc::new(Self { tx, rx })
    }

    pub fn send(&self, event: EngineEvent) {
        // The queue is unbounded; the send only fails when the provider
        // itself is gone, which cannot happen while we hold &self.
        let _ = self.tx.send(event);
    }

    /// Next event, non-blocking.
    pub fn try_next(&self) -> Option<EngineEvent> {
        self.rx.try_recv().ok()
    }

    /// Next event, waiting up to `timeout`.
    pub fn wait_next(&self, timeout: Duration) -> Option<EngineEvent> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Drain everything currently queued.
    pub fn drain(&self) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }
}
