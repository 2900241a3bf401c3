//! Routing Facade
//!
//! Establishes and removes connections between source output ports and
//! zone input ports. All the clock-domain bookkeeping happens here: a
//! connection pins both ports to the switch matrix of the sink's routing
//! zone, and the pinning is what rejects cross-domain requests before any
//! real-time state is touched.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, info};

use crate::device::OwnerRef;
use crate::error::{XbarError, XbarResult};
use crate::matrix::SwitchMatrix;
use crate::port::{AudioPort, PortDirection};

/// Connection bookkeeping and the connect/disconnect entry points.
pub struct Routing {
    active: Mutex<HashSet<(i32, i32)>>,
}

impl Routing {
    pub fn new() -> Self {
        Self {
            active: Mutex::new(HashSet::new()),
        }
    }

    /// The switch matrix serving a zone input port.
    fn matrix_of_sink(sink: &Arc<AudioPort>) -> XbarResult<Arc<SwitchMatrix>> {
        let owner = sink.owner()?;
        match owner {
            OwnerRef::Zone(worker) => worker
                .upgrade()
                .and_then(|w| w.switch_matrix())
                .ok_or_else(|| {
                    error!("sink port {} has no switch matrix", sink.name());
                    XbarError::failed("sink port zone has no switch matrix")
                }),
            OwnerRef::Device(_) => {
                error!("sink port {} is not owned by a routing zone", sink.name());
                Err(XbarError::invalid_param(
                    "connection target must be a routing zone input port",
                ))
            }
        }
    }

    /// Connect a source output port to a routing zone input port.
    pub fn connect(&self, src: &Arc<AudioPort>, sink: &Arc<AudioPort>) -> XbarResult<()> {
        if src.direction() != PortDirection::Output {
            return Err(XbarError::invalid_param(format!(
                "port {} is not an output port",
                src.name()
            )));
        }
        if sink.direction() != PortDirection::Input {
            return Err(XbarError::invalid_param(format!(
                "port {} is not an input port",
                sink.name()
            )));
        }
        let matrix = Self::matrix_of_sink(sink)?;

        // Pin both ports to the matrix first; this is where a second clock
        // domain or a busy input port is refused, before any job exists.
        src.store_connection(&matrix)?;
        if let Err(e) = sink.store_connection(&matrix) {
            let _ = src.forget_connection(&matrix);
            return Err(e);
        }
        if let Err(e) = matrix.connect(Arc::clone(src), Arc::clone(sink)) {
            let _ = src.forget_connection(&matrix);
            let _ = sink.forget_connection(&matrix);
            return Err(e);
        }

        self.active.lock().insert((src.id(), sink.id()));
        info!("connected source {} to sink {}", src.id(), sink.id());
        Ok(())
    }

    /// Remove the connection between `src` and `sink`.
    pub fn disconnect(&self, src: &Arc<AudioPort>, sink: &Arc<AudioPort>) -> XbarResult<()> {
        if !self.active.lock().contains(&(src.id(), sink.id())) {
            return Err(XbarError::invalid_param(format!(
                "no connection between {} and {}",
                src.id(),
                sink.id()
            )));
        }
        let matrix = Self::matrix_of_sink(sink)?;
        matrix.disconnect(src, sink)?;
        let _ = src.forget_connection(&matrix);
        let _ = sink.forget_connection(&matrix);
        self.active.lock().remove(&(src.id(), sink.id()));
        info!("disconnected source {} from sink {}", src.id(), sink.id());
        Ok(())
    }

    /// Remove every connection of a source, e.g. before the source device
    /// disappears. Blocks (bounded) until the real-time side has retired
    /// the source's buffer task.
    pub fn disconnect_all(
        &self,
        src: &Arc<AudioPort>,
        sinks: &[Arc<AudioPort>],
    ) -> XbarResult<()> {
        let matrix = match src.switch_matrix() {
            Some(matrix) => matrix,
            None => return Ok(()),
        };
        matrix.remove_connections(src)?;
        let mut active = self.active.lock();
        for sink in sinks {
            if active.remove(&(src.id(), sink.id())) {
                let _ = src.forget_connection(&matrix);
                let _ = sink.forget_connection(&matrix);
            }
        }
        Ok(())
    }

    /// Keep a source drained by the given zone's matrix without routing it
    /// anywhere (dummy connection).
    pub fn connect_grouped(
        &self,
        src: &Arc<AudioPort>,
        matrix: &Arc<SwitchMatrix>,
    ) -> XbarResult<()> {
        src.store_connection(matrix)?;
        if let Err(e) = matrix.dummy_connect(src) {
            let _ = src.forget_connection(matrix);
            return Err(e);
        }
        Ok(())
    }

    pub fn release_grouped(&self, src: &Arc<AudioPort>) -> XbarResult<()> {
        let matrix = src
            .switch_matrix()
            .ok_or_else(|| XbarError::invalid_param("source is not grouped"))?;
        matrix.dummy_disconnect(src)?;
        src.forget_connection(&matrix)
    }

    /// Snapshot of the active (source id, sink id) pairs.
    pub fn active_connections(&self) -> Vec<(i32, i32)> {
        let mut connections: Vec<_> = self.active.lock().iter().copied().collect();
        connections.sort_unstable();
        connections
    }

    pub fn is_connected(&self, source_id: i32, sink_id: i32) -> bool {
        self.active.lock().contains(&(source_id, sink_id))
    }
}

impl Default for Routing {
    fn default() -> Self {
        Self::new()
    }
}
