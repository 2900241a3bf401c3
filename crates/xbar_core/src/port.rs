//! Audio Ports
//!
//! A port is a named handle onto a channel range of a ring buffer. Output
//! ports feed the switch matrix, input ports receive from it (a routing
//! zone's input ports are the sinks of the matrix; the zone binds them to
//! sink device input ports).
//!
//! Connection bookkeeping pins a port to at most one switch matrix: an
//! output port referenced by connections may only ever feed one clock
//! domain, and an input port accepts a single active connection. The
//! connection counter tracks simultaneous uses by derived zones sharing
//! the matrix.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::device::OwnerRef;
use crate::error::{XbarError, XbarResult};
use crate::format::SampleFormat;
use crate::matrix::SwitchMatrix;
use crate::ringbuf::RingBuffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortDirection {
    Input,
    Output,
}

/// Configuration of one audio port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortParams {
    pub name: String,
    pub id: i32,
    pub direction: PortDirection,
    pub num_channels: u32,
    /// First channel of this port inside its ring buffer.
    pub index: u32,
}

/// Everything a copy job needs to know about one side of a transfer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PortCopyInfo {
    pub num_channels: u32,
    pub index: u32,
    pub period_size: u32,
    pub sample_rate: u32,
    pub format: SampleFormat,
}

struct ConnectionState {
    count: u32,
    matrix: Option<Arc<SwitchMatrix>>,
}

/// Named I/O handle referencing a ring buffer region.
pub struct AudioPort {
    params: PortParams,
    ring: Mutex<Option<Arc<RingBuffer>>>,
    owner: Mutex<Option<OwnerRef>>,
    connection: Mutex<ConnectionState>,
}

impl AudioPort {
    pub fn new(params: PortParams) -> Arc<Self> {
        Arc::new(Self {
            params,
            ring: Mutex::new(None),
            owner: Mutex::new(None),
            connection: Mutex::new(ConnectionState {
                count: 0,
                matrix: None,
            }),
        })
    }

    pub fn params(&self) -> &PortParams {
        &self.params
    }

    pub fn name(&self) -> &str {
        &self.params.name
    }

    pub fn id(&self) -> i32 {
        self.params.id
    }

    pub fn direction(&self) -> PortDirection {
        self.params.direction
    }

    pub fn num_channels(&self) -> u32 {
        self.params.num_channels
    }

    pub fn set_ring_buffer(&self, buffer: Arc<RingBuffer>) {
        *self.ring.lock() = Some(buffer);
    }

    pub fn clear_ring_buffer(&self) {
        *self.ring.lock() = None;
    }

    pub fn ring_buffer(&self) -> XbarResult<Arc<RingBuffer>> {
        self.ring
            .lock()
            .clone()
            .ok_or(XbarError::NotInitialized("port has no ring buffer"))
    }

    pub fn set_owner(&self, owner: OwnerRef) {
        *self.owner.lock() = Some(owner);
    }

    pub fn clear_owner(&self) {
        *self.owner.lock() = None;
    }

    pub fn owner(&self) -> XbarResult<OwnerRef> {
        self.owner
            .lock()
            .clone()
            .ok_or(XbarError::NotInitialized("port has no owner"))
    }

    /// Collect the information a copy/SRC job needs from this port.
    pub fn copy_information(&self) -> XbarResult<PortCopyInfo> {
        let ring = self.ring_buffer()?;
        let owner = self.owner()?;
        let period_size = owner
            .period_size()
            .ok_or(XbarError::NotInitialized("port owner gone"))?;
        let sample_rate = owner
            .sample_rate()
            .ok_or(XbarError::NotInitialized("port owner gone"))?;
        Ok(PortCopyInfo {
            num_channels: self.params.num_channels,
            index: self.params.index,
            period_size,
            sample_rate,
            format: ring.format(),
        })
    }

    /// Record one active connection through `matrix`.
    ///
    /// Rejected when an input port already has a connection, or when an
    /// output port is already connected through a different switch matrix
    /// (that would bridge two clock domains).
    pub fn store_connection(&self, matrix: &Arc<SwitchMatrix>) -> XbarResult<()> {
        let mut state = self.connection.lock();
        if state.count == 0 {
            state.matrix = Some(Arc::clone(matrix));
            state.count = 1;
            return Ok(());
        }
        if self.params.direction == PortDirection::Input {
            error!("port {}: input port already has a connection", self.params.name);
            return Err(XbarError::failed(format!(
                "input port {} already connected",
                self.params.name
            )));
        }
        match &state.matrix {
            Some(existing) if Arc::ptr_eq(existing, matrix) => {
                state.count += 1;
                Ok(())
            }
            _ => {
                error!(
                    "port {}: already connected to an independent zone",
                    self.params.name
                );
                Err(XbarError::failed(format!(
                    "port {} is already connected to a different clock domain",
                    self.params.name
                )))
            }
        }
    }

    /// Forget one connection through `matrix`. When the last connection is
    /// gone, the matrix pinning is released.
    pub fn forget_connection(&self, matrix: &Arc<SwitchMatrix>) -> XbarResult<()> {
        let mut state = self.connection.lock();
        if state.count == 0 {
            return Err(XbarError::failed(format!(
                "port {} is not connected",
                self.params.name
            )));
        }
        match &state.matrix {
            Some(existing) if Arc::ptr_eq(existing, matrix) => {
                state.count -= 1;
                if state.count == 0 {
                    state.matrix = None;
                }
                Ok(())
            }
            _ => Err(XbarError::failed(format!(
                "port {} has no connection through this switch matrix",
                self.params.name
            ))),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection.lock().count > 0
    }

    pub fn active_connections(&self) -> u32 {
        self.connection.lock().count
    }

    pub fn switch_matrix(&self) -> Option<Arc<SwitchMatrix>> {
        self.connection.lock().matrix.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventProvider;

    fn port(id: i32, direction: PortDirection) -> Arc<AudioPort> {
        AudioPort::new(PortParams {
            name: format!("port_{}", id),
            id,
            direction,
            num_channels: 2,
            index: 0,
        })
    }

    fn matrix(name: &str) -> Arc<SwitchMatrix> {
        SwitchMatrix::new(name, 64, 48_000, EventProvider::new()).unwrap()
    }

    #[test]
    fn test_output_port_multiple_connections_same_matrix() {
        let p = port(1, PortDirection::Output);
        let m = matrix("pt_m1");
        assert!(!p.is_connected());

        p.store_connection(&m).unwrap();
        p.store_connection(&m).unwrap();
        assert_eq!(p.active_connections(), 2);
        assert!(p.is_connected());

        p.forget_connection(&m).unwrap();
        assert!(p.is_connected());
        assert!(p.switch_matrix().is_some());
        p.forget_connection(&m).unwrap();
        assert!(!p.is_connected());
        assert!(p.switch_matrix().is_none());
    }

    #[test]
    fn test_output_port_rejects_second_matrix() {
        let p = port(2, PortDirection::Output);
        let m1 = matrix("pt_m2a");
        let m2 = matrix("pt_m2b");

        p.store_connection(&m1).unwrap();
        assert!(p.store_connection(&m2).is_err());
        // The rejected attempt must not change the bookkeeping.
        assert_eq!(p.active_connections(), 1);
        assert!(Arc::ptr_eq(&p.switch_matrix().unwrap(), &m1));
    }

    #[test]
    fn test_input_port_single_connection() {
        let p = port(3, PortDirection::Input);
        let m = matrix("pt_m3");

        p.store_connection(&m).unwrap();
        assert!(p.store_connection(&m).is_err());
        assert_eq!(p.active_connections(), 1);
    }

    #[test]
    fn test_forget_without_connection_fails() {
        let p = port(4, PortDirection::Output);
        let m = matrix("pt_m4");
        assert!(p.forget_connection(&m).is_err());
    }

    #[test]
    fn test_forget_wrong_matrix_fails() {
        let p = port(5, PortDirection::Output);
        let m1 = matrix("pt_m5a");
        let m2 = matrix("pt_m5b");
        p.store_connection(&m1).unwrap();
        assert!(p.forget_connection(&m2).is_err());
        assert_eq!(p.active_connections(), 1);
    }

    #[test]
    fn test_copy_information_requires_setup() {
        let p = port(6, PortDirection::Output);
        assert!(p.copy_information().is_err());
    }
}
