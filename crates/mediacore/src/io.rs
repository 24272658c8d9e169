use crate::{BufferId, NodeError};
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::rc::Rc;

/// Status word of an IO region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IoStatus {
    Ok,
    /// The consumer drained the slot and wants a new buffer
    NeedBuffer,
    /// The producer filled the slot
    HaveBuffer,
    Error,
}

#[derive(Debug, Clone, Copy)]
struct IoArea {
    buffer_id: Option<BufferId>,
    status: IoStatus,
}

/// Single-slot status cell shared by the two ports of a link.
///
/// Cloning shares the same cell. Regions are only touched from the data
/// thread, so interior mutability through `Cell` is sufficient.
#[derive(Debug, Clone)]
pub struct IoRegion(Rc<Cell<IoArea>>);

impl IoRegion {
    /// New region; the consumer has nothing yet.
    pub fn new() -> Self {
        Self(Rc::new(Cell::new(IoArea {
            buffer_id: None,
            status: IoStatus::NeedBuffer,
        })))
    }

    pub fn status(&self) -> IoStatus {
        self.0.get().status
    }

    pub fn buffer_id(&self) -> Option<BufferId> {
        self.0.get().buffer_id
    }

    pub fn set_status(&self, status: IoStatus) {
        let mut area = self.0.get();
        area.status = status;
        self.0.set(area);
    }

    pub fn set_buffer_id(&self, buffer_id: Option<BufferId>) {
        let mut area = self.0.get();
        area.buffer_id = buffer_id;
        self.0.set(area);
    }

    /// Producer side: publish a filled buffer.
    ///
    /// Fails if the previous buffer has not been consumed yet; the slot holds
    /// one buffer at a time.
    pub fn produce(&self, buffer_id: BufferId) -> Result<(), NodeError> {
        let area = self.0.get();
        if area.status == IoStatus::HaveBuffer {
            return Err(NodeError::InvalidState(format!(
                "io region still holds buffer {:?}",
                area.buffer_id
            )));
        }
        self.0.set(IoArea {
            buffer_id: Some(buffer_id),
            status: IoStatus::HaveBuffer,
        });
        Ok(())
    }

    /// Consumer side: take the published buffer, leaving the slot in
    /// `NeedBuffer`. Returns `None` when nothing was published.
    pub fn take(&self) -> Option<BufferId> {
        let area = self.0.get();
        if area.status != IoStatus::HaveBuffer {
            return None;
        }
        self.0.set(IoArea {
            buffer_id: area.buffer_id,
            status: IoStatus::NeedBuffer,
        });
        area.buffer_id
    }

    pub fn is_same(&self, other: &IoRegion) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Default for IoRegion {
    fn default() -> Self {
        Self::new()
    }
}
