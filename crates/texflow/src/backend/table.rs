use std::fmt;

use crate::device::TextureId;
use crate::dtype::{DType, TensorData};
use crate::error::{BackendError, BackendResult};
use crate::layout::{size_from_shape, PackingKind, TextureShape};

/// Generation-checked handle to a tensor's storage record.
///
/// `generation` changes every time the slot is reused and `epoch` every time
/// the backend is disposed, so stale handles are detected rather than aliased.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DataId {
    index: u32,
    generation: u32,
    epoch: u32,
}

impl fmt::Display for DataId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "data#{}.{}@{}", self.index, self.generation, self.epoch)
    }
}

/// Everything the backend knows about one tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageRecord {
    pub shape: Vec<usize>,
    pub dtype: DType,
    /// Host copy; authoritative when `texture` is `None`.
    pub values: Option<TensorData>,
    pub texture: Option<TextureId>,
    pub texture_shape: Option<TextureShape>,
    pub packing: PackingKind,
}

impl StorageRecord {
    fn new(shape: Vec<usize>, dtype: DType) -> Self {
        Self {
            shape,
            dtype,
            values: None,
            texture: None,
            texture_shape: None,
            packing: PackingKind::Float,
        }
    }

    pub fn size(&self) -> usize {
        size_from_shape(&self.shape)
    }

    pub fn is_initialized(&self) -> bool {
        self.values.is_some() || self.texture.is_some()
    }
}

enum SlotState {
    Vacant,
    /// Handed out by `new_id` but not registered yet.
    Reserved,
    Occupied(StorageRecord),
}

struct Slot {
    generation: u32,
    state: SlotState,
}

/// Arena mapping data handles to storage records.
pub(crate) struct ResourceTable {
    epoch: u32,
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl ResourceTable {
    pub(crate) fn new() -> Self {
        Self {
            epoch: 0,
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }

    pub(crate) fn epoch(&self) -> u32 {
        self.epoch
    }

    pub(crate) fn len(&self) -> usize {
        self.live
    }

    pub(crate) fn new_id(&mut self) -> DataId {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    state: SlotState::Vacant,
                });
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        slot.state = SlotState::Reserved;
        DataId {
            index,
            generation: slot.generation,
            epoch: self.epoch,
        }
    }

    fn slot(&self, id: DataId) -> BackendResult<&Slot> {
        if id.epoch != self.epoch {
            return Err(BackendError::BackendDisposed { handle: Some(id) });
        }
        match self.slots.get(id.index as usize) {
            Some(slot) if slot.generation == id.generation => Ok(slot),
            _ => Err(BackendError::UnregisteredHandle { handle: id }),
        }
    }

    fn slot_mut(&mut self, id: DataId) -> BackendResult<&mut Slot> {
        if id.epoch != self.epoch {
            return Err(BackendError::BackendDisposed { handle: Some(id) });
        }
        match self.slots.get_mut(id.index as usize) {
            Some(slot) if slot.generation == id.generation => Ok(slot),
            _ => Err(BackendError::UnregisteredHandle { handle: id }),
        }
    }

    pub(crate) fn register(
        &mut self,
        id: DataId,
        shape: &[usize],
        dtype: DType,
    ) -> BackendResult<()> {
        let slot = self.slot_mut(id)?;
        match slot.state {
            SlotState::Occupied(_) => Err(BackendError::DuplicateRegistration { handle: id }),
            SlotState::Vacant => Err(BackendError::UnregisteredHandle { handle: id }),
            SlotState::Reserved => {
                slot.state = SlotState::Occupied(StorageRecord::new(shape.to_vec(), dtype));
                self.live += 1;
                Ok(())
            }
        }
    }

    pub(crate) fn get(&self, id: DataId) -> BackendResult<&StorageRecord> {
        match &self.slot(id)?.state {
            SlotState::Occupied(record) => Ok(record),
            _ => Err(BackendError::UnregisteredHandle { handle: id }),
        }
    }

    pub(crate) fn get_mut(&mut self, id: DataId) -> BackendResult<&mut StorageRecord> {
        match &mut self.slot_mut(id)?.state {
            SlotState::Occupied(record) => Ok(record),
            _ => Err(BackendError::UnregisteredHandle { handle: id }),
        }
    }

    /// Removes the record and retires the handle's generation.
    pub(crate) fn remove(&mut self, id: DataId) -> BackendResult<StorageRecord> {
        let slot = self.slot_mut(id)?;
        if !matches!(slot.state, SlotState::Occupied(_)) {
            return Err(BackendError::UnregisteredHandle { handle: id });
        }
        let SlotState::Occupied(record) = std::mem::replace(&mut slot.state, SlotState::Vacant)
        else {
            return Err(BackendError::UnregisteredHandle { handle: id });
        };
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.live -= 1;
        Ok(record)
    }

    /// Drops every record and invalidates all outstanding handles.
    pub(crate) fn clear(&mut self) -> Vec<StorageRecord> {
        let records = self
            .slots
            .drain(..)
            .filter_map(|slot| match slot.state {
                SlotState::Occupied(record) => Some(record),
                _ => None,
            })
            .collect();
        self.free.clear();
        self.live = 0;
        self.epoch = self.epoch.wrapping_add(1);
        records
    }
}
