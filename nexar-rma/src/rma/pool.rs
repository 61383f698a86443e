use super::request::RmaRequest;
use crate::error::{Result, RmaError};

/// Handle to an in-flight request. The generation changes every time a slot
/// is reused, so ids of released requests never alias new ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId {
    index: u32,
    generation: u32,
}

impl RequestId {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "req#{}.{}", self.index, self.generation)
    }
}

struct Slot {
    generation: u32,
    request: Option<RmaRequest>,
}

/// Fixed-capacity slab of requests.
pub(crate) struct RequestPool {
    slots: Vec<Slot>,
    free: Vec<u32>,
    capacity: usize,
    live: usize,
}

impl RequestPool {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            capacity,
            live: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.live
    }

    pub(crate) fn insert(&mut self, request: RmaRequest) -> Result<RequestId> {
        if self.live >= self.capacity {
            return Err(RmaError::NoMemory {
                what: "request pool",
            });
        }
        let index = match self.free.pop() {
            Some(i) => i,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    request: None,
                });
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        slot.request = Some(request);
        self.live += 1;
        Ok(RequestId::new(index, slot.generation))
    }

    pub(crate) fn get(&self, id: RequestId) -> Option<&RmaRequest> {
        self.slots
            .get(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.request.as_ref())
    }

    pub(crate) fn get_mut(&mut self, id: RequestId) -> Option<&mut RmaRequest> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.request.as_mut())
    }

    pub(crate) fn remove(&mut self, id: RequestId) -> Option<RmaRequest> {
        let slot = self
            .slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation)?;
        let request = slot.request.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.live -= 1;
        Some(request)
    }
}
