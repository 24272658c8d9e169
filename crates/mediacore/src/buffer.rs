//! Pre-allocated buffer pools.
//!
//! Buffers are allocated while a link is being configured and are never
//! reallocated during processing. Once a pool is shared between the two
//! ports of a link (as `Rc<BufferPool>`) it can no longer grow; buffers are
//! then referred to by id only, and which side may write a buffer is decided
//! by the status of the link's IO region.

use crate::NodeError;
use std::cell::{Cell, Ref, RefCell, RefMut};
use std::sync::atomic::{AtomicU64, Ordering};

pub type BufferId = u32;

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// Valid region of a buffer's memory block
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Chunk {
    pub offset: u32,
    pub size: u32,
    pub stride: i32,
}

/// Header meta record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetaHeader {
    pub flags: u32,
    pub seq: u32,
    pub pts: i64,
    pub dts_offset: i64,
}

#[derive(Debug)]
pub struct Buffer {
    id: BufferId,
    data: RefCell<Box<[u8]>>,
    chunk: Cell<Chunk>,
    header: Cell<Option<MetaHeader>>,
}

impl Buffer {
    fn new(id: BufferId, capacity: usize, with_header: bool) -> Self {
        Self {
            id,
            data: RefCell::new(vec![0u8; capacity].into_boxed_slice()),
            chunk: Cell::new(Chunk {
                offset: 0,
                size: capacity as u32,
                stride: 0,
            }),
            header: Cell::new(with_header.then(MetaHeader::default)),
        }
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.data.borrow().len()
    }

    pub fn chunk(&self) -> Chunk {
        self.chunk.get()
    }

    pub fn set_chunk(&self, chunk: Chunk) {
        self.chunk.set(chunk);
    }

    pub fn header(&self) -> Option<MetaHeader> {
        self.header.get()
    }

    /// Updates the header meta; a no-op for buffers allocated without one.
    pub fn set_header(&self, header: MetaHeader) {
        if self.header.get().is_some() {
            self.header.set(Some(header));
        }
    }
}

/// Read-only view returned by [`BufferPool::describe`]
pub struct BufferView<'a> {
    pub data: Ref<'a, [u8]>,
    pub chunk: Chunk,
    pub header: Option<MetaHeader>,
}

impl BufferView<'_> {
    /// The bytes covered by the chunk
    pub fn valid(&self) -> &[u8] {
        let start = (self.chunk.offset as usize).min(self.data.len());
        let end = start.saturating_add(self.chunk.size as usize).min(self.data.len());
        &self.data[start..end]
    }
}

/// Identifies a buffer together with the pool instance it came from, so a
/// late return can be recognised once the pool has been replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferTag {
    pub generation: u64,
    pub id: BufferId,
}

#[derive(Debug)]
pub struct BufferPool {
    generation: u64,
    buffers: Vec<Buffer>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            generation: NEXT_GENERATION.fetch_add(1, Ordering::Relaxed),
            buffers: Vec::new(),
        }
    }

    /// Pool of `count` buffers of `capacity` bytes, each with a header meta.
    pub fn with_buffers(count: usize, capacity: usize) -> Self {
        let mut pool = Self::new();
        for _ in 0..count {
            pool.allocate(capacity);
        }
        pool
    }

    pub fn allocate(&mut self, capacity: usize) -> BufferId {
        let id = self.buffers.len() as BufferId;
        self.buffers.push(Buffer::new(id, capacity, true));
        id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = BufferId> + '_ {
        self.buffers.iter().map(Buffer::id)
    }

    pub fn get(&self, id: BufferId) -> Result<&Buffer, NodeError> {
        self.buffers.get(id as usize).ok_or(NodeError::NoBuffers)
    }

    pub fn describe(&self, id: BufferId) -> Result<BufferView<'_>, NodeError> {
        let buffer = self.get(id)?;
        let data = buffer
            .data
            .try_borrow()
            .map_err(|_| NodeError::InvalidState(format!("buffer {} is being written", id)))?;
        Ok(BufferView {
            data: Ref::map(data, |d| &**d),
            chunk: buffer.chunk(),
            header: buffer.header(),
        })
    }

    /// Write access to a buffer's memory block.
    pub fn write(&self, id: BufferId) -> Result<RefMut<'_, [u8]>, NodeError> {
        let buffer = self.get(id)?;
        let data = buffer
            .data
            .try_borrow_mut()
            .map_err(|_| NodeError::InvalidState(format!("buffer {} is already borrowed", id)))?;
        Ok(RefMut::map(data, |d| &mut **d))
    }

    pub fn tag(&self, id: BufferId) -> BufferTag {
        BufferTag {
            generation: self.generation,
            id,
        }
    }

    pub fn owns(&self, tag: BufferTag) -> bool {
        tag.generation == self.generation && (tag.id as usize) < self.buffers.len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}
