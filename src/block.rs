use std::{mem, ptr::NonNull};

/// Header size of a block. Every block, free or allocated, occupies this many
/// bytes in its page right before its payload. The bytes hold a [`BlockStamp`].
pub const BLOCK_HEADER_SIZE: usize = mem::size_of::<BlockStamp>();

/// Marker written at the start of every block header.
const BLOCK_MAGIC: u32 = 0xB10C_A110;

/// Index of an entry in the [`BlockTable`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct SlotId(pub u32);

impl SlotId {
    #[inline]
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// Generation a slot starts at. Zero is never handed out.
const FIRST_GENERATION: u32 = 1;

/// Handle to an allocated block.
///
/// A handle stays valid until the block is deallocated (explicitly or by
/// releasing its last reference). After that every operation taking the handle
/// reports [`crate::AllocError::StaleHandle`], even if the slot has been reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlockHandle {
    pub(crate) slot: u32,
    pub(crate) generation: u32,
}

impl BlockHandle {
    /// Slot index in the block table.
    #[inline]
    pub fn slot(&self) -> u32 {
        self.slot
    }

    /// Generation the slot had when the block was allocated.
    #[inline]
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

/// This is the layout of a block inside a page. Metadata lives in the
/// [`BlockTable`]; the header footprint in the page carries a stamp which
/// mirrors it so corruption of the page can be detected.
///
/// ```text
/// +---------------------+ <------+
/// |        magic        |        |
/// +---------------------+        |
/// |        slot         |        | -> Header (BlockStamp)
/// +---------------------+        |
/// |     generation      |        |
/// +---------------------+        |
/// |        size         |        |
/// +---------------------+ <------+
/// |  adjustment (pad)   |        |
/// +---------------------+        |
/// |       Content       |        | -> Payload (`size` bytes)
/// |         ...         |        |
/// +---------------------+ <------+
/// ```
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct BlockStamp {
    magic: u32,
    slot: u32,
    generation: u32,
    size: u32,
}

impl BlockStamp {
    fn of(id: SlotId, slot: &BlockSlot) -> Self {
        Self {
            magic: BLOCK_MAGIC,
            slot: id.0,
            generation: slot.generation,
            size: slot.size as u32,
        }
    }

    /// Writes the stamp of `slot` at `header`.
    ///
    /// # Safety
    ///
    /// `header` must point to `BLOCK_HEADER_SIZE` writable, word aligned bytes.
    pub unsafe fn write(header: NonNull<u8>, id: SlotId, slot: &BlockSlot) {
        unsafe { header.cast::<Self>().write(Self::of(id, slot)) }
    }

    /// Checks the stamp at `header` against the bookkeeping of `slot`.
    ///
    /// # Safety
    ///
    /// `header` must point to `BLOCK_HEADER_SIZE` readable, word aligned bytes.
    pub unsafe fn matches(header: NonNull<u8>, id: SlotId, slot: &BlockSlot) -> bool {
        unsafe { header.cast::<Self>().read() == Self::of(id, slot) }
    }
}

/// State of a block. A block is either linked in its page's free list or
/// handed out to a caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BlockState {
    /// Slot holds no block. `next` chains the vacant slots.
    Vacant { next: Option<SlotId> },
    /// Block sits in its page's free list.
    Free { next: Option<SlotId> },
    /// Block belongs to a caller.
    Allocated {
        ref_count: u32,
        /// Bytes between the end of the header and the aligned payload.
        adjustment: u8,
        /// Alignment requested at allocation time.
        alignment: u8,
        /// Size requested at allocation time.
        requested: usize,
    },
}

/// Metadata of one block.
#[derive(Clone, Copy, Debug)]
pub(crate) struct BlockSlot {
    pub generation: u32,
    /// Page the block lives in.
    pub page: usize,
    /// Offset of the block header from the page base.
    pub offset: usize,
    /// Payload size, header excluded.
    pub size: usize,
    pub state: BlockState,
}

impl BlockSlot {
    /// Offset of the first byte following this block.
    #[inline]
    pub fn end(&self) -> usize {
        self.offset + BLOCK_HEADER_SIZE + self.size
    }

    #[inline]
    pub fn is_free(&self) -> bool {
        matches!(self.state, BlockState::Free { .. })
    }

    #[inline]
    pub fn is_allocated(&self) -> bool {
        matches!(self.state, BlockState::Allocated { .. })
    }

    /// Next block in the free list. None for blocks that are not free.
    #[inline]
    pub fn next_free(&self) -> Option<SlotId> {
        match self.state {
            BlockState::Free { next } => next,
            _ => None,
        }
    }
}

/// Array backed table holding the metadata of every block of every page.
///
/// Slots of merged blocks are recycled through an intrusive vacant list, and
/// each slot carries a generation which is bumped whenever an allocation
/// ends, so handles to released blocks can be told apart from live ones.
#[derive(Default)]
pub(crate) struct BlockTable {
    slots: Vec<BlockSlot>,
    vacant: Option<SlotId>,
    live: usize,
}

impl BlockTable {
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            vacant: None,
            live: 0,
        }
    }

    /// Number of slots currently describing a block.
    #[inline]
    pub fn live(&self) -> usize {
        self.live
    }

    /// Stores a free block and returns its slot.
    pub fn insert_free(&mut self, page: usize, offset: usize, size: usize) -> SlotId {
        self.live += 1;
        let state = BlockState::Free { next: None };

        if let Some(id) = self.vacant {
            let slot = &mut self.slots[id.index()];
            self.vacant = match slot.state {
                BlockState::Vacant { next } => next,
                _ => None,
            };
            slot.page = page;
            slot.offset = offset;
            slot.size = size;
            slot.state = state;
            return id;
        }

        let id = SlotId(self.slots.len() as u32);
        self.slots.push(BlockSlot {
            generation: FIRST_GENERATION,
            page,
            offset,
            size,
            state,
        });
        id
    }

    /// Drops the block described by `id` and recycles the slot.
    pub fn retire(&mut self, id: SlotId) {
        self.live -= 1;
        let vacant = self.vacant;
        let slot = &mut self.slots[id.index()];
        slot.generation = next_generation(slot.generation);
        slot.state = BlockState::Vacant { next: vacant };
        self.vacant = Some(id);
    }

    /// Turns every slot vacant, invalidating every outstanding handle.
    pub fn retire_all(&mut self) {
        self.vacant = None;
        self.live = 0;

        for index in (0..self.slots.len()).rev() {
            let slot = &mut self.slots[index];
            slot.generation = next_generation(slot.generation);
            slot.state = BlockState::Vacant { next: self.vacant };
            self.vacant = Some(SlotId(index as u32));
        }
    }

    /// Ends the allocation held in `id`: the slot becomes a free block with a
    /// new generation.
    pub fn mark_free(&mut self, id: SlotId) {
        let slot = &mut self.slots[id.index()];
        slot.generation = next_generation(slot.generation);
        slot.state = BlockState::Free { next: None };
    }

    #[inline]
    pub fn get(&self, id: SlotId) -> &BlockSlot {
        &self.slots[id.index()]
    }

    #[inline]
    pub fn get_mut(&mut self, id: SlotId) -> &mut BlockSlot {
        &mut self.slots[id.index()]
    }

    /// Resolves a handle to the slot of a live allocation.
    pub fn resolve(&self, handle: BlockHandle) -> Option<SlotId> {
        let slot = self.slots.get(handle.slot as usize)?;

        (slot.generation == handle.generation && slot.is_allocated()).then_some(SlotId(handle.slot))
    }

    /// Handle naming the allocation currently held in `id`.
    #[inline]
    pub fn handle(&self, id: SlotId) -> BlockHandle {
        BlockHandle {
            slot: id.0,
            generation: self.get(id).generation,
        }
    }

    #[inline]
    pub fn set_next_free(&mut self, id: SlotId, next: Option<SlotId>) {
        self.get_mut(id).state = BlockState::Free { next };
    }

    #[inline]
    pub fn next_free(&self, id: SlotId) -> Option<SlotId> {
        self.get(id).next_free()
    }

    /// Every slot describing a block, with its id.
    pub fn blocks(&self) -> impl Iterator<Item = (SlotId, &BlockSlot)> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| !matches!(slot.state, BlockState::Vacant { .. }))
            .map(|(index, slot)| (SlotId(index as u32), slot))
    }
}

#[inline]
fn next_generation(generation: u32) -> u32 {
    match generation.wrapping_add(1) {
        0 => FIRST_GENERATION,
        next => next,
    }
}
