//! Indexed store of chunked byte buffers referenced by RAMS unit ids.

use log::warn;

/// Supplier of fixed-size chunks for unit storage. Injected so the
/// embedder controls chunk memory; freed chunks are handed back for reuse.
pub trait ChunkAllocator: Send {
    fn chunk_size(&self) -> usize;
    fn alloc_chunk(&mut self) -> Option<Vec<u8>>;
    fn free_chunk(&mut self, chunk: Vec<u8>);
}

/// Heap-backed allocator with a small free list.
pub struct HeapChunkAllocator {
    chunk_size: usize,
    free: Vec<Vec<u8>>,
}

impl HeapChunkAllocator {
    pub fn new(chunk_size: usize) -> Self {
        HeapChunkAllocator {
            chunk_size,
            free: Vec::new(),
        }
    }
}

impl ChunkAllocator for HeapChunkAllocator {
    fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn alloc_chunk(&mut self) -> Option<Vec<u8>> {
        Some(
            self.free
                .pop()
                .unwrap_or_else(|| vec![0u8; self.chunk_size]),
        )
    }

    fn free_chunk(&mut self, chunk: Vec<u8>) {
        self.free.push(chunk);
    }
}

/// One unit: an append-only byte buffer stored as fixed-size chunks, with
/// in-place patching at arbitrary byte offsets.
#[derive(Default)]
pub struct RamsUnit {
    chunks: Vec<Vec<u8>>,
    size: usize,
}

impl RamsUnit {
    pub fn clear(&mut self, allocator: &mut dyn ChunkAllocator) {
        for chunk in self.chunks.drain(..) {
            allocator.free_chunk(chunk);
        }
        self.size = 0;
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Append bytes, allocating chunks as needed. Returns false when the
    /// allocator ran out of memory.
    pub fn add_bytes(&mut self, mut data: &[u8], allocator: &mut dyn ChunkAllocator) -> bool {
        let chunk_size = allocator.chunk_size();
        if chunk_size == 0 {
            return false;
        }

        // First fill the remainder of the current last chunk
        let bytes_left = self.chunks.len() * chunk_size - self.size;
        let n = bytes_left.min(data.len());
        if n > 0 {
            if let Some(last) = self.chunks.last_mut() {
                last[chunk_size - bytes_left..chunk_size - bytes_left + n]
                    .copy_from_slice(&data[..n]);
            }
            data = &data[n..];
            self.size += n;
        }

        while !data.is_empty() {
            let mut chunk = match allocator.alloc_chunk() {
                Some(chunk) => chunk,
                None => return false,
            };
            chunk.resize(chunk_size, 0);
            let n = chunk_size.min(data.len());
            chunk[..n].copy_from_slice(&data[..n]);
            self.chunks.push(chunk);
            data = &data[n..];
            self.size += n;
        }

        true
    }

    /// Visit the stored bytes segment by segment, in order.
    pub fn for_each_segment(&self, chunk_size: usize, mut f: impl FnMut(&[u8])) {
        let mut remaining = self.size;
        for chunk in &self.chunks {
            let n = remaining.min(chunk_size);
            f(&chunk[..n]);
            remaining -= n;
            if remaining == 0 {
                break;
            }
        }
    }

    /// Overwrite `patch.len()` bytes at `offset`. A patch may span at most
    /// two chunks; anything beyond that, or out of bounds, is refused.
    pub fn apply_patch(&mut self, offset: usize, patch: &[u8], chunk_size: usize) -> bool {
        if offset + patch.len() > self.size || chunk_size == 0 {
            return false;
        }

        let chunk_index = offset / chunk_size;
        let chunk_offset = offset - chunk_index * chunk_size;
        let n1 = (chunk_offset + patch.len()).min(chunk_size) - chunk_offset;
        let n2 = patch.len() - n1;

        if n2 > chunk_size {
            return false;
        }

        if n1 > 0 {
            self.chunks[chunk_index][chunk_offset..chunk_offset + n1].copy_from_slice(&patch[..n1]);
            if n2 > 0 {
                self.chunks[chunk_index + 1][..n2].copy_from_slice(&patch[n1..]);
            }
        }

        true
    }
}

/// RAMS has 12-bit unit ids.
pub const MAX_UNIT_COUNT: usize = 1 << 12;

/// Fixed 4096-slot unit table with a recycling pool.
///
/// Freed units return to the pool to avoid allocation churn; a full
/// cleanup happens only when the allocator is replaced.
pub struct RamsUnitStore {
    allocator: Box<dyn ChunkAllocator>,
    units: Vec<Option<RamsUnit>>,
    pool: Vec<RamsUnit>,
}

impl RamsUnitStore {
    pub fn new(allocator: Box<dyn ChunkAllocator>) -> Self {
        let mut units = Vec::with_capacity(MAX_UNIT_COUNT);
        units.resize_with(MAX_UNIT_COUNT, || None);
        RamsUnitStore {
            allocator,
            units,
            pool: Vec::new(),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.allocator.chunk_size()
    }

    /// Replace the allocator; frees all chunks held by units and the pool.
    pub fn register_chunk_allocator(&mut self, allocator: Box<dyn ChunkAllocator>) {
        self.reset();
        self.pool.clear();
        self.allocator = allocator;
    }

    /// Clear all units in use and return them to the pool.
    pub fn reset(&mut self) {
        for slot in self.units.iter_mut() {
            if let Some(mut unit) = slot.take() {
                unit.clear(self.allocator.as_mut());
                self.pool.push(unit);
            }
        }
    }

    pub fn unit(&self, unit_id: usize) -> Option<&RamsUnit> {
        self.units.get(unit_id)?.as_ref()
    }

    /// Append bytes to the unit, creating it if needed.
    pub fn add_bytes(&mut self, unit_id: usize, data: &[u8]) -> bool {
        if unit_id >= MAX_UNIT_COUNT {
            return false;
        }
        let unit = self.units[unit_id].get_or_insert_with(|| self.pool.pop().unwrap_or_default());
        if !unit.add_bytes(data, self.allocator.as_mut()) {
            warn!("Unable to grow RAMS unit {}", unit_id);
            return false;
        }
        true
    }

    pub fn apply_patch(&mut self, unit_id: usize, offset: usize, patch: &[u8]) -> bool {
        let chunk_size = self.allocator.chunk_size();
        match self.units.get_mut(unit_id).and_then(Option::as_mut) {
            Some(unit) => unit.apply_patch(offset, patch, chunk_size),
            None => false,
        }
    }

    pub fn delete_unit(&mut self, unit_id: usize) {
        if unit_id >= MAX_UNIT_COUNT {
            return;
        }
        if let Some(mut unit) = self.units[unit_id].take() {
            unit.clear(self.allocator.as_mut());
            self.pool.push(unit);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> RamsUnitStore {
        RamsUnitStore::new(Box::new(HeapChunkAllocator::new(16)))
    }

    fn unit_bytes(store: &RamsUnitStore, unit_id: usize) -> Vec<u8> {
        let mut out = Vec::new();
        if let Some(unit) = store.unit(unit_id) {
            unit.for_each_segment(store.chunk_size(), |segment| out.extend_from_slice(segment));
        }
        out
    }

    #[test]
    fn bytes_span_chunks() {
        let mut store = store();
        let data: Vec<u8> = (0..40).collect();
        assert!(store.add_bytes(7, &data[..10]));
        assert!(store.add_bytes(7, &data[10..]));
        assert_eq!(unit_bytes(&store, 7), data);
        assert_eq!(store.unit(7).unwrap().size(), 40);
    }

    #[test]
    fn delete_recycles_unit() {
        let mut store = store();
        store.add_bytes(1, &[1, 2, 3]);
        store.delete_unit(1);
        assert!(store.unit(1).is_none());
        // Recycled unit starts empty
        store.add_bytes(1, &[9]);
        assert_eq!(unit_bytes(&store, 1), vec![9]);
    }

    #[test]
    fn out_of_range_unit_id_is_refused() {
        let mut store = store();
        assert!(!store.add_bytes(MAX_UNIT_COUNT, &[1]));
        store.delete_unit(MAX_UNIT_COUNT); // Harmless
    }

    #[test]
    fn patch_within_and_across_chunks() {
        let mut store = store();
        let data = vec![0u8; 32];
        store.add_bytes(3, &data);

        assert!(store.apply_patch(3, 4, &[0xAA, 0xBB]));
        // Across the chunk boundary at 16
        assert!(store.apply_patch(3, 14, &[1, 2, 3, 4]));
        let bytes = unit_bytes(&store, 3);
        assert_eq!(&bytes[4..6], &[0xAA, 0xBB]);
        assert_eq!(&bytes[14..18], &[1, 2, 3, 4]);

        // Out of bounds is refused
        assert!(!store.apply_patch(3, 31, &[1, 2]));
    }

    #[test]
    fn reset_clears_everything() {
        let mut store = store();
        store.add_bytes(0, &[1]);
        store.add_bytes(4095, &[2]);
        store.reset();
        assert!(store.unit(0).is_none());
        assert!(store.unit(4095).is_none());
    }
}
