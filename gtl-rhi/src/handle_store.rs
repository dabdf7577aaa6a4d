//! Generational handle store and the chunked resource slab built on top.
//!
//! Handles are `(version << 32) | slot_index`. A slot's version counter is
//! bumped on free, so stale handles fail validation forever after. Slots are
//! recycled LIFO and the slab grows in fixed-size chunks that never move.

/// Reserved null handle; always invalid (slot 0 only validates with a
/// non-zero version, and versions start at 1).
pub const NULL_HANDLE: u64 = 0;

/// Version counters plus a LIFO free list of recycled slot indices.
#[derive(Default)]
pub struct HandleStore {
    max_index: u32,
    versions: Vec<u32>,
    free_indices: Vec<u32>,
}

impl HandleStore {
    pub fn new() -> Self {
        Self {
            max_index: 0,
            versions: Vec::with_capacity(8),
            free_indices: Vec::with_capacity(8),
        }
    }

    pub fn create_handle(&mut self) -> u64 {
        assert!(self.max_index < u32::MAX);

        let (index, version) = if let Some(index) = self.free_indices.pop() {
            (index, self.versions[index as usize])
        } else {
            let index = self.max_index;
            self.max_index += 1;

            if index as usize >= self.versions.capacity() {
                let capacity = (index + 1).next_power_of_two() as usize;
                self.versions.reserve(capacity - self.versions.len());
            }
            self.versions.push(1);

            (index, 1)
        };

        (u64::from(version) << 32) | u64::from(index)
    }

    pub fn is_valid(&self, handle: u64) -> bool {
        let version = (handle >> 32) as u32;
        let index = handle as u32;

        if index >= self.max_index {
            return false;
        }

        self.versions[index as usize] == version
    }

    pub fn free_handle(&mut self, handle: u64) {
        let index = Self::index(handle);
        self.versions[index as usize] += 1;
        self.free_indices.push(index);
    }

    pub fn index(handle: u64) -> u32 {
        handle as u32
    }
}

/// A handle store paired with slot storage. Chunks have a fixed capacity and
/// are never reallocated, so records keep their address for the store's
/// lifetime; lookup re-borrows through the table on every call.
pub struct ResourceStore<T> {
    handles: HandleStore,
    chunk_capacity: usize,
    chunks: Vec<Box<[Option<T>]>>,
}

impl<T> ResourceStore<T> {
    /// `chunk_capacity` is rounded up to a power of two.
    pub fn new(chunk_capacity: usize) -> Self {
        assert!(chunk_capacity > 0);
        Self {
            handles: HandleStore::new(),
            chunk_capacity: chunk_capacity.next_power_of_two(),
            chunks: Vec::new(),
        }
    }

    pub fn allocate(&mut self) -> u64 {
        let handle = self.handles.create_handle();

        let index = HandleStore::index(handle) as usize;
        let chunk = index / self.chunk_capacity;
        while self.chunks.len() <= chunk {
            let mut slots = Vec::with_capacity(self.chunk_capacity);
            slots.resize_with(self.chunk_capacity, || None);
            self.chunks.push(slots.into_boxed_slice());
        }

        handle
    }

    /// Places a record into a freshly allocated slot.
    pub fn insert(&mut self, handle: u64, value: T) {
        let index = HandleStore::index(handle) as usize;
        self.chunks[index / self.chunk_capacity][index % self.chunk_capacity] = Some(value);
    }

    pub fn get(&self, handle: u64) -> Option<&T> {
        if !self.handles.is_valid(handle) {
            return None;
        }
        let index = HandleStore::index(handle) as usize;
        self.chunks[index / self.chunk_capacity][index % self.chunk_capacity].as_ref()
    }

    pub fn get_mut(&mut self, handle: u64) -> Option<&mut T> {
        if !self.handles.is_valid(handle) {
            return None;
        }
        let index = HandleStore::index(handle) as usize;
        self.chunks[index / self.chunk_capacity][index % self.chunk_capacity].as_mut()
    }

    /// Removes the record and retires the handle. Returns the record so the
    /// caller can release backend objects.
    pub fn free(&mut self, handle: u64) -> Option<T> {
        if !self.handles.is_valid(handle) {
            return None;
        }
        let index = HandleStore::index(handle) as usize;
        let value = self.chunks[index / self.chunk_capacity][index % self.chunk_capacity].take();
        self.handles.free_handle(handle);
        value
    }

    /// Drains every live record, e.g. for context teardown.
    pub fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        self.chunks
            .iter_mut()
            .flat_map(|chunk| chunk.iter_mut())
            .filter_map(|slot| slot.take())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_encoding() {
        let mut store = HandleStore::new();
        let h = store.create_handle();
        assert_eq!(h >> 32, 1);
        assert_eq!(h as u32, 0);
        assert!(store.is_valid(h));
    }

    #[test]
    fn null_handle_is_invalid() {
        let store = HandleStore::new();
        assert!(!store.is_valid(NULL_HANDLE));
    }

    #[test]
    fn stale_handle_fails_validation() {
        let mut store = HandleStore::new();
        let h = store.create_handle();
        store.free_handle(h);
        assert!(!store.is_valid(h));
    }

    #[test]
    fn reuse_bumps_version() {
        let mut store = HandleStore::new();
        let h1 = store.create_handle();
        store.free_handle(h1);
        let h2 = store.create_handle();

        assert_eq!(HandleStore::index(h1), HandleStore::index(h2));
        assert_eq!((h2 >> 32) as u32, (h1 >> 32) as u32 + 1);
        assert!(!store.is_valid(h1));
        assert!(store.is_valid(h2));
    }

    #[test]
    fn out_of_range_index_is_invalid() {
        let mut store = HandleStore::new();
        let _ = store.create_handle();
        let forged = (1u64 << 32) | 57;
        assert!(!store.is_valid(forged));
    }

    #[test]
    fn free_list_is_lifo() {
        let mut store = HandleStore::new();
        let a = store.create_handle();
        let b = store.create_handle();
        store.free_handle(a);
        store.free_handle(b);
        let c = store.create_handle();
        assert_eq!(HandleStore::index(c), HandleStore::index(b));
    }

    #[test]
    fn resource_store_roundtrip() {
        let mut store: ResourceStore<String> = ResourceStore::new(2);
        let h = store.allocate();
        store.insert(h, "hello".to_string());
        assert_eq!(store.get(h).unwrap(), "hello");

        store.get_mut(h).unwrap().push('!');
        assert_eq!(store.get(h).unwrap(), "hello!");

        let value = store.free(h).unwrap();
        assert_eq!(value, "hello!");
        assert!(store.get(h).is_none());
    }

    #[test]
    fn resource_store_grows_in_chunks() {
        let mut store: ResourceStore<u32> = ResourceStore::new(2);
        let handles: Vec<u64> = (0..9).map(|i| {
            let h = store.allocate();
            store.insert(h, i);
            h
        }).collect();

        for (i, h) in handles.iter().enumerate() {
            assert_eq!(*store.get(*h).unwrap(), i as u32);
        }
    }
}
