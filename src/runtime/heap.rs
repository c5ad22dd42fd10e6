//! The heap-allocation registry. Allocations live in a generational
//! arena; the 64-bit stack cell referencing one packs the arena index
//! into the low half and a generation counter into the high half, so a
//! stale handle (freed, or fabricated by a buggy module) is detected
//! instead of aliasing fresh memory. Frame-scoped entries are tagged
//! with the frame pointer that created them and are swept automatically
//! when that frame returns.

use crate::runtime::fault::Fault;

/// Struct id recorded for raw array allocations.
pub const ARRAY_STRUCT_ID: u32 = u32::MAX;

/// Bytes per heap cell, reported by the allocation dump.
pub const CELL_BYTES: usize = 8;

#[derive(Debug)]
struct HeapEntry {
    cells: Vec<i64>,
    struct_id: u32,
    generation: u32,
    frame_scoped: bool,
    owner_fp: usize,
    live: bool,
}

/// A live-allocation record, as reported by the diagnostic dump.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveAlloc {
    pub handle: i64,
    pub size_bytes: usize,
    pub struct_id: u32,
    pub frame_scoped: bool,
}

#[derive(Debug, Default)]
pub struct Heap {
    entries: Vec<HeapEntry>,
    free: Vec<usize>,
}

fn pack(index: usize, generation: u32) -> i64 {
    ((generation as i64) << 32) | index as i64
}

fn unpack(handle: i64) -> (usize, u32) {
    ((handle & 0xFFFF_FFFF) as usize, (handle >> 32) as u32)
}

impl Heap {
    pub fn new() -> Self {
        Heap::default()
    }

    /// Allocate zero-initialized storage and register it. Returns the
    /// handle to push on the operand stack.
    pub fn alloc(&mut self, slots: usize, struct_id: u32, frame_scoped: bool, owner_fp: usize) -> i64 {
        if let Some(index) = self.free.pop() {
            let entry = &mut self.entries[index];
            entry.cells.clear();
            entry.cells.resize(slots, 0);
            entry.struct_id = struct_id;
            entry.frame_scoped = frame_scoped;
            entry.owner_fp = owner_fp;
            entry.live = true;
            return pack(index, entry.generation);
        }
        let index = self.entries.len();
        self.entries.push(HeapEntry {
            cells: vec![0; slots],
            struct_id,
            // generation 1 keeps every valid handle nonzero
            generation: 1,
            frame_scoped,
            owner_fp,
            live: true,
        });
        pack(index, 1)
    }

    fn entry(&self, handle: i64) -> Result<&HeapEntry, Fault> {
        let (index, generation) = unpack(handle);
        match self.entries.get(index) {
            Some(e) if e.live && e.generation == generation => Ok(e),
            _ => Err(Fault::BadHandle),
        }
    }

    fn entry_mut(&mut self, handle: i64) -> Result<&mut HeapEntry, Fault> {
        let (index, generation) = unpack(handle);
        match self.entries.get_mut(index) {
            Some(e) if e.live && e.generation == generation => Ok(e),
            _ => Err(Fault::BadHandle),
        }
    }

    pub fn read(&self, handle: i64, index: i64) -> Result<i64, Fault> {
        let entry = self.entry(handle)?;
        let len = entry.cells.len();
        if index < 0 || index as usize >= len {
            return Err(Fault::IndexOutOfBounds { index, len });
        }
        Ok(entry.cells[index as usize])
    }

    pub fn write(&mut self, handle: i64, index: i64, value: i64) -> Result<(), Fault> {
        let entry = self.entry_mut(handle)?;
        let len = entry.cells.len();
        if index < 0 || index as usize >= len {
            return Err(Fault::IndexOutOfBounds { index, len });
        }
        entry.cells[index as usize] = value;
        Ok(())
    }

    /// Release an allocation immediately (the `free` statement).
    pub fn free(&mut self, handle: i64) -> Result<(), Fault> {
        let entry = self.entry_mut(handle)?;
        entry.live = false;
        entry.generation = entry.generation.wrapping_add(1);
        entry.cells = Vec::new();
        let (index, _) = unpack(handle);
        self.free.push(index);
        Ok(())
    }

    /// Sweep every frame-scoped allocation owned by a frame at or above
    /// `fp`. Called on return, whether or not the program freed them.
    pub fn release_frame(&mut self, fp: usize) {
        for index in 0..self.entries.len() {
            let entry = &mut self.entries[index];
            if entry.live && entry.frame_scoped && entry.owner_fp >= fp {
                entry.live = false;
                entry.generation = entry.generation.wrapping_add(1);
                entry.cells = Vec::new();
                self.free.push(index);
            }
        }
    }

    pub fn live_count(&self) -> usize {
        self.entries.iter().filter(|e| e.live).count()
    }

    /// Snapshot of all live allocations, oldest first.
    pub fn live_allocations(&self) -> Vec<LiveAlloc> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.live)
            .map(|(index, e)| LiveAlloc {
                handle: pack(index, e.generation),
                size_bytes: e.cells.len() * CELL_BYTES,
                struct_id: e.struct_id,
                frame_scoped: e.frame_scoped,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_is_zeroed_and_readable() {
        let mut heap = Heap::new();
        let h = heap.alloc(3, 0, false, 0);
        assert_eq!(heap.read(h, 0).unwrap(), 0);
        assert_eq!(heap.read(h, 2).unwrap(), 0);
    }

    #[test]
    fn test_write_then_read() {
        let mut heap = Heap::new();
        let h = heap.alloc(2, 0, false, 0);
        heap.write(h, 1, 42).unwrap();
        assert_eq!(heap.read(h, 1).unwrap(), 42);
        assert_eq!(heap.read(h, 0).unwrap(), 0);
    }

    #[test]
    fn test_out_of_bounds_is_a_fault() {
        let mut heap = Heap::new();
        let h = heap.alloc(2, 0, false, 0);
        assert!(matches!(
            heap.read(h, 2),
            Err(Fault::IndexOutOfBounds { .. })
        ));
        assert!(matches!(
            heap.write(h, -1, 0),
            Err(Fault::IndexOutOfBounds { .. })
        ));
    }

    #[test]
    fn test_stale_handle_detected_after_free() {
        let mut heap = Heap::new();
        let h = heap.alloc(1, 0, false, 0);
        heap.free(h).unwrap();
        assert_eq!(heap.read(h, 0), Err(Fault::BadHandle));
        assert_eq!(heap.free(h), Err(Fault::BadHandle));
    }

    #[test]
    fn test_reused_slot_gets_fresh_generation() {
        let mut heap = Heap::new();
        let old = heap.alloc(1, 0, false, 0);
        heap.free(old).unwrap();
        let fresh = heap.alloc(1, 0, false, 0);
        assert_ne!(old, fresh);
        assert!(heap.read(fresh, 0).is_ok());
        assert_eq!(heap.read(old, 0), Err(Fault::BadHandle));
    }

    #[test]
    fn test_fabricated_handle_is_rejected() {
        let heap = Heap::new();
        assert_eq!(heap.read(0xDEAD, 0), Err(Fault::BadHandle));
        assert_eq!(heap.read(0, 0), Err(Fault::BadHandle));
    }

    #[test]
    fn test_release_frame_sweeps_only_frame_scoped() {
        let mut heap = Heap::new();
        let durable = heap.alloc(1, 0, false, 10);
        let scoped_inner = heap.alloc(1, 0, true, 10);
        let scoped_outer = heap.alloc(1, 0, true, 2);

        heap.release_frame(10);
        assert!(heap.read(durable, 0).is_ok());
        assert_eq!(heap.read(scoped_inner, 0), Err(Fault::BadHandle));
        assert!(heap.read(scoped_outer, 0).is_ok());
        assert_eq!(heap.live_count(), 2);
    }

    #[test]
    fn test_release_frame_sweeps_deeper_frames_too() {
        // A throw can discard frames without returning through them;
        // the next return still sweeps everything at or above its fp.
        let mut heap = Heap::new();
        let deep = heap.alloc(1, 0, true, 50);
        heap.release_frame(10);
        assert_eq!(heap.read(deep, 0), Err(Fault::BadHandle));
    }

    #[test]
    fn test_live_allocations_snapshot() {
        let mut heap = Heap::new();
        let a = heap.alloc(2, 7, false, 0);
        heap.alloc(1, ARRAY_STRUCT_ID, true, 4);

        let live = heap.live_allocations();
        assert_eq!(live.len(), 2);
        assert_eq!(live[0].handle, a);
        assert_eq!(live[0].size_bytes, 16);
        assert_eq!(live[0].struct_id, 7);
        assert!(live[1].frame_scoped);
        assert_eq!(live[1].struct_id, ARRAY_STRUCT_ID);
    }
}
