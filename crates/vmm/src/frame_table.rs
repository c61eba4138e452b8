//! Frame ownership table and physical frame allocator.
//!
//! The frame table is the one structure genuinely shared across unrelated
//! address spaces: it hands out free frames and tracks, per frame, how many
//! valid page table entries currently name it. A frame whose count drops to
//! zero goes straight back on the free list; the `fetch_sub` return value
//! makes that decision a single atomic step, so a stale count can never
//! free a frame that is still referenced elsewhere.
//!
//! Free frames are kept on a lock-free stack of frame indexes whose links
//! live beside the reference counts; the stack head carries a generation
//! tag so a pop racing with a free of the same frame cannot install a
//! stale link.

use core::ptr;
use core::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::{AddressTranslator, PhysicalAddress, arch};

/// Errors surfaced by the virtual-memory subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// A frame or page-table-node allocation failed.
    OutOfMemory,
    /// A valid mapping already exists where one was being installed.
    AlreadyMapped,
    /// No valid mapping exists where one was required.
    NotMapped,
}

/// Lock-free stack of free frame indexes.
///
/// The head packs a slot (frame index plus one; slot 0 means empty) with a
/// generation counter bumped on every successful swing, so a pop racing
/// with a pop-and-repush of the same frame fails its compare-exchange
/// instead of installing a stale link.
struct FreeList {
    /// `(generation << 32) | slot`.
    head: AtomicU64,
    next: Box<[AtomicU32]>,
    count: AtomicUsize,
}

impl FreeList {
    fn new(frame_count: usize) -> Self {
        assert!(
            frame_count < u32::MAX as usize,
            "frame count exceeds free-list index width"
        );
        Self {
            head: AtomicU64::new(0),
            next: (0..frame_count)
                .map(|_| AtomicU32::new(0))
                .collect::<Vec<_>>()
                .into_boxed_slice(),
            count: AtomicUsize::new(0),
        }
    }

    /// Pushes a frame index onto the free list.
    fn push(&self, index: usize) {
        let slot = index as u32 + 1;
        loop {
            let head = self.head.load(Ordering::Acquire);
            self.next[index].store(head as u32, Ordering::Relaxed);
            if self
                .head
                .compare_exchange(head, Self::bump(head, slot), Ordering::Release, Ordering::Acquire)
                .is_ok()
            {
                self.count.fetch_add(1, Ordering::Release);
                return;
            }
        }
    }

    /// Pops a frame index from the free list, returning None if empty.
    fn pop(&self) -> Option<usize> {
        loop {
            let head = self.head.load(Ordering::Acquire);
            let slot = head as u32;
            if slot == 0 {
                return None;
            }
            let index = (slot - 1) as usize;
            let next = self.next[index].load(Ordering::Relaxed);
            if self
                .head
                .compare_exchange(head, Self::bump(head, next), Ordering::Release, Ordering::Acquire)
                .is_ok()
            {
                self.count.fetch_sub(1, Ordering::Release);
                return Some(index);
            }
        }
    }

    fn bump(head: u64, slot: u32) -> u64 {
        ((head >> 32).wrapping_add(1) << 32) | u64::from(slot)
    }

    fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }
}

/// Frame allocator plus per-frame ownership counts for one contiguous
/// region of physical memory.
///
/// All mutation goes through atomic operations, so a shared reference is
/// enough to allocate, retain, and release frames from fork and
/// fault-handling paths running on behalf of different processes.
pub struct FrameTable {
    /// First frame managed by this table. Page-aligned.
    base: PhysicalAddress,
    /// Number of frames managed by this table.
    frame_count: usize,
    /// One reference count per frame. Zero means the frame is free (or on
    /// its way to the free list).
    refcounts: Box<[AtomicU32]>,
    free_list: FreeList,
}

impl FrameTable {
    /// Creates a frame table over `frame_count` frames starting at `base`,
    /// with every frame free.
    ///
    /// # Panics
    ///
    /// Panics if `base` is not page-aligned.
    pub fn new(base: PhysicalAddress, frame_count: usize) -> Self {
        assert!(
            base.is_aligned(arch::PAGE_SIZE),
            "frame region must be page-aligned"
        );

        let refcounts: Box<[AtomicU32]> = (0..frame_count)
            .map(|_| AtomicU32::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let table = Self {
            base,
            frame_count,
            refcounts,
            free_list: FreeList::new(frame_count),
        };

        // Push in reverse so frames pop out in ascending address order.
        for index in (0..frame_count).rev() {
            table.free_list.push(index);
        }

        table
    }

    /// Sets the global frame table.
    ///
    /// Called exactly once at boot; the table lives for the rest of kernel
    /// uptime.
    ///
    /// # Panics
    ///
    /// Panics if the table has already been set.
    pub fn set_current(table: FrameTable) {
        #[cfg(not(any(test, feature = "software-emulation")))]
        {
            if FRAME_TABLE.get().is_some() {
                panic!("frame table already set");
            }
            FRAME_TABLE.call_once(|| table);
        }

        #[cfg(any(test, feature = "software-emulation"))]
        {
            FRAME_TABLE.with(|t| {
                if t.get().is_some() {
                    panic!("frame table already set");
                }
                t.call_once(|| table);
            });
        }
    }

    /// Returns a reference to the global frame table.
    ///
    /// # Panics
    ///
    /// Panics if the table has not been set yet.
    pub fn current() -> &'static FrameTable {
        #[cfg(not(any(test, feature = "software-emulation")))]
        {
            FRAME_TABLE
                .get()
                .expect("frame table not set; call FrameTable::set_current during initialization")
        }

        #[cfg(any(test, feature = "software-emulation"))]
        {
            FRAME_TABLE.with(|t| {
                // SAFETY: Same reasoning as AddressTranslator::current():
                // thread-local, set once, lives as long as the thread.
                unsafe {
                    &*(t.get().expect(
                        "frame table not set; call FrameTable::set_current during initialization",
                    ) as *const FrameTable)
                }
            })
        }
    }

    /// Allocates one frame, zero-filled, with its ownership count set to 1.
    pub fn allocate(&self) -> Result<PhysicalAddress, VmError> {
        let index = self.free_list.pop().ok_or_else(|| {
            log::error!("out of memory: no free frames");
            VmError::OutOfMemory
        })?;
        let frame = self.base + index * arch::PAGE_SIZE;

        // Fresh frames are handed out zeroed.
        unsafe {
            let ptr: *mut u8 = AddressTranslator::current().phys_to_ptr(frame);
            ptr::write_bytes(ptr, 0, arch::PAGE_SIZE);
        }

        self.refcounts[index].store(1, Ordering::Release);
        Ok(frame)
    }

    /// Raises the ownership count of `frame` by one.
    ///
    /// The caller must already hold a reference to the frame, so the count
    /// can never be observed at zero here.
    pub fn retain(&self, frame: PhysicalAddress) {
        let old = self.refcounts[self.index(frame)].fetch_add(1, Ordering::AcqRel);
        debug_assert!(old >= 1, "retain of unreferenced frame {frame}");
    }

    /// Lowers the ownership count of `frame` by one, returning the frame to
    /// the free pool when the count reaches zero.
    pub fn release(&self, frame: PhysicalAddress) {
        let index = self.index(frame);
        let old = self.refcounts[index].fetch_sub(1, Ordering::AcqRel);
        debug_assert!(old >= 1, "release of unreferenced frame {frame}");
        if old == 1 {
            self.free_list.push(index);
        }
    }

    /// Returns the current ownership count of `frame`.
    pub fn count(&self, frame: PhysicalAddress) -> u32 {
        self.refcounts[self.index(frame)].load(Ordering::Acquire)
    }

    /// Returns the number of currently free frames.
    pub fn free_frames(&self) -> usize {
        self.free_list.count()
    }

    /// Returns the total number of frames managed by this table.
    pub fn total_frames(&self) -> usize {
        self.frame_count
    }

    fn index(&self, frame: PhysicalAddress) -> usize {
        debug_assert!(
            frame.is_aligned(arch::PAGE_SIZE),
            "frame address must be page-aligned"
        );
        let index = (frame - self.base) / arch::PAGE_SIZE;
        assert!(index < self.frame_count, "frame {frame} outside managed region");
        index
    }
}

/// Global frame table.
///
/// Initialized once at boot, never torn down. Thread-local in tests so each
/// test owns an isolated frame pool.
#[cfg(not(any(test, feature = "software-emulation")))]
static FRAME_TABLE: spin::Once<FrameTable> = spin::Once::new();

#[cfg(any(test, feature = "software-emulation"))]
std::thread_local! {
    static FRAME_TABLE: spin::Once<FrameTable> = spin::Once::new();
}
