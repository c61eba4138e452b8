//! Software scale model for testing and development.
//!
//! This geometry is a scale model of Sv39 that runs on any host:
//!
//! - 16-bit addresses (vs 39-bit virtual / 56-bit physical)
//! - 3 levels of page tables, as on the real hardware
//! - 4-bit indexes (16 entries per table, vs 9-bit/512)
//! - 4-bit page offset (16-byte pages, vs 12-bit/4 KiB)
//!
//! Page table entries keep the real Sv39 encoding (flags in the low ten
//! bits, ppn above them), so the flag manipulation exercised in tests is
//! exactly what the hardware target sees.

/// Maximum number of bits in a physical address for the scale model.
pub const MAX_PHYSICAL_BITS: usize = 16;

/// Maximum number of bits in a virtual address for the scale model.
pub const MAX_VIRTUAL_BITS: usize = 16;

/// Page size in bytes (16 bytes = 2^4).
pub const PAGE_SIZE: usize = 16;

/// Number of page table levels (level 2 down to level 0).
pub const PAGE_TABLE_LEVELS: usize = 3;

/// Number of index bits per level.
pub const INDEX_BITS: usize = 4;

/// Number of entries in one page table node.
pub const ENTRIES_PER_TABLE: usize = 1 << INDEX_BITS;

/// Returns the page table index for a virtual address at the given level.
///
/// Level 0 is the leaf table; level 2 is the root.
#[inline]
pub const fn page_index(address: usize, level: usize) -> usize {
    assert!(level < PAGE_TABLE_LEVELS, "level out of range for scale model");
    let shift = 4 + level * INDEX_BITS;
    (address >> shift) & (ENTRIES_PER_TABLE - 1)
}

/// Validates a physical address for the scale model.
#[inline]
pub const fn validate_physical(addr: usize) -> bool {
    addr <= 0xFFFF
}

/// Validates a virtual address for the scale model.
///
/// Virtual addresses must be canonical: bits 16-63 are the sign extension
/// of bit 15.
#[inline]
pub const fn validate_virtual(addr: usize) -> bool {
    let canonical = if (addr & 0x8000) != 0 {
        addr | 0xFFFF_FFFF_FFFF_0000
    } else {
        addr & 0xFFFF
    };
    canonical == addr
}

/// Emulated physical memory for the scale model.
///
/// This backs all physical frames during testing, so page contents can be
/// zero-filled, copied, and inspected without hardware support.
pub struct EmulatedMemory {
    memory: Vec<u8>,
}

impl EmulatedMemory {
    /// Creates a new emulated memory region of the specified size.
    pub fn new(size: usize) -> Self {
        Self {
            memory: alloc::vec![0u8; size],
        }
    }

    /// Translates a physical address to a pointer into the buffer.
    pub fn translate(&self, phys: usize) -> *mut u8 {
        assert!(phys < self.memory.len(), "physical address out of bounds");
        unsafe { self.memory.as_ptr().add(phys) as *mut u8 }
    }

    /// Translates a pointer back to a physical address.
    pub fn ptr_to_phys(&self, ptr: *const u8) -> usize {
        let offset = unsafe { ptr.offset_from(self.memory.as_ptr()) };
        assert!(offset >= 0, "pointer not within emulated memory");
        assert!(
            (offset as usize) < self.memory.len(),
            "pointer not within emulated memory"
        );
        offset as usize
    }

    /// Returns the size of the emulated memory region.
    pub fn size(&self) -> usize {
        self.memory.len()
    }
}
