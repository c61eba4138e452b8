//! riscv64 (Sv39) paging geometry.
//!
//! Sv39 uses a three-level page table with 512 entries per table, 4 KiB
//! pages, and 39-bit virtual addresses that must be sign-extended into the
//! upper 25 bits.

/// Maximum number of bits in a physical address under Sv39.
pub const MAX_PHYSICAL_BITS: usize = 56;

/// Maximum number of bits in a virtual address under Sv39.
pub const MAX_VIRTUAL_BITS: usize = 39;

/// Page size in bytes (4 KiB).
pub const PAGE_SIZE: usize = 4096;

/// Number of page table levels (level 2 down to level 0).
pub const PAGE_TABLE_LEVELS: usize = 3;

/// Number of index bits per level.
pub const INDEX_BITS: usize = 9;

/// Number of entries in one page table node.
pub const ENTRIES_PER_TABLE: usize = 1 << INDEX_BITS;

/// Returns the page table index for a virtual address at the given level.
///
/// Level 0 is the leaf table; level 2 is the root.
#[inline]
pub const fn page_index(address: usize, level: usize) -> usize {
    assert!(level < PAGE_TABLE_LEVELS, "level out of range for Sv39");
    let shift = 12 + level * INDEX_BITS;
    (address >> shift) & (ENTRIES_PER_TABLE - 1)
}

/// Validates a physical address for Sv39.
#[inline]
pub const fn validate_physical(addr: usize) -> bool {
    addr < (1usize << MAX_PHYSICAL_BITS)
}

/// Validates a virtual address for Sv39.
///
/// Virtual addresses must be canonical: bits 39-63 are the sign extension
/// of bit 38.
#[inline]
pub const fn validate_virtual(addr: usize) -> bool {
    let canonical = if (addr & (1 << 38)) != 0 {
        addr | !0x7F_FFFF_FFFF
    } else {
        addr & 0x7F_FFFF_FFFF
    };
    canonical == addr
}
