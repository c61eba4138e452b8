//! Per-address-space page tables.
//!
//! A page table is an arena of fixed-fan-out nodes indexed by integer
//! handle, with the root at handle 0. Walking descends by handle instead of
//! chasing raw physical pointers; every node is still charged one physical
//! frame from the [`FrameTable`], so page-table growth shows up in
//! free-frame accounting and intermediate allocation can genuinely run out
//! of memory.
//!
//! The table is exclusively owned by its address space. Dropping it
//! releases every mapped frame exactly once and frees the node frames.

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::{
    FrameTable, PageEntry, PageNumber, PhysicalAddress, Protection, PteFlags, VmError, arch,
};

/// Arena handle of the root node.
const ROOT: usize = 0;

/// Extends a vpn rebuilt from raw index bits so it matches
/// `PageNumber::from(VirtualAddress)` for upper-half pages, where the
/// address's sign extension survives the page-offset shift.
fn sign_extend_vpn(vpn: usize) -> usize {
    const VPN_BITS: usize = arch::INDEX_BITS * arch::PAGE_TABLE_LEVELS;
    if (vpn >> (VPN_BITS - 1)) & 1 == 0 {
        return vpn;
    }
    let offset_bits = arch::PAGE_SIZE.trailing_zeros() as usize;
    vpn | ((usize::MAX >> offset_bits) & (usize::MAX << VPN_BITS))
}

/// One page table node: a full level of entries plus the frame charged for
/// it.
struct Node {
    frame: PhysicalAddress,
    entries: Box<[PageEntry; arch::ENTRIES_PER_TABLE]>,
}

impl Node {
    fn new(frame: PhysicalAddress) -> Self {
        Self {
            frame,
            entries: Box::new([PageEntry::INVALID; arch::ENTRIES_PER_TABLE]),
        }
    }
}

/// A multi-level page table mapping virtual page numbers to leaf entries.
///
/// All page numbers passed in are already page-granular; address rounding
/// is the caller's responsibility.
pub struct PageTable {
    nodes: Vec<Node>,
}

impl PageTable {
    /// Creates a new, empty page table.
    ///
    /// Fails with `OutOfMemory` if no frame is available for the root node.
    pub fn new() -> Result<Self, VmError> {
        let mut table = Self { nodes: Vec::new() };
        table.alloc_node()?;
        Ok(table)
    }

    /// Allocates a fresh node, charging one frame for it.
    fn alloc_node(&mut self) -> Result<usize, VmError> {
        let frame = FrameTable::current().allocate()?;
        self.nodes.push(Node::new(frame));
        Ok(self.nodes.len() - 1)
    }

    /// Walks to the leaf entry for `page` without allocating.
    ///
    /// Returns None if any intermediate node is absent.
    fn walk(&mut self, page: PageNumber) -> Option<&mut PageEntry> {
        let mut node = ROOT;
        let address = page.start().as_usize();

        for level in (1..arch::PAGE_TABLE_LEVELS).rev() {
            let index = arch::page_index(address, level);
            let entry = self.nodes[node].entries[index];
            if !entry.is_valid() {
                return None;
            }
            node = entry.branch_handle();
        }

        let index = arch::page_index(address, 0);
        Some(&mut self.nodes[node].entries[index])
    }

    /// Walks to the leaf entry for `page`, allocating intermediate nodes as
    /// needed.
    ///
    /// Fails with `OutOfMemory` if a node must be allocated and no frame is
    /// available.
    fn walk_or_create(&mut self, page: PageNumber) -> Result<&mut PageEntry, VmError> {
        let mut node = ROOT;
        let address = page.start().as_usize();

        for level in (1..arch::PAGE_TABLE_LEVELS).rev() {
            let index = arch::page_index(address, level);
            let entry = self.nodes[node].entries[index];
            if entry.is_valid() {
                node = entry.branch_handle();
            } else {
                let child = self.alloc_node()?;
                self.nodes[node].entries[index] = PageEntry::branch(child);
                node = child;
            }
        }

        let index = arch::page_index(address, 0);
        Ok(&mut self.nodes[node].entries[index])
    }

    /// Returns the current leaf entry for `page`, or None if unmapped.
    pub fn lookup(&self, page: PageNumber) -> Option<PageEntry> {
        let mut node = ROOT;
        let address = page.start().as_usize();

        for level in (1..arch::PAGE_TABLE_LEVELS).rev() {
            let index = arch::page_index(address, level);
            let entry = self.nodes[node].entries[index];
            if !entry.is_valid() {
                return None;
            }
            node = entry.branch_handle();
        }

        let entry = self.nodes[node].entries[arch::page_index(address, 0)];
        entry.is_valid().then_some(entry)
    }

    /// Installs a leaf entry mapping `page` to `frame`.
    ///
    /// Fails with `AlreadyMapped` if a valid entry exists at `page`
    /// (callers must unmap first), or `OutOfMemory` if an intermediate node
    /// cannot be allocated.
    pub fn map(
        &mut self,
        page: PageNumber,
        frame: PhysicalAddress,
        flags: PteFlags,
    ) -> Result<(), VmError> {
        let entry = self.walk_or_create(page)?;
        if entry.is_valid() {
            return Err(VmError::AlreadyMapped);
        }
        *entry = PageEntry::leaf(frame, flags);
        Ok(())
    }

    /// Clears the leaf entry at `page`, returning the frame it mapped.
    ///
    /// If `free_if_last`, the frame's ownership count is decremented, which
    /// may free it. Fails with `NotMapped` if no valid entry exists.
    pub fn unmap(&mut self, page: PageNumber, free_if_last: bool) -> Result<PhysicalAddress, VmError> {
        let Some(entry) = self.walk(page) else {
            return Err(VmError::NotMapped);
        };
        if !entry.is_valid() {
            return Err(VmError::NotMapped);
        }

        let frame = entry.frame_address();
        entry.clear();
        if free_if_last {
            FrameTable::current().release(frame);
        }
        Ok(frame)
    }

    /// Rewrites only the access bits of the leaf entry at `page`.
    ///
    /// The copy-on-write marker and the mapped frame are untouched. Fails
    /// with `NotMapped` if no valid entry exists.
    pub fn set_permissions(&mut self, page: PageNumber, prot: Protection) -> Result<(), VmError> {
        let Some(entry) = self.walk(page) else {
            return Err(VmError::NotMapped);
        };
        if !entry.is_valid() {
            return Err(VmError::NotMapped);
        }

        let flags = entry.flags().with_protection(prot);
        entry.set_flags(flags);
        Ok(())
    }

    /// Returns a mutable reference to the valid leaf entry at `page`.
    ///
    /// Used by the fork and fault paths to rewrite sharing state in place.
    pub(crate) fn entry_mut(&mut self, page: PageNumber) -> Option<&mut PageEntry> {
        self.walk(page).filter(|entry| entry.is_valid())
    }

    /// Returns every valid leaf entry in virtual-address order.
    pub fn leaves(&self) -> Vec<(PageNumber, PageEntry)> {
        let mut out = Vec::new();
        self.collect_leaves(ROOT, arch::PAGE_TABLE_LEVELS - 1, 0, &mut out);
        out
    }

    fn collect_leaves(
        &self,
        node: usize,
        level: usize,
        vpn_base: usize,
        out: &mut Vec<(PageNumber, PageEntry)>,
    ) {
        for (index, entry) in self.nodes[node].entries.iter().enumerate() {
            if !entry.is_valid() {
                continue;
            }
            let vpn = vpn_base | (index << (arch::INDEX_BITS * level));
            if level == 0 {
                out.push((PageNumber::new(sign_extend_vpn(vpn)), *entry));
            } else {
                self.collect_leaves(entry.branch_handle(), level - 1, vpn, out);
            }
        }
    }
}

impl Drop for PageTable {
    /// Tears the table down: every mapped frame is released exactly once,
    /// then the node frames themselves are freed.
    fn drop(&mut self) {
        let frames = FrameTable::current();
        for (_, entry) in self.leaves() {
            frames.release(entry.frame_address());
        }
        for node in self.nodes.drain(..) {
            frames.release(node.frame);
        }
    }
}
