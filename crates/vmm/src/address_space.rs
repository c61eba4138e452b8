//! Address space management.
//!
//! An address space owns one page table plus the process break (the top of
//! the heap region). It is created on process creation or fork, grown and
//! shrunk by `sbrk`, re-protected by `mprotect`, mutated by copy-on-write
//! faults, and destroyed on process exit.

use crate::{
    AccessKind, AddressTranslator, FatalFault, FaultOutcome, FrameTable, PageNumber, PageTable,
    PhysicalAddress, Protection, PteFlags, VirtualAddress, VmError, arch,
    fault::handle_page_fault,
};

/// Whether two canonical addresses lie on the same side of the canonical
/// hole.
fn same_half(a: usize, b: usize) -> bool {
    let upper_half = usize::MAX << (arch::MAX_VIRTUAL_BITS - 1);
    (a >= upper_half) == (b >= upper_half)
}

/// A process's virtual address space.
///
/// The page table is exclusively owned: only the owning process's thread of
/// control mutates it, except during fork, where the parent builds the
/// not-yet-running child synchronously.
pub struct AddressSpace {
    /// The page table for this address space.
    table: PageTable,
    /// Bottom of the heap region. The break never moves below this.
    heap_base: VirtualAddress,
    /// Current break (top of the heap region).
    brk: VirtualAddress,
}

impl AddressSpace {
    /// Creates a new address space with an empty heap starting at
    /// `heap_base`.
    ///
    /// # Panics
    ///
    /// Panics if `heap_base` is not page-aligned.
    pub fn new(heap_base: VirtualAddress) -> Result<Self, VmError> {
        assert!(
            heap_base.is_aligned(arch::PAGE_SIZE),
            "heap base must be page-aligned"
        );
        Ok(Self {
            table: PageTable::new()?,
            heap_base,
            brk: heap_base,
        })
    }

    /// Returns a reference to the page table for this address space.
    pub fn page_table(&self) -> &PageTable {
        &self.table
    }

    /// Returns a mutable reference to the page table for this address space.
    pub fn page_table_mut(&mut self) -> &mut PageTable {
        &mut self.table
    }

    /// Returns the current break.
    pub fn brk(&self) -> VirtualAddress {
        self.brk
    }

    /// Moves the break by `delta` bytes, returning the previous break.
    ///
    /// Growth maps fresh zero-filled, exclusively owned frames read-write;
    /// shrinking unmaps and releases the pages above the new break. A
    /// failed growth rolls back completely: the break and every frame
    /// count are left as they were.
    pub fn sbrk(&mut self, delta: isize) -> Result<VirtualAddress, VmError> {
        let old = self.brk;
        if delta >= 0 {
            self.grow(delta as usize)?;
        } else {
            self.shrink(delta.unsigned_abs());
        }
        Ok(old)
    }

    fn grow(&mut self, delta: usize) -> Result<(), VmError> {
        if delta == 0 {
            return Ok(());
        }

        // The new break must be a canonical address on the same side of
        // the canonical hole as the old one; the request is user-sized, so
        // an oversized delta is an error, not a panic.
        let end = self
            .brk
            .as_usize()
            .checked_add(delta)
            .filter(|&end| arch::validate_virtual(end) && same_half(self.brk.as_usize(), end))
            .ok_or_else(|| {
                log::error!("sbrk request runs past the end of the address space");
                VmError::OutOfMemory
            })?;
        let new_brk = VirtualAddress::new(end);

        let start_vpn = self.brk.as_usize().div_ceil(arch::PAGE_SIZE);
        let end_vpn = end.div_ceil(arch::PAGE_SIZE);
        let frames = FrameTable::current();

        for vpn in start_vpn..end_vpn {
            let result = frames.allocate().and_then(|frame| {
                self.table
                    .map(
                        PageNumber::new(vpn),
                        frame,
                        PteFlags::leaf(Protection::READ | Protection::WRITE),
                    )
                    .inspect_err(|_| frames.release(frame))
            });

            if let Err(err) = result {
                // Roll back the pages mapped during this call; the break is
                // untouched.
                log::error!("sbrk growth failed at page {vpn}, rolling back");
                for mapped in start_vpn..vpn {
                    let _ = self.table.unmap(PageNumber::new(mapped), true);
                }
                return Err(err);
            }
        }

        self.brk = new_brk;
        Ok(())
    }

    fn shrink(&mut self, delta: usize) {
        // The break never moves below the initial heap extent.
        let new_brk = if delta >= self.brk - self.heap_base {
            self.heap_base
        } else {
            self.brk - delta
        };

        let start_vpn = new_brk.as_usize().div_ceil(arch::PAGE_SIZE);
        let end_vpn = self.brk.as_usize().div_ceil(arch::PAGE_SIZE);
        for vpn in start_vpn..end_vpn {
            let _ = self.table.unmap(PageNumber::new(vpn), true);
        }

        self.brk = new_brk;
    }

    /// Duplicates this address space for fork.
    ///
    /// Writable pages are downgraded to read-only copy-on-write in both
    /// parent and child; pages that are already read-only (or access-denied)
    /// and not COW are shared verbatim without COW semantics. Every shared
    /// frame's ownership count is raised. The operation is atomic: if an
    /// allocation fails mid-walk, the partially built child is unwound and
    /// every raised count is dropped again.
    pub fn duplicate(&mut self) -> Result<AddressSpace, VmError> {
        let mut child = AddressSpace::new(self.heap_base)?;
        child.brk = self.brk;

        let frames = FrameTable::current();
        let leaves = self.table.leaves();
        for &(page, entry) in &leaves {
            let mut flags = entry.flags();
            if flags.is_writable() {
                flags.set_writable(false);
                flags.set_cow(true);
            }

            let frame = entry.frame_address();
            // A failure here drops `child`, whose teardown unmaps every
            // entry installed so far and releases the retained counts.
            child.table.map(page, frame, flags)?;
            frames.retain(frame);

            if flags != entry.flags() {
                let source = self.table.entry_mut(page).ok_or(VmError::NotMapped)?;
                source.set_flags(flags);
            }
        }

        log::trace!("duplicated address space: {} pages shared", leaves.len());
        Ok(child)
    }

    /// Applies an `mprotect`-style permission change over `[addr, addr+len)`.
    ///
    /// The range is normalized to page boundaries (base rounded down, end
    /// rounded up), so a misaligned request still has its interior fully
    /// covered. Fails with `NotMapped`, changing nothing, if the range
    /// leaves the canonical address space or any page in the normalized
    /// range lacks a valid mapping. Sharing state and frame ownership are
    /// never touched.
    pub fn protect(
        &mut self,
        addr: VirtualAddress,
        len: usize,
        prot: Protection,
    ) -> Result<(), VmError> {
        if len == 0 {
            return Ok(());
        }

        // The length is user-controlled; a range whose last byte overflows
        // or falls outside the canonical address space fails like any
        // other unmapped range.
        let Some(last) = addr.as_usize().checked_add(len - 1) else {
            return Err(VmError::NotMapped);
        };
        if !arch::validate_virtual(last) || !same_half(addr.as_usize(), last) {
            return Err(VmError::NotMapped);
        }

        let start_vpn = addr.align_down(arch::PAGE_SIZE).page_number().as_usize();
        let end_vpn = last / arch::PAGE_SIZE + 1;

        // Validate the whole range before touching anything: a failed call
        // must leave no partial permission changes behind.
        for vpn in start_vpn..end_vpn {
            if self.table.lookup(PageNumber::new(vpn)).is_none() {
                return Err(VmError::NotMapped);
            }
        }

        for vpn in start_vpn..end_vpn {
            self.table.set_permissions(PageNumber::new(vpn), prot)?;
        }
        Ok(())
    }

    /// Returns the flags of the leaf entry covering `addr`, or None if the
    /// address is unmapped. Diagnostic surface.
    pub fn pte_flags(&self, addr: VirtualAddress) -> Option<PteFlags> {
        self.table.lookup(addr.page_number()).map(|e| e.flags())
    }

    /// Returns the physical address of the frame backing `addr`, or None if
    /// the address is unmapped. Diagnostic surface.
    pub fn frame_address(&self, addr: VirtualAddress) -> Option<PhysicalAddress> {
        self.table
            .lookup(addr.page_number())
            .map(|e| e.frame_address())
    }

    /// Checks an access the way the MMU would, dispatching a page fault on
    /// denial. Returns only once the access is permitted.
    fn ensure_access(&mut self, addr: VirtualAddress, access: AccessKind) -> Result<(), FatalFault> {
        if let Some(flags) = self.pte_flags(addr) {
            if flags.permits(access) {
                return Ok(());
            }
        }

        match handle_page_fault(self, addr, access) {
            FaultOutcome::Resumed => {
                debug_assert!(
                    self.pte_flags(addr).is_some_and(|f| f.permits(access)),
                    "resolved fault must leave the access permitted"
                );
                Ok(())
            }
            FaultOutcome::Fatal(fault) => Err(fault),
        }
    }

    /// Copies `src` into this address space at `dst`, enforcing user write
    /// permission page by page.
    ///
    /// A store to a copy-on-write page triggers resolution exactly as a
    /// userspace store would.
    pub fn copy_out(&mut self, dst: VirtualAddress, src: &[u8]) -> Result<(), FatalFault> {
        let mut copied = 0;
        while copied < src.len() {
            let addr = dst + copied;
            self.ensure_access(addr, AccessKind::Write)?;

            let offset = addr.page_offset();
            let chunk = usize::min(arch::PAGE_SIZE - offset, src.len() - copied);
            let frame = self
                .frame_address(addr)
                .expect("write access was just ensured");

            unsafe {
                let dst_ptr: *mut u8 = AddressTranslator::current().phys_to_ptr(frame);
                core::ptr::copy_nonoverlapping(
                    src.as_ptr().add(copied),
                    dst_ptr.add(offset),
                    chunk,
                );
            }
            copied += chunk;
        }
        Ok(())
    }

    /// Copies bytes at `src` in this address space into `dst`, enforcing
    /// user read permission page by page.
    pub fn copy_in(&mut self, dst: &mut [u8], src: VirtualAddress) -> Result<(), FatalFault> {
        let mut copied = 0;
        while copied < dst.len() {
            let addr = src + copied;
            self.ensure_access(addr, AccessKind::Read)?;

            let offset = addr.page_offset();
            let chunk = usize::min(arch::PAGE_SIZE - offset, dst.len() - copied);
            let frame = self
                .frame_address(addr)
                .expect("read access was just ensured");

            unsafe {
                let src_ptr: *const u8 = AddressTranslator::current().phys_to_ptr(frame);
                core::ptr::copy_nonoverlapping(
                    src_ptr.add(offset),
                    dst.as_mut_ptr().add(copied),
                    chunk,
                );
            }
            copied += chunk;
        }
        Ok(())
    }

    /// Checks that `addr` may be executed, enforcing user execute
    /// permission the way an instruction fetch would.
    pub fn check_execute(&mut self, addr: VirtualAddress) -> Result<(), FatalFault> {
        self.ensure_access(addr, AccessKind::Execute)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FaultCause;

    fn setup(frames: usize) {
        AddressTranslator::set_current(AddressTranslator::emulated(frames * arch::PAGE_SIZE));
        FrameTable::set_current(FrameTable::new(PhysicalAddress::new(0), frames));
    }

    fn new_space() -> AddressSpace {
        AddressSpace::new(VirtualAddress::new(0)).unwrap()
    }

    const PG: usize = arch::PAGE_SIZE;

    mod sbrk {
        use super::*;

        #[test]
        fn grow_maps_zeroed_writable_pages() {
            setup(16);
            let mut space = new_space();

            let previous = space.sbrk(2 * PG as isize).unwrap();
            assert_eq!(previous, VirtualAddress::new(0));
            assert_eq!(space.brk(), VirtualAddress::new(2 * PG));

            for va in [0, PG] {
                let flags = space.pte_flags(VirtualAddress::new(va)).unwrap();
                assert!(flags.is_valid());
                assert!(flags.is_user());
                assert!(flags.is_readable());
                assert!(flags.is_writable());
                assert!(!flags.is_cow());
            }

            let mut buf = [0xFFu8; PG];
            space.copy_in(&mut buf, VirtualAddress::new(0)).unwrap();
            assert!(buf.iter().all(|&b| b == 0));
        }

        #[test]
        fn sub_page_growth_shares_the_page() {
            setup(16);
            let mut space = new_space();

            space.sbrk((PG / 2) as isize).unwrap();
            assert!(space.pte_flags(VirtualAddress::new(0)).is_some());
            let free = FrameTable::current().free_frames();

            // The second half of the page is already backed.
            space.sbrk((PG / 2) as isize).unwrap();
            assert_eq!(space.brk(), VirtualAddress::new(PG));
            assert_eq!(FrameTable::current().free_frames(), free);
        }

        #[test]
        fn failed_growth_rolls_back() {
            setup(8);
            let mut space = new_space();
            space.sbrk(PG as isize).unwrap();

            let brk_before = space.brk();
            let free_before = FrameTable::current().free_frames();

            // Far more pages than frames remain.
            assert_eq!(space.sbrk((32 * PG) as isize), Err(VmError::OutOfMemory));

            assert_eq!(space.brk(), brk_before);
            assert_eq!(FrameTable::current().free_frames(), free_before);
            assert!(space.pte_flags(VirtualAddress::new(2 * PG)).is_none());
        }

        #[test]
        fn growth_past_the_canonical_top_fails_cleanly() {
            setup(16);
            let mut space = new_space();
            space.sbrk(PG as isize).unwrap();
            let free = FrameTable::current().free_frames();

            // The new break would land in the canonical hole.
            assert_eq!(space.sbrk(0x8000), Err(VmError::OutOfMemory));
            assert_eq!(space.brk(), VirtualAddress::new(PG));
            assert_eq!(FrameTable::current().free_frames(), free);
        }

        #[test]
        fn growth_overflowing_the_address_fails_cleanly() {
            setup(16);
            let base = VirtualAddress::new(usize::MAX - (PG - 1));
            let mut space = AddressSpace::new(base).unwrap();

            assert_eq!(space.sbrk(2 * PG as isize), Err(VmError::OutOfMemory));
            assert_eq!(space.brk(), base);
        }

        #[test]
        fn shrink_unmaps_and_frees() {
            setup(16);
            let mut space = new_space();
            space.sbrk(3 * PG as isize).unwrap();
            let free = FrameTable::current().free_frames();

            space.sbrk(-(2 * PG as isize)).unwrap();
            assert_eq!(space.brk(), VirtualAddress::new(PG));
            assert_eq!(FrameTable::current().free_frames(), free + 2);
            assert!(space.pte_flags(VirtualAddress::new(PG)).is_none());
            assert!(space.pte_flags(VirtualAddress::new(0)).is_some());
        }

        #[test]
        fn shrink_clamps_at_the_heap_base() {
            setup(16);
            let mut space = new_space();
            space.sbrk(PG as isize).unwrap();

            space.sbrk(-(100 * PG as isize)).unwrap();
            assert_eq!(space.brk(), VirtualAddress::new(0));
            assert!(space.pte_flags(VirtualAddress::new(0)).is_none());
        }
    }

    mod fork {
        use super::*;

        #[test]
        fn writable_pages_become_shared_cow() {
            setup(32);
            let mut parent = new_space();
            parent.sbrk(2 * PG as isize).unwrap();
            parent.copy_out(VirtualAddress::new(0), b"A").unwrap();

            let child = parent.duplicate().unwrap();

            for space in [&parent, &child] {
                let flags = space.pte_flags(VirtualAddress::new(0)).unwrap();
                assert!(!flags.is_writable());
                assert!(flags.is_cow());
                assert!(flags.is_readable());
            }

            let frame = parent.frame_address(VirtualAddress::new(0)).unwrap();
            assert_eq!(child.frame_address(VirtualAddress::new(0)).unwrap(), frame);
            assert_eq!(FrameTable::current().count(frame), 2);
            assert_eq!(child.brk(), parent.brk());
        }

        #[test]
        fn read_only_pages_are_shared_without_cow() {
            setup(32);
            let mut parent = new_space();
            parent.sbrk(PG as isize).unwrap();
            parent
                .protect(VirtualAddress::new(0), PG, Protection::READ)
                .unwrap();

            let child = parent.duplicate().unwrap();

            for space in [&parent, &child] {
                let flags = space.pte_flags(VirtualAddress::new(0)).unwrap();
                assert!(flags.is_readable());
                assert!(!flags.is_writable());
                assert!(!flags.is_cow());
            }

            let frame = parent.frame_address(VirtualAddress::new(0)).unwrap();
            assert_eq!(FrameTable::current().count(frame), 2);
        }

        #[test]
        fn access_denied_pages_are_shared_without_cow() {
            setup(32);
            let mut parent = new_space();
            parent.sbrk(PG as isize).unwrap();
            parent
                .protect(VirtualAddress::new(0), PG, Protection::NONE)
                .unwrap();

            let child = parent.duplicate().unwrap();
            let flags = child.pte_flags(VirtualAddress::new(0)).unwrap();
            assert!(flags.is_valid());
            assert!(!flags.is_readable());
            assert!(!flags.is_cow());
        }

        #[test]
        fn fork_of_an_upper_half_space_shares_pages() {
            setup(32);
            let base = VirtualAddress::new(0xFFFF_FFFF_FFFF_8000);
            let mut parent = AddressSpace::new(base).unwrap();
            parent.sbrk(PG as isize).unwrap();
            parent.copy_out(base, b"U").unwrap();

            let mut child = parent.duplicate().unwrap();
            assert_eq!(child.frame_address(base), parent.frame_address(base));
            assert!(child.pte_flags(base).unwrap().is_cow());

            let mut byte = [0u8];
            child.copy_in(&mut byte, base).unwrap();
            assert_eq!(&byte, b"U");

            // Divergence works above the canonical hole too.
            child.copy_out(base, b"V").unwrap();
            parent.copy_in(&mut byte, base).unwrap();
            assert_eq!(&byte, b"U");
        }

        #[test]
        fn fork_of_a_fork_keeps_sharing() {
            setup(32);
            let mut parent = new_space();
            parent.sbrk(PG as isize).unwrap();

            let mut child = parent.duplicate().unwrap();
            let grandchild = child.duplicate().unwrap();

            let frame = parent.frame_address(VirtualAddress::new(0)).unwrap();
            assert_eq!(
                grandchild.frame_address(VirtualAddress::new(0)).unwrap(),
                frame
            );
            assert_eq!(FrameTable::current().count(frame), 3);
            assert!(grandchild.pte_flags(VirtualAddress::new(0)).unwrap().is_cow());
        }

        #[test]
        fn failed_fork_unwinds_completely() {
            setup(12);
            let mut parent = new_space();
            parent.sbrk(3 * PG as isize).unwrap();
            let frame = parent.frame_address(VirtualAddress::new(0)).unwrap();

            // Leave too few frames for the child's page table nodes.
            let frames = FrameTable::current();
            let mut held = Vec::new();
            for _ in 0..frames.free_frames().saturating_sub(1) {
                held.push(frames.allocate().unwrap());
            }
            let free_before = frames.free_frames();

            assert_eq!(parent.duplicate().err(), Some(VmError::OutOfMemory));

            // Every retained count was dropped and every node frame freed.
            assert_eq!(frames.free_frames(), free_before);
            assert_eq!(frames.count(frame), 1);

            for f in held {
                frames.release(f);
            }
        }

        #[test]
        fn exit_of_one_sibling_releases_shared_counts() {
            setup(32);
            let mut parent = new_space();
            parent.sbrk(2 * PG as isize).unwrap();
            let frame = parent.frame_address(VirtualAddress::new(0)).unwrap();

            {
                let _child = parent.duplicate().unwrap();
                assert_eq!(FrameTable::current().count(frame), 2);
            }

            assert_eq!(FrameTable::current().count(frame), 1);
        }
    }

    mod protect {
        use super::*;

        #[test]
        fn misaligned_range_covers_the_interior() {
            setup(16);
            let mut space = new_space();
            space.sbrk(2 * PG as isize).unwrap();
            space.copy_out(VirtualAddress::new(0), &[b'A'; 2 * PG]).unwrap();

            // A misaligned base and length must still protect every byte in
            // between (scale model of the 500/5000 scenario).
            let mid = VirtualAddress::new(5);
            let len = 2 * PG - 7;

            space.protect(mid, len, Protection::READ).unwrap();

            let mut byte = [0u8];
            space.copy_in(&mut byte, VirtualAddress::new(0)).unwrap();
            assert_eq!(byte[0], b'A');
            let fault = space.copy_out(VirtualAddress::new(0), b"X").unwrap_err();
            assert_eq!(fault.cause, FaultCause::ProtectionViolation);
            let fault = space
                .copy_out(VirtualAddress::new(2 * PG - 1), b"X")
                .unwrap_err();
            assert_eq!(fault.cause, FaultCause::ProtectionViolation);

            space.protect(mid, len, Protection::NONE).unwrap();
            assert!(space.copy_in(&mut byte, VirtualAddress::new(0)).is_err());
            assert!(space.copy_out(VirtualAddress::new(0), b"X").is_err());

            space
                .protect(mid, len, Protection::READ | Protection::WRITE)
                .unwrap();
            space.copy_out(VirtualAddress::new(0), b"X").unwrap();
            space.copy_in(&mut byte, VirtualAddress::new(0)).unwrap();
            assert_eq!(byte[0], b'X');
        }

        #[test]
        fn prot_none_round_trip_keeps_the_frame() {
            setup(16);
            let mut space = new_space();
            space.sbrk(PG as isize).unwrap();
            space.copy_out(VirtualAddress::new(0), b"data").unwrap();
            let frame = space.frame_address(VirtualAddress::new(0)).unwrap();
            let count = FrameTable::current().count(frame);

            space.protect(VirtualAddress::new(0), PG, Protection::NONE).unwrap();
            // Still mapped for accounting purposes, just inaccessible.
            assert_eq!(space.frame_address(VirtualAddress::new(0)), Some(frame));
            assert_eq!(FrameTable::current().count(frame), count);

            space
                .protect(VirtualAddress::new(0), PG, Protection::READ | Protection::WRITE)
                .unwrap();
            assert_eq!(space.frame_address(VirtualAddress::new(0)), Some(frame));

            let mut buf = [0u8; 4];
            space.copy_in(&mut buf, VirtualAddress::new(0)).unwrap();
            assert_eq!(&buf, b"data");
        }

        #[test]
        fn unmapped_page_fails_atomically() {
            setup(16);
            let mut space = new_space();
            space.sbrk(PG as isize).unwrap();
            let flags_before = space.pte_flags(VirtualAddress::new(0)).unwrap();

            // Second page of the range is unmapped.
            assert_eq!(
                space.protect(VirtualAddress::new(0), 2 * PG, Protection::READ),
                Err(VmError::NotMapped)
            );

            // No partial application.
            assert_eq!(space.pte_flags(VirtualAddress::new(0)).unwrap(), flags_before);
        }

        #[test]
        fn protect_never_touches_sharing_state() {
            setup(32);
            let mut parent = new_space();
            parent.sbrk(PG as isize).unwrap();
            let _child = parent.duplicate().unwrap();
            let frame = parent.frame_address(VirtualAddress::new(0)).unwrap();

            parent
                .protect(VirtualAddress::new(0), PG, Protection::READ)
                .unwrap();

            let flags = parent.pte_flags(VirtualAddress::new(0)).unwrap();
            assert!(flags.is_cow());
            assert_eq!(FrameTable::current().count(frame), 2);
            assert_eq!(parent.frame_address(VirtualAddress::new(0)), Some(frame));
        }

        #[test]
        fn range_past_the_canonical_top_fails_cleanly() {
            setup(16);
            let mut space = new_space();
            space.sbrk(PG as isize).unwrap();
            let flags_before = space.pte_flags(VirtualAddress::new(0)).unwrap();

            // Ends one byte past the last canonical lower-half address.
            assert_eq!(
                space.protect(VirtualAddress::new(0), 0x8001, Protection::READ),
                Err(VmError::NotMapped)
            );
            // Last byte wraps around the address space entirely.
            assert_eq!(
                space.protect(VirtualAddress::new(PG / 2), usize::MAX, Protection::READ),
                Err(VmError::NotMapped)
            );

            assert_eq!(space.pte_flags(VirtualAddress::new(0)).unwrap(), flags_before);
        }

        #[test]
        fn zero_length_request_is_a_no_op() {
            setup(16);
            let mut space = new_space();
            assert_eq!(space.protect(VirtualAddress::new(0), 0, Protection::READ), Ok(()));
        }
    }

    mod exec {
        use super::*;

        #[test]
        fn exec_only_page_is_callable_but_unreadable() {
            setup(16);
            let mut space = new_space();
            space.sbrk(PG as isize).unwrap();

            space.protect(VirtualAddress::new(0), PG, Protection::EXEC).unwrap();
            space.check_execute(VirtualAddress::new(0)).unwrap();

            let mut byte = [0u8];
            let fault = space.copy_in(&mut byte, VirtualAddress::new(0)).unwrap_err();
            assert_eq!(fault.cause, FaultCause::ProtectionViolation);
        }

        #[test]
        fn read_only_page_is_readable_but_not_callable() {
            setup(16);
            let mut space = new_space();
            space.sbrk(PG as isize).unwrap();

            space.protect(VirtualAddress::new(0), PG, Protection::READ).unwrap();
            let mut byte = [0u8];
            space.copy_in(&mut byte, VirtualAddress::new(0)).unwrap();

            let fault = space.check_execute(VirtualAddress::new(0)).unwrap_err();
            assert_eq!(fault.cause, FaultCause::ProtectionViolation);
        }

        #[test]
        fn read_exec_page_permits_both() {
            setup(16);
            let mut space = new_space();
            space.sbrk(PG as isize).unwrap();

            space
                .protect(VirtualAddress::new(0), PG, Protection::READ | Protection::EXEC)
                .unwrap();
            let mut byte = [0u8];
            space.copy_in(&mut byte, VirtualAddress::new(0)).unwrap();
            space.check_execute(VirtualAddress::new(0)).unwrap();
        }
    }

    mod cow_scenario {
        use super::*;

        /// The full fork/write scenario: one page written by the parent,
        /// shared on fork, diverged by the child's write, then reclaimed by
        /// the parent's write.
        #[test]
        fn parent_and_child_diverge_correctly() {
            setup(32);
            let mut parent = new_space();
            parent.sbrk(PG as isize).unwrap();
            parent.copy_out(VirtualAddress::new(0), b"A").unwrap();
            let original = parent.frame_address(VirtualAddress::new(0)).unwrap();

            let mut child = parent.duplicate().unwrap();

            // Child shares the parent's frame, read-only with COW.
            assert_eq!(child.frame_address(VirtualAddress::new(0)), Some(original));
            let flags = child.pte_flags(VirtualAddress::new(0)).unwrap();
            assert!(!flags.is_writable());
            assert!(flags.is_cow());

            // Child writes: it splits onto a fresh frame.
            child.copy_out(VirtualAddress::new(0), b"C").unwrap();
            let child_frame = child.frame_address(VirtualAddress::new(0)).unwrap();
            assert_ne!(child_frame, original);
            let flags = child.pte_flags(VirtualAddress::new(0)).unwrap();
            assert!(flags.is_writable());
            assert!(!flags.is_cow());

            // Parent writes: sole owner now, keeps the original frame.
            parent.copy_out(VirtualAddress::new(0), b"P").unwrap();
            assert_eq!(parent.frame_address(VirtualAddress::new(0)), Some(original));
            let flags = parent.pte_flags(VirtualAddress::new(0)).unwrap();
            assert!(flags.is_writable());
            assert!(!flags.is_cow());

            // The contents diverged.
            let mut byte = [0u8];
            child.copy_in(&mut byte, VirtualAddress::new(0)).unwrap();
            assert_eq!(&byte, b"C");
            parent.copy_in(&mut byte, VirtualAddress::new(0)).unwrap();
            assert_eq!(&byte, b"P");
        }

        /// Frame-count conservation across a fork/write/exit sequence.
        #[test]
        fn counts_are_conserved_throughout() {
            setup(32);
            let total = FrameTable::current().free_frames();
            let held = |frames: &FrameTable| {
                (0..frames.total_frames())
                    .filter(|i| frames.count(PhysicalAddress::new(i * PG)) > 0)
                    .count()
            };

            let frames = FrameTable::current();
            let mut parent = new_space();
            parent.sbrk(2 * PG as isize).unwrap();
            assert_eq!(held(frames) + frames.free_frames(), total);

            {
                let mut child = parent.duplicate().unwrap();
                assert_eq!(held(frames) + frames.free_frames(), total);

                child.copy_out(VirtualAddress::new(0), b"C").unwrap();
                assert_eq!(held(frames) + frames.free_frames(), total);
            }
            assert_eq!(held(frames) + frames.free_frames(), total);

            drop(parent);
            assert_eq!(frames.free_frames(), total);
        }
    }
}
