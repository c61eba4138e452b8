//! Page table entry encoding.
//!
//! This is the only module that knows the hardware PTE format. Everything
//! else reasons in terms of the named accessors on [`PteFlags`] and the
//! typed [`PageEntry`] wrapper.
//!
//! The encoding is Sv39-shaped: flag bits occupy the low ten bits of the
//! entry, the physical page number sits above them. The copy-on-write
//! marker lives in one of the software-defined (RSW) bits, which the
//! hardware ignores.

use crate::{PhysicalAddress, arch, fault::AccessKind};

bitflags::bitflags! {
    /// An `mprotect`-style permission request.
    ///
    /// The numeric encodings are part of the syscall ABI and must not
    /// change.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Protection: usize {
        const READ = 0x1;
        const WRITE = 0x2;
        const EXEC = 0x4;
    }
}

impl Protection {
    /// No access of any kind (`PROT_NONE`).
    pub const NONE: Self = Self::empty();
}

/// Page table entry flags.
///
/// Typed wrapper over the raw flag word with named accessors. The `cow`
/// bit is software-defined; the rest match the paging hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PteFlags(usize);

impl PteFlags {
    /// Valid bit (bit 0).
    const VALID: usize = 1 << 0;

    /// Readable bit (bit 1).
    const READ: usize = 1 << 1;

    /// Writable bit (bit 2).
    const WRITE: usize = 1 << 2;

    /// Executable bit (bit 3).
    const EXECUTE: usize = 1 << 3;

    /// User-accessible bit (bit 4).
    const USER: usize = 1 << 4;

    /// Copy-on-write bit (bit 8, software-defined).
    const COW: usize = 1 << 8;

    /// All flag bits fit below the physical page number.
    pub(crate) const BITS: usize = 10;

    const MASK: usize = (1 << Self::BITS) - 1;

    /// Creates empty flags (entry not valid).
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Creates flags from a raw flag word.
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw & Self::MASK)
    }

    /// Returns the raw flag word.
    pub const fn to_raw(self) -> usize {
        self.0
    }

    /// Creates the flags for a user-visible leaf mapping with the given
    /// protection.
    ///
    /// The entry is always valid and user-accessible; a `PROT_NONE`
    /// request yields a valid entry with every access bit clear, which the
    /// hardware faults on (a leaf without access bits is malformed) while
    /// the walker can still tell it apart from an absent mapping.
    pub fn leaf(prot: Protection) -> Self {
        let mut flags = Self(Self::VALID | Self::USER);
        flags.set_readable(prot.contains(Protection::READ));
        flags.set_writable(prot.contains(Protection::WRITE));
        flags.set_executable(prot.contains(Protection::EXEC));
        flags
    }

    /// Rewrites the access bits of these flags from a protection request,
    /// leaving the copy-on-write marker untouched.
    ///
    /// A copy-on-write page is never hardware-writable; a requested write
    /// permission on such a page is deferred to the fault path.
    pub fn with_protection(self, prot: Protection) -> Self {
        let mut flags = Self::leaf(prot);
        if self.is_cow() {
            flags.set_cow(true);
            flags.set_writable(false);
        }
        flags
    }

    fn set_bit(&mut self, mask: usize, value: bool) {
        if value {
            self.0 |= mask;
        } else {
            self.0 &= !mask;
        }
    }

    /// Returns whether the valid bit is set.
    pub fn is_valid(self) -> bool {
        (self.0 & Self::VALID) != 0
    }

    /// Sets or clears the valid bit.
    pub fn set_valid(&mut self, valid: bool) {
        self.set_bit(Self::VALID, valid);
    }

    /// Returns whether the readable bit is set.
    pub fn is_readable(self) -> bool {
        (self.0 & Self::READ) != 0
    }

    /// Sets or clears the readable bit.
    pub fn set_readable(&mut self, readable: bool) {
        self.set_bit(Self::READ, readable);
    }

    /// Returns whether the writable bit is set.
    pub fn is_writable(self) -> bool {
        (self.0 & Self::WRITE) != 0
    }

    /// Sets or clears the writable bit.
    pub fn set_writable(&mut self, writable: bool) {
        self.set_bit(Self::WRITE, writable);
    }

    /// Returns whether the executable bit is set.
    pub fn is_executable(self) -> bool {
        (self.0 & Self::EXECUTE) != 0
    }

    /// Sets or clears the executable bit.
    pub fn set_executable(&mut self, executable: bool) {
        self.set_bit(Self::EXECUTE, executable);
    }

    /// Returns whether the user-accessible bit is set.
    pub fn is_user(self) -> bool {
        (self.0 & Self::USER) != 0
    }

    /// Sets or clears the user-accessible bit.
    pub fn set_user(&mut self, user: bool) {
        self.set_bit(Self::USER, user);
    }

    /// Returns whether the copy-on-write marker is set.
    pub fn is_cow(self) -> bool {
        (self.0 & Self::COW) != 0
    }

    /// Sets or clears the copy-on-write marker.
    pub fn set_cow(&mut self, cow: bool) {
        self.set_bit(Self::COW, cow);
    }

    /// Returns whether a user access of the given kind is permitted by
    /// these flags, exactly as the paging hardware would decide.
    pub fn permits(self, access: AccessKind) -> bool {
        if !self.is_valid() || !self.is_user() {
            return false;
        }
        match access {
            AccessKind::Read => self.is_readable(),
            AccessKind::Write => self.is_writable(),
            AccessKind::Execute => self.is_executable(),
        }
    }
}

impl Default for PteFlags {
    fn default() -> Self {
        Self::empty()
    }
}

/// A single page table entry.
///
/// Leaf entries name a physical frame; branch entries name the next-level
/// page table node by its arena handle. Both carry their flag word in the
/// low bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageEntry(usize);

impl PageEntry {
    /// An empty (invalid) entry.
    pub const INVALID: Self = Self(0);

    /// Creates a leaf entry mapping the given frame.
    ///
    /// The physical address must be page-aligned.
    pub fn leaf(frame: PhysicalAddress, flags: PteFlags) -> Self {
        debug_assert!(
            frame.is_aligned(arch::PAGE_SIZE),
            "physical address must be page-aligned"
        );
        let ppn = frame.as_usize() / arch::PAGE_SIZE;
        Self((ppn << PteFlags::BITS) | flags.to_raw())
    }

    /// Creates a branch entry pointing at the page table node with the
    /// given arena handle.
    pub(crate) fn branch(handle: usize) -> Self {
        let mut flags = PteFlags::empty();
        flags.set_valid(true);
        Self((handle << PteFlags::BITS) | flags.to_raw())
    }

    /// Returns the physical address of the mapped frame.
    ///
    /// Only meaningful for leaf entries.
    pub fn frame_address(self) -> PhysicalAddress {
        PhysicalAddress::new((self.0 >> PteFlags::BITS) * arch::PAGE_SIZE)
    }

    /// Returns the arena handle of the next-level node.
    ///
    /// Only meaningful for branch entries.
    pub(crate) fn branch_handle(self) -> usize {
        self.0 >> PteFlags::BITS
    }

    /// Returns the flags for this entry.
    pub fn flags(self) -> PteFlags {
        PteFlags::from_raw(self.0)
    }

    /// Sets the flags for this entry, preserving the frame.
    pub fn set_flags(&mut self, flags: PteFlags) {
        self.0 = (self.0 & !((1 << PteFlags::BITS) - 1)) | flags.to_raw();
    }

    /// Returns whether this entry is valid.
    pub fn is_valid(self) -> bool {
        self.flags().is_valid()
    }

    /// Clears this entry.
    pub fn clear(&mut self) {
        self.0 = 0;
    }

    /// Returns the raw entry word, as exposed to diagnostics.
    pub const fn as_usize(self) -> usize {
        self.0
    }
}

impl Default for PageEntry {
    fn default() -> Self {
        Self::INVALID
    }
}
