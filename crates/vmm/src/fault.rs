//! Page-fault dispatch.
//!
//! The trap layer hands every user page fault to [`handle_page_fault`],
//! which classifies it and either resolves it (copy-on-write) so the
//! faulting instruction can retry, or reports it as fatal for the process
//! to be terminated. No fault is ever silently dropped.

use core::fmt;

use crate::{AddressSpace, AddressTranslator, FrameTable, PageEntry, PageNumber, VirtualAddress, arch};

/// The kind of access that faulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
    Execute,
}

impl fmt::Display for AccessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Execute => "execute",
        })
    }
}

/// Why a fault could not be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultCause {
    /// No valid mapping covers the faulting address.
    Unmapped,
    /// A valid mapping exists but forbids the attempted access.
    ProtectionViolation,
    /// Copy-on-write resolution needed a frame and none was available.
    OutOfMemory,
}

/// A fault that is fatal to the faulting process.
///
/// Carries enough information for the process-termination collaborator to
/// report the cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FatalFault {
    pub address: VirtualAddress,
    pub access: AccessKind,
    pub cause: FaultCause,
}

/// The result of dispatching one page fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The fault was resolved; the faulting instruction retries.
    Resumed,
    /// The fault is fatal; the process must be terminated.
    Fatal(FatalFault),
}

/// Classifies and resolves a page fault in `space` at `address`.
///
/// Every path either resolves the fault so the instruction can be retried,
/// or reports it as fatal exactly once.
pub fn handle_page_fault(
    space: &mut AddressSpace,
    address: VirtualAddress,
    access: AccessKind,
) -> FaultOutcome {
    let fatal = |cause| {
        FaultOutcome::Fatal(FatalFault {
            address,
            access,
            cause,
        })
    };

    let page = address.page_number();
    let Some(entry) = space.page_table().lookup(page) else {
        log::warn!("unmapped {access} fault at {address}");
        return fatal(FaultCause::Unmapped);
    };

    let flags = entry.flags();
    if flags.is_cow() && access == AccessKind::Write {
        return match resolve_cow_write(space, page, entry) {
            Ok(()) => FaultOutcome::Resumed,
            Err(cause) => {
                log::warn!("copy-on-write resolution failed at {address}: {cause:?}");
                fatal(cause)
            }
        };
    }

    if !flags.permits(access) {
        log::warn!("protection violation: {access} at {address}");
        return fatal(FaultCause::ProtectionViolation);
    }

    // The hardware should not fault on a permitted access. Resume and let
    // the instruction retry; a real problem will fault again with a cause.
    log::error!("spurious {access} fault at {address}: access is already permitted");
    FaultOutcome::Resumed
}

/// Resolves a write to a copy-on-write page.
///
/// If the faulting process is the sole owner of the frame, write access is
/// restored in place and nothing is copied. Otherwise the page is copied
/// into a fresh frame and the old frame's ownership count is dropped.
fn resolve_cow_write(
    space: &mut AddressSpace,
    page: PageNumber,
    entry: PageEntry,
) -> Result<(), FaultCause> {
    let frames = FrameTable::current();
    let old = entry.frame_address();

    let mut flags = entry.flags();
    flags.set_writable(true);
    flags.set_cow(false);

    if frames.count(old) == 1 {
        // The sibling already diverged or exited; just restore write access.
        log::trace!("cow fault on {page}: sole owner, restoring write access");
        let slot = space
            .page_table_mut()
            .entry_mut(page)
            .ok_or(FaultCause::Unmapped)?;
        slot.set_flags(flags);
        return Ok(());
    }

    let new = frames.allocate().map_err(|_| FaultCause::OutOfMemory)?;

    // Copy the full page into the private frame.
    let translator = AddressTranslator::current();
    unsafe {
        let src: *const u8 = translator.phys_to_ptr(old);
        let dst: *mut u8 = translator.phys_to_ptr(new);
        core::ptr::copy_nonoverlapping(src, dst, arch::PAGE_SIZE);
    }

    log::trace!("cow fault on {page}: copied {old} -> {new}");
    let slot = space
        .page_table_mut()
        .entry_mut(page)
        .ok_or(FaultCause::Unmapped)?;
    *slot = PageEntry::leaf(new, flags);
    frames.release(old);
    Ok(())
}
