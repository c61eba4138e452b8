#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]

//! # Virtual Memory Manager (VMM)
//!
//! The virtual-memory subsystem of the kernel. It provides:
//!
//! - Per-process page tables with walk, map, unmap, and permission updates.
//! - Copy-on-write address-space duplication for `fork`.
//! - `mprotect`-style permission changes over page-rounded ranges.
//! - The page-fault dispatcher that resolves COW faults and classifies
//!   fatal ones.
//! - Software emulation for testing in non-kernel environments.

extern crate alloc;

mod address;
mod address_space;
mod arch;
mod fault;
mod frame_table;
mod numbers;
mod page_table;
mod pte;

pub use address::{AddressTranslator, PhysicalAddress, VirtualAddress};
pub use address_space::AddressSpace;
pub use fault::{AccessKind, FatalFault, FaultCause, FaultOutcome, handle_page_fault};
pub use frame_table::{FrameTable, VmError};
pub use numbers::{FrameNumber, PageNumber};
pub use page_table::PageTable;
pub use pte::{PageEntry, Protection, PteFlags};

pub use arch::PAGE_SIZE;
