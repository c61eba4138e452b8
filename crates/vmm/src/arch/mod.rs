//! Architecture-specific paging geometry.
//!
//! This module conditionally selects either the hardware geometry for the
//! target CPU or a software scale model used for testing on arbitrary hosts.

// Use the riscv64 hardware geometry when targeting riscv64 and not testing
// or emulating.
#[cfg(target_arch = "riscv64")]
mod riscv64;
#[cfg(all(target_arch = "riscv64", not(test), not(feature = "software-emulation")))]
pub use riscv64::*;

// Use the software scale model ONLY when:
// - Running tests, OR
// - the software-emulation feature is explicitly enabled
#[cfg(any(test, feature = "software-emulation"))]
mod software;
#[cfg(any(test, feature = "software-emulation"))]
pub use software::*;
