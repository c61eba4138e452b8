//! Address types for physical and virtual memory management.
//!
//! This module provides architecture-independent wrappers around physical
//! and virtual addresses, plus the process-wide translator that turns a
//! physical address into a pointer the kernel can dereference.

use core::fmt;
use core::ops::{Add, Sub};

use crate::{FrameNumber, PageNumber, arch};

#[cfg(any(test, feature = "software-emulation"))]
use crate::arch::EmulatedMemory;

/// Translator for converting between physical addresses and usable pointers.
///
/// Two modes are supported:
/// - Hardware: all physical memory is direct-mapped at a fixed offset in
///   the kernel's virtual address space.
/// - Emulated: physical memory is a buffer owned by the test harness.
pub enum AddressTranslator {
    /// Hardware translation using a direct-map offset.
    Hardware { direct_map_offset: usize },
    /// Emulated translation using a simulated memory region.
    #[cfg(any(test, feature = "software-emulation"))]
    Emulated(EmulatedMemory),
}

impl AddressTranslator {
    /// Creates a new hardware translator with the given direct-map offset.
    pub const fn hardware(direct_map_offset: usize) -> Self {
        Self::Hardware { direct_map_offset }
    }

    /// Creates a new emulated translator with the given memory size.
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn emulated(size: usize) -> Self {
        Self::Emulated(EmulatedMemory::new(size))
    }

    /// Sets the global address translator.
    ///
    /// This function must be called exactly once during initialization.
    ///
    /// # Panics
    ///
    /// Panics if the translator has already been set.
    pub fn set_current(translator: AddressTranslator) {
        #[cfg(not(any(test, feature = "software-emulation")))]
        {
            if ADDRESS_TRANSLATOR.get().is_some() {
                panic!("address translator already set");
            }
            ADDRESS_TRANSLATOR.call_once(|| translator);
        }

        #[cfg(any(test, feature = "software-emulation"))]
        {
            ADDRESS_TRANSLATOR.with(|t| {
                if t.get().is_some() {
                    panic!("address translator already set");
                }
                t.call_once(|| translator);
            });
        }
    }

    /// Returns a reference to the current global address translator.
    ///
    /// # Panics
    ///
    /// Panics if the translator has not been set yet.
    pub fn current() -> &'static AddressTranslator {
        #[cfg(not(any(test, feature = "software-emulation")))]
        {
            ADDRESS_TRANSLATOR.get().expect(
                "address translator not set; call AddressTranslator::set_current during initialization",
            )
        }

        #[cfg(any(test, feature = "software-emulation"))]
        {
            ADDRESS_TRANSLATOR.with(|t| {
                // SAFETY: We leak the reference to make it 'static. This is safe because:
                // 1. In test mode, each thread has its own ADDRESS_TRANSLATOR
                // 2. Once set, it's never modified (spin::Once guarantees this)
                // 3. The thread-local lives for the entire duration of the thread
                unsafe {
                    &*(t.get().expect(
                        "address translator not set; call AddressTranslator::set_current during initialization",
                    ) as *const AddressTranslator)
                }
            })
        }
    }

    /// Returns the current global address translator if it has been set.
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn try_current() -> Option<&'static AddressTranslator> {
        ADDRESS_TRANSLATOR.with(|t| {
            t.get().map(|translator| {
                // SAFETY: Same reasoning as current().
                unsafe { &*(translator as *const AddressTranslator) }
            })
        })
    }

    /// Translates a physical address to a typed pointer.
    pub fn phys_to_ptr<T>(&self, phys: PhysicalAddress) -> *mut T {
        match self {
            Self::Hardware { direct_map_offset } => {
                phys.as_usize().wrapping_add(*direct_map_offset) as *mut T
            }
            #[cfg(any(test, feature = "software-emulation"))]
            Self::Emulated(mem) => mem.translate(phys.as_usize()) as *mut T,
        }
    }

    /// Translates a pointer back to a physical address.
    pub fn ptr_to_phys<T>(&self, ptr: *const T) -> PhysicalAddress {
        match self {
            Self::Hardware { direct_map_offset } => {
                PhysicalAddress::new((ptr as usize).wrapping_sub(*direct_map_offset))
            }
            #[cfg(any(test, feature = "software-emulation"))]
            Self::Emulated(mem) => PhysicalAddress::new(mem.ptr_to_phys(ptr as *const u8)),
        }
    }
}

/// Global address translator.
///
/// Initialized once during kernel startup (Hardware variant). In
/// test/software-emulation mode this is thread-local so each test has its
/// own emulated memory space.
#[cfg(not(any(test, feature = "software-emulation")))]
static ADDRESS_TRANSLATOR: spin::Once<AddressTranslator> = spin::Once::new();

#[cfg(any(test, feature = "software-emulation"))]
std::thread_local! {
    static ADDRESS_TRANSLATOR: spin::Once<AddressTranslator> = spin::Once::new();
}

/// Macro to define common address type functionality.
///
/// Generates the structure and methods shared by the physical and virtual
/// address types.
macro_rules! impl_address_common {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            /// Returns the raw address value.
            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }

            /// Checks if the address is aligned to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn is_aligned(self, align: usize) -> bool {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                self.0 & (align - 1) == 0
            }

            /// Aligns the address down to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn align_down(self, align: usize) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self(self.0 & !(align - 1))
            }

            /// Aligns the address up to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn align_up(self, align: usize) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self((self.0 + align - 1) & !(align - 1))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#x})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }

        impl From<usize> for $name {
            #[inline]
            fn from(addr: usize) -> Self {
                Self::new(addr)
            }
        }

        impl Add<usize> for $name {
            type Output = Self;

            #[inline]
            fn add(self, rhs: usize) -> Self::Output {
                Self::new(self.0 + rhs)
            }
        }

        impl Sub<usize> for $name {
            type Output = Self;

            #[inline]
            fn sub(self, rhs: usize) -> Self::Output {
                Self::new(self.0 - rhs)
            }
        }

        impl Sub<$name> for $name {
            type Output = usize;

            #[inline]
            fn sub(self, rhs: $name) -> Self::Output {
                self.0 - rhs.0
            }
        }
    };
}

impl_address_common!(
    PhysicalAddress,
    "A physical memory address.\n\n\
     Newtype over the raw representation of a physical address, with\n\
     alignment helpers and conversion to frame numbers."
);

impl PhysicalAddress {
    /// Creates a new physical address.
    ///
    /// # Panics
    ///
    /// Panics if the address exceeds the architecture's maximum physical
    /// address width.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        assert!(
            arch::validate_physical(addr),
            "physical address exceeds maximum width"
        );
        Self(addr)
    }

    /// Returns the corresponding frame number for this physical address.
    #[inline]
    pub fn frame_number(self) -> FrameNumber {
        FrameNumber::from(self)
    }
}

impl_address_common!(
    VirtualAddress,
    "A virtual memory address.\n\n\
     Newtype over the raw representation of a virtual address, with\n\
     alignment helpers, page-offset extraction, and conversion to page\n\
     numbers."
);

impl VirtualAddress {
    /// Creates a new virtual address.
    ///
    /// # Panics
    ///
    /// Panics if the address is not canonical for the architecture.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        assert!(arch::validate_virtual(addr), "address is not canonical");
        Self(addr)
    }

    /// Returns the byte offset of this address within its page.
    #[inline]
    pub const fn page_offset(self) -> usize {
        self.0 & (arch::PAGE_SIZE - 1)
    }

    /// Gets the corresponding page number for this virtual address.
    #[inline]
    pub fn page_number(self) -> PageNumber {
        PageNumber::from(self)
    }
}
