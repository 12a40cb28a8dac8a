// This module owns the raw executable memory that compiled code lives in. Region maps a
// page-rounded block of read/write/execute memory through the operating system (mmap on
// unix, VirtualAlloc on windows) and unmaps it on drop. A region can be placed anywhere or
// pinned to a fixed virtual address; for fixed placements the mapping is requested at the
// exact address (MAP_FIXED_NOREPLACE on Linux, an address hint elsewhere) and rejected if
// the operating system hands back a different range, so an existing mapping is never
// clobbered. Writes go through raw pointers because the memory is shared with generated
// code and never borrowed as a Rust slice for longer than a single copy.

//! Executable memory regions.

use crate::core::config::Placement;
use crate::core::error::{AllocationError, AllocationResult};
use std::ptr::{self, NonNull};

/// A contiguous block of executable process memory.
///
/// The region is the sole owner of its mapping. It is `Send` so a manager can move
/// between threads, but never `Sync`: concurrent writes into the same region are the
/// host's to serialise.
#[derive(Debug)]
pub struct Region {
    base: NonNull<u8>,
    len: usize,
}

// SAFETY: the mapping is owned exclusively by this value and is not tied to the thread
// that created it.
unsafe impl Send for Region {}

impl Region {
    /// Map at least `capacity` bytes of executable memory according to `placement`.
    pub fn allocate(capacity: usize, placement: Placement) -> AllocationResult<Self> {
        if capacity == 0 {
            return Err(AllocationError::ZeroCapacity);
        }

        let page_size = page_size();
        let len = capacity
            .checked_add(page_size - 1)
            .ok_or(AllocationError::CapacityOverflow { capacity })?
            & !(page_size - 1);

        if let Placement::Fixed(address) = placement {
            if address == 0 || address & (page_size - 1) != 0 {
                return Err(AllocationError::MisalignedBase { address, page_size });
            }
        }

        let base = sys::map(len, placement.fixed_address())?;
        log::info!(
            "Mapped {} bytes of executable memory at {:#x} ({:?})",
            len,
            base.as_ptr() as usize,
            placement
        );

        Ok(Self { base, len })
    }

    /// Base address of the mapping.
    pub fn base(&self) -> usize {
        self.base.as_ptr() as usize
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    /// Mapped length in bytes (capacity rounded up to whole pages).
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether `address` falls inside the mapping.
    pub fn contains(&self, address: usize) -> bool {
        address >= self.base() && address - self.base() < self.len
    }

    /// Copy `bytes` into the region at `offset`. Returns `None` if the range does not fit.
    pub(crate) fn write(&self, offset: usize, bytes: &[u8]) -> Option<()> {
        let end = offset.checked_add(bytes.len())?;
        if end > self.len {
            return None;
        }
        // SAFETY: the destination range was bounds-checked against the mapping, which is
        // writable for its whole lifetime, and `bytes` cannot alias executable memory that
        // this region hands out only as addresses.
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), self.base.as_ptr().add(offset), bytes.len());
        }
        Some(())
    }

    /// Fill `len` bytes at `offset` with `byte`. Returns `None` if the range does not fit.
    pub(crate) fn fill(&self, offset: usize, len: usize, byte: u8) -> Option<()> {
        let end = offset.checked_add(len)?;
        if end > self.len {
            return None;
        }
        // SAFETY: bounds-checked as in `write`.
        unsafe {
            ptr::write_bytes(self.base.as_ptr().add(offset), byte, len);
        }
        Some(())
    }

    /// Copy `len` bytes starting at `offset` out of the region.
    pub fn read(&self, offset: usize, len: usize) -> Option<Vec<u8>> {
        let end = offset.checked_add(len)?;
        if end > self.len {
            return None;
        }
        let mut out = vec![0u8; len];
        // SAFETY: bounds-checked as in `write`; the mapping is always readable.
        unsafe {
            ptr::copy_nonoverlapping(self.base.as_ptr().add(offset), out.as_mut_ptr(), len);
        }
        Some(out)
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        // SAFETY: `base` and `len` describe a mapping created by `sys::map` that has not
        // been released yet.
        unsafe { sys::unmap(self.base, self.len) };
        log::info!("Released executable region at {:#x}", self.base());
    }
}

/// System page size.
pub fn page_size() -> usize {
    sys::page_size()
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod sys {
            use crate::core::error::{AllocationError, AllocationResult};
            use std::io::Error;
            use std::ptr::{self, NonNull};

            pub fn map(len: usize, fixed: Option<usize>) -> AllocationResult<NonNull<u8>> {
                let hint = fixed.map_or(ptr::null_mut(), |address| address as *mut libc::c_void);

                #[cfg(target_os = "linux")]
                let fixed_flags = libc::MAP_FIXED_NOREPLACE;
                #[cfg(not(target_os = "linux"))]
                let fixed_flags = 0;

                let mut flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
                if fixed.is_some() {
                    flags |= fixed_flags;
                }

                // SAFETY: anonymous private mapping; with MAP_FIXED_NOREPLACE (or a plain
                // hint) no existing mapping is replaced.
                let mmap = unsafe {
                    libc::mmap(
                        hint,
                        len,
                        libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                        flags,
                        -1,
                        0,
                    )
                };

                if mmap == libc::MAP_FAILED {
                    let source = Error::last_os_error();
                    return Err(match fixed {
                        Some(address) if source.raw_os_error() == Some(libc::EEXIST) => {
                            AllocationError::AddressUnavailable { address, len }
                        }
                        _ => AllocationError::Os { len, source },
                    });
                }

                if let Some(address) = fixed {
                    if mmap as usize != address {
                        // The kernel treated the address as a hint and placed us elsewhere.
                        // SAFETY: `mmap` is the mapping we just created.
                        unsafe { libc::munmap(mmap, len) };
                        return Err(AllocationError::AddressUnavailable { address, len });
                    }
                }

                NonNull::new(mmap.cast::<u8>()).ok_or(AllocationError::Os {
                    len,
                    source: Error::other("mmap returned a null mapping"),
                })
            }

            pub unsafe fn unmap(base: NonNull<u8>, len: usize) {
                // SAFETY: ensured by caller
                let ret = unsafe { libc::munmap(base.as_ptr().cast(), len) };
                debug_assert_eq!(ret, 0);
            }

            pub fn page_size() -> usize {
                // SAFETY: sysconf has no preconditions.
                let pagesize = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
                usize::try_from(pagesize)
                    .ok()
                    .filter(|size| size.is_power_of_two())
                    .unwrap_or(4096)
            }
        }
    } else if #[cfg(windows)] {
        mod sys {
            use crate::core::error::{AllocationError, AllocationResult};
            use std::io::Error;
            use std::ptr::{self, NonNull};
            use windows_sys::Win32::System::Memory::{
                MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE_READWRITE, VirtualAlloc,
                VirtualFree,
            };
            use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

            pub fn map(len: usize, fixed: Option<usize>) -> AllocationResult<NonNull<u8>> {
                let hint = fixed.map_or(ptr::null(), |address| address as *const _);

                // SAFETY: VirtualAlloc either commits a fresh range or fails; it never
                // replaces an existing allocation.
                let base = unsafe {
                    VirtualAlloc(hint, len, MEM_COMMIT | MEM_RESERVE, PAGE_EXECUTE_READWRITE)
                };

                match NonNull::new(base.cast::<u8>()) {
                    Some(base) => {
                        if let Some(address) = fixed {
                            if base.as_ptr() as usize != address {
                                // SAFETY: `base` is the allocation we just created.
                                unsafe { VirtualFree(base.as_ptr().cast(), 0, MEM_RELEASE) };
                                return Err(AllocationError::AddressUnavailable { address, len });
                            }
                        }
                        Ok(base)
                    }
                    None => Err(match fixed {
                        Some(address) => AllocationError::AddressUnavailable { address, len },
                        None => AllocationError::Os {
                            len,
                            source: Error::last_os_error(),
                        },
                    }),
                }
            }

            pub unsafe fn unmap(base: NonNull<u8>, _len: usize) {
                // SAFETY: ensured by caller
                let ret = unsafe { VirtualFree(base.as_ptr().cast(), 0, MEM_RELEASE) };
                debug_assert!(ret != 0);
            }

            pub fn page_size() -> usize {
                // SAFETY: GetSystemInfo fills the zeroed struct.
                unsafe {
                    let mut sysinfo: SYSTEM_INFO = std::mem::zeroed();
                    GetSystemInfo(&mut sysinfo);
                    sysinfo.dwPageSize as usize
                }
            }
        }
    } else {
        compile_error!("Unsupported target platform");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_rounds_to_pages() {
        let region = Region::allocate(100, Placement::Anywhere).unwrap();
        assert_eq!(region.len(), page_size());
        assert_eq!(region.base() % page_size(), 0);
        assert!(region.contains(region.base()));
        assert!(region.contains(region.base() + 99));
        assert!(!region.contains(region.base() + region.len()));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(matches!(
            Region::allocate(0, Placement::Anywhere),
            Err(AllocationError::ZeroCapacity)
        ));
    }

    #[test]
    fn test_capacity_overflow_rejected() {
        assert!(matches!(
            Region::allocate(usize::MAX, Placement::Anywhere),
            Err(AllocationError::CapacityOverflow { .. })
        ));
    }

    #[test]
    fn test_misaligned_fixed_base_rejected() {
        let err = Region::allocate(64, Placement::Fixed(0x1000_0001)).unwrap_err();
        assert!(matches!(err, AllocationError::MisalignedBase { address: 0x1000_0001, .. }));
    }

    #[test]
    fn test_write_read_and_bounds() {
        let region = Region::allocate(64, Placement::Anywhere).unwrap();
        region.write(0, &[0x90, 0x90, 0xC3]).unwrap();
        assert_eq!(region.read(0, 3).unwrap(), vec![0x90, 0x90, 0xC3]);

        region.fill(1, 2, 0xCC).unwrap();
        assert_eq!(region.read(0, 3).unwrap(), vec![0x90, 0xCC, 0xCC]);

        assert!(region.write(region.len() - 1, &[0, 0]).is_none());
        assert!(region.fill(region.len(), 1, 0).is_none());
        assert!(region.read(usize::MAX, 2).is_none());
    }
}
