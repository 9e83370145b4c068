//! Page-granular memory from the operating system: map, unmap, remap.
//! Everything the allocator hands out ultimately comes from here.

use core::ptr::null_mut;
use core::sync::atomic::{AtomicUsize, Ordering};

use log::warn;

use crate::internal::align_up;
use crate::stats;

// page size (initialized properly in `os_init`)
static OS_PAGE_SIZE: AtomicUsize = AtomicUsize::new(4096);

#[inline]
pub fn page_size() -> usize {
    OS_PAGE_SIZE.load(Ordering::Relaxed)
}

#[inline]
pub fn page_align(len: usize) -> usize {
    align_up(len, page_size())
}

#[cfg(unix)]
pub fn os_init() {
    let result = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if result > 0 {
        OS_PAGE_SIZE.store(result as usize, Ordering::Relaxed);
    }
}

#[cfg(windows)]
pub fn os_init() {
    use winapi::um::sysinfoapi::{GetSystemInfo, SYSTEM_INFO};
    let mut si: SYSTEM_INFO = Default::default();
    unsafe { GetSystemInfo(&mut si) };
    if si.dwPageSize > 0 {
        OS_PAGE_SIZE.store(si.dwPageSize as usize, Ordering::Relaxed);
    }
}

#[cfg(unix)]
pub fn pid() -> u32 {
    unsafe { libc::getpid() as u32 }
}

#[cfg(windows)]
pub fn pid() -> u32 {
    unsafe { winapi::um::processthreadsapi::GetCurrentProcessId() }
}

/* -----------------------------------------------------------
  Map / unmap
  `map` returns page-aligned zero-initialized memory or null.
  Lengths are rounded up to the page size here; callers pass
  the same gross length back to `unmap`.
----------------------------------------------------------- */

#[cfg(unix)]
pub fn map(len: usize) -> *mut u8 {
    if len == 0 {
        return null_mut();
    }
    let len = page_align(len);
    let p = unsafe {
        libc::mmap(
            null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if p == libc::MAP_FAILED {
        warn!("mmap failed: {}, len {}", errno::errno(), len);
        return null_mut();
    }
    stats::map_add(len);
    p as *mut u8
}

#[cfg(unix)]
pub fn unmap(p: *mut u8, len: usize) -> bool {
    if p.is_null() || len == 0 {
        return true;
    }
    let len = page_align(len);
    let err = unsafe { libc::munmap(p as *mut libc::c_void, len) } == -1;
    if err {
        warn!(
            "munmap failed: {}, addr {:p}, len {}",
            errno::errno(),
            p,
            len
        );
        return false;
    }
    stats::map_sub(len);
    true
}

#[cfg(windows)]
pub fn map(len: usize) -> *mut u8 {
    use winapi::um::memoryapi::VirtualAlloc;
    use winapi::um::winnt::{MEM_COMMIT, MEM_RESERVE, PAGE_READWRITE};
    if len == 0 {
        return null_mut();
    }
    let len = page_align(len);
    let p = unsafe { VirtualAlloc(null_mut(), len, MEM_RESERVE | MEM_COMMIT, PAGE_READWRITE) };
    if p.is_null() {
        warn!("VirtualAlloc failed, len {}", len);
        return null_mut();
    }
    stats::map_add(len);
    p as *mut u8
}

#[cfg(windows)]
pub fn unmap(p: *mut u8, len: usize) -> bool {
    use winapi::um::memoryapi::VirtualFree;
    use winapi::um::winnt::MEM_RELEASE;
    if p.is_null() || len == 0 {
        return true;
    }
    let len = page_align(len);
    let ok = unsafe { VirtualFree(p as *mut _, 0, MEM_RELEASE) } != 0;
    if !ok {
        warn!("VirtualFree failed, addr {:p}, len {}", p, len);
        return false;
    }
    stats::map_sub(len);
    true
}

/* -----------------------------------------------------------
  Remap
  Grow or shrink a mapping in place when the kernel allows it,
  otherwise move it. The first `old_net` bytes are preserved.
----------------------------------------------------------- */

#[cfg(target_os = "linux")]
pub fn remap(p: *mut u8, old_gross: usize, old_net: usize, new_gross: usize) -> *mut u8 {
    debug_assert!(old_net <= old_gross);
    let old_gross = page_align(old_gross);
    let new_gross = page_align(new_gross);
    if old_gross == new_gross {
        return p;
    }
    let q = unsafe {
        libc::mremap(
            p as *mut libc::c_void,
            old_gross,
            new_gross,
            libc::MREMAP_MAYMOVE,
        )
    };
    if q == libc::MAP_FAILED {
        warn!(
            "mremap failed: {}, addr {:p}, {} -> {}",
            errno::errno(),
            p,
            old_gross,
            new_gross
        );
        return null_mut();
    }
    if new_gross > old_gross {
        stats::map_add(new_gross - old_gross);
    } else {
        stats::map_sub(old_gross - new_gross);
    }
    q as *mut u8
}

// Portable fallback: allocate, copy the net bytes, release.
#[cfg(not(target_os = "linux"))]
pub fn remap(p: *mut u8, old_gross: usize, old_net: usize, new_gross: usize) -> *mut u8 {
    debug_assert!(old_net <= old_gross);
    let q = map(new_gross);
    if q.is_null() {
        return null_mut();
    }
    let keep = if old_net < new_gross { old_net } else { new_gross };
    unsafe { core::ptr::copy_nonoverlapping(p, q, keep) };
    unmap(p, old_gross);
    q
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_roundtrip() {
        os_init();
        let p = map(10_000);
        assert!(!p.is_null());
        assert_eq!(p as usize % page_size(), 0);
        // mapped memory arrives zeroed
        unsafe {
            assert_eq!(*p, 0);
            assert_eq!(*p.add(9_999), 0);
            *p = 0x5a;
        }
        assert!(unmap(p, 10_000));
    }

    #[test]
    fn remap_preserves_net() {
        os_init();
        let p = map(page_size());
        for i in 0..64 {
            unsafe { *p.add(i) = i as u8 };
        }
        let q = remap(p, page_size(), 64, 4 * page_size());
        assert!(!q.is_null());
        for i in 0..64 {
            assert_eq!(unsafe { *q.add(i) }, i as u8);
        }
        assert!(unmap(q, 4 * page_size()));
    }
}
