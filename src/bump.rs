//! Bump and mini engines: linear allocation in 16-byte granules with a
//! state byte and a net-length word per lead granule. Frees mark the
//! state for double-free detection but reclaim nothing; classes hot
//! enough to matter are promoted to slabs.
//!
//! The mini arena is the pre-heap variant, carved from the bootstrap
//! arena and anchored on the thread descriptor.

use core::mem::size_of;
use core::ptr::null_mut;
use core::sync::atomic::{AtomicU8, Ordering};

use crate::boot::boot_alloc;
use crate::diag;
use crate::dir;
use crate::internal::align_up;
use crate::types::*;

#[inline]
unsafe fn grain_state(reg: *const Region, grain: usize) -> &'static AtomicU8 {
    &*((*reg).state.add(grain) as *const AtomicU8)
}

#[inline]
unsafe fn grain_lens(reg: *const Region) -> *mut u16 {
    (*reg).bin as *mut u16
}

// meta = state byte per granule + u16 net length per granule
pub fn grain_meta_len(granules: usize) -> usize {
    align_up(granules, 2) + 2 * granules
}

pub unsafe fn grain_setup(reg: *mut Region, user: *mut u8, userlen: usize, meta: *mut u8) {
    let r = &mut *reg;
    let granules = userlen / MINI_GRAIN;
    r.user = user;
    r.len = userlen;
    r.meta = meta;
    r.metalen = grain_meta_len(granules);
    r.celcnt = granules as u32;
    r.cellen = MINI_GRAIN;
    r.state = meta;
    r.bin = meta.add(align_up(granules, 2)) as *mut u32; // u16 length words
    r.clr = true;
}

/* -----------------------------------------------------------
  Allocation / release
----------------------------------------------------------- */

pub unsafe fn grain_alloc(reg: *mut Region, n: usize, zero: bool, _tag: u32) -> *mut u8 {
    let r = &*reg;
    let need = align_up(if n == 0 { 1 } else { n }, MINI_GRAIN) / MINI_GRAIN;
    let pos = r.pos.load(Ordering::Relaxed);
    if pos + need > r.celcnt as usize {
        return null_mut();
    }
    if grain_state(reg, pos)
        .compare_exchange(CEL_NONE, CEL_USED, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        diag::report(
            None,
            diag::ERR_INTERNAL,
            format_args!("bump {}: granule {} not virgin", r.id, pos),
        );
        return null_mut();
    }
    *grain_lens(reg).add(pos) = n as u16;
    r.pos.store(pos + need, Ordering::Release);
    let p = r.user.add(pos * MINI_GRAIN);
    if zero && !r.clr {
        core::ptr::write_bytes(p, 0, n);
    }
    p
}

// Works from any thread: only the lead granule's state byte moves.
pub unsafe fn grain_free(reg: *mut Region, p: *mut u8, errs: Option<&diag::ErrCounts>) -> bool {
    let r = &*reg;
    let ofs = p as usize - r.user as usize;
    let grain = ofs / MINI_GRAIN;
    if ofs % MINI_GRAIN != 0 || grain >= r.pos.load(Ordering::Acquire) {
        diag::report(
            errs,
            diag::ERR_INVALID_FREE,
            format_args!("ptr {:p} not a block of bump {}", p, r.id),
        );
        return false;
    }
    match grain_state(reg, grain).compare_exchange(CEL_USED, CEL_LOC, Ordering::AcqRel, Ordering::Acquire)
    {
        Ok(_) => true,
        Err(CEL_NONE) => {
            // interior granule of a longer block
            diag::report(
                errs,
                diag::ERR_INVALID_FREE,
                format_args!("ptr {:p} inside a block of bump {}", p, r.id),
            );
            false
        }
        Err(got) => {
            diag::report(
                errs,
                diag::ERR_DOUBLE_FREE,
                format_args!("bump {} granule {}: state {} expected {}", r.id, grain, got, CEL_USED),
            );
            false
        }
    }
}

// Stored net length; None for a pointer that is not a live lead granule.
pub unsafe fn grain_usable(reg: *const Region, p: *const u8) -> Option<usize> {
    let r = &*reg;
    let ofs = p as usize - r.user as usize;
    let grain = ofs / MINI_GRAIN;
    if ofs % MINI_GRAIN != 0 || grain >= r.pos.load(Ordering::Acquire) {
        return None;
    }
    if grain_state(reg, grain).load(Ordering::Acquire) != CEL_USED {
        return None;
    }
    Some(*grain_lens(reg).add(grain) as usize)
}

/* -----------------------------------------------------------
  Mini arena
  Built from the bootstrap arena before the thread has a heap;
  registered in the global directory so foreign frees resolve.
----------------------------------------------------------- */

pub unsafe fn mini_create() -> *mut Region {
    let granules = MINI_LEN / MINI_GRAIN;
    let reg = boot_alloc(size_of::<Region>(), 64) as *mut Region;
    if reg.is_null() {
        return null_mut();
    }
    // directory-granule alignment is enough; the mini is not an OS map
    let user = boot_alloc(MINI_LEN, 1 << DIR_SHIFT);
    let meta = boot_alloc(grain_meta_len(granules), 8);
    if user.is_null() || meta.is_null() {
        return null_mut();
    }
    grain_setup(reg, user, MINI_LEN, meta);
    (*reg).typ.store(REG_MINI, Ordering::Release);
    if !dir::dir_insert(null_mut(), reg, user, MINI_LEN) {
        return null_mut();
    }
    reg
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os;
    use core::mem::MaybeUninit;

    struct TestBump {
        reg: Box<Region>,
        ulen: usize,
        mlen: usize,
    }

    impl TestBump {
        fn new(userlen: usize) -> TestBump {
            let mlen = grain_meta_len(userlen / MINI_GRAIN);
            let user = os::map(userlen);
            let meta = os::map(mlen);
            assert!(!user.is_null() && !meta.is_null());
            let mut reg: Box<Region> = unsafe { Box::new(MaybeUninit::zeroed().assume_init()) };
            unsafe { grain_setup(&mut *reg, user, userlen, meta) };
            reg.typ.store(REG_BUMP, Ordering::Relaxed);
            TestBump { reg, ulen: userlen, mlen }
        }

        fn reg(&mut self) -> *mut Region {
            &mut *self.reg
        }
    }

    impl Drop for TestBump {
        fn drop(&mut self) {
            os::unmap(self.reg.user, self.ulen);
            os::unmap(self.reg.meta, self.mlen);
        }
    }

    #[test]
    fn advances_in_granules() {
        let mut b = TestBump::new(1 << 12);
        let reg = b.reg();
        unsafe {
            let p = grain_alloc(reg, 20, false, 0);
            let q = grain_alloc(reg, 5, false, 0);
            // 20 bytes occupy two granules
            assert_eq!(q as usize - p as usize, 32);
            assert_eq!(grain_usable(reg, p), Some(20));
            assert_eq!(grain_usable(reg, q), Some(5));
            assert!(grain_free(reg, p, None));
            assert_eq!(grain_usable(reg, p), None);
        }
    }

    #[test]
    fn exhaustion_returns_null() {
        let mut b = TestBump::new(1 << 12); // 256 granules
        let reg = b.reg();
        unsafe {
            for _ in 0..256 {
                assert!(!grain_alloc(reg, 16, false, 0).is_null());
            }
            assert!(grain_alloc(reg, 16, false, 0).is_null());
        }
    }

    #[test]
    fn double_and_interior_free_detected() {
        let mut b = TestBump::new(1 << 12);
        let reg = b.reg();
        unsafe {
            let p = grain_alloc(reg, 40, false, 0);
            assert!(grain_free(reg, p, None));
            let before = diag::total(diag::ERR_DOUBLE_FREE);
            assert!(!grain_free(reg, p, None));
            assert!(diag::total(diag::ERR_DOUBLE_FREE) > before);
            // interior granule of the 40-byte block
            let before = diag::total(diag::ERR_INVALID_FREE);
            assert!(!grain_free(reg, p.add(16), None));
            assert!(diag::total(diag::ERR_INVALID_FREE) > before);
        }
    }
}
