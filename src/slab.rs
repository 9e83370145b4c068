//! Slab engine: cell allocation and release within one fixed-cell
//! region. Every cell carries an atomic state byte; all transitions are
//! acquire-release compare-swaps, so a torn double free is detected
//! rather than corrupting a bin.
//!
//! Local operations run under the owning heap's lock. The remote bin is
//! the only cross-thread surface: senders append and the owner drains,
//! both under the region lock.

use core::ptr::{copy_nonoverlapping, null_mut, write_bytes};
use core::sync::atomic::{AtomicU8, Ordering};

use crate::diag;
use crate::internal::{align_up, spin_lock, spin_trylock, spin_unlock};
use crate::os;
use crate::types::*;

#[inline]
pub unsafe fn cel_state(reg: *const Region, cel: u32) -> &'static AtomicU8 {
    &*((*reg).state.add(cel as usize) as *const AtomicU8)
}

#[inline]
unsafe fn cel_cas(reg: *const Region, cel: u32, old: u8, new: u8) -> Result<u8, u8> {
    match cel_state(reg, cel).compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire) {
        Ok(v) => Ok(v),
        Err(v) => Err(v),
    }
}

// Does the region have a free cell without creating anything?
#[inline]
pub unsafe fn slab_has_space(reg: *const Region) -> bool {
    let r = &*reg;
    r.binpos > 0
        || r.inipos.load(Ordering::Relaxed) < r.celcnt
        || r.rbinpos.load(Ordering::Acquire) > 0
}

#[inline]
pub unsafe fn slab_is_empty(reg: *const Region) -> bool {
    let r = &*reg;
    r.binpos + r.rbinpos.load(Ordering::Acquire) == r.inipos.load(Ordering::Relaxed)
}

/* -----------------------------------------------------------
  Metadata block
  [ state bytes | local bin | net lengths | caller tags ]
  sized at region creation, one map per region.
----------------------------------------------------------- */

pub fn slab_meta_len(celcnt: u32, cellen: usize, tags: bool) -> usize {
    let n = celcnt as usize;
    let mut len = align_up(n, 8); // state bytes, then u32 arrays
    len += 4 * n; // bin
    if cellen > NOLEN_MAX {
        len += 4 * n; // userlen
    }
    if tags {
        len += 4 * n;
    }
    len
}

// Wire up the metadata pointers into a zeroed meta block.
pub unsafe fn slab_setup(reg: *mut Region, tags: bool) {
    let r = &mut *reg;
    let n = r.celcnt as usize;
    let mut p = r.meta;
    r.state = p;
    p = p.add(align_up(n, 8));
    r.bin = p as *mut u32;
    p = p.add(4 * n);
    if r.cellen > NOLEN_MAX {
        r.userlen = p as *mut u32;
        p = p.add(4 * n);
    } else {
        r.userlen = null_mut();
    }
    r.tags = if tags { p as *mut u32 } else { null_mut() };
}

/* -----------------------------------------------------------
  Allocation
  Bin first, then the never-allocated frontier, then a drain
  of the remote bin. "None" sends the caller to the next ring
  slot.
----------------------------------------------------------- */

pub unsafe fn slab_alloc(reg: *mut Region, n: usize, zero: bool, tag: u32) -> *mut u8 {
    let r = &mut *reg;
    debug_assert!(n <= r.cellen);
    let cel;
    let mut fresh = false;
    if r.binpos > 0 {
        r.binpos -= 1;
        cel = *r.bin.add(r.binpos as usize);
        if let Err(got) = cel_cas(reg, cel, CEL_LOC, CEL_USED) {
            diag::report(
                None,
                diag::ERR_INTERNAL,
                format_args!("slab {}: bin cell {} state {} not local-free", r.id, cel, got),
            );
            return null_mut();
        }
    } else if r.inipos.load(Ordering::Relaxed) < r.celcnt {
        cel = r.inipos.load(Ordering::Relaxed);
        r.inipos.store(cel + 1, Ordering::Release);
        fresh = true;
        if let Err(got) = cel_cas(reg, cel, CEL_NONE, CEL_USED) {
            diag::report(
                None,
                diag::ERR_INTERNAL,
                format_args!("slab {}: frontier cell {} state {} not virgin", r.id, cel, got),
            );
            return null_mut();
        }
    } else if r.rbinpos.load(Ordering::Acquire) > 0 {
        match slab_drain(reg) {
            Some(c) => cel = c,
            None => return null_mut(),
        }
    } else {
        return null_mut();
    }
    r.age = 0;
    let p = r.user.add(cel as usize * r.cellen);
    if !r.userlen.is_null() {
        *r.userlen.add(cel as usize) = n as u32;
    }
    if !r.tags.is_null() {
        *r.tags.add(cel as usize) = tag;
    }
    if zero && !(fresh && r.clr) {
        write_bytes(p, 0, n);
    }
    p
}

// Move the remote bin into the local bin, handing the last-entered
// cell straight to the caller. Region lock held for the copy only.
unsafe fn slab_drain(reg: *mut Region) -> Option<u32> {
    let r = &mut *reg;
    spin_lock(&r.lock);
    let n = r.rbinpos.load(Ordering::Relaxed) as usize;
    if n == 0 {
        spin_unlock(&r.lock);
        return None;
    }
    let rem = r.rembin.load(Ordering::Relaxed);
    for i in 0..n - 1 {
        let cel = *rem.add(i);
        if let Err(got) = cel_cas(reg, cel, CEL_REM, CEL_LOC) {
            diag::report(
                None,
                diag::ERR_INTERNAL,
                format_args!("slab {}: drain cell {} state {} not remote-free", r.id, cel, got),
            );
            continue;
        }
        *r.bin.add(r.binpos as usize) = cel;
        r.binpos += 1;
    }
    let last = *rem.add(n - 1);
    let got = cel_cas(reg, last, CEL_REM, CEL_USED);
    r.rbinpos.store(0, Ordering::Release);
    spin_unlock(&r.lock);
    match got {
        Ok(_) => Some(last),
        Err(v) => {
            diag::report(
                None,
                diag::ERR_INTERNAL,
                format_args!("slab {}: drain cell {} state {} not remote-free", r.id, last, v),
            );
            None
        }
    }
}

/* -----------------------------------------------------------
  Aligned allocation
  Carve from the frontier: skipped cells go through 0->1->2
  onto the bin so accounting stays intact, the target stays 1.
----------------------------------------------------------- */

const ALIGN_SKIP_MAX: u32 = 64;

pub unsafe fn slab_alloc_aligned(reg: *mut Region, n: usize, align: usize, tag: u32) -> *mut u8 {
    let r = &mut *reg;
    debug_assert!(align.is_power_of_two());
    let start = r.inipos.load(Ordering::Relaxed);
    let mut target = start;
    loop {
        if target >= r.celcnt || target - start > ALIGN_SKIP_MAX {
            return null_mut();
        }
        let addr = r.user as usize + target as usize * r.cellen;
        if addr % align == 0 {
            break;
        }
        target += 1;
    }
    for cel in start..target {
        if cel_cas(reg, cel, CEL_NONE, CEL_USED).is_err() || cel_cas(reg, cel, CEL_USED, CEL_LOC).is_err() {
            diag::report(
                None,
                diag::ERR_INTERNAL,
                format_args!("slab {}: aligned skip cell {} not virgin", r.id, cel),
            );
            return null_mut();
        }
        *r.bin.add(r.binpos as usize) = cel;
        r.binpos += 1;
    }
    if cel_cas(reg, target, CEL_NONE, CEL_USED).is_err() {
        diag::report(
            None,
            diag::ERR_INTERNAL,
            format_args!("slab {}: aligned cell {} not virgin", r.id, target),
        );
        return null_mut();
    }
    r.inipos.store(target + 1, Ordering::Release);
    r.age = 0;
    if !r.userlen.is_null() {
        *r.userlen.add(target as usize) = n as u32;
    }
    if !r.tags.is_null() {
        *r.tags.add(target as usize) = tag;
    }
    r.user.add(target as usize * r.cellen)
}

/* -----------------------------------------------------------
  Release
----------------------------------------------------------- */

// Cell index of a pointer, or None when it is not on a cell boundary
// or beyond the frontier.
#[inline]
pub unsafe fn slab_cel_of(reg: *const Region, p: *const u8) -> Option<u32> {
    let r = &*reg;
    let ofs = p as usize - r.user as usize;
    if ofs % r.cellen != 0 {
        return None;
    }
    let cel = (ofs / r.cellen) as u32;
    if cel >= r.inipos.load(Ordering::Acquire) {
        return None;
    }
    Some(cel)
}

// Free by the owning thread (heap lock held). Returns false after a
// counted diagnostic.
pub unsafe fn slab_free_local(reg: *mut Region, p: *mut u8, errs: Option<&diag::ErrCounts>) -> bool {
    let r = &mut *reg;
    let cel = match slab_cel_of(reg, p) {
        Some(c) => c,
        None => {
            diag::report(
                errs,
                diag::ERR_INVALID_FREE,
                format_args!("ptr {:p} not a cell of slab {}", p, r.id),
            );
            return false;
        }
    };
    if let Err(got) = cel_cas(reg, cel, CEL_USED, CEL_LOC) {
        free_state_diag(reg, cel, got, errs);
        return false;
    }
    *r.bin.add(r.binpos as usize) = cel;
    r.binpos += 1;
    if r.binpos == r.inipos.load(Ordering::Relaxed) && r.rbinpos.load(Ordering::Acquire) == 0 {
        r.age = AGE_EMPTY;
    }
    true
}

// Mark a cell freed from a foreign thread. The caller routes the cell
// index to the remote-free router afterwards; nothing else of the
// region is touched here.
pub unsafe fn slab_free_remote_mark(
    reg: *mut Region,
    p: *mut u8,
    errs: Option<&diag::ErrCounts>,
) -> Option<u32> {
    let r = &*reg;
    let cel = match slab_cel_of(reg, p) {
        Some(c) => c,
        None => {
            diag::report(
                errs,
                diag::ERR_INVALID_FREE,
                format_args!("ptr {:p} not a cell of slab {}", p, r.id),
            );
            return None;
        }
    };
    if let Err(got) = cel_cas(reg, cel, CEL_USED, CEL_REM) {
        free_state_diag(reg, cel, got, errs);
        return None;
    }
    Some(cel)
}

// Distinct diagnostics per observed prior state, with the previous
// caller tag when tag tracking is on.
unsafe fn free_state_diag(reg: *const Region, cel: u32, got: u8, errs: Option<&diag::ErrCounts>) {
    let r = &*reg;
    let tag = if r.tags.is_null() { 0 } else { *r.tags.add(cel as usize) };
    match got {
        CEL_NONE => diag::report(
            errs,
            diag::ERR_INVALID_FREE,
            format_args!("slab {} cell {}: never allocated", r.id, cel),
        ),
        CEL_LOC => diag::report(
            errs,
            diag::ERR_DOUBLE_FREE,
            format_args!(
                "slab {} cell {}: already freed locally (state {} expected {}, tag {:#x})",
                r.id, cel, got, CEL_USED, tag
            ),
        ),
        CEL_REM => diag::report(
            errs,
            diag::ERR_DOUBLE_FREE,
            format_args!(
                "slab {} cell {}: already freed remotely (state {} expected {}, tag {:#x})",
                r.id, cel, got, CEL_USED, tag
            ),
        ),
        _ => diag::report(
            errs,
            diag::ERR_INTERNAL,
            format_args!("slab {} cell {}: state byte {}", r.id, cel, got),
        ),
    }
}

/* -----------------------------------------------------------
  Remote bin
  A separately mapped, geometrically grown index array behind
  an atomic pointer. Senders and the draining owner both hold
  the region lock; the lock is never nested with another.
----------------------------------------------------------- */

const REMBIN_MIN: u32 = 256;
const REMBIN_SPINS: u32 = 4000;

// Append cell indices under the region lock. `try_only` bounds the
// spin so a flusher can defer instead of waiting out a long drain.
pub unsafe fn rembin_push(reg: *mut Region, cels: *const u32, cnt: u32, try_only: bool) -> bool {
    let r = &mut *reg;
    if try_only {
        if !spin_trylock(&r.lock, REMBIN_SPINS) {
            return false;
        }
    } else {
        spin_lock(&r.lock);
    }
    let pos = r.rbinpos.load(Ordering::Relaxed);
    if pos + cnt > r.rbinlen {
        let mut newlen = if r.rbinlen == 0 { REMBIN_MIN } else { r.rbinlen * 2 };
        while newlen < pos + cnt {
            newlen *= 2;
        }
        let fresh = os::map(newlen as usize * 4) as *mut u32;
        if fresh.is_null() {
            spin_unlock(&r.lock);
            return false;
        }
        let old = r.rembin.load(Ordering::Relaxed);
        if pos > 0 {
            copy_nonoverlapping(old, fresh, pos as usize);
        }
        r.rembin.store(fresh, Ordering::Release);
        if !old.is_null() {
            os::unmap(old as *mut u8, r.rbinlen as usize * 4);
        }
        r.rbinlen = newlen;
    }
    let rem = r.rembin.load(Ordering::Relaxed);
    copy_nonoverlapping(cels, rem.add(pos as usize), cnt as usize);
    r.rbinpos.store(pos + cnt, Ordering::Release);
    spin_unlock(&r.lock);
    true
}

// Net length as stored for realloc/copy bounds; cells at or below the
// no-length threshold report the cell size.
#[inline]
pub unsafe fn slab_netlen(reg: *const Region, cel: u32) -> usize {
    let r = &*reg;
    if r.userlen.is_null() {
        r.cellen
    } else {
        *r.userlen.add(cel as usize) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::MaybeUninit;

    struct TestSlab {
        reg: Box<Region>,
        user_len: usize,
        meta_len: usize,
    }

    impl TestSlab {
        fn new(cellen: usize, celcnt: u32) -> TestSlab {
            let user_len = os::page_align(cellen * celcnt as usize);
            let meta_len = slab_meta_len(celcnt, cellen, false);
            let mut reg: Box<Region> = unsafe { Box::new(MaybeUninit::zeroed().assume_init()) };
            reg.typ.store(REG_SLAB, Ordering::Relaxed);
            reg.cellen = cellen;
            reg.celcnt = celcnt;
            reg.clr = true;
            reg.user = os::map(user_len);
            reg.meta = os::map(meta_len);
            reg.len = user_len;
            reg.metalen = meta_len;
            assert!(!reg.user.is_null() && !reg.meta.is_null());
            unsafe { slab_setup(&mut *reg, false) };
            TestSlab { reg, user_len, meta_len }
        }

        fn reg(&mut self) -> *mut Region {
            &mut *self.reg
        }
    }

    impl Drop for TestSlab {
        fn drop(&mut self) {
            os::unmap(self.reg.user, self.user_len);
            os::unmap(self.reg.meta, self.meta_len);
            let rem = self.reg.rembin.load(Ordering::Relaxed);
            if !rem.is_null() {
                os::unmap(rem as *mut u8, self.reg.rbinlen as usize * 4);
            }
        }
    }

    #[test]
    fn frontier_then_bin_cycle() {
        let mut s = TestSlab::new(24, 64);
        let reg = s.reg();
        unsafe {
            let a = slab_alloc(reg, 20, false, 0);
            let b = slab_alloc(reg, 24, false, 0);
            assert_eq!(b as usize - a as usize, 24);
            assert_eq!((*reg).inipos.load(Ordering::Relaxed), 2);
            assert!(slab_free_local(reg, b, None));
            assert_eq!((*reg).binpos, 1);
            // bin pop reuses the same address, state 2 -> 1
            let c = slab_alloc(reg, 24, false, 0);
            assert_eq!(c, b);
            assert_eq!((*reg).binpos, 0);
            assert_eq!(cel_state(reg, 1).load(Ordering::Relaxed), CEL_USED);
        }
    }

    #[test]
    fn double_free_is_counted_and_rejected() {
        let mut s = TestSlab::new(40, 16);
        let reg = s.reg();
        unsafe {
            let p = slab_alloc(reg, 33, false, 0);
            assert!(slab_free_local(reg, p, None));
            let before = diag::total(diag::ERR_DOUBLE_FREE);
            assert!(!slab_free_local(reg, p, None));
            assert!(diag::total(diag::ERR_DOUBLE_FREE) > before);
            // the first free's bin entry is still intact
            assert_eq!((*reg).binpos, 1);
        }
    }

    #[test]
    fn interior_pointer_rejected() {
        let mut s = TestSlab::new(32, 16);
        let reg = s.reg();
        unsafe {
            let p = slab_alloc(reg, 32, false, 0);
            let before = diag::total(diag::ERR_INVALID_FREE);
            assert!(!slab_free_local(reg, p.add(8), None));
            assert!(diag::total(diag::ERR_INVALID_FREE) > before);
            assert!(slab_free_local(reg, p, None));
        }
    }

    #[test]
    fn remote_mark_and_drain() {
        let mut s = TestSlab::new(64, 32);
        let reg = s.reg();
        unsafe {
            let mut ptrs = [null_mut(); 4];
            for slot in ptrs.iter_mut() {
                *slot = slab_alloc(reg, 64, false, 0);
            }
            // a foreign thread would mark and push; same steps here
            let mut cels = [0u32; 4];
            for (i, p) in ptrs.iter().enumerate() {
                cels[i] = slab_free_remote_mark(reg, *p, None).unwrap();
                assert_eq!(cel_state(reg, cels[i]).load(Ordering::Relaxed), CEL_REM);
            }
            assert!(rembin_push(reg, cels.as_ptr(), 4, false));
            assert_eq!((*reg).rbinpos.load(Ordering::Relaxed), 4);
            // frontier exhausted: force the drain path
            (*reg).inipos.store((*reg).celcnt, Ordering::Relaxed);
            let p = slab_alloc(reg, 64, false, 0);
            // last-entered remote cell comes back first
            assert_eq!(p, ptrs[3]);
            assert_eq!((*reg).binpos, 3);
            assert_eq!((*reg).rbinpos.load(Ordering::Relaxed), 0);
            assert_eq!(cel_state(reg, cels[0]).load(Ordering::Relaxed), CEL_LOC);
        }
    }

    #[test]
    fn aligned_carve_banks_skipped_cells() {
        let mut s = TestSlab::new(24, 128);
        let reg = s.reg();
        unsafe {
            // advance the frontier so the next cell is misaligned for 64
            while ((*reg).user as usize + (*reg).inipos.load(Ordering::Relaxed) as usize * 24) % 64 == 0 {
                slab_alloc(reg, 24, false, 0);
            }
            let before_ini = (*reg).inipos.load(Ordering::Relaxed);
            let p = slab_alloc_aligned(reg, 20, 64, 0);
            assert!(!p.is_null());
            assert_eq!(p as usize % 64, 0);
            let skipped = (*reg).inipos.load(Ordering::Relaxed) - before_ini - 1;
            assert_eq!((*reg).binpos, skipped);
        }
    }

    #[test]
    fn calloc_zeroes_reused_cells() {
        let mut s = TestSlab::new(48, 16);
        let reg = s.reg();
        unsafe {
            let p = slab_alloc(reg, 48, true, 0);
            write_bytes(p, 0xa5, 48);
            assert!(slab_free_local(reg, p, None));
            let q = slab_alloc(reg, 48, true, 0);
            assert_eq!(q, p);
            for i in 0..48 {
                assert_eq!(*q.add(i), 0);
            }
        }
    }
}
