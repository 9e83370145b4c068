//! Mapped-region engine: one user block per region, obtained directly
//! from the OS. Freed blocks are pooled per order and handed out again
//! before anything fresh is mapped; growth prefers a page-granular
//! remap over copy.

use core::ptr::{null_mut, write_bytes};
use core::sync::atomic::Ordering;

use crate::diag;
use crate::dir;
use crate::heap::region_desc_new;
use crate::internal::{align_up, log2_ceil};
use crate::os;
use crate::stats;
use crate::types::*;

// pool-scan bound per request
const MAPSCAN_MAX: u32 = 80;
// reused blocks may be at most this factor larger than the request
const MAPSLACK: usize = 2;

#[inline]
pub unsafe fn mapped_usable(reg: *const Region) -> usize {
    (*reg).ulen
}

// Take a pooled region of at least `gross` bytes off `mapfre[order]`.
unsafe fn pool_take(hp: *mut Heap, order: u32, gross: usize) -> *mut Region {
    let h = &mut *hp;
    let mut prev: *mut Region = null_mut();
    let mut r = h.mapfre[order as usize];
    let mut scanned = 0;
    while !r.is_null() && scanned < MAPSCAN_MAX {
        if (*r).len >= gross && (*r).len <= gross * MAPSLACK {
            if prev.is_null() {
                h.mapfre[order as usize] = (*r).frenxt;
            } else {
                (*prev).frenxt = (*r).frenxt;
            }
            (*r).frenxt = null_mut();
            return r;
        }
        prev = r;
        scanned += 1;
        r = (*r).frenxt;
    }
    null_mut()
}

pub unsafe fn mapped_alloc(hp: *mut Heap, n: usize, align: usize, zero: bool, _tag: u32) -> *mut u8 {
    let h = &mut *hp;
    let over_align = align > os::page_size();
    let gross = os::page_align(n) + if over_align { align } else { 0 };
    let order = log2_ceil(gross);

    let mut reg: *mut Region = null_mut();
    if !over_align {
        reg = pool_take(hp, order, gross);
    }
    if !reg.is_null() {
        // pooled: memory still mapped, directory entries long gone
        let r = &mut *reg;
        r.gen += 1;
        r.age = 0;
        r.clr = false;
        stats::bump(&h.stat.regions_reused);
    } else {
        // fresh map, fresh or recycled descriptor
        reg = if !h.mapzero.is_null() {
            let r = h.mapzero;
            h.mapzero = (*r).frenxt;
            (*r).frenxt = null_mut();
            (*r).gen += 1;
            r
        } else {
            region_desc_new(hp)
        };
        if reg.is_null() {
            oom(h, n);
            return null_mut();
        }
        let user = os::map(gross);
        if user.is_null() {
            // descriptor back to the zero pool
            (*reg).frenxt = h.mapzero;
            h.mapzero = reg;
            oom(h, n);
            return null_mut();
        }
        let r = &mut *reg;
        r.user = user;
        r.len = gross;
        r.order = log2_ceil(gross);
        r.clr = true;
        r.age = 0;
        stats::bump(&h.stat.regions_created);
    }
    let r = &mut *reg;
    r.typ.store(REG_MAPPED, Ordering::Release);
    r.hid = h.id;
    r.ulen = n;
    r.aofs = if over_align {
        align_up(r.user as usize, align) - r.user as usize
    } else {
        0
    };
    r.mstate.store(CEL_USED, Ordering::Release);
    if !dir::dir_insert(hp, reg, r.user, r.len) {
        os::unmap(r.user, r.len);
        r.user = null_mut();
        r.len = 0;
        r.typ.store(REG_NONE, Ordering::Release);
        r.frenxt = h.mapzero;
        h.mapzero = reg;
        oom(h, n);
        return null_mut();
    }
    let p = r.user.add(r.aofs);
    if zero && !r.clr {
        write_bytes(p, 0, n);
    }
    stats::bump(&h.stat.mapped_allocs);
    p
}

unsafe fn oom(h: &mut Heap, n: usize) {
    diag::report(
        Some(&h.errs),
        diag::ERR_OOM,
        format_args!("mapped request of {} bytes", n),
    );
}

// Free on the owning heap: leave the directory, pool the block.
pub unsafe fn mapped_free_local(hp: *mut Heap, reg: *mut Region, p: *mut u8) -> bool {
    let h = &mut *hp;
    let r = &mut *reg;
    if p != r.user.add(r.aofs) {
        diag::report(
            Some(&h.errs),
            diag::ERR_INVALID_FREE,
            format_args!("ptr {:p} inside mapped region {}", p, r.id),
        );
        return false;
    }
    if r
        .mstate
        .compare_exchange(CEL_USED, CEL_LOC, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        diag::report(
            Some(&h.errs),
            diag::ERR_DOUBLE_FREE,
            format_args!("mapped region {} already freed", r.id),
        );
        return false;
    }
    dir::dir_remove(hp, reg, r.user, r.len);
    r.age = AGE_EMPTY;
    r.clr = false;
    r.frenxt = h.mapfre[r.order as usize];
    h.mapfre[r.order as usize] = reg;
    true
}

// Free from a foreign thread: mark only; the owner's next trim scan
// removes the directory entries and pools the block.
pub unsafe fn mapped_free_remote_mark(
    reg: *mut Region,
    p: *mut u8,
    errs: Option<&diag::ErrCounts>,
) -> bool {
    let r = &*reg;
    if p != r.user.add(r.aofs) {
        diag::report(
            errs,
            diag::ERR_INVALID_FREE,
            format_args!("ptr {:p} inside mapped region {}", p, r.id),
        );
        return false;
    }
    if r
        .mstate
        .compare_exchange(CEL_USED, CEL_REM, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        diag::report(
            errs,
            diag::ERR_DOUBLE_FREE,
            format_args!("mapped region {} already freed", r.id),
        );
        return false;
    }
    true
}

// The owner reclaims a remotely freed block during its trim scan.
pub unsafe fn mapped_reclaim(hp: *mut Heap, reg: *mut Region) {
    let h = &mut *hp;
    let r = &mut *reg;
    if r
        .mstate
        .compare_exchange(CEL_REM, CEL_LOC, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return;
    }
    dir::dir_remove(hp, reg, r.user, r.len);
    r.age = AGE_EMPTY;
    r.clr = false;
    r.frenxt = h.mapfre[r.order as usize];
    h.mapfre[r.order as usize] = reg;
}

// Page-granular in-place-or-move growth (and substantial shrink) for a
// locally owned, unaligned-offset block. Null means the old block is
// intact and the caller falls back to allocate-copy-free.
pub unsafe fn mapped_grow(hp: *mut Heap, reg: *mut Region, newn: usize) -> *mut u8 {
    let r = &mut *reg;
    debug_assert!(r.aofs == 0);
    let newgross = os::page_align(newn);
    if newgross == r.len {
        r.ulen = newn;
        return r.user;
    }
    dir::dir_remove(hp, reg, r.user, r.len);
    let q = os::remap(r.user, r.len, r.ulen, newgross);
    if q.is_null() {
        // old mapping is intact on failure
        if !dir::dir_insert(hp, reg, r.user, r.len) {
            diag::report(
                Some(&(*hp).errs),
                diag::ERR_INTERNAL,
                format_args!("mapped region {}: lost directory range", r.id),
            );
        }
        return null_mut();
    }
    r.user = q;
    r.len = newgross;
    r.order = log2_ceil(newgross);
    r.ulen = newn;
    r.clr = false;
    if !dir::dir_insert(hp, reg, r.user, r.len) {
        // block is live but unreachable for frees; report and keep going
        diag::report(
            Some(&(*hp).errs),
            diag::ERR_INTERNAL,
            format_args!("mapped region {}: lost directory range", r.id),
        );
    }
    q
}
