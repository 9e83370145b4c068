//! Dispatch façade: the malloc-shaped entry points. Each call resolves
//! the thread's descriptor, clears its status, takes the bound heap's
//! lock for the duration of the call, and routes the request to the
//! mini, bump, slab or mapped engine.

use core::ptr::{copy_nonoverlapping, null_mut};
use core::sync::atomic::Ordering;

use log::debug;

use crate::bump::{grain_alloc, grain_free, grain_usable, mini_create};
use crate::diag;
use crate::dir::{gdir_lookup, ldir_lookup};
use crate::heap;
use crate::init;
use crate::internal::{align_up, mul_overflow, spin_lock, spin_unlock};
use crate::mapped;
use crate::options;
use crate::os;
use crate::remote::{remote_flush_all, remote_route};
use crate::slab;
use crate::stats;
use crate::types::*;

#[cfg(unix)]
const ENOMEM_CODE: i32 = libc::ENOMEM;
#[cfg(windows)]
const ENOMEM_CODE: i32 = 12;

// requests beyond this fail before any size arithmetic can wrap
const MAX_REQUEST: usize = 1 << 46;

/* -----------------------------------------------------------
  The zero block
  One static 16-byte block shared by every zero-length request;
  releasing it any number of times is a no-op.
----------------------------------------------------------- */

#[repr(align(16))]
struct ZeroBlk {
    _b: [u8; 16],
}

static ZERO_BLK: ZeroBlk = ZeroBlk { _b: [0; 16] };

#[inline]
pub fn zero_block() -> *mut u8 {
    &ZERO_BLK as *const ZeroBlk as *mut u8
}

#[inline]
fn set_oom_errno() {
    errno::set_errno(errno::Errno(ENOMEM_CODE));
}

unsafe fn desc_heap(d: *mut HeapDesc) -> *mut Heap {
    if d.is_null() {
        // thread-local storage is gone; share the list head
        let hp = heap::HEAPS.load(Ordering::Acquire);
        if !hp.is_null() {
            return hp;
        }
        return heap::heap_new();
    }
    if (*d).hb.is_null() {
        (*d).hb = heap::heap_bind();
    }
    (*d).hb
}

#[inline]
unsafe fn enter(tag: u32) -> *mut HeapDesc {
    let d = init::thread_desc();
    if !d.is_null() {
        (*d).status = 0;
        (*d).tag = tag;
    }
    d
}

#[inline]
unsafe fn set_status(d: *mut HeapDesc, kind: usize) {
    if !d.is_null() {
        (*d).status = kind as u32 + 1;
    }
}

/* -----------------------------------------------------------
  Allocation
----------------------------------------------------------- */

pub fn alloc(size: usize) -> *mut u8 {
    alloc_tag(size, 0)
}

pub fn alloc_tag(size: usize, tag: u32) -> *mut u8 {
    unsafe {
        let d = enter(tag);
        alloc_impl(d, size, false, tag)
    }
}

pub fn calloc(count: usize, size: usize) -> *mut u8 {
    calloc_tag(count, size, 0)
}

pub fn calloc_tag(count: usize, size: usize, tag: u32) -> *mut u8 {
    let mut total = 0;
    if mul_overflow(count, size, &mut total) {
        set_oom_errno();
        return null_mut();
    }
    unsafe {
        let d = enter(tag);
        alloc_impl(d, total, true, tag)
    }
}

unsafe fn alloc_impl(d: *mut HeapDesc, size: usize, zero: bool, tag: u32) -> *mut u8 {
    if options::trace() & options::TRACE_BASIC != 0 {
        debug!("yalloc: alloc {} zero {}", size, zero);
    }
    if size == 0 {
        return zero_block();
    }
    if size > MAX_REQUEST {
        oom(d, null_mut(), size);
        return null_mut();
    }
    // pre-heap: the very first small requests come from the mini
    if !d.is_null() && (*d).hb.is_null() && size <= MINI_MAX && (*d).minicnt < MINI_ALLOCS {
        if (*d).mini.is_null() {
            (*d).mini = mini_create();
        }
        if !(*d).mini.is_null() {
            let p = grain_alloc((*d).mini, size, zero, tag);
            if !p.is_null() {
                (*d).minicnt += 1;
                return p;
            }
        }
    }
    let hp = desc_heap(d);
    if hp.is_null() {
        oom(d, null_mut(), size);
        return null_mut();
    }
    let h = &mut *hp;
    spin_lock(&h.lock);
    stats::bump(&h.stat.allocs);
    let p = if size >= MMAP_LIM {
        mapped_path(hp, size, 0, zero, tag)
    } else {
        let clas = heap::len_clas(size);
        h.clascnts[clas as usize] = h.clascnts[clas as usize].wrapping_add(1);
        let mut p = null_mut();
        if h.claslens[clas as usize] as usize <= BUMP_MAX
            && h.clascnts[clas as usize] <= CLAS_THRESHOLD
        {
            p = heap::heap_bump_alloc(hp, size, zero, tag);
        }
        if p.is_null() {
            p = heap::heap_alloc_clas(hp, clas, size, zero, tag);
        }
        if p.is_null() {
            // saturated ring: a mapped block always works
            p = mapped_path(hp, size, 0, zero, tag);
        }
        p
    };
    spin_unlock(&h.lock);
    if p.is_null() {
        oom(d, hp, size);
    }
    p
}

// Mapped engine under the held heap lock; errno/status on the caller.
unsafe fn mapped_path(hp: *mut Heap, size: usize, align: usize, zero: bool, tag: u32) -> *mut u8 {
    mapped::mapped_alloc(hp, size, align, zero, tag)
}

unsafe fn oom(d: *mut HeapDesc, hp: *mut Heap, size: usize) {
    set_oom_errno();
    set_status(d, diag::ERR_OOM);
    if hp.is_null() {
        diag::report(None, diag::ERR_OOM, format_args!("request of {} bytes", size));
    }
    // mapped/slab paths already reported against the heap
}

/* -----------------------------------------------------------
  Aligned allocation
----------------------------------------------------------- */

pub fn aligned_alloc(align: usize, size: usize) -> *mut u8 {
    aligned_alloc_tag(align, size, 0)
}

pub fn aligned_alloc_tag(align: usize, size: usize, tag: u32) -> *mut u8 {
    if align == 0 || !align.is_power_of_two() {
        set_oom_errno();
        return null_mut();
    }
    unsafe {
        let d = enter(tag);
        if size == 0 {
            return zero_block();
        }
        if size > MAX_REQUEST || align > MAX_REQUEST {
            oom(d, null_mut(), size);
            return null_mut();
        }
        // a class whose stride is a multiple of the alignment hands out
        // aligned cells by construction
        if size < MMAP_LIM && align <= os::page_size() {
            let natural = heap::len_clas(size);
            let mut c = natural;
            while (c as usize) < CLASCNT && heap::clas_len(c) % align != 0 {
                c += 1;
            }
            let hp = desc_heap(d);
            if hp.is_null() {
                oom(d, null_mut(), size);
                return null_mut();
            }
            let h = &mut *hp;
            spin_lock(&h.lock);
            stats::bump(&h.stat.allocs);
            let mut p = null_mut();
            if c != natural && align <= 64 {
                // cheaper than padding to the next power of two: carve an
                // aligned cell from the natural class's frontier
                h.clascnts[natural as usize] = h.clascnts[natural as usize].wrapping_add(1);
                let pos = h.claspos[natural as usize] as usize;
                let reg = h.clasregs[natural as usize][pos];
                if !reg.is_null() {
                    p = slab::slab_alloc_aligned(reg, size, align, tag);
                    if !p.is_null() {
                        stats::bump(&h.stat.slab_allocs);
                    }
                }
            }
            if p.is_null() && (c as usize) < CLASCNT {
                h.clascnts[c as usize] = h.clascnts[c as usize].wrapping_add(1);
                p = heap::heap_alloc_clas(hp, c, size, false, tag);
            }
            if p.is_null() {
                p = mapped_path(hp, size, align, false, tag);
            }
            spin_unlock(&h.lock);
            if p.is_null() {
                oom(d, hp, size);
            }
            debug_assert!(p.is_null() || p as usize % align == 0);
            return p;
        }
        // above the page (or the slab limit): mapped with an offset
        let hp = desc_heap(d);
        if hp.is_null() {
            oom(d, null_mut(), size);
            return null_mut();
        }
        let h = &mut *hp;
        spin_lock(&h.lock);
        stats::bump(&h.stat.allocs);
        let p = mapped_path(hp, size, align, false, tag);
        spin_unlock(&h.lock);
        if p.is_null() {
            oom(d, hp, size);
        }
        p
    }
}

/* -----------------------------------------------------------
  Release
----------------------------------------------------------- */

/// # Safety
/// `p` must be null, the zero block, or a pointer obtained from this
/// allocator and not released since.
pub unsafe fn free(p: *mut u8) {
    free_tag(p, 0)
}

pub unsafe fn free_tag(p: *mut u8, tag: u32) {
    if p.is_null() || p == zero_block() {
        return;
    }
    let d = enter(tag);
    if options::trace() & options::TRACE_BASIC != 0 {
        debug!("yalloc: free {:p}", p);
    }
    let hp = if d.is_null() { null_mut() } else { (*d).hb };
    let mut reg = if hp.is_null() {
        null_mut()
    } else {
        ldir_lookup(hp, p)
    };
    if reg.is_null() {
        reg = gdir_lookup(p);
    }
    if reg.is_null() {
        // last resort: this thread's mini arena
        if !d.is_null() && !(*d).mini.is_null() {
            let m = (*d).mini;
            if p >= (*m).user && p < (*m).user.add((*m).len) {
                grain_free(m, p, None);
                return;
            }
        }
        set_status(d, diag::ERR_INVALID_FREE);
        diag::report(
            None,
            diag::ERR_INVALID_FREE,
            format_args!("ptr {:p} owned by no region", p),
        );
        return;
    }
    free_region(d, hp, reg, p);
}

unsafe fn free_region(d: *mut HeapDesc, hp: *mut Heap, reg: *mut Region, p: *mut u8) {
    match (*reg).typ.load(Ordering::Acquire) {
        REG_SLAB => {
            if !hp.is_null() && (*reg).hid == (*hp).id {
                let h = &mut *hp;
                spin_lock(&h.lock);
                if slab::slab_free_local(reg, p, Some(&h.errs)) {
                    heap::heap_note_free(hp, reg);
                    stats::bump(&h.stat.frees);
                    h.locfres += 1;
                    if h.locfres >= FLUSH_INTERVAL {
                        h.locfres = 0;
                        remote_flush_all(hp);
                    }
                    heap::heap_tick(hp);
                } else {
                    set_status(d, diag::ERR_INVALID_FREE);
                }
                spin_unlock(&h.lock);
            } else if !hp.is_null() {
                // foreign region: mark, then batch toward its owner
                let h = &mut *hp;
                spin_lock(&h.lock);
                match slab::slab_free_remote_mark(reg, p, Some(&h.errs)) {
                    Some(cel) => {
                        remote_route(hp, reg, cel);
                        stats::bump(&h.stat.frees);
                    }
                    None => set_status(d, diag::ERR_INVALID_FREE),
                }
                spin_unlock(&h.lock);
            } else {
                // no heap of our own to batch on: straight to the rembin
                if let Some(cel) = slab::slab_free_remote_mark(reg, p, None) {
                    slab::rembin_push(reg, &cel, 1, false);
                }
            }
        }
        REG_MAPPED => {
            if !hp.is_null() && (*reg).hid == (*hp).id {
                let h = &mut *hp;
                spin_lock(&h.lock);
                if mapped::mapped_free_local(hp, reg, p) {
                    stats::bump(&h.stat.frees);
                    heap::heap_tick(hp);
                } else {
                    set_status(d, diag::ERR_INVALID_FREE);
                }
                spin_unlock(&h.lock);
            } else {
                // owner reclaims on its next trim scan
                let errs = if hp.is_null() { None } else { Some(&(*hp).errs) };
                if !mapped::mapped_free_remote_mark(reg, p, errs) {
                    set_status(d, diag::ERR_INVALID_FREE);
                }
            }
        }
        REG_BUMP | REG_MINI => {
            let errs = if hp.is_null() { None } else { Some(&(*hp).errs) };
            if !grain_free(reg, p, errs) {
                set_status(d, diag::ERR_INVALID_FREE);
            }
        }
        _ => {
            set_status(d, diag::ERR_INVALID_FREE);
            diag::report(
                None,
                diag::ERR_INVALID_FREE,
                format_args!("ptr {:p} in a released region", p),
            );
        }
    }
}

/// # Safety
/// As for [`free`]; `size`, when non-zero, is checked against the
/// block's stored net length.
pub unsafe fn free_sized(p: *mut u8, size: usize) {
    if p.is_null() || p == zero_block() {
        return;
    }
    if size != 0 {
        let reg = lookup_any(p);
        // slab cells report their cell size through usable_size; the
        // sized check is against the net length the caller was given
        let stored = if reg.is_null() {
            0
        } else if (*reg).typ.load(Ordering::Acquire) == REG_SLAB {
            match slab::slab_cel_of(reg, p) {
                Some(cel) => slab::slab_netlen(reg, cel),
                None => 0,
            }
        } else {
            usable_size(p)
        };
        if stored != 0 && stored != size {
            diag::report(
                None,
                diag::ERR_SIZED_MISMATCH,
                format_args!("ptr {:p}: freed with {} stored {}", p, size, stored),
            );
        }
    }
    free(p);
}

/* -----------------------------------------------------------
  Usable size
----------------------------------------------------------- */

/// # Safety
/// `p` must be null, the zero block, or a live pointer from this
/// allocator; anything else is detected and reported, returning 0.
pub unsafe fn usable_size(p: *mut u8) -> usize {
    if p.is_null() || p == zero_block() {
        return 0;
    }
    let reg = lookup_any(p);
    if reg.is_null() {
        diag::report(
            None,
            diag::ERR_INVALID_FREE,
            format_args!("usable_size: ptr {:p} owned by no region", p),
        );
        return 0;
    }
    match (*reg).typ.load(Ordering::Acquire) {
        REG_SLAB => match slab::slab_cel_of(reg, p) {
            Some(_) => (*reg).cellen,
            None => 0,
        },
        REG_MAPPED => {
            if p == (*reg).user.add((*reg).aofs) {
                mapped::mapped_usable(reg)
            } else {
                0
            }
        }
        REG_BUMP | REG_MINI => grain_usable(reg, p).unwrap_or(0),
        _ => 0,
    }
}

unsafe fn lookup_any(p: *mut u8) -> *mut Region {
    let d = init::thread_desc();
    if !d.is_null() && !(*d).hb.is_null() {
        let reg = ldir_lookup((*d).hb, p);
        if !reg.is_null() {
            return reg;
        }
    }
    let reg = gdir_lookup(p);
    if !reg.is_null() {
        return reg;
    }
    if !d.is_null() && !(*d).mini.is_null() {
        let m = (*d).mini;
        if p >= (*m).user && p < (*m).user.add((*m).len) {
            return m;
        }
    }
    null_mut()
}

/* -----------------------------------------------------------
  Reallocate
----------------------------------------------------------- */

pub unsafe fn realloc(p: *mut u8, newn: usize) -> *mut u8 {
    realloc_tag(p, newn, 0)
}

/// # Safety
/// `p` must be null, the zero block, or a live pointer from this
/// allocator.
pub unsafe fn realloc_tag(p: *mut u8, newn: usize, tag: u32) -> *mut u8 {
    if p.is_null() || p == zero_block() {
        return alloc_tag(newn, tag);
    }
    if newn == 0 {
        free_tag(p, tag);
        return zero_block();
    }
    let d = enter(tag);
    let reg = lookup_any(p);
    if reg.is_null() {
        set_status(d, diag::ERR_INVALID_REALLOC);
        diag::report(
            None,
            diag::ERR_INVALID_REALLOC,
            format_args!("ptr {:p} owned by no region", p),
        );
        return null_mut();
    }
    let hp = if d.is_null() { null_mut() } else { (*d).hb };
    match (*reg).typ.load(Ordering::Acquire) {
        REG_SLAB => {
            let cel = match slab::slab_cel_of(reg, p) {
                Some(c) => c,
                None => {
                    set_status(d, diag::ERR_INVALID_REALLOC);
                    diag::report(
                        None,
                        diag::ERR_INVALID_REALLOC,
                        format_args!("ptr {:p} not a cell of slab {}", p, (*reg).id),
                    );
                    return null_mut();
                }
            };
            let cellen = (*reg).cellen;
            let oldnet = slab::slab_netlen(reg, cel);
            // still fits, and the shrink is not substantial: keep it
            if newn <= cellen && newn.saturating_mul(4) >= cellen {
                if !(*reg).userlen.is_null() && (*reg).hid == heap_id(hp) {
                    *(*reg).userlen.add(cel as usize) = newn as u32;
                }
                note_realloc(hp);
                return p;
            }
            // fresh cell, copy, then release the old one (the copy comes
            // before any remote-free mark)
            let q = alloc_impl(d, newn, false, tag);
            if q.is_null() {
                return null_mut();
            }
            let keep = if oldnet < newn { oldnet } else { newn };
            copy_nonoverlapping(p, q, keep);
            free_region(d, hp, reg, p);
            note_realloc(hp);
            q
        }
        REG_MAPPED => {
            let ulen = (*reg).ulen;
            let gross = (*reg).len - (*reg).aofs;
            if newn <= gross && newn.saturating_mul(2) >= gross {
                if !hp.is_null() && (*reg).hid == (*hp).id {
                    spin_lock(&(*hp).lock);
                    (*reg).ulen = newn;
                    spin_unlock(&(*hp).lock);
                }
                note_realloc(hp);
                return p;
            }
            if !hp.is_null() && (*reg).hid == (*hp).id && (*reg).aofs == 0 {
                spin_lock(&(*hp).lock);
                let q = if newn >= MMAP_LIM {
                    mapped::mapped_grow(hp, reg, newn)
                } else {
                    null_mut() // shrinking below the mapped limit: move to a slab
                };
                spin_unlock(&(*hp).lock);
                if !q.is_null() {
                    note_realloc(hp);
                    return q;
                }
            }
            // remote, offset or cross-limit: fresh block, copy, free
            let q = alloc_impl(d, newn, false, tag);
            if q.is_null() {
                return null_mut();
            }
            let keep = if ulen < newn { ulen } else { newn };
            copy_nonoverlapping(p, q, keep);
            free_region(d, hp, reg, p);
            note_realloc(hp);
            q
        }
        REG_BUMP | REG_MINI => {
            let oldnet = match grain_usable(reg, p) {
                Some(n) => n,
                None => {
                    set_status(d, diag::ERR_INVALID_REALLOC);
                    diag::report(
                        None,
                        diag::ERR_INVALID_REALLOC,
                        format_args!("ptr {:p} not live in bump {}", p, (*reg).id),
                    );
                    return null_mut();
                }
            };
            // room within the granules already held
            if newn <= align_up(if oldnet == 0 { 1 } else { oldnet }, MINI_GRAIN) {
                note_realloc(hp);
                return p;
            }
            let q = alloc_impl(d, newn, false, tag);
            if q.is_null() {
                return null_mut();
            }
            let keep = if oldnet < newn { oldnet } else { newn };
            copy_nonoverlapping(p, q, keep);
            free_region(d, hp, reg, p);
            note_realloc(hp);
            q
        }
        _ => {
            set_status(d, diag::ERR_INVALID_REALLOC);
            diag::report(
                None,
                diag::ERR_INVALID_REALLOC,
                format_args!("ptr {:p} in a released region", p),
            );
            null_mut()
        }
    }
}

#[inline]
unsafe fn heap_id(hp: *mut Heap) -> u32 {
    if hp.is_null() {
        u32::max_value()
    } else {
        (*hp).id
    }
}

#[inline]
unsafe fn note_realloc(hp: *mut Heap) {
    if !hp.is_null() {
        stats::bump(&(*hp).stat.reallocs);
    }
}

/* -----------------------------------------------------------
  Maintenance
----------------------------------------------------------- */

// Flush pending remote frees and trim this thread's heap; `force`
// walks empty regions all the way back to the OS.
pub fn collect(force: bool) {
    unsafe {
        let d = init::thread_desc();
        if d.is_null() || (*d).hb.is_null() {
            return;
        }
        let hp = (*d).hb;
        spin_lock(&(*hp).lock);
        heap::heap_collect(hp, force);
        spin_unlock(&(*hp).lock);
    }
}

// Last error of the calling thread (one of the diag kinds + 1, 0 ok).
pub fn status() -> u32 {
    unsafe {
        let d = init::thread_desc();
        if d.is_null() {
            0
        } else {
            (*d).status
        }
    }
}
