//! Heap assembly: per-thread heaps, size-class induction, per-class
//! region rings, region creation and reuse, and the trim scan that ages
//! empty regions back to the OS.

use core::mem::size_of;
use core::ptr::{null_mut, write_bytes};
use core::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

use log::debug;

use crate::bump::{grain_alloc, grain_meta_len, grain_setup};
use crate::dir;
use crate::internal::{align_up, log2_ceil, log2_floor, spin_lock, spin_trylock, spin_unlock};
use crate::mapped;
use crate::options;
use crate::os;
use crate::remote::remote_flush_all;
use crate::slab;
use crate::stats;
use crate::types::*;

// Global heap list: push-only, CAS at head.
pub static HEAPS: AtomicPtr<Heap> = AtomicPtr::new(null_mut());
static HIDS: AtomicU32 = AtomicU32::new(0);

// initial directory-node arena carved out of the heap map
const DIRMEM_INIT: usize = 8 * size_of::<Dir2>();
// gross-length bounds for fresh slab regions
const REG_MIN_ORD: u32 = 16; // 64kb
const REG_MAX_ORD: u32 = 22; // 4mb
const ADDORD_MAX: u32 = 6;
const CELS_TARGET: usize = 64;

/* -----------------------------------------------------------
  Size classes
  0 is the zero request; 1..=5 exact small cells; then 4 steps
  per power-of-two octave; then one class per octave up to the
  mmap limit. Monotonic, and clas_len(c) >= n always.
----------------------------------------------------------- */

#[rustfmt::skip]
const SMALCLAS_TAB: [u8; 33] = [
    0,
    1, 1, 1, 1,
    2, 2, 2, 2,
    3, 3, 3, 3, 3, 3, 3, 3,
    4, 4, 4, 4, 4, 4, 4, 4,
    5, 5, 5, 5, 5, 5, 5, 5,
];

const SMALLENS: [usize; SMALCLAS as usize] = [0, 4, 8, 16, 24, 32];

pub fn len_clas(n: usize) -> u32 {
    debug_assert!(n < MMAP_LIM);
    if n <= 32 {
        return SMALCLAS_TAB[n] as u32;
    }
    let o = log2_floor(n - 1); // n in (2^o, 2^(o+1)]
    if o > MID_ORD_HI {
        return BIGCLAS + (o - BIG_ORD_LO);
    }
    let step = ((n - (1usize << o) - 1) >> (o - CLASBITS)) as u32;
    SMALCLAS + (o - MID_ORD_LO) * CLASSTEPS + step
}

pub fn clas_len(c: u32) -> usize {
    if c < SMALCLAS {
        return SMALLENS[c as usize];
    }
    if c >= BIGCLAS {
        return 1usize << (BIG_ORD_LO + (c - BIGCLAS) + 1);
    }
    let o = MID_ORD_LO + (c - SMALCLAS) / CLASSTEPS;
    let step = (c - SMALCLAS) % CLASSTEPS;
    (1usize << o) + ((step as usize + 1) << (o - CLASBITS))
}

/* -----------------------------------------------------------
  Heap creation and binding
----------------------------------------------------------- */

pub unsafe fn heap_new() -> *mut Heap {
    let body = align_up(size_of::<Heap>(), 64);
    let pool = REGPOOL * size_of::<Region>();
    let hlen = os::page_align(body + pool + DIRMEM_INIT);
    let mem = os::map(hlen);
    if mem.is_null() {
        return null_mut();
    }
    let hp = mem as *mut Heap;
    let h = &mut *hp;
    h.id = HIDS.fetch_add(1, Ordering::Relaxed);
    h.len = hlen;
    h.regs = mem.add(body) as *mut Region;
    h.regcnt = REGPOOL as u32;
    h.dirmem = mem.add(body + pool);
    h.dirlen = DIRMEM_INIT;
    for c in 0..CLASCNT {
        h.claslens[c] = clas_len(c as u32) as u32;
    }
    // publish: CAS at the list head
    loop {
        let head = HEAPS.load(Ordering::Acquire);
        h.nxt = head;
        if HEAPS
            .compare_exchange(head, hp, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            break;
        }
    }
    debug!("yalloc: heap {} created", h.id);
    hp
}

// Claim a heap for a binding thread: an unbound one from the list, or
// a fresh one. The caller does not hold any lock.
pub unsafe fn heap_bind() -> *mut Heap {
    let mut hp = HEAPS.load(Ordering::Acquire);
    while !hp.is_null() {
        let h = &*hp;
        if h.unbound.load(Ordering::Acquire) == 1 && spin_trylock(&h.lock, 100) {
            if h.unbound.swap(0, Ordering::AcqRel) == 1 {
                heap_reset(hp);
                spin_unlock(&h.lock);
                debug!("yalloc: heap {} reclaimed", h.id);
                return hp;
            }
            spin_unlock(&h.lock);
        }
        hp = h.nxt;
    }
    heap_new()
}

pub unsafe fn heap_unbind(hp: *mut Heap) {
    let h = &*hp;
    spin_lock(&h.lock);
    remote_flush_all(hp);
    spin_unlock(&h.lock);
    h.unbound.store(1, Ordering::Release);
}

// Clear the fast-path state after a heap changes hands. Releases no
// memory; aged-but-listed regions become fresh again.
pub unsafe fn heap_reset(hp: *mut Heap) {
    let h = &mut *hp;
    remote_flush_all(hp);
    for c in 0..CLASCNT {
        h.claspos[c] = 0;
        let mut msk = 0u32;
        let mut fre = 0u32;
        for slot in 0..CLASREGS {
            let reg = h.clasregs[c][slot];
            if reg.is_null() {
                continue;
            }
            if slab::slab_has_space(reg) {
                msk |= 1 << slot;
            }
            if slab::slab_is_empty(reg) {
                fre |= 1 << slot;
            }
        }
        h.clasmsk[c] = msk;
        h.cfremsk[c] = fre;
    }
    let mut reg = h.reglst;
    while !reg.is_null() {
        if (*reg).age == AGE_EMPTY {
            (*reg).age = 0;
        }
        reg = (*reg).nxt;
    }
}

/* -----------------------------------------------------------
  Region descriptors
----------------------------------------------------------- */

// A zero-initialized descriptor, pool-chunked; descriptors are never
// returned to the OS, only retagged and reused.
pub unsafe fn region_desc_new(hp: *mut Heap) -> *mut Region {
    let h = &mut *hp;
    if !h.regfre.is_null() {
        let r = h.regfre;
        h.regfre = (*r).frenxt;
        (*r).frenxt = null_mut();
        (*r).gen += 1;
        return r;
    }
    if h.regpos == h.regcnt {
        let chunk = os::map(REGPOOL * size_of::<Region>());
        if chunk.is_null() {
            return null_mut();
        }
        h.regs = chunk as *mut Region;
        h.regpos = 0;
    }
    let r = h.regs.add(h.regpos as usize);
    h.regpos += 1;
    (*r).id = h.regids;
    h.regids += 1;
    (*r).nxt = h.reglst;
    h.reglst = r;
    r
}

// Pop a drained region with retained memory big enough for `want`
// bytes from the per-order pools. Pooled regions all sit between the
// minimum and maximum region orders.
unsafe fn region_pool_take(hp: *mut Heap, want: usize) -> *mut Region {
    let h = &mut *hp;
    let mut lo = log2_ceil(want);
    if lo < REG_MIN_ORD {
        lo = REG_MIN_ORD;
    }
    for ord in lo..=REG_MAX_ORD + ADDORD_MAX {
        let r = h.freeregs[ord as usize];
        if !r.is_null() && (*r).len >= want {
            h.freeregs[ord as usize] = (*r).frenxt;
            (*r).frenxt = null_mut();
            return r;
        }
    }
    null_mut()
}

// Create (or revive) a slab region for a class ring slot.
unsafe fn region_new(hp: *mut Heap, clas: u32, slot: u32) -> *mut Region {
    let h = &mut *hp;
    let cellen = h.claslens[clas as usize] as usize;
    let addord = if h.clasregcnt[clas as usize] < ADDORD_MAX {
        h.clasregcnt[clas as usize]
    } else {
        ADDORD_MAX
    };
    let mut ord = log2_ceil(cellen * CELS_TARGET);
    if ord < REG_MIN_ORD {
        ord = REG_MIN_ORD;
    }
    ord += addord;
    if ord > REG_MAX_ORD {
        ord = REG_MAX_ORD;
    }
    let mut gross = 1usize << ord;
    if gross < cellen * 2 {
        gross = os::page_align(cellen * 2);
    }
    let tags = options::trace() & options::TRACE_EXT != 0;

    let mut reg = region_pool_take(hp, cellen * 2);
    if !reg.is_null() {
        // revived: memory retained, metadata re-derived for the class
        let r = &mut *reg;
        r.gen += 1;
        r.clr = false;
        r.cellen = cellen;
        r.celcnt = (r.len / cellen) as u32;
        let need = slab::slab_meta_len(r.celcnt, cellen, tags);
        if r.metalen < need {
            os::unmap(r.meta, r.metalen);
            r.meta = os::map(need);
            if r.meta.is_null() {
                r.metalen = 0;
                r.frenxt = h.regfre;
                h.regfre = reg;
                return null_mut();
            }
            r.metalen = need;
        } else {
            write_bytes(r.meta, 0, need);
        }
        stats::bump(&h.stat.regions_reused);
    } else {
        reg = region_desc_new(hp);
        if reg.is_null() {
            return null_mut();
        }
        let celcnt = (gross / cellen) as u32;
        let metalen = slab::slab_meta_len(celcnt, cellen, tags);
        let user = os::map(gross);
        let meta = os::map(metalen);
        if user.is_null() || meta.is_null() {
            os::unmap(user, gross);
            os::unmap(meta, metalen);
            (*reg).frenxt = h.regfre;
            h.regfre = reg;
            return null_mut();
        }
        let r = &mut *reg;
        r.user = user;
        r.len = gross;
        r.meta = meta;
        r.metalen = metalen;
        r.cellen = cellen;
        r.celcnt = celcnt;
        r.clr = true;
        stats::bump(&h.stat.regions_created);
    }
    let r = &mut *reg;
    r.hid = h.id;
    r.clas = clas;
    r.slot = slot;
    r.order = log2_floor(r.len);
    r.inipos.store(0, Ordering::Relaxed);
    r.binpos = 0;
    r.rbinpos.store(0, Ordering::Relaxed);
    r.age = 0;
    r.aofs = 0;
    r.ulen = 0;
    slab::slab_setup(reg, tags);
    r.typ.store(REG_SLAB, Ordering::Release);
    if !dir::dir_insert(hp, reg, r.user, r.len) {
        r.typ.store(REG_NONE, Ordering::Release);
        r.frenxt = h.freeregs[r.order as usize];
        h.freeregs[r.order as usize] = reg;
        return null_mut();
    }
    h.clasregcnt[clas as usize] += 1;
    reg
}

/* -----------------------------------------------------------
  Per-class ring allocation
----------------------------------------------------------- */

pub unsafe fn heap_alloc_clas(hp: *mut Heap, clas: u32, n: usize, zero: bool, tag: u32) -> *mut u8 {
    let h = &mut *hp;
    let c = clas as usize;
    // regions already known to have space, preferred slot first
    loop {
        let msk = h.clasmsk[c];
        if msk == 0 {
            break;
        }
        let pref = 1u32.checked_shl(h.claspos[c]).unwrap_or(0);
        let pos = if msk & pref != 0 {
            h.claspos[c]
        } else {
            msk.trailing_zeros()
        };
        let reg = h.clasregs[c][pos as usize];
        debug_assert!(!reg.is_null());
        let p = slab::slab_alloc(reg, n, zero, tag);
        if !p.is_null() {
            h.claspos[c] = pos;
            h.cfremsk[c] &= !(1 << pos);
            if !slab::slab_has_space(reg) {
                h.clasmsk[c] &= !(1 << pos);
            }
            stats::bump(&h.stat.slab_allocs);
            return p;
        }
        h.clasmsk[c] &= !(1 << pos);
    }
    // populate an empty ring slot
    for slot in 0..CLASREGS {
        if !h.clasregs[c][slot].is_null() {
            continue;
        }
        let reg = region_new(hp, clas, slot as u32);
        if reg.is_null() {
            return null_mut();
        }
        h.clasregs[c][slot] = reg;
        h.clasmsk[c] |= 1 << slot;
        h.claspos[c] = slot as u32;
        let p = slab::slab_alloc(reg, n, zero, tag);
        if !p.is_null() {
            stats::bump(&h.stat.slab_allocs);
        }
        return p;
    }
    // ring saturated
    stats::bump(&h.stat.ring_full);
    null_mut()
}

// Free-path bookkeeping once a slab cell went back to its bin.
#[inline]
pub unsafe fn heap_note_free(hp: *mut Heap, reg: *mut Region) {
    let h = &mut *hp;
    let r = &*reg;
    let c = r.clas as usize;
    if c < CLASCNT && h.clasregs[c][r.slot as usize] == reg {
        h.clasmsk[c] |= 1 << r.slot;
        if r.age == AGE_EMPTY {
            h.cfremsk[c] |= 1 << r.slot;
        }
    }
}

/* -----------------------------------------------------------
  Bump regions
----------------------------------------------------------- */

unsafe fn bump_create(hp: *mut Heap) -> *mut Region {
    let h = &mut *hp;
    let reg = region_desc_new(hp);
    if reg.is_null() {
        return null_mut();
    }
    let metalen = grain_meta_len(BUMP_LEN / MINI_GRAIN);
    let user = os::map(BUMP_LEN);
    let meta = os::map(metalen);
    if user.is_null() || meta.is_null() {
        os::unmap(user, BUMP_LEN);
        os::unmap(meta, metalen);
        (*reg).frenxt = h.regfre;
        h.regfre = reg;
        return null_mut();
    }
    grain_setup(reg, user, BUMP_LEN, meta);
    (*reg).hid = h.id;
    (*reg).order = log2_floor(BUMP_LEN);
    (*reg).typ.store(REG_BUMP, Ordering::Release);
    if !dir::dir_insert(hp, reg, user, BUMP_LEN) {
        (*reg).typ.store(REG_NONE, Ordering::Release);
        os::unmap(user, BUMP_LEN);
        os::unmap(meta, metalen);
        (*reg).frenxt = h.regfre;
        h.regfre = reg;
        return null_mut();
    }
    stats::bump(&h.stat.regions_created);
    reg
}

pub unsafe fn heap_bump_alloc(hp: *mut Heap, n: usize, zero: bool, tag: u32) -> *mut u8 {
    let h = &mut *hp;
    while (h.bumppos as usize) < BUMPCNT {
        let i = h.bumppos as usize;
        if h.bumps[i].is_null() {
            h.bumps[i] = bump_create(hp);
            if h.bumps[i].is_null() {
                return null_mut();
            }
        }
        let p = grain_alloc(h.bumps[i], n, zero, tag);
        if !p.is_null() {
            stats::bump(&h.stat.bump_allocs);
            return p;
        }
        h.bumppos += 1;
    }
    null_mut()
}

/* -----------------------------------------------------------
  Trim / aging
  An operation-gated scan; one age stage per scan once a
  region is empty. Stage 2 unlists from the ring, stage 3
  leaves the directories and pools the region, stage 4 gives
  the memory back.
----------------------------------------------------------- */

pub unsafe fn heap_tick(hp: *mut Heap) {
    let h = &mut *hp;
    h.fretick += 1;
    if h.fretick >= REGFREE_INTERVAL {
        h.fretick = 0;
        heap_trim(hp);
    }
}

unsafe fn pool_unlink(list: &mut *mut Region, reg: *mut Region) {
    let mut p = *list;
    if p == reg {
        *list = (*reg).frenxt;
        (*reg).frenxt = null_mut();
        return;
    }
    while !p.is_null() {
        if (*p).frenxt == reg {
            (*p).frenxt = (*reg).frenxt;
            (*reg).frenxt = null_mut();
            return;
        }
        p = (*p).frenxt;
    }
}

unsafe fn slab_trim(hp: *mut Heap, reg: *mut Region) {
    let h = &mut *hp;
    let r = &mut *reg;
    if !slab::slab_is_empty(reg) {
        if r.age == AGE_UNLIST || r.age == AGE_UNDIR {
            // cells surfaced after unlisting: hand the region back to
            // its ring so they can be served again
            if r.age == AGE_UNDIR {
                pool_unlink(&mut h.freeregs[r.order as usize], reg);
                if !dir::dir_insert(hp, reg, r.user, r.len) {
                    return; // still poolable on a later scan
                }
            }
            let c = r.clas as usize;
            for s in 0..CLASREGS {
                if h.clasregs[c][s].is_null() {
                    r.slot = s as u32;
                    h.clasregs[c][s] = reg;
                    h.clasmsk[c] |= 1 << s;
                    h.clasregcnt[c] += 1;
                    break;
                }
            }
        }
        r.age = 0;
        return;
    }
    match r.age {
        0 => {}
        AGE_EMPTY => {
            // leave the ring, keep memory and directories
            let c = r.clas as usize;
            let s = r.slot as usize;
            if h.clasregs[c][s] == reg {
                h.clasregs[c][s] = null_mut();
                h.clasmsk[c] &= !(1 << s);
                h.cfremsk[c] &= !(1 << s);
                h.clasregcnt[c] -= 1;
            }
            r.age = AGE_UNLIST;
        }
        AGE_UNLIST => {
            // leave the directories; a racing flush may still land
            // cells in the rembin, so recheck under the region lock
            spin_lock(&r.lock);
            if !slab::slab_is_empty(reg) {
                spin_unlock(&r.lock);
                r.age = AGE_EMPTY;
                return;
            }
            dir::dir_remove(hp, reg, r.user, r.len);
            spin_unlock(&r.lock);
            r.frenxt = h.freeregs[r.order as usize];
            h.freeregs[r.order as usize] = reg;
            r.age = AGE_UNDIR;
        }
        AGE_UNDIR => {
            // give the memory back; the descriptor and its stale user
            // pointer stay behind and reject any straggler
            pool_unlink(&mut h.freeregs[r.order as usize], reg);
            os::unmap(r.user, r.len);
            os::unmap(r.meta, r.metalen);
            let rem = r.rembin.load(Ordering::Relaxed);
            if !rem.is_null() {
                os::unmap(rem as *mut u8, r.rbinlen as usize * 4);
                r.rembin.store(null_mut(), Ordering::Relaxed);
                r.rbinlen = 0;
            }
            r.meta = null_mut();
            r.metalen = 0;
            r.typ.store(REG_NONE, Ordering::Release);
            r.age = AGE_FREED;
            r.frenxt = h.regfre;
            h.regfre = reg;
            stats::bump(&h.stat.regions_released);
        }
        _ => {}
    }
}

unsafe fn mapped_trim(hp: *mut Heap, reg: *mut Region) {
    let h = &mut *hp;
    let r = &mut *reg;
    match r.mstate.load(Ordering::Acquire) {
        CEL_REM => mapped::mapped_reclaim(hp, reg),
        CEL_LOC => match r.age {
            AGE_EMPTY => r.age = AGE_UNDIR,
            AGE_UNDIR => {
                pool_unlink(&mut h.mapfre[r.order as usize], reg);
                os::unmap(r.user, r.len);
                r.len = 0;
                r.typ.store(REG_NONE, Ordering::Release);
                r.age = AGE_FREED;
                r.frenxt = h.mapzero;
                h.mapzero = reg;
                stats::bump(&h.stat.regions_released);
            }
            _ => {}
        },
        _ => {}
    }
}

pub unsafe fn heap_trim(hp: *mut Heap) {
    let h = &mut *hp;
    h.scans += 1;
    stats::bump(&h.stat.trims);
    let mut reg = h.reglst;
    while !reg.is_null() {
        match (*reg).typ.load(Ordering::Acquire) {
            REG_SLAB => slab_trim(hp, reg),
            REG_MAPPED => mapped_trim(hp, reg),
            _ => {}
        }
        reg = (*reg).nxt;
    }
}

// Flush pending remote frees and run trim scans; `force` ages empty
// regions all the way back to the OS.
pub unsafe fn heap_collect(hp: *mut Heap, force: bool) {
    remote_flush_all(hp);
    let scans = if force { 4 } else { 1 };
    for _ in 0..scans {
        heap_trim(hp);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clas_mapping_is_monotonic_and_covering() {
        let mut last = 0;
        for n in 1..MMAP_LIM {
            let c = len_clas(n);
            assert!(c >= last, "class regressed at n={}", n);
            assert!(clas_len(c) >= n, "clas_len({}) < {}", c, n);
            last = c;
        }
        assert!((last as usize) < CLASCNT);
    }

    #[test]
    fn exact_small_classes() {
        assert_eq!(len_clas(16), 3);
        assert_eq!(len_clas(24), 4);
        assert_eq!(len_clas(32), 5);
        assert_eq!(clas_len(3), 16);
        assert_eq!(clas_len(4), 24);
        assert_eq!(clas_len(5), 32);
        // first subdivided octave
        assert_eq!(clas_len(len_clas(33)), 40);
        assert_eq!(clas_len(len_clas(64)), 64);
    }

    #[test]
    fn clas_len_is_tight() {
        // each class length maps back to its own class
        for c in 1..CLASCNT as u32 {
            let len = clas_len(c);
            if len < MMAP_LIM {
                assert_eq!(len_clas(len), c, "len {} of class {}", len, c);
            }
        }
    }

    #[test]
    fn heap_ring_serves_and_recycles() {
        os::os_init();
        unsafe {
            let hp = heap_new();
            assert!(!hp.is_null());
            spin_lock(&(*hp).lock);
            let clas = len_clas(24);
            let p = heap_alloc_clas(hp, clas, 24, false, 0);
            assert!(!p.is_null());
            assert_eq!((*hp).clasregcnt[clas as usize], 1);
            let reg = (*hp).clasregs[clas as usize][(*hp).claspos[clas as usize] as usize];
            assert!(slab::slab_free_local(reg, p, None));
            heap_note_free(hp, reg);
            let q = heap_alloc_clas(hp, clas, 24, false, 0);
            assert_eq!(q, p);
            spin_unlock(&(*hp).lock);
        }
    }

    #[test]
    fn trim_releases_empty_regions() {
        os::os_init();
        unsafe {
            let hp = heap_new();
            spin_lock(&(*hp).lock);
            let clas = len_clas(48);
            let p = heap_alloc_clas(hp, clas, 48, false, 0);
            let reg = dir::ldir_lookup(hp, p);
            assert!(!reg.is_null());
            assert!(slab::slab_free_local(reg, p, None));
            assert_eq!((*reg).age, AGE_EMPTY);
            // four forced scans walk the region all the way out
            heap_collect(hp, true);
            assert_eq!((*reg).typ.load(Ordering::Relaxed), REG_NONE);
            assert_eq!((*reg).age, AGE_FREED);
            assert!(dir::ldir_lookup(hp, p).is_null());
            assert!(dir::gdir_lookup(p).is_null());
            // the ring repopulates afterwards
            let q = heap_alloc_clas(hp, clas, 48, false, 0);
            assert!(!q.is_null());
            spin_unlock(&(*hp).lock);
        }
    }
}
