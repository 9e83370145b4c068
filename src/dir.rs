//! Address -> region directory: a three-level radix over the 4kb page
//! number of an address. One table per heap for the owner's fast path,
//! one global table for cross-thread frees. Readers take no locks;
//! writers are serialized by the inserting heap's lock and install with
//! compare-swaps so a concurrent reader sees a subtree either fully
//! linked or not at all.

use core::mem::size_of;
use core::ptr::null_mut;
use core::sync::atomic::{AtomicPtr, Ordering};

use crate::boot::boot_alloc;
use crate::diag;
use crate::os;
use crate::types::*;

const L1_NULL: AtomicPtr<Dir2> = AtomicPtr::new(null_mut());

// Global directory level-1
pub static GDIR: GlobalDir = GlobalDir {
    slots: [L1_NULL; DIR1_LEN],
};

#[repr(C)]
pub struct GlobalDir {
    pub slots: [AtomicPtr<Dir2>; DIR1_LEN],
}

// Node lost in an install race; reused by the next allocation.
static SPARE: AtomicPtr<u8> = AtomicPtr::new(null_mut());

// chunk the per-heap node arena grows by
const DIRMEM_CHUNK: usize = 16 * size_of::<Dir2>();

#[inline]
fn dir_ix(addr: usize) -> (usize, usize, usize) {
    let pg = addr >> DIR_SHIFT;
    let d3 = pg & (DIR3_LEN - 1);
    let d2 = (pg >> DIR3_BITS) & (DIR2_LEN - 1);
    let d1 = (pg >> (DIR3_BITS + DIR2_BITS)) & (DIR1_LEN - 1);
    (d1, d2, d3)
}

// A directory node is one zeroed 32kb block: all slots start null.
// Nodes come from the owning heap's arena, or the bootstrap arena
// before any heap exists. They are never freed.
unsafe fn node_alloc(hp: *mut Heap) -> *mut u8 {
    let spare = SPARE.swap(null_mut(), Ordering::AcqRel);
    if !spare.is_null() {
        return spare;
    }
    if hp.is_null() {
        return boot_alloc(size_of::<Dir2>(), 64);
    }
    let h = &mut *hp;
    if h.dirmem.is_null() || h.dirpos + size_of::<Dir2>() > h.dirlen {
        let mem = os::map(DIRMEM_CHUNK);
        if mem.is_null() {
            return null_mut();
        }
        h.dirmem = mem;
        h.dirlen = DIRMEM_CHUNK;
        h.dirpos = 0;
    }
    let p = h.dirmem.add(h.dirpos);
    h.dirpos += size_of::<Dir2>();
    p
}

// Walk to the leaf table for `addr`, creating missing interior nodes.
// A lost install race stashes the fresh node for reuse.
unsafe fn leaf_of(
    l1: &[AtomicPtr<Dir2>; DIR1_LEN],
    hp: *mut Heap,
    addr: usize,
    create: bool,
) -> (*mut Dir3, usize) {
    let (d1, d2, d3) = dir_ix(addr);
    let mut l2 = l1[d1].load(Ordering::Acquire);
    if l2.is_null() {
        if !create {
            return (null_mut(), d3);
        }
        let fresh = node_alloc(hp) as *mut Dir2;
        if fresh.is_null() {
            return (null_mut(), d3);
        }
        match l1[d1].compare_exchange(null_mut(), fresh, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => l2 = fresh,
            Err(cur) => {
                SPARE.store(fresh as *mut u8, Ordering::Release);
                l2 = cur;
            }
        }
    }
    let mut l3 = (*l2).slots[d2].load(Ordering::Acquire);
    if l3.is_null() {
        if !create {
            return (null_mut(), d3);
        }
        let fresh = node_alloc(hp) as *mut Dir3;
        if fresh.is_null() {
            return (null_mut(), d3);
        }
        match (*l2).slots[d2].compare_exchange(null_mut(), fresh, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => l3 = fresh,
            Err(cur) => {
                SPARE.store(fresh as *mut u8, Ordering::Release);
                l3 = cur;
            }
        }
    }
    (l3, d3)
}

/* -----------------------------------------------------------
  Insert / remove / lookup
----------------------------------------------------------- */

// Install `reg` for every directory granule of [base, base+len) in the
// given table. Returns the number of bytes actually installed; short on
// node-allocation failure, so the caller can remove exactly the prefix
// and fail the triggering request with out-of-memory.
unsafe fn table_insert(
    l1: &[AtomicPtr<Dir2>; DIR1_LEN],
    hp: *mut Heap,
    reg: *mut Region,
    base: usize,
    len: usize,
    global: bool,
) -> usize {
    let mut done = 0;
    while done < len {
        let (l3, d3) = leaf_of(l1, hp, base + done, true);
        if l3.is_null() {
            return done;
        }
        let slot = &(*l3).slots[d3];
        if global {
            if slot
                .compare_exchange(null_mut(), reg, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                diag::report(
                    None,
                    diag::ERR_INTERNAL,
                    format_args!("dir insert: page {:#x} still owned", base + done),
                );
                return done;
            }
        } else {
            slot.store(reg, Ordering::Release);
        }
        done += 1 << DIR_SHIFT;
    }
    len
}

unsafe fn table_remove(
    l1: &[AtomicPtr<Dir2>; DIR1_LEN],
    reg: *mut Region,
    base: usize,
    len: usize,
    global: bool,
) {
    let mut done = 0;
    while done < len {
        let (l3, d3) = leaf_of(l1, null_mut(), base + done, false);
        if !l3.is_null() {
            let slot = &(*l3).slots[d3];
            if global {
                if slot
                    .compare_exchange(reg, null_mut(), Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    diag::report(
                        None,
                        diag::ERR_INTERNAL,
                        format_args!("dir remove: page {:#x} not owned", base + done),
                    );
                }
            } else {
                slot.store(null_mut(), Ordering::Release);
            }
        }
        done += 1 << DIR_SHIFT;
    }
}

#[inline]
unsafe fn table_lookup(l1: &[AtomicPtr<Dir2>; DIR1_LEN], p: usize) -> *mut Region {
    let (d1, d2, d3) = dir_ix(p);
    let l2 = l1[d1].load(Ordering::Acquire);
    if l2.is_null() {
        return null_mut();
    }
    let l3 = (*l2).slots[d2].load(Ordering::Acquire);
    if l3.is_null() {
        return null_mut();
    }
    (*l3).slots[d3].load(Ordering::Acquire)
}

// Register a region's user range in the owner's directory and the
// global one. False means out-of-memory; nothing remains installed.
pub unsafe fn dir_insert(hp: *mut Heap, reg: *mut Region, base: *mut u8, len: usize) -> bool {
    debug_assert!(base as usize % (1 << DIR_SHIFT) == 0);
    let b = base as usize;
    if !hp.is_null() {
        let done = table_insert(&(*hp).ldir, hp, reg, b, len, false);
        if done < len {
            table_remove(&(*hp).ldir, reg, b, done, false);
            return false;
        }
    }
    let done = table_insert(&GDIR.slots, hp, reg, b, len, true);
    if done < len {
        table_remove(&GDIR.slots, reg, b, done, true);
        if !hp.is_null() {
            table_remove(&(*hp).ldir, reg, b, len, false);
        }
        return false;
    }
    true
}

pub unsafe fn dir_remove(hp: *mut Heap, reg: *mut Region, base: *mut u8, len: usize) {
    let b = base as usize;
    if !hp.is_null() {
        table_remove(&(*hp).ldir, reg, b, len, false);
    }
    table_remove(&GDIR.slots, reg, b, len, true);
}

// Owner fast path
#[inline]
pub unsafe fn ldir_lookup(hp: *mut Heap, p: *const u8) -> *mut Region {
    table_lookup(&(*hp).ldir, p as usize)
}

#[inline]
pub unsafe fn gdir_lookup(p: *const u8) -> *mut Region {
    table_lookup(&GDIR.slots, p as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::MaybeUninit;

    fn fake_region() -> Box<Region> {
        unsafe { Box::new(MaybeUninit::zeroed().assume_init()) }
    }

    #[test]
    fn insert_lookup_remove() {
        let mut reg = fake_region();
        let rp: *mut Region = &mut *reg;
        let base = 0x5a5a_0000_0000usize as *mut u8;
        let len = 4 << DIR_SHIFT;
        unsafe {
            assert!(dir_insert(null_mut(), rp, base, len));
            assert_eq!(gdir_lookup(base), rp);
            assert_eq!(gdir_lookup(base.add(len - 1)), rp);
            assert_eq!(gdir_lookup(base.add(len)), null_mut());
            // interior addresses of a granule resolve to the same region
            assert_eq!(gdir_lookup(base.add(100)), rp);
            dir_remove(null_mut(), rp, base, len);
            assert_eq!(gdir_lookup(base), null_mut());
        }
    }

    #[test]
    fn reinsert_after_remove() {
        let mut reg = fake_region();
        let rp: *mut Region = &mut *reg;
        let base = 0x5b5b_0000_0000usize as *mut u8;
        let len = 1 << DIR_SHIFT;
        unsafe {
            assert!(dir_insert(null_mut(), rp, base, len));
            dir_remove(null_mut(), rp, base, len);
            assert!(dir_insert(null_mut(), rp, base, len));
            assert_eq!(gdir_lookup(base), rp);
            dir_remove(null_mut(), rp, base, len);
        }
    }
}
