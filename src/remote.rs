//! Remote-free router: cross-thread releases are buffered on the
//! freeing thread's own heap, batched per destination heap and per
//! region, and flushed into the target regions' remote bins. Buffers
//! and masks are touched only by the owning heap; the region lock is
//! the only foreign thing a flush takes.

use core::mem::size_of;

use crate::os;
use crate::slab::rembin_push;
use crate::stats;
use crate::types::*;

unsafe fn dest_get(hp: *mut Heap, dhid: usize) -> *mut RemDest {
    let h = &mut *hp;
    let mut rd = h.rdests[dhid];
    if rd.is_null() {
        rd = os::map(size_of::<RemDest>()) as *mut RemDest;
        if !rd.is_null() {
            (*rd).hid = dhid as u32;
            h.rdests[dhid] = rd;
        }
    }
    rd
}

// Push one bin into its region's rembin. Deferred (false) when the
// region lock stays contended; the entries keep their buffer slot.
unsafe fn flush_bin(h: &mut Heap, rb: &mut RemCels) -> bool {
    if rb.cnt == 0 {
        return true;
    }
    if rembin_push(rb.reg, rb.cels.as_ptr(), rb.cnt, true) {
        h.rempend -= rb.cnt;
        rb.cnt = 0;
        stats::bump(&h.stat.flushes);
        true
    } else {
        stats::bump(&h.stat.remote_drops);
        false
    }
}

// Route one already-marked cell toward its owning heap. Called under
// the routing heap's lock; `reg.hid` names the destination.
pub unsafe fn remote_route(hp: *mut Heap, reg: *mut Region, cel: u32) {
    let h = &mut *hp;
    stats::bump(&h.stat.remote_frees);
    let dhid = (*reg).hid as usize;
    if dhid >= REMHID {
        // beyond the table: straight into the region's rembin
        stats::bump(&h.stat.remote_direct);
        rembin_push(reg, &cel, 1, false);
        return;
    }
    let rd = dest_get(hp, dhid);
    if rd.is_null() {
        stats::bump(&h.stat.remote_direct);
        rembin_push(reg, &cel, 1, false);
        return;
    }
    let clas = (*reg).clas as usize;
    let slot = (*reg).slot as usize;
    let rb = &mut (*rd).bins[clas * CLASREGS + slot];
    if rb.reg != reg {
        // the ring slot was repopulated; the old region's cells go first
        if rb.cnt > 0 && !flush_bin(h, rb) {
            rembin_push(rb.reg, rb.cels.as_ptr(), rb.cnt, false);
            h.rempend -= rb.cnt;
            rb.cnt = 0;
        }
        rb.reg = reg;
    }
    if rb.cnt as usize >= REMBATCH {
        // bin full and its last flush was deferred
        if !flush_bin(h, rb) {
            rembin_push(reg, &cel, 1, false);
            stats::bump(&h.stat.remote_direct);
            return;
        }
    }
    rb.cels[rb.cnt as usize] = cel;
    rb.cnt += 1;
    (*rd).clasmsk |= 1 << clas as u64;
    (*rd).slotmsk[clas] |= 1 << slot as u32;
    h.remask |= 1 << dhid as u64;
    h.rempend += 1;
    if rb.cnt as usize == REMBATCH {
        flush_bin(h, rb);
    }
    if h.rempend > BUFFER_FLUSH {
        remote_flush_all(hp);
    }
}

// Flush every pending bin, walking only the set mask bits. Deferred
// bins put their bits back for the next round.
pub unsafe fn remote_flush_all(hp: *mut Heap) {
    let h = &mut *hp;
    if h.rempend == 0 {
        return;
    }
    let mut dmask = h.remask;
    h.remask = 0;
    while dmask != 0 {
        let d = dmask.trailing_zeros() as usize;
        dmask &= dmask - 1;
        let rd = h.rdests[d];
        if rd.is_null() {
            continue;
        }
        let mut cmask = (*rd).clasmsk;
        (*rd).clasmsk = 0;
        while cmask != 0 {
            let c = cmask.trailing_zeros() as usize;
            cmask &= cmask - 1;
            let mut smask = (*rd).slotmsk[c];
            (*rd).slotmsk[c] = 0;
            while smask != 0 {
                let s = smask.trailing_zeros() as usize;
                smask &= smask - 1;
                let rb = &mut (*rd).bins[c * CLASREGS + s];
                if rb.cnt > 0 && !flush_bin(h, rb) {
                    (*rd).clasmsk |= 1 << c as u64;
                    (*rd).slotmsk[c] |= 1 << s as u32;
                    h.remask |= 1 << d as u64;
                }
            }
        }
    }
}
