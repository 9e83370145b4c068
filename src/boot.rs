//! Bootstrap arena: a small static bump pool for metadata needed before
//! any heap exists (thread descriptors, mini arenas, early global
//! directory nodes). Never freed. On contention or exhaustion the caller
//! gets a direct OS map instead.

use core::cell::UnsafeCell;
use core::ptr::null_mut;
use core::sync::atomic::AtomicU32;

use crate::internal::{align_up, spin_trylock, spin_unlock};
use crate::os;

const BOOT_LEN: usize = 1 << 18;
const BOOT_SPINS: u32 = 50;

#[repr(align(64))]
struct BootArena {
    lock: AtomicU32,
    pos: UnsafeCell<usize>,
    buf: UnsafeCell<[u8; BOOT_LEN]>,
}

unsafe impl Sync for BootArena {}

static BOOT: BootArena = BootArena {
    lock: AtomicU32::new(0),
    pos: UnsafeCell::new(0),
    buf: UnsafeCell::new([0; BOOT_LEN]),
};

// Zeroed, `align`-aligned, never freed. Null only when the OS map
// fallback itself fails.
pub fn boot_alloc(len: usize, align: usize) -> *mut u8 {
    debug_assert!(align.is_power_of_two());
    if len == 0 {
        return null_mut();
    }
    if len > BOOT_LEN / 4 || !spin_trylock(&BOOT.lock, BOOT_SPINS) {
        return os::map(len);
    }
    let p;
    unsafe {
        let pos = align_up(*BOOT.pos.get(), align);
        if pos + len > BOOT_LEN {
            spin_unlock(&BOOT.lock);
            return os::map(len);
        }
        p = (BOOT.buf.get() as *mut u8).add(pos);
        *BOOT.pos.get() = pos + len;
    }
    spin_unlock(&BOOT.lock);
    p
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligned_and_zeroed() {
        let p = boot_alloc(100, 16);
        assert!(!p.is_null());
        assert_eq!(p as usize % 16, 0);
        for i in 0..100 {
            assert_eq!(unsafe { *p.add(i) }, 0);
        }
        let q = boot_alloc(100, 64);
        assert_eq!(q as usize % 64, 0);
        assert_ne!(p, q);
    }

    #[test]
    fn oversize_falls_back_to_map() {
        let p = boot_alloc(BOOT_LEN, 16);
        assert!(!p.is_null());
        assert_eq!(p as usize % os::page_size(), 0);
        os::unmap(p, BOOT_LEN);
    }
}
