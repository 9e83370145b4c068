//! Single-threaded end-to-end scenarios over the public surface.

use yalloc::*;

fn a(n: usize) -> *mut u8 {
    let p = alloc(n);
    assert!(!p.is_null(), "alloc({}) failed", n);
    p
}

// Largest power of two (capped at 16) dividing the usable size; the
// cell stride implies at least this much alignment.
fn stride_align(usable: usize) -> usize {
    let mut al = 1;
    while al < 16 && usable % (al * 2) == 0 {
        al *= 2;
    }
    al
}

#[test]
fn zero_block_is_shared_and_inert() {
    let z = alloc(0);
    assert!(!z.is_null());
    assert_eq!(alloc(0), z);
    assert_eq!(calloc(0, 5), z);
    assert_eq!(calloc(7, 0), z);
    unsafe {
        assert_eq!(usable_size(z), 0);
        free(z);
        free(z);
        free(z);
        let p = a(10);
        assert_eq!(realloc(p, 0), z);
        // no diagnostics on this thread for any of the above
        assert_eq!(status(), 0);
    }
    // null is a no-op too
    unsafe { free(std::ptr::null_mut()) };
}

#[test]
fn alignment_and_usable_bounds() {
    let sizes = [
        1usize, 2, 3, 4, 5, 8, 9, 15, 16, 17, 24, 25, 32, 33, 40, 48, 63, 64, 100, 128, 250, 256,
        1000, 4095, 4096, 10000, 65535, 65536, 100000, 262143, 262144, 1 << 20,
    ];
    for &n in sizes.iter() {
        let p = a(n);
        let u = unsafe { usable_size(p) };
        assert!(u >= n, "usable {} < requested {}", u, n);
        assert_eq!(
            p as usize % stride_align(u),
            0,
            "ptr {:p} for size {} (usable {})",
            p,
            n,
            u
        );
        // every usable byte is really ours
        unsafe {
            std::ptr::write_bytes(p, 0x7e, u);
            assert_eq!(*p, 0x7e);
            assert_eq!(*p.add(u - 1), 0x7e);
            free(p);
        }
    }
}

// S1: a tight allocate/free cycle settles on one recycled cell.
#[test]
fn s1_small_cycle() {
    let mut tail = Vec::new();
    for i in 0..10_000 {
        let p = a(24);
        unsafe {
            *p = i as u8;
            free(p);
        }
        if i >= 9_990 {
            tail.push(p as usize);
        }
    }
    // once the class left the bump stage, the bin serves one address
    assert!(tail.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(status(), 0);
}

// S2: growth preserves the leading bytes.
#[test]
fn s2_grow_preserves_contents() {
    unsafe {
        let p = a(24);
        std::ptr::write_bytes(p, 0x5a, 24);
        let q = realloc(p, 1024);
        assert!(!q.is_null());
        for i in 0..24 {
            assert_eq!(*q.add(i), 0x5a, "byte {} lost in growth", i);
        }
        // a modest shrink stays in place
        let r = realloc(q, 900);
        assert_eq!(r, q);
        free(r);
    }
}

// S3: the second of two frees is counted once and the bin survives.
#[test]
fn s3_double_free_detected() {
    unsafe {
        // leave the mini behind, then push the 40-byte class past its
        // bump stage so the probe comes from a slab cell
        let bind = a(1000);
        free(bind);
        for _ in 0..24 {
            let w = a(40);
            free(w);
        }
        let p = a(40);
        let dbl = error_total(ERR_DOUBLE_FREE);
        free(p);
        assert_eq!(error_total(ERR_DOUBLE_FREE), dbl);
        free(p);
        assert_eq!(error_total(ERR_DOUBLE_FREE), dbl + 1);
        // the first free's bin entry is intact: the cell comes back
        let q = a(40);
        assert_eq!(q, p);
        free(q);
    }
}

// S4: large alignment from a mapped region.
#[test]
fn s4_aligned_large() {
    unsafe {
        let p = aligned_alloc(65536, 100_000);
        assert!(!p.is_null());
        assert_eq!(p as usize % 65536, 0);
        assert!(usable_size(p) >= 100_000);
        std::ptr::write_bytes(p, 1, 100_000);
        free(p);
        assert_eq!(status(), 0);
    }
}

#[test]
fn aligned_small_and_invalid() {
    unsafe {
        let p = aligned_alloc(64, 20);
        assert!(!p.is_null());
        assert_eq!(p as usize % 64, 0);
        assert!(usable_size(p) >= 20);
        free(p);
        let q = aligned_alloc(16, 24);
        assert!(!q.is_null());
        assert_eq!(q as usize % 16, 0);
        free(q);
        // alignment must be a power of two
        assert!(aligned_alloc(3, 100).is_null());
        assert!(aligned_alloc(0, 100).is_null());
        // zero length still gets the zero block
        assert_eq!(aligned_alloc(64, 0), zero_block());
    }
}

#[test]
fn calloc_zeroes_and_checks_overflow() {
    unsafe {
        let p = calloc(10, 24);
        assert!(!p.is_null());
        for i in 0..240 {
            assert_eq!(*p.add(i), 0);
        }
        std::ptr::write_bytes(p, 0xff, 240);
        free(p);
        // the recycled cell must be zeroed again
        let q = calloc(10, 24);
        assert!(!q.is_null());
        for i in 0..240 {
            assert_eq!(*q.add(i), 0);
        }
        free(q);
        assert!(calloc(usize::max_value() / 2, 4).is_null());
    }
}

#[test]
fn free_sized_checks_the_size() {
    unsafe {
        let p = a(100);
        let ok = error_total(ERR_SIZED_MISMATCH);
        free_sized(p, usable_size(p));
        assert_eq!(error_total(ERR_SIZED_MISMATCH), ok);
        let q = a(100);
        free_sized(q, 7);
        assert_eq!(error_total(ERR_SIZED_MISMATCH), ok + 1);
        // size 0 skips the check
        let r = a(100);
        free_sized(r, 0);
        assert_eq!(error_total(ERR_SIZED_MISMATCH), ok + 1);
        // a slab cell whose class pads beyond the request and tracks
        // net lengths: freeing with the requested length is clean
        let bind = a(1000);
        free(bind);
        for _ in 0..20 {
            let w = a(200);
            free(w);
        }
        let s = a(200);
        assert!(usable_size(s) > 200); // padded class, 224-byte cells
        free_sized(s, 200);
        assert_eq!(error_total(ERR_SIZED_MISMATCH), ok + 1);
        // while a wrong length on the same class is still caught
        let t = a(200);
        free_sized(t, 201);
        assert_eq!(error_total(ERR_SIZED_MISMATCH), ok + 2);
    }
}

// Property 6: realloc copies min(n, m) bytes verbatim, both ways.
#[test]
fn realloc_copies_min() {
    unsafe {
        let p = a(200);
        for i in 0..200 {
            *p.add(i) = i as u8;
        }
        let q = realloc(p, 1000);
        for i in 0..200 {
            assert_eq!(*q.add(i), i as u8);
        }
        // substantial shrink moves to a small cell, keeping m bytes
        let r = realloc(q, 16);
        for i in 0..16 {
            assert_eq!(*r.add(i), i as u8);
        }
        free(r);
        // null behaves as alloc
        let s = realloc(std::ptr::null_mut(), 64);
        assert!(!s.is_null());
        free(s);
    }
}

#[test]
fn foreign_and_interior_pointers_reported() {
    unsafe {
        let mut local = 0u64;
        let inv = error_total(ERR_INVALID_FREE);
        assert_eq!(usable_size(&mut local as *mut u64 as *mut u8), 0);
        assert!(error_total(ERR_INVALID_FREE) > inv);
        // interior pointer of a live slab cell
        let bind = a(1000);
        free(bind);
        for _ in 0..24 {
            let w = a(48);
            free(w);
        }
        let p = a(48);
        let inv = error_total(ERR_INVALID_FREE);
        free(p.add(8));
        assert_eq!(error_total(ERR_INVALID_FREE), inv + 1);
        free(p);
    }
}

#[test]
fn global_alloc_adapter() {
    use std::alloc::{GlobalAlloc, Layout};
    let ya = Yalloc;
    unsafe {
        let l = Layout::from_size_align(100, 32).unwrap();
        let p = ya.alloc(l);
        assert!(!p.is_null());
        assert_eq!(p as usize % 32, 0);
        std::ptr::write_bytes(p, 0x33, 100);
        let q = ya.realloc(p, l, 400);
        assert!(!q.is_null());
        assert_eq!(q as usize % 32, 0);
        for i in 0..100 {
            assert_eq!(*q.add(i), 0x33);
        }
        ya.dealloc(q, Layout::from_size_align(400, 32).unwrap());
        let z = ya.alloc_zeroed(Layout::from_size_align(64, 16).unwrap());
        for i in 0..64 {
            assert_eq!(*z.add(i), 0);
        }
        ya.dealloc(z, Layout::from_size_align(64, 16).unwrap());
    }
}

#[test]
fn mapped_realloc_grows_in_place_when_it_can() {
    unsafe {
        let n = 1 << 19; // mapped territory
        let p = a(n);
        std::ptr::write_bytes(p, 0x42, n);
        let q = realloc(p, 1 << 21);
        assert!(!q.is_null());
        for i in (0..n).step_by(4096) {
            assert_eq!(*q.add(i), 0x42);
        }
        assert!(usable_size(q) >= 1 << 21);
        free(q);
    }
}
