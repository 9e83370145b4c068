use core::sync::atomic::{AtomicPtr, AtomicU32, AtomicU8, AtomicUsize};

use crate::diag::ErrCounts;
use crate::stats::Stats;

// ------------------------------------------------------
// Main internal data-structures
// ------------------------------------------------------

// Main tuning parameters for size classes and regions.
// Sizes assume a 64-bit address space.

pub const STDALIGN: usize = 16;

// Directory granule. Fixed at 4kb so the radix widths are
// compile-time constants even on 16kb-page systems; regions
// are page multiples, so every granule of a region maps to it.
pub const DIR_SHIFT: usize = 12;
pub const DIR1_BITS: usize = 12;
pub const DIR2_BITS: usize = 12;
pub const DIR3_BITS: usize = 12;
pub const DIR1_LEN: usize = 1 << DIR1_BITS;
pub const DIR2_LEN: usize = 1 << DIR2_BITS;
pub const DIR3_LEN: usize = 1 << DIR3_BITS;

// Size classes. 0 is the zero-length request, 1..=5 the small
// exact cells (4, 8, 16, 24, 32). Between 32 bytes and 64kb each
// power-of-two octave is split in 4 steps (`CLASBITS`), above
// 64kb one class per octave, and at `MMAP_LIM` requests leave
// the slabs for mapped regions.
pub const CLASBITS: u32 = 2;
pub const CLASSTEPS: u32 = 1 << CLASBITS;
pub const SMALCLAS: u32 = 6; // classes below here use the exact table
pub const MID_ORD_LO: u32 = 5;
pub const MID_ORD_HI: u32 = 15;
pub const BIGCLAS: u32 = SMALCLAS + (MID_ORD_HI - MID_ORD_LO + 1) * CLASSTEPS;
pub const BIG_ORD_LO: u32 = 16;
pub const MMAP_ORD: u32 = 18;
pub const CLASCNT: usize = (BIGCLAS + (MMAP_ORD - BIG_ORD_LO)) as usize;
pub const MMAP_LIM: usize = 1 << MMAP_ORD;

// Per-class region ring
pub const CLASREGS: usize = 32;

// Cells at or below this length do not store a per-cell net length
pub const NOLEN_MAX: usize = 128;

// Bump engines
pub const BUMPCNT: usize = 4; // bump regions per heap
pub const BUMP_LEN: usize = 1 << 16; // gross length of one bump region
pub const BUMP_MAX: usize = 512; // largest request served from a bump
pub const CLAS_THRESHOLD: u32 = 16; // bump allocations before a class gets slabs
pub const MINI_GRAIN: usize = 16;
pub const MINI_LEN: usize = 1 << 13; // user part of the pre-heap mini arena
pub const MINI_MAX: usize = 256; // largest request served from the mini
pub const MINI_ALLOCS: u32 = 64; // requests served before a heap is bound

// Remote-free router
pub const REMHID: usize = 64; // direct-routable destination heaps
pub const REMBATCH: usize = 6; // cells buffered per region bin
pub const BUFFER_FLUSH: u32 = 128; // buffered total forcing a flush
pub const FLUSH_INTERVAL: u32 = 64; // local frees between opportunistic flushes

// Trim / aging
pub const REGFREE_INTERVAL: u32 = 1024; // free ops between trim scans
pub const FREEORDS: usize = 48; // free-region pools indexed by order

// Region descriptor pool chunk
pub const REGPOOL: usize = 256;

// Derived
pub const REMBINS: usize = CLASCNT * CLASREGS;

// region kind tag
pub const REG_NONE: u8 = 0;
pub const REG_SLAB: u8 = 1;
pub const REG_MAPPED: u8 = 2;
pub const REG_BUMP: u8 = 3;
pub const REG_MINI: u8 = 4;

// per-cell state byte
pub const CEL_NONE: u8 = 0; // never allocated
pub const CEL_USED: u8 = 1; // allocated
pub const CEL_LOC: u8 = 2; // freed by the owning thread, on the local bin
pub const CEL_REM: u8 = 3; // freed by another thread

// region age stages, advanced by the trimmer once empty
pub const AGE_EMPTY: u8 = 1;
pub const AGE_UNLIST: u8 = 2;
pub const AGE_UNDIR: u8 = 3;
pub const AGE_FREED: u8 = 4;

/* -----------------------------------------------------------
  Directory nodes
  Level-2 and level-3 nodes are zeroed mapped memory; a null
  slot means "not present". The leaf holds the owning region.
----------------------------------------------------------- */

#[repr(C)]
pub struct Dir2 {
    pub slots: [AtomicPtr<Dir3>; DIR2_LEN],
}

#[repr(C)]
pub struct Dir3 {
    pub slots: [AtomicPtr<Region>; DIR3_LEN],
}

/* -----------------------------------------------------------
  Region
  One descriptor per contiguous OS-mapped chunk. The kind tag
  selects which field group is live; all operations match on
  it. Descriptors are never freed, only retagged, so a stale
  directory reader always finds a valid struct whose state
  rejects the operation.
----------------------------------------------------------- */

#[repr(C)]
pub struct Region {
    pub typ: AtomicU8, // REG_* tag
    pub age: u8,       // trim stage, heap lock
    pub clr: bool,     // user memory still untouched from the OS
    pub hid: u32,      // owning heap id
    pub id: u32,
    pub gen: u32, // incremented on reuse
    pub lock: AtomicU32,
    pub clas: u32,
    pub slot: u32,  // position in the class ring
    pub order: u32, // log2 of the gross length
    pub user: *mut u8,
    pub len: usize,   // gross length
    pub ulen: usize,  // net requested length (mapped)
    pub aofs: usize,  // alignment offset into `user` (mapped)
    pub mstate: AtomicU8, // one-block state for mapped regions (CEL_*)

    // slab fields
    pub cellen: usize,
    pub celcnt: u32,
    pub inipos: AtomicU32, // never-allocated frontier; foreign frees validate against it
    pub binpos: u32,       // local bin fill, owner only
    pub meta: *mut u8,
    pub metalen: usize,
    pub state: *mut u8,    // celcnt atomic state bytes
    pub bin: *mut u32,     // local bin, capacity celcnt
    pub userlen: *mut u32, // net lengths, null when cellen <= NOLEN_MAX
    pub tags: *mut u32,    // caller tags, null unless tracing

    // remote bin, written by other threads under the region lock
    pub rembin: AtomicPtr<u32>,
    pub rbinpos: AtomicU32,
    pub rbinlen: u32,

    // bump / mini cursor, in granules
    pub pos: AtomicUsize,

    // links
    pub nxt: *mut Region,    // heap region list (trim walk)
    pub frenxt: *mut Region, // free-pool link
}

/* -----------------------------------------------------------
  Remote-free router
  Per-destination buffers live in their own zeroed map and are
  touched only by the owning heap; the destination sees the
  cells once they are flushed into a region's rembin.
----------------------------------------------------------- */

#[repr(C)]
pub struct RemCels {
    pub reg: *mut Region,
    pub cnt: u32,
    pub cels: [u32; REMBATCH],
}

#[repr(C)]
pub struct RemDest {
    pub hid: u32,
    pub clasmsk: u64,            // classes with pending cells, one bit per class
    pub slotmsk: [u32; CLASCNT], // ring slots pending per class
    pub bins: [RemCels; REMBINS],
}

/* -----------------------------------------------------------
  Heap
  One page-aligned map carved into the struct itself, the
  region-descriptor pool and the directory node arena. Arrives
  zeroed, so null pointers and zero counters are the valid
  initial state of every field.
----------------------------------------------------------- */

#[repr(C)]
pub struct Heap {
    pub id: u32,
    pub lock: AtomicU32,
    pub unbound: AtomicU32, // owner exited; claimable by a binding thread
    pub nxt: *mut Heap,     // global heap list
    pub len: usize,         // gross length of the heap map

    // size-class tables
    pub claslens: [u32; CLASCNT],
    pub clascnts: [u32; CLASCNT], // allocations per class, drives bump promotion
    pub claspos: [u32; CLASCNT],
    pub clasmsk: [u32; CLASCNT], // ring slots with space
    pub cfremsk: [u32; CLASCNT], // ring slots currently empty
    pub clasregcnt: [u32; CLASCNT],
    pub clasregs: [[*mut Region; CLASREGS]; CLASCNT],

    // region descriptor pool (extended by whole chunks on exhaustion)
    pub regs: *mut Region,
    pub regcnt: u32,
    pub regpos: u32,
    pub regids: u32,
    pub regfre: *mut Region, // drained descriptors available for any class
    pub freeregs: [*mut Region; FREEORDS], // drained slab regions, memory retained
    pub mapfre: [*mut Region; FREEORDS],   // freed mapped regions, memory retained
    pub mapzero: *mut Region,              // descriptors whose memory was released
    pub reglst: *mut Region,               // every region of this heap

    // local directory
    pub ldir: [AtomicPtr<Dir2>; DIR1_LEN],
    pub dirmem: *mut u8,
    pub dirlen: usize,
    pub dirpos: usize,

    // bump regions
    pub bumps: [*mut Region; BUMPCNT],
    pub bumppos: u32,

    // remote-free router
    pub rdests: [*mut RemDest; REMHID],
    pub remask: u64, // destination ids with pending cells
    pub rempend: u32,
    pub locfres: u32,

    // trim
    pub fretick: u32,
    pub scans: u64,

    pub stat: Stats,
    pub errs: ErrCounts,
}

/* -----------------------------------------------------------
  Per-thread heap descriptor
----------------------------------------------------------- */

#[repr(C)]
pub struct HeapDesc {
    pub hb: *mut Heap,
    pub mini: *mut Region,
    pub minicnt: u32, // allocations served from the mini so far
    pub status: u32,  // last error code, cleared on API entry
    pub tag: u32,     // call-site tag of the current API call
    pub nxt: *mut HeapDesc, // global reuse list
}
