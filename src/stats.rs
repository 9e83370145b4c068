use core::sync::atomic::{AtomicI64, AtomicU64, Ordering};

pub struct StatCount {
    pub allocated: AtomicI64,
    pub freed: AtomicI64,
    pub peak: AtomicI64,
    pub current: AtomicI64,
}

impl StatCount {
    pub const fn new() -> StatCount {
        StatCount {
            allocated: AtomicI64::new(0),
            freed: AtomicI64::new(0),
            peak: AtomicI64::new(0),
            current: AtomicI64::new(0),
        }
    }
}

pub fn _stat_increase(stat: &StatCount, amount: i64) {
    _stat_update(stat, amount);
}

pub fn _stat_decrease(stat: &StatCount, amount: i64) {
    _stat_update(stat, -amount);
}

pub fn _stat_update(stat: &StatCount, amount: i64) {
    if amount == 0 {
        return;
    }
    let current = stat.current.fetch_add(amount, Ordering::Relaxed) + amount;
    stat.peak.fetch_max(current, Ordering::Relaxed);
    if amount > 0 {
        stat.allocated.fetch_add(amount, Ordering::Relaxed);
    } else {
        stat.freed.fetch_add(-amount, Ordering::Relaxed);
    }
}

// Process-wide mapped-byte accounting, fed by the os layer.
pub static MAPPED: StatCount = StatCount::new();

pub fn map_add(len: usize) {
    _stat_increase(&MAPPED, len as i64);
}

pub fn map_sub(len: usize) {
    _stat_decrease(&MAPPED, len as i64);
}

// current and peak resident bytes as seen by the allocator
pub fn mapped_bytes() -> (i64, i64) {
    (
        MAPPED.current.load(Ordering::Relaxed),
        MAPPED.peak.load(Ordering::Relaxed),
    )
}

/* -----------------------------------------------------------
  Per-heap event counters. The heap arrives as zeroed mapped
  memory, so every field must be valid all-zero.
----------------------------------------------------------- */

#[repr(C)]
pub struct Stats {
    pub allocs: AtomicU64,
    pub frees: AtomicU64,
    pub slab_allocs: AtomicU64,
    pub bump_allocs: AtomicU64,
    pub mini_allocs: AtomicU64,
    pub mapped_allocs: AtomicU64,
    pub reallocs: AtomicU64,
    pub remote_frees: AtomicU64,
    pub remote_direct: AtomicU64, // destinations beyond the router table
    pub remote_drops: AtomicU64,  // flush deferrals on region-lock contention
    pub flushes: AtomicU64,
    pub drains: AtomicU64,
    pub trims: AtomicU64,
    pub regions_created: AtomicU64,
    pub regions_reused: AtomicU64,
    pub regions_released: AtomicU64,
    pub ring_full: AtomicU64,
}

#[inline]
pub fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stat_update_tracks_peak() {
        let s = StatCount::new();
        _stat_increase(&s, 100);
        _stat_increase(&s, 50);
        _stat_decrease(&s, 120);
        assert_eq!(s.current.load(Ordering::Relaxed), 30);
        assert_eq!(s.peak.load(Ordering::Relaxed), 150);
        assert_eq!(s.allocated.load(Ordering::Relaxed), 150);
        assert_eq!(s.freed.load(Ordering::Relaxed), 120);
    }
}
