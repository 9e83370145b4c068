//! Runtime options, read once from the environment at process init.

use core::sync::atomic::{AtomicU32, Ordering};

pub const STATS_SUMMARY: u32 = 1 << 0;
pub const STATS_DETAIL: u32 = 1 << 1;
pub const STATS_TOTALS: u32 = 1 << 2;
pub const STATS_LIVE: u32 = 1 << 3;
pub const STATS_CONFIG: u32 = 1 << 5;

pub const TRACE_BASIC: u32 = 1 << 0;
pub const TRACE_EXT: u32 = 1 << 1;
pub const TRACE_SUPPRESS: u32 = 1 << 2;
pub const TRACE_API: u32 = 1 << 3;

pub const CHECK_COUNT: u32 = 1 << 0;
pub const CHECK_PRINT: u32 = 1 << 1;
pub const CHECK_EXIT: u32 = 1 << 2;

static STATS_MASK: AtomicU32 = AtomicU32::new(0);
static TRACE_MASK: AtomicU32 = AtomicU32::new(0);
static CHECK_MASK: AtomicU32 = AtomicU32::new(0);

fn env_mask(name: &str) -> u32 {
    let val = match std::env::var(name) {
        Ok(v) => v,
        Err(_) => return 0,
    };
    let val = val.trim();
    let parsed = if let Some(hex) = val.strip_prefix("0x") {
        u32::from_str_radix(hex, 16)
    } else {
        val.parse::<u32>()
    };
    parsed.unwrap_or(0)
}

pub fn options_init() {
    STATS_MASK.store(env_mask("Yalloc_stats"), Ordering::Relaxed);
    TRACE_MASK.store(env_mask("Yalloc_trace"), Ordering::Relaxed);
    CHECK_MASK.store(env_mask("Yalloc_check"), Ordering::Relaxed);
}

#[inline]
pub fn stats() -> u32 {
    STATS_MASK.load(Ordering::Relaxed)
}

#[inline]
pub fn trace() -> u32 {
    TRACE_MASK.load(Ordering::Relaxed)
}

#[inline]
pub fn check() -> u32 {
    CHECK_MASK.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_parsing() {
        std::env::set_var("Yalloc_test_mask", "5");
        assert_eq!(env_mask("Yalloc_test_mask"), 5);
        std::env::set_var("Yalloc_test_mask", "0x2a");
        assert_eq!(env_mask("Yalloc_test_mask"), 42);
        std::env::set_var("Yalloc_test_mask", "junk");
        assert_eq!(env_mask("Yalloc_test_mask"), 0);
        assert_eq!(env_mask("Yalloc_test_missing"), 0);
    }
}
