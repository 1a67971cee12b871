//! Size helper functions.

/// Convert kilobytes to bytes.
#[inline]
pub const fn kb(n: u64) -> u64 {
    n * 1024
}

/// Convert megabytes to bytes.
#[inline]
pub const fn mb(n: u64) -> u64 {
    n * 1024 * 1024
}
