//! Host facts reported by an agent.

/// Total physical memory in bytes, if the platform reports it.
pub fn total_memory() -> Option<u64> {
    // SAFETY: sysconf has no preconditions; it returns -1 for unknown names.
    let pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if pages <= 0 || page_size <= 0 {
        return None;
    }
    (pages as u64).checked_mul(page_size as u64)
}

/// Memory to report: the configured value, or the host's when it is 0.
pub fn reported_memory(configured: u64) -> u64 {
    if configured != 0 {
        return configured;
    }
    total_memory().unwrap_or_else(|| {
        tracing::warn!("host memory unavailable, reporting 0");
        0
    })
}
