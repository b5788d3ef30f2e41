//! CPU cache, huge-page, and NUMA detection.
//!
//! All probes read the kernel's topology exposures (`/sys`, `/proc`) and
//! fall back to documented defaults when a datum is missing. They have no
//! side effects, so their results are memoized for the process lifetime.

use std::path::Path;
use std::sync::OnceLock;

/// Cache line size assumed throughout the transports (64 bytes on
/// contemporary x86_64 and most aarch64 parts).
pub const CACHE_LINE: usize = 64;

pub use crate::region::HUGE_PAGE_SIZE;

// Defaults used when sysfs detection fails.
const DEFAULT_L1_SIZE: usize = 32 * 1024;
const DEFAULT_L2_SIZE: usize = 256 * 1024;
const DEFAULT_L3_SIZE: usize = 8 * 1024 * 1024;

/// CPU cache hierarchy, as detected or defaulted.
#[derive(Debug, Clone, Copy)]
pub struct CacheInfo {
    /// L1 data cache size in bytes.
    pub l1d_size: usize,
    /// L1 instruction cache size in bytes.
    pub l1i_size: usize,
    /// L2 cache size in bytes.
    pub l2_size: usize,
    /// L3 cache size in bytes.
    pub l3_size: usize,
    /// Cache line size in bytes.
    pub line_size: usize,
    /// Number of online CPU cores.
    pub num_cores: usize,
}

impl CacheInfo {
    /// Distance ahead of the write/read cursor worth prefetching:
    /// a quarter of L2, never less than 64 KiB.
    pub fn prefetch_distance(&self) -> usize {
        if self.l2_size > 0 {
            (self.l2_size / 4).max(64 * 1024)
        } else {
            64 * 1024
        }
    }

    /// Chunk size for bulk operations that should stay cache-resident:
    /// half of L3, never less than 1 MiB.
    pub fn chunk_size(&self) -> usize {
        if self.l3_size > 0 {
            (self.l3_size / 2).max(1024 * 1024)
        } else {
            1024 * 1024
        }
    }
}

/// Huge-page pool status, from `/proc/meminfo`.
#[derive(Debug, Clone, Copy)]
pub struct HugePagesInfo {
    /// The kernel has a huge-page pool configured.
    pub available: bool,
    /// At least one huge page is currently free.
    pub usable: bool,
    /// Total huge pages in the pool.
    pub total: usize,
    /// Free huge pages in the pool.
    pub free: usize,
    /// Huge page size in bytes (usually 2 MiB).
    pub page_size: usize,
}

/// NUMA topology, from `/sys/devices/system/node/`.
#[derive(Debug, Clone, Copy)]
pub struct NumaInfo {
    /// More than one NUMA node is present.
    pub available: bool,
    /// Number of NUMA nodes.
    pub num_nodes: usize,
    /// Node the current CPU belongs to (best effort, 0 when unknown).
    pub current_node: usize,
}

/// Detects the CPU cache hierarchy. Memoized per process.
pub fn cache_info() -> CacheInfo {
    static CACHE: OnceLock<CacheInfo> = OnceLock::new();
    *CACHE.get_or_init(detect_cache_info)
}

/// Detects huge-page availability. Memoized per process.
pub fn huge_pages_info() -> HugePagesInfo {
    static HUGE: OnceLock<HugePagesInfo> = OnceLock::new();
    *HUGE.get_or_init(detect_huge_pages)
}

/// Detects the NUMA topology. Memoized per process.
pub fn numa_info() -> NumaInfo {
    static NUMA: OnceLock<NumaInfo> = OnceLock::new();
    *NUMA.get_or_init(detect_numa)
}

fn detect_cache_info() -> CacheInfo {
    let mut info = CacheInfo {
        l1d_size: DEFAULT_L1_SIZE,
        l1i_size: DEFAULT_L1_SIZE,
        l2_size: DEFAULT_L2_SIZE,
        l3_size: DEFAULT_L3_SIZE,
        line_size: CACHE_LINE,
        num_cores: online_cores(),
    };

    let base = Path::new("/sys/devices/system/cpu/cpu0/cache");
    let Ok(entries) = std::fs::read_dir(base) else {
        return info;
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if !entry
            .file_name()
            .to_string_lossy()
            .starts_with("index")
        {
            continue;
        }

        let read = |file: &str| std::fs::read_to_string(path.join(file)).ok();
        let Some(level) = read("level").and_then(|s| s.trim().parse::<u32>().ok()) else {
            continue;
        };
        let cache_type = read("type").map(|s| s.trim().to_string()).unwrap_or_default();
        let size = read("size").map(|s| parse_size(s.trim())).unwrap_or(0);

        if let Some(line) = read("coherency_line_size").and_then(|s| s.trim().parse().ok()) {
            if line > 0 {
                info.line_size = line;
            }
        }

        // A present but unreadable size file keeps the default.
        match (level, cache_type.as_str()) {
            (1, "Data") if size > 0 => info.l1d_size = size,
            (1, "Instruction") if size > 0 => info.l1i_size = size,
            (2, _) if size > 0 => info.l2_size = size,
            (3, _) if size > 0 => info.l3_size = size,
            _ => {}
        }
    }

    info
}

/// Parses sysfs size strings like `32K`, `8192K`, `8M`.
fn parse_size(s: &str) -> usize {
    let (digits, suffix) = s.split_at(s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len()));
    let value: usize = digits.parse().unwrap_or(0);
    let multiplier = match suffix.trim().chars().next() {
        Some('K') | Some('k') => 1024,
        Some('M') | Some('m') => 1024 * 1024,
        Some('G') | Some('g') => 1024 * 1024 * 1024,
        _ => 1,
    };
    value * multiplier
}

fn detect_huge_pages() -> HugePagesInfo {
    let mut info = HugePagesInfo {
        available: false,
        usable: false,
        total: 0,
        free: 0,
        page_size: HUGE_PAGE_SIZE,
    };

    let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") else {
        return info;
    };

    for line in meminfo.lines() {
        let parse_field = |prefix: &str| {
            line.strip_prefix(prefix)
                .and_then(|rest| rest.split_whitespace().next())
                .and_then(|v| v.parse::<usize>().ok())
        };
        if let Some(total) = parse_field("HugePages_Total:") {
            info.total = total;
        } else if let Some(free) = parse_field("HugePages_Free:") {
            info.free = free;
        } else if let Some(size_kb) = parse_field("Hugepagesize:") {
            info.page_size = size_kb * 1024;
        }
    }

    info.available = info.total > 0;
    info.usable = info.free > 0;
    info
}

fn detect_numa() -> NumaInfo {
    let mut num_nodes = 0;
    if let Ok(entries) = std::fs::read_dir("/sys/devices/system/node") {
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with("node") && name[4..].chars().all(|c| c.is_ascii_digit()) {
                num_nodes += 1;
            }
        }
    }

    NumaInfo {
        available: num_nodes > 1,
        num_nodes: num_nodes.max(1),
        current_node: 0,
    }
}

fn online_cores() -> usize {
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if n > 0 { n as usize } else { 1 }
}

/// Whether a region of `size` bytes should be backed by huge pages:
/// the region must be at least 1 MiB and the free pool must cover it.
pub fn should_use_huge_pages(size: usize) -> bool {
    if size < 1024 * 1024 {
        return false;
    }
    let hp = huge_pages_info();
    if !hp.usable {
        return false;
    }
    let pages_needed = size.div_ceil(hp.page_size);
    pages_needed <= hp.free
}

/// Rounds `size` up to the next cache-line boundary.
pub fn align_to_cache_line(size: usize) -> usize {
    crate::utils::align_up(size, CACHE_LINE)
}

/// Rounds `size` up to the next huge-page boundary.
pub fn align_to_huge_page(size: usize) -> usize {
    crate::utils::align_up(size, HUGE_PAGE_SIZE)
}

/// Pins the calling thread to `cpu_id`. A negative id is a no-op.
pub fn set_cpu_affinity(cpu_id: i32) -> bool {
    if cpu_id < 0 {
        return true;
    }
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu_id as usize, &mut set);
        libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) == 0
    }
}

/// Returns the CPU the calling thread is currently running on.
pub fn current_cpu() -> i32 {
    unsafe { libc::sched_getcpu() }
}

/// Prefetches one cache line for reading. No-op off x86_64.
#[inline(always)]
pub(crate) fn prefetch_read(addr: *const u8) {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        use std::arch::x86_64::{_MM_HINT_T0, _mm_prefetch};
        _mm_prefetch(addr as *const i8, _MM_HINT_T0);
    }
    #[cfg(not(target_arch = "x86_64"))]
    let _ = addr;
}

/// Prefetches `len` bytes starting at `addr`, one line at a time.
///
/// Prefetch is a hint: issuing it for addresses that later turn out to
/// be unused (or even unmapped) only costs the instruction.
pub(crate) fn prefetch_range(addr: *const u8, len: usize) {
    let mut offset = 0;
    while offset < len {
        prefetch_read(addr.wrapping_add(offset));
        offset += CACHE_LINE;
    }
}

/// Tuning knobs shared by the cache-aware transports.
///
/// Every field auto-detects and falls back gracefully; the presets cover
/// the usual deployments.
#[derive(Debug, Clone, Copy)]
pub struct ChannelConfig {
    /// Try to back the channel region with 2 MiB huge pages.
    pub use_huge_pages: bool,
    /// Issue software prefetches around the copy paths.
    pub enable_prefetch: bool,
    /// Prefer NUMA-local placement (advisory).
    pub numa_aware: bool,
    /// CPU core to pin the calling thread to at `init` (-1 = no pinning).
    pub cpu_affinity: i32,
    /// Prefetch distance in bytes (0 = derive from the L2 size).
    pub prefetch_distance: usize,
}

impl ChannelConfig {
    /// Detects the host and enables whatever it supports.
    pub fn auto_detect() -> Self {
        let cache = cache_info();
        let hp = huge_pages_info();
        Self {
            use_huge_pages: hp.usable,
            enable_prefetch: true,
            numa_aware: true,
            cpu_affinity: -1,
            prefetch_distance: cache.prefetch_distance(),
        }
    }

    /// No privileged or host-specific features; runs anywhere.
    pub fn portable() -> Self {
        Self {
            use_huge_pages: false,
            enable_prefetch: true,
            numa_aware: false,
            cpu_affinity: -1,
            prefetch_distance: 64 * 1024,
        }
    }

    /// Everything on, pinned to core 0.
    pub fn max_performance() -> Self {
        Self {
            use_huge_pages: true,
            enable_prefetch: true,
            numa_aware: true,
            cpu_affinity: 0,
            prefetch_distance: 0,
        }
    }

    /// The effective prefetch distance, resolving 0 to the detected value.
    pub(crate) fn effective_prefetch_distance(&self) -> usize {
        if self.prefetch_distance == 0 {
            cache_info().prefetch_distance()
        } else {
            self.prefetch_distance
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self::auto_detect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_info_has_sane_values() {
        let info = cache_info();
        assert!(info.l1d_size > 0);
        assert!(info.l2_size > 0);
        assert!(info.l3_size > 0);
        assert!(info.line_size >= 32 && info.line_size <= 256);
        assert!(info.num_cores >= 1);
    }

    #[test]
    fn prefetch_distance_is_floored() {
        let info = CacheInfo {
            l1d_size: 0,
            l1i_size: 0,
            l2_size: 0,
            l3_size: 0,
            line_size: CACHE_LINE,
            num_cores: 1,
        };
        assert_eq!(info.prefetch_distance(), 64 * 1024);
        assert_eq!(info.chunk_size(), 1024 * 1024);

        let big = CacheInfo {
            l2_size: 1024 * 1024,
            l3_size: 32 * 1024 * 1024,
            ..info
        };
        assert_eq!(big.prefetch_distance(), 256 * 1024);
        assert_eq!(big.chunk_size(), 16 * 1024 * 1024);
    }

    #[test]
    fn parse_size_understands_sysfs_suffixes() {
        assert_eq!(parse_size("32K"), 32 * 1024);
        assert_eq!(parse_size("8M"), 8 * 1024 * 1024);
        assert_eq!(parse_size("512"), 512);
        assert_eq!(parse_size(""), 0);
    }

    #[test]
    fn huge_pages_probe_does_not_panic() {
        let hp = huge_pages_info();
        assert!(hp.page_size >= 4096);
        if hp.usable {
            assert!(hp.available, "usable implies available");
            assert!(hp.free <= hp.total);
        }
    }

    #[test]
    fn numa_probe_reports_at_least_one_node() {
        let numa = numa_info();
        assert!(numa.num_nodes >= 1);
        if numa.available {
            assert!(numa.num_nodes > 1);
        }
    }

    #[test]
    fn small_regions_never_use_huge_pages() {
        assert!(!should_use_huge_pages(4096));
        assert!(!should_use_huge_pages(1024 * 1024 - 1));
    }

    #[test]
    fn alignment_helpers_round_up() {
        assert_eq!(align_to_cache_line(1), CACHE_LINE);
        assert_eq!(align_to_cache_line(CACHE_LINE), CACHE_LINE);
        assert_eq!(align_to_huge_page(1), HUGE_PAGE_SIZE);
        assert_eq!(align_to_huge_page(HUGE_PAGE_SIZE + 1), 2 * HUGE_PAGE_SIZE);
    }

    #[test]
    fn probes_are_memoized() {
        let a = cache_info();
        let b = cache_info();
        assert_eq!(a.l2_size, b.l2_size);
        assert_eq!(a.num_cores, b.num_cores);
    }

    #[test]
    fn negative_affinity_is_a_no_op() {
        assert!(set_cpu_affinity(-1));
    }

    #[test]
    fn config_presets_match_their_intent() {
        let portable = ChannelConfig::portable();
        assert!(!portable.use_huge_pages);
        assert!(portable.enable_prefetch);
        assert_eq!(portable.cpu_affinity, -1);
        assert_eq!(portable.prefetch_distance, 64 * 1024);

        let max = ChannelConfig::max_performance();
        assert!(max.use_huge_pages);
        assert_eq!(max.cpu_affinity, 0);
        assert_eq!(max.prefetch_distance, 0);
        assert!(max.effective_prefetch_distance() >= 64 * 1024);

        let auto = ChannelConfig::auto_detect();
        assert!(auto.enable_prefetch);
        assert!(auto.prefetch_distance >= 64 * 1024);
    }
}
