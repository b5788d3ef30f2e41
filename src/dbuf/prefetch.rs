//! Cache-tuned double-buffer transport.
//!
//! Same publish protocol as [`crate::dbuf::nt`], but the copy paths stay
//! temporal and are wrapped in software prefetch, and the channel is
//! driven by a [`ChannelConfig`]: huge pages, prefetch distance, and CPU
//! pinning all auto-detect and degrade gracefully. This variant also
//! carries the convenience surface the minimal ones omit: copying reads,
//! a timed read, and stats snapshots.

use crate::dbuf::{Frame, SlotMeta};
use crate::error::{ShmError, ShmResult};
use crate::region::{HUGE_PAGE_SIZE, SharedRegion};
use crate::topology::{
    CACHE_LINE, CacheInfo, ChannelConfig, cache_info, numa_info, prefetch_range,
    set_cpu_affinity, should_use_huge_pages,
};
use crate::utils::{align_up, mono_time_ns, validate_name};
use crossbeam_utils::Backoff;
use static_assertions::const_assert_eq;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};

/// Header magic, `"CASR"`.
pub const MAGIC: u32 = 0x43415352;
/// Header version.
pub const VERSION: u32 = 0x0001_0000;

/// Channel header, six cache lines.
#[repr(C, align(64))]
struct Header {
    // Cache line 0: static metadata.
    magic: u32,
    version: u32,
    capacity: usize,
    huge_page_size: usize,
    flags: u32,
    _pad0: [u8; CACHE_LINE - 28],

    // Cache line 1: publish index.
    publish_index: AtomicU32,
    _pad1: [u8; CACHE_LINE - 4],

    // Cache lines 2-3: per-slot metadata.
    slots: [SlotMeta; 2],

    // Cache line 4: writer state. `checksum_enabled` is reserved for a
    // payload checksum that is not computed; it stays zero.
    heartbeat_ns: AtomicI64,
    checksum_enabled: AtomicBool,
    _pad4: [u8; CACHE_LINE - 9],

    // Cache line 5: stats.
    total_writes: AtomicU64,
    total_bytes: AtomicU64,
    _pad5: [u8; CACHE_LINE - 16],
}

const HEADER_SIZE: usize = std::mem::size_of::<Header>();

const_assert_eq!(HEADER_SIZE, 6 * CACHE_LINE);
const_assert_eq!(std::mem::offset_of!(Header, publish_index), CACHE_LINE);
const_assert_eq!(std::mem::offset_of!(Header, slots), 2 * CACHE_LINE);
const_assert_eq!(std::mem::offset_of!(Header, heartbeat_ns), 4 * CACHE_LINE);
const_assert_eq!(std::mem::offset_of!(Header, total_writes), 5 * CACHE_LINE);

const FLAG_HUGE_PAGES: u32 = 0x1;

/// Snapshot of a channel end's configuration and counters.
#[derive(Debug, Clone, Copy)]
pub struct ChannelStats {
    pub huge_pages_active: bool,
    pub prefetch_active: bool,
    pub numa_node: usize,
    pub pinned_cpu: i32,
    pub cache_info: CacheInfo,
    pub total_writes: u64,
    pub total_bytes: u64,
}

/// The channel's writing end.
///
/// See [`crate::dbuf::nt::Writer`] for the lifecycle contract; this
/// variant additionally applies its [`ChannelConfig`] at `init` (CPU
/// pinning, huge-page policy, prefetch priming of both slots).
#[derive(Debug)]
pub struct Writer {
    name: String,
    capacity: usize,
    slot_size: usize,
    config: ChannelConfig,
    region: Option<SharedRegion>,
    frame_count: u64,
}

impl Writer {
    /// Creates an uninitialized writer with auto-detected configuration.
    pub fn new(name: &str, capacity: usize) -> ShmResult<Self> {
        Self::with_config(name, capacity, ChannelConfig::auto_detect())
    }

    /// Creates an uninitialized writer with an explicit configuration.
    pub fn with_config(name: &str, capacity: usize, config: ChannelConfig) -> ShmResult<Self> {
        validate_name(name)?;
        Ok(Self {
            name: name.to_string(),
            capacity,
            slot_size: align_up(capacity, CACHE_LINE),
            config,
            region: None,
            frame_count: 0,
        })
    }

    /// Acquires the region and lays out the channel.
    pub fn init(&mut self) -> ShmResult<()> {
        if self.region.is_some() {
            return Ok(());
        }

        if self.config.cpu_affinity >= 0 {
            set_cpu_affinity(self.config.cpu_affinity);
        }

        let size = HEADER_SIZE + self.slot_size * 2;
        let prefer_huge = self.config.use_huge_pages && should_use_huge_pages(size);
        let region = SharedRegion::create(&self.name, size, prefer_huge)?;

        let hdr = region.as_mut_ptr() as *mut Header;
        unsafe {
            (*hdr).magic = MAGIC;
            (*hdr).version = VERSION;
            (*hdr).capacity = self.capacity;
            (*hdr).huge_page_size = if region.uses_huge_pages() {
                HUGE_PAGE_SIZE
            } else {
                0
            };
            (*hdr).flags = if region.uses_huge_pages() {
                FLAG_HUGE_PAGES
            } else {
                0
            };

            (*hdr).publish_index.store(0, Ordering::Relaxed);
            for slot in &(*hdr).slots {
                slot.seq.store(0, Ordering::Relaxed);
                slot.timestamp_ns.store(0, Ordering::Relaxed);
                slot.len.store(0, Ordering::Relaxed);
            }
            (*hdr).heartbeat_ns.store(mono_time_ns(), Ordering::Relaxed);
            (*hdr).checksum_enabled.store(false, Ordering::Relaxed);
            (*hdr).total_writes.store(0, Ordering::Relaxed);
            (*hdr).total_bytes.store(0, Ordering::Relaxed);
        }
        std::sync::atomic::fence(Ordering::Release);

        // Warm both slots so the first publishes do not eat cold misses.
        if self.config.enable_prefetch {
            let span = self.capacity.min(self.config.effective_prefetch_distance());
            unsafe {
                prefetch_range(region.as_ptr().add(HEADER_SIZE), span);
                prefetch_range(region.as_ptr().add(HEADER_SIZE + self.slot_size), span);
            }
        }

        self.region = Some(region);
        self.frame_count = 0;
        Ok(())
    }

    /// Publishes one frame.
    ///
    /// Temporal copy into the back slot; when prefetch is enabled the
    /// slot is prefetched ahead of the copy, and the next write target
    /// is prefetched before returning.
    #[inline(always)]
    pub fn write(&mut self, data: &[u8]) -> ShmResult<()> {
        let region = self.region.as_ref().ok_or(ShmError::NotInitialized)?;
        if data.len() > self.capacity {
            return Err(ShmError::SizeExceeded {
                len: data.len(),
                capacity: self.capacity,
            });
        }

        let hdr = unsafe { &*(region.as_ptr() as *const Header) };
        let front = hdr.publish_index.load(Ordering::Acquire);
        let back = 1 - front;

        let prefetch_span = if self.config.enable_prefetch {
            data.len().min(self.config.effective_prefetch_distance())
        } else {
            0
        };

        let next_target = unsafe {
            let dst = region
                .as_mut_ptr()
                .add(HEADER_SIZE + back as usize * self.slot_size);
            if prefetch_span > 0 {
                prefetch_range(dst, prefetch_span);
            }
            std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len());

            region
                .as_mut_ptr()
                .add(HEADER_SIZE + front as usize * self.slot_size)
        };

        self.publish(hdr, back, data.len());

        if prefetch_span > 0 {
            // The just-demoted front slot is the next write target.
            prefetch_range(next_target, prefetch_span);
        }
        Ok(())
    }

    /// Zero-copy publish: `fill` writes the payload straight into the
    /// back slot, then the frame is committed as `len` bytes.
    pub fn write_with<F>(&mut self, len: usize, fill: F) -> ShmResult<()>
    where
        F: FnOnce(&mut [u8]),
    {
        if len > self.capacity {
            return Err(ShmError::SizeExceeded {
                len,
                capacity: self.capacity,
            });
        }
        let buf = self.write_buffer()?;
        fill(buf);
        self.commit(len)
    }

    /// Returns the back slot for in-place filling; commit with
    /// [`Writer::commit`].
    #[inline(always)]
    pub fn write_buffer(&mut self) -> ShmResult<&mut [u8]> {
        let region = self.region.as_ref().ok_or(ShmError::NotInitialized)?;
        let hdr = unsafe { &*(region.as_ptr() as *const Header) };
        let back = 1 - hdr.publish_index.load(Ordering::Acquire);
        unsafe {
            let dst = region
                .as_mut_ptr()
                .add(HEADER_SIZE + back as usize * self.slot_size);
            Ok(std::slice::from_raw_parts_mut(dst, self.capacity))
        }
    }

    /// Publishes `len` bytes previously written via [`Writer::write_buffer`].
    #[inline(always)]
    pub fn commit(&mut self, len: usize) -> ShmResult<()> {
        let region = self.region.as_ref().ok_or(ShmError::NotInitialized)?;
        if len > self.capacity {
            return Err(ShmError::SizeExceeded {
                len,
                capacity: self.capacity,
            });
        }
        let hdr = unsafe { &*(region.as_ptr() as *const Header) };
        let back = 1 - hdr.publish_index.load(Ordering::Acquire);
        self.publish(hdr, back, len);
        Ok(())
    }

    #[inline(always)]
    fn publish(&mut self, hdr: &Header, back: u32, len: usize) {
        let now = mono_time_ns();
        self.frame_count += 1;

        let slot = &hdr.slots[back as usize];
        slot.len.store(len, Ordering::Relaxed);
        slot.timestamp_ns.store(now, Ordering::Relaxed);
        slot.seq.store(self.frame_count, Ordering::Relaxed);

        hdr.heartbeat_ns.store(now, Ordering::Relaxed);
        hdr.total_writes.fetch_add(1, Ordering::Relaxed);
        hdr.total_bytes.fetch_add(len as u64, Ordering::Relaxed);

        hdr.publish_index.store(back, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.region.is_some()
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Configuration and counter snapshot for this end.
    pub fn stats(&self) -> ChannelStats {
        let (total_writes, total_bytes) = self
            .region
            .as_ref()
            .map(|region| {
                let hdr = unsafe { &*(region.as_ptr() as *const Header) };
                (
                    hdr.total_writes.load(Ordering::Relaxed),
                    hdr.total_bytes.load(Ordering::Relaxed),
                )
            })
            .unwrap_or((0, 0));
        ChannelStats {
            huge_pages_active: self
                .region
                .as_ref()
                .is_some_and(SharedRegion::uses_huge_pages),
            prefetch_active: self.config.enable_prefetch,
            numa_node: numa_info().current_node,
            pinned_cpu: self.config.cpu_affinity,
            cache_info: cache_info(),
            total_writes,
            total_bytes,
        }
    }

    /// Unmaps the region and unlinks the channel name.
    pub fn destroy(&mut self) {
        self.region = None;
    }
}

/// The channel's reading end.
#[derive(Debug)]
pub struct Reader {
    name: String,
    capacity: usize,
    slot_size: usize,
    config: ChannelConfig,
    region: Option<SharedRegion>,
    last_seq: u64,
    last_timestamp_ns: i64,
    dropped: u64,
}

impl Reader {
    /// Creates an unconnected reader with auto-detected configuration.
    pub fn new(name: &str, capacity: usize) -> ShmResult<Self> {
        Self::with_config(name, capacity, ChannelConfig::auto_detect())
    }

    /// Creates an unconnected reader with an explicit configuration.
    pub fn with_config(name: &str, capacity: usize, config: ChannelConfig) -> ShmResult<Self> {
        validate_name(name)?;
        Ok(Self {
            name: name.to_string(),
            capacity,
            slot_size: align_up(capacity, CACHE_LINE),
            config,
            region: None,
            last_seq: 0,
            last_timestamp_ns: 0,
            dropped: 0,
        })
    }

    /// Connects to the writer's region and validates the header.
    pub fn init(&mut self) -> ShmResult<()> {
        if self.region.is_some() {
            return Ok(());
        }

        if self.config.cpu_affinity >= 0 {
            set_cpu_affinity(self.config.cpu_affinity);
        }

        let region = SharedRegion::open_ro(&self.name, self.config.use_huge_pages)?;

        let corrupt = |reason| ShmError::Corrupt {
            name: self.name.clone(),
            reason,
        };

        if region.len() < HEADER_SIZE + self.slot_size * 2 {
            return Err(corrupt("region too small for header and slots"));
        }

        let hdr = region.as_ptr() as *const Header;
        let (magic, version, capacity) = unsafe {
            (
                std::ptr::read_volatile(std::ptr::addr_of!((*hdr).magic)),
                std::ptr::read_volatile(std::ptr::addr_of!((*hdr).version)),
                std::ptr::read_volatile(std::ptr::addr_of!((*hdr).capacity)),
            )
        };
        if magic != MAGIC {
            return Err(corrupt("magic mismatch"));
        }
        if version != VERSION {
            return Err(corrupt("version mismatch"));
        }
        if capacity != self.capacity {
            return Err(corrupt("capacity differs from writer"));
        }

        self.region = Some(region);
        Ok(())
    }

    /// Fetches the latest frame zero-copy; see
    /// [`crate::dbuf::nt::Reader::latest`] for the full contract.
    #[inline(always)]
    pub fn latest(&mut self) -> ShmResult<Option<Frame<'_>>> {
        let base = self
            .region
            .as_ref()
            .ok_or(ShmError::NotInitialized)?
            .as_ptr();
        let hdr = unsafe { &*(base as *const Header) };

        let front = hdr.publish_index.load(Ordering::Acquire);
        let slot = &hdr.slots[front as usize];
        let seq = slot.seq.load(Ordering::Relaxed);
        let len = slot.len.load(Ordering::Relaxed);
        let ts = slot.timestamp_ns.load(Ordering::Relaxed);

        if seq == self.last_seq {
            return Ok(None);
        }
        if self.last_seq > 0 && seq > self.last_seq + 1 {
            self.dropped += seq - self.last_seq - 1;
        }
        self.last_seq = seq;
        self.last_timestamp_ns = ts;

        let len = len.min(self.capacity);
        let slot_base = unsafe { base.add(HEADER_SIZE + front as usize * self.slot_size) };
        if self.config.enable_prefetch {
            prefetch_range(slot_base, len.min(self.config.effective_prefetch_distance()));
        }
        let data = unsafe { std::slice::from_raw_parts(slot_base, len) };

        Ok(Some(Frame {
            data,
            seq,
            timestamp_ns: ts,
        }))
    }

    /// Copies the latest frame into `buf`.
    ///
    /// Returns `Ok(None)` when no new frame is available, and
    /// `Ok(Some((len, timestamp_ns)))` after copying `len` bytes.
    /// `buf` shorter than the frame is refused with
    /// [`ShmError::SizeExceeded`] and the frame stays unconsumed.
    pub fn read_into(&mut self, buf: &mut [u8]) -> ShmResult<Option<(usize, i64)>> {
        let base = self
            .region
            .as_ref()
            .ok_or(ShmError::NotInitialized)?
            .as_ptr();
        let hdr = unsafe { &*(base as *const Header) };

        let front = hdr.publish_index.load(Ordering::Acquire);
        let slot = &hdr.slots[front as usize];
        let seq = slot.seq.load(Ordering::Relaxed);
        let len = slot.len.load(Ordering::Relaxed).min(self.capacity);
        let ts = slot.timestamp_ns.load(Ordering::Relaxed);

        if seq == self.last_seq {
            return Ok(None);
        }
        if len > buf.len() {
            return Err(ShmError::SizeExceeded {
                len,
                capacity: buf.len(),
            });
        }
        if self.last_seq > 0 && seq > self.last_seq + 1 {
            self.dropped += seq - self.last_seq - 1;
        }
        self.last_seq = seq;
        self.last_timestamp_ns = ts;

        unsafe {
            let slot_base = base.add(HEADER_SIZE + front as usize * self.slot_size);
            if self.config.enable_prefetch {
                prefetch_range(slot_base, len.min(self.config.effective_prefetch_distance()));
            }
            std::ptr::copy_nonoverlapping(slot_base, buf.as_mut_ptr(), len);
        }

        Ok(Some((len, ts)))
    }

    /// Polls [`Reader::read_into`] until a frame arrives or `timeout_ms`
    /// elapses, yielding between attempts.
    pub fn read_with_timeout(
        &mut self,
        buf: &mut [u8],
        timeout_ms: u32,
    ) -> ShmResult<Option<(usize, i64)>> {
        let deadline = mono_time_ns() + timeout_ms as i64 * 1_000_000;
        let backoff = Backoff::new();
        loop {
            if let Some(result) = self.read_into(buf)? {
                return Ok(Some(result));
            }
            if mono_time_ns() >= deadline {
                return Ok(None);
            }
            backoff.snooze();
        }
    }

    /// Whether the writer's heartbeat is younger than `timeout_ms`.
    pub fn is_writer_alive(&self, timeout_ms: u32) -> bool {
        let Some(region) = self.region.as_ref() else {
            return false;
        };
        let hdr = unsafe { &*(region.as_ptr() as *const Header) };
        let heartbeat = hdr.heartbeat_ns.load(Ordering::Relaxed);
        (mono_time_ns() - heartbeat) / 1_000_000 < timeout_ms as i64
    }

    /// Whether the writer mapped the channel with huge pages (header
    /// flag bit 0). The reader's own mapping may still use base pages.
    pub fn writer_uses_huge_pages(&self) -> bool {
        self.region.as_ref().is_some_and(|region| {
            let hdr = unsafe { &*(region.as_ptr() as *const Header) };
            hdr.flags & FLAG_HUGE_PAGES != 0
        })
    }

    /// Page size the writer mapped with: 2 MiB with huge pages active,
    /// 0 for base pages (or before `init`).
    pub fn writer_huge_page_size(&self) -> usize {
        self.region
            .as_ref()
            .map(|region| {
                let hdr = unsafe { &*(region.as_ptr() as *const Header) };
                hdr.huge_page_size
            })
            .unwrap_or(0)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    /// Timestamp of the last frame consumed through any read path.
    pub fn last_timestamp_ns(&self) -> i64 {
        self.last_timestamp_ns
    }

    pub fn is_ready(&self) -> bool {
        self.region.is_some()
    }

    /// Configuration and counter snapshot for this end.
    pub fn stats(&self) -> ChannelStats {
        let (total_writes, total_bytes) = self
            .region
            .as_ref()
            .map(|region| {
                let hdr = unsafe { &*(region.as_ptr() as *const Header) };
                (
                    hdr.total_writes.load(Ordering::Relaxed),
                    hdr.total_bytes.load(Ordering::Relaxed),
                )
            })
            .unwrap_or((0, 0));
        ChannelStats {
            huge_pages_active: self
                .region
                .as_ref()
                .is_some_and(SharedRegion::uses_huge_pages),
            prefetch_active: self.config.enable_prefetch,
            numa_node: numa_info().current_node,
            pinned_cpu: self.config.cpu_affinity,
            cache_info: cache_info(),
            total_writes,
            total_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::unique_name;

    fn pair(capacity: usize) -> (Writer, Reader) {
        let name = unique_name("pf");
        let config = ChannelConfig::portable();
        let mut writer = Writer::with_config(&name, capacity, config).unwrap();
        writer.init().expect("writer init failed");
        let mut reader = Reader::with_config(&name, capacity, config).unwrap();
        reader.init().expect("reader init failed");
        (writer, reader)
    }

    #[test]
    fn header_layout_is_six_lines() {
        assert_eq!(HEADER_SIZE, 384);
        let lines = [
            std::mem::offset_of!(Header, publish_index) / CACHE_LINE,
            std::mem::offset_of!(Header, slots) / CACHE_LINE,
            std::mem::offset_of!(Header, slots) / CACHE_LINE + 1,
            std::mem::offset_of!(Header, heartbeat_ns) / CACHE_LINE,
            std::mem::offset_of!(Header, total_writes) / CACHE_LINE,
        ];
        for (i, a) in lines.iter().enumerate() {
            for b in lines.iter().skip(i + 1) {
                assert_ne!(a, b, "two hot fields share cache line {}", a);
            }
        }
    }

    #[test]
    fn write_then_zero_copy_read() {
        let (mut writer, mut reader) = pair(512);

        let payload: Vec<u8> = (0..512).map(|i| (i % 256) as u8).collect();
        writer.write(&payload).unwrap();

        let frame = reader.latest().unwrap().expect("frame expected");
        assert_eq!(frame.seq, 1);
        assert_eq!(frame.data, &payload[..]);
        assert!(reader.latest().unwrap().is_none(), "no new data expected");
    }

    #[test]
    fn copying_read_matches_published_bytes() {
        let (mut writer, mut reader) = pair(256);

        writer.write(b"copy me out").unwrap();

        let mut buf = [0u8; 256];
        let (len, ts) = reader
            .read_into(&mut buf)
            .unwrap()
            .expect("frame expected");
        assert_eq!(&buf[..len], b"copy me out");
        assert!(ts > 0);
        assert_eq!(reader.last_timestamp_ns(), ts);

        assert!(
            reader.read_into(&mut buf).unwrap().is_none(),
            "second read without a publish must see nothing"
        );
    }

    #[test]
    fn short_destination_buffer_is_refused() {
        let (mut writer, mut reader) = pair(256);
        writer.write(&[7u8; 100]).unwrap();

        let mut small = [0u8; 50];
        match reader.read_into(&mut small) {
            Err(ShmError::SizeExceeded { len, capacity }) => {
                assert_eq!(len, 100);
                assert_eq!(capacity, 50);
            }
            other => panic!("expected SizeExceeded, got {other:?}"),
        }

        // The frame was not consumed by the failed read.
        let mut big = [0u8; 256];
        assert!(reader.read_into(&mut big).unwrap().is_some());
    }

    #[test]
    fn write_with_fills_in_place() {
        let (mut writer, mut reader) = pair(128);

        writer
            .write_with(16, |buf| {
                for (i, b) in buf.iter_mut().take(16).enumerate() {
                    *b = (i * 3) as u8;
                }
            })
            .unwrap();

        let frame = reader.latest().unwrap().expect("frame expected");
        assert_eq!(frame.len(), 16);
        assert_eq!(frame.data[5], 15);
    }

    #[test]
    fn write_with_oversized_len_is_refused() {
        let (mut writer, _reader) = pair(64);
        let result = writer.write_with(65, |_| panic!("fill must not run"));
        assert!(matches!(result, Err(ShmError::SizeExceeded { .. })));
    }

    #[test]
    fn read_with_timeout_times_out_empty() {
        let (_writer, mut reader) = pair(64);

        let mut buf = [0u8; 64];
        let start = mono_time_ns();
        let result = reader.read_with_timeout(&mut buf, 20).unwrap();
        let elapsed_ms = (mono_time_ns() - start) / 1_000_000;

        assert!(result.is_none());
        assert!(elapsed_ms >= 20, "returned after {}ms, before timeout", elapsed_ms);
    }

    #[test]
    fn read_with_timeout_sees_concurrent_publish() {
        let name = unique_name("pf_timed");
        let config = ChannelConfig::portable();
        let mut writer = Writer::with_config(&name, 64, config).unwrap();
        writer.init().unwrap();
        let mut reader = Reader::with_config(&name, 64, config).unwrap();
        reader.init().unwrap();

        let publisher = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(10));
            writer.write(b"late frame").unwrap();
            writer
        });

        let mut buf = [0u8; 64];
        let result = reader.read_with_timeout(&mut buf, 1000).unwrap();
        let (len, _ts) = result.expect("publish within the timeout must be seen");
        assert_eq!(&buf[..len], b"late frame");

        publisher.join().unwrap();
    }

    #[test]
    fn drop_accounting_via_copying_reads() {
        let (mut writer, mut reader) = pair(64);

        let mut buf = [0u8; 64];
        writer.write(b"a").unwrap();
        reader.read_into(&mut buf).unwrap().expect("frame expected");

        for _ in 0..4 {
            writer.write(b"b").unwrap();
        }
        reader.read_into(&mut buf).unwrap().expect("frame expected");
        assert_eq!(reader.dropped(), 3);
    }

    #[test]
    fn stats_reflect_totals_and_config() {
        let (mut writer, mut reader) = pair(128);

        writer.write(&[1u8; 100]).unwrap();
        writer.write(&[2u8; 28]).unwrap();

        let ws = writer.stats();
        assert_eq!(ws.total_writes, 2);
        assert_eq!(ws.total_bytes, 128);
        assert!(ws.prefetch_active);
        assert!(!ws.huge_pages_active, "portable config uses base pages");
        assert!(!reader.writer_uses_huge_pages());
        assert_eq!(reader.writer_huge_page_size(), 0);

        let _ = reader.latest().unwrap();
        let rs = reader.stats();
        assert_eq!(rs.total_writes, 2);
        assert_eq!(rs.total_bytes, 128);
    }

    #[test]
    fn mismatched_magic_is_corrupt() {
        // A channel created by the non-temporal variant has a different
        // magic; this reader must refuse it.
        let name = unique_name("pf_cross");
        let mut other = crate::dbuf::nt::Writer::new(&name, 64, false).unwrap();
        other.init().unwrap();

        let mut reader = Reader::with_config(&name, 64, ChannelConfig::portable()).unwrap();
        assert!(matches!(reader.init(), Err(ShmError::Corrupt { .. })));
    }

    #[test]
    fn liveness_and_last_payload_after_writer_stops() {
        let (mut writer, mut reader) = pair(64);

        writer.write(b"final").unwrap();
        assert!(reader.is_writer_alive(1000));
        writer.destroy();

        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!reader.is_writer_alive(5));

        // Mapping outlives the writer: the last frame is still there.
        let frame = reader.latest().unwrap().expect("last frame readable");
        assert_eq!(frame.data, b"final");
    }
}
