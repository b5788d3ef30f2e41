//! Broadcast transport with per-consumer ring buffers.
//!
//! Unlike the double-buffer family, this transport preserves a bounded
//! history: every consumer owns a private ring of `ring_size` slots in
//! its own named region, and the producer fans each publish out into
//! every registered ring. A consumer can therefore look back at the
//! most recent `ring_size` frames, not just the latest one.
//!
//! Coordination happens through a small registry region owned by the
//! producer: consumers claim one of its fixed entries with a
//! compare-exchange on the entry's `active` flag and advertise the name
//! and size of their ring there. The producer re-reads the registry on
//! every publish, mapping newly active rings read-write and unmapping
//! deactivated ones. The registry holds names, never pointers.

use crate::error::{ShmError, ShmResult};
use crate::region::SharedRegion;
use crate::topology::CACHE_LINE;
use crate::utils::{align_up, mono_time_ns, validate_name};
use static_assertions::const_assert_eq;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, AtomicUsize, Ordering};

/// Registry and ring magic.
pub const MAGIC: u32 = 0xD1EC7002;
/// Registry version.
pub const VERSION: u32 = 2;
/// Fixed number of registry entries, and so the consumer limit.
pub const MAX_CONSUMERS: usize = 16;
/// Ring size used when the consumer does not choose one.
pub const DEFAULT_RING_SIZE: u32 = 30;

/// Bytes reserved for a consumer's ring-region name (NUL-terminated).
const NAME_BYTES: usize = 64;

/// One registry entry: a claimable consumer slot.
///
/// `active` is the claim token. A consumer publishes `name` and
/// `ring_size` with a release store of `active` after winning the
/// claim; the producer's acquire load of `active` makes both visible.
#[repr(C)]
struct RegistryEntry {
    active: AtomicBool,
    _pad: [u8; 3],
    ring_size: u32,
    name: [u8; NAME_BYTES],
}

/// Registry region header.
#[repr(C, align(64))]
struct RegistryHeader {
    // Cache line 0: static metadata plus the consumer count.
    magic: u32,
    version: u32,
    max_slot_size: usize,
    num_readers: AtomicU32,
    _pad0: [u8; CACHE_LINE - 20],

    // Cache line 1: producer heartbeat, stored on every publish.
    writer_heartbeat_ns: AtomicI64,
    _pad1: [u8; CACHE_LINE - 8],

    entries: [RegistryEntry; MAX_CONSUMERS],
}

const REGISTRY_SIZE: usize = std::mem::size_of::<RegistryHeader>();

const_assert_eq!(std::mem::size_of::<RegistryEntry>(), 72);
const_assert_eq!(REGISTRY_SIZE % CACHE_LINE, 0);
const_assert_eq!(std::mem::offset_of!(RegistryHeader, writer_heartbeat_ns), CACHE_LINE);
const_assert_eq!(std::mem::offset_of!(RegistryHeader, entries), 2 * CACHE_LINE);

/// Ring region header, three cache lines.
#[repr(C, align(64))]
struct RingHeader {
    // Cache line 0: static metadata, written once by the ring's owner.
    magic: u32,
    ring_size: u32,
    slot_data_size: usize,
    slot_total_size: usize,
    _pad0: [u8; CACHE_LINE - 24],

    // Cache line 1: next slot the producer writes (cyclic).
    write_idx: AtomicU32,
    _pad1: [u8; CACHE_LINE - 4],

    // Cache line 2: total frames ever written into this ring.
    total_writes: AtomicU64,
    _pad2: [u8; CACHE_LINE - 8],
}

const RING_HEADER_SIZE: usize = std::mem::size_of::<RingHeader>();

const_assert_eq!(RING_HEADER_SIZE, 3 * CACHE_LINE);
const_assert_eq!(std::mem::offset_of!(RingHeader, write_idx), CACHE_LINE);
const_assert_eq!(std::mem::offset_of!(RingHeader, total_writes), 2 * CACHE_LINE);

/// Per-slot record preceding the payload. `sequence == 0` means the
/// slot was never written.
#[repr(C, align(64))]
struct RingSlot {
    sequence: AtomicU64,
    timestamp_ns: AtomicI64,
    data_size: AtomicUsize,
    _pad: [u8; CACHE_LINE - 24],
}

const SLOT_HEADER_SIZE: usize = std::mem::size_of::<RingSlot>();

const_assert_eq!(SLOT_HEADER_SIZE, CACHE_LINE);

#[inline(always)]
fn slot_total_size(max_slot_size: usize) -> usize {
    SLOT_HEADER_SIZE + align_up(max_slot_size, CACHE_LINE)
}

#[inline(always)]
fn ring_region_size(ring_size: u32, max_slot_size: usize) -> usize {
    RING_HEADER_SIZE + ring_size as usize * slot_total_size(max_slot_size)
}

/// One mapped consumer ring, as seen from the producer.
#[derive(Debug)]
struct MappedRing {
    region: SharedRegion,
    ring_size: u32,
}

impl MappedRing {
    #[inline(always)]
    fn header(&self) -> &RingHeader {
        unsafe { &*(self.region.as_ptr() as *const RingHeader) }
    }

    /// Pointer to the slot record at `idx`.
    ///
    /// # Safety
    ///
    /// `idx` must be below `ring_size`; the mapping length was verified
    /// against `ring_region_size` when the ring was opened.
    #[inline(always)]
    unsafe fn slot(&self, idx: u32, slot_total: usize) -> *mut RingSlot {
        unsafe {
            self.region
                .as_mut_ptr()
                .add(RING_HEADER_SIZE + idx as usize * slot_total) as *mut RingSlot
        }
    }
}

/// The broadcast producer.
///
/// Owns the registry region; its destruction unlinks the registry name.
/// Each publish is fanned out into every active consumer ring, so the
/// cost of `write` grows linearly with the number of consumers.
#[derive(Debug)]
pub struct Producer {
    channel: String,
    max_slot_size: usize,
    slot_total: usize,
    registry: Option<SharedRegion>,
    rings: Vec<Option<MappedRing>>,
}

impl Producer {
    /// Creates an uninitialized producer for `channel` with a maximum
    /// payload of `max_slot_size` bytes per frame.
    pub fn new(channel: &str, max_slot_size: usize) -> ShmResult<Self> {
        validate_name(channel)?;
        Ok(Self {
            channel: channel.to_string(),
            max_slot_size,
            slot_total: slot_total_size(max_slot_size),
            registry: None,
            rings: Vec::new(),
        })
    }

    /// Creates the registry region and opens the channel for consumers.
    pub fn init(&mut self) -> ShmResult<()> {
        if self.registry.is_some() {
            return Ok(());
        }

        let region = SharedRegion::create(&self.channel, REGISTRY_SIZE, false)?;

        let hdr = region.as_mut_ptr() as *mut RegistryHeader;
        unsafe {
            (*hdr).magic = MAGIC;
            (*hdr).version = VERSION;
            (*hdr).max_slot_size = self.max_slot_size;
            (*hdr).num_readers.store(0, Ordering::Relaxed);
            (*hdr)
                .writer_heartbeat_ns
                .store(mono_time_ns(), Ordering::Relaxed);
            // Entries are already zeroed: inactive, empty names.
        }
        std::sync::atomic::fence(Ordering::Release);

        self.registry = Some(region);
        self.rings = (0..MAX_CONSUMERS).map(|_| None).collect();
        Ok(())
    }

    /// Reconciles the mapped rings with the registry's active flags:
    /// newly active entries are opened read-write, deactivated ones are
    /// unmapped. Entries whose advertised ring cannot be opened (e.g. a
    /// consumer crashed between unlink and flag clear) are skipped.
    fn refresh_rings(&mut self) {
        let Some(registry) = self.registry.as_ref() else {
            return;
        };
        let hdr = unsafe { &*(registry.as_ptr() as *const RegistryHeader) };

        for (idx, entry) in hdr.entries.iter().enumerate() {
            let active = entry.active.load(Ordering::Acquire);

            if active && self.rings[idx].is_none() {
                // Copy the advertised name out before parsing: the entry
                // fields are plain bytes owned by the claiming consumer.
                let mut name_buf = [0u8; NAME_BYTES];
                let ring_size = unsafe {
                    std::ptr::copy_nonoverlapping(
                        std::ptr::addr_of!(entry.name) as *const u8,
                        name_buf.as_mut_ptr(),
                        NAME_BYTES,
                    );
                    std::ptr::read_volatile(std::ptr::addr_of!(entry.ring_size))
                };

                let len = name_buf.iter().position(|&b| b == 0).unwrap_or(NAME_BYTES);
                if len == 0 {
                    // Claimed but not yet advertised; pick it up next time.
                    continue;
                }
                let Ok(name) = std::str::from_utf8(&name_buf[..len]) else {
                    continue;
                };
                let ring_size = if ring_size == 0 {
                    DEFAULT_RING_SIZE
                } else {
                    ring_size
                };

                match SharedRegion::open_rw(name) {
                    Ok(region) => {
                        if region.len() < ring_region_size(ring_size, self.max_slot_size) {
                            log::warn!("consumer ring '{name}' is undersized, skipping");
                            continue;
                        }
                        // Cross-check the ring's own header before
                        // trusting the slot arithmetic.
                        let rh = region.as_ptr() as *const RingHeader;
                        let consistent = unsafe {
                            std::ptr::read_volatile(std::ptr::addr_of!((*rh).magic)) == MAGIC
                                && std::ptr::read_volatile(std::ptr::addr_of!((*rh).ring_size))
                                    == ring_size
                                && std::ptr::read_volatile(std::ptr::addr_of!(
                                    (*rh).slot_data_size
                                )) == self.max_slot_size
                                && std::ptr::read_volatile(std::ptr::addr_of!(
                                    (*rh).slot_total_size
                                )) == self.slot_total
                        };
                        if !consistent {
                            log::warn!("consumer ring '{name}' has an inconsistent header, skipping");
                            continue;
                        }
                        self.rings[idx] = Some(MappedRing { region, ring_size });
                    }
                    Err(err) => {
                        log::debug!("cannot map consumer ring '{name}': {err}");
                    }
                }
            } else if !active && self.rings[idx].is_some() {
                self.rings[idx] = None;
            }
        }
    }

    /// Publishes one frame into every active consumer ring.
    ///
    /// Per ring: the payload is copied into the slot at `write_idx`, the
    /// slot's metadata is stored, the slot's `sequence` is published
    /// with a release store, and then `write_idx` advances cyclically
    /// and `total_writes` is bumped (release). Returns the number of
    /// consumers written to; zero consumers is a successful no-op.
    pub fn write(&mut self, data: &[u8]) -> ShmResult<usize> {
        if self.registry.is_none() {
            return Err(ShmError::NotInitialized);
        }
        if data.len() > self.max_slot_size {
            return Err(ShmError::SizeExceeded {
                len: data.len(),
                capacity: self.max_slot_size,
            });
        }

        self.refresh_rings();
        let now = mono_time_ns();
        let mut written = 0;

        for ring in self.rings.iter().flatten() {
            let hdr = ring.header();
            let idx = hdr.write_idx.load(Ordering::Relaxed);

            unsafe {
                let slot = ring.slot(idx, self.slot_total);
                let payload = (slot as *mut u8).add(SLOT_HEADER_SIZE);
                std::ptr::copy_nonoverlapping(data.as_ptr(), payload, data.len());

                let seq = hdr.total_writes.load(Ordering::Relaxed) + 1;
                (*slot).data_size.store(data.len(), Ordering::Relaxed);
                (*slot).timestamp_ns.store(now, Ordering::Relaxed);
                (*slot).sequence.store(seq, Ordering::Release);

                hdr.write_idx
                    .store((idx + 1) % ring.ring_size, Ordering::Relaxed);
                hdr.total_writes.store(seq, Ordering::Release);
            }
            written += 1;
        }

        self.touch_heartbeat(now);
        Ok(written)
    }

    /// Zero-copy publish, step one: the current write slot of every
    /// active ring, for in-place filling. Step two is
    /// [`Producer::commit_slots`].
    ///
    /// The slices point into distinct consumer rings; the same payload
    /// is expected to be written into each of them.
    pub fn write_slots(&mut self) -> ShmResult<Vec<&mut [u8]>> {
        if self.registry.is_none() {
            return Err(ShmError::NotInitialized);
        }
        self.refresh_rings();

        let slot_total = self.slot_total;
        let max = self.max_slot_size;
        let slots = self
            .rings
            .iter()
            .flatten()
            .map(|ring| {
                let idx = ring.header().write_idx.load(Ordering::Relaxed);
                unsafe {
                    let payload = (ring.slot(idx, slot_total) as *mut u8).add(SLOT_HEADER_SIZE);
                    std::slice::from_raw_parts_mut(payload, max)
                }
            })
            .collect();
        Ok(slots)
    }

    /// Zero-copy publish, step two: commits `len` bytes in every ring's
    /// current write slot and advances the cursors.
    pub fn commit_slots(&mut self, len: usize) -> ShmResult<usize> {
        if self.registry.is_none() {
            return Err(ShmError::NotInitialized);
        }
        if len > self.max_slot_size {
            return Err(ShmError::SizeExceeded {
                len,
                capacity: self.max_slot_size,
            });
        }

        let now = mono_time_ns();
        let mut committed = 0;

        for ring in self.rings.iter().flatten() {
            let hdr = ring.header();
            let idx = hdr.write_idx.load(Ordering::Relaxed);

            unsafe {
                let slot = ring.slot(idx, self.slot_total);
                let seq = hdr.total_writes.load(Ordering::Relaxed) + 1;
                (*slot).data_size.store(len, Ordering::Relaxed);
                (*slot).timestamp_ns.store(now, Ordering::Relaxed);
                (*slot).sequence.store(seq, Ordering::Release);

                hdr.write_idx
                    .store((idx + 1) % ring.ring_size, Ordering::Relaxed);
                hdr.total_writes.store(seq, Ordering::Release);
            }
            committed += 1;
        }

        self.touch_heartbeat(now);
        Ok(committed)
    }

    fn touch_heartbeat(&self, now: i64) {
        if let Some(registry) = self.registry.as_ref() {
            let hdr = unsafe { &*(registry.as_ptr() as *const RegistryHeader) };
            hdr.writer_heartbeat_ns.store(now, Ordering::Release);
        }
    }

    /// Number of consumers currently registered.
    pub fn reader_count(&self) -> u32 {
        self.registry
            .as_ref()
            .map(|registry| {
                let hdr = unsafe { &*(registry.as_ptr() as *const RegistryHeader) };
                hdr.num_readers.load(Ordering::Relaxed)
            })
            .unwrap_or(0)
    }

    pub fn is_ready(&self) -> bool {
        self.registry.is_some()
    }

    /// Maximum payload size per frame.
    pub fn max_slot_size(&self) -> usize {
        self.max_slot_size
    }

    /// Unmaps all rings and unlinks the registry.
    pub fn destroy(&mut self) {
        self.rings.clear();
        self.registry = None;
    }
}

/// A broadcast consumer.
///
/// Owns its private ring region: `init` creates and registers it,
/// `Drop` deregisters and unlinks it. All accessors return borrowed
/// views into the ring; because the producer keeps writing into the
/// ring concurrently, a slot older than `ring_size - 1` frames can be
/// overwritten while it is being read. This is the same latest-wins
/// trade the double-buffer transports make, spread over a history.
#[derive(Debug)]
pub struct Consumer {
    channel: String,
    ring_name: String,
    max_slot_size: usize,
    ring_size: u32,
    slot_total: usize,
    registry: Option<SharedRegion>,
    ring: Option<SharedRegion>,
    entry_idx: Option<usize>,
}

impl Consumer {
    /// Creates an unconnected consumer with the default ring size.
    pub fn new(channel: &str, max_slot_size: usize) -> ShmResult<Self> {
        Self::with_ring_size(channel, max_slot_size, DEFAULT_RING_SIZE)
    }

    /// Creates an unconnected consumer with an explicit ring size.
    ///
    /// # Panics
    ///
    /// Panics if `ring_size` is zero.
    pub fn with_ring_size(channel: &str, max_slot_size: usize, ring_size: u32) -> ShmResult<Self> {
        assert!(ring_size > 0, "ring_size must be at least 1");
        validate_name(channel)?;

        // Ring names must stay unique even when one process runs
        // several consumers, so the pid alone is not enough.
        static RING_COUNTER: AtomicU32 = AtomicU32::new(0);
        let ring_name = format!(
            "{}_rb{}_{}",
            channel,
            std::process::id(),
            RING_COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        validate_name(&ring_name)?;

        Ok(Self {
            channel: channel.to_string(),
            ring_name,
            max_slot_size,
            ring_size,
            slot_total: slot_total_size(max_slot_size),
            registry: None,
            ring: None,
            entry_idx: None,
        })
    }

    /// Connects to the producer's registry, creates the private ring,
    /// and claims a registry entry.
    ///
    /// Returns [`ShmError::NotFound`] while the producer has not
    /// created the registry yet, and [`ShmError::RegistryFull`] when
    /// all entries are taken. Failures leave nothing behind: the ring
    /// region and registry mapping unwind automatically.
    pub fn init(&mut self) -> ShmResult<()> {
        if self.ring.is_some() {
            return Ok(());
        }

        let registry = SharedRegion::open_rw(&self.channel)?;

        let corrupt = |reason| ShmError::Corrupt {
            name: self.channel.clone(),
            reason,
        };

        if registry.len() < REGISTRY_SIZE {
            return Err(corrupt("registry region too small"));
        }

        let hdr_ptr = registry.as_ptr() as *const RegistryHeader;
        let (magic, version, max_slot_size) = unsafe {
            (
                std::ptr::read_volatile(std::ptr::addr_of!((*hdr_ptr).magic)),
                std::ptr::read_volatile(std::ptr::addr_of!((*hdr_ptr).version)),
                std::ptr::read_volatile(std::ptr::addr_of!((*hdr_ptr).max_slot_size)),
            )
        };
        if magic != MAGIC {
            return Err(corrupt("magic mismatch"));
        }
        if version != VERSION {
            return Err(corrupt("version mismatch"));
        }
        if max_slot_size != self.max_slot_size {
            return Err(corrupt("slot size differs from producer"));
        }

        // Private ring region; all slot sequences start at zero.
        let ring = SharedRegion::create(
            &self.ring_name,
            ring_region_size(self.ring_size, self.max_slot_size),
            false,
        )?;

        let ring_hdr = ring.as_mut_ptr() as *mut RingHeader;
        unsafe {
            (*ring_hdr).magic = MAGIC;
            (*ring_hdr).ring_size = self.ring_size;
            (*ring_hdr).slot_data_size = self.max_slot_size;
            (*ring_hdr).slot_total_size = self.slot_total;
            (*ring_hdr).write_idx.store(0, Ordering::Relaxed);
            (*ring_hdr).total_writes.store(0, Ordering::Relaxed);
        }
        std::sync::atomic::fence(Ordering::Release);

        // Claim a registry entry: win the flag, fill in the entry, then
        // re-publish the flag so the producer's acquire sees the name.
        let hdr = unsafe { &*hdr_ptr };
        let entries_base = unsafe {
            registry
                .as_mut_ptr()
                .add(std::mem::offset_of!(RegistryHeader, entries))
                as *mut RegistryEntry
        };
        let mut claimed = None;
        for (idx, entry) in hdr.entries.iter().enumerate() {
            if entry
                .active
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                unsafe {
                    let entry_ptr = entries_base.add(idx);
                    let name = self.ring_name.as_bytes();
                    (&mut (*entry_ptr).name)[..name.len()].copy_from_slice(name);
                    (&mut (*entry_ptr).name)[name.len()..].fill(0);
                    (*entry_ptr).ring_size = self.ring_size;
                }
                entry.active.store(true, Ordering::Release);
                claimed = Some(idx);
                break;
            }
        }

        let Some(idx) = claimed else {
            // `ring` and `registry` unwind here, unlinking the ring.
            return Err(ShmError::RegistryFull(MAX_CONSUMERS));
        };

        hdr.num_readers.fetch_add(1, Ordering::AcqRel);
        log::debug!(
            "consumer registered on '{}' as entry {idx} (ring '{}', {} slots)",
            self.channel,
            self.ring_name,
            self.ring_size
        );

        self.registry = Some(registry);
        self.ring = Some(ring);
        self.entry_idx = Some(idx);
        Ok(())
    }

    #[inline(always)]
    fn ring_header(&self) -> ShmResult<&RingHeader> {
        let ring = self.ring.as_ref().ok_or(ShmError::NotInitialized)?;
        Ok(unsafe { &*(ring.as_ptr() as *const RingHeader) })
    }

    /// Borrowed payload of the slot at `idx`, without checks.
    ///
    /// # Safety
    ///
    /// `idx` must be below `ring_size` and the ring must be mapped.
    #[inline(always)]
    unsafe fn payload_unchecked(&self, idx: u32, len: usize) -> &[u8] {
        let ring = self.ring.as_ref().expect("ring is mapped");
        unsafe {
            let base = ring
                .as_ptr()
                .add(RING_HEADER_SIZE + idx as usize * self.slot_total + SLOT_HEADER_SIZE);
            std::slice::from_raw_parts(base, len)
        }
    }

    #[inline(always)]
    fn slot_record(&self, idx: u32) -> Option<&RingSlot> {
        if idx >= self.ring_size {
            return None;
        }
        let ring = self.ring.as_ref()?;
        Some(unsafe {
            &*(ring
                .as_ptr()
                .add(RING_HEADER_SIZE + idx as usize * self.slot_total)
                as *const RingSlot)
        })
    }

    /// The most recently written payload, or `None` before the first
    /// write reaches this ring.
    pub fn latest(&self) -> Option<&[u8]> {
        let hdr = self.ring_header().ok()?;
        if hdr.total_writes.load(Ordering::Acquire) == 0 {
            return None;
        }
        let write_idx = hdr.write_idx.load(Ordering::Relaxed);
        let latest_idx = (write_idx + self.ring_size - 1) % self.ring_size;

        let slot = self.slot_record(latest_idx)?;
        let len = slot
            .data_size
            .load(Ordering::Relaxed)
            .min(self.max_slot_size);
        Some(unsafe { self.payload_unchecked(latest_idx, len) })
    }

    /// The payload in slot `idx`, or `None` when the slot was never
    /// written (or `idx` is out of range).
    pub fn slot(&self, idx: u32) -> Option<&[u8]> {
        let slot = self.slot_record(idx)?;
        if slot.sequence.load(Ordering::Acquire) == 0 {
            return None;
        }
        let len = slot
            .data_size
            .load(Ordering::Relaxed)
            .min(self.max_slot_size);
        Some(unsafe { self.payload_unchecked(idx, len) })
    }

    /// Total frames ever written into this ring.
    pub fn total_writes(&self) -> u64 {
        self.ring_header()
            .map(|hdr| hdr.total_writes.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// The slot the producer will write next.
    pub fn write_index(&self) -> u32 {
        self.ring_header()
            .map(|hdr| hdr.write_idx.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Timestamp of the most recently written slot, 0 before any write.
    pub fn latest_timestamp_ns(&self) -> i64 {
        let Ok(hdr) = self.ring_header() else {
            return 0;
        };
        let write_idx = hdr.write_idx.load(Ordering::Relaxed);
        let latest_idx = (write_idx + self.ring_size - 1) % self.ring_size;
        self.slot_timestamp_ns(latest_idx)
    }

    /// Timestamp of slot `idx`, 0 for unwritten or out-of-range slots.
    pub fn slot_timestamp_ns(&self, idx: u32) -> i64 {
        self.slot_record(idx)
            .map(|slot| slot.timestamp_ns.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Sequence number of slot `idx`, 0 for unwritten or out-of-range
    /// slots.
    pub fn slot_sequence(&self, idx: u32) -> u64 {
        self.slot_record(idx)
            .map(|slot| slot.sequence.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Whether the producer's heartbeat is younger than `timeout_ms`.
    pub fn is_writer_alive(&self, timeout_ms: u32) -> bool {
        let Some(registry) = self.registry.as_ref() else {
            return false;
        };
        let hdr = unsafe { &*(registry.as_ptr() as *const RegistryHeader) };
        let heartbeat = hdr.writer_heartbeat_ns.load(Ordering::Relaxed);
        (mono_time_ns() - heartbeat) / 1_000_000 < timeout_ms as i64
    }

    /// Number of slots in this consumer's ring.
    pub fn ring_size(&self) -> u32 {
        self.ring_size
    }

    pub fn is_ready(&self) -> bool {
        self.ring.is_some()
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        if let (Some(registry), Some(idx)) = (self.registry.as_ref(), self.entry_idx) {
            let hdr = unsafe { &*(registry.as_ptr() as *const RegistryHeader) };
            hdr.entries[idx].active.store(false, Ordering::Release);
            hdr.num_readers.fetch_sub(1, Ordering::AcqRel);
        }
        // `ring` (owner) unlinks its region, `registry` only unmaps.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::unique_name;

    fn producer_with_consumers(
        max_slot_size: usize,
        ring_size: u32,
        consumers: usize,
    ) -> (Producer, Vec<Consumer>) {
        let channel = unique_name("ring");
        let mut producer = Producer::new(&channel, max_slot_size).unwrap();
        producer.init().expect("producer init failed");

        let consumers = (0..consumers)
            .map(|_| {
                let mut consumer =
                    Consumer::with_ring_size(&channel, max_slot_size, ring_size).unwrap();
                consumer.init().expect("consumer init failed");
                consumer
            })
            .collect();
        (producer, consumers)
    }

    #[test]
    fn hot_ring_atomics_live_on_distinct_cache_lines() {
        let lines = [
            std::mem::offset_of!(RingHeader, write_idx) / CACHE_LINE,
            std::mem::offset_of!(RingHeader, total_writes) / CACHE_LINE,
        ];
        assert_ne!(lines[0], lines[1]);
        assert_ne!(
            std::mem::offset_of!(RegistryHeader, writer_heartbeat_ns) / CACHE_LINE,
            0,
            "heartbeat must not share the static line"
        );
    }

    #[test]
    fn single_consumer_roundtrip() {
        let (mut producer, consumers) = producer_with_consumers(128, 4, 1);
        let consumer = &consumers[0];

        assert!(consumer.latest().is_none(), "no data before first write");
        assert_eq!(consumer.total_writes(), 0);

        let written = producer.write(b"broadcast me").unwrap();
        assert_eq!(written, 1);

        assert_eq!(consumer.latest().expect("latest expected"), b"broadcast me");
        assert_eq!(consumer.total_writes(), 1);
        assert_eq!(consumer.write_index(), 1);
        assert_eq!(consumer.slot_sequence(0), 1);
        assert!(consumer.latest_timestamp_ns() > 0);
    }

    #[test]
    fn history_is_addressable_until_overwritten() {
        // ring_size 4, five writes: slot 0 is overwritten by the fifth
        // frame, slots 1..3 still hold frames 2, 3, 4.
        let (mut producer, consumers) = producer_with_consumers(64, 4, 1);
        let consumer = &consumers[0];

        for seq in 1u8..=5 {
            producer.write(&[seq; 8]).unwrap();
        }

        assert_eq!(consumer.slot(0).unwrap(), &[5u8; 8]);
        assert_eq!(consumer.slot(1).unwrap(), &[2u8; 8]);
        assert_eq!(consumer.slot(2).unwrap(), &[3u8; 8]);
        assert_eq!(consumer.slot(3).unwrap(), &[4u8; 8]);

        assert_eq!(consumer.slot_sequence(0), 5);
        assert_eq!(consumer.slot_sequence(1), 2);

        assert_eq!(consumer.latest().unwrap(), &[5u8; 8]);
        assert_eq!(consumer.total_writes(), 5);
        assert_eq!(consumer.write_index(), 1, "cursor wrapped past slot 0");
    }

    #[test]
    fn partial_history_keeps_write_order() {
        let (mut producer, consumers) = producer_with_consumers(64, 8, 1);
        let consumer = &consumers[0];

        for seq in 1u8..=3 {
            producer.write(&[seq; 4]).unwrap();
        }

        for idx in 0..3u32 {
            assert_eq!(
                consumer.slot(idx).unwrap(),
                &[(idx + 1) as u8; 4],
                "slot {} must hold frame {}",
                idx,
                idx + 1
            );
        }
        for idx in 3..8u32 {
            assert!(
                consumer.slot(idx).is_none(),
                "slot {} was never written",
                idx
            );
            assert_eq!(consumer.slot_sequence(idx), 0);
        }
    }

    #[test]
    fn fan_out_reaches_every_consumer() {
        let (mut producer, consumers) = producer_with_consumers(64, 4, 3);

        assert_eq!(producer.reader_count(), 3);

        let frames: u64 = 7;
        for i in 0..frames {
            let written = producer.write(&[i as u8; 16]).unwrap();
            assert_eq!(written, 3, "every registered consumer must be reached");
        }

        for consumer in &consumers {
            assert_eq!(consumer.total_writes(), frames);
            assert_eq!(consumer.latest().unwrap(), &[(frames - 1) as u8; 16]);
        }
    }

    #[test]
    fn heartbeat_is_monotonic_across_publishes() {
        let (mut producer, consumers) = producer_with_consumers(32, 2, 1);
        let consumer = &consumers[0];

        producer.write(b"a").unwrap();
        assert!(consumer.is_writer_alive(1000));

        let registry = producer.registry.as_ref().unwrap();
        let hdr = unsafe { &*(registry.as_ptr() as *const RegistryHeader) };
        let first = hdr.writer_heartbeat_ns.load(Ordering::Relaxed);

        std::thread::sleep(std::time::Duration::from_millis(2));
        producer.write(b"b").unwrap();
        let second = hdr.writer_heartbeat_ns.load(Ordering::Relaxed);
        assert!(second > first, "heartbeat must advance with publishes");
    }

    #[test]
    fn consumer_drop_releases_registry_entry() {
        let (mut producer, mut consumers) = producer_with_consumers(32, 2, 2);

        assert_eq!(producer.reader_count(), 2);
        assert_eq!(producer.write(b"x").unwrap(), 2);

        consumers.pop();
        assert_eq!(producer.reader_count(), 1);
        assert_eq!(
            producer.write(b"y").unwrap(),
            1,
            "producer must unmap the departed consumer's ring"
        );

        consumers.pop();
        assert_eq!(producer.reader_count(), 0);
        assert_eq!(producer.write(b"z").unwrap(), 0, "no consumers is a no-op");
    }

    #[test]
    fn registry_full_after_sixteen_consumers() {
        let channel = unique_name("ring_full");
        let mut producer = Producer::new(&channel, 32).unwrap();
        producer.init().unwrap();

        let mut consumers = Vec::new();
        for i in 0..MAX_CONSUMERS {
            let mut consumer = Consumer::with_ring_size(&channel, 32, 2).unwrap();
            consumer
                .init()
                .unwrap_or_else(|e| panic!("consumer {} must register: {e:?}", i));
            consumers.push(consumer);
        }
        assert_eq!(producer.reader_count(), MAX_CONSUMERS as u32);

        let mut overflow = Consumer::with_ring_size(&channel, 32, 2).unwrap();
        match overflow.init() {
            Err(ShmError::RegistryFull(n)) => assert_eq!(n, MAX_CONSUMERS),
            other => panic!("expected RegistryFull, got {other:?}"),
        }

        // A released entry becomes claimable again.
        consumers.pop();
        overflow.init().expect("freed entry must be claimable");
        assert_eq!(producer.reader_count(), MAX_CONSUMERS as u32);
    }

    #[test]
    fn zero_copy_fan_out() {
        let (mut producer, consumers) = producer_with_consumers(64, 4, 2);

        let slots = producer.write_slots().unwrap();
        assert_eq!(slots.len(), 2);
        for slot in slots {
            slot[..9].copy_from_slice(b"same data");
        }
        let committed = producer.commit_slots(9).unwrap();
        assert_eq!(committed, 2);

        for consumer in &consumers {
            assert_eq!(consumer.latest().unwrap(), b"same data");
            assert_eq!(consumer.total_writes(), 1);
        }
    }

    #[test]
    fn oversized_write_is_refused() {
        let (mut producer, _consumers) = producer_with_consumers(32, 2, 1);
        assert!(matches!(
            producer.write(&[0u8; 33]),
            Err(ShmError::SizeExceeded { .. })
        ));
        assert!(matches!(
            producer.commit_slots(33),
            Err(ShmError::SizeExceeded { .. })
        ));
    }

    #[test]
    fn lifecycle_errors() {
        let channel = unique_name("ring_lifecycle");

        let mut cold = Producer::new(&channel, 32).unwrap();
        assert!(matches!(cold.write(b"x"), Err(ShmError::NotInitialized)));

        let mut orphan = Consumer::new(&channel, 32).unwrap();
        assert!(matches!(orphan.init(), Err(ShmError::NotFound(_))));

        // A consumer whose slot size disagrees with the producer's is
        // refused before it can corrupt slot arithmetic.
        let mut producer = Producer::new(&channel, 32).unwrap();
        producer.init().unwrap();
        let mut mismatched = Consumer::new(&channel, 64).unwrap();
        assert!(matches!(mismatched.init(), Err(ShmError::Corrupt { .. })));
    }

    #[test]
    fn consumer_accessors_default_before_init() {
        let channel = unique_name("ring_cold");
        let consumer = Consumer::new(&channel, 32).unwrap();
        assert!(consumer.latest().is_none());
        assert!(consumer.slot(0).is_none());
        assert_eq!(consumer.total_writes(), 0);
        assert_eq!(consumer.write_index(), 0);
        assert_eq!(consumer.latest_timestamp_ns(), 0);
        assert!(!consumer.is_writer_alive(1000));
        assert!(!consumer.is_ready());
    }

    #[test]
    fn late_consumer_catches_up_on_next_publish() {
        let (mut producer, _none) = producer_with_consumers(64, 4, 0);
        assert_eq!(producer.write(b"before anyone").unwrap(), 0);

        let channel = producer.channel.clone();
        let mut late = Consumer::with_ring_size(&channel, 64, 4).unwrap();
        late.init().unwrap();

        // The frame published before registration never reaches this
        // ring; the next one does.
        assert!(late.latest().is_none());
        assert_eq!(producer.write(b"after join").unwrap(), 1);
        assert_eq!(late.latest().unwrap(), b"after join");
        assert_eq!(late.total_writes(), 1);
    }
}
