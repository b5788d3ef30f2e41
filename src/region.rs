use crate::error::{ShmError, ShmResult};
use crate::utils::validate_name;
use std::ffi::CString;
use std::ptr::NonNull;

/// Huge page size assumed by the allocation policy (2 MiB on x86_64).
pub const HUGE_PAGE_SIZE: usize = 2 * 1024 * 1024;

/// A mapped POSIX shared-memory region.
///
/// `SharedRegion` owns the mapping and, for creators, the name: dropping
/// a region created with [`SharedRegion::create`] unmaps it **and**
/// unlinks the object, while regions obtained with
/// [`SharedRegion::open_ro`] / [`SharedRegion::open_rw`] only unmap.
///
/// The acquisition policy follows the transport's latency requirements:
///
/// * page tables are pre-populated at map time (`MAP_POPULATE`),
/// * pages are locked resident (`mlock`) to eliminate fault jitter,
/// * the kernel is advised of the access pattern (`MADV_SEQUENTIAL`,
///   `MADV_WILLNEED`),
/// * regions of at least 2 MiB may be backed by huge pages
///   (`MAP_HUGETLB`), falling back to base pages when the pool is empty.
///
/// `mlock` and `madvise` are best-effort: failure (e.g. `RLIMIT_MEMLOCK`)
/// degrades latency, not correctness.
#[derive(Debug)]
pub struct SharedRegion {
    ptr: NonNull<u8>,
    len: usize,
    name: CString,
    owner: bool,
    huge: bool,
    read_only: bool,
}

// SAFETY: the mapping has no thread affinity; concurrent access is
// coordinated by the atomics the transports place inside the region.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Creates (or replaces) the named object, sizes it, and maps it
    /// read-write.
    ///
    /// A stale object with the same name is unlinked first; losing the
    /// subsequent `O_EXCL` create to a concurrent creator yields
    /// [`ShmError::NameInUse`]. When `prefer_huge` is set and `size` is
    /// at least one huge page, the total is rounded up to the huge-page
    /// boundary and a `MAP_HUGETLB` mapping is attempted before falling
    /// back to base pages.
    ///
    /// On any failure every prior side effect (descriptor, name,
    /// mapping) is rolled back before the error returns.
    pub fn create(name: &str, size: usize, prefer_huge: bool) -> ShmResult<Self> {
        validate_name(name)?;
        let c_name = CString::new(name).expect("validated name has no NUL");

        let try_huge = prefer_huge && size >= HUGE_PAGE_SIZE;
        let len = if try_huge {
            crate::utils::align_up(size, HUGE_PAGE_SIZE)
        } else {
            size
        };

        unsafe {
            // Replace semantics: drop whatever a previous run left behind.
            libc::shm_unlink(c_name.as_ptr());

            let fd = libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_RDWR | libc::O_EXCL,
                0o600,
            );
            if fd == -1 {
                return Err(ShmError::from_os(name, std::io::Error::last_os_error()));
            }

            if libc::ftruncate(fd, len as libc::off_t) == -1 {
                let err = std::io::Error::last_os_error();
                libc::close(fd);
                libc::shm_unlink(c_name.as_ptr());
                return Err(ShmError::from_os(name, err));
            }

            let flags = libc::MAP_SHARED | libc::MAP_POPULATE;
            let mut huge = false;
            let mut addr = libc::MAP_FAILED;

            if try_huge {
                addr = libc::mmap(
                    std::ptr::null_mut(),
                    len,
                    libc::PROT_READ | libc::PROT_WRITE,
                    flags | libc::MAP_HUGETLB,
                    fd,
                    0,
                );
                if addr != libc::MAP_FAILED {
                    huge = true;
                } else {
                    log::debug!("huge-page mapping of '{name}' refused, using base pages");
                }
            }

            if addr == libc::MAP_FAILED {
                addr = libc::mmap(
                    std::ptr::null_mut(),
                    len,
                    libc::PROT_READ | libc::PROT_WRITE,
                    flags,
                    fd,
                    0,
                );
            }

            if addr == libc::MAP_FAILED {
                let err = std::io::Error::last_os_error();
                libc::close(fd);
                libc::shm_unlink(c_name.as_ptr());
                return Err(ShmError::from_os(name, err));
            }

            // The mapping keeps the object alive; the descriptor is no
            // longer needed.
            libc::close(fd);

            advise_and_lock(name, addr, len);

            log::debug!("created shm region '{name}' ({len} bytes, huge_pages={huge})");

            Ok(Self {
                ptr: NonNull::new_unchecked(addr as *mut u8),
                len,
                name: c_name,
                owner: true,
                huge,
                read_only: false,
            })
        }
    }

    /// Opens an existing object read-only, sized by `fstat`.
    ///
    /// `try_huge` requests a `MAP_HUGETLB` mapping first (useful when the
    /// writer is known to have used huge pages); base pages are the
    /// fallback either way.
    pub fn open_ro(name: &str, try_huge: bool) -> ShmResult<Self> {
        Self::open_impl(name, try_huge, true)
    }

    /// Opens an existing object read-write.
    ///
    /// Used by the broadcast producer to map consumer-owned rings it
    /// discovers through the registry.
    pub fn open_rw(name: &str) -> ShmResult<Self> {
        Self::open_impl(name, false, false)
    }

    fn open_impl(name: &str, try_huge: bool, read_only: bool) -> ShmResult<Self> {
        validate_name(name)?;
        let c_name = CString::new(name).expect("validated name has no NUL");

        let oflag = if read_only {
            libc::O_RDONLY
        } else {
            libc::O_RDWR
        };
        let prot = if read_only {
            libc::PROT_READ
        } else {
            libc::PROT_READ | libc::PROT_WRITE
        };

        unsafe {
            let fd = libc::shm_open(c_name.as_ptr(), oflag, 0o600);
            if fd == -1 {
                return Err(ShmError::from_os(name, std::io::Error::last_os_error()));
            }

            let mut st: libc::stat = std::mem::zeroed();
            if libc::fstat(fd, &mut st) == -1 {
                let err = std::io::Error::last_os_error();
                libc::close(fd);
                return Err(ShmError::from_os(name, err));
            }
            let len = st.st_size as usize;
            if len == 0 {
                // Raced a creator between shm_open and ftruncate.
                libc::close(fd);
                return Err(ShmError::NotFound(name.to_string()));
            }

            let mut huge = false;
            let mut addr = libc::MAP_FAILED;

            if try_huge {
                addr = libc::mmap(
                    std::ptr::null_mut(),
                    len,
                    prot,
                    libc::MAP_SHARED | libc::MAP_HUGETLB,
                    fd,
                    0,
                );
                if addr != libc::MAP_FAILED {
                    huge = true;
                }
            }

            if addr == libc::MAP_FAILED {
                addr = libc::mmap(std::ptr::null_mut(), len, prot, libc::MAP_SHARED, fd, 0);
            }

            if addr == libc::MAP_FAILED {
                let err = std::io::Error::last_os_error();
                libc::close(fd);
                return Err(ShmError::from_os(name, err));
            }

            libc::close(fd);

            advise_and_lock(name, addr, len);

            log::debug!("opened shm region '{name}' ({len} bytes, read_only={read_only})");

            Ok(Self {
                ptr: NonNull::new_unchecked(addr as *mut u8),
                len,
                name: c_name,
                owner: false,
                huge,
                read_only,
            })
        }
    }

    #[inline(always)]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// # Panics
    ///
    /// Panics if the region was opened read-only.
    #[inline(always)]
    pub fn as_mut_ptr(&self) -> *mut u8 {
        assert!(!self.read_only, "region was mapped read-only");
        self.ptr.as_ptr()
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the mapping is backed by huge pages.
    pub fn uses_huge_pages(&self) -> bool {
        self.huge
    }

    /// Whether this handle created the object (and will unlink it on drop).
    pub fn is_owner(&self) -> bool {
        self.owner
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr().cast(), self.len);
            if self.owner {
                libc::shm_unlink(self.name.as_ptr());
            }
        }
    }
}

/// Best-effort residency and access-pattern hints shared by all mappers.
unsafe fn advise_and_lock(name: &str, addr: *mut libc::c_void, len: usize) {
    unsafe {
        if libc::mlock(addr, len) == -1 {
            log::warn!(
                "mlock of '{name}' failed: {} (page-fault jitter possible)",
                std::io::Error::last_os_error()
            );
        }
        libc::madvise(addr, len, libc::MADV_SEQUENTIAL);
        libc::madvise(addr, len, libc::MADV_WILLNEED);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::unique_name;

    #[test]
    fn create_write_read_roundtrip() {
        let name = unique_name("region_rw");
        let size = 4096;
        let region = SharedRegion::create(&name, size, false).expect("create failed");
        assert!(region.is_owner());
        assert_eq!(region.len(), size);

        let ptr = region.as_mut_ptr();
        unsafe {
            for i in 0..size {
                *ptr.add(i) = (i % 251) as u8;
            }
        }

        let rptr = region.as_ptr();
        for i in 0..size {
            let v = unsafe { *rptr.add(i) };
            assert_eq!(v, (i % 251) as u8, "mismatch at byte {}", i);
        }
    }

    #[test]
    fn created_region_is_zeroed() {
        let name = unique_name("region_zero");
        let region = SharedRegion::create(&name, 4096, false).expect("create failed");
        let ptr = region.as_ptr();
        for i in 0..region.len() {
            assert_eq!(unsafe { *ptr.add(i) }, 0, "byte {} not zeroed", i);
        }
    }

    #[test]
    fn open_ro_sees_creator_data_and_size() {
        let name = unique_name("region_open");
        let creator = SharedRegion::create(&name, 8192, false).expect("create failed");
        unsafe {
            *creator.as_mut_ptr() = 0xAB;
            *creator.as_mut_ptr().add(8191) = 0xCD;
        }

        let reader = SharedRegion::open_ro(&name, false).expect("open_ro failed");
        assert!(!reader.is_owner());
        assert_eq!(reader.len(), 8192, "open_ro must size via fstat");
        unsafe {
            assert_eq!(*reader.as_ptr(), 0xAB);
            assert_eq!(*reader.as_ptr().add(8191), 0xCD);
        }
    }

    #[test]
    fn open_rw_can_mutate_creator_view() {
        let name = unique_name("region_rw_open");
        let creator = SharedRegion::create(&name, 4096, false).expect("create failed");

        let writer = SharedRegion::open_rw(&name).expect("open_rw failed");
        unsafe { *writer.as_mut_ptr().add(10) = 0x5A };

        unsafe { assert_eq!(*creator.as_ptr().add(10), 0x5A) };
    }

    #[test]
    fn drop_of_creator_unlinks_name() {
        let name = unique_name("region_unlink");
        {
            let _region = SharedRegion::create(&name, 4096, false).expect("create failed");
            // Still open here.
            assert!(SharedRegion::open_ro(&name, false).is_ok());
        }
        match SharedRegion::open_ro(&name, false) {
            Err(ShmError::NotFound(_)) => {}
            other => panic!("expected NotFound after creator drop, got {other:?}"),
        }
    }

    #[test]
    fn drop_of_opener_keeps_name() {
        let name = unique_name("region_keep");
        let _creator = SharedRegion::create(&name, 4096, false).expect("create failed");
        {
            let _reader = SharedRegion::open_ro(&name, false).expect("open_ro failed");
        }
        assert!(
            SharedRegion::open_ro(&name, false).is_ok(),
            "opener drop must not unlink the object"
        );
    }

    #[test]
    fn open_ro_missing_returns_not_found() {
        let name = unique_name("region_missing");
        match SharedRegion::open_ro(&name, false) {
            Err(ShmError::NotFound(n)) => assert_eq!(n, name),
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn invalid_names_are_rejected_without_side_effects() {
        assert!(matches!(
            SharedRegion::create("no_slash", 4096, false),
            Err(ShmError::InvalidName { .. })
        ));
        assert!(matches!(
            SharedRegion::create("/a/b", 4096, false),
            Err(ShmError::InvalidName { .. })
        ));
        assert!(matches!(
            SharedRegion::open_ro("no_slash", false),
            Err(ShmError::InvalidName { .. })
        ));
    }

    #[test]
    fn huge_page_request_falls_back_to_base_pages() {
        // 2 MiB region with prefer_huge: on hosts without a hugetlb pool
        // the MAP_HUGETLB attempt fails and the base-page path must win.
        let name = unique_name("region_huge");
        let region =
            SharedRegion::create(&name, HUGE_PAGE_SIZE, true).expect("create must fall back");
        assert_eq!(region.len() % HUGE_PAGE_SIZE, 0, "size rounded to huge page");
        unsafe {
            *region.as_mut_ptr() = 1;
            assert_eq!(*region.as_ptr(), 1);
        }
    }

    #[test]
    fn concurrent_atomics_in_shared_region() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicU64, Ordering};

        let name = unique_name("region_atomic");
        let region = Arc::new(SharedRegion::create(&name, 4096, false).expect("create failed"));

        let n_threads = 4u64;
        let n_increments = 1000u64;

        let handles: Vec<_> = (0..n_threads)
            .map(|_| {
                let r = Arc::clone(&region);
                std::thread::spawn(move || {
                    let counter = unsafe { &*(r.as_ptr() as *const AtomicU64) };
                    for _ in 0..n_increments {
                        counter.fetch_add(1, Ordering::Relaxed);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let counter = unsafe { &*(region.as_ptr() as *const AtomicU64) };
        assert_eq!(counter.load(Ordering::Relaxed), n_threads * n_increments);
    }
}
