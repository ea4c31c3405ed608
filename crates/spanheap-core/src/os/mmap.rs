//! `mmap`-backed page source.

use super::{OsError, PageSource, Reservation};

/// Anonymous private mappings: reserve with `PROT_NONE`, commit by remapping
/// read/write in place, decommit with `MADV_DONTNEED`.
#[derive(Debug, Clone, Copy)]
pub struct MmapPageSource {
    page_size: usize,
}

impl MmapPageSource {
    #[must_use]
    pub fn new() -> Self {
        // SAFETY: sysconf has no memory-safety preconditions.
        let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        Self {
            page_size: usize::try_from(raw).unwrap_or(0),
        }
    }
}

impl Default for MmapPageSource {
    fn default() -> Self {
        Self::new()
    }
}

fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

impl PageSource for MmapPageSource {
    fn physical_page_size(&self) -> usize {
        self.page_size
    }

    fn reserve(&self, hint: Option<usize>, size: usize) -> Option<Reservation> {
        let want = hint.unwrap_or(0) as *mut libc::c_void;
        // SAFETY: anonymous mapping without MAP_FIXED never replaces an
        // existing mapping; the hint is advisory.
        let p = unsafe {
            libc::mmap(
                want,
                size,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if p == libc::MAP_FAILED {
            return None;
        }
        Some(Reservation {
            addr: p as usize,
            size,
            reserved: true,
        })
    }

    fn commit(&self, addr: usize, size: usize, reserved: bool) -> Result<(), OsError> {
        let flags = if reserved {
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED
        } else {
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS
        };
        // SAFETY: with `reserved` the range lies inside a PROT_NONE
        // reservation this heap owns, so MAP_FIXED only replaces our own
        // inaccessible pages. Without it the address is only a hint.
        let p = unsafe {
            libc::mmap(
                addr as *mut libc::c_void,
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                flags,
                -1,
                0,
            )
        };
        if p == libc::MAP_FAILED {
            return Err(OsError::Errno {
                op: "mmap",
                errno: errno(),
            });
        }
        if p as usize != addr {
            // SAFETY: `p` is the mapping just created above.
            unsafe { libc::munmap(p, size) };
            return Err(OsError::Moved {
                want: addr,
                got: p as usize,
            });
        }
        Ok(())
    }

    fn decommit(&self, addr: usize, size: usize) {
        // SAFETY: the range is committed memory owned by the heap, which no
        // longer holds live objects there.
        unsafe { libc::madvise(addr as *mut libc::c_void, size, libc::MADV_DONTNEED) };
    }

    fn release(&self, addr: usize, size: usize) {
        // SAFETY: the range was returned by `reserve` and is unused.
        unsafe { libc::munmap(addr as *mut libc::c_void, size) };
    }

    fn zero(&self, addr: usize, len: usize) {
        // SAFETY: the heap only zeroes slots inside committed spans.
        unsafe { std::ptr::write_bytes(addr as *mut u8, 0, len) };
    }

    fn name(&self) -> &'static str {
        "mmap"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_power_of_two() {
        let os = MmapPageSource::new();
        assert!(os.physical_page_size().is_power_of_two());
    }

    #[test]
    fn reserve_commit_zero_release() {
        let os = MmapPageSource::new();
        let page = os.physical_page_size();
        let r = os.reserve(None, 4 * page).expect("reserve");
        assert!(r.reserved);
        assert_eq!(r.addr % page, 0);
        os.commit(r.addr, 2 * page, true).expect("commit");
        os.zero(r.addr, 2 * page);
        os.decommit(r.addr, 2 * page);
        os.release(r.addr, r.size);
    }
}
