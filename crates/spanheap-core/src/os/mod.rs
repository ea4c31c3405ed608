//! OS virtual-memory layer.
//!
//! The page heap is the only caller. Every primitive works at the granularity
//! reported by [`PageSource::physical_page_size`]; the heap validates that
//! size once at startup and treats any misaligned result as fatal.
//!
//! Two implementations ship: [`MmapPageSource`] over `mmap`/`madvise`, and
//! [`SimulatedOs`], a bookkeeping-only address space with fault injection
//! for tests.

#[allow(unsafe_code)]
mod mmap;
mod sim;

pub use mmap::MmapPageSource;
pub use sim::{SimOsStats, SimulatedOs};

use thiserror::Error;

/// Result of a successful [`PageSource::reserve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    pub addr: usize,
    pub size: usize,
    /// True if the range is reserved but inaccessible until committed.
    pub reserved: bool,
}

impl Reservation {
    #[must_use]
    pub const fn end(&self) -> usize {
        self.addr + self.size
    }
}

/// OS primitive failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OsError {
    #[error("{op} failed with errno {errno}")]
    Errno { op: &'static str, errno: i32 },
    #[error("os placed mapping at {got:#x}, wanted {want:#x}")]
    Moved { want: usize, got: usize },
    #[error("range {addr:#x}+{size:#x} is not inside a reservation")]
    NotReserved { addr: usize, size: usize },
    #[error("injected failure")]
    Injected,
}

/// Reserve/commit/decommit/release primitives.
pub trait PageSource: Send + Sync {
    /// Physical page size. Must be a power of two.
    fn physical_page_size(&self) -> usize;

    /// Reserves `size` bytes of address space, preferably at `hint`.
    /// `None` means no reservation of that size is possible.
    fn reserve(&self, hint: Option<usize>, size: usize) -> Option<Reservation>;

    /// Makes `[addr, addr+size)` readable and writable. Fresh memory reads
    /// as zero.
    fn commit(&self, addr: usize, size: usize, reserved: bool) -> Result<(), OsError>;

    /// Returns the physical memory behind the range; the address range stays
    /// reserved and may be committed again.
    fn decommit(&self, addr: usize, size: usize);

    /// Gives the address range back to the OS.
    fn release(&self, addr: usize, size: usize);

    /// Zero-fills committed memory.
    fn zero(&self, addr: usize, len: usize);

    /// Short label for reports.
    fn name(&self) -> &'static str {
        "os"
    }
}
