//! Size classes for small allocations.
//!
//! 67 object sizes from 8 bytes to 32 KiB (class 0 is reserved and never
//! handed out). Each class carries the smallest span length, in heap pages,
//! whose tail waste is at most 1/8 of the span. Size lookup is two dense
//! tables: 8-byte granularity up to 1 KiB and 128-byte granularity above.

use std::sync::OnceLock;

use crate::PAGE_SIZE;
use crate::error::{InvariantViolation, fatal};

/// Largest size served by a size class. Above this, allocations are large.
pub const MAX_SMALL_SIZE: usize = 32 * 1024;

/// Pointer-free requests strictly below this are packed by the tiny allocator.
pub const TINY_SIZE: usize = 16;

/// Class whose object size must equal [`TINY_SIZE`].
pub const TINY_CLASS: ClassId = ClassId(2);

const SMALL_SIZE_DIV: usize = 8;
const SMALL_SIZE_MAX: usize = 1024;
const LARGE_SIZE_DIV: usize = 128;

/// Object sizes, indexed by class id.
pub const CLASS_SIZES: [usize; 68] = [
    0, 8, 16, 24, 32, 48, 64, 80, 96, 112, 128, 144, 160, 176, 192, 208, 224, 240, 256, 288, 320,
    352, 384, 416, 448, 480, 512, 576, 640, 704, 768, 896, 1024, 1152, 1280, 1408, 1536, 1792,
    2048, 2304, 2688, 3072, 3200, 3456, 4096, 4864, 5376, 6144, 6528, 6784, 6912, 8192, 9472,
    9728, 10240, 10880, 12288, 13568, 14336, 16384, 18432, 19072, 20480, 21760, 24576, 27264,
    28672, 32768,
];

/// Index into the size-class table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClassId(pub u8);

impl ClassId {
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// One size class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizeClass {
    pub id: ClassId,
    /// Bytes per object slot.
    pub object_size: usize,
    /// Heap pages per span of this class.
    pub span_pages: usize,
    /// Slots per span: `span_pages * PAGE_SIZE / object_size`.
    pub max_objects: usize,
}

impl SizeClass {
    #[must_use]
    pub const fn span_bytes(&self) -> usize {
        self.span_pages * PAGE_SIZE
    }

    /// Bytes left over after the last slot.
    #[must_use]
    pub const fn tail_waste(&self) -> usize {
        self.span_bytes() - self.max_objects * self.object_size
    }
}

/// Smallest page count whose tail waste is at most 1/8 of the span.
#[must_use]
pub fn pages_for(object_size: usize) -> usize {
    let mut alloc = PAGE_SIZE;
    while alloc % object_size > alloc / 8 {
        alloc += PAGE_SIZE;
    }
    alloc / PAGE_SIZE
}

/// Immutable size-class table plus the size→class lookup tables.
#[derive(Debug, Clone)]
pub struct SizeClassTable {
    classes: Vec<SizeClass>,
    class8: Vec<u8>,
    class128: Vec<u8>,
}

impl SizeClassTable {
    /// Builds and validates a table from per-class object sizes. Entry 0
    /// must be the reserved zero class.
    pub fn new(sizes: &[usize]) -> Result<Self, InvariantViolation> {
        let malformed = |class: usize, reason: &'static str| {
            Err(InvariantViolation::MalformedSizeClasses { class, reason })
        };
        if sizes.len() < 2 || sizes.len() > usize::from(u8::MAX) {
            return malformed(0, "class count out of range");
        }
        if sizes[0] != 0 {
            return malformed(0, "class 0 must be the reserved zero class");
        }
        if sizes.get(TINY_CLASS.index()) != Some(&TINY_SIZE) {
            return Err(InvariantViolation::BadTinyClass {
                class: TINY_CLASS.index(),
                expected: TINY_SIZE,
                actual: sizes.get(TINY_CLASS.index()).copied().unwrap_or(0),
            });
        }
        if sizes[sizes.len() - 1] != MAX_SMALL_SIZE {
            return malformed(sizes.len() - 1, "last class must be the small-object ceiling");
        }

        let mut classes = Vec::with_capacity(sizes.len());
        classes.push(SizeClass {
            id: ClassId(0),
            object_size: 0,
            span_pages: 0,
            max_objects: 0,
        });
        for (i, &size) in sizes.iter().enumerate().skip(1) {
            if size <= sizes[i - 1] {
                return malformed(i, "object sizes must strictly increase");
            }
            if size % SMALL_SIZE_DIV != 0 {
                return malformed(i, "object size not a multiple of 8");
            }
            if size > SMALL_SIZE_MAX && size % LARGE_SIZE_DIV != 0 {
                return malformed(i, "object size above 1 KiB not a multiple of 128");
            }
            let span_pages = pages_for(size);
            classes.push(SizeClass {
                id: ClassId(i as u8),
                object_size: size,
                span_pages,
                max_objects: span_pages * PAGE_SIZE / size,
            });
        }

        let smallest_fitting = |want: usize| -> u8 {
            classes
                .iter()
                .position(|c| c.object_size >= want)
                .map_or(0, |i| i as u8)
        };
        let class8 = (0..=SMALL_SIZE_MAX / SMALL_SIZE_DIV)
            .map(|i| smallest_fitting(i * SMALL_SIZE_DIV))
            .collect();
        let class128 = (0..=(MAX_SMALL_SIZE - SMALL_SIZE_MAX) / LARGE_SIZE_DIV)
            .map(|j| smallest_fitting(SMALL_SIZE_MAX + j * LARGE_SIZE_DIV))
            .collect();

        Ok(Self {
            classes,
            class8,
            class128,
        })
    }

    /// The process-wide standard table, validated on first use.
    #[must_use]
    pub fn standard() -> &'static SizeClassTable {
        static TABLE: OnceLock<SizeClassTable> = OnceLock::new();
        TABLE.get_or_init(|| Self::new(&CLASS_SIZES).unwrap_or_else(|v| fatal(v)))
    }

    /// Smallest class whose object size is at least `size`, or `None` for
    /// zero-byte and large requests.
    #[inline]
    #[must_use]
    pub fn class_for(&self, size: usize) -> Option<ClassId> {
        if size == 0 || size > MAX_SMALL_SIZE {
            return None;
        }
        let id = if size <= SMALL_SIZE_MAX - SMALL_SIZE_DIV {
            self.class8[(size + SMALL_SIZE_DIV - 1) / SMALL_SIZE_DIV]
        } else {
            self.class128[(size + LARGE_SIZE_DIV - 1 - SMALL_SIZE_MAX) / LARGE_SIZE_DIV]
        };
        Some(ClassId(id))
    }

    #[inline]
    #[must_use]
    pub fn class(&self, id: ClassId) -> &SizeClass {
        &self.classes[id.index()]
    }

    #[inline]
    #[must_use]
    pub fn object_size(&self, id: ClassId) -> usize {
        self.classes[id.index()].object_size
    }

    #[inline]
    #[must_use]
    pub fn span_pages(&self, id: ClassId) -> usize {
        self.classes[id.index()].span_pages
    }

    /// Number of entries including the reserved class 0.
    #[must_use]
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.classes.len() <= 1
    }

    /// Allocatable classes (class 0 skipped).
    pub fn iter(&self) -> impl Iterator<Item = &SizeClass> {
        self.classes.iter().skip(1)
    }
}
