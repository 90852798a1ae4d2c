/// Align `value` up to the next multiple of `align`.
/// `align` must be a power of two.
#[inline(always)]
pub const fn align_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// Align `value` down to the previous multiple of `align`.
/// `align` must be a power of two.
#[inline(always)]
pub const fn align_down(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    value & !(align - 1)
}

/// Check if `value` is aligned to `align`.
#[inline(always)]
pub const fn is_aligned(value: usize, align: usize) -> bool {
    value & (align - 1) == 0
}

/// Super-page: the granularity at which pools hand out address space.
pub const SUPER_PAGE_SHIFT: usize = 21;
pub const SUPER_PAGE_SIZE: usize = 1 << SUPER_PAGE_SHIFT; // 2 MiB
pub const SUPER_PAGE_OFFSET_MASK: usize = SUPER_PAGE_SIZE - 1;
pub const SUPER_PAGE_BASE_MASK: usize = !SUPER_PAGE_OFFSET_MASK;

/// The metadata region at the head of every super-page. Freelist links must
/// never point into it.
pub const PARTITION_PAGE_SIZE: usize = 1 << 14; // 16 KiB

/// Maximum size of a single pool. Each pool is aligned on its own size so
/// that membership can be decided by one mask/compare.
pub const POOL_MAX_SIZE: usize = 1 << 33; // 8 GiB

pub const BRP_POOL_SIZE: usize = POOL_MAX_SIZE;
pub const NON_BRP_POOL_SIZE: usize = POOL_MAX_SIZE;

/// Total address space the cage wants to carve into pools.
pub const DESIRED_ADDRESS_SPACE_SIZE: usize = BRP_POOL_SIZE + NON_BRP_POOL_SIZE;

/// The reservation is oversized so an interior POOL_MAX_SIZE alignment always
/// leaves room for every pool.
pub const RESERVED_ADDRESS_SPACE_SIZE: usize =
    DESIRED_ADDRESS_SPACE_SIZE + POOL_MAX_SIZE + SUPER_PAGE_SIZE;

/// The configurable pool lives inside an embedder-provided mapping, outside
/// the cage. Its size must be a power of two within these bounds.
pub const CONFIGURABLE_POOL_MAX_SIZE: usize = 1 << 32; // 4 GiB
pub const CONFIGURABLE_POOL_MIN_SIZE: usize = SUPER_PAGE_SIZE;

/// Allocations are forbidden in the first super-page of the BRP pool, so a
/// one-past-the-end pointer of an allocation right below the pool cannot
/// alias a live BRP slot.
pub const FORBIDDEN_ZONE_SIZE: usize = SUPER_PAGE_SIZE;

/// Number of pool handle slots in the address pool manager.
pub const MAX_POOLS: usize = 4;

/// Upper bound on super-pages per pool (POOL_MAX_SIZE / SUPER_PAGE_SIZE).
pub const MAX_POOL_BITS: usize = POOL_MAX_SIZE >> SUPER_PAGE_SHIFT;

/// Byte written over quarantined payloads when zapping is enabled.
pub const ZAP_BYTE: u8 = 0xEF;

/// Default capacity of a quarantine branch in bytes.
pub const DEFAULT_QUARANTINE_CAPACITY: usize = 256 * 1024;

const _: () = assert!(POOL_MAX_SIZE.is_power_of_two());
const _: () = assert!(CONFIGURABLE_POOL_MAX_SIZE <= POOL_MAX_SIZE);
const _: () = assert!(RESERVED_ADDRESS_SPACE_SIZE > DESIRED_ADDRESS_SPACE_SIZE + POOL_MAX_SIZE);
const _: () = assert!(POOL_MAX_SIZE >= DESIRED_ADDRESS_SPACE_SIZE / 2);
const _: () = assert!(PARTITION_PAGE_SIZE < SUPER_PAGE_SIZE);
