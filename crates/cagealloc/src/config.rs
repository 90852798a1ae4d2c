use crate::util::DEFAULT_QUARANTINE_CAPACITY;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Cached config values (read once at init, never allocate).
static QUARANTINE_CAPACITY: AtomicUsize = AtomicUsize::new(DEFAULT_QUARANTINE_CAPACITY);
static QUARANTINE_DISABLED: AtomicBool = AtomicBool::new(false);
static ZAP_DISABLED: AtomicBool = AtomicBool::new(false);

/// Read configuration from environment variables.
///
/// # Safety
/// Calls libc::getenv, which is not thread-safe against setenv. Must be
/// called from a single-threaded context (init).
pub unsafe fn read_config() {
    if let Some(val) = getenv_usize(b"CAGEALLOC_QUARANTINE_CAPACITY\0") {
        QUARANTINE_CAPACITY.store(val, Ordering::Relaxed);
    }
    QUARANTINE_DISABLED.store(
        getenv_present(b"CAGEALLOC_QUARANTINE_DISABLE\0"),
        Ordering::Relaxed,
    );
    ZAP_DISABLED.store(getenv_present(b"CAGEALLOC_ZAP_DISABLE\0"), Ordering::Relaxed);
}

pub fn quarantine_capacity() -> usize {
    QUARANTINE_CAPACITY.load(Ordering::Relaxed)
}

pub fn quarantine_disabled() -> bool {
    QUARANTINE_DISABLED.load(Ordering::Relaxed)
}

pub fn zap_disabled() -> bool {
    ZAP_DISABLED.load(Ordering::Relaxed)
}

unsafe fn getenv_present(key: &[u8]) -> bool {
    !libc::getenv(key.as_ptr() as *const libc::c_char).is_null()
}

/// Parse an environment variable as a usize, without allocating.
unsafe fn getenv_usize(key: &[u8]) -> Option<usize> {
    let val = libc::getenv(key.as_ptr() as *const libc::c_char);
    if val.is_null() {
        return None;
    }

    let mut result: usize = 0;
    let mut ptr = val as *const u8;
    loop {
        let byte = *ptr;
        if byte == 0 {
            break;
        }
        if !byte.is_ascii_digit() {
            return None;
        }
        result = result.checked_mul(10)?.checked_add((byte - b'0') as usize)?;
        ptr = ptr.add(1);
    }
    Some(result)
}
