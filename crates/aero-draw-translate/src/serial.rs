use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

/// Monotonically increasing content/binding version.
///
/// Every buffer mutation, native (re)allocation and streaming discard issues a fresh serial. Two
/// bindings with equal serials are guaranteed to refer to the same bytes, which lets the state
/// cache skip redundant binds without comparing contents.
///
/// Serials are unique across the whole process, so a serial from one buffer can never collide
/// with a serial from another.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Serial(u64);

impl Serial {
    /// Sentinel that never matches an issued serial.
    pub const NONE: Serial = Serial(0);

    pub fn issue() -> Self {
        Serial(NEXT_SERIAL.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for Serial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Serial({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_serials_increase() {
        let a = Serial::issue();
        let b = Serial::issue();
        assert!(b > a);
        assert!(!a.is_none());
        assert_ne!(a, Serial::NONE);
    }
}
