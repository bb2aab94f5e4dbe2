//! Deterministic suffix generators.

use helm_harness::ids::{IdGenerator, SUFFIX_LEN};
use std::sync::atomic::{AtomicU32, Ordering};

/// Suffix used by [`FixedIds::default`].
pub const TEST_SUFFIX: &str = "abc123";

/// Returns the same suffix every time.
#[derive(Debug, Clone)]
pub struct FixedIds(pub String);

impl Default for FixedIds {
    fn default() -> Self {
        Self(TEST_SUFFIX.to_string())
    }
}

impl IdGenerator for FixedIds {
    fn unique_id(&self) -> String {
        self.0.clone()
    }
}

/// Returns `000001`, `000002`, ... in call order.
#[derive(Debug, Default)]
pub struct SequentialIds {
    next: AtomicU32,
}

impl IdGenerator for SequentialIds {
    fn unique_id(&self) -> String {
        let n = self.next.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{n:0width$}", width = SUFFIX_LEN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_ids_count_up() {
        let ids = SequentialIds::default();
        assert_eq!(ids.unique_id(), "000001");
        assert_eq!(ids.unique_id(), "000002");
    }
}
