//! Unique suffixes for namespaces and release names.

use uuid::Uuid;

/// Number of characters in a generated suffix.
pub const SUFFIX_LEN: usize = 6;

/// Source of unique, DNS-label-safe suffixes.
///
/// Tests inject a deterministic implementation so resource names are known
/// up front.
pub trait IdGenerator: Send + Sync {
    fn unique_id(&self) -> String;
}

/// Random suffixes taken from a v4 UUID.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidIds;

impl IdGenerator for UuidIds {
    fn unique_id(&self) -> String {
        let simple = Uuid::new_v4().simple().to_string();
        simple.get(..SUFFIX_LEN).unwrap_or("000000").to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_ids_are_short_lowercase_hex() {
        let id = UuidIds.unique_id();

        assert_eq!(id.len(), SUFFIX_LEN);
        assert!(id.chars().all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
    }

    #[test]
    fn test_uuid_ids_differ() {
        assert_ne!(UuidIds.unique_id(), UuidIds.unique_id());
    }
}
