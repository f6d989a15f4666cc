//! Derivation of `kb_id` from a caller-chosen `node_id` (§3).
//!
//! A pure sanitizer: every partition key handed to the pattern store or
//! session store runs through this function first, which is what makes kb
//! isolation a property of construction rather than of discipline.

/// Characters the sanitizer replaces with `_`.
const UNSAFE_CHARS: &[char] = &['/', '\\', '.', '"', '$', '*', '<', '>', ':', '|', '?', '-', ' '];

/// Derives `kb_id` from `node_id` and the service name (§6.3 `SERVICE_NAME`).
///
/// `SERVICE_NAME` must be stable across restarts; changing it orphans all
/// prior data for every node, since it is baked into every kb_id.
pub fn derive_kb_id(node_id: &str, service_name: &str) -> String {
    let sanitized: String = node_id
        .chars()
        .map(|c| if UNSAFE_CHARS.contains(&c) { '_' } else { c })
        .collect();
    format!("{sanitized}_{service_name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replaces_unsafe_characters() {
        assert_eq!(derive_kb_id("alice/bob .co", "kato"), "alice_bob__co_kato");
    }

    #[test]
    fn stable_for_plain_identifiers() {
        assert_eq!(derive_kb_id("alice", "kato"), "alice_kato");
    }

    #[test]
    fn distinct_nodes_never_collide_by_construction() {
        assert_ne!(derive_kb_id("alice", "kato"), derive_kb_id("bob", "kato"));
    }
}
