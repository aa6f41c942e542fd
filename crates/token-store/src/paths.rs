//! On-disk layout for file-backed stores
//!
//! `<root>/<sha256(session_id)>/<sanitized provider>.json`
//!
//! Hashing the session id keeps arbitrary caller strings out of path
//! components and keeps the layout from revealing who the sessions belong to.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::token::SessionKey;

/// Length of the disambiguating hash suffix appended to rewritten names.
const SUFFIX_LEN: usize = 8;

/// Directory name for a session: lower-case hex SHA-256 of the id.
pub fn session_dir_name(session_id: &str) -> String {
    format!("{:x}", Sha256::digest(session_id.as_bytes()))
}

/// Turn a provider name into a safe file stem.
///
/// Keeps `[A-Za-z0-9._-]` and replaces everything else with `_`. Names made
/// only of dots (or nothing at all) would still walk the tree, so those
/// become underscores too.
/// Whenever the name had to be rewritten, a short hash of the original is
/// appended so `"a/b"` and `"a:b"` do not end up in the same file.
pub fn sanitize_provider_name(name: &str) -> String {
    let mut safe: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();

    if safe.chars().all(|c| c == '.') {
        safe = "_".repeat(safe.len().max(1));
    }

    if safe == name {
        return safe;
    }

    let digest = format!("{:x}", Sha256::digest(name.as_bytes()));
    format!("{safe}-{}", &digest[..SUFFIX_LEN])
}

/// Full path of the token file for `key` under `root`.
pub fn token_path(root: &Path, key: &SessionKey) -> PathBuf {
    root.join(session_dir_name(key.session_id()))
        .join(format!("{}.json", sanitize_provider_name(key.provider_name())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_dir_is_sha256_hex() {
        // SHA256("hello")
        assert_eq!(
            session_dir_name("hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn session_dir_handles_path_hostile_ids() {
        let dir = session_dir_name("../../etc/passwd");
        assert_eq!(dir.len(), 64);
        assert!(dir.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn clean_provider_names_pass_through() {
        assert_eq!(sanitize_provider_name("github-api_v2.0"), "github-api_v2.0");
    }

    #[test]
    fn unsafe_characters_are_replaced_and_suffixed() {
        let safe = sanitize_provider_name("acme/billing:prod");
        assert!(safe.starts_with("acme_billing_prod-"), "got {safe}");
        assert_eq!(safe.len(), "acme_billing_prod-".len() + SUFFIX_LEN);
    }

    #[test]
    fn names_that_normalize_identically_stay_distinct() {
        let a = sanitize_provider_name("a/b");
        let b = sanitize_provider_name("a:b");
        let c = sanitize_provider_name("a_b");
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_ne!(b, c);
    }

    #[test]
    fn dot_only_names_cannot_traverse() {
        let up = sanitize_provider_name("..");
        assert!(!up.starts_with(".."), "got {up}");
        assert!(!sanitize_provider_name("").is_empty());
    }

    #[test]
    fn token_path_layout() {
        let key = SessionKey::new("hello", "github");
        let path = token_path(Path::new("/tmp/tokens"), &key);
        assert_eq!(
            path,
            Path::new("/tmp/tokens")
                .join("2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824")
                .join("github.json")
        );
    }
}
