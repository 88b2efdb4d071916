use sha2::{Digest, Sha256};
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Fingerprint of a raw inbound payload: sha256 over the exact bytes, no
/// normalization. External systems recompute this for idempotency, so the
/// recipe must stay stable across releases.
pub fn payload_fingerprint(payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hex::encode(hasher.finalize())
}

/// Fingerprint of an entity's normalized identity fields, joined with '|'.
pub fn entity_fingerprint(parts: &[&str]) -> String {
    let mut s = String::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            s.push('|');
        }
        s.push_str(part);
    }

    let mut hasher = Sha256::new();
    hasher.update(s.as_bytes());
    hex::encode(hasher.finalize())
}

/// Normalized matching key for a title or name: lower-cased, NFKD
/// accent-stripped, runs of punctuation/whitespace collapsed to one space.
pub fn title_key(raw: &str) -> String {
    let mut key = String::with_capacity(raw.len());
    let mut pending_space = false;
    for c in raw.nfkd() {
        if is_combining_mark(c) {
            continue;
        }
        if c.is_alphanumeric() {
            if pending_space && !key.is_empty() {
                key.push(' ');
            }
            pending_space = false;
            for lc in c.to_lowercase() {
                key.push(lc);
            }
        } else {
            pending_space = true;
        }
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_fingerprint_is_stable_hex() {
        let fp = payload_fingerprint(b"hello");
        assert_eq!(fp.len(), 64);
        assert_eq!(fp, payload_fingerprint(b"hello"));
        assert_ne!(fp, payload_fingerprint(b"hello "));
    }

    #[test]
    fn entity_fingerprint_separates_fields() {
        // "ab" + "c" must not collide with "a" + "bc"
        assert_ne!(
            entity_fingerprint(&["ab", "c"]),
            entity_fingerprint(&["a", "bc"])
        );
    }

    #[test]
    fn title_key_folds_case_and_accents() {
        assert_eq!(title_key("Beyoncé"), "beyonce");
        assert_eq!(title_key("SIGUR RÓS"), "sigur ros");
    }

    #[test]
    fn title_key_collapses_punctuation() {
        assert_eq!(title_key("  What's  Going   On?"), "what s going on");
        assert_eq!(title_key("AC/DC"), "ac dc");
        assert_eq!(title_key("...Baby One More Time"), "baby one more time");
    }

    #[test]
    fn title_key_empty_input() {
        assert_eq!(title_key("!!!"), "");
        assert_eq!(title_key(""), "");
    }
}
