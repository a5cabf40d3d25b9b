//! Name normalization (spec §3).
//!
//! Past the normalization fork height, names are compared in NFD + case-fold
//! form on their UTF-8-valid prefix; invalid trailing bytes pass through
//! unchanged. The raw name is always retained separately for display.

use unicode_normalization::UnicodeNormalization;

/// Normalize `raw` the way the trie keys names after the fork: decompose to
/// NFD and lowercase the valid UTF-8 prefix, leaving any trailing invalid
/// bytes untouched and appended verbatim.
pub fn normalize(raw: &[u8]) -> Vec<u8> {
    match std::str::from_utf8(raw) {
        Ok(s) => s.nfd().collect::<String>().to_lowercase().into_bytes(),
        Err(e) => {
            let valid_len = e.valid_up_to();
            let (valid, rest) = raw.split_at(valid_len);
            let valid_str = std::str::from_utf8(valid).expect("valid_up_to guarantees valid UTF-8");
            let mut out = valid_str.nfd().collect::<String>().to_lowercase().into_bytes();
            out.extend_from_slice(rest);
            out
        }
    }
}

/// Apply the fork-height gate: before `fork_height`, names compare as raw
/// bytes; at and after, they compare normalized.
pub fn normalize_at(raw: &[u8], height: i32, fork_height: i32) -> Vec<u8> {
    if height >= fork_height {
        normalize(raw)
    } else {
        raw.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_lowercases() {
        assert_eq!(normalize(b"HeLLo"), b"hello".to_vec());
    }

    #[test]
    fn invalid_utf8_suffix_passthrough() {
        let mut raw = b"abc".to_vec();
        raw.push(0xff);
        let norm = normalize(&raw);
        assert_eq!(&norm[..3], b"abc");
        assert_eq!(norm[3], 0xff);
    }

    #[test]
    fn idempotent() {
        let raw = b"Caf\xc3\xa9 Unicode";
        let once = normalize(raw);
        let twice = normalize(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn fork_gate_exclusive_below() {
        assert_eq!(normalize_at(b"ABC", 99, 100), b"ABC".to_vec());
        assert_eq!(normalize_at(b"ABC", 100, 100), b"abc".to_vec());
    }
}
