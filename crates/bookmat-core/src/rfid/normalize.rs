//! UID normalization and search-variant generation.
//!
//! Card UIDs arrive in whatever shape the reader and the upstream
//! catalogue preferred on the day they were enrolled: colon- or
//! dash-separated hex, reversed byte order, plain decimal, zero-padded
//! decimal. The canonical form used everywhere inside the system is
//! upper-case hex with no separators; the variant generator produces the
//! historical shapes for remote index searches.

/// EPC length, in hex characters, that UHF patron cards are truncated to.
pub const UHF_CARD_UID_LENGTH: usize = 24;

/// Canonicalizes a raw UID: strips `:`/`-`/whitespace and a `0x` prefix,
/// upper-cases, and keeps only hex characters. Returns `None` when
/// nothing hex-shaped remains.
#[must_use]
pub fn normalize_uid(raw: &str) -> Option<String> {
    let mut cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| !matches!(c, ':' | '-') && !c.is_whitespace())
        .collect::<String>()
        .to_ascii_uppercase();
    if let Some(rest) = cleaned.strip_prefix("0X") {
        cleaned = rest.to_string();
    }
    let hex: String = cleaned.chars().filter(char::is_ascii_hexdigit).collect();
    if hex.is_empty() {
        None
    } else {
        Some(hex)
    }
}

/// Normalizes a UHF EPC: canonical form truncated to the configured
/// card-UID length.
#[must_use]
pub fn normalize_epc(raw: &str) -> Option<String> {
    normalize_uid(raw).map(|mut uid| {
        uid.truncate(UHF_CARD_UID_LENGTH);
        uid
    })
}

/// Inserts `sep` between every byte pair: `"ABCD12"` → `"AB:CD:12"`.
#[must_use]
pub fn insert_every2(hex: &str, sep: char) -> String {
    let bytes: Vec<&str> = hex
        .as_bytes()
        .chunks(2)
        .map(|chunk| std::str::from_utf8(chunk).unwrap_or(""))
        .collect();
    bytes.join(&sep.to_string())
}

/// Reverses byte order: `"ABCDEF12"` → `"12EFCDAB"`.
#[must_use]
pub fn reverse_by_byte(hex: &str) -> String {
    hex.as_bytes()
        .chunks(2)
        .rev()
        .flat_map(|chunk| chunk.iter().copied())
        .map(char::from)
        .collect()
}

/// Generates the UID shapes the remote catalogue may have enrolled.
///
/// The set is closed under normalization: normalizing any variant yields
/// another member of the same set (the separated forms collapse to their
/// bare hex, the decimal forms normalize to themselves).
#[must_use]
pub fn uid_variants(uid: &str) -> Vec<String> {
    let Some(hex) = normalize_uid(uid) else {
        return if uid.is_empty() {
            Vec::new()
        } else {
            vec![uid.to_string()]
        };
    };

    let mut variants = vec![hex.clone()];
    let mut push = |candidate: String| {
        if !variants.contains(&candidate) {
            variants.push(candidate);
        }
    };

    if hex.len() >= 4 {
        push(insert_every2(&hex, ':'));
        push(insert_every2(&hex, '-'));
    }

    let reversed = reverse_by_byte(&hex);
    if reversed != hex {
        push(reversed.clone());
        push(insert_every2(&reversed, ':'));
        push(insert_every2(&reversed, '-'));
    }

    if let Ok(value) = u128::from_str_radix(&hex, 16) {
        let decimal = value.to_string();
        push(decimal.clone());
        push(format!("{decimal:0>10}"));
        if reversed != hex {
            if let Ok(rev_value) = u128::from_str_radix(&reversed, 16) {
                if rev_value != value {
                    let rev_decimal = rev_value.to_string();
                    push(rev_decimal.clone());
                    push(format!("{rev_decimal:0>10}"));
                }
            }
        }
    }

    variants
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_normalize_strips_separators_and_case() {
        assert_eq!(normalize_uid("ab:cd:ef:12").as_deref(), Some("ABCDEF12"));
        assert_eq!(normalize_uid("ab-cd-ef-12").as_deref(), Some("ABCDEF12"));
        assert_eq!(normalize_uid(" 0xABCDEF12 ").as_deref(), Some("ABCDEF12"));
        assert_eq!(normalize_uid("ab cd"), Some("ABCD".to_string()));
    }

    #[test]
    fn test_normalize_rejects_non_hex() {
        assert_eq!(normalize_uid(""), None);
        assert_eq!(normalize_uid("::--"), None);
        // Non-hex letters are dropped, hex ones survive.
        assert_eq!(normalize_uid("XYZA1"), Some("A1".to_string()));
    }

    #[test]
    fn test_epc_truncated_to_card_length() {
        let epc = "E2000011223344556677889900112233";
        let normalized = normalize_epc(epc).unwrap();
        assert_eq!(normalized.len(), UHF_CARD_UID_LENGTH);
        assert_eq!(normalized, "E20000112233445566778899");
    }

    #[test]
    fn test_reverse_by_byte() {
        assert_eq!(reverse_by_byte("ABCDEF12"), "12EFCDAB");
        assert_eq!(reverse_by_byte("AABB"), "BBAA");
    }

    #[test]
    fn test_variants_include_expected_shapes() {
        let variants = uid_variants("04AABBCC");
        assert!(variants.contains(&"04AABBCC".to_string()));
        assert!(variants.contains(&"04:AA:BB:CC".to_string()));
        assert!(variants.contains(&"04-AA-BB-CC".to_string()));
        assert!(variants.contains(&"CCBBAA04".to_string()));
        assert!(variants.contains(&"78314764".to_string())); // decimal
        assert!(variants.contains(&"0078314764".to_string())); // zero-padded
    }

    #[test]
    fn test_variants_deduplicated_for_palindromes() {
        // AAAA reverses to itself; no reversed shapes are emitted twice.
        let variants = uid_variants("AAAA");
        let unique: std::collections::BTreeSet<_> = variants.iter().collect();
        assert_eq!(unique.len(), variants.len());
    }

    proptest! {
        /// Normalization is idempotent.
        #[test]
        fn prop_normalize_idempotent(raw in "[0-9a-fA-F:\\- ]{0,40}") {
            if let Some(once) = normalize_uid(&raw) {
                prop_assert_eq!(normalize_uid(&once), Some(once.clone()));
            }
        }

        /// The variant set is closed under normalization.
        #[test]
        fn prop_variants_closed_under_normalization(raw in "[0-9a-fA-F]{4,24}") {
            let variants = uid_variants(&raw);
            for variant in &variants {
                let normalized = normalize_uid(variant).unwrap();
                prop_assert!(
                    variants.contains(&normalized),
                    "normalize({}) = {} escaped the variant set",
                    variant,
                    normalized
                );
            }
        }

        /// Every variant of a canonical UID resolves back to a known
        /// shape: itself, its reverse, or one of the decimal encodings.
        #[test]
        fn prop_variants_contain_base(raw in "[0-9A-F]{4,24}") {
            let variants = uid_variants(&raw);
            prop_assert_eq!(variants.first(), Some(&raw.to_string()));
        }
    }
}
