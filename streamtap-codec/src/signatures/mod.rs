//! ## streamtap-codec::signatures
//! **Wildcard byte-pattern scanning**
//!
//! Patterns are written as space-separated hex bytes with `??` (or `?`) for
//! wildcards, e.g. `48 8B 05 ?? ?? ?? ?? 48 85 C0`. Each pattern's longest
//! literal run is fed to one Aho-Corasick automaton; candidate hits are then
//! verified against the full pattern.

use std::collections::{BTreeMap, HashMap};

use aho_corasick::AhoCorasick;

use crate::error::CodecError;

/// Entry point name -> pattern text.
pub type SignatureSet = BTreeMap<String, String>;

/// Global and regional signature data for embedded discovery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignatureSets {
    pub global: SignatureSet,
    pub region: SignatureSet,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Pattern {
    bytes: Vec<Option<u8>>,
    /// Start and length of the longest literal run.
    anchor: (usize, usize),
}

impl Pattern {
    fn parse(name: &str, text: &str) -> Result<Self, CodecError> {
        let invalid = |reason: String| CodecError::InvalidSignature {
            name: name.to_string(),
            reason,
        };

        let mut bytes = Vec::new();
        for token in text.split_whitespace() {
            if token == "??" || token == "?" {
                bytes.push(None);
                continue;
            }
            match hex::decode(token) {
                Ok(decoded) if decoded.len() == 1 => bytes.push(Some(decoded[0])),
                _ => return Err(invalid(format!("bad token {token:?}"))),
            }
        }

        let mut anchor = (0, 0);
        let mut run_start = 0;
        for (index, byte) in bytes.iter().enumerate() {
            if byte.is_none() {
                run_start = index + 1;
            } else if index + 1 - run_start > anchor.1 {
                anchor = (run_start, index + 1 - run_start);
            }
        }
        if anchor.1 == 0 {
            return Err(invalid("pattern has no literal bytes".to_string()));
        }

        Ok(Self { bytes, anchor })
    }

    fn literal_run(&self) -> Vec<u8> {
        self.bytes[self.anchor.0..self.anchor.0 + self.anchor.1]
            .iter()
            .flatten()
            .copied()
            .collect()
    }

    fn matches_at(&self, haystack: &[u8], start: usize) -> bool {
        haystack
            .get(start..start + self.bytes.len())
            .is_some_and(|window| {
                window
                    .iter()
                    .zip(&self.bytes)
                    .all(|(actual, expected)| expected.map_or(true, |b| b == *actual))
            })
    }
}

pub struct SignatureScanner {
    names: Vec<String>,
    patterns: Vec<Pattern>,
    matcher: AhoCorasick,
}

impl SignatureScanner {
    pub fn new(set: &SignatureSet) -> Result<Self, CodecError> {
        let mut names = Vec::with_capacity(set.len());
        let mut patterns = Vec::with_capacity(set.len());
        for (name, text) in set {
            patterns.push(Pattern::parse(name, text)?);
            names.push(name.clone());
        }

        let matcher = AhoCorasick::new(patterns.iter().map(Pattern::literal_run)).map_err(|e| {
            CodecError::InvalidSignature {
                name: "*".to_string(),
                reason: e.to_string(),
            }
        })?;

        Ok(Self {
            names,
            patterns,
            matcher,
        })
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Offset of the first verified match of every pattern found in
    /// `haystack`, keyed by pattern name.
    pub fn scan(&self, haystack: &[u8]) -> HashMap<&str, usize> {
        let mut found: HashMap<&str, usize> = HashMap::new();
        for hit in self.matcher.find_overlapping_iter(haystack) {
            let index = hit.pattern().as_usize();
            let name = self.names[index].as_str();
            if found.contains_key(name) {
                continue;
            }
            let pattern = &self.patterns[index];
            let Some(start) = hit.start().checked_sub(pattern.anchor.0) else {
                continue;
            };
            if pattern.matches_at(haystack, start) {
                found.insert(name, start);
            }
            if found.len() == self.patterns.len() {
                break;
            }
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(entries: &[(&str, &str)]) -> SignatureSet {
        entries
            .iter()
            .map(|(name, text)| (name.to_string(), text.to_string()))
            .collect()
    }

    #[test]
    fn test_wildcard_match() {
        let scanner = SignatureScanner::new(&set(&[("decode", "48 8B ?? 05 C3")])).unwrap();
        let haystack = [0x90, 0x90, 0x48, 0x8b, 0x7f, 0x05, 0xc3, 0x90];
        assert_eq!(scanner.scan(&haystack).get("decode"), Some(&2));
    }

    #[test]
    fn test_anchor_verifies_wildcard_prefix() {
        // Anchor run is "AA BB CC"; the leading literal must still match
        let scanner = SignatureScanner::new(&set(&[("train", "11 ?? AA BB CC")])).unwrap();
        assert!(scanner.scan(&[0x22, 0x00, 0xaa, 0xbb, 0xcc]).is_empty());
        assert_eq!(
            scanner.scan(&[0x22, 0x11, 0x00, 0xaa, 0xbb, 0xcc]).get("train"),
            Some(&1)
        );
    }

    #[test]
    fn test_anchor_before_haystack_start_is_skipped() {
        let scanner = SignatureScanner::new(&set(&[("size", "?? ?? AA BB")])).unwrap();
        assert!(scanner.scan(&[0xaa, 0xbb]).is_empty());
    }

    #[test]
    fn test_multiple_patterns_first_match_wins() {
        let scanner = SignatureScanner::new(&set(&[("a", "01 02"), ("b", "03 ?? 05")])).unwrap();
        let found = scanner.scan(&[0x03, 0x00, 0x05, 0x01, 0x02, 0x01, 0x02]);
        assert_eq!(found.get("a"), Some(&3));
        assert_eq!(found.get("b"), Some(&0));
    }

    #[test]
    fn test_invalid_patterns() {
        assert!(SignatureScanner::new(&set(&[("x", "?? ??")])).is_err());
        assert!(SignatureScanner::new(&set(&[("x", "4G")])).is_err());
        assert!(SignatureScanner::new(&set(&[("x", "123")])).is_err());
    }
}
