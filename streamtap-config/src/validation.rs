//! Custom validation functions for configuration.

use std::collections::BTreeMap;

use validator::ValidationError;

/// Validate a tracing level name.
pub fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    let valid = ["trace", "debug", "info", "warn", "error"]
        .contains(&level.to_lowercase().as_str());
    if valid {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_log_level"))
    }
}

/// Validate frame magics: at least one, all hex, all the same non-zero length.
pub fn validate_magics(magics: &[String]) -> Result<(), ValidationError> {
    let decoded: Result<Vec<Vec<u8>>, _> = magics.iter().map(hex::decode).collect();
    let Ok(decoded) = decoded else {
        return Err(ValidationError::new("magic_not_hex"));
    };
    match decoded.first() {
        None => Err(ValidationError::new("magic_required")),
        Some(first) if first.is_empty() || decoded.iter().any(|m| m.len() != first.len()) => {
            Err(ValidationError::new("magic_length_mismatch"))
        }
        Some(_) => Ok(()),
    }
}

/// Validate signature patterns: space-separated hex bytes or `??` wildcards,
/// with at least one literal byte.
pub fn validate_signatures(set: &BTreeMap<String, String>) -> Result<(), ValidationError> {
    for pattern in set.values() {
        let mut literals = 0;
        for token in pattern.split_whitespace() {
            if token == "??" || token == "?" {
                continue;
            }
            if token.len() != 2 || hex::decode(token).is_err() {
                return Err(ValidationError::new("invalid_signature_token"));
            }
            literals += 1;
        }
        if literals == 0 {
            return Err(ValidationError::new("signature_without_literals"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_levels() {
        assert!(validate_log_level("INFO").is_ok());
        assert!(validate_log_level("verbose").is_err());
    }

    #[test]
    fn magics() {
        assert!(validate_magics(&["52a0".into(), "0000".into()]).is_ok());
        assert!(validate_magics(&[]).is_err());
        assert!(validate_magics(&["52a0".into(), "00".into()]).is_err());
        assert!(validate_magics(&["zz".into()]).is_err());
    }

    #[test]
    fn signatures() {
        let mut set = BTreeMap::new();
        set.insert("tcp_decode".to_string(), "48 8B ?? C3".to_string());
        assert!(validate_signatures(&set).is_ok());
        set.insert("udp_decode".to_string(), "?? ??".to_string());
        assert!(validate_signatures(&set).is_err());
    }
}
