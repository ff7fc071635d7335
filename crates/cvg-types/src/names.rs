use crate::CvgError;

/// The database every server has. Never created or dropped by reconciliation.
pub const SYSTEM_DATABASE: &str = "_system";

/// Longest accepted database or shard name, in bytes.
pub const MAX_NAME_LENGTH: usize = 64;

fn allowed_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

/// Database names start with a letter and contain only ASCII letters,
/// digits, `_` and `-`. `_system` is the single exception to the first rule.
pub fn validate_database_name(name: &str) -> Result<(), CvgError> {
    if name == SYSTEM_DATABASE {
        return Ok(());
    }
    let starts_ok = name.chars().next().is_some_and(|c| c.is_ascii_alphabetic());
    if !starts_ok || name.len() > MAX_NAME_LENGTH || !name.chars().all(allowed_char) {
        return Err(CvgError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Shard names start with a letter or `_` and contain only ASCII letters,
/// digits, `_` and `-`.
pub fn validate_shard_name(name: &str) -> Result<(), CvgError> {
    let starts_ok = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if !starts_ok || name.len() > MAX_NAME_LENGTH || !name.chars().all(allowed_char) {
        return Err(CvgError::InvalidName(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_names() {
        assert!(validate_database_name("test").is_ok());
        assert!(validate_database_name("_system").is_ok());
        assert!(validate_database_name("a-b_c9").is_ok());
        assert!(validate_database_name("").is_err());
        assert!(validate_database_name("_private").is_err());
        assert!(validate_database_name("9lives").is_err());
        assert!(validate_database_name("has space").is_err());
        assert!(validate_database_name(&"x".repeat(MAX_NAME_LENGTH + 1)).is_err());
    }

    #[test]
    fn shard_names() {
        assert!(validate_shard_name("s100001").is_ok());
        assert!(validate_shard_name("_internal").is_ok());
        assert!(validate_shard_name("Möter").is_err());
        assert!(validate_shard_name("").is_err());
        assert!(validate_shard_name("-dash").is_err());
    }
}
