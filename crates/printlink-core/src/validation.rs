//! # Config Validation
//!
//! Field rules checked by the CRUD surface before a config reaches the
//! provider. Identity uniqueness is the provider's job, and the table's
//! constraints are the last line.
//!
//! ```rust
//! use printlink_core::validation::{validate_device_url, validate_short_id};
//!
//! validate_device_url("http://octopi.local").unwrap();
//! validate_short_id("9ZZM").unwrap();
//! ```

use crate::error::ValidationError;
use crate::record::PrinterConfig;

pub type ValidationResult<T> = Result<T, ValidationError>;

const MAX_NAME_CHARS: usize = 64;
const MAX_TOKEN_BYTES: usize = 256;
const SHORT_ID_LEN: std::ops::RangeInclusive<usize> = 4..=8;

/// Display name: not blank, at most 64 characters.
pub fn validate_name(name: &str) -> ValidationResult<()> {
    let name = name.trim();
    if name.is_empty() {
        Err(ValidationError::Required { field: "name" })
    } else if name.chars().count() > MAX_NAME_CHARS {
        Err(ValidationError::TooLong {
            field: "name",
            max: MAX_NAME_CHARS,
        })
    } else {
        Ok(())
    }
}

/// Device URL: `http` or `https` followed by a host.
pub fn validate_device_url(url: &str) -> ValidationResult<()> {
    let invalid = |reason| ValidationError::InvalidFormat {
        field: "device_url",
        reason,
    };

    let rest = ["http://", "https://"]
        .iter()
        .find_map(|scheme| url.strip_prefix(scheme))
        .ok_or_else(|| invalid("must start with http:// or https://"))?;

    match rest.split(['/', ':']).next() {
        Some(host) if !host.is_empty() => Ok(()),
        _ => Err(invalid("missing host")),
    }
}

/// Setup code shown to the user for pairing, e.g. `9ZZM`.
pub fn validate_short_id(short_id: &str) -> ValidationResult<()> {
    let field = "short_id";
    if short_id.len() < *SHORT_ID_LEN.start() {
        return Err(ValidationError::TooShort {
            field,
            min: *SHORT_ID_LEN.start(),
        });
    }
    if short_id.len() > *SHORT_ID_LEN.end() {
        return Err(ValidationError::TooLong {
            field,
            max: *SHORT_ID_LEN.end(),
        });
    }
    if !short_id.bytes().all(|b| b.is_ascii_alphanumeric()) {
        return Err(ValidationError::InvalidFormat {
            field,
            reason: "must contain only letters and digits",
        });
    }
    Ok(())
}

pub fn validate_token(token: &str) -> ValidationResult<()> {
    if token.trim().is_empty() {
        return Err(ValidationError::Required { field: "token" });
    }
    if token.len() > MAX_TOKEN_BYTES {
        return Err(ValidationError::TooLong {
            field: "token",
            max: MAX_TOKEN_BYTES,
        });
    }
    Ok(())
}

/// Checks every field the config carries. Absent fields are fine: a fresh
/// record has no token or setup code yet.
pub fn validate_config(config: &PrinterConfig) -> ValidationResult<()> {
    config.name.as_deref().map(validate_name).transpose()?;
    config.device_url.as_deref().map(validate_device_url).transpose()?;
    config.token.as_deref().map(validate_token).transpose()?;
    config.short_id.as_deref().map(validate_short_id).transpose()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names() {
        assert!(validate_name("Prusa MK4").is_ok());
        assert!(validate_name("   ").is_err());
        assert!(validate_name(&"A".repeat(65)).is_err());
    }

    #[test]
    fn test_device_urls() {
        assert!(validate_device_url("http://octopi.local").is_ok());
        assert!(validate_device_url("https://10.0.0.5:5000/api").is_ok());
        assert!(validate_device_url("ftp://octopi.local").is_err());
        assert!(validate_device_url("http://").is_err());
    }

    #[test]
    fn test_short_ids() {
        assert!(validate_short_id("9ZZM").is_ok());
        assert!(validate_short_id("ABC").is_err());
        assert!(validate_short_id("ABCDEFGHI").is_err());
        assert!(validate_short_id("AB-CD").is_err());
    }

    #[test]
    fn test_whole_config() {
        let ok = PrinterConfig::new()
            .with_name("Ender")
            .with_device_url("http://ender.local");
        assert!(validate_config(&ok).is_ok());

        let bad = PrinterConfig::new().with_device_url("octopi.local");
        assert!(matches!(
            validate_config(&bad),
            Err(ValidationError::InvalidFormat { field: "device_url", .. })
        ));
    }
}
