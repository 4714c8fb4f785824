//! Input validation for names and values that end up in kernel objects
//!
//! Every check here mirrors a kernel limit: interface names fit `IFNAMSIZ`,
//! object names fit `NFT_NAME_MAXLEN`, log prefixes fit `NF_LOG_PREFIXLEN`.

use crate::core::error::{ObjectKind, ValidationError};

/// Maximum interface name length (`IFNAMSIZ - 1`)
pub const MAX_INTERFACE_LEN: usize = 15;

/// Maximum table, chain and set name length (`NFT_NAME_MAXLEN - 1`)
pub const MAX_NAME_LEN: usize = 255;

/// Maximum log prefix length (`NF_LOG_PREFIXLEN - 1`)
pub const MAX_LOG_PREFIX_LEN: usize = 127;

/// Validates a network interface name.
///
/// Linux kernel interface name rules:
/// - 1 to 15 characters
/// - ASCII alphanumeric, dot, dash, underscore only
/// - Cannot be "." or ".."
///
/// A single trailing `*` is accepted as a wildcard, as `nft` does.
///
/// # Errors
///
/// Returns `Err` if the name violates kernel constraints.
///
/// # Examples
///
/// ```
/// use nftkit::validators::validate_interface;
///
/// assert!(validate_interface("eth0").is_ok());
/// assert!(validate_interface("veth*").is_ok());
/// assert!(validate_interface("a-very-long-interface").is_err());
/// ```
pub fn validate_interface(name: &str) -> Result<(), ValidationError> {
    let invalid = |reason| {
        Err(ValidationError::InvalidInterface {
            name: name.to_string(),
            reason,
        })
    };

    if name.is_empty() {
        return invalid("empty");
    }

    if name.len() > MAX_INTERFACE_LEN {
        return invalid("longer than 15 characters");
    }

    if name == "." || name == ".." {
        return invalid("reserved name");
    }

    let stem = name.strip_suffix('*').unwrap_or(name);
    if !stem
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
    {
        return invalid("contains invalid characters");
    }

    Ok(())
}

/// Validates a table, chain or set name.
///
/// # Errors
///
/// Returns `Err` if the name is empty, too long, or contains control characters.
pub fn validate_object_name(kind: ObjectKind, name: &str) -> Result<(), ValidationError> {
    let reason = if name.is_empty() {
        Some("empty")
    } else if name.len() > MAX_NAME_LEN {
        Some("longer than 255 bytes")
    } else if name.chars().any(char::is_control) {
        Some("contains control characters")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(ValidationError::InvalidName {
            kind,
            name: name.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

/// Validates an inclusive port range.
///
/// # Errors
///
/// Returns `Err` if the start port is greater than the end port.
pub fn validate_port_range(start: u16, end: u16) -> Result<(u16, u16), ValidationError> {
    if start > end {
        Err(ValidationError::InvalidPortRange { start, end })
    } else {
        Ok((start, end))
    }
}

/// Validates a log prefix.
///
/// # Errors
///
/// Returns `Err` if the prefix exceeds 127 bytes.
pub fn validate_log_prefix(prefix: &str) -> Result<(), ValidationError> {
    if prefix.len() > MAX_LOG_PREFIX_LEN {
        Err(ValidationError::LogPrefixTooLong {
            max: MAX_LOG_PREFIX_LEN,
        })
    } else {
        Ok(())
    }
}


#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn test_validate_port_range_consistency(start in any::<u16>(), end in any::<u16>()) {
            let result = validate_port_range(start, end);
            if start <= end {
                prop_assert_eq!(result, Ok((start, end)));
            } else {
                prop_assert!(result.is_err());
            }
        }

        #[test]
        fn test_validate_interface_length_constraint(name in "[a-zA-Z0-9._-]{1,20}") {
            let result = validate_interface(&name);
            if name.len() <= 15 && name != "." && name != ".." {
                prop_assert!(result.is_ok());
            } else if name.len() > 15 {
                prop_assert!(result.is_err());
            }
        }

        #[test]
        fn test_validate_interface_char_constraint(
            valid_prefix in "[a-zA-Z0-9._-]{1,10}",
            invalid_char in "[^a-zA-Z0-9._*-]"
        ) {
            let invalid_name = format!("{valid_prefix}{invalid_char}");
            prop_assert!(validate_interface(&invalid_name).is_err());
        }
    }
}
