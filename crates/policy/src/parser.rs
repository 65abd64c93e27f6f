use std::num::IntErrorKind;

use tiered_backup_common::{ResourceRef, RetentionPolicy, CONFIG_TAG};

/// Field names in the fixed order of the configuration string.
const FIELDS: [&str; 4] = ["daily", "weekly", "monthly", "yearly"];

/// Why a raw configuration string was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    #[error("expected 4 comma-separated values (daily,weekly,monthly,yearly), found {0}")]
    WrongFieldCount(usize),

    #[error("{field} value {token:?} is not an integer")]
    NotAnInteger { field: &'static str, token: String },

    #[error("{field} value {value} is negative")]
    Negative { field: &'static str, value: i64 },

    #[error("{field} value {token} is out of range")]
    OutOfRange { field: &'static str, token: String },
}

/// A resource's backup configuration could not be decoded.
///
/// Carries the resource and the raw string so a skipped resource can be
/// located from the log line alone.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("syntax error in {tag} of {resource}: {raw:?} ({reason})", tag = CONFIG_TAG)]
pub struct ConfigError {
    pub resource: ResourceRef,
    pub raw: String,
    #[source]
    pub reason: PolicyError,
}

/// Decodes `daily,weekly,monthly,yearly` configuration strings.
pub struct PolicyParser;

impl PolicyParser {
    /// Parse the configuration tag value of `resource`.
    pub fn parse(resource: &ResourceRef, raw: &str) -> Result<RetentionPolicy, ConfigError> {
        parse_policy(raw).map_err(|reason| ConfigError {
            resource: resource.clone(),
            raw: raw.to_string(),
            reason,
        })
    }
}

/// Parse a configuration string without resource context.
///
/// Whitespace around each value is ignored; a leading `+` is accepted.
pub fn parse_policy(raw: &str) -> Result<RetentionPolicy, PolicyError> {
    let tokens: Vec<&str> = raw.split(',').collect();
    if tokens.len() != FIELDS.len() {
        return Err(PolicyError::WrongFieldCount(tokens.len()));
    }

    let mut counts = [0u32; 4];
    for ((slot, token), field) in counts.iter_mut().zip(&tokens).zip(FIELDS) {
        *slot = parse_count(field, token.trim())?;
    }

    let [daily, weekly, monthly, yearly] = counts;
    Ok(RetentionPolicy::new(daily, weekly, monthly, yearly))
}

fn parse_count(field: &'static str, token: &str) -> Result<u32, PolicyError> {
    let value: i64 = token.parse().map_err(|e: std::num::ParseIntError| match e.kind() {
        IntErrorKind::PosOverflow => PolicyError::OutOfRange {
            field,
            token: token.to_string(),
        },
        // Anything below i64::MIN is still a negative integer.
        IntErrorKind::NegOverflow => PolicyError::Negative {
            field,
            value: i64::MIN,
        },
        _ => PolicyError::NotAnInteger {
            field,
            token: token.to_string(),
        },
    })?;

    if value < 0 {
        return Err(PolicyError::Negative { field, value });
    }
    u32::try_from(value).map_err(|_| PolicyError::OutOfRange {
        field,
        token: token.to_string(),
    })
}
