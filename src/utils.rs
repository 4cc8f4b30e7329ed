// ABOUTME: Utility functions for identifier validation, quoting and retries
// ABOUTME: Shared by the stores, the config layer and the file publisher

use anyhow::{bail, Result};
use std::time::Duration;

/// Retry an async operation with a fixed delay between attempts.
///
/// Runs `operation` up to `max_retries + 1` times and returns the first
/// success, or the last error once attempts are exhausted.
///
/// # Examples
///
/// ```no_run
/// # use anyhow::Result;
/// # use std::time::Duration;
/// # use mqtt_replicator::utils::retry_with_delay;
/// # async fn example() -> Result<()> {
/// let bytes = retry_with_delay(
///     || async { Ok(tokio::fs::read("payload.bin").await?) },
///     4,
///     Duration::from_millis(200),
/// )
/// .await?;
/// # Ok(())
/// # }
/// ```
pub async fn retry_with_delay<F, Fut, T>(
    mut operation: F,
    max_retries: u32,
    delay: Duration,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut last_error = None;

    for attempt in 0..=max_retries {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if attempt < max_retries {
                    tracing::warn!(
                        "Operation failed (attempt {}/{}): {}; retrying in {:?}",
                        attempt + 1,
                        max_retries + 1,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| anyhow::anyhow!("Operation failed after retries")))
}

/// Validate a table, schema or column name before it is spliced into SQL.
///
/// Names must start with a letter or underscore, contain only ASCII
/// letters, digits and underscores, and be at most 63 characters long
/// (the PostgreSQL limit, which also keeps SQLite names portable).
///
/// # Examples
///
/// ```
/// use mqtt_replicator::utils::validate_identifier;
/// assert!(validate_identifier("RoomTemperatures").is_ok());
/// assert!(validate_identifier("Room; DROP TABLE x").is_err());
/// ```
pub fn validate_identifier(identifier: &str) -> Result<()> {
    let trimmed = identifier.trim();
    let Some(first_char) = trimmed.chars().next() else {
        bail!("Identifier cannot be empty or whitespace-only");
    };

    if trimmed.len() > 63 {
        bail!(
            "Identifier '{}' exceeds maximum length of 63 characters (got {})",
            sanitize_identifier(trimmed),
            trimmed.len()
        );
    }

    if !first_char.is_ascii_alphabetic() && first_char != '_' {
        bail!(
            "Identifier '{}' must start with a letter or underscore, not '{}'",
            sanitize_identifier(trimmed),
            first_char
        );
    }

    for (i, c) in trimmed.chars().enumerate() {
        if !c.is_ascii_alphanumeric() && c != '_' {
            bail!(
                "Identifier '{}' contains invalid character '{}' at position {}. \
                 Only letters, digits, and underscores are allowed",
                sanitize_identifier(trimmed),
                if c.is_control() {
                    format!("\\x{:02x}", c as u32)
                } else {
                    c.to_string()
                },
                i
            );
        }
    }

    Ok(())
}

/// Strip control characters so an identifier can be echoed in an error.
pub fn sanitize_identifier(identifier: &str) -> String {
    identifier
        .chars()
        .filter(|c| !c.is_control())
        .take(100)
        .collect()
}

/// Quote an SQL identifier, doubling embedded double quotes.
///
/// Both PostgreSQL and SQLite accept this form.
///
/// ```
/// use mqtt_replicator::utils::quote_ident;
/// assert_eq!(quote_ident("CreatedAt"), "\"CreatedAt\"");
/// assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
/// ```
pub fn quote_ident(identifier: &str) -> String {
    let mut quoted = String::with_capacity(identifier.len() + 2);
    quoted.push('"');
    for ch in identifier.chars() {
        if ch == '"' {
            quoted.push('"');
        }
        quoted.push(ch);
    }
    quoted.push('"');
    quoted
}

/// Mask the password of a connection URL for logging.
///
/// Strings that do not parse as URLs (plain SQLite paths) are returned as-is.
pub fn sanitize_url(url: &str) -> String {
    if let Ok(mut parsed) = url::Url::parse(url) {
        if parsed.password().is_some() {
            let _ = parsed.set_password(Some("***"));
        }
        parsed.to_string()
    } else {
        url.to_string()
    }
}
