//! Utility functions for the segmentation gateway

/// Prefix of every distributed transaction id this gateway issues.
pub const TX_PREFIX: &str = "tx_";

/// Maximum length of a caller-assigned segment id
pub const MAX_SEGMENT_ID_LEN: usize = 256;

/// Parse duration string (e.g., "30s", "5m", "1h", "7d")
pub fn parse_duration(s: &str) -> crate::Result<std::time::Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(crate::Error::InvalidConfig("empty duration".into()));
    }

    let (num_str, unit) = if let Some(num) = s.strip_suffix("ms") {
        (num, "ms")
    } else {
        let last = s.char_indices().last().map(|(i, _)| i).unwrap_or(0);
        s.split_at(last)
    };

    let num: u64 = num_str
        .parse()
        .map_err(|_| crate::Error::InvalidConfig(format!("invalid duration: {}", s)))?;

    if unit == "ms" {
        return Ok(std::time::Duration::from_millis(num));
    }

    let scale: u64 = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86400,
        _ => {
            return Err(crate::Error::InvalidConfig(format!(
                "unknown duration unit: {}",
                unit
            )))
        }
    };

    let secs = num
        .checked_mul(scale)
        .ok_or_else(|| crate::Error::InvalidConfig(format!("duration out of range: {}", s)))?;
    Ok(std::time::Duration::from_secs(secs))
}

/// Generate a process-wide unique id for one distributed write.
///
/// The id is spliced into `PREPARE TRANSACTION '<id>'`, so it only ever
/// contains `[a-z0-9_]`.
pub fn generate_tx_id() -> String {
    format!("{}{}", TX_PREFIX, uuid::Uuid::new_v4().simple())
}

/// Validate an externally supplied transaction id (reconciliation input).
pub fn validate_tx_id(tx_id: &str) -> crate::Result<()> {
    if !tx_id.starts_with(TX_PREFIX) || tx_id.len() > 200 {
        return Err(crate::Error::InvalidArgument(format!(
            "not a gateway transaction id: {}",
            tx_id
        )));
    }

    if !tx_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(crate::Error::InvalidArgument(
            "transaction id contains invalid characters".into(),
        ));
    }

    Ok(())
}

/// Validate a segment id (must be non-empty, reasonable length)
pub fn validate_segment_id(id: &str) -> crate::Result<()> {
    if id.trim().is_empty() {
        return Err(crate::Error::InvalidArgument(
            "segment id cannot be empty".into(),
        ));
    }

    if id.len() > MAX_SEGMENT_ID_LEN {
        return Err(crate::Error::InvalidArgument(format!(
            "segment id too long (max {} bytes)",
            MAX_SEGMENT_ID_LEN
        )));
    }

    if id.chars().any(|c| c.is_control()) {
        return Err(crate::Error::InvalidArgument(
            "segment id contains invalid characters".into(),
        ));
    }

    Ok(())
}
