use chrono::{DateTime, Utc};

use cairn_core::repo::descriptor::{MAX_MAX_PACK_SIZE, MIN_MAX_PACK_SIZE};

use crate::CliResult;

/// Parse a human-readable size string like "500M", "2G", "1024K" into bytes.
pub(crate) fn parse_size(s: &str) -> CliResult<u64> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty size string".into());
    }

    let (num_str, multiplier) = match s.as_bytes().last() {
        Some(b'K' | b'k') => (&s[..s.len() - 1], 1024u64),
        Some(b'M' | b'm') => (&s[..s.len() - 1], 1024 * 1024),
        Some(b'G' | b'g') => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        _ => (s, 1u64),
    };

    let num: f64 = num_str
        .parse()
        .map_err(|_| format!("invalid size: '{s}'"))?;
    if num < 0.0 {
        return Err(format!("size must not be negative: '{s}'").into());
    }
    Ok((num * multiplier as f64) as u64)
}

/// Parse a pack size and check it against the limits a descriptor accepts.
pub(crate) fn parse_pack_size(s: &str) -> CliResult<u32> {
    let bytes = parse_size(s)?;
    if bytes < u64::from(MIN_MAX_PACK_SIZE) || bytes > u64::from(MAX_MAX_PACK_SIZE) {
        return Err(format!(
            "pack size {} is outside {}..={}",
            format_bytes(bytes),
            format_bytes(u64::from(MIN_MAX_PACK_SIZE)),
            format_bytes(u64::from(MAX_MAX_PACK_SIZE)),
        )
        .into());
    }
    Ok(bytes as u32)
}

pub(crate) fn format_bytes(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = KIB * 1024;
    const GIB: u64 = MIB * 1024;

    if bytes >= GIB {
        format!("{:.2} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.2} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.2} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{bytes} B")
    }
}

pub(crate) fn format_time(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

pub(crate) fn format_versions(versions: &[u32]) -> String {
    if versions.is_empty() {
        return "none".to_string();
    }
    versions
        .iter()
        .map(|v| format!("v{v}"))
        .collect::<Vec<_>>()
        .join(", ")
}
