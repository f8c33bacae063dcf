//! Timezone handling. The sync daemon and filesystem mtimes each assume
//! their own fixed offset by default; this crate treats both as
//! configuration and normalizes every timestamp to UTC internally,
//! keeping the configured zone only for human-readable log output.

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};

/// Default timezone offset the sync daemon assumes when a modTime it
/// reports carries no explicit offset.
pub const DEFAULT_SYNC_DAEMON_OFFSET_SECS: i32 = 2 * 3600;

/// Parses the sync daemon's modTime shape: `YYYY-MM-DDTHH:MM:SS[.ffffff][+HH:MM]`.
/// Missing fractional seconds default to zero; a missing offset defaults
/// to [`DEFAULT_SYNC_DAEMON_OFFSET_SECS`]. Returns `None` on malformed
/// input, which callers treat as a config/invariant error: log and keep
/// the existing row.
pub fn parse_sync_daemon_mod_time(raw: &str) -> Option<DateTime<Utc>> {
    let re = regex::Regex::new(
        r"^(\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2})(\.\d+)?(Z|[+-]\d{2}:\d{2})?$",
    )
    .expect("static regex");
    let caps = re.captures(raw.trim())?;
    let base = caps.get(1)?.as_str();
    let naive = NaiveDateTime::parse_from_str(base, "%Y-%m-%dT%H:%M:%S").ok()?;

    let fraction_micros = caps
        .get(2)
        .map(|m| {
            let digits = &m.as_str()[1..];
            let padded: String = digits.chars().chain(std::iter::repeat('0')).take(6).collect();
            padded.parse::<u32>().unwrap_or(0)
        })
        .unwrap_or(0);
    let naive = naive + chrono::Duration::microseconds(fraction_micros as i64);

    let offset = match caps.get(3).map(|m| m.as_str()) {
        Some("Z") => FixedOffset::east_opt(0)?,
        Some(tz) => parse_fixed_offset(tz)?,
        None => FixedOffset::east_opt(DEFAULT_SYNC_DAEMON_OFFSET_SECS)?,
    };

    let local = offset.from_local_datetime(&naive).single()?;
    Some(local.with_timezone(&Utc))
}

fn parse_fixed_offset(raw: &str) -> Option<FixedOffset> {
    let sign = if raw.starts_with('-') { -1 } else { 1 };
    let rest = &raw[1..];
    let (h, m) = rest.split_once(':')?;
    let secs = sign * (h.parse::<i32>().ok()? * 3600 + m.parse::<i32>().ok()? * 60);
    FixedOffset::east_opt(secs)
}

/// Renders a UTC instant in the given IANA-ish configuration string for
/// log output. Only fixed-offset and the two hard-coded source zones are
/// recognized; anything else falls back to UTC with a warning at the
/// call site.
pub fn render_in_configured_zone(instant: DateTime<Utc>, timezone: &str) -> String {
    let offset = match timezone {
        "Europe/Budapest" => FixedOffset::east_opt(3600), // CET, ignoring DST for log display
        _ => None,
    };
    match offset {
        Some(offset) => instant
            .with_timezone(&offset)
            .format("%Y-%m-%d %H:%M:%S%.6f %:z")
            .to_string(),
        None => instant.format("%Y-%m-%d %H:%M:%S%.6f UTC").to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_with_explicit_offset_and_fraction() {
        let parsed = parse_sync_daemon_mod_time("2022-06-01T10:00:00.123456+02:00").unwrap();
        assert_eq!(parsed.format("%H:%M:%S").to_string(), "08:00:00");
    }

    #[test]
    fn defaults_offset_and_fraction_when_absent() {
        let with_default = parse_sync_daemon_mod_time("2022-06-01T10:00:00").unwrap();
        let with_explicit = parse_sync_daemon_mod_time("2022-06-01T10:00:00+02:00").unwrap();
        assert_eq!(with_default, with_explicit);
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(parse_sync_daemon_mod_time("not-a-date").is_none());
    }
}
