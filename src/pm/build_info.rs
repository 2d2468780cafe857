pub fn build_host() -> &'static str {
    option_env!("BOTMASTER_BUILD_HOST").unwrap_or("unknown")
}

pub fn build_time_raw() -> &'static str {
    option_env!("BOTMASTER_BUILD_TIME").unwrap_or("unknown")
}

/// Render `epoch:<secs>` (or RFC 3339) build stamps as `YYYY-MM-DD HH:MM:SS` UTC.
pub fn format_build_time(raw: &str) -> String {
    let raw = raw.trim();
    if let Some(epoch) = raw.strip_prefix("epoch:")
        && let Ok(secs) = epoch.trim().parse::<i64>()
        && let Some(dt) = chrono::DateTime::<chrono::Utc>::from_timestamp(secs, 0)
    {
        return dt.format("%Y-%m-%d %H:%M:%S").to_string();
    }
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(raw) {
        return dt
            .with_timezone(&chrono::Utc)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string();
    }
    raw.to_string()
}

pub fn banner() -> String {
    format!(
        "botmaster {} (built on {} at {}).",
        env!("CARGO_PKG_VERSION"),
        build_host(),
        format_build_time(build_time_raw())
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_stamp_renders_utc() {
        assert_eq!(format_build_time("epoch:0"), "1970-01-01 00:00:00");
        assert_eq!(format_build_time("2024-05-01T10:11:12Z"), "2024-05-01 10:11:12");
        assert_eq!(format_build_time("weird"), "weird");
    }
}
