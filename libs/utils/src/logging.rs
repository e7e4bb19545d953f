use anyhow::Context;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Plain,
    Json,
}

impl LogFormat {
    pub fn from_config(s: &str) -> anyhow::Result<LogFormat> {
        match s {
            "plain" => Ok(LogFormat::Plain),
            "json" => Ok(LogFormat::Json),
            _ => anyhow::bail!("Unknown log format: '{s}', expected one of 'plain' or 'json'"),
        }
    }
}

/// Initialize the process-wide tracing subscriber. Must run before any
/// task is spawned; respects `RUST_LOG`, defaulting to `info`.
pub fn init(log_format: LogFormat) -> anyhow::Result<()> {
    let default_filter_str = "info";

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter_str));

    let base_logger = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_ansi(false)
        .with_writer(std::io::stdout);

    match log_format {
        LogFormat::Json => base_logger.json().init(),
        LogFormat::Plain => base_logger.init(),
    }

    Ok(())
}

/// Replace the default panic hook with one that routes through the
/// tracing stack, so panics end up in the same sink as everything else.
pub fn replace_panic_hook_with_tracing_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        let location = info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_else(|| "<unknown>".to_owned());
        tracing::error!("panic at {location}: {info}");
    }));
}

/// Parse a duration config value, accepting both bare seconds and
/// humantime forms ("90", "90s", "5m").
pub fn parse_duration(s: &str) -> anyhow::Result<std::time::Duration> {
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(std::time::Duration::from_secs(secs));
    }
    humantime_parse(s).with_context(|| format!("cannot parse duration '{s}'"))
}

fn humantime_parse(s: &str) -> anyhow::Result<std::time::Duration> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| anyhow::anyhow!("missing unit"))?;
    let (value, unit) = s.split_at(split);
    let value: u64 = value.parse()?;
    let secs = match unit.trim() {
        "s" | "sec" | "secs" => value,
        "m" | "min" | "mins" => value * 60,
        "h" | "hour" | "hours" => value * 3600,
        _ => anyhow::bail!("unknown unit '{unit}'"),
    };
    Ok(std::time::Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn durations_parse() {
        assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("90s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("4h").unwrap(), Duration::from_secs(14400));
        assert!(parse_duration("4 fortnights").is_err());
    }
}
