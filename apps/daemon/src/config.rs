use std::path::PathBuf;
use std::time::Duration;

/// How sink messages are written to stdout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    /// Every sink message as one JSON line.
    Json,
    /// Only batches, in the `SOURCE-SYMBOL|BID|ASK|EPOCH_MILLIS` line format.
    Delimited,
}

impl OutputFormat {
    fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("delimited") {
            Self::Delimited
        } else {
            Self::Json
        }
    }
}

pub struct Config {
    pub settings_path: PathBuf,
    pub output: OutputFormat,
    pub sink_buffer: usize,
    /// Zero disables the periodic health log.
    pub status_interval: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let settings_path = std::env::var("RATEFEED_SETTINGS")
            .unwrap_or_else(|_| "config/settings.json".into())
            .into();
        let output = OutputFormat::parse(
            &std::env::var("RATEFEED_OUTPUT").unwrap_or_else(|_| "json".into()),
        );
        let sink_buffer: usize = std::env::var("RATEFEED_SINK_BUFFER")
            .unwrap_or_else(|_| "4096".into())
            .parse()
            .unwrap_or(4096);
        let status_secs: u64 = std::env::var("RATEFEED_STATUS_INTERVAL_SECS")
            .unwrap_or_else(|_| "60".into())
            .parse()
            .unwrap_or(60);
        Self {
            settings_path,
            output,
            sink_buffer: sink_buffer.max(1),
            status_interval: Duration::from_secs(status_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_format_parse() {
        assert_eq!(OutputFormat::parse("delimited"), OutputFormat::Delimited);
        assert_eq!(OutputFormat::parse("DELIMITED"), OutputFormat::Delimited);
        assert_eq!(OutputFormat::parse("json"), OutputFormat::Json);
        assert_eq!(OutputFormat::parse("anything"), OutputFormat::Json);
    }
}
