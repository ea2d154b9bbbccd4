use std::sync::Arc;

use ratefeed_engine::{
    ChannelSink, EngineSettings, FeedEvent, RateEngine, RawRate, SinkMessage,
};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{Config, OutputFormat};

/// Logs go to stderr; stdout carries sink output.
pub fn init_tracing() {
    let log_format = std::env::var("RATEFEED_LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    if log_format.eq_ignore_ascii_case("json") {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_line_number(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

pub fn build_engine(config: &Config, sink: ChannelSink) -> anyhow::Result<Arc<RateEngine>> {
    let settings = EngineSettings::from_path(&config.settings_path)?;
    info!("Settings path in use: {}", config.settings_path.display());
    let engine = RateEngine::in_memory(settings, Arc::new(sink))?;
    Ok(Arc::new(engine))
}

/// Parse one input line.
///
/// Accepts a tagged [`FeedEvent`] or a bare raw rate, which is treated as a
/// tick. Blank lines yield `None`.
pub fn parse_line(line: &str) -> Result<Option<FeedEvent>, serde_json::Error> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    match serde_json::from_str::<FeedEvent>(line) {
        Ok(event) => Ok(Some(event)),
        Err(event_err) => match serde_json::from_str::<RawRate>(line) {
            Ok(rate) => Ok(Some(FeedEvent::Tick(rate))),
            Err(_) => Err(event_err),
        },
    }
}

/// Text written to stdout for a sink message, if any.
pub fn render(message: &SinkMessage, format: OutputFormat) -> Option<String> {
    match (format, message) {
        (OutputFormat::Json, _) => serde_json::to_string(message).ok(),
        (OutputFormat::Delimited, SinkMessage::Batch(batch)) => Some(batch.to_delimited()),
        (OutputFormat::Delimited, SinkMessage::Rate(_)) => None,
    }
}

/// Forward input lines into the feed until EOF or until the engine stops
/// accepting events. Returns the number of events forwarded.
pub async fn read_feed<R>(reader: R, feed: mpsc::Sender<FeedEvent>) -> anyhow::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut forwarded = 0;
    let mut line_no = 0usize;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        let event = match parse_line(&line) {
            Ok(Some(event)) => event,
            Ok(None) => continue,
            Err(e) => {
                warn!(line = line_no, error = %e, "Skipping malformed input line");
                continue;
            }
        };
        if feed.send(event).await.is_err() {
            warn!("Engine no longer accepts feed events");
            break;
        }
        forwarded += 1;
    }
    info!(forwarded, "Input feed ended");
    Ok(forwarded)
}

/// Write sink messages to stdout until every sender is gone.
pub fn spawn_printer(mut rx: mpsc::Receiver<SinkMessage>, format: OutputFormat) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if let Some(line) = render(&message, format) {
                println!("{}", line);
            }
        }
    })
}

/// Log a health summary on a fixed interval until the engine stops.
pub fn spawn_status_reporter(engine: Arc<RateEngine>, config: &Config) -> Option<JoinHandle<()>> {
    if config.status_interval.is_zero() {
        return None;
    }
    let every = config.status_interval;
    let mut lifecycle = engine.lifecycle();

    Some(tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = engine.health().await;
                    info!(
                        status = %report.status,
                        pending = report.pending.len(),
                        open_windows = report.open_windows,
                        succeeded = report.runs.succeeded,
                        failed = report.runs.failed,
                        "Engine health"
                    );
                }
                _ = lifecycle.stopping() => break,
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ratefeed_engine::RateBatch;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_tagged_event() {
        let event = parse_line(r#"{"event":"connected","provider":"PF1"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            FeedEvent::Connected {
                provider: "PF1".to_string()
            }
        );
    }

    #[test]
    fn test_parse_bare_rate_as_tick() {
        let event = parse_line(
            r#"{"symbol":"PF1_USDTRY","provider":"PF1","bid":"34.1","ask":"34.2",
                "timestamp":"2026-01-05T10:00:00Z"}"#,
        )
        .unwrap()
        .unwrap();
        match event {
            FeedEvent::Tick(rate) => {
                assert_eq!(rate.provider, "PF1");
                assert_eq!(rate.bid, dec!(34.1));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_parse_blank_and_malformed() {
        assert!(parse_line("   ").unwrap().is_none());
        assert!(parse_line("{not json").is_err());
    }

    #[test]
    fn test_render_delimited_skips_single_rates() {
        let trigger = RawRate::new("PF1", "PF1_USDTRY", dec!(34.1), dec!(34.2), Utc::now());
        let rate = SinkMessage::Rate(trigger.clone().into());
        assert!(render(&rate, OutputFormat::Delimited).is_none());
        assert!(render(&rate, OutputFormat::Json).is_some());

        let batch = SinkMessage::Batch(RateBatch {
            pipeline_id: "PF1_USDTRY-1".to_string(),
            trigger,
            peers: Vec::new(),
            derived: Vec::new(),
            assembled_at: Utc::now(),
        });
        let line = render(&batch, OutputFormat::Delimited).unwrap();
        assert!(line.starts_with("PF1-PF1_USDTRY|34.1|34.2|"));
    }

    #[tokio::test]
    async fn test_read_feed_forwards_valid_lines() {
        let input = concat!(
            "{\"event\":\"connected\",\"provider\":\"PF1\"}\n",
            "\n",
            "garbage\n",
            "{\"event\":\"status\",\"provider\":\"PF1\",\"message\":\"ok\"}\n",
        );
        let (tx, mut rx) = mpsc::channel(8);
        let forwarded = read_feed(input.as_bytes(), tx).await.unwrap();
        assert_eq!(forwarded, 2);

        assert!(matches!(rx.recv().await, Some(FeedEvent::Connected { .. })));
        assert!(matches!(rx.recv().await, Some(FeedEvent::Status { .. })));
        assert!(rx.recv().await.is_none());
    }
}
