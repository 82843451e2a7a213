use crate::config::LoggingConfig;

/// Installs a global tracing subscriber. `RUST_LOG` overrides `config.level`.
/// Returns false if a subscriber was already installed.
pub fn init_logging(config: &LoggingConfig) -> bool {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    match config.format.as_str() {
        "json" => fmt()
            .json()
            .with_env_filter(filter)
            .with_thread_ids(false)
            .try_init()
            .is_ok(),
        _ => {
            let hostname = hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".to_string());
            let short_hostname = hostname.split('.').next().unwrap_or(&hostname).to_string();

            fmt()
                .with_env_filter(filter)
                .with_target(true)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_file(false)
                .with_line_number(false)
                .with_timer(CustomTimer {
                    hostname: short_hostname,
                })
                .compact()
                .try_init()
                .is_ok()
        }
    }
}

// UTC time plus hostname, e.g. "2025-12-10 18:09:43.150 [peer0]"
struct CustomTimer {
    hostname: String,
}

impl tracing_subscriber::fmt::time::FormatTime for CustomTimer {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        let now = chrono::Utc::now();
        write!(
            w,
            "{}.{:03} [{}]",
            now.format("%Y-%m-%d %H:%M:%S"),
            now.timestamp_subsec_millis(),
            self.hostname
        )
    }
}
