//! Tracing setup and identity helpers.

use chrono::Local;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when `RUST_LOG` is not set.
pub const DEFAULT_FILTER: &str = "info,llmsee_proxy=debug,llmsee=debug";

/// Appended to every filter so HTTP library trace output stays quiet.
const NOISE_FILTER: &str = "hyper=warn,hyper::proto=warn,h2=warn,reqwest=warn,sqlx=warn";

/// Timestamp formatter using the local timezone (respects `TZ`).
struct LocalTime;

impl tracing_subscriber::fmt::time::FormatTime for LocalTime {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        let now = Local::now();
        write!(w, "{}", now.format("%Y-%m-%d %H:%M:%S"))
    }
}

/// Build the filter string from an optional `RUST_LOG` value.
pub fn filter_directives(rust_log: Option<&str>) -> String {
    format!("{},{}", rust_log.unwrap_or(DEFAULT_FILTER), NOISE_FILTER)
}

/// Install the global subscriber. `NO_COLOR` disables ANSI output.
pub fn init_tracing() {
    let no_color = std::env::var("NO_COLOR").is_ok();
    let rust_log = std::env::var("RUST_LOG").ok();
    let filter = tracing_subscriber::EnvFilter::new(filter_directives(rust_log.as_deref()));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_timer(LocalTime)
                .with_ansi(!no_color),
        )
        .init();
}

/// Fresh identity for a live-update subscriber.
pub fn generate_client_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
