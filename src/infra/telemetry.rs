//! Logging and metric names.
//!
//! Every counter and gauge the cache emits is named here and described
//! once, the first time the subscriber is installed. Metric values go to
//! whatever `metrics` recorder the host process installs; without one they
//! are dropped.

use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge};
use tracing::{Subscriber, level_filters::LevelFilter};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    registry::LookupSpan,
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

pub const METRIC_HIT: &str = "lxcache_hit_total";
pub const METRIC_MISS: &str = "lxcache_miss_total";
pub const METRIC_BYPASS: &str = "lxcache_bypass_total";
pub const METRIC_STORE: &str = "lxcache_store_total";
pub const METRIC_PURGE: &str = "lxcache_purge_total";
pub const METRIC_PENDING_PURGE_LEN: &str = "lxcache_pending_purge_len";

const COUNTERS: [(&str, &str); 5] = [
    (METRIC_HIT, "Pages served straight from the file cache."),
    (METRIC_MISS, "Cacheable requests forwarded to the origin."),
    (METRIC_BYPASS, "Requests that skipped the cache, labelled by reason."),
    (METRIC_STORE, "Origin responses written to the file cache."),
    (METRIC_PURGE, "Purge attempts, labelled by service and result."),
];

const GAUGES: [(&str, &str); 1] = [(
    METRIC_PENDING_PURGE_LEN,
    "URLs waiting for the next CDN purge attempt.",
)];

static DESCRIBED: Once = Once::new();

/// Install the global subscriber. `RUST_LOG` overrides the configured level.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    DESCRIBED.call_once(|| {
        for (name, help) in COUNTERS {
            describe_counter!(name, Unit::Count, help);
        }
        for (name, help) in GAUGES {
            describe_gauge!(name, Unit::Count, help);
        }
    });

    tracing_subscriber::registry()
        .with(filter(logging.level))
        .with(ErrorLayer::default())
        .with(output(logging.format))
        .try_init()
        .map_err(|err| InfraError::telemetry(format!("tracing subscriber already set: {err}")))
}

fn filter(level: LevelFilter) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy()
}

fn output<S>(format: LogFormat) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    match format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(false).boxed(),
    }
}
