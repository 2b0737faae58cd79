use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};

static REGISTER_METRICS: Once = Once::new();

pub const DISCOGS_SINK_ROWS_CHANGED_TOTAL: &str = "discogs_sink_rows_changed_total";
pub const DISCOGS_SINK_UPSERT_SECONDS: &str = "discogs_sink_upsert_seconds";

pub const SINK_LABEL: &str = "sink";

/// Registers the metrics emitted by the sinks. Only the first call has an effect.
pub(crate) fn register_metrics() {
    REGISTER_METRICS.call_once(|| {
        describe_counter!(
            DISCOGS_SINK_ROWS_CHANGED_TOTAL,
            Unit::Count,
            "Rows or nodes whose content hash changed on upsert"
        );

        describe_histogram!(
            DISCOGS_SINK_UPSERT_SECONDS,
            Unit::Seconds,
            "Time taken to upsert one batch in a single transaction"
        );
    });
}
