//! Prometheus metrics for observability and monitoring.
//!
//! The runtime records through the `metrics` facade; nothing is collected
//! until a recorder is installed. [`MetricsExporter`] installs the Prometheus
//! recorder and renders the scrape text, leaving the HTTP side to the host
//! application.
//!
//! # Example
//!
//! ```rust,no_run
//! use composable_requests_runtime::metrics::MetricsExporter;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let exporter = MetricsExporter::install()?;
//!
//! // ... dispatch requests ...
//!
//! if let Some(text) = exporter.render() {
//!     println!("{text}");
//! }
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use thiserror::Error;

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Installed Prometheus recorder.
#[derive(Clone, Default)]
pub struct MetricsExporter {
    handle: Option<PrometheusHandle>,
}

impl MetricsExporter {
    /// Register metric descriptions and install the Prometheus recorder.
    ///
    /// When a recorder is already installed (e.g. by another test) the
    /// exporter is returned without a handle and [`render`](Self::render)
    /// yields `None`.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::Install`] if the recorder cannot be installed
    /// for any other reason.
    pub fn install() -> Result<Self, MetricsError> {
        describe_metrics();

        match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                tracing::info!("Prometheus metrics recorder installed");
                Ok(Self {
                    handle: Some(handle),
                })
            },
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(Self { handle: None })
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            },
        }
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

impl std::fmt::Debug for MetricsExporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsExporter")
            .field("installed", &self.handle.is_some())
            .finish()
    }
}

/// Register descriptions for every metric the runtime records.
pub fn describe_metrics() {
    // Request metrics
    describe_counter!("requests.dispatched", "Dispatch calls that passed validation");
    describe_counter!("requests.started", "Requests whose operation factory was invoked");
    describe_counter!(
        "requests.deduplicated",
        "Dispatches absorbed into an already active handle"
    );
    describe_counter!(
        "requests.discarded",
        "Run-only-once dispatches dropped because the request was already resolved"
    );
    describe_counter!(
        "requests.settled",
        "Requests reaching a terminal status, labelled by status"
    );
    describe_counter!("requests.retried", "Retry calls made through a request handle");
    describe_gauge!("requests.in_flight", "Requests currently held in the registry");

    // Store metrics
    describe_counter!("store.actions.total", "Actions applied by the store");
    describe_counter!(
        "store.effects.executed",
        "Effects executed by the store, labelled by type"
    );
    describe_counter!(
        "store.shutdown.rejected_actions",
        "Actions rejected because the store was shutting down"
    );
}
