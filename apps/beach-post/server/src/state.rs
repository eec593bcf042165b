use std::{sync::Arc, time::Duration};

use beach_post_core::{ClusterAgent, SessionStore};
use metrics_exporter_prometheus::PrometheusHandle;

pub type SharedState = Arc<AppState>;

/// Services shared by every request handler.
pub struct AppState {
    pub sessions: SessionStore,
    pub cluster: Arc<ClusterAgent>,
    pub poll_timeout: Duration,
    metrics: PrometheusHandle,
}

impl AppState {
    pub fn new(
        sessions: SessionStore,
        cluster: Arc<ClusterAgent>,
        poll_timeout: Duration,
        metrics: PrometheusHandle,
    ) -> Self {
        Self {
            sessions,
            cluster,
            poll_timeout,
            metrics,
        }
    }

    pub fn render_metrics(&self) -> String {
        self.metrics.render()
    }
}
