use std::path::PathBuf;
use std::sync::atomic::AtomicI64;
use std::sync::Arc;

use url::Url;

use crate::tqueue::TQueue;
use crate::upstream::UpstreamConnector;
use crate::webhook_db::WebhookDb;

/// Process-wide collaborators and settings handed to every actor.
pub struct SharedParams {
    pub tqueue: Arc<TQueue>,
    pub webhook_db: Arc<WebhookDb>,
    pub connector: Arc<dyn UpstreamConnector>,

    pub local_mode: bool,
    pub working_directory: PathBuf,
    pub temp_directory: PathBuf,

    pub default_max_webhook_connections: i32,
    pub max_webhook_connections_limit: i32,
    pub max_update_body_size: usize,
    pub webhook_proxy: Option<Url>,

    /// In-flight request gauge for the stats endpoint; shared with every
    /// response promise.
    pub query_count: Arc<AtomicI64>,
    pub start_time: f64,
}

impl SharedParams {
    #[cfg(test)]
    pub fn for_tests(connector: Arc<dyn UpstreamConnector>) -> Arc<Self> {
        Arc::new(Self {
            tqueue: Arc::new(TQueue::new(None)),
            webhook_db: Arc::new(crate::webhook_db::WebhookDb::in_memory()),
            connector,
            local_mode: true,
            working_directory: std::env::temp_dir(),
            temp_directory: std::env::temp_dir(),
            default_max_webhook_connections: 40,
            max_webhook_connections_limit: 100_000,
            max_update_body_size: 1 << 24,
            webhook_proxy: None,
            query_count: Arc::new(AtomicI64::new(0)),
            start_time: crate::clock::monotonic_now(),
        })
    }
}
