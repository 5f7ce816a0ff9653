pub mod consumer;
pub mod producer;
pub mod queue;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{error, info};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::config::GatewayConfig;
use crate::core::error::RequestError;
use crate::core::status::map_remote_status;
use crate::core::types::{CanonicalStatus, LocalSyncRecord, SyncFilter};
use crate::domain::numeric_request_id;
use crate::enrollment::PickupPoller;
use crate::remote::RemoteAuthority;
use crate::storage::LocalRecordStore;

pub use consumer::{ReconcileReport, Reconciler};
pub use producer::{ProducerOutcome, ProducerReport, produce};
pub use queue::{QueueReader, QueueWriter, bounded};

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub page_size: u32,
    pub filter: SyncFilter,
    pub force_complete_sync: bool,
    pub queue_capacity: usize,
    pub put_timeout: Duration,
}

impl SyncOptions {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            page_size: config.page_size,
            filter: config.sync_filter.clone(),
            force_complete_sync: config.force_complete_sync,
            queue_capacity: config.queue_capacity,
            put_timeout: config.put_timeout(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncReport {
    pub cycle_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub reconcile: ReconcileReport,
    /// Set when the cycle ended because of a fault rather than completion
    /// or cancellation.
    pub fault: Option<String>,
}

/// Starts one producer task and one consumer task and hands back the
/// stream of reconciled records.
///
/// Both tasks share a child of `cancel`; a fault in either cancels the
/// cycle. The returned reader always terminates. Must be called from within
/// a tokio runtime.
pub fn start_cycle(
    client: Arc<dyn RemoteAuthority>,
    store: Arc<dyn LocalRecordStore>,
    options: SyncOptions,
    cancel: &CancellationToken,
) -> (QueueReader<LocalSyncRecord>, JoinHandle<SyncReport>) {
    let cycle_id = Uuid::new_v4();
    let started_at = Utc::now();
    let token = cancel.child_token();
    let (remote_tx, remote_rx) = bounded(options.queue_capacity, options.put_timeout);
    let (record_tx, record_rx) = bounded(options.queue_capacity, options.put_timeout);

    info!(
        "[sync] cycle {cycle_id} starting (page size {}, {} filter clauses)",
        options.page_size,
        options.filter.clauses().len()
    );

    let producer = {
        let client = Arc::clone(&client);
        let token = token.clone();
        let filter = options.filter.clone();
        let page_size = options.page_size;
        tokio::spawn(async move {
            produce(client.as_ref(), &filter, page_size, remote_tx, &token).await
        })
    };

    let reconciler = Reconciler::new(client, store, options.force_complete_sync);
    let handle = tokio::spawn(async move {
        let result = reconciler
            .run(remote_rx, Some(producer), record_tx, &token)
            .await;
        let (reconcile, fault) = match result {
            Ok(report) => {
                let fault = report
                    .producer
                    .as_ref()
                    .filter(|producer| producer.outcome == ProducerOutcome::Interrupted)
                    .and_then(|producer| producer.error.clone());
                (report, fault)
            }
            Err(err) => {
                error!("[sync] cycle {cycle_id} failed: {err}");
                token.cancel();
                (ReconcileReport::default(), Some(err.to_string()))
            }
        };
        info!(
            "[sync] cycle {cycle_id} finished: {} emitted, {} unchanged, {} unavailable",
            reconcile.emitted, reconcile.unchanged, reconcile.unavailable
        );
        SyncReport {
            cycle_id,
            started_at,
            finished_at: Utc::now(),
            reconcile,
            fault,
        }
    });

    (record_rx, handle)
}

/// Refreshes one host record straight from the remote authority.
///
/// Pending and revoked certificates come back without bytes; anything else
/// is collected through the pickup poller.
pub async fn fetch_single_record(
    client: &dyn RemoteAuthority,
    poller: &PickupPoller,
    ca_request_id: &str,
) -> Result<LocalSyncRecord, RequestError> {
    let id = numeric_request_id(ca_request_id)
        .ok_or_else(|| RequestError::InvalidRequestId(ca_request_id.to_string()))?;
    let remote = client.get_certificate(id).await?;
    let status = map_remote_status(&remote.status);
    info!(
        "[sync] {} ({}) retrieved for request {ca_request_id}",
        remote.common_name, remote.status
    );

    if matches!(
        status,
        CanonicalStatus::PendingApproval | CanonicalStatus::Revoked
    ) {
        return Ok(LocalSyncRecord::from_remote(
            ca_request_id.to_string(),
            &remote,
            status,
            None,
        )?);
    }

    let issued = poller.poll(id).await.ok_or(RequestError::DownloadFailed)?;
    Ok(LocalSyncRecord::from_remote(
        ca_request_id.to_string(),
        &remote,
        status,
        Some(issued.der),
    )?)
}
