use log::{debug, error, info, warn};
use tokio_util::sync::CancellationToken;

use crate::core::error::QueueError;
use crate::core::types::{FilterClause, RemoteCertificate, SyncFilter};
use crate::remote::RemoteAuthority;

use super::queue::QueueWriter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerOutcome {
    /// Every sweep reached a short page.
    Completed,
    Cancelled,
    /// A transport or listing failure stopped all remaining sweeps.
    Interrupted,
}

#[derive(Debug, Clone)]
pub struct ProducerReport {
    pub sweeps: usize,
    pub pages: usize,
    pub emitted: usize,
    pub skipped: usize,
    pub blocked_puts: u64,
    pub outcome: ProducerOutcome,
    pub error: Option<String>,
}

impl Default for ProducerReport {
    fn default() -> Self {
        Self {
            sweeps: 0,
            pages: 0,
            emitted: 0,
            skipped: 0,
            blocked_puts: 0,
            outcome: ProducerOutcome::Completed,
            error: None,
        }
    }
}

enum SweepEnd {
    Exhausted,
    Cancelled,
    Aborted(String),
}

/// Pages through the remote listing and feeds full certificate details into
/// `sink`.
///
/// An empty filter means one unfiltered sweep; otherwise each
/// (dimension, value) pair gets its own sweep starting at position 0. The
/// sink is completed on every exit path and failures are reported rather
/// than returned.
///
/// # Arguments
/// * `client` - Remote authority serving the paged listing and detail reads
/// * `filter` - Sync filter; each configured value becomes one sweep
/// * `page_size` - Listing window size, clamped to at least 1
/// * `sink` - Writer half of the bounded queue feeding the reconciler
/// * `cancel` - Token checked between pages and while a put is blocked
///
/// # Returns
/// A `ProducerReport` with sweep, page and emit counters, and an outcome of
/// `Exhausted`, `Cancelled` or `Aborted` carrying the failure text.
pub async fn produce(
    client: &dyn RemoteAuthority,
    filter: &SyncFilter,
    page_size: u32,
    mut sink: QueueWriter<RemoteCertificate>,
    cancel: &CancellationToken,
) -> ProducerReport {
    let page_size = page_size.max(1);
    let clauses = filter.clauses();
    let sweeps: Vec<Option<&FilterClause>> = if clauses.is_empty() {
        vec![None]
    } else {
        clauses.iter().map(Some).collect()
    };

    let mut report = ProducerReport::default();
    for clause in sweeps {
        report.sweeps += 1;
        match sweep(client, clause, page_size, &mut sink, cancel, &mut report).await {
            SweepEnd::Exhausted => {}
            SweepEnd::Cancelled => {
                info!("[sync-producer] cancellation requested; stopping");
                report.outcome = ProducerOutcome::Cancelled;
                break;
            }
            SweepEnd::Aborted(reason) => {
                error!("[sync-producer] sync interrupted: {reason}");
                report.outcome = ProducerOutcome::Interrupted;
                report.error = Some(reason);
                break;
            }
        }
    }

    report.blocked_puts = sink.blocked_puts();
    sink.complete();
    info!(
        "[sync-producer] finished: {} sweeps, {} pages, {} queued, {} skipped",
        report.sweeps, report.pages, report.emitted, report.skipped
    );
    report
}

async fn sweep(
    client: &dyn RemoteAuthority,
    clause: Option<&FilterClause>,
    page_size: u32,
    sink: &mut QueueWriter<RemoteCertificate>,
    cancel: &CancellationToken,
    report: &mut ProducerReport,
) -> SweepEnd {
    let label = clause.map(ToString::to_string).unwrap_or_else(|| "unfiltered".into());
    let mut position: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            return SweepEnd::Cancelled;
        }
        info!("[sync-producer] request certificates at position {position} with page size {page_size} ({label})");
        let listed = tokio::select! {
            biased;
            _ = cancel.cancelled() => return SweepEnd::Cancelled,
            listed = client.list_certificates(position, page_size, clause) => listed,
        };
        let page = match listed {
            Ok(page) => page,
            Err(err) => return SweepEnd::Aborted(format!("listing failed: {err}")),
        };
        report.pages += 1;
        let count = page.len();
        debug!("[sync-producer] found {count} certificates to process");

        for entry in page {
            let detail = tokio::select! {
                biased;
                _ = cancel.cancelled() => return SweepEnd::Cancelled,
                detail = client.get_certificate(entry.id) => detail,
            };
            let detail = match detail {
                Ok(detail) => detail,
                Err(err) if err.is_transport() => {
                    return SweepEnd::Aborted(format!("detail fetch for {entry} failed: {err}"));
                }
                Err(err) => {
                    warn!("[sync-producer] error requesting certificate details; skipping {entry}: {err}");
                    report.skipped += 1;
                    continue;
                }
            };
            match sink.put(detail, cancel).await {
                Ok(()) => report.emitted += 1,
                Err(QueueError::Cancelled) => return SweepEnd::Cancelled,
                Err(QueueError::Closed) => {
                    return SweepEnd::Aborted("consumer closed the queue".into());
                }
            }
        }

        if count < page_size as usize {
            return SweepEnd::Exhausted;
        }
        position = position.saturating_add(count as u32);
    }
}
