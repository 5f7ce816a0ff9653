use std::sync::Arc;

use log::{debug, error, info, trace, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::error::{QueueError, SyncError};
use crate::core::status::map_remote_status;
use crate::core::types::{LocalRecord, LocalSyncRecord, RemoteCertificate};
use crate::domain::numeric_request_id;
use crate::remote::RemoteAuthority;
use crate::storage::LocalRecordStore;

use super::producer::ProducerReport;
use super::queue::{QueueReader, QueueWriter};

#[derive(Debug, Clone, Default)]
pub struct ReconcileReport {
    pub received: usize,
    pub emitted: usize,
    /// Already known locally with the same status.
    pub unchanged: usize,
    /// No bytes, serial or common name available yet.
    pub unavailable: usize,
    pub failed: usize,
    pub cancelled: bool,
    pub producer: Option<ProducerReport>,
}

enum Decision {
    Emit(LocalSyncRecord),
    Unchanged,
    Unavailable,
}

/// Turns remote certificates into host records, skipping what the host
/// already has.
pub struct Reconciler {
    client: Arc<dyn RemoteAuthority>,
    store: Arc<dyn LocalRecordStore>,
    force_complete_sync: bool,
}

impl Reconciler {
    pub fn new(
        client: Arc<dyn RemoteAuthority>,
        store: Arc<dyn LocalRecordStore>,
        force_complete_sync: bool,
    ) -> Self {
        Self {
            client,
            store,
            force_complete_sync,
        }
    }

    /// Drains `source` until the producer completes it, pushing reconciled
    /// records into `sink`.
    ///
    /// `sink` is completed exactly once on every path. A panicked producer
    /// task surfaces as [`SyncError::ProducerFault`]; cancellation is not an
    /// error.
    ///
    /// # Arguments
    /// * `source` - Reader half of the producer queue
    /// * `producer` - Handle of the producer task, joined once `source` ends
    /// * `sink` - Writer for records that changed since the last cycle
    /// * `cancel` - Cycle token; cancelling stops the drain early
    ///
    /// # Returns
    /// A `ReconcileReport` counting received, emitted, unchanged, unavailable
    /// and failed certificates.
    ///
    /// # Errors
    /// Returns an error if the producer task panicked or a local record
    /// lookup failed.
    pub async fn run(
        &self,
        mut source: QueueReader<RemoteCertificate>,
        mut producer: Option<JoinHandle<ProducerReport>>,
        mut sink: QueueWriter<LocalSyncRecord>,
        cancel: &CancellationToken,
    ) -> Result<ReconcileReport, SyncError> {
        let mut report = ReconcileReport::default();

        let outcome = loop {
            if cancel.is_cancelled() {
                warn!("[sync-consumer] task was cancelled; stopping synchronize");
                report.cancelled = true;
                break Ok(());
            }
            if producer.as_ref().is_some_and(JoinHandle::is_finished) {
                if let Some(handle) = producer.take() {
                    match handle.await {
                        Ok(producer_report) => report.producer = Some(producer_report),
                        Err(err) => break Err(SyncError::ProducerFault(err.to_string())),
                    }
                }
            }

            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => continue,
                next = source.next() => next,
            };
            let Some(remote) = next else {
                break Ok(());
            };
            report.received += 1;

            let record = match self.reconcile_one(&remote).await {
                Ok(Decision::Emit(record)) => record,
                Ok(Decision::Unchanged) => {
                    report.unchanged += 1;
                    continue;
                }
                Ok(Decision::Unavailable) => {
                    report.unavailable += 1;
                    continue;
                }
                Err(err) => {
                    warn!("[sync-consumer] skipping {remote}: {err}");
                    report.failed += 1;
                    continue;
                }
            };

            let request_id = record.ca_request_id.clone();
            match sink.put(record, cancel).await {
                Ok(()) => {
                    report.emitted += 1;
                    debug!(
                        "[sync-consumer] added {} (ID: {request_id}) to queue for synchronization",
                        remote.common_name
                    );
                }
                Err(QueueError::Cancelled) => {
                    report.cancelled = true;
                    break Ok(());
                }
                Err(QueueError::Closed) => {
                    warn!("[sync-consumer] host stopped reading; ending cycle");
                    break Ok(());
                }
            }
        };

        sink.complete();
        drop(source);

        if let Err(err) = outcome {
            error!("[sync-consumer] synchronize task failed: {err}");
            return Err(err);
        }
        if let Some(handle) = producer.take() {
            match handle.await {
                Ok(producer_report) => report.producer = Some(producer_report),
                Err(err) => {
                    error!("[sync-consumer] producer task failed: {err}");
                    return Err(SyncError::ProducerFault(err.to_string()));
                }
            }
        }
        info!(
            "[sync-consumer] adding certificates to queue is complete: {} received, {} emitted, {} unchanged",
            report.received, report.emitted, report.unchanged
        );
        Ok(report)
    }

    async fn reconcile_one(&self, remote: &RemoteCertificate) -> Result<Decision, SyncError> {
        let status = map_remote_status(&remote.status);
        let serial = remote.serial_number.trim().to_string();
        if serial.is_empty() {
            debug!(
                "[sync-consumer] certificate data unavailable for {} (ID: {}); skipping",
                remote.common_name, remote.id
            );
            return Ok(Decision::Unavailable);
        }

        let (request_id, certificate) = match self.lookup(&serial).await? {
            Some(local) => {
                if local.status == status && !self.force_complete_sync {
                    trace!(
                        "[sync-consumer] certificate {} (Id: {}) already synced; skipping",
                        remote.common_name, remote.id
                    );
                    return Ok(Decision::Unchanged);
                }
                trace!(
                    "[sync-consumer] certificate {} status {}{}; syncing",
                    remote.common_name,
                    if local.status == status { "not changed" } else { "changed" },
                    if self.force_complete_sync { " (complete sync forced)" } else { "" }
                );
                let request_id = numeric_request_id(&local.ca_request_id).unwrap_or(remote.id);
                (request_id, local.certificate)
            }
            None => {
                trace!(
                    "[sync-consumer] attempt to pickup certificate {} (ID: {})",
                    remote.common_name, remote.id
                );
                let issued = self.client.pickup_certificate(remote.id).await?;
                (remote.id, issued.map(|issued| issued.der))
            }
        };

        let has_bytes = certificate.as_ref().is_some_and(|bytes| !bytes.is_empty());
        if remote.common_name.trim().is_empty() || !has_bytes {
            debug!(
                "[sync-consumer] certificate data unavailable for {} (ID: {}); skipping",
                remote.common_name, remote.id
            );
            return Ok(Decision::Unavailable);
        }

        let record =
            LocalSyncRecord::from_remote(request_id.to_string(), remote, status, certificate)?;
        Ok(Decision::Emit(record))
    }

    async fn lookup(&self, serial: &str) -> Result<Option<LocalRecord>, SyncError> {
        let store = Arc::clone(&self.store);
        let serial = serial.to_string();
        tokio::task::spawn_blocking(move || store.lookup(&serial))
            .await
            .map_err(|err| SyncError::Store(err.to_string()))?
            .map_err(|err| SyncError::Store(format!("{err:#}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{CanonicalStatus, IssuedCertificate, Profile};
    use crate::remote::InMemoryAuthority;
    use crate::sync::queue::bounded;
    use anyhow::Result;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct MapStore {
        records: Mutex<HashMap<String, LocalRecord>>,
    }

    impl MapStore {
        fn insert(&self, record: LocalRecord) {
            self.records
                .lock()
                .expect("lock")
                .insert(record.serial_number.clone(), record);
        }
    }

    impl LocalRecordStore for MapStore {
        fn lookup(&self, serial_hex: &str) -> Result<Option<LocalRecord>> {
            Ok(self.records.lock().expect("lock").get(serial_hex).cloned())
        }
    }

    fn remote(id: i64, serial: &str, status: &str) -> RemoteCertificate {
        RemoteCertificate {
            id,
            common_name: "ccmqa.com".into(),
            serial_number: serial.into(),
            status: status.into(),
            cert_type: Some(Profile {
                id: 2846,
                ..Profile::default()
            }),
            ..RemoteCertificate::default()
        }
    }

    fn issued(serial: &str) -> IssuedCertificate {
        IssuedCertificate {
            der: vec![0x30, 0x82, 0x01],
            subject: "CN=ccmqa.com".into(),
            serial_hex: serial.into(),
        }
    }

    async fn reconcile(
        reconciler: &Reconciler,
        inputs: Vec<RemoteCertificate>,
    ) -> (Result<ReconcileReport, SyncError>, Vec<LocalSyncRecord>) {
        let cancel = CancellationToken::new();
        let (mut in_tx, in_rx) = bounded(16, Duration::from_millis(10));
        for input in inputs {
            in_tx.put(input, &cancel).await.expect("seed");
        }
        in_tx.complete();
        let (out_tx, out_rx) = bounded(16, Duration::from_millis(10));
        let result = reconciler.run(in_rx, None, out_tx, &cancel).await;
        (result, out_rx.collect().await)
    }

    #[tokio::test]
    async fn unissued_certificate_emits_nothing_and_skips_pickup() {
        let authority = Arc::new(InMemoryAuthority::new());
        let store = Arc::new(MapStore::default());
        let reconciler = Reconciler::new(authority.clone(), store, false);

        let (result, emitted) = reconcile(&reconciler, vec![remote(139, "", "Requested")]).await;
        let report = result.expect("report");

        assert!(emitted.is_empty());
        assert_eq!(report.unavailable, 1);
        assert!(authority.journal().pickups.is_empty());
    }

    #[tokio::test]
    async fn new_certificate_is_picked_up_and_emitted() {
        let authority = Arc::new(InMemoryAuthority::new());
        authority.set_issued(139, issued("0A1B"));
        let store = Arc::new(MapStore::default());
        let reconciler = Reconciler::new(authority.clone(), store, false);

        let (result, emitted) = reconcile(&reconciler, vec![remote(139, "0A1B", "Issued")]).await;
        result.expect("report");

        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].ca_request_id, "139");
        assert_eq!(emitted[0].product_id, "2846");
        assert_eq!(emitted[0].status, CanonicalStatus::Issued);
        assert!(emitted[0].revocation_reason.is_none());
        assert_eq!(authority.journal().pickups, vec![139]);
    }

    #[tokio::test]
    async fn missing_pickup_bytes_skip_record() {
        let authority = Arc::new(InMemoryAuthority::new());
        let store = Arc::new(MapStore::default());
        let reconciler = Reconciler::new(authority, store, false);

        let (result, emitted) = reconcile(&reconciler, vec![remote(5, "0A1B", "Issued")]).await;
        assert!(emitted.is_empty());
        assert_eq!(result.expect("report").unavailable, 1);
    }

    #[tokio::test]
    async fn unchanged_record_is_skipped_unless_forced() {
        let authority = Arc::new(InMemoryAuthority::new());
        let store = Arc::new(MapStore::default());
        store.insert(LocalRecord {
            ca_request_id: "139".into(),
            serial_number: "0A1B".into(),
            status: CanonicalStatus::Issued,
            certificate: Some(vec![0x30]),
        });

        let reconciler = Reconciler::new(authority.clone(), store.clone(), false);
        let (result, emitted) = reconcile(&reconciler, vec![remote(139, "0A1B", "Issued")]).await;
        assert!(emitted.is_empty());
        assert_eq!(result.expect("report").unchanged, 1);

        let forced = Reconciler::new(authority.clone(), store, true);
        let (_, emitted) = reconcile(&forced, vec![remote(139, "0A1B", "Issued")]).await;
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].certificate, Some(vec![0x30]));
        assert!(authority.journal().pickups.is_empty());
    }

    #[tokio::test]
    async fn status_change_reuses_local_bytes_and_composite_id() {
        let authority = Arc::new(InMemoryAuthority::new());
        let store = Arc::new(MapStore::default());
        store.insert(LocalRecord {
            ca_request_id: "139-2".into(),
            serial_number: "0A1B".into(),
            status: CanonicalStatus::Issued,
            certificate: Some(vec![0x30, 0x01]),
        });
        let reconciler = Reconciler::new(authority, store, false);

        let (_, emitted) = reconcile(&reconciler, vec![remote(999, "0A1B", "Revoked")]).await;

        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].ca_request_id, "139");
        assert_eq!(emitted[0].status, CanonicalStatus::Revoked);
        assert_eq!(emitted[0].legacy_revocation_code(), 0);
    }

    #[tokio::test]
    async fn unparsable_local_id_falls_back_to_remote_id() {
        let authority = Arc::new(InMemoryAuthority::new());
        let store = Arc::new(MapStore::default());
        store.insert(LocalRecord {
            ca_request_id: "legacy".into(),
            serial_number: "0A1B".into(),
            status: CanonicalStatus::PendingApproval,
            certificate: Some(vec![0x30]),
        });
        let reconciler = Reconciler::new(authority, store, false);

        let (_, emitted) = reconcile(&reconciler, vec![remote(42, "0A1B", "Issued")]).await;
        assert_eq!(emitted[0].ca_request_id, "42");
    }

    #[tokio::test]
    async fn second_pass_over_unchanged_data_emits_nothing() {
        let authority = Arc::new(InMemoryAuthority::new());
        authority.set_issued(1, issued("01"));
        authority.set_issued(2, issued("02"));
        let store = Arc::new(MapStore::default());
        let reconciler = Reconciler::new(authority, store.clone(), false);
        let inputs = vec![remote(1, "01", "Issued"), remote(2, "02", "Issued")];

        let (_, first) = reconcile(&reconciler, inputs.clone()).await;
        assert_eq!(first.len(), 2);
        for (record, input) in first.iter().zip(&inputs) {
            store.insert(LocalRecord {
                ca_request_id: record.ca_request_id.clone(),
                serial_number: input.serial_number.clone(),
                status: record.status,
                certificate: record.certificate.clone(),
            });
        }

        let (_, second) = reconcile(&reconciler, inputs).await;
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn producer_panic_is_reported_as_fault() {
        let authority = Arc::new(InMemoryAuthority::new());
        let reconciler = Reconciler::new(authority, Arc::new(MapStore::default()), false);
        let cancel = CancellationToken::new();
        let (in_tx, in_rx) = bounded::<RemoteCertificate>(4, Duration::from_millis(10));
        let producer: JoinHandle<ProducerReport> = tokio::spawn(async move {
            let _keep_open = in_tx;
            panic!("listing exploded");
        });
        let (out_tx, out_rx) = bounded(4, Duration::from_millis(10));

        let result = reconciler.run(in_rx, Some(producer), out_tx, &cancel).await;

        assert!(matches!(result, Err(SyncError::ProducerFault(_))));
        assert!(out_rx.collect().await.is_empty());
    }

    #[tokio::test]
    async fn cancellation_ends_without_error() {
        let authority = Arc::new(InMemoryAuthority::new());
        let reconciler = Reconciler::new(authority, Arc::new(MapStore::default()), false);
        let cancel = CancellationToken::new();
        let (_in_tx, in_rx) = bounded::<RemoteCertificate>(4, Duration::from_millis(10));
        let (out_tx, out_rx) = bounded(4, Duration::from_millis(10));

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let report = reconciler
            .run(in_rx, None, out_tx, &cancel)
            .await
            .expect("cancel is not an error");
        assert!(report.cancelled);
        assert!(out_rx.collect().await.is_empty());
    }
}
