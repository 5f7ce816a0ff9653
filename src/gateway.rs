use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use log::{info, warn};
use tokio::runtime::{Builder, Runtime};
use tokio_util::sync::CancellationToken;

use crate::core::config::GatewayConfig;
use crate::core::error::{ConfigError, RequestError};
use crate::core::types::{
    CanonicalStatus, EnrollmentOutcome, EnrollmentRequest, LocalSyncRecord, Profile,
};
use crate::enrollment::{self, Enroller, PickupPoller, PickupPolicy};
use crate::remote::{RemoteAuthority, ScmApiClient};
use crate::storage::LocalRecordStore;
use crate::sync::{self, SyncOptions, SyncReport};

/// Blocking entry point for hosts that are not async themselves.
///
/// Owns its own runtime, so none of these methods may be called from inside
/// another tokio runtime.
pub struct Gateway {
    runtime: Runtime,
    config: GatewayConfig,
    client: Arc<dyn RemoteAuthority>,
    enroller: Enroller,
}

impl Gateway {
    /// Validates the configuration and connects to the live API.
    pub fn initialize(config: GatewayConfig) -> Result<Self> {
        config.validate()?;
        let client: Arc<dyn RemoteAuthority> = Arc::new(ScmApiClient::new(&config)?);
        Self::with_client(config, client)
    }

    /// Builds a gateway around any remote authority, e.g. the sandbox one.
    pub fn with_client(mut config: GatewayConfig, client: Arc<dyn RemoteAuthority>) -> Result<Self> {
        config.normalize();
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .thread_name("cm-gateway")
            .build()
            .context("failed to start gateway runtime")?;
        let poller = PickupPoller::new(Arc::clone(&client), PickupPolicy::from_config(&config));
        let enroller = Enroller::new(
            Arc::clone(&client),
            poller,
            config.external_requester_field().map(str::to_string),
        );
        info!(
            "[gateway] initialized for {} (page size {}, pickup retries {})",
            config.api_endpoint, config.page_size, config.pickup_retries
        );
        Ok(Self {
            runtime,
            config,
            client,
            enroller,
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Runs one synchronization cycle, handing each reconciled record to
    /// `sink` in order.
    ///
    /// A sink error cancels the cycle and is returned once the background
    /// tasks have stopped. Cancelling `cancel` ends the cycle early without
    /// an error.
    pub fn synchronize<F>(
        &self,
        store: Arc<dyn LocalRecordStore>,
        cancel: &CancellationToken,
        mut sink: F,
    ) -> Result<SyncReport>
    where
        F: FnMut(LocalSyncRecord) -> Result<()>,
    {
        let options = SyncOptions::from_config(&self.config);
        let cycle_cancel = cancel.child_token();

        self.runtime.block_on(async {
            let (mut records, handle) =
                sync::start_cycle(Arc::clone(&self.client), store, options, &cycle_cancel);

            let mut sink_error = None;
            while let Some(record) = records.next().await {
                if let Err(err) = sink(record) {
                    warn!("[gateway] host rejected record; cancelling cycle: {err:#}");
                    cycle_cancel.cancel();
                    sink_error = Some(err);
                    break;
                }
            }
            drop(records);

            let report = handle
                .await
                .map_err(|err| anyhow!("synchronization task failed: {err}"))?;
            if let Some(err) = sink_error {
                return Err(err.context("host failed to accept synchronized record"));
            }
            if let Some(fault) = &report.fault {
                bail!("synchronization cycle {} failed: {fault}", report.cycle_id);
            }
            Ok(report)
        })
    }

    pub fn enroll(&self, request: &EnrollmentRequest) -> EnrollmentOutcome {
        self.runtime.block_on(self.enroller.enroll(request))
    }

    pub fn revoke(&self, ca_request_id: &str, reason_code: u32) -> Result<CanonicalStatus, RequestError> {
        self.runtime
            .block_on(enrollment::revoke(self.client.as_ref(), ca_request_id, reason_code))
    }

    pub fn get_single_record(&self, ca_request_id: &str) -> Result<LocalSyncRecord, RequestError> {
        let poller = PickupPoller::new(
            Arc::clone(&self.client),
            PickupPolicy::from_config(&self.config),
        );
        self.runtime.block_on(sync::fetch_single_record(
            self.client.as_ref(),
            &poller,
            ca_request_id,
        ))
    }

    /// Checks that a host product maps onto an existing SSL profile.
    pub fn validate_product(&self, product_id: &str) -> Result<Profile> {
        let id: i64 = product_id
            .trim()
            .parse()
            .with_context(|| format!("Invalid SSL Profile ID {product_id}"))?;
        let profiles = self
            .runtime
            .block_on(self.client.list_ssl_profiles(None))
            .context("failed to list SSL profiles")?;
        profiles
            .into_iter()
            .find(|profile| profile.id == id)
            .ok_or_else(|| anyhow!("Unable to find SSL Profile with ID {id}"))
    }

    /// Checks a connection section before a gateway is built from it.
    pub fn validate_connection(config: &GatewayConfig) -> Result<(), ConfigError> {
        config.validate()
    }

    pub fn ping(&self) -> Result<()> {
        info!("[gateway] ping");
        Ok(())
    }
}
