use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use base64::{Engine, engine::general_purpose::STANDARD};
use clap::{Parser, Subcommand};
use log::{info, warn};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use cm_gateway::core::types::{Disposition, EnrollmentRequest, LocalSyncRecord};
use cm_gateway::{Gateway, GatewayConfig, InMemoryAuthority, SqliteRecordStore};

const DEFAULT_STORE_DIR: &str = "cm-gateway-data";

#[derive(Parser, Debug)]
#[command(name = "cm-gateway", version, about = "Certificate Manager sync and enrollment gateway")]
struct Cli {
    #[arg(long, global = true, default_value = "cm-gateway.json", help = "Connection configuration (JSON)")]
    config: PathBuf,
    #[arg(long, global = true, default_value = DEFAULT_STORE_DIR, help = "Directory holding the local record store")]
    store: PathBuf,
    #[arg(long, global = true, help = "Serve requests from a JSON fixture instead of the live API")]
    sandbox: Option<PathBuf>,
    #[arg(long, global = true, help = "Output machine-readable JSON")]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one synchronization cycle into the local store.
    Sync {
        #[arg(long, default_value_t = false)]
        full: bool,
    },
    /// Submit an enrollment described by a JSON request file.
    Enroll {
        request: PathBuf,
        #[arg(long, help = "Write the issued certificate here as PEM")]
        out: Option<PathBuf>,
    },
    Revoke {
        ca_request_id: String,
        #[arg(long, default_value_t = 0)]
        reason: u32,
    },
    /// Refresh a single record straight from the remote API.
    Record {
        ca_request_id: String,
    },
    Validate {
        #[arg(long)]
        product: Option<String>,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let mut config = GatewayConfig::load(&cli.config)?;
    if let Commands::Sync { full: true } = cli.command {
        config.force_complete_sync = true;
    }
    let gateway = connect(config, cli.sandbox.as_deref())?;

    match &cli.command {
        Commands::Sync { .. } => run_sync(&gateway, &cli.store, cli.json),
        Commands::Enroll { request, out } => run_enroll(&gateway, request, out.as_deref(), cli.json),
        Commands::Revoke {
            ca_request_id,
            reason,
        } => {
            let status = gateway.revoke(ca_request_id, *reason)?;
            if cli.json {
                println!("{}", json!({ "caRequestId": ca_request_id, "status": status }));
            } else {
                println!("{ca_request_id}: {status}");
            }
            Ok(())
        }
        Commands::Record { ca_request_id } => {
            let record = gateway.get_single_record(ca_request_id)?;
            SqliteRecordStore::initialize_with_path(&cli.store)?.apply(&record)?;
            print_record(&record, cli.json);
            Ok(())
        }
        Commands::Validate { product } => {
            gateway.ping()?;
            if let Some(product) = product {
                let profile = gateway.validate_product(product)?;
                println!("product {product} -> {} ({:?} days)", profile.name, profile.terms);
            }
            println!("configuration {} is valid", cli.config.display());
            Ok(())
        }
    }
}

fn connect(config: GatewayConfig, sandbox: Option<&Path>) -> Result<Gateway> {
    match sandbox {
        Some(fixture) => {
            info!("[cli] using sandbox fixture {}", fixture.display());
            let authority = InMemoryAuthority::from_fixture(fixture)?;
            Gateway::with_client(config, Arc::new(authority))
        }
        None => Gateway::initialize(config),
    }
}

fn run_sync(gateway: &Gateway, store_dir: &Path, as_json: bool) -> Result<()> {
    let store = SqliteRecordStore::initialize_with_path(store_dir)?;
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let report = gateway.synchronize(Arc::new(store.clone()), &cancel, |record| {
        store.apply(&record)?;
        if !as_json {
            println!("{} {}", record.ca_request_id, record.status);
        }
        Ok(())
    })?;

    if as_json {
        println!(
            "{}",
            json!({
                "cycleId": report.cycle_id,
                "received": report.reconcile.received,
                "emitted": report.reconcile.emitted,
                "unchanged": report.reconcile.unchanged,
                "unavailable": report.reconcile.unavailable,
                "failed": report.reconcile.failed,
                "cancelled": report.reconcile.cancelled,
            })
        );
    } else {
        println!(
            "cycle {}: {} received, {} synchronized, {} unchanged, {} unavailable, {} failed{}",
            report.cycle_id,
            report.reconcile.received,
            report.reconcile.emitted,
            report.reconcile.unchanged,
            report.reconcile.unavailable,
            report.reconcile.failed,
            if report.reconcile.cancelled { " (cancelled)" } else { "" }
        );
    }
    Ok(())
}

fn run_enroll(gateway: &Gateway, request: &Path, out: Option<&Path>, as_json: bool) -> Result<()> {
    let raw = fs::read_to_string(request)
        .with_context(|| format!("failed to read enrollment request {}", request.display()))?;
    let request: EnrollmentRequest = serde_json::from_str(&raw)
        .with_context(|| format!("invalid enrollment request {}", request.display()))?;

    let outcome = gateway.enroll(&request);

    if let (Some(path), Some(der)) = (out, outcome.certificate.as_ref()) {
        let encoded = pem::encode(&pem::Pem::new("CERTIFICATE", der.clone()));
        fs::write(path, encoded)
            .with_context(|| format!("failed to write certificate to {}", path.display()))?;
        info!("[cli] certificate written to {}", path.display());
    }
    if as_json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        println!(
            "{} {}: {}",
            outcome.ca_request_id.as_deref().unwrap_or("-"),
            outcome.status(),
            outcome.message
        );
    }
    if outcome.disposition == Disposition::Failed {
        bail!("enrollment failed: {}", outcome.message);
    }
    Ok(())
}

fn print_record(record: &LocalSyncRecord, as_json: bool) {
    if as_json {
        let certificate = record.certificate.as_ref().map(|der| STANDARD.encode(der));
        println!(
            "{}",
            json!({
                "caRequestId": record.ca_request_id,
                "productId": record.product_id,
                "status": record.status,
                "submissionDate": record.submission_date,
                "resolutionDate": record.resolution_date,
                "revocationReason": record.legacy_revocation_code(),
                "revocationDate": record.revocation_date,
                "certificate": certificate,
            })
        );
    } else {
        println!(
            "{} {} (product {}, {} certificate bytes)",
            record.ca_request_id,
            record.status,
            record.product_id,
            record.certificate.as_ref().map_or(0, Vec::len)
        );
    }
}

fn cancel_on_ctrl_c(cancel: CancellationToken) {
    std::thread::spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(runtime) => runtime,
            Err(err) => {
                warn!("[cli] ctrl-c handler unavailable: {err}");
                return;
            }
        };
        runtime.block_on(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("[cli] interrupt received; cancelling synchronization");
                cancel.cancel();
            }
        });
    });
}
