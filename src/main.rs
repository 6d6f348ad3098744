use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use evidence_anchor::attachment::{self, Attachment};
use evidence_anchor::config::AnchorConfig;
use evidence_anchor::crypto::identity::{Identity, LocalIdentity};
use evidence_anchor::crypto::seal::{self, SealingKey};
use evidence_anchor::error::{AnchorError, Result};
use evidence_anchor::pipeline::Anchorer;
use evidence_anchor::record::{Record, RecordId, Status};
use evidence_anchor::server::{self, AppState};
use evidence_anchor::verify::Verifier;

#[derive(Parser)]
#[command(name = "evidence-anchor")]
#[command(about = "Tamper-evident anchoring of records to content-addressed storage and a ledger")]
#[command(version)]
struct Cli {
    /// JSON config file; defaults apply when omitted
    #[arg(long, global = true, env = "ANCHOR_CONFIG")]
    config: Option<PathBuf>,

    /// Use the in-process ledger and storage tier instead of the network
    #[arg(long, global = true)]
    simulate: bool,

    /// Hex private key that signs ledger writes
    #[arg(long, global = true, env = "ANCHOR_PRIVATE_KEY", hide_env_values = true)]
    private_key: Option<String>,

    /// Hex 256-bit key for sealing and opening record fields
    #[arg(long, global = true, env = "ANCHOR_SEALING_KEY", hide_env_values = true)]
    sealing_key: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API
    Serve {
        #[arg(long, env = "ANCHOR_LISTEN", default_value = "127.0.0.1:8080")]
        listen: String,
    },
    /// Anchor a JSON record read from a file
    Submit {
        file: PathBuf,
        /// Record id; generated when omitted
        #[arg(long)]
        id: Option<String>,
        /// Evidence file to upload and reference from the record (repeatable)
        #[arg(long = "attach")]
        attachments: Vec<PathBuf>,
        /// Top-level field to encrypt before anchoring (repeatable)
        #[arg(long = "seal")]
        sealed_fields: Vec<String>,
    },
    /// Decrypt sealed fields of a JSON record read from a file
    Open {
        file: PathBuf,
        /// Field to open (repeatable); every sealed field when omitted
        #[arg(long)]
        field: Vec<String>,
    },
    /// Show a record's status and history
    Status { id: String },
    /// Move a record to a new status
    Advance { id: String, status: Status },
    /// Check a record's payload against its commitment
    Verify { id: String },
    /// Re-query the ledger for a record after a confirmation timeout
    Reconcile { id: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let mut config = match &cli.config {
        Some(path) => AnchorConfig::from_file(path)?,
        None => AnchorConfig::default(),
    };
    if cli.simulate {
        config.storage.simulate = true;
        config.ledger.simulate = true;
    }

    let anchorer = Arc::new(Anchorer::from_config(&config).await?);

    match cli.command {
        Commands::Serve { listen } => {
            let identity = identity(cli.private_key.as_deref(), &config)?;
            let state = AppState::new(anchorer, identity).with_links(&config);
            server::serve(state, &listen).await?;
        }
        Commands::Submit {
            file,
            id,
            attachments,
            sealed_fields,
        } => {
            let identity = identity(cli.private_key.as_deref(), &config)?;
            let json = tokio::fs::read_to_string(&file).await?;
            let mut record = Record::from_json(&json)?;
            let record_id = match id {
                Some(raw) => raw.parse()?,
                None => RecordId::generate(),
            };

            if !sealed_fields.is_empty() {
                let key = sealing_key(cli.sealing_key.as_deref())?;
                seal::seal_fields(&mut record, &key, &sealed_fields)?;
            }

            let mut files = Vec::with_capacity(attachments.len());
            for path in &attachments {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.display().to_string());
                files.push(Attachment::new(name, tokio::fs::read(path).await?));
            }
            let uploaded = anchorer.upload_attachments(&files).await?;
            let refs: Vec<_> = uploaded.into_iter().map(|u| u.reference).collect();
            attachment::attach(&mut record, &refs)?;

            let receipt = anchorer
                .submit_with_id(record_id, &record, identity.as_ref())
                .await?;
            print_json(&receipt)?;
        }
        Commands::Open { file, field } => {
            let key = sealing_key(cli.sealing_key.as_deref())?;
            let json = tokio::fs::read_to_string(&file).await?;
            let record = Record::from_json(&json)?;
            let names: Vec<String> = if field.is_empty() {
                record
                    .fields()
                    .iter()
                    .filter(|(_, v)| seal::is_sealed(v))
                    .map(|(k, _)| k.clone())
                    .collect()
            } else {
                field
            };
            let mut opened = BTreeMap::new();
            for name in names {
                let value = seal::open_field(&record, &key, &name)?;
                opened.insert(name, value);
            }
            print_json(&opened)?;
        }
        Commands::Status { id } => {
            let status = anchorer.status(&id.parse()?).await?;
            print_json(&status)?;
        }
        Commands::Advance { id, status } => {
            let identity = identity(cli.private_key.as_deref(), &config)?;
            let confirmation = anchorer
                .advance(&id.parse()?, status, identity.as_ref())
                .await?;
            print_json(&confirmation)?;
        }
        Commands::Verify { id } => {
            let verifier = Verifier::new(anchorer.storage(), anchorer.ledger());
            let verification = verifier.verify(&id.parse()?).await?;
            print_json(&verification)?;
            if !verification.all_match() {
                return Ok(ExitCode::from(2));
            }
        }
        Commands::Reconcile { id } => {
            let record_id: RecordId = id.parse()?;
            match anchorer.reconcile(&record_id).await? {
                Some(status) => print_json(&status)?,
                None => return Err(AnchorError::UnknownRecordId(record_id)),
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

/// Signing identity for writes. A throwaway key is allowed only when the
/// ledger is simulated.
fn identity(private_key: Option<&str>, config: &AnchorConfig) -> Result<Arc<dyn Identity>> {
    match private_key {
        Some(key) => Ok(Arc::new(LocalIdentity::from_hex(key)?)),
        None if config.ledger.simulate => {
            let identity = LocalIdentity::random();
            warn!(address = %identity.address(), "No private key given, using a throwaway identity");
            Ok(Arc::new(identity))
        }
        None => Err(AnchorError::Authorization(
            "a private key is required (--private-key or ANCHOR_PRIVATE_KEY)".into(),
        )),
    }
}

fn sealing_key(hex_key: Option<&str>) -> Result<SealingKey> {
    match hex_key {
        Some(key) => SealingKey::from_hex(key),
        None => Err(AnchorError::Config(
            "a sealing key is required (--sealing-key or ANCHOR_SEALING_KEY)".into(),
        )),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| AnchorError::Serialization(e.to_string()))?;
    println!("{json}");
    Ok(())
}
