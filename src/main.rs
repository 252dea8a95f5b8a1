//! pki-acme-server - ACME (RFC 8555) certificate issuance server
//!
//! Serves one ACME directory per CA profile and validates HTTP-01 and DNS-01
//! challenges on a background worker pool.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use pki_acme_api::{ApiServer, ApiServerConfig};
use pki_acme_core::{
    spawn_nonce_sweeper, AcmeConfig, AcmeService, AcmeServiceParts, ChallengeValidator,
    DbNonceStore, HickoryDnsResolver, Http01Client, LocalCaIssuer, StaticProfileStore,
    TracingAuditLog, UrlBuilder, WorkerPool, WorkerPoolConfig,
};

const VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("GIT_HASH"), ")");

/// ACME server for issuing certificates from a local CA
#[derive(Parser, Debug)]
#[command(name = "pki-acme-server")]
#[command(about = "ACME (RFC 8555) server backed by a local certificate authority")]
#[command(version = VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    server: ServerArgs,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a CA certificate and key for --ca-cert / --ca-key
    #[command(long_about = r#"
Generate a self-signed issuing CA and write it as PEM.

EXAMPLES:
  pki-acme-server generate-ca --cert ca.pem --key ca-key.pem
  pki-acme-server --ca-cert ca.pem --ca-key ca-key.pem
    "#)]
    GenerateCa {
        /// Common name of the CA certificate
        #[arg(long, default_value = "PKI ACME Local CA")]
        common_name: String,

        /// Output path for the CA certificate
        #[arg(long, default_value = "ca.pem")]
        cert: PathBuf,

        /// Output path for the CA private key
        #[arg(long, default_value = "ca-key.pem")]
        key: PathBuf,
    },
}

#[derive(Args, Debug)]
struct ServerArgs {
    /// Address to bind the ACME HTTP server
    #[arg(long, env = "ACME_BIND_ADDR", default_value = "127.0.0.1:8080")]
    bind_addr: SocketAddr,

    /// Externally visible base URL used in every ACME URL
    #[arg(long, env = "ACME_BASE_URL", default_value = "http://127.0.0.1:8080")]
    base_url: String,

    /// Database URL (sqlite://path?mode=rwc, postgres://...)
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite://acme.db?mode=rwc")]
    database_url: String,

    /// YAML config file with profiles and validation settings
    #[arg(long, env = "ACME_CONFIG")]
    config: Option<PathBuf>,

    /// CA certificate PEM; an ephemeral CA is generated when omitted
    #[arg(long, env = "ACME_CA_CERT", requires = "ca_key")]
    ca_cert: Option<PathBuf>,

    /// CA private key PEM
    #[arg(long, env = "ACME_CA_KEY", requires = "ca_cert")]
    ca_key: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, env = "ACME_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Allow `localhost` identifiers and private HTTP-01 targets (development only)
    #[arg(long)]
    dev_mode: bool,

    /// Answer CORS preflight requests
    #[arg(long)]
    enable_cors: bool,
}

fn setup_logging(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

fn generate_ca(common_name: &str, cert: &PathBuf, key: &PathBuf) -> Result<()> {
    let issuer = LocalCaIssuer::generate(common_name).context("Failed to generate CA")?;
    std::fs::write(cert, issuer.ca_pem())
        .with_context(|| format!("Failed to write {}", cert.display()))?;
    std::fs::write(key, issuer.ca_key_pem())
        .with_context(|| format!("Failed to write {}", key.display()))?;
    println!("CA certificate: {}", cert.display());
    println!("CA private key: {}", key.display());
    Ok(())
}

fn load_issuer(args: &ServerArgs) -> Result<LocalCaIssuer> {
    match (&args.ca_cert, &args.ca_key) {
        (Some(cert), Some(key)) => {
            let cert_pem = std::fs::read_to_string(cert)
                .with_context(|| format!("Failed to read CA certificate {}", cert.display()))?;
            let key_pem = std::fs::read_to_string(key)
                .with_context(|| format!("Failed to read CA key {}", key.display()))?;
            let issuer = LocalCaIssuer::from_pem(&cert_pem, &key_pem).context("Invalid CA material")?;
            info!("Loaded issuing CA from {}", cert.display());
            Ok(issuer)
        }
        _ => {
            warn!("No CA configured; certificates will chain to an ephemeral CA");
            LocalCaIssuer::generate("PKI ACME Ephemeral CA").context("Failed to generate CA")
        }
    }
}

async fn run_server(args: ServerArgs) -> Result<()> {
    let config = match &args.config {
        Some(path) => AcmeConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => AcmeConfig::default(),
    };

    info!("Connecting to database");
    let db = pki_acme_db::connect(&args.database_url)
        .await
        .context("Failed to connect to database")?;
    pki_acme_db::migrate(&db)
        .await
        .context("Failed to run database migrations")?;

    let issuer = load_issuer(&args)?;

    let validation = &config.validation;
    if !validation.dev_host_overrides.is_empty() {
        warn!(
            "HTTP-01 host overrides active for {} identifiers",
            validation.dev_host_overrides.len()
        );
    }
    let resolver = Arc::new(
        HickoryDnsResolver::new(&validation.resolver_addrs()?, validation.timeout())
            .context("Failed to build DNS resolver")?,
    );
    let http = Http01Client::with_overrides(
        validation.timeout(),
        resolver.clone(),
        args.dev_mode,
        validation.dev_host_overrides.clone(),
    )
    .context("Failed to build HTTP-01 client")?;

    let audit = Arc::new(TracingAuditLog);
    let validator = Arc::new(ChallengeValidator::new(
        db.clone(),
        audit.clone(),
        http,
        resolver,
        validation.max_attempts,
    ));
    let (queue, pool) = WorkerPool::spawn(validator, WorkerPoolConfig::from(validation));
    info!("Started {} validation workers", pool.worker_count());

    let nonces = Arc::new(DbNonceStore::new(db.clone(), config.nonce_ttl()));
    let sweeper = spawn_nonce_sweeper(nonces.clone(), config.nonce_sweep_interval());

    let service = Arc::new(AcmeService::new(AcmeServiceParts {
        db,
        profiles: Arc::new(StaticProfileStore::from_config(&config.profiles)),
        nonces,
        queue: Arc::new(queue),
        issuer: Arc::new(issuer),
        audit,
        urls: UrlBuilder::new(args.base_url.clone()),
        dev_mode: args.dev_mode,
    }));

    if args.dev_mode {
        warn!("Development mode: localhost identifiers and private targets are accepted");
    }
    for profile in &config.profiles {
        info!(
            "Profile '{}': {}/acme/profiles/{}/directory",
            profile.id,
            args.base_url.trim_end_matches('/'),
            profile.id
        );
    }

    let server = ApiServer::new(
        ApiServerConfig {
            bind_addr: args.bind_addr,
            enable_cors: args.enable_cors,
        },
        service,
    );

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C, shutting down...");
    };
    let result = server.start(shutdown).await;

    pool.shutdown();
    sweeper.abort();
    info!("ACME server stopped");
    result
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::GenerateCa {
            common_name,
            cert,
            key,
        }) => generate_ca(&common_name, &cert, &key),
        None => {
            setup_logging(&cli.server.log_level);
            info!("pki-acme-server {} starting", VERSION);
            run_server(cli.server).await
        }
    }
}
