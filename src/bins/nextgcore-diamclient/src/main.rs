//! NextGCore Diameter hello client
//!
//! Connects to a Diameter peer, runs the capabilities exchange, sends one
//! Hello-Message-Request (application 999, command 111) and waits for the
//! answer before disconnecting.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use ogs_diameter_peer::{
    avp_code, Avp, DiameterClient, DiameterClientConfig, Dictionary, PeerEndpoint, PeerError,
    PeerIdentity, PeerSettings, TlsSettings, DIAMETER_PORT, HELLO_DICTIONARY,
};

/// NextGCore Diameter client - hello application
#[derive(Parser, Debug)]
#[command(name = "nextgcore-diamclient")]
#[command(author = "NextGCore")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Diameter hello client", long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Peer address (host:port); overrides the configured peer
    #[arg(short = 'a', long)]
    address: Option<String>,

    /// YAML dictionary with the hello application
    #[arg(long)]
    dictionary: Option<PathBuf>,

    /// Connect over TLS
    #[arg(long)]
    tls: bool,

    /// CA certificate used to verify the peer
    #[arg(long)]
    ca_cert: Option<PathBuf>,

    /// Client certificate
    #[arg(long)]
    cert: Option<PathBuf>,

    /// Client private key
    #[arg(long)]
    key: Option<PathBuf>,

    /// Skip peer certificate verification
    #[arg(long)]
    insecure_skip_verify: bool,

    /// Seconds to wait for the hello answer
    #[arg(short = 't', long, default_value = "5")]
    timeout: u64,

    /// User-Name sent in the hello request
    #[arg(short = 'u', long, default_value = "foobar")]
    user_name: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'e', long, default_value = "info")]
    log_level: String,

    /// Disable color output
    #[arg(short = 'm', long)]
    no_color: bool,
}

struct ClientSetup {
    identity: PeerIdentity,
    settings: PeerSettings,
    dictionary: Option<PathBuf>,
    endpoint: PeerEndpoint,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args)?;

    log::info!("NextGCore Diameter client v{} starting...", env!("CARGO_PKG_VERSION"));

    let setup = client_setup(&args)?;
    let dictionary = match &setup.dictionary {
        Some(path) => Dictionary::from_file(path)
            .with_context(|| format!("failed to load dictionary {}", path.display()))?,
        None => Dictionary::from_yaml_str(HELLO_DICTIONARY)?,
    };

    let client = DiameterClient::new(setup.identity, setup.settings, Arc::new(dictionary));
    client.handle_name("HMA", |conn, msg| {
        log::info!(
            "Unsolicited HMA from {}: session={:?}, result={:?}",
            conn.peer_addr(),
            msg.session_id(),
            msg.result_code()
        );
    })?;
    client.handle_name("ACA", |conn, msg| {
        log::info!(
            "Received ACA from {}: session={:?}, result={:?}",
            conn.peer_addr(),
            msg.session_id(),
            msg.result_code()
        );
    })?;

    if let Some(mut reports) = client.error_reports() {
        tokio::spawn(async move {
            while let Some(report) = reports.recv().await {
                log::error!("Diameter error: {report}");
            }
        });
    }

    let endpoint = setup.endpoint;
    log::info!("Connecting to {}", endpoint.address);
    let conn = client
        .connect_endpoint(&endpoint)
        .await
        .with_context(|| format!("failed to connect to {}", endpoint.address))?;
    let metadata = conn.peer_metadata()?;
    log::info!(
        "Connected to {} ({}, realm {})",
        conn.peer_addr(),
        metadata.origin_host,
        metadata.origin_realm
    );

    let hello = conn
        .dictionary()
        .command_id("HMR")
        .context("dictionary does not define HMR")?;
    let mut request = conn.new_request(hello)?;
    request.add_avp(Avp::utf8(avp_code::USER_NAME, &args.user_name));
    let session_id = request.session_id().unwrap_or_default().to_string();
    log::info!("Sending HMR (session {session_id}, user {})", args.user_name);

    let timeout = Duration::from_secs(args.timeout);
    let outcome = tokio::select! {
        outcome = conn.send_and_wait(request, timeout) => outcome,
        _ = tokio::signal::ctrl_c() => {
            log::info!("Interrupted");
            conn.close().await;
            return Ok(());
        }
    };

    let result = match outcome {
        Ok(answer) => {
            log::info!(
                "Received HMA from {}: session={}, result={}",
                answer.origin_host().unwrap_or("?"),
                answer.session_id().unwrap_or("?"),
                answer
                    .result_code()
                    .map_or_else(|| "none".to_string(), |c| c.to_string())
            );
            Ok(())
        }
        Err(PeerError::Timeout { .. }) => Err(anyhow::anyhow!("timeout: no hello answer received")),
        Err(e) => Err(anyhow::Error::new(e).context("hello exchange failed")),
    };

    conn.close().await;
    log::info!("NextGCore Diameter client stopped");
    result
}

/// Identity, timers and peer from the config file, or built-in defaults
fn client_setup(args: &Args) -> Result<ClientSetup> {
    let mut setup = match &args.config {
        Some(path) => {
            let config = DiameterClientConfig::from_file(path)
                .with_context(|| format!("failed to load {}", path.display()))?;
            ClientSetup {
                identity: config.identity(),
                settings: config.settings(),
                dictionary: config.dictionary.clone(),
                endpoint: config.peer.clone().unwrap_or_else(default_endpoint),
            }
        }
        None => {
            let mut identity = PeerIdentity::new("client", "client_realm")
                .with_host_address(IpAddr::V4(Ipv4Addr::LOCALHOST));
            identity.vendor_id = 13;
            identity.firmware_revision = 1;
            ClientSetup {
                identity,
                settings: PeerSettings {
                    auth_application_ids: vec![4],
                    acct_application_ids: vec![999],
                    ..Default::default()
                },
                dictionary: None,
                endpoint: default_endpoint(),
            }
        }
    };

    if let Some(address) = &args.address {
        setup.endpoint.address = address.clone();
    }
    if args.dictionary.is_some() {
        setup.dictionary = args.dictionary.clone();
    }
    if args.tls {
        let tls = setup.endpoint.tls.get_or_insert_with(TlsSettings::default);
        tls.ca_cert = args.ca_cert.clone().or(tls.ca_cert.take());
        tls.client_cert = args.cert.clone().or(tls.client_cert.take());
        tls.client_key = args.key.clone().or(tls.client_key.take());
        tls.insecure_skip_verify |= args.insecure_skip_verify;
    }
    Ok(setup)
}

fn default_endpoint() -> PeerEndpoint {
    PeerEndpoint {
        address: format!("localhost:{DIAMETER_PORT}"),
        tls: None,
    }
}

/// Initialize logging based on command line arguments
fn init_logging(args: &Args) -> Result<()> {
    let mut builder = env_logger::Builder::new();

    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "info" => log::LevelFilter::Info,
        "warn" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        _ => log::LevelFilter::Info,
    };
    builder.filter_level(level);
    builder.format_timestamp_millis();

    if args.no_color {
        builder.write_style(env_logger::WriteStyle::Never);
    }

    builder.try_init()?;
    Ok(())
}
