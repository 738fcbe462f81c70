//! Diameter peer configuration types

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::Deserialize;

use crate::error::{DiameterError, DiameterResult};
use crate::tls::TlsSettings;

/// Default product name advertised in CER
pub const DEFAULT_PRODUCT_NAME: &str = "nextgcore";

/// Local identity advertised during capabilities exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    /// Diameter Identity of the local peer (FQDN)
    pub origin_host: String,
    pub origin_realm: String,
    pub vendor_id: u32,
    pub product_name: String,
    pub origin_state_id: u32,
    pub firmware_revision: u32,
    pub host_addresses: BTreeSet<IpAddr>,
}

impl PeerIdentity {
    pub fn new(origin_host: impl Into<String>, origin_realm: impl Into<String>) -> Self {
        Self {
            origin_host: origin_host.into(),
            origin_realm: origin_realm.into(),
            vendor_id: 0,
            product_name: DEFAULT_PRODUCT_NAME.to_string(),
            origin_state_id: origin_state_id(),
            firmware_revision: 0,
            host_addresses: BTreeSet::new(),
        }
    }

    pub fn with_host_address(mut self, addr: IpAddr) -> Self {
        self.host_addresses.insert(addr);
        self
    }
}

/// Timers and negotiation options of the peer state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSettings {
    /// Retransmissions of CER/DWR before giving up
    pub max_retransmits: u32,
    pub retransmit_interval: Duration,
    pub enable_watchdog: bool,
    /// Idle time before a DWR is sent (Tw)
    pub watchdog_interval: Duration,
    pub auth_application_ids: Vec<u32>,
    pub acct_application_ids: Vec<u32>,
    pub dial_timeout: Duration,
    /// Longest a single outbound frame may take to reach the transport
    pub write_timeout: Duration,
    /// Capacity of the error report channel
    pub error_report_capacity: usize,
}

impl Default for PeerSettings {
    fn default() -> Self {
        Self {
            max_retransmits: 3,
            retransmit_interval: Duration::from_secs(1),
            enable_watchdog: true,
            watchdog_interval: Duration::from_secs(5),
            auth_application_ids: Vec::new(),
            acct_application_ids: Vec::new(),
            dial_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
            error_report_capacity: 1024,
        }
    }
}

impl PeerSettings {
    /// Applications the local peer accepts (auth and acct)
    pub fn accepted_application_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.auth_application_ids
            .iter()
            .chain(self.acct_application_ids.iter())
            .copied()
    }

    pub fn validate(&self) -> DiameterResult<()> {
        if self.retransmit_interval.is_zero() {
            return Err(DiameterError::Protocol("retransmit interval must be non-zero".into()));
        }
        if self.enable_watchdog && self.watchdog_interval.is_zero() {
            return Err(DiameterError::Protocol("watchdog interval must be non-zero".into()));
        }
        if self.write_timeout.is_zero() {
            return Err(DiameterError::Protocol("write timeout must be non-zero".into()));
        }
        if self.error_report_capacity == 0 {
            return Err(DiameterError::Protocol("error report capacity must be non-zero".into()));
        }
        Ok(())
    }
}

/// Remote peer to dial
#[derive(Debug, Clone, Deserialize)]
pub struct PeerEndpoint {
    /// `host:port`
    pub address: String,
    #[serde(default)]
    pub tls: Option<TlsSettings>,
}

fn default_product_name() -> String {
    DEFAULT_PRODUCT_NAME.to_string()
}

fn default_max_retransmits() -> u32 {
    3
}

fn default_retransmit_interval_ms() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

fn default_watchdog_interval_ms() -> u64 {
    5000
}

fn default_dial_timeout_ms() -> u64 {
    5000
}

fn default_write_timeout_ms() -> u64 {
    5000
}

fn default_error_report_capacity() -> usize {
    1024
}

/// Client configuration, loaded from the `diameter:` section of a YAML file
#[derive(Debug, Clone, Deserialize)]
pub struct DiameterClientConfig {
    pub origin_host: String,
    pub origin_realm: String,
    #[serde(default)]
    pub vendor_id: u32,
    #[serde(default = "default_product_name")]
    pub product_name: String,
    /// 0 means "use the current UNIX time"
    #[serde(default)]
    pub origin_state_id: u32,
    #[serde(default)]
    pub firmware_revision: u32,
    #[serde(default)]
    pub host_addresses: Vec<IpAddr>,

    #[serde(default = "default_max_retransmits")]
    pub max_retransmits: u32,
    #[serde(default = "default_retransmit_interval_ms")]
    pub retransmit_interval_ms: u64,
    #[serde(default = "default_true")]
    pub enable_watchdog: bool,
    #[serde(default = "default_watchdog_interval_ms")]
    pub watchdog_interval_ms: u64,
    #[serde(default)]
    pub auth_application_ids: Vec<u32>,
    #[serde(default)]
    pub acct_application_ids: Vec<u32>,
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    #[serde(default = "default_error_report_capacity")]
    pub error_report_capacity: usize,

    /// YAML dictionary with the applications this client speaks
    #[serde(default)]
    pub dictionary: Option<PathBuf>,
    #[serde(default)]
    pub peer: Option<PeerEndpoint>,
}

#[derive(Deserialize)]
struct ConfigFile {
    diameter: DiameterClientConfig,
}

impl DiameterClientConfig {
    pub fn from_yaml_str(yaml: &str) -> DiameterResult<Self> {
        let file: ConfigFile = serde_yaml::from_str(yaml)
            .map_err(|e| DiameterError::Protocol(format!("invalid configuration: {e}")))?;
        let config = file.diameter;
        config.settings().validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> DiameterResult<Self> {
        let path = path.as_ref();
        log::info!("Loading Diameter configuration from {}", path.display());
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&yaml)
    }

    pub fn identity(&self) -> PeerIdentity {
        PeerIdentity {
            origin_host: self.origin_host.clone(),
            origin_realm: self.origin_realm.clone(),
            vendor_id: self.vendor_id,
            product_name: self.product_name.clone(),
            origin_state_id: if self.origin_state_id == 0 {
                origin_state_id()
            } else {
                self.origin_state_id
            },
            firmware_revision: self.firmware_revision,
            host_addresses: self.host_addresses.iter().copied().collect(),
        }
    }

    pub fn settings(&self) -> PeerSettings {
        PeerSettings {
            max_retransmits: self.max_retransmits,
            retransmit_interval: Duration::from_millis(self.retransmit_interval_ms),
            enable_watchdog: self.enable_watchdog,
            watchdog_interval: Duration::from_millis(self.watchdog_interval_ms),
            auth_application_ids: self.auth_application_ids.clone(),
            acct_application_ids: self.acct_application_ids.clone(),
            dial_timeout: Duration::from_millis(self.dial_timeout_ms),
            write_timeout: Duration::from_millis(self.write_timeout_ms),
            error_report_capacity: self.error_report_capacity,
        }
    }
}

/// Origin-State-Id: seconds since the UNIX epoch at startup
pub(crate) fn origin_state_id() -> u32 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}
