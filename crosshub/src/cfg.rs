use std::{net::SocketAddr, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Chain id of the destination chain. It is folded into every signature this node produces.
    pub chain_id: u64,
    /// The location of persistence data. If not set, uses a temporary in-memory database.
    #[serde(default)]
    pub data_dir: Option<String>,
    /// Capacity of the cache in front of point lookups of cross-chain transactions.
    #[serde(default = "cache_size_default")]
    pub cache_size: usize,
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub scanner: ScannerConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub courier: CourierConfig,
    pub swarm: SwarmConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LedgerConfig {
    /// Directory of `<n>.json` block files replayed as the source ledger.
    pub blocks_dir: PathBuf,
    /// Chaincode events to follow.
    #[serde(default = "filter_events_default")]
    pub filter_events: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScannerConfig {
    /// Delay between block queries once the scanner has caught up with the ledger.
    #[serde(default = "block_interval_default")]
    pub block_interval: Duration,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        ScannerConfig {
            block_interval: block_interval_default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DispatchConfig {
    #[serde(default = "pending_doorbell_default")]
    pub pending_doorbell: usize,
    #[serde(default = "executed_doorbell_default")]
    pub executed_doorbell: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        DispatchConfig {
            pending_doorbell: pending_doorbell_default(),
            executed_doorbell: executed_doorbell_default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CourierConfig {
    /// Maximum number of inbound receipts processed concurrently.
    #[serde(default = "receipt_workers_default")]
    pub receipt_workers: usize,
    /// Address of the receipt webhook. The webhook is disabled if not set.
    #[serde(default)]
    pub webhook: Option<SocketAddr>,
}

impl Default for CourierConfig {
    fn default() -> Self {
        CourierConfig {
            receipt_workers: receipt_workers_default(),
            webhook: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PeerConfig {
    pub id: String,
    pub addr: SocketAddr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SwarmConfig {
    /// The id this node presents in its certificate bundle.
    pub peer_id: String,
    pub listen_addr: SocketAddr,
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
    /// PEM or DER encoded certificate of the trusted certificate authority.
    pub ca_cert: PathBuf,
    /// PEM or DER encoded certificate of this node's agency, issued by the CA.
    pub agency_cert: PathBuf,
    /// PEM or DER encoded certificate of this node, issued by the agency.
    pub node_cert: PathBuf,
    #[serde(default = "retry_interval_default")]
    pub retry_interval: Duration,
    #[serde(default = "send_timeout_default")]
    pub send_timeout: Duration,
    /// Capacity of each direction of the channel between the courier and the swarm.
    #[serde(default = "channel_capacity_default")]
    pub channel_capacity: usize,
}

pub fn cache_size_default() -> usize {
    1024
}

pub fn filter_events_default() -> Vec<String> {
    vec!["precommit".to_owned(), "commit".to_owned()]
}

pub fn block_interval_default() -> Duration {
    Duration::from_secs(2)
}

pub fn pending_doorbell_default() -> usize {
    4
}

pub fn executed_doorbell_default() -> usize {
    8
}

pub fn receipt_workers_default() -> usize {
    64
}

pub fn retry_interval_default() -> Duration {
    Duration::from_secs(1)
}

pub fn send_timeout_default() -> Duration {
    Duration::from_secs(5)
}

pub fn channel_capacity_default() -> usize {
    4096
}
