//! Chaincode contracts and their lifecycle status.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, de::Error as _};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Name of the envelope key the chaincode wraps contracts in.
const ENVELOPE_KEY: &str = "IContract";

#[derive(Debug, Error)]
pub enum ContractError {
    #[error("not a valid cstatus flag: {0}")]
    InvalidStatus(String),
    #[error("unsupported contract type: {0}")]
    UnsupportedType(String),
    #[error("contract has no status")]
    MissingStatus,
    #[error("status cannot move from {from} to {to}")]
    StatusRegression { from: CStatus, to: CStatus },
    #[error("commit contract {0} carries no receipt")]
    NotPrecommit(String),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Lifecycle status of a contract. The discriminants are the bit flags used on the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum CStatus {
    Init = 128,
    Pending = 64,
    Executed = 32,
    Finished = 16,
    Completed = 8,
    OutOnceCompleted = 4,
}

impl CStatus {
    pub const ALL: [CStatus; 6] = [
        CStatus::Init,
        CStatus::Pending,
        CStatus::Executed,
        CStatus::Finished,
        CStatus::Completed,
        CStatus::OutOnceCompleted,
    ];

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<CStatus> {
        CStatus::ALL.into_iter().find(|s| s.as_u8() == value)
    }

    /// The text form of a raw status value. Unknown values are reported as `UnSupported`.
    pub fn name_of(value: u8) -> &'static str {
        CStatus::from_u8(value).map_or("UnSupported", CStatus::name)
    }

    pub fn name(self) -> &'static str {
        match self {
            CStatus::Init => "Init",
            CStatus::Pending => "Pending",
            CStatus::Executed => "Executed",
            CStatus::Finished => "Finished",
            CStatus::Completed => "Completed",
            CStatus::OutOnceCompleted => "OutOnceCompleted",
        }
    }

    // `Finished` and `OutOnceCompleted` are alternative endings which both lead to `Completed`.
    fn rank(self) -> u8 {
        match self {
            CStatus::Init => 0,
            CStatus::Pending => 1,
            CStatus::Executed => 2,
            CStatus::Finished | CStatus::OutOnceCompleted => 3,
            CStatus::Completed => 4,
        }
    }

    /// Whether a record in this status may move to `next`.
    pub fn can_advance_to(self, next: CStatus) -> bool {
        next.rank() >= self.rank()
    }

    /// Statuses reported by the ledger once the destination side has finished.
    pub fn is_terminal_event(self) -> bool {
        matches!(self, CStatus::Finished | CStatus::OutOnceCompleted)
    }
}

impl fmt::Display for CStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CStatus {
    type Err = ContractError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CStatus::ALL
            .into_iter()
            .find(|status| status.name() == s)
            .ok_or_else(|| ContractError::InvalidStatus(s.to_owned()))
    }
}

/// The application data of a contract.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContractCore {
    pub address: String,
    /// Decimal amount.
    pub value: String,
    pub description: String,
    pub owner: String,
    pub to_call: String,
    pub args: Vec<String>,
    pub creator: String,
}

impl ContractCore {
    /// `hex(sha256(json(core) || tx_id))`.
    pub fn contract_id(&self, tx_id: &str) -> Result<String, ContractError> {
        let raw = serde_json::to_vec(self)?;
        let mut hasher = Sha256::new();
        hasher.update(&raw);
        hasher.update(tx_id.as_bytes());
        Ok(hex::encode(hasher.finalize()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrecommitContract {
    pub status: CStatus,
    pub contract_id: String,
    #[serde(default)]
    pub receipt: String,
    #[serde(flatten)]
    pub core: ContractCore,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitContract {
    pub status: CStatus,
    pub contract_id: String,
}

/// A contract emitted by the chaincode. The variant is chosen by the `status` field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Contract {
    Precommit(PrecommitContract),
    Commit(CommitContract),
}

impl Contract {
    /// Decodes a contract from JSON, either bare or wrapped in an `{"IContract": ...}` envelope.
    pub fn decode(bytes: &[u8]) -> Result<Contract, ContractError> {
        Self::from_value(serde_json::from_slice(bytes)?)
    }

    pub fn from_value(mut value: Value) -> Result<Contract, ContractError> {
        if let Some(inner) = value.get_mut(ENVELOPE_KEY).map(Value::take) {
            value = inner;
        }
        let status = value
            .get("status")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or(ContractError::MissingStatus)?;

        match CStatus::from_str(&status) {
            Ok(CStatus::Init | CStatus::Pending | CStatus::Executed | CStatus::Completed) => {
                Ok(Contract::Precommit(serde_json::from_value(value)?))
            }
            Ok(CStatus::Finished | CStatus::OutOnceCompleted) => {
                Ok(Contract::Commit(serde_json::from_value(value)?))
            }
            Err(_) => Err(ContractError::UnsupportedType(status)),
        }
    }

    pub fn contract_id(&self) -> &str {
        match self {
            Contract::Precommit(c) => &c.contract_id,
            Contract::Commit(c) => &c.contract_id,
        }
    }

    pub fn status(&self) -> CStatus {
        match self {
            Contract::Precommit(c) => c.status,
            Contract::Commit(c) => c.status,
        }
    }

    pub fn core(&self) -> Option<&ContractCore> {
        match self {
            Contract::Precommit(c) => Some(&c.core),
            Contract::Commit(_) => None,
        }
    }

    pub fn receipt(&self) -> Option<&str> {
        match self {
            Contract::Precommit(c) => Some(&c.receipt),
            Contract::Commit(_) => None,
        }
    }

    /// Moves the contract to `next`, refusing to go backwards.
    pub fn update_status(&mut self, next: CStatus) -> Result<(), ContractError> {
        let current = self.status();
        if !current.can_advance_to(next) {
            return Err(ContractError::StatusRegression {
                from: current,
                to: next,
            });
        }
        match self {
            Contract::Precommit(c) => c.status = next,
            Contract::Commit(c) => c.status = next,
        }
        Ok(())
    }

    pub fn set_receipt(&mut self, receipt: String) -> Result<(), ContractError> {
        match self {
            Contract::Precommit(c) => {
                c.receipt = receipt;
                Ok(())
            }
            Contract::Commit(c) => Err(ContractError::NotPrecommit(c.contract_id.clone())),
        }
    }
}

impl<'de> Deserialize<'de> for Contract {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Contract::from_value(value).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn core() -> ContractCore {
        ContractCore {
            address: "0xabc".to_owned(),
            value: "1000".to_owned(),
            description: "swap".to_owned(),
            owner: "org1".to_owned(),
            to_call: "transfer".to_owned(),
            args: vec!["a".to_owned(), "b".to_owned()],
            creator: "alice".to_owned(),
        }
    }

    #[test]
    fn status_text_round_trips() {
        for status in CStatus::ALL {
            assert_eq!(status.name().parse::<CStatus>().unwrap(), status);
            assert_eq!(CStatus::name_of(status.as_u8()), status.name());
        }
        assert_eq!(CStatus::name_of(3), "UnSupported");
        assert!("Done".parse::<CStatus>().is_err());
        assert_eq!(serde_json::to_string(&CStatus::Executed).unwrap(), "\"Executed\"");
    }

    #[test]
    fn status_only_moves_forward() {
        let mut contract = Contract::Precommit(PrecommitContract {
            status: CStatus::Init,
            contract_id: "id".to_owned(),
            receipt: String::new(),
            core: core(),
        });
        contract.update_status(CStatus::Pending).unwrap();
        contract.update_status(CStatus::Pending).unwrap();
        contract.update_status(CStatus::Completed).unwrap();
        assert!(matches!(
            contract.update_status(CStatus::Init),
            Err(ContractError::StatusRegression { .. })
        ));
        assert_eq!(contract.status(), CStatus::Completed);
    }

    #[test]
    fn decode_switches_on_status() {
        let precommit = json!({
            "IContract": {
                "status": "Init",
                "contract_id": "c1",
                "receipt": "",
                "address": "0xabc",
                "value": "1000",
                "description": "swap",
                "owner": "org1",
                "to_call": "transfer",
                "args": ["a", "b"],
                "creator": "alice",
            }
        });
        let contract = Contract::decode(precommit.to_string().as_bytes()).unwrap();
        assert_eq!(contract.core(), Some(&core()));
        assert_eq!(contract.contract_id(), "c1");

        let commit = json!({ "status": "Finished", "contract_id": "c1" });
        let contract = Contract::decode(commit.to_string().as_bytes()).unwrap();
        assert!(matches!(contract, Contract::Commit(_)));

        let unknown = json!({ "status": "Lost", "contract_id": "c1" });
        assert!(matches!(
            Contract::decode(unknown.to_string().as_bytes()),
            Err(ContractError::UnsupportedType(_))
        ));
    }

    #[test]
    fn flattened_core_round_trips() {
        let contract = Contract::Precommit(PrecommitContract {
            status: CStatus::Executed,
            contract_id: "c2".to_owned(),
            receipt: "0xbb".to_owned(),
            core: core(),
        });
        let json = serde_json::to_value(&contract).unwrap();
        assert_eq!(json["to_call"], "transfer");
        assert_eq!(serde_json::from_value::<Contract>(json).unwrap(), contract);
    }

    #[test]
    fn contract_id_binds_core_and_tx() {
        let a = core().contract_id("tx1").unwrap();
        assert_eq!(a.len(), 64);
        assert_eq!(a, core().contract_id("tx1").unwrap());
        assert_ne!(a, core().contract_id("tx2").unwrap());
    }
}
