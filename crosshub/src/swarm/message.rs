use serde::{Deserialize, Serialize};

use crate::codec::ReceptTransaction;

pub const GET_CERT_MSG: u64 = 1;
pub const CERT_MSG: u64 = 2;
pub const CTX_SIGN_MSG: u64 = 3;
pub const RTX_SIGN_MSG: u64 = 4;

/// The certificate chain a node presents during the handshake. Certificates are DER encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertsMessage {
    pub id: String,
    pub agency_cert: Vec<u8>,
    pub node_cert: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptEnvelope {
    pub sequence: i64,
    pub recept: ReceptTransaction,
}
