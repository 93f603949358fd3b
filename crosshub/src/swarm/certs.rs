//! Certificate chains of relay nodes. Every node holds a node certificate issued by its agency, and every agency
//! certificate is issued by the certificate authority shared by all nodes.

use std::path::Path;

use thiserror::Error;
use x509_parser::prelude::*;

use super::message::CertsMessage;

const PEM_MARKER: &[u8] = b"-----BEGIN";

#[derive(Debug, Error)]
pub enum CertError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid {0} certificate")]
    Parse(&'static str),
    #[error("{0} certificate is not issued by its {1}")]
    Untrusted(&'static str, &'static str),
    #[error("{0} certificate is expired or not yet valid")]
    Expired(&'static str),
}

/// The local certificate chain, DER encoded.
#[derive(Debug, Clone)]
pub struct Certificates {
    ca: Vec<u8>,
    agency: Vec<u8>,
    node: Vec<u8>,
}

impl Certificates {
    /// Loads PEM or DER encoded certificates and checks that they form a chain.
    pub fn load(ca: &Path, agency: &Path, node: &Path) -> Result<Self, CertError> {
        Self::from_der(read_cert(ca)?, read_cert(agency)?, read_cert(node)?)
    }

    pub fn from_der(ca: Vec<u8>, agency: Vec<u8>, node: Vec<u8>) -> Result<Self, CertError> {
        parse(&ca, "ca")?;
        let certs = Certificates { ca, agency, node };
        certs.verify_chain(&certs.agency, &certs.node)?;
        Ok(certs)
    }

    /// The bundle this node presents to its peers.
    pub fn bundle(&self, id: &str) -> CertsMessage {
        CertsMessage {
            id: id.to_owned(),
            agency_cert: self.agency.clone(),
            node_cert: self.node.clone(),
        }
    }

    /// Checks that a peer's bundle chains up to the local certificate authority.
    pub fn verify(&self, msg: &CertsMessage) -> Result<(), CertError> {
        self.verify_chain(&msg.agency_cert, &msg.node_cert)
    }

    fn verify_chain(&self, agency: &[u8], node: &[u8]) -> Result<(), CertError> {
        let ca = parse(&self.ca, "ca")?;
        let agency = parse(agency, "agency")?;
        let node = parse(node, "node")?;

        agency
            .verify_signature(Some(ca.public_key()))
            .map_err(|_| CertError::Untrusted("agency", "certificate authority"))?;
        node.verify_signature(Some(agency.public_key()))
            .map_err(|_| CertError::Untrusted("node", "agency"))?;

        if !agency.validity().is_valid() {
            return Err(CertError::Expired("agency"));
        }
        if !node.validity().is_valid() {
            return Err(CertError::Expired("node"));
        }
        Ok(())
    }
}

fn parse<'a>(der: &'a [u8], which: &'static str) -> Result<X509Certificate<'a>, CertError> {
    let (_, cert) = X509Certificate::from_der(der).map_err(|_| CertError::Parse(which))?;
    Ok(cert)
}

fn read_cert(path: &Path) -> Result<Vec<u8>, CertError> {
    let bytes = std::fs::read(path).map_err(|source| CertError::Read {
        path: path.display().to_string(),
        source,
    })?;
    if !bytes.starts_with(PEM_MARKER) {
        return Ok(bytes);
    }
    let (_, pem) = x509_parser::pem::parse_x509_pem(&bytes).map_err(|_| CertError::Parse("pem"))?;
    Ok(pem.contents)
}
