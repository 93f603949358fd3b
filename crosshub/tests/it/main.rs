mod end_to_end;
mod persistence;
mod swarm;

use std::{
    net::{SocketAddr, TcpListener},
    path::Path,
    time::Duration,
};

use crosshub::{
    cfg::{PeerConfig, SwarmConfig, channel_capacity_default},
    ledger::{BlockTransaction, ChaincodeEvent, HeaderType, Validation},
    swarm::Certificates,
    tx::Timestamp,
};
use rcgen::{BasicConstraints, Certificate, CertificateParams, DnType, IsCa, KeyPair};

/// A self-signed certificate authority.
struct Authority {
    cert: Certificate,
    key: KeyPair,
}

impl Authority {
    fn new(name: &str) -> Self {
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.distinguished_name.push(DnType::CommonName, name);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let key = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        Authority { cert, key }
    }

    /// Issues an agency certificate and a node certificate under it.
    fn issue(&self, node_name: &str) -> (Certificate, Certificate) {
        let mut agency_params = CertificateParams::new(Vec::<String>::new()).unwrap();
        agency_params
            .distinguished_name
            .push(DnType::CommonName, format!("{node_name} agency"));
        agency_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let agency_key = KeyPair::generate().unwrap();
        let agency = agency_params
            .signed_by(&agency_key, &self.cert, &self.key)
            .unwrap();

        let mut node_params = CertificateParams::new(vec![node_name.to_owned()]).unwrap();
        node_params.distinguished_name.push(DnType::CommonName, node_name);
        let node_key = KeyPair::generate().unwrap();
        let node = node_params.signed_by(&node_key, &agency, &agency_key).unwrap();
        (agency, node)
    }

    fn certificates(&self, node_name: &str) -> Certificates {
        let (agency, node) = self.issue(node_name);
        Certificates::from_der(
            self.cert.der().to_vec(),
            agency.der().to_vec(),
            node.der().to_vec(),
        )
        .unwrap()
    }

    /// Writes the chain of `node_name` as PEM files into `dir` and returns a swarm config pointing at them.
    fn write_chain(&self, dir: &Path, node_name: &str, listen_addr: SocketAddr, peers: Vec<PeerConfig>) -> SwarmConfig {
        let (agency, node) = self.issue(node_name);
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join("ca.pem"), self.cert.pem()).unwrap();
        std::fs::write(dir.join("agency.pem"), agency.pem()).unwrap();
        std::fs::write(dir.join("node.pem"), node.pem()).unwrap();
        SwarmConfig {
            ca_cert: dir.join("ca.pem"),
            agency_cert: dir.join("agency.pem"),
            node_cert: dir.join("node.pem"),
            ..swarm_config(node_name, listen_addr, peers)
        }
    }
}

fn swarm_config(peer_id: &str, listen_addr: SocketAddr, peers: Vec<PeerConfig>) -> SwarmConfig {
    SwarmConfig {
        peer_id: peer_id.to_owned(),
        listen_addr,
        peers,
        ca_cert: "ca.pem".into(),
        agency_cert: "agency.pem".into(),
        node_cert: "node.pem".into(),
        retry_interval: Duration::from_millis(50),
        send_timeout: Duration::from_secs(2),
        channel_capacity: channel_capacity_default(),
    }
}

/// Reserves a local address. The port is released again, so there is a small window in which it could be taken.
fn free_addr() -> SocketAddr {
    TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap()
}

fn peer(id: &str, addr: SocketAddr) -> PeerConfig {
    PeerConfig {
        id: id.to_owned(),
        addr,
    }
}

/// A valid endorser transaction carrying a single chaincode event.
fn event_tx(tx_id: &str, event_name: &str, payload: serde_json::Value, timestamp: Timestamp) -> BlockTransaction {
    BlockTransaction {
        tx_id: tx_id.to_owned(),
        validation: Validation::Valid,
        header_type: HeaderType::EndorserTransaction,
        timestamp,
        events: vec![ChaincodeEvent {
            event_name: event_name.to_owned(),
            payload: serde_json::to_vec(&payload).unwrap(),
        }],
    }
}

/// Polls `cond` until it holds, panicking with `what` after ten seconds.
async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}
