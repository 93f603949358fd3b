pub mod cfg;
pub mod channel;
pub mod codec;
pub mod contract;
pub mod courier;
pub mod crypto;
pub mod db;
pub mod dispatch;
pub mod ledger;
pub mod node;
pub mod scanner;
pub mod swarm;
pub mod transport;
pub mod tx;
pub mod webhook;
