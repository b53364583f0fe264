//! Contribution Watcher
//!
//! Watches the Zcash chain for payments to crowdfunding contributions and
//! tells the backend once each payment is confirmed.
//!
//! ## Architecture
//!
//! **Components:**
//! - `address`: per-contribution transparent addresses (BIP32 derivation or node wallet)
//! - `auth`: shared-secret credential check for HTTP and websocket clients
//! - `state`: in-memory watched addresses and pending shielded disclosures
//! - `ledger`: zcashd JSON-RPC client behind the `LedgerClient` trait
//! - `mock_node`: in-memory ledger for development/testing
//! - `scanner`: sequential block scanner with a confirmation-depth lag
//! - `reconciler`: confirms shielded-payment disclosures as blocks are scanned
//! - `notifier`: websocket broadcast and webhook delivery
//! - `bootstrap`: restart handshake with the backend
//! - `checkpoint`: optional Redis height checkpoint
//! - `service`: the `Watcher` tying the components together
//! - `api`: REST API
//! - `config`: configuration management
//!
//! **Data Flow:**
//! 1. Backend calls `/bootstrap` → every pending contribution gets an address
//! 2. Scanner starts at the resolved height and follows the tip
//! 3. Output to a watched address at confirmation depth → confirmation event
//! 4. Disclosures submitted by contributors are confirmed on the same cadence
//! 5. Events fan out to websocket clients and the backend webhook

pub mod address;
pub mod api;
pub mod auth;
pub mod bootstrap;
pub mod checkpoint;
pub mod config;
pub mod ledger;
pub mod mock_node;
pub mod notifier;
pub mod reconciler;
pub mod scanner;
pub mod service;
pub mod state;

// Re-export commonly used types
pub use config::Config;
pub use ledger::{LedgerClient, RpcLedger};
pub use mock_node::MockNode;
pub use service::Watcher;
