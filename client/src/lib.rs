//! # Parkmarket Client
//!
//! Client side of the parking marketplace:
//!
//! - [`collection`]: reading whole collections from `count` plus
//!   independent point reads, with per-index failure isolation
//! - [`catalog`]: the spots and bookings views as reducer state
//! - [`transaction`]: single-flight tracking of mutating calls
//! - [`client`]: [`MarketplaceClient`], the operations an application drives
//! - [`config`]: environment configuration
//! - [`rpc`]: the JSON-RPC adapter for the deployed ledger
//!
//! ## Example
//!
//! ```ignore
//! let ledger: Arc<dyn Ledger> = Arc::new(JsonRpcLedger::new(&config.ledger, signer));
//! let host = MarketplaceClient::new(ledger, ClientSettings::default())
//!     .with_identity(Caller::new(host_address));
//!
//! let created = host.create_spot(Units::parse_ether("0.01")?).await?;
//! println!("print this: {}", created.payload);
//! ```

pub mod catalog;
pub mod client;
pub mod collection;
pub mod config;
pub mod rpc;
pub mod transaction;

pub use catalog::{CatalogState, CollectionState};
pub use client::{
    ClientSettings, CreateSpotError, CreatedSpot, MarketplaceClient, UnconfirmedSpot,
};
pub use collection::{CollectionSnapshot, CountChange, Entry, Slot};
pub use config::{Config, ConfigError};
pub use rpc::{JsonRpcLedger, NodeSigner, TransactionSigner};
pub use transaction::{ActionKey, Timeouts, TransactionTracker, TxPhase};
