//! Parking marketplace command line client
//!
//! Reads the ledger and drives the host and renter flows against a
//! JSON-RPC node that holds the caller's key.
//!
//! # Usage
//!
//! ```bash
//! export PARKMARKET_RPC_URL=http://localhost:8545
//! export PARKMARKET_LEDGER_ADDRESS=0x...
//!
//! parkmarket spots --active
//! parkmarket --from 0xHOST create-spot 0.01
//! parkmarket --from 0xRENTER reserve 0 3
//! parkmarket --from 0xRENTER scan 0 '{"secret":"..."}'
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use parkmarket_client::collection::{Bookings, Spots};
use parkmarket_client::{
    ClientSettings, CollectionSnapshot, Config, CreateSpotError, JsonRpcLedger, MarketplaceClient,
    NodeSigner,
};
use parkmarket_core::commitment::{commit, verify};
use parkmarket_core::{
    Address, Booking, BookingId, Caller, Commitment, Ledger, LedgerReader, MarketError, Spot,
    SpotId, SpotUpdate, Units, payload,
};
use parkmarket_runtime::metrics::MetricsServer;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "parkmarket", version, about = "Peer-to-peer parking marketplace client")]
struct Cli {
    /// Account the node signs for
    #[arg(long, global = true)]
    from: Option<Address>,

    /// Serve Prometheus metrics while the command runs
    #[arg(long, global = true)]
    metrics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List every spot
    Spots {
        /// Only spots open for booking
        #[arg(long)]
        active: bool,
        /// Only spots owned by this address
        #[arg(long)]
        owner: Option<Address>,
    },
    /// List every booking
    Bookings {
        /// Only bookings made by this address
        #[arg(long)]
        renter: Option<Address>,
    },
    /// Generate a secret offline and print its payload and commitment
    Secret,
    /// Check a scanned payload against a commitment
    Verify {
        /// Scanned credential payload
        payload: String,
        /// 0x-prefixed commitment
        commitment: Commitment,
    },
    /// List a new spot at a rate in ether per hour
    CreateSpot {
        /// Rate per hour, e.g. 0.01
        rate: String,
    },
    /// Change a spot's rate or availability
    UpdateSpot {
        /// Spot index
        spot: u64,
        /// New rate per hour
        #[arg(long)]
        rate: Option<String>,
        /// Open or close the spot
        #[arg(long)]
        active: Option<bool>,
        /// Issue a fresh credential secret
        #[arg(long)]
        rotate_secret: bool,
    },
    /// Reserve a spot for up to `hours` hours
    Reserve {
        /// Spot index
        spot: u64,
        /// Maximum billable hours
        hours: u32,
    },
    /// Check in or out of a booking, whichever comes next
    Scan {
        /// Booking index
        booking: u64,
        /// Scanned credential payload
        payload: String,
    },
    /// Cancel a reservation before check-in
    Cancel {
        /// Booking index
        booking: u64,
    },
    /// Show what checking out now would settle
    Quote {
        /// Booking index
        booking: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,parkmarket_client=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Command::Secret => {
            let (secret, commitment) = commit();
            println!("payload:    {}", payload::encode(&secret)?);
            println!("commitment: {commitment}");
            return Ok(());
        },
        Command::Verify {
            payload: raw,
            commitment,
        } => {
            let secret = payload::decode(raw)?;
            if verify(&secret, commitment) {
                println!("match");
                return Ok(());
            }
            anyhow::bail!("payload does not match commitment {commitment}");
        },
        _ => {},
    }

    let config = Config::from_env().context("loading configuration")?;
    tracing::debug!(rpc = %config.ledger.rpc_url, ledger = %config.ledger.address, "Configuration loaded");

    if cli.metrics {
        MetricsServer::new(config.metrics_addr).start()?;
        tracing::info!(addr = %config.metrics_addr, "Metrics exporter started");
    }

    let signer = Arc::new(NodeSigner::new(config.ledger.rpc_url.clone()));
    let ledger = Arc::new(JsonRpcLedger::new(&config.ledger, signer));

    let settings = ClientSettings {
        timeouts: config.timeouts,
        ..ClientSettings::default()
    };
    let ledger_handle: Arc<dyn Ledger> = ledger.clone();
    let mut client = MarketplaceClient::new(ledger_handle, settings);
    if let Some(from) = cli.from {
        client = client.with_identity(Caller::new(from));
    }

    match cli.command {
        Command::Spots { active, owner } => {
            let snapshot = parkmarket_client::collection::read_all(&Spots(&*ledger)).await?;
            let mut rows = match owner {
                Some(owner) => snapshot.owned_by(&owner),
                None => snapshot.available().collect(),
            };
            if active {
                rows.retain(|(_, spot)| spot.active);
            }
            for (_, spot) in rows {
                print_spot(spot);
            }
            report_unavailable(&snapshot, "spot");
        },
        Command::Bookings { renter } => {
            let snapshot = parkmarket_client::collection::read_all(&Bookings(&*ledger)).await?;
            let rows = match renter {
                Some(renter) => snapshot.bookings_for(&renter),
                None => snapshot.available().collect(),
            };
            for (_, booking) in rows {
                print_booking(booking);
            }
            report_unavailable(&snapshot, "booking");
        },
        Command::CreateSpot { rate } => {
            let created = match client.create_spot(Units::parse_ether(&rate)?).await {
                Ok(created) => created,
                Err(CreateSpotError {
                    error,
                    unconfirmed: Some(pending),
                }) => {
                    eprintln!("creation not confirmed; the spot may still appear with this payload");
                    println!("payload: {}", pending.payload);
                    return Err(error.into());
                },
                Err(error) => return Err(error.into()),
            };
            println!("spot:    {}", created.spot_id);
            println!("payload: {}", created.payload);
        },
        Command::UpdateSpot {
            spot,
            rate,
            active,
            rotate_secret,
        } => {
            let spot_id = SpotId::new(spot);
            let current = ledger
                .spot(spot_id)
                .await?
                .ok_or(MarketError::spot_not_found(spot_id))?;
            let mut update = SpotUpdate::from_current(&current);
            if let Some(rate) = rate {
                update = update.with_rate(Units::parse_ether(&rate)?);
            }
            if let Some(active) = active {
                update = update.with_active(active);
            }
            let mut fresh_payload = None;
            if rotate_secret {
                let (secret, commitment) = commit();
                fresh_payload = Some(payload::encode(&secret)?);
                update = update.with_commitment(commitment);
            }
            let receipt = client.update_spot(spot_id, update).await?;
            println!("updated in {}", receipt.tx_hash);
            if let Some(fresh) = fresh_payload {
                println!("payload: {fresh}");
            }
        },
        Command::Reserve { spot, hours } => {
            let booking_id = client.reserve(SpotId::new(spot), hours).await?;
            println!("booking: {booking_id}");
        },
        Command::Scan {
            booking,
            payload: raw,
        } => {
            let done = client.scan(BookingId::new(booking), &raw).await?;
            println!("{done:?}");
        },
        Command::Cancel { booking } => {
            let receipt = client.cancel(BookingId::new(booking)).await?;
            println!("cancelled in {}", receipt.tx_hash);
        },
        Command::Quote { booking } => match client.quote(BookingId::new(booking)).await? {
            Some(quote) => {
                println!("billable hours: {}", quote.billable_hours);
                println!("cost:           {}", quote.cost);
                println!("host payout:    {}", quote.host_payout);
                println!("fee:            {}", quote.fee);
                println!("refund:         {}", quote.refund);
            },
            None => println!("booking {booking} is not checked in"),
        },
        Command::Secret | Command::Verify { .. } => {},
    }

    Ok(())
}

fn print_spot(spot: &Spot) {
    println!(
        "{:>4}  {}  {:>12}/h  {}",
        spot.id.index(),
        spot.owner,
        spot.rate_per_hour.to_string(),
        if spot.active { "active" } else { "inactive" }
    );
}

fn print_booking(booking: &Booking) {
    println!(
        "{:>4}  spot {:<4}  {}  {:>3}h  {}",
        booking.id.index(),
        booking.spot_id.index(),
        booking.renter,
        booking.max_hours,
        booking.status
    );
}

fn report_unavailable<T>(snapshot: &CollectionSnapshot<T>, what: &str) {
    for (index, error) in snapshot.unavailable() {
        eprintln!("{what} {index} unavailable: {error}");
    }
}
