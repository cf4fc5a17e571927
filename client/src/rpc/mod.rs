//! JSON-RPC ledger adapter.
//!
//! Reads go through `eth_call` against the marketplace ledger. Writes are
//! handed to a [`TransactionSigner`], which owns the signing context, and
//! confirmed by polling `eth_getTransactionReceipt`.

pub mod abi;
mod revert;

use crate::config::LedgerConfig;
use chrono::Utc;
use parkmarket_core::ledger::{LedgerFuture, LedgerReader, LedgerWriter};
use parkmarket_core::{
    Address, Booking, BookingId, BookingPolicy, Caller, FeeSchedule, LedgerCall, MarketError,
    Receipt, Spot, SpotId, TxHash, Units,
};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// A transaction ready to be signed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransactionRequest {
    /// Signing identity
    pub from: Address,
    /// Ledger address
    pub to: Address,
    /// Value attached to the call
    pub value: Units,
    /// ABI-encoded calldata
    pub data: Vec<u8>,
}

/// Signs and broadcasts transactions.
///
/// This is the signing context: a wallet, a remote signer, or a node that
/// manages keys. It may decline, in which case the call never reaches the
/// ledger.
pub trait TransactionSigner: Send + Sync {
    /// Signs `request` and broadcasts it, returning its hash.
    fn send_transaction(&self, request: TransactionRequest) -> LedgerFuture<'_, TxHash>;
}

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Deserialize)]
struct RpcResponse {
    result: Option<Value>,
    error: Option<RpcError>,
}

#[derive(Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcReceipt {
    status: Option<String>,
    logs: Vec<RpcLog>,
}

#[derive(Deserialize)]
struct RpcLog {
    address: String,
    topics: Vec<String>,
    data: String,
}

/// JSON-RPC transport shared by the ledger and the node signer.
#[derive(Clone)]
pub struct RpcTransport {
    http: Client,
    url: String,
    next_id: Arc<AtomicU64>,
}

impl RpcTransport {
    /// Creates a transport for `url`.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            url: url.into(),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Performs one JSON-RPC call.
    ///
    /// # Errors
    ///
    /// [`MarketError::Transport`] if the node is unreachable or answers
    /// with something other than a JSON-RPC response,
    /// [`MarketError::Reverted`] if execution reverted,
    /// [`MarketError::SignatureDeclined`] for the wallet rejection code.
    #[tracing::instrument(skip(self, params), level = "debug")]
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, MarketError> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };

        let response = self
            .http
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| MarketError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(MarketError::Transport(format!(
                "{method} returned HTTP {}",
                response.status()
            )));
        }

        let body: RpcResponse = response
            .json()
            .await
            .map_err(|e| MarketError::Transport(format!("{method}: {e}")))?;

        if let Some(error) = body.error {
            return Err(classify(error));
        }
        Ok(body.result.unwrap_or(Value::Null))
    }
}

/// EIP-1193 "user rejected request"
const USER_REJECTED: i64 = 4001;

fn classify(error: RpcError) -> MarketError {
    if error.code == USER_REJECTED {
        return MarketError::SignatureDeclined {
            reason: error.message,
        };
    }
    match error.message.strip_prefix("execution reverted") {
        Some(rest) => MarketError::Reverted {
            reason: rest.trim_start_matches(':').trim().to_string(),
        },
        None => MarketError::Transport(format!("rpc error {}: {}", error.code, error.message)),
    }
}

fn hex_bytes(value: &str) -> Result<Vec<u8>, MarketError> {
    let digits = value.strip_prefix("0x").unwrap_or(value);
    hex::decode(digits).map_err(|e| MarketError::ProtocolViolation(format!("bad hex {value:?}: {e}")))
}

fn as_str(value: &Value) -> Result<&str, MarketError> {
    value
        .as_str()
        .ok_or_else(|| MarketError::ProtocolViolation(format!("expected a hex string, got {value}")))
}

fn quantity(value: Units) -> String {
    format!("0x{:x}", value.raw())
}

/// Calls signed but not yet confirmed, kept to explain a revert.
type Submitted = HashMap<TxHash, (Caller, LedgerCall)>;

/// The marketplace ledger reached over JSON-RPC.
///
/// A revert is reported by the node without a usable reason, so the
/// ledger state behind it is read back and the rule replayed to recover
/// the typed error ([`MarketError::AuthenticationFailed`],
/// [`MarketError::InvalidState`] and so on). A revert that cannot be
/// explained stays [`MarketError::Reverted`].
#[derive(Clone)]
pub struct JsonRpcLedger {
    transport: RpcTransport,
    address: Address,
    signer: Arc<dyn TransactionSigner>,
    poll_interval: Duration,
    receipt_timeout: Duration,
    policy: BookingPolicy,
    submitted: Arc<Mutex<Submitted>>,
}

impl JsonRpcLedger {
    /// Connects to the ledger described by `config`, signing with `signer`.
    #[must_use]
    pub fn new(config: &LedgerConfig, signer: Arc<dyn TransactionSigner>) -> Self {
        Self {
            transport: RpcTransport::new(config.rpc_url.clone()),
            address: config.address,
            signer,
            poll_interval: config.receipt_poll_interval,
            receipt_timeout: config.receipt_timeout,
            policy: BookingPolicy::default(),
            submitted: Arc::default(),
        }
    }

    fn lock_submitted(&self) -> MutexGuard<'_, Submitted> {
        self.submitted.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Turns a revert of `call` into the error the ledger enforced.
    async fn explain(&self, caller: Caller, call: &LedgerCall, error: MarketError) -> MarketError {
        if !matches!(error, MarketError::Reverted { .. }) {
            return error;
        }
        match self.observe(call).await {
            Ok(observed) => match revert::replay(&caller, call, &observed, &self.policy) {
                Some(explained) => {
                    tracing::debug!(function = call.name(), %error, %explained, "Revert explained");
                    explained
                },
                None => error,
            },
            Err(read_error) => {
                tracing::debug!(%read_error, "Could not read state behind a revert");
                error
            },
        }
    }

    async fn observe(&self, call: &LedgerCall) -> Result<revert::Observed, MarketError> {
        let (booking, spot_id) = match call {
            LedgerCall::CreateSpot { .. } => (None, None),
            LedgerCall::UpdateSpot { spot_id, .. } | LedgerCall::BookSpot { spot_id, .. } => {
                (None, Some(*spot_id))
            },
            LedgerCall::CheckIn { booking_id, .. } | LedgerCall::CheckOut { booking_id, .. } => {
                let booking = self.booking(*booking_id).await?;
                let spot_id = booking.as_ref().map(|b| b.spot_id);
                (booking, spot_id)
            },
            LedgerCall::CancelBeforeCheckIn { booking_id } => {
                (self.booking(*booking_id).await?, None)
            },
        };
        let spot = match spot_id {
            Some(id) => self.spot(id).await?,
            None => None,
        };
        let fees = match call {
            LedgerCall::CheckOut { .. } => Some(self.fee_schedule().await?),
            _ => None,
        };
        Ok(revert::Observed {
            spot,
            booking,
            fees,
            now: Utc::now(),
        })
    }

    async fn view(&self, signature: &str, args: &[abi::Token]) -> Result<Vec<u8>, MarketError> {
        let data = abi::encode_call(signature, args);
        let result = self
            .transport
            .call(
                "eth_call",
                json!([{ "to": self.address.to_string(), "data": format!("0x{}", hex::encode(data)) }, "latest"]),
            )
            .await?;
        hex_bytes(as_str(&result)?)
    }

    async fn view_uint(&self, signature: &str) -> Result<u128, MarketError> {
        let data = self.view(signature, &[]).await?;
        abi::Words::new(&data).uint(0)
    }

    async fn receipt(&self, tx: TxHash) -> Result<Option<RpcReceipt>, MarketError> {
        let value = self
            .transport
            .call("eth_getTransactionReceipt", json!([tx.to_string()]))
            .await?;
        if value.is_null() {
            return Ok(None);
        }
        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| MarketError::ProtocolViolation(format!("malformed receipt: {e}")))
    }

    fn decode_receipt(&self, tx: TxHash, receipt: RpcReceipt) -> Result<Receipt, MarketError> {
        if receipt.status.as_deref() == Some("0x0") {
            return Err(MarketError::Reverted {
                reason: format!("transaction {tx} reverted"),
            });
        }

        let ledger = self.address.to_string();
        let mut events = Vec::new();
        for log in receipt.logs {
            if !log.address.eq_ignore_ascii_case(&ledger) {
                continue;
            }
            let topics = log
                .topics
                .iter()
                .map(|t| {
                    let bytes = hex_bytes(t)?;
                    <[u8; 32]>::try_from(bytes.as_slice())
                        .map_err(|_| MarketError::ProtocolViolation(format!("bad topic {t}")))
                })
                .collect::<Result<Vec<_>, _>>()?;
            if let Some(event) = abi::decode_log(&topics, &hex_bytes(&log.data)?)? {
                events.push(event);
            }
        }
        Ok(Receipt {
            tx_hash: tx,
            events,
        })
    }
}

impl LedgerReader for JsonRpcLedger {
    fn spots_count(&self) -> LedgerFuture<'_, u64> {
        Box::pin(async move {
            let count = self.view_uint(abi::views::SPOTS_COUNT).await?;
            u64::try_from(count).map_err(|_| MarketError::overflow("spots count"))
        })
    }

    fn spot(&self, id: SpotId) -> LedgerFuture<'_, Option<Spot>> {
        Box::pin(async move {
            let data = self
                .view(abi::views::SPOTS, &[abi::Token::Uint(u128::from(id.index()))])
                .await?;
            abi::decode_spot(id, &data)
        })
    }

    fn bookings_count(&self) -> LedgerFuture<'_, u64> {
        Box::pin(async move {
            let count = self.view_uint(abi::views::BOOKINGS_COUNT).await?;
            u64::try_from(count).map_err(|_| MarketError::overflow("bookings count"))
        })
    }

    fn booking(&self, id: BookingId) -> LedgerFuture<'_, Option<Booking>> {
        Box::pin(async move {
            let data = self
                .view(abi::views::BOOKINGS, &[abi::Token::Uint(u128::from(id.index()))])
                .await?;
            abi::decode_booking(id, &data)
        })
    }

    fn fee_schedule(&self) -> LedgerFuture<'_, FeeSchedule> {
        Box::pin(async move {
            let bps = self.view_uint(abi::views::FEE_BPS).await?;
            let recipient = self.view(abi::views::FEE_RECIPIENT, &[]).await?;
            let bps = u16::try_from(bps).map_err(|_| {
                MarketError::ProtocolViolation(format!("fee of {bps} basis points"))
            })?;
            FeeSchedule::new(bps, abi::Words::new(&recipient).address(0)?)
        })
    }
}

impl LedgerWriter for JsonRpcLedger {
    fn submit(&self, caller: Caller, call: LedgerCall) -> LedgerFuture<'_, TxHash> {
        Box::pin(async move {
            let request = TransactionRequest {
                from: caller.identity,
                to: self.address,
                value: call.attached_value(),
                data: abi::encode_ledger_call(&call),
            };
            tracing::debug!(function = call.name(), from = %caller.identity, "Requesting signature");
            match self.signer.send_transaction(request).await {
                Ok(tx) => {
                    self.lock_submitted().insert(tx, (caller, call));
                    Ok(tx)
                },
                // Nodes estimate gas before signing, so a doomed call
                // usually reverts here.
                Err(error) => Err(self.explain(caller, &call, error).await),
            }
        })
    }

    fn confirm(&self, tx: TxHash) -> LedgerFuture<'_, Receipt> {
        Box::pin(async move {
            let poll = async {
                loop {
                    if let Some(receipt) = self.receipt(tx).await? {
                        return self.decode_receipt(tx, receipt);
                    }
                    tokio::time::sleep(self.poll_interval).await;
                }
            };
            let outcome = tokio::time::timeout(self.receipt_timeout, poll)
                .await
                .unwrap_or_else(|_| {
                    Err(MarketError::Timeout {
                        phase: format!("polling for the receipt of {tx}"),
                    })
                });

            let submitted = self.lock_submitted().remove(&tx);
            match (outcome, submitted) {
                (Err(error), Some((caller, call))) => Err(self.explain(caller, &call, error).await),
                (outcome, _) => outcome,
            }
        })
    }
}

/// Signer for nodes that manage the caller's keys (`eth_sendTransaction`).
#[derive(Clone)]
pub struct NodeSigner {
    transport: RpcTransport,
}

impl NodeSigner {
    /// Signs through the node at `url`.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            transport: RpcTransport::new(url),
        }
    }
}

impl TransactionSigner for NodeSigner {
    fn send_transaction(&self, request: TransactionRequest) -> LedgerFuture<'_, TxHash> {
        Box::pin(async move {
            let result = self
                .transport
                .call(
                    "eth_sendTransaction",
                    json!([{
                        "from": request.from.to_string(),
                        "to": request.to.to_string(),
                        "value": quantity(request.value),
                        "data": format!("0x{}", hex::encode(&request.data)),
                    }]),
                )
                .await?;
            as_str(&result)?.parse()
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use parkmarket_core::{BookingStatus, Commitment, Secret};
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn rpc_errors_are_classified() {
        assert!(matches!(
            classify(RpcError {
                code: 3,
                message: "execution reverted: Not renter".into()
            }),
            MarketError::Reverted { reason } if reason == "Not renter"
        ));
        assert!(matches!(
            classify(RpcError {
                code: USER_REJECTED,
                message: "User rejected the request.".into()
            }),
            MarketError::SignatureDeclined { .. }
        ));
        assert!(matches!(
            classify(RpcError {
                code: -32000,
                message: "header not found".into()
            }),
            MarketError::Transport(_)
        ));
    }

    struct Declining;

    impl TransactionSigner for Declining {
        fn send_transaction(&self, _request: TransactionRequest) -> LedgerFuture<'_, TxHash> {
            Box::pin(async {
                Err(MarketError::SignatureDeclined {
                    reason: "closed the wallet".into(),
                })
            })
        }
    }

    #[tokio::test]
    async fn non_revert_errors_are_passed_through_unexplained() {
        let config = LedgerConfig {
            rpc_url: "http://127.0.0.1:9".into(),
            address: Address::from_bytes([0xaa; 20]),
            receipt_poll_interval: Duration::from_millis(10),
            receipt_timeout: Duration::from_secs(1),
        };
        let ledger = JsonRpcLedger::new(&config, Arc::new(Declining));
        let call = LedgerCall::CancelBeforeCheckIn {
            booking_id: BookingId::new(0),
        };

        let err = ledger
            .submit(Caller::new(Address::from_bytes([2; 20])), call)
            .await
            .unwrap_err();

        assert!(matches!(err, MarketError::SignatureDeclined { .. }));
        assert!(ledger.lock_submitted().is_empty());
    }

    const RENTER: Address = Address::from_bytes([2; 20]);

    fn config(url: String) -> LedgerConfig {
        LedgerConfig {
            rpc_url: url,
            address: Address::from_bytes([0xaa; 20]),
            receipt_poll_interval: Duration::from_millis(10),
            receipt_timeout: Duration::from_secs(1),
        }
    }

    fn word(value: u128) -> String {
        format!("{value:064x}")
    }

    fn address_word(address: Address) -> String {
        format!("{:0>64}", hex::encode(address.as_bytes()))
    }

    /// A node whose gas estimation reverts every transaction without a
    /// reason, and whose `eth_call` answers with the given view results.
    async fn reverting_node(views: Vec<(&'static str, String)>) -> MockServer {
        let node = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "method": "eth_sendTransaction" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": 1,
                "error": { "code": 3, "message": "execution reverted" }
            })))
            .mount(&node)
            .await;
        for (signature, result) in views {
            let selector = hex::encode(abi::selector(signature));
            Mock::given(method("POST"))
                .and(body_partial_json(json!({ "method": "eth_call" })))
                .and(move |request: &wiremock::Request| {
                    String::from_utf8_lossy(&request.body).contains(&selector)
                })
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                    "jsonrpc": "2.0",
                    "id": 1,
                    "result": format!("0x{result}")
                })))
                .mount(&node)
                .await;
        }
        node
    }

    fn ledger_on(node: &MockServer) -> JsonRpcLedger {
        JsonRpcLedger::new(&config(node.uri()), Arc::new(NodeSigner::new(node.uri())))
    }

    fn reserved_booking(status: u8) -> String {
        [
            word(0),
            address_word(RENTER),
            word(2_000),
            word(1_000),
            word(2),
            word(0),
            word(0),
            word(u128::from(status)),
        ]
        .concat()
    }

    fn listed_spot(secret: &str) -> String {
        [
            address_word(Address::from_bytes([1; 20])),
            word(1_000),
            word(1),
            hex::encode(Commitment::of(&Secret::new(secret.into())).as_bytes()),
        ]
        .concat()
    }

    async fn reverted(node: &MockServer, caller: Address, call: LedgerCall) -> MarketError {
        ledger_on(node)
            .submit(Caller::new(caller), call)
            .await
            .unwrap_err()
    }

    #[tokio::test]
    async fn revert_on_a_missing_booking_is_not_found() {
        let node = reverting_node(vec![(abi::views::BOOKINGS, word(0).repeat(8))]).await;
        let call = LedgerCall::CancelBeforeCheckIn {
            booking_id: BookingId::new(0),
        };

        assert_eq!(
            reverted(&node, RENTER, call).await,
            MarketError::booking_not_found(BookingId::new(0))
        );
    }

    #[tokio::test]
    async fn revert_on_a_wrong_secret_is_authentication_failed() {
        let node = reverting_node(vec![
            (abi::views::BOOKINGS, reserved_booking(0)),
            (abi::views::SPOTS, listed_spot("abc123")),
        ])
        .await;
        let call = LedgerCall::CheckIn {
            booking_id: BookingId::new(0),
            secret: Secret::new("wrong".into()),
        };

        let err = reverted(&node, RENTER, call).await;
        assert!(matches!(err, MarketError::AuthenticationFailed { .. }));
    }

    #[tokio::test]
    async fn revert_on_a_finished_booking_is_invalid_state() {
        let node = reverting_node(vec![
            (abi::views::BOOKINGS, reserved_booking(3)),
            (abi::views::SPOTS, listed_spot("abc123")),
        ])
        .await;
        let call = LedgerCall::CheckIn {
            booking_id: BookingId::new(0),
            secret: Secret::new("abc123".into()),
        };

        let err = reverted(&node, RENTER, call).await;
        assert!(matches!(
            err,
            MarketError::InvalidState {
                status: BookingStatus::Cancelled,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn revert_by_a_stranger_is_unauthorized() {
        let node = reverting_node(vec![(abi::views::BOOKINGS, reserved_booking(0))]).await;
        let call = LedgerCall::CancelBeforeCheckIn {
            booking_id: BookingId::new(0),
        };

        let err = reverted(&node, Address::from_bytes([9; 20]), call).await;
        assert!(matches!(err, MarketError::Unauthorized { .. }));
    }

    #[tokio::test]
    async fn revert_on_a_short_deposit_is_a_value_mismatch() {
        let node = reverting_node(vec![(abi::views::SPOTS, listed_spot("abc123"))]).await;
        let call = LedgerCall::BookSpot {
            spot_id: SpotId::new(0),
            max_hours: 3,
            deposit: Units::new(2_000),
        };

        let err = reverted(&node, RENTER, call).await;
        assert!(matches!(err, MarketError::ValueMismatch { .. }));
    }

    #[tokio::test]
    async fn unexplained_revert_stays_reverted() {
        let node = reverting_node(vec![]).await;
        let call = LedgerCall::CreateSpot {
            rate_per_hour: Units::new(1_000),
            commitment: Commitment::of(&Secret::new("abc123".into())),
        };

        let err = reverted(&node, RENTER, call).await;
        assert!(matches!(err, MarketError::Reverted { .. }));
    }

    #[test]
    fn quantities_are_minimal_hex() {
        assert_eq!(quantity(Units::new(0)), "0x0");
        assert_eq!(quantity(Units::new(255)), "0xff");
    }

    #[test]
    fn reverted_receipt_is_an_error_and_foreign_logs_are_skipped() {
        let config = LedgerConfig {
            rpc_url: "http://localhost:8545".into(),
            address: Address::from_bytes([0xaa; 20]),
            receipt_poll_interval: Duration::from_millis(10),
            receipt_timeout: Duration::from_secs(1),
        };
        let ledger = JsonRpcLedger::new(&config, Arc::new(NodeSigner::new("http://localhost:8545")));
        let tx = TxHash::from_bytes([1; 32]);

        let reverted = RpcReceipt {
            status: Some("0x0".into()),
            logs: vec![],
        };
        assert!(matches!(
            ledger.decode_receipt(tx, reverted),
            Err(MarketError::Reverted { .. })
        ));

        let foreign = RpcReceipt {
            status: Some("0x1".into()),
            logs: vec![RpcLog {
                address: "0x00000000000000000000000000000000000000bb".into(),
                topics: vec![format!("0x{}", hex::encode([0u8; 32]))],
                data: "0x".into(),
            }],
        };
        assert!(ledger.decode_receipt(tx, foreign).unwrap().events.is_empty());
    }
}
