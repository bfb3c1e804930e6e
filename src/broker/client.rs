// =============================================================================
// Broker REST Client — session-token auth with transparent refresh
// =============================================================================
//
// The only place that knows the broker's endpoint paths and payload shapes;
// the rest of the engine sees typed operations. Every call is classified into
// the engine error taxonomy and retried per policy (3 attempts, jittered
// exponential backoff) before surfacing.
//
// SECURITY: the API key is never logged or serialized. The session token is
// guarded by an async mutex; refresh is serialized and any waiting call sees
// the new token on release.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, instrument, warn};

use crate::broker::classify::{backoff_delay, classify_request_error, classify_status, MAX_ATTEMPTS};
use crate::error::{EngineError, EngineResult};
use crate::market_data::{Bar, Timeframe};
use crate::orders::Order;
use crate::types::{Account, Contract, OrderStatus, OrderType, Side};

/// Request timeout for every broker call.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Refresh the token this long before its stated expiry.
const TOKEN_REFRESH_MARGIN: chrono::Duration = chrono::Duration::seconds(60);

/// Built-in point values for the common CME micro/full contracts. Used as a
/// fallback and reconciled against broker contract metadata at startup; the
/// broker value wins when the two disagree.
const BUILTIN_POINT_VALUES: &[(&str, f64, f64)] = &[
    // (symbol, point value, tick size)
    ("MNQ", 2.0, 0.25),
    ("NQ", 20.0, 0.25),
    ("MES", 5.0, 0.25),
    ("ES", 50.0, 0.25),
    ("MGC", 10.0, 0.10),
    ("GC", 100.0, 0.10),
    ("MCL", 100.0, 0.01),
    ("CL", 1000.0, 0.01),
];

/// Look up the built-in (point value, tick size) for a symbol.
pub fn builtin_contract_meta(symbol: &str) -> Option<(f64, f64)> {
    BUILTIN_POINT_VALUES
        .iter()
        .find(|(s, _, _)| *s == symbol)
        .map(|(_, pv, ts)| (*pv, *ts))
}

/// Latency/outcome record for one REST call, persisted via the task queue.
#[derive(Debug, Clone)]
pub struct ApiCallMetric {
    pub endpoint: String,
    pub latency_ms: u64,
    pub outcome: String,
    pub at: DateTime<Utc>,
}

/// Broker-reported net position.
#[derive(Debug, Clone)]
pub struct BrokerPosition {
    pub symbol: String,
    /// Signed contracts: positive long, negative short.
    pub size: i64,
    pub average_price: f64,
}

/// Broker-reported balance snapshot.
#[derive(Debug, Clone)]
pub struct AccountBalance {
    pub balance: f64,
    pub realized_pnl: f64,
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub api_key: String,
}

struct SessionToken {
    token: String,
    expires_at: DateTime<Utc>,
}

/// REST adapter for the prop-firm broker.
pub struct BrokerClient {
    http: reqwest::Client,
    base_url: String,
    credentials: Credentials,
    token: Mutex<Option<SessionToken>>,
    contracts: RwLock<HashMap<String, Contract>>,
    contract_lookups: AtomicU64,
    metrics_tx: RwLock<Option<mpsc::UnboundedSender<ApiCallMetric>>>,
}

impl BrokerClient {
    pub fn new(base_url: impl Into<String>, credentials: Credentials) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("failed to build reqwest client");

        Self {
            http,
            base_url: base_url.into(),
            credentials,
            token: Mutex::new(None),
            contracts: RwLock::new(HashMap::new()),
            contract_lookups: AtomicU64::new(0),
            metrics_tx: RwLock::new(None),
        }
    }

    /// Route per-call latency metrics to a channel (drained into the store).
    pub fn set_metrics_sink(&self, tx: mpsc::UnboundedSender<ApiCallMetric>) {
        *self.metrics_tx.write() = Some(tx);
    }

    /// Number of wire lookups performed by `resolve_contract` (cache misses).
    pub fn contract_lookup_count(&self) -> u64 {
        self.contract_lookups.load(Ordering::Relaxed)
    }

    /// Pre-populate the contract cache (e.g. from `list_contracts` at
    /// startup).
    pub fn prime_contract_cache(&self, contracts: &[Contract]) {
        let mut cache = self.contracts.write();
        for c in contracts {
            cache.insert(c.symbol.clone(), c.clone());
        }
    }

    // -------------------------------------------------------------------------
    // Auth
    // -------------------------------------------------------------------------

    /// Log in and cache the session token. Called lazily by every operation;
    /// callable eagerly at startup to fail fast on bad credentials.
    #[instrument(skip(self), name = "broker::authenticate")]
    pub async fn authenticate(&self) -> EngineResult<()> {
        let mut guard = self.token.lock().await;
        self.login_locked(&mut guard).await
    }

    /// Obtain a valid token, refreshing when absent or near expiry. The
    /// mutex serializes refresh; concurrent callers wait and reuse the
    /// fresh token.
    async fn ensure_token(&self, force: bool) -> EngineResult<String> {
        let mut guard = self.token.lock().await;

        let needs_refresh = force
            || match guard.as_ref() {
                None => true,
                Some(t) => Utc::now() + TOKEN_REFRESH_MARGIN >= t.expires_at,
            };

        if needs_refresh {
            self.login_locked(&mut guard).await?;
        }

        Ok(guard.as_ref().expect("token set by login").token.clone())
    }

    async fn login_locked(&self, slot: &mut Option<SessionToken>) -> EngineResult<()> {
        let body = json!({
            "userName": self.credentials.username,
            "apiKey": self.credentials.api_key,
        });

        let resp = self
            .raw_call("POST", "/api/auth/login", Some(&body), None)
            .await?;

        let token = resp["token"]
            .as_str()
            .ok_or_else(|| EngineError::Transient("login response missing token".into()))?
            .to_string();
        let expires_in = resp["expiresInSeconds"].as_i64().unwrap_or(86_400);

        *slot = Some(SessionToken {
            token,
            expires_at: Utc::now() + chrono::Duration::seconds(expires_in),
        });

        info!(expires_in, "broker session authenticated");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Request core
    // -------------------------------------------------------------------------

    /// Authenticated call with classification, retry, and one-shot auth
    /// refresh.
    async fn request(&self, method: &str, path: &str, body: Option<&Value>) -> EngineResult<Value> {
        let mut attempt: u32 = 0;
        let mut auth_refreshed = false;

        loop {
            let token = self.ensure_token(false).await?;
            let started = Instant::now();
            let result = self.raw_call(method, path, body, Some(&token)).await;
            self.record_metric(path, started.elapsed(), &result);

            match result {
                Ok(v) => return Ok(v),
                Err(EngineError::AuthExpired) if !auth_refreshed => {
                    debug!(path, "token expired mid-call — refreshing once");
                    self.ensure_token(true).await?;
                    auth_refreshed = true;
                }
                Err(e) if e.is_retryable() && attempt + 1 < MAX_ATTEMPTS => {
                    let hint = match &e {
                        EngineError::RateLimited { retry_after } => *retry_after,
                        _ => None,
                    };
                    let delay = backoff_delay(attempt, hint);
                    warn!(path, attempt, kind = e.kind(), delay_ms = delay.as_millis() as u64, "broker call failed — retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One HTTP round trip, classified but not retried.
    async fn raw_call(
        &self,
        method: &str,
        path: &str,
        body: Option<&Value>,
        bearer: Option<&str>,
    ) -> EngineResult<Value> {
        let url = format!("{}{}", self.base_url, path);

        let mut req = match method {
            "GET" => self.http.get(&url),
            "POST" => self.http.post(&url),
            "DELETE" => self.http.delete(&url),
            other => {
                return Err(EngineError::Invariant(format!("unsupported method {other}")))
            }
        };
        if let Some(token) = bearer {
            req = req.bearer_auth(token);
        }
        if let Some(b) = body {
            req = req.json(b);
        }

        let resp = req.send().await.map_err(|e| classify_request_error(&e))?;

        let status = resp.status();
        let retry_after = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs);

        let parsed: Value = resp.json().await.unwrap_or(Value::Null);

        if status.is_success() {
            Ok(parsed)
        } else {
            Err(classify_status(status, retry_after, &parsed))
        }
    }

    fn record_metric(&self, endpoint: &str, latency: Duration, result: &EngineResult<Value>) {
        let tx = self.metrics_tx.read();
        if let Some(tx) = tx.as_ref() {
            let outcome = match result {
                Ok(_) => "ok".to_string(),
                Err(e) => e.kind().to_string(),
            };
            let _ = tx.send(ApiCallMetric {
                endpoint: endpoint.to_string(),
                latency_ms: latency.as_millis() as u64,
                outcome,
                at: Utc::now(),
            });
        }
    }

    // -------------------------------------------------------------------------
    // Accounts & contracts
    // -------------------------------------------------------------------------

    #[instrument(skip(self), name = "broker::list_accounts")]
    pub async fn list_accounts(&self) -> EngineResult<Vec<Account>> {
        let resp = self.request("GET", "/api/accounts", None).await?;
        let raw = resp
            .as_array()
            .ok_or_else(|| EngineError::Transient("accounts response is not an array".into()))?;

        let mut accounts = Vec::with_capacity(raw.len());
        for a in raw {
            accounts.push(Account {
                id: a["id"].as_str().unwrap_or_default().to_string(),
                name: a["name"].as_str().unwrap_or_default().to_string(),
                account_type: serde_json::from_value(a["type"].clone()).unwrap_or_default(),
                starting_balance: a["startingBalance"].as_f64().unwrap_or(0.0),
            });
        }
        debug!(count = accounts.len(), "accounts listed");
        Ok(accounts)
    }

    #[instrument(skip(self), name = "broker::list_contracts")]
    pub async fn list_contracts(&self) -> EngineResult<Vec<Contract>> {
        let resp = self.request("GET", "/api/contracts", None).await?;
        let raw = resp
            .as_array()
            .ok_or_else(|| EngineError::Transient("contracts response is not an array".into()))?;

        let contracts: Vec<Contract> = raw.iter().map(parse_contract).collect();

        // Reconcile against the built-in table; the broker wins but we want
        // to know when they disagree.
        for c in &contracts {
            if let Some((pv, _)) = builtin_contract_meta(&c.symbol) {
                if (pv - c.point_value).abs() > f64::EPSILON {
                    warn!(
                        symbol = %c.symbol,
                        builtin = pv,
                        broker = c.point_value,
                        "point value disagrees with built-in table — using broker value"
                    );
                }
            }
        }

        debug!(count = contracts.len(), "contracts listed");
        Ok(contracts)
    }

    /// Translate a user-facing symbol to broker contract metadata. Cached
    /// indefinitely after first resolution: N calls cost exactly one wire
    /// lookup.
    #[instrument(skip(self), name = "broker::resolve_contract")]
    pub async fn resolve_contract(&self, symbol: &str) -> EngineResult<Contract> {
        if let Some(c) = self.contracts.read().get(symbol) {
            return Ok(c.clone());
        }

        self.contract_lookups.fetch_add(1, Ordering::Relaxed);
        let path = format!("/api/contracts/search?symbol={symbol}");
        let resp = self.request("GET", &path, None).await?;

        let raw = resp
            .as_array()
            .and_then(|arr| arr.first())
            .ok_or_else(|| EngineError::NotFound(format!("contract for {symbol}")))?;

        let contract = parse_contract(raw);
        self.contracts
            .write()
            .insert(symbol.to_string(), contract.clone());

        info!(symbol, contract_id = %contract.contract_id, "contract resolved");
        Ok(contract)
    }

    // -------------------------------------------------------------------------
    // Orders
    // -------------------------------------------------------------------------

    /// Submit a single order. Returns the broker-assigned order id.
    #[allow(clippy::too_many_arguments)]
    #[instrument(skip(self, limit_price, stop_price, custom_tag), name = "broker::place_order")]
    pub async fn place_order(
        &self,
        account_id: &str,
        contract_id: &str,
        side: Side,
        order_type: OrderType,
        size: u32,
        limit_price: Option<f64>,
        stop_price: Option<f64>,
        custom_tag: &str,
    ) -> EngineResult<String> {
        let body = json!({
            "accountId": account_id,
            "contractId": contract_id,
            "side": side_str(side),
            "type": order_type_str(order_type),
            "size": size,
            "limitPrice": limit_price,
            "stopPrice": stop_price,
            "customTag": custom_tag,
        });

        let resp = self.request("POST", "/api/orders", Some(&body)).await?;
        let order_id = order_id_from(&resp)?;

        info!(order_id = %order_id, side = %side, size, "order placed");
        Ok(order_id)
    }

    /// Submit a native atomic bracket (entry + stop + target). The broker
    /// rejects with code `BRACKETS_DISABLED` when the account-level toggle is
    /// off; callers fall back to `place_order` + post-fill bracketing.
    #[allow(clippy::too_many_arguments)]
    #[instrument(skip(self, entry_price, stop_loss_price, take_profit_price, custom_tag), name = "broker::place_bracket")]
    pub async fn place_bracket(
        &self,
        account_id: &str,
        contract_id: &str,
        side: Side,
        entry_type: OrderType,
        size: u32,
        entry_price: Option<f64>,
        stop_loss_price: f64,
        take_profit_price: f64,
        custom_tag: &str,
    ) -> EngineResult<String> {
        let body = json!({
            "accountId": account_id,
            "contractId": contract_id,
            "side": side_str(side),
            "entryType": order_type_str(entry_type),
            "size": size,
            "entryPrice": entry_price,
            "stopLossPrice": stop_loss_price,
            "takeProfitPrice": take_profit_price,
            "customTag": custom_tag,
        });

        let resp = self
            .request("POST", "/api/orders/bracket", Some(&body))
            .await?;
        let order_id = order_id_from(&resp)?;

        info!(order_id = %order_id, side = %side, size, "bracket placed");
        Ok(order_id)
    }

    #[instrument(skip(self, price, size), name = "broker::modify_order")]
    pub async fn modify_order(
        &self,
        order_id: &str,
        price: Option<f64>,
        size: Option<u32>,
    ) -> EngineResult<()> {
        let body = json!({ "price": price, "size": size });
        let path = format!("/api/orders/{order_id}/modify");
        self.request("POST", &path, Some(&body)).await?;
        debug!(order_id, "order modified");
        Ok(())
    }

    #[instrument(skip(self), name = "broker::cancel_order")]
    pub async fn cancel_order(&self, order_id: &str) -> EngineResult<()> {
        let path = format!("/api/orders/{order_id}");
        self.request("DELETE", &path, None).await?;
        debug!(order_id, "order cancelled");
        Ok(())
    }

    #[instrument(skip(self), name = "broker::get_order")]
    pub async fn get_order(&self, order_id: &str) -> EngineResult<Order> {
        let path = format!("/api/orders/{order_id}");
        let resp = self.request("GET", &path, None).await?;
        parse_order(&resp)
    }

    #[instrument(skip(self), name = "broker::list_open_orders")]
    pub async fn list_open_orders(&self, account_id: &str) -> EngineResult<Vec<Order>> {
        let path = format!("/api/accounts/{account_id}/orders?open=true");
        let resp = self.request("GET", &path, None).await?;
        let raw = resp
            .as_array()
            .ok_or_else(|| EngineError::Transient("orders response is not an array".into()))?;

        raw.iter().map(parse_order).collect()
    }

    #[instrument(skip(self), name = "broker::list_open_positions")]
    pub async fn list_open_positions(&self, account_id: &str) -> EngineResult<Vec<BrokerPosition>> {
        let path = format!("/api/accounts/{account_id}/positions");
        let resp = self.request("GET", &path, None).await?;
        let raw = resp
            .as_array()
            .ok_or_else(|| EngineError::Transient("positions response is not an array".into()))?;

        let positions = raw
            .iter()
            .map(|p| BrokerPosition {
                symbol: p["symbol"].as_str().unwrap_or_default().to_string(),
                size: p["size"].as_i64().unwrap_or(0),
                average_price: p["averagePrice"].as_f64().unwrap_or(0.0),
            })
            .collect();
        Ok(positions)
    }

    #[instrument(skip(self), name = "broker::get_account_balance")]
    pub async fn get_account_balance(&self, account_id: &str) -> EngineResult<AccountBalance> {
        let path = format!("/api/accounts/{account_id}/balance");
        let resp = self.request("GET", &path, None).await?;
        Ok(AccountBalance {
            balance: resp["balance"].as_f64().unwrap_or(0.0),
            realized_pnl: resp["realizedPnl"].as_f64().unwrap_or(0.0),
        })
    }

    // -------------------------------------------------------------------------
    // Historical bars
    // -------------------------------------------------------------------------

    #[instrument(skip(self, start, end), name = "broker::get_historical_bars")]
    pub async fn get_historical_bars(
        &self,
        contract_id: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> EngineResult<Vec<Bar>> {
        let (unit, number) = timeframe_params(timeframe);
        let path = format!(
            "/api/bars?contractId={contract_id}&unit={unit}&unitNumber={number}&start={}&end={}",
            start.to_rfc3339(),
            end.to_rfc3339()
        );
        let resp = self.request("GET", &path, None).await?;

        let raw = resp
            .as_array()
            .ok_or_else(|| EngineError::Transient("bars response is not an array".into()))?;

        let mut bars = Vec::with_capacity(raw.len());
        for entry in raw {
            let ts = entry["t"]
                .as_str()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&Utc));
            let Some(open_time) = ts else {
                warn!("skipping bar entry with missing/invalid timestamp");
                continue;
            };
            bars.push(Bar {
                open_time,
                open: entry["o"].as_f64().unwrap_or(0.0),
                high: entry["h"].as_f64().unwrap_or(0.0),
                low: entry["l"].as_f64().unwrap_or(0.0),
                close: entry["c"].as_f64().unwrap_or(0.0),
                volume: entry["v"].as_f64().unwrap_or(0.0),
            });
        }
        bars.sort_by_key(|b| b.open_time);

        debug!(contract_id, timeframe = %timeframe, count = bars.len(), "historical bars fetched");
        Ok(bars)
    }
}

impl std::fmt::Debug for BrokerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerClient")
            .field("base_url", &self.base_url)
            .field("username", &self.credentials.username)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Wire-format helpers
// ---------------------------------------------------------------------------

fn side_str(side: Side) -> &'static str {
    match side {
        Side::Buy => "Buy",
        Side::Sell => "Sell",
    }
}

fn order_type_str(t: OrderType) -> &'static str {
    match t {
        OrderType::Market => "Market",
        OrderType::Limit => "Limit",
        OrderType::Stop => "Stop",
        OrderType::StopLimit => "StopLimit",
    }
}

fn order_id_from(resp: &Value) -> EngineResult<String> {
    resp["orderId"]
        .as_str()
        .map(str::to_string)
        .or_else(|| resp["orderId"].as_u64().map(|n| n.to_string()))
        .ok_or_else(|| EngineError::Transient("order response missing orderId".into()))
}

fn parse_contract(v: &Value) -> Contract {
    Contract {
        symbol: v["symbol"].as_str().unwrap_or_default().to_string(),
        contract_id: v["contractId"].as_str().unwrap_or_default().to_string(),
        point_value: v["pointValue"].as_f64().unwrap_or(0.0),
        tick_size: v["tickSize"].as_f64().unwrap_or(0.0),
    }
}

fn parse_side(s: &str) -> EngineResult<Side> {
    match s {
        "Buy" => Ok(Side::Buy),
        "Sell" => Ok(Side::Sell),
        other => Err(EngineError::Transient(format!("unknown side '{other}'"))),
    }
}

fn parse_order_type(s: &str) -> EngineResult<OrderType> {
    match s {
        "Market" => Ok(OrderType::Market),
        "Limit" => Ok(OrderType::Limit),
        "Stop" => Ok(OrderType::Stop),
        "StopLimit" => Ok(OrderType::StopLimit),
        other => Err(EngineError::Transient(format!("unknown order type '{other}'"))),
    }
}

fn parse_status(s: &str) -> EngineResult<OrderStatus> {
    match s {
        "Pending" => Ok(OrderStatus::Pending),
        "Working" => Ok(OrderStatus::Working),
        "Filled" => Ok(OrderStatus::Filled),
        "PartiallyFilled" => Ok(OrderStatus::PartiallyFilled),
        "Cancelled" => Ok(OrderStatus::Cancelled),
        "Rejected" => Ok(OrderStatus::Rejected),
        other => Err(EngineError::Transient(format!("unknown status '{other}'"))),
    }
}

fn parse_order(v: &Value) -> EngineResult<Order> {
    Ok(Order {
        id: v["id"]
            .as_str()
            .map(str::to_string)
            .or_else(|| v["id"].as_u64().map(|n| n.to_string()))
            .ok_or_else(|| EngineError::Transient("order missing id".into()))?,
        account_id: v["accountId"].as_str().unwrap_or_default().to_string(),
        symbol: v["symbol"].as_str().unwrap_or_default().to_string(),
        side: parse_side(v["side"].as_str().unwrap_or_default())?,
        order_type: parse_order_type(v["type"].as_str().unwrap_or_default())?,
        size: v["size"].as_u64().unwrap_or(0) as u32,
        limit_price: v["limitPrice"].as_f64(),
        stop_price: v["stopPrice"].as_f64(),
        status: parse_status(v["status"].as_str().unwrap_or_default())?,
        parent_id: v["parentId"].as_str().map(str::to_string),
        custom_tag: v["customTag"].as_str().map(str::to_string),
        filled_size: v["filledSize"].as_u64().unwrap_or(0) as u32,
        fill_price: v["fillPrice"].as_f64(),
    })
}

/// Map a timeframe onto the broker's (unit, unitNumber) pair.
fn timeframe_params(tf: Timeframe) -> (&'static str, u64) {
    let secs = tf.secs();
    if secs % 86_400 == 0 {
        ("Day", secs / 86_400)
    } else if secs % 3_600 == 0 {
        ("Hour", secs / 3_600)
    } else if secs % 60 == 0 {
        ("Minute", secs / 60)
    } else {
        ("Second", secs)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> BrokerClient {
        BrokerClient::new(
            "https://broker.test",
            Credentials {
                username: "user".into(),
                api_key: "s3cr3t".into(),
            },
        )
    }

    #[test]
    fn builtin_point_values_cover_micros() {
        assert_eq!(builtin_contract_meta("MNQ"), Some((2.0, 0.25)));
        assert_eq!(builtin_contract_meta("ES"), Some((50.0, 0.25)));
        assert_eq!(builtin_contract_meta("MCL"), Some((100.0, 0.01)));
        assert_eq!(builtin_contract_meta("ZZZ"), None);
    }

    #[test]
    fn timeframe_mapping() {
        assert_eq!(timeframe_params(Timeframe::M1), ("Minute", 1));
        assert_eq!(timeframe_params(Timeframe::M5), ("Minute", 5));
        assert_eq!(timeframe_params(Timeframe::H1), ("Hour", 1));
        assert_eq!(timeframe_params(Timeframe::D1), ("Day", 1));
    }

    #[test]
    fn parse_order_round_trip() {
        let v = json!({
            "id": "ord-42",
            "accountId": "acct-1",
            "symbol": "MNQ",
            "side": "Buy",
            "type": "Stop",
            "size": 2,
            "stopPrice": 21425.25,
            "status": "Working",
            "customTag": "overnight-acct-1-MNQ-7",
            "filledSize": 0
        });
        let order = parse_order(&v).unwrap();
        assert_eq!(order.id, "ord-42");
        assert_eq!(order.side, Side::Buy);
        assert_eq!(order.order_type, OrderType::Stop);
        assert_eq!(order.status, OrderStatus::Working);
        assert_eq!(order.stop_price, Some(21425.25));
        assert_eq!(order.custom_tag.as_deref(), Some("overnight-acct-1-MNQ-7"));
    }

    #[test]
    fn parse_order_numeric_id() {
        let v = json!({
            "id": 1234,
            "side": "Sell",
            "type": "Market",
            "status": "Filled",
            "size": 1,
            "fillPrice": 21010.0
        });
        let order = parse_order(&v).unwrap();
        assert_eq!(order.id, "1234");
        assert_eq!(order.fill_price, Some(21010.0));
    }

    #[test]
    fn parse_order_rejects_unknown_vocabulary() {
        let v = json!({ "id": "x", "side": "Hold", "type": "Market", "status": "Working", "size": 1 });
        assert!(parse_order(&v).is_err());
    }

    #[tokio::test]
    async fn primed_contract_cache_avoids_wire_lookup() {
        let c = client();
        c.prime_contract_cache(&[Contract {
            symbol: "MNQ".into(),
            contract_id: "CON.F.US.MNQ.H26".into(),
            point_value: 2.0,
            tick_size: 0.25,
        }]);

        // Resolves from cache with zero network activity against the fake
        // base URL, and the lookup counter stays at zero.
        let resolved = c.resolve_contract("MNQ").await.unwrap();
        assert_eq!(resolved.contract_id, "CON.F.US.MNQ.H26");
        assert_eq!(c.contract_lookup_count(), 0);
    }

    #[test]
    fn debug_redacts_credentials() {
        let formatted = format!("{:?}", client());
        assert!(formatted.contains("<redacted>"));
        assert!(!formatted.contains("s3cr3t"));
    }
}
