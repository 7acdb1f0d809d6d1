// =============================================================================
// Broker WebSocket Client — realtime trade/orderbook/VI/fill notifications
// =============================================================================
//
// One persistent connection carries every subscribed stream. On disconnect
// the client reconnects with exponential backoff (capped at 60 s, at most 30
// attempts) and replays every active subscription.
//
// Frame formats:
//   - Realtime data: first byte '0' or '1' (encryption flag), then
//     `encrypted|tr_id|count|data` pipe-delimited, with `data` a
//     caret-separated field list in the broker's documented order.
//   - Everything else is JSON: subscription acks, errors, and PINGPONG
//     heartbeats which must be echoed back verbatim.
//
// Encrypted frames (flag "1") are skipped; the AES key handling for them is
// not wired up.
// =============================================================================

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

// Stream transaction ids.
pub const TR_EXECUTION: &str = "H0STCNT0";
pub const TR_ORDERBOOK: &str = "H0STASP0";
pub const TR_VI: &str = "H0STVI0";
pub const TR_ORDER_NOTICE: &str = "H0STCNC0";

const MAX_RECONNECTS: u32 = 30;
const MAX_BACKOFF_SECONDS: u64 = 60;
/// Pause between subscription replays after a reconnect, to avoid a burst.
const RESTORE_SEND_DELAY: Duration = Duration::from_millis(100);

/// Named fields parsed out of one realtime frame.
pub type FieldMap = HashMap<String, String>;

/// Callback invoked with the parsed fields of a realtime frame.
pub type MessageCallback = Arc<dyn Fn(FieldMap) + Send + Sync>;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Persistent realtime client for the broker websocket.
pub struct KisWsClient {
    approval_key: String,
    url: String,
    /// tr_id -> set of subscribed tr_keys (stock codes, or "" for account
    /// streams).
    subscriptions: parking_lot::Mutex<HashMap<String, BTreeSet<String>>>,
    callbacks: parking_lot::RwLock<HashMap<String, MessageCallback>>,
    sink: tokio::sync::Mutex<Option<WsSink>>,
    running: AtomicBool,
    reconnect_count: AtomicU32,
}

impl KisWsClient {
    pub fn new(approval_key: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            approval_key: approval_key.into(),
            url: url.into(),
            subscriptions: parking_lot::Mutex::new(HashMap::new()),
            callbacks: parking_lot::RwLock::new(HashMap::new()),
            sink: tokio::sync::Mutex::new(None),
            running: AtomicBool::new(false),
            reconnect_count: AtomicU32::new(0),
        }
    }

    // -------------------------------------------------------------------------
    // Connection loop
    // -------------------------------------------------------------------------

    /// Connect and enter the receive loop.
    ///
    /// Runs until `disconnect()` is called or the reconnect budget is
    /// exhausted. Intended to be spawned as a background task.
    pub async fn run(self: Arc<Self>) {
        self.running.store(true, Ordering::SeqCst);

        while self.running.load(Ordering::SeqCst)
            && self.reconnect_count.load(Ordering::SeqCst) < MAX_RECONNECTS
        {
            match connect_async(&self.url).await {
                Ok((stream, _resp)) => {
                    info!(url = %self.url, "websocket connected");
                    self.reconnect_count.store(0, Ordering::SeqCst);

                    let (sink, mut read) = stream.split();
                    *self.sink.lock().await = Some(sink);

                    self.restore_subscriptions().await;

                    while let Some(frame) = read.next().await {
                        if !self.running.load(Ordering::SeqCst) {
                            break;
                        }
                        match frame {
                            Ok(Message::Text(text)) => self.handle_message(&text).await,
                            Ok(Message::Ping(payload)) => {
                                let mut sink = self.sink.lock().await;
                                if let Some(ws) = sink.as_mut() {
                                    let _ = ws.send(Message::Pong(payload)).await;
                                }
                            }
                            Ok(Message::Close(_)) => {
                                warn!("websocket closed by peer");
                                break;
                            }
                            Ok(_) => {}
                            Err(e) => {
                                warn!(error = %e, "websocket read error");
                                break;
                            }
                        }
                    }

                    *self.sink.lock().await = None;
                }
                Err(e) => {
                    warn!(error = %e, "websocket connect failed");
                }
            }

            if !self.running.load(Ordering::SeqCst) {
                info!("websocket shutdown requested");
                break;
            }

            let attempt = self.reconnect_count.fetch_add(1, Ordering::SeqCst) + 1;
            let wait = (1u64 << attempt.min(6)).min(MAX_BACKOFF_SECONDS);
            warn!(
                reconnect_attempt = attempt,
                max_reconnects = MAX_RECONNECTS,
                wait_seconds = wait,
                "websocket disconnected; reconnecting"
            );
            tokio::time::sleep(Duration::from_secs(wait)).await;
        }

        if self.reconnect_count.load(Ordering::SeqCst) >= MAX_RECONNECTS {
            error!(
                reconnect_count = MAX_RECONNECTS,
                "websocket reconnect budget exhausted; realtime feed is down"
            );
        }
    }

    /// Request a graceful shutdown of the receive loop.
    pub async fn disconnect(&self) {
        self.running.store(false, Ordering::SeqCst);
        let mut sink = self.sink.lock().await;
        if let Some(ws) = sink.as_mut() {
            let _ = ws.send(Message::Close(None)).await;
        }
        *sink = None;
        info!("websocket disconnected gracefully");
    }

    // -------------------------------------------------------------------------
    // Subscriptions
    // -------------------------------------------------------------------------

    fn subscription_message(&self, tr_id: &str, tr_key: &str, tr_type: &str) -> String {
        json!({
            "header": {
                "approval_key": self.approval_key,
                "custtype": "P",
                "tr_type": tr_type,
                "content-type": "utf-8",
            },
            "body": {
                "input": {
                    "tr_id": tr_id,
                    "tr_key": tr_key,
                },
            },
        })
        .to_string()
    }

    /// Subscribe to a stream. `tr_key` is a stock code, or "" for
    /// account-scoped streams.
    pub async fn subscribe(&self, tr_id: &str, tr_key: &str) -> Result<()> {
        let msg = self.subscription_message(tr_id, tr_key, "1");

        let mut sink = self.sink.lock().await;
        let Some(ws) = sink.as_mut() else {
            bail!("websocket not connected; cannot subscribe {tr_id}/{tr_key}");
        };
        ws.send(Message::Text(msg)).await?;
        drop(sink);

        self.subscriptions
            .lock()
            .entry(tr_id.to_string())
            .or_default()
            .insert(tr_key.to_string());

        info!(tr_id, tr_key, "websocket subscribed");
        Ok(())
    }

    /// Unsubscribe from a stream.
    pub async fn unsubscribe(&self, tr_id: &str, tr_key: &str) -> Result<()> {
        let msg = self.subscription_message(tr_id, tr_key, "2");

        let mut sink = self.sink.lock().await;
        let Some(ws) = sink.as_mut() else {
            return Ok(());
        };
        ws.send(Message::Text(msg)).await?;
        drop(sink);

        let mut subs = self.subscriptions.lock();
        if let Some(keys) = subs.get_mut(tr_id) {
            keys.remove(tr_key);
            if keys.is_empty() {
                subs.remove(tr_id);
            }
        }

        info!(tr_id, tr_key, "websocket unsubscribed");
        Ok(())
    }

    /// Replay every recorded subscription after a reconnect.
    async fn restore_subscriptions(&self) {
        let snapshot: Vec<(String, String)> = {
            let subs = self.subscriptions.lock();
            subs.iter()
                .flat_map(|(tr_id, keys)| {
                    keys.iter().map(move |k| (tr_id.clone(), k.clone()))
                })
                .collect()
        };

        if snapshot.is_empty() {
            return;
        }

        for (tr_id, tr_key) in &snapshot {
            let msg = self.subscription_message(tr_id, tr_key, "1");
            let mut sink = self.sink.lock().await;
            if let Some(ws) = sink.as_mut() {
                if let Err(e) = ws.send(Message::Text(msg)).await {
                    warn!(tr_id = %tr_id, tr_key = %tr_key, error = %e, "subscription restore failed");
                }
            }
            drop(sink);
            tokio::time::sleep(RESTORE_SEND_DELAY).await;
        }

        info!(total_subscriptions = snapshot.len(), "subscriptions restored");
    }

    // Convenience wrappers for the four streams the engine uses.

    pub async fn subscribe_execution(&self, stock_code: &str) -> Result<()> {
        self.subscribe(TR_EXECUTION, stock_code).await
    }

    pub async fn subscribe_orderbook(&self, stock_code: &str) -> Result<()> {
        self.subscribe(TR_ORDERBOOK, stock_code).await
    }

    pub async fn subscribe_vi(&self, stock_code: &str) -> Result<()> {
        self.subscribe(TR_VI, stock_code).await
    }

    /// Order fill notifications are account-scoped: empty tr_key.
    pub async fn subscribe_order_notice(&self) -> Result<()> {
        self.subscribe(TR_ORDER_NOTICE, "").await
    }

    // -------------------------------------------------------------------------
    // Callback registration
    // -------------------------------------------------------------------------

    /// Register (or replace) the callback for a tr_id.
    pub fn register_callback(&self, tr_id: &str, callback: MessageCallback) {
        self.callbacks.write().insert(tr_id.to_string(), callback);
        info!(tr_id, "websocket callback registered");
    }

    // -------------------------------------------------------------------------
    // Message handling
    // -------------------------------------------------------------------------

    async fn handle_message(&self, raw: &str) {
        if raw.is_empty() {
            return;
        }

        // Realtime data: first byte is the encryption flag.
        if raw.starts_with('0') || raw.starts_with('1') {
            self.handle_realtime(raw);
            return;
        }

        // JSON control frame.
        let data: serde_json::Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(_) => {
                warn!(raw_preview = preview(raw), "websocket frame is not valid JSON");
                return;
            }
        };

        // PINGPONG heartbeat must be echoed back verbatim.
        if data["header"]["tr_id"].as_str() == Some("PINGPONG") {
            let mut sink = self.sink.lock().await;
            if let Some(ws) = sink.as_mut() {
                let _ = ws.send(Message::Text(raw.to_string())).await;
                debug!("pingpong echoed");
            }
            return;
        }

        debug!(
            tr_id = data["header"]["tr_id"].as_str().unwrap_or(""),
            msg_cd = data["body"]["msg_cd"].as_str().unwrap_or(""),
            msg = data["body"]["msg1"].as_str().unwrap_or(""),
            "websocket control frame"
        );
    }

    fn handle_realtime(&self, raw: &str) {
        let parts: Vec<&str> = raw.splitn(4, '|').collect();
        if parts.len() < 4 {
            warn!(
                parts = parts.len(),
                raw_preview = preview(raw),
                "malformed realtime frame"
            );
            return;
        }

        let (encrypted, tr_id, _count, data) = (parts[0], parts[1], parts[2], parts[3]);

        if encrypted == "1" {
            // AES-CBC key handling for encrypted streams is not wired up.
            debug!(tr_id, "encrypted realtime frame skipped");
            return;
        }

        let fields = parse_realtime_fields(tr_id, data);

        let callback = self.callbacks.read().get(tr_id).cloned();
        match callback {
            Some(cb) => cb(fields),
            None => debug!(tr_id, "no callback registered for realtime frame"),
        }
    }

    // -------------------------------------------------------------------------
    // State queries
    // -------------------------------------------------------------------------

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().values().map(|s| s.len()).sum()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Whether a connection is currently established. Treats a contended
    /// sink lock as connected, since only a live connection touches it.
    pub fn is_connected(&self) -> bool {
        self.sink
            .try_lock()
            .map(|guard| guard.is_some())
            .unwrap_or(true)
    }
}

// =============================================================================
// Field parsing — caret-separated payloads, positions per broker docs
// =============================================================================

/// Parse the caret-separated `data` section of a realtime frame into named
/// fields for the subset the engine consumes.
pub fn parse_realtime_fields(tr_id: &str, data: &str) -> FieldMap {
    let fields: Vec<&str> = data.split('^').collect();
    match tr_id {
        TR_EXECUTION => parse_execution_fields(&fields),
        TR_ORDERBOOK => parse_orderbook_fields(&fields),
        TR_VI => parse_vi_fields(&fields),
        TR_ORDER_NOTICE => parse_order_notice_fields(&fields),
        _ => {
            let mut map = FieldMap::new();
            map.insert("raw".to_string(), data.to_string());
            map
        }
    }
}

fn get(fields: &[&str], idx: usize) -> String {
    fields.get(idx).unwrap_or(&"").to_string()
}

/// Char-boundary-safe truncation for log previews.
fn preview(raw: &str) -> &str {
    let mut end = raw.len().min(200);
    while end > 0 && !raw.is_char_boundary(end) {
        end -= 1;
    }
    &raw[..end]
}

/// Trade execution stream (H0STCNT0).
///
/// Positions: 0 stock code, 1 execution time, 2 current price,
/// 5 change % vs previous close, 12 execution volume, 13 accumulated volume.
fn parse_execution_fields(fields: &[&str]) -> FieldMap {
    let mut map = FieldMap::new();
    map.insert("stock_code".to_string(), get(fields, 0));
    map.insert("stck_cntg_hour".to_string(), get(fields, 1));
    map.insert("stck_prpr".to_string(), get(fields, 2));
    map.insert("prdy_ctrt".to_string(), get(fields, 5));
    map.insert("cntg_vol".to_string(), get(fields, 12));
    map.insert("acml_vol".to_string(), get(fields, 13));
    map
}

/// Orderbook stream (H0STASP0).
///
/// Positions: 0 stock code, 1 time, 2 hour class, 3..12 ask prices 1-10,
/// 13..22 bid prices 1-10, 23..32 ask volumes 1-10, 33..42 bid volumes 1-10,
/// 43 total ask volume, 44 total bid volume.
fn parse_orderbook_fields(fields: &[&str]) -> FieldMap {
    let mut map = FieldMap::new();
    map.insert("stock_code".to_string(), get(fields, 0));
    map.insert("bsop_hour".to_string(), get(fields, 1));
    for i in 0..10 {
        map.insert(format!("askp{}", i + 1), get(fields, 3 + i));
        map.insert(format!("bidp{}", i + 1), get(fields, 13 + i));
        map.insert(format!("askp_rsqn{}", i + 1), get(fields, 23 + i));
        map.insert(format!("bidp_rsqn{}", i + 1), get(fields, 33 + i));
    }
    map.insert("total_askp_rsqn".to_string(), get(fields, 43));
    map.insert("total_bidp_rsqn".to_string(), get(fields, 44));
    map
}

/// VI trigger/release stream (H0STVI0).
///
/// Positions: 0 stock code, 1 VI class code ("1" triggered / "2" released),
/// 2 static reference price, 3 dynamic reference price.
fn parse_vi_fields(fields: &[&str]) -> FieldMap {
    let mut map = FieldMap::new();
    map.insert("stock_code".to_string(), get(fields, 0));
    map.insert("vi_cls_code".to_string(), get(fields, 1));
    map.insert("vi_stnd_prc".to_string(), get(fields, 2));
    map.insert("vi_dyn_prc".to_string(), get(fields, 3));
    map
}

/// Order fill notice stream (H0STCNC0).
///
/// Positions: 0 customer id, 1 account number, 2 order number,
/// 3 original order number, 8 stock code, 9 total executed quantity,
/// 10 execution unit price, 11 total executed amount, 12 remaining quantity.
fn parse_order_notice_fields(fields: &[&str]) -> FieldMap {
    let mut map = FieldMap::new();
    map.insert("cust_id".to_string(), get(fields, 0));
    map.insert("acnt_no".to_string(), get(fields, 1));
    map.insert("odno".to_string(), get(fields, 2));
    map.insert("orgn_odno".to_string(), get(fields, 3));
    map.insert("stock_code".to_string(), get(fields, 8));
    map.insert("tot_ccld_qty".to_string(), get(fields, 9));
    map.insert("ccld_prc".to_string(), get(fields, 10));
    map.insert("tot_ccld_amt".to_string(), get(fields, 11));
    map.insert("rmn_qty".to_string(), get(fields, 12));
    map
}

impl std::fmt::Debug for KisWsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KisWsClient")
            .field("url", &self.url)
            .field("approval_key", &"<redacted>")
            .field("subscriptions", &self.subscription_count())
            .field("running", &self.is_running())
            .finish()
    }
}
