// =============================================================================
// Broker REST Client — authenticated request envelope with retry
// =============================================================================
//
// Every call goes through `request()`: acquire a rate-limit token, attach the
// bearer token + app credential headers, attach a server-computed hashkey for
// POST bodies, then retry transient failures with exponential backoff.
//
// A response with `rt_cd != "0"` is a broker business error and surfaces as
// `KisError::Api` carrying the broker's message code, message, and raw body.
// Only the documented rate-exceeded codes are retried.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::api::auth::{HashkeyProvider, TokenProvider};
use crate::api::rate_limit::RateLimiter;
use crate::risk::margin_guard::enforce_cash_order_params;
use crate::types::{OrderSide, TradeMode};

/// Broker error codes that indicate a transient rate limit and may be
/// retried after a backoff wait.
const RETRYABLE_MSG_CODES: &[&str] = &[
    "EGW00200", // per-second transaction count exceeded
    "EGW00201", // daily transaction count exceeded
];

const MAX_RETRY_ATTEMPTS: u32 = 3;

/// Typed failure of a broker REST call.
#[derive(Debug, Error)]
pub enum KisError {
    /// Broker returned `rt_cd != "0"` with a non-retryable message code.
    #[error("broker error [{msg_cd}] {msg}")]
    Api {
        msg_cd: String,
        msg: String,
        raw: Value,
    },

    /// Network or deserialisation failure that survived all retries.
    #[error("network error after {attempts} attempts: {source}")]
    Network {
        attempts: u32,
        #[source]
        source: reqwest::Error,
    },

    /// Token or hashkey acquisition failed.
    #[error("auth error: {0}")]
    Auth(#[from] anyhow::Error),
}

/// Broker REST API client.
///
/// Token and hashkey acquisition are injected behind traits so tests and
/// alternative credential stores can stand in for the real managers.
pub struct KisRestClient {
    token_provider: Arc<dyn TokenProvider>,
    hashkey_provider: Arc<dyn HashkeyProvider>,
    rate_limiter: Arc<RateLimiter>,
    mode: TradeMode,
    account_no: String,
    account_product_code: String,
    base_url: String,
    client: reqwest::Client,
}

impl KisRestClient {
    pub fn new(
        token_provider: Arc<dyn TokenProvider>,
        hashkey_provider: Arc<dyn HashkeyProvider>,
        rate_limiter: Arc<RateLimiter>,
        mode: TradeMode,
        account_no: impl Into<String>,
        account_product_code: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        let account_no = account_no.into();
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        info!(
            mode = %mode,
            account_no = %mask_account(&account_no),
            "broker REST client initialised"
        );

        Self {
            token_provider,
            hashkey_provider,
            rate_limiter,
            mode,
            account_no,
            account_product_code: account_product_code.into(),
            base_url: base_url.into(),
            client,
        }
    }

    // -------------------------------------------------------------------------
    // Core request
    // -------------------------------------------------------------------------

    /// Execute a broker REST request.
    ///
    /// 1. Acquire a rate-limit token.
    /// 2. Build common headers (bearer token, app key/secret, tr_id).
    /// 3. Attach a hashkey header for POST bodies.
    /// 4. Retry transient failures up to 3 attempts with 2^(n+1) s backoff.
    pub async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        tr_id: &str,
        body: Option<&Value>,
        params: Option<&[(&str, String)]>,
    ) -> Result<Value, KisError> {
        self.rate_limiter.acquire().await;

        let token = self.token_provider.get_token().await?;
        let url = format!("{}{}", self.base_url, path);

        let hashkey = match (method == reqwest::Method::POST, body) {
            (true, Some(b)) => Some(self.hashkey_provider.get_hashkey(b).await?),
            _ => None,
        };

        let mut last_error: Option<reqwest::Error> = None;

        for attempt in 0..MAX_RETRY_ATTEMPTS {
            let mut req = self
                .client
                .request(method.clone(), &url)
                .header("authorization", format!("Bearer {token}"))
                .header("appkey", self.token_provider.app_key())
                .header("appsecret", self.token_provider.app_secret())
                .header("tr_id", tr_id)
                .header("content-type", "application/json; charset=utf-8")
                .header("custtype", "P");

            if let Some(ref hk) = hashkey {
                req = req.header("hashkey", hk);
            }
            if let Some(b) = body {
                req = req.json(b);
            }
            if let Some(p) = params {
                req = req.query(p);
            }

            let outcome = match req.send().await {
                Ok(resp) => resp.json::<Value>().await,
                Err(e) => Err(e),
            };

            match outcome {
                Ok(data) => {
                    let rt_cd = data["rt_cd"].as_str().unwrap_or("");
                    if rt_cd != "0" {
                        let msg_cd = data["msg_cd"].as_str().unwrap_or("").to_string();
                        let msg = data["msg1"].as_str().unwrap_or("").to_string();

                        if RETRYABLE_MSG_CODES.contains(&msg_cd.as_str())
                            && attempt < MAX_RETRY_ATTEMPTS - 1
                        {
                            let wait = 1u64 << (attempt + 1);
                            warn!(
                                msg_cd = %msg_cd,
                                msg = %msg,
                                attempt = attempt + 1,
                                wait_seconds = wait,
                                "retryable broker error"
                            );
                            tokio::time::sleep(Duration::from_secs(wait)).await;
                            continue;
                        }

                        return Err(KisError::Api {
                            msg_cd,
                            msg,
                            raw: data,
                        });
                    }

                    debug!(method = %method, path, tr_id, "broker request succeeded");
                    return Ok(data);
                }
                Err(e) => {
                    if attempt < MAX_RETRY_ATTEMPTS - 1 {
                        let wait = 1u64 << (attempt + 1);
                        warn!(
                            error = %e,
                            attempt = attempt + 1,
                            max_attempts = MAX_RETRY_ATTEMPTS,
                            wait_seconds = wait,
                            "broker network error"
                        );
                        last_error = Some(e);
                        tokio::time::sleep(Duration::from_secs(wait)).await;
                    } else {
                        warn!(error = %e, method = %method, path, tr_id, "broker request failed");
                        last_error = Some(e);
                    }
                }
            }
        }

        Err(KisError::Network {
            attempts: MAX_RETRY_ATTEMPTS,
            source: last_error.expect("retry loop exited without an error"),
        })
    }

    // -------------------------------------------------------------------------
    // Quotation endpoints
    // -------------------------------------------------------------------------

    /// Current price for a 6-digit stock code.
    pub async fn get_current_price(&self, stock_code: &str) -> Result<Value, KisError> {
        self.request(
            reqwest::Method::GET,
            "/uapi/domestic-stock/v1/quotations/inquire-price",
            "FHKST01010100",
            None,
            Some(&[
                ("FID_COND_MRKT_DIV_CODE", "J".to_string()),
                ("FID_INPUT_ISCD", stock_code.to_string()),
            ]),
        )
        .await
    }

    /// 10-level asking price (orderbook) snapshot.
    pub async fn get_asking_price(&self, stock_code: &str) -> Result<Value, KisError> {
        self.request(
            reqwest::Method::GET,
            "/uapi/domestic-stock/v1/quotations/inquire-asking-price-exp-ccn",
            "FHKST01010200",
            None,
            Some(&[
                ("FID_COND_MRKT_DIV_CODE", "J".to_string()),
                ("FID_INPUT_ISCD", stock_code.to_string()),
            ]),
        )
        .await
    }

    /// Daily / weekly / monthly candles. `period` is "D", "W", or "M".
    pub async fn get_daily_price(
        &self,
        stock_code: &str,
        period: &str,
    ) -> Result<Value, KisError> {
        self.request(
            reqwest::Method::GET,
            "/uapi/domestic-stock/v1/quotations/inquire-daily-price",
            "FHKST01010400",
            None,
            Some(&[
                ("FID_COND_MRKT_DIV_CODE", "J".to_string()),
                ("FID_INPUT_ISCD", stock_code.to_string()),
                ("FID_PERIOD_DIV_CODE", period.to_string()),
                ("FID_ORG_ADJ_PRC", "0".to_string()),
            ]),
        )
        .await
    }

    /// Volume-rank screen across the whole market.
    pub async fn get_volume_rank(&self) -> Result<Value, KisError> {
        self.request(
            reqwest::Method::GET,
            "/uapi/domestic-stock/v1/quotations/volume-rank",
            "FHPST01710000",
            None,
            Some(&[
                ("FID_COND_MRKT_DIV_CODE", "J".to_string()),
                ("FID_COND_SCR_DIV_CODE", "20171".to_string()),
                ("FID_INPUT_ISCD", "0000".to_string()),
                ("FID_DIV_CLS_CODE", "0".to_string()),
                ("FID_BLNG_CLS_CODE", "0".to_string()),
                ("FID_TRGT_CLS_CODE", "111111111".to_string()),
                ("FID_TRGT_EXLS_CLS_CODE", "000000".to_string()),
                ("FID_INPUT_PRICE_1", String::new()),
                ("FID_INPUT_PRICE_2", String::new()),
                ("FID_VOL_CNT", String::new()),
                ("FID_INPUT_DATE_1", String::new()),
            ]),
        )
        .await
    }

    // -------------------------------------------------------------------------
    // Order endpoints
    // -------------------------------------------------------------------------

    /// Transaction id for a new order; depends on mode and side.
    fn order_tr_id(&self, side: OrderSide) -> &'static str {
        match (self.mode, side) {
            (TradeMode::Live, OrderSide::Buy) => "TTTC0802U",
            (TradeMode::Live, OrderSide::Sell) => "TTTC0801U",
            (TradeMode::Paper, OrderSide::Buy) => "VTTC0802U",
            (TradeMode::Paper, OrderSide::Sell) => "VTTC0801U",
        }
    }

    /// Transaction id for cancel/modify; depends on mode only.
    fn amend_tr_id(&self) -> &'static str {
        match self.mode {
            TradeMode::Live => "TTTC0803U",
            TradeMode::Paper => "VTTC0803U",
        }
    }

    /// Place a cash order. `price == 0` submits a market order.
    pub async fn place_order(
        &self,
        stock_code: &str,
        side: OrderSide,
        quantity: i64,
        price: i64,
    ) -> Result<Value, KisError> {
        let tr_id = self.order_tr_id(side);
        // "00" = limit, "01" = market
        let order_dvsn = if price > 0 { "00" } else { "01" };

        let mut body = json!({
            "CANO": self.account_no,
            "ACNT_PRDT_CD": self.account_product_code,
            "PDNO": stock_code,
            "ORD_DVSN": order_dvsn,
            "ORD_QTY": quantity.to_string(),
            "ORD_UNPR": price.to_string(),
        });

        if order_dvsn == "00" {
            enforce_cash_order_params(&mut body);
        }

        info!(
            stock_code,
            side = %side,
            quantity,
            price,
            tr_id,
            order_dvsn,
            "placing broker order"
        );

        self.request(
            reqwest::Method::POST,
            "/uapi/domestic-stock/v1/trading/order-cash",
            tr_id,
            Some(&body),
            None,
        )
        .await
    }

    /// Cancel the full remaining quantity of an order.
    pub async fn cancel_order(
        &self,
        order_no: &str,
        stock_code: &str,
    ) -> Result<Value, KisError> {
        let body = json!({
            "CANO": self.account_no,
            "ACNT_PRDT_CD": self.account_product_code,
            "KRX_FWDG_ORD_ORGNO": "",
            "ORGN_ODNO": order_no,
            "ORD_DVSN": "00",
            "RVSE_CNCL_DVSN_CD": "02",
            "ORD_QTY": "0",
            "ORD_UNPR": "0",
            "QTY_ALL_ORD_YN": "Y",
        });

        info!(order_no, stock_code, "cancelling broker order");

        self.request(
            reqwest::Method::POST,
            "/uapi/domestic-stock/v1/trading/order-rvsecncl",
            self.amend_tr_id(),
            Some(&body),
            None,
        )
        .await
    }

    /// Modify an order's price. `order_dvsn "01"` with `new_price 0` amends
    /// to a market order.
    pub async fn modify_order(
        &self,
        order_no: &str,
        stock_code: &str,
        new_price: i64,
        order_dvsn: &str,
    ) -> Result<Value, KisError> {
        let body = json!({
            "CANO": self.account_no,
            "ACNT_PRDT_CD": self.account_product_code,
            "KRX_FWDG_ORD_ORGNO": "",
            "ORGN_ODNO": order_no,
            "ORD_DVSN": order_dvsn,
            "RVSE_CNCL_DVSN_CD": "01",
            "ORD_QTY": "0",
            "ORD_UNPR": new_price.to_string(),
            "QTY_ALL_ORD_YN": "Y",
        });

        info!(order_no, stock_code, new_price, order_dvsn, "modifying broker order");

        self.request(
            reqwest::Method::POST,
            "/uapi/domestic-stock/v1/trading/order-rvsecncl",
            self.amend_tr_id(),
            Some(&body),
            None,
        )
        .await
    }

    // -------------------------------------------------------------------------
    // Balance
    // -------------------------------------------------------------------------

    /// Account balance inquiry (held stocks plus cash deposits).
    pub async fn get_balance(&self) -> Result<Value, KisError> {
        self.request(
            reqwest::Method::GET,
            "/uapi/domestic-stock/v1/trading/inquire-balance",
            "TTTC8434R",
            None,
            Some(&[
                ("CANO", self.account_no.clone()),
                ("ACNT_PRDT_CD", self.account_product_code.clone()),
                ("AFHR_FLPR_YN", "N".to_string()),
                ("OFL_YN", String::new()),
                ("INQR_DVSN", "02".to_string()),
                ("UNPR_DVSN", "01".to_string()),
                ("FUND_STTL_ICLD_YN", "N".to_string()),
                ("FNCG_AMT_AUTO_RDPT_YN", "N".to_string()),
                ("PRCS_DVSN", "01".to_string()),
                ("CTX_AREA_FK100", String::new()),
                ("CTX_AREA_NK100", String::new()),
            ]),
        )
        .await
    }

    /// Available cash (KRW) extracted from the balance inquiry.
    pub async fn get_cash_balance(&self) -> Result<i64, KisError> {
        let balance = self.get_balance().await?;
        let cash = balance["output2"]
            .as_array()
            .and_then(|rows| rows.first())
            .and_then(|row| row["dnca_tot_amt"].as_str())
            .and_then(|s| s.parse::<i64>().ok())
            .unwrap_or(0);
        debug!(cash, "cash balance retrieved");
        Ok(cash)
    }
}

fn mask_account(account_no: &str) -> String {
    if account_no.len() >= 4 {
        format!("{}****", &account_no[..4])
    } else {
        "N/A".to_string()
    }
}

impl std::fmt::Debug for KisRestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KisRestClient")
            .field("mode", &self.mode)
            .field("account_no", &mask_account(&self.account_no))
            .field("base_url", &self.base_url)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::auth::{HashkeyProvider, TokenProvider};
    use crate::api::rate_limit::RateLimiter;
    use async_trait::async_trait;

    struct FakeAuth;

    #[async_trait]
    impl TokenProvider for FakeAuth {
        async fn get_token(&self) -> anyhow::Result<String> {
            Ok("test-token".to_string())
        }
        fn app_key(&self) -> &str {
            "key"
        }
        fn app_secret(&self) -> &str {
            "secret"
        }
    }

    #[async_trait]
    impl HashkeyProvider for FakeAuth {
        async fn get_hashkey(&self, _body: &Value) -> anyhow::Result<String> {
            Ok("hash".to_string())
        }
    }

    fn client(mode: TradeMode) -> KisRestClient {
        KisRestClient::new(
            Arc::new(FakeAuth),
            Arc::new(FakeAuth),
            Arc::new(RateLimiter::default()),
            mode,
            "50123456",
            "01",
            "https://localhost:1",
        )
    }

    // ---- tr_id selection -------------------------------------------------

    #[test]
    fn order_tr_ids_depend_on_mode_and_side() {
        let live = client(TradeMode::Live);
        assert_eq!(live.order_tr_id(OrderSide::Buy), "TTTC0802U");
        assert_eq!(live.order_tr_id(OrderSide::Sell), "TTTC0801U");
        assert_eq!(live.amend_tr_id(), "TTTC0803U");

        let paper = client(TradeMode::Paper);
        assert_eq!(paper.order_tr_id(OrderSide::Buy), "VTTC0802U");
        assert_eq!(paper.order_tr_id(OrderSide::Sell), "VTTC0801U");
        assert_eq!(paper.amend_tr_id(), "VTTC0803U");
    }

    // ---- retryable code set ----------------------------------------------

    #[test]
    fn retryable_codes_cover_rate_limits_only() {
        assert!(RETRYABLE_MSG_CODES.contains(&"EGW00200"));
        assert!(RETRYABLE_MSG_CODES.contains(&"EGW00201"));
        assert!(!RETRYABLE_MSG_CODES.contains(&"EGW00123"));
    }

    // ---- account masking -------------------------------------------------

    #[test]
    fn account_number_is_masked_in_debug() {
        let c = client(TradeMode::Paper);
        let dbg = format!("{c:?}");
        assert!(dbg.contains("5012****"));
        assert!(!dbg.contains("50123456"));
    }

    #[test]
    fn api_error_displays_code_and_message() {
        let err = KisError::Api {
            msg_cd: "EGW00123".to_string(),
            msg: "invalid token".to_string(),
            raw: json!({}),
        };
        let text = err.to_string();
        assert!(text.contains("EGW00123"));
        assert!(text.contains("invalid token"));
    }
}
