//! HTTPS client for the payment gateway's unified-order protocol.
//!
//! Every operation follows the same shape: build the flat request map,
//! sign it, encode it as an XML envelope, POST it, decode the response,
//! verify the response signature, then map result codes to a typed
//! outcome. Account credentials are resolved per application id through
//! an injected [`AccountProvider`] so tests can substitute fixed
//! credentials.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use super::sign::{self, Params, SignType};
use super::wire::{self, WireError};
use crate::config::AccountConfig;
use crate::entities::payment::{PaymentStatus, TradeType};

pub const DEFAULT_API_BASE: &str = "https://api.mch.weixin.qq.com";

const UNIFIED_ORDER_PATH: &str = "/pay/unifiedorder";
const ORDER_QUERY_PATH: &str = "/pay/orderquery";
const REFUND_PATH: &str = "/secapi/pay/refund";
const SUCCESS: &str = "SUCCESS";

/// Gateway failure taxonomy. Messages never contain the merchant key or
/// other account credentials.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Transport failure or timeout. Retryable; the payment attempt
    /// stays pending and is resolved later by callback or query.
    #[error("Payment gateway unreachable: {0}")]
    Communication(String),

    /// The gateway answered outside its own protocol (malformed
    /// envelope, failed return code, missing mandatory fields). Not
    /// retryable without investigation.
    #[error("Payment gateway protocol error: {0}")]
    Protocol(String),

    /// The gateway understood and rejected the business request.
    #[error("Payment gateway rejected request ({code}): {description}")]
    Business { code: String, description: String },

    /// A signed message failed verification. Treated as a security
    /// event: reject, log, never apply state.
    #[error("Gateway message signature mismatch")]
    SignatureMismatch,

    /// Account configuration refuses the operation (unknown application
    /// id, payments/refunds disabled, missing credentials).
    #[error("Gateway account error: {0}")]
    Account(String),
}

impl From<WireError> for GatewayError {
    fn from(err: WireError) -> Self {
        GatewayError::Protocol(err.to_string())
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        GatewayError::Communication(err.to_string())
    }
}

/// Resolves gateway account credentials by application id.
#[async_trait]
pub trait AccountProvider: Send + Sync {
    async fn account(&self, app_id: &str) -> Result<AccountConfig, GatewayError>;
}

/// Unified-order request parameters supplied by the reconciliation
/// layer. `total_fee` is integer minor currency units.
#[derive(Debug, Clone)]
pub struct UnifiedOrderRequest {
    pub body: String,
    pub out_trade_no: String,
    pub total_fee: i64,
    pub spbill_create_ip: String,
    pub notify_url: String,
    pub trade_type: TradeType,
    pub openid: Option<String>,
    pub attach: Option<String>,
}

/// Parameter package the payer's client needs to invoke an in-app
/// payment; signed with a fresh nonce and timestamp.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ClientPayParams {
    #[serde(rename = "appId")]
    pub app_id: String,
    #[serde(rename = "timeStamp")]
    pub time_stamp: String,
    #[serde(rename = "nonceStr")]
    pub nonce_str: String,
    pub package: String,
    #[serde(rename = "signType")]
    pub sign_type: String,
    #[serde(rename = "paySign")]
    pub pay_sign: String,
}

#[derive(Debug, Clone)]
pub struct UnifiedOrderOutcome {
    pub prepay_id: Option<String>,
    pub code_url: Option<String>,
    /// Present for the in-app trade type.
    pub client_params: Option<ClientPayParams>,
}

/// Result of an order-status query, mapped into the internal status
/// vocabulary plus the settlement details reconciliation needs.
#[derive(Debug, Clone)]
pub struct TradeStateOutcome {
    pub status: PaymentStatus,
    pub transaction_id: Option<String>,
    pub total_fee: Option<i64>,
    pub cash_fee: Option<i64>,
    pub fee_type: Option<String>,
    pub time_end: Option<String>,
    pub trade_state_desc: Option<String>,
}

impl TradeStateOutcome {
    fn not_yet_paid() -> Self {
        Self {
            status: PaymentStatus::Pending,
            transaction_id: None,
            total_fee: None,
            cash_fee: None,
            fee_type: None,
            time_end: None,
            trade_state_desc: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RefundRequest {
    pub out_trade_no: String,
    pub out_refund_no: String,
    pub total_fee: i64,
    pub refund_fee: i64,
    pub reason: Option<String>,
}

/// Client for the gateway's three operations: unified order, order
/// query, refund.
#[derive(Clone)]
pub struct GatewayClient {
    http: reqwest::Client,
    accounts: Arc<dyn AccountProvider>,
    api_base: String,
}

impl GatewayClient {
    pub fn new(accounts: Arc<dyn AccountProvider>) -> Self {
        Self::with_api_base(accounts, DEFAULT_API_BASE)
    }

    /// Point the client at a different gateway origin (test doubles,
    /// sandbox environments).
    pub fn with_api_base(accounts: Arc<dyn AccountProvider>, api_base: impl Into<String>) -> Self {
        let api_base: String = api_base.into();
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("reqwest client construction"),
            accounts,
            api_base: api_base.trim_end_matches('/').to_string(),
        }
    }

    /// Register an intended payment with the gateway and return the
    /// material the payer's client needs to complete it.
    #[instrument(skip(self, request), fields(out_trade_no = %request.out_trade_no, trade_type = %request.trade_type))]
    pub async fn create_unified_order(
        &self,
        app_id: &str,
        request: UnifiedOrderRequest,
    ) -> Result<UnifiedOrderOutcome, GatewayError> {
        let account = self.payment_account(app_id).await?;

        let mut params = base_params(&account);
        params.insert("body".to_string(), request.body);
        params.insert("out_trade_no".to_string(), request.out_trade_no);
        params.insert("total_fee".to_string(), request.total_fee.to_string());
        params.insert("spbill_create_ip".to_string(), request.spbill_create_ip);
        params.insert("notify_url".to_string(), request.notify_url);
        params.insert(
            "trade_type".to_string(),
            request.trade_type.as_wire().to_string(),
        );
        if let Some(openid) = request.openid {
            params.insert("openid".to_string(), openid);
        }
        if let Some(attach) = request.attach {
            params.insert("attach".to_string(), attach);
        }

        let fields = self.execute(&account, UNIFIED_ORDER_PATH, params).await?;
        ensure_business_success(&fields)?;

        let prepay_id = non_empty(&fields, "prepay_id");
        let code_url = non_empty(&fields, "code_url");
        if prepay_id.is_none() && code_url.is_none() {
            return Err(GatewayError::Protocol(
                "unified order response carries neither prepay_id nor code_url".to_string(),
            ));
        }

        let client_params = match request.trade_type {
            TradeType::Jsapi => {
                let prepay = prepay_id.as_deref().ok_or_else(|| {
                    GatewayError::Protocol(
                        "unified order response is missing prepay_id".to_string(),
                    )
                })?;
                Some(build_client_pay_params(&account, prepay))
            }
            _ => None,
        };

        Ok(UnifiedOrderOutcome {
            prepay_id,
            code_url,
            client_params,
        })
    }

    /// Query the gateway for the state of a payment attempt.
    ///
    /// A well-formed "not found / not paid yet" answer is a normal
    /// pending result, never an error.
    #[instrument(skip(self))]
    pub async fn query_status(
        &self,
        app_id: &str,
        out_trade_no: &str,
    ) -> Result<TradeStateOutcome, GatewayError> {
        let account = self.payment_account(app_id).await?;

        let mut params = base_params(&account);
        params.insert("out_trade_no".to_string(), out_trade_no.to_string());

        let fields = self.execute(&account, ORDER_QUERY_PATH, params).await?;

        if !business_success(&fields) {
            let code = fields
                .get("err_code")
                .cloned()
                .unwrap_or_else(|| "UNKNOWN".to_string());
            if code == "ORDERNOTEXIST" {
                return Ok(TradeStateOutcome::not_yet_paid());
            }
            return Err(GatewayError::Business {
                code,
                description: fields.get("err_code_des").cloned().unwrap_or_default(),
            });
        }

        let state = fields.get("trade_state").map(String::as_str).unwrap_or("");
        Ok(TradeStateOutcome {
            status: map_trade_state(state),
            transaction_id: non_empty(&fields, "transaction_id"),
            total_fee: parse_fee(&fields, "total_fee"),
            cash_fee: parse_fee(&fields, "cash_fee"),
            fee_type: non_empty(&fields, "fee_type"),
            time_end: non_empty(&fields, "time_end"),
            trade_state_desc: non_empty(&fields, "trade_state_desc"),
        })
    }

    /// Request a (partial) refund. Returns the gateway's refund id.
    #[instrument(skip(self, request), fields(out_trade_no = %request.out_trade_no, refund_fee = request.refund_fee))]
    pub async fn refund(
        &self,
        app_id: &str,
        request: RefundRequest,
    ) -> Result<String, GatewayError> {
        let account = self.payment_account(app_id).await?;
        if !account.refund_enabled {
            return Err(GatewayError::Account(format!(
                "refunds are disabled for application {app_id}"
            )));
        }

        let mut params = base_params(&account);
        params.insert("out_trade_no".to_string(), request.out_trade_no);
        params.insert("out_refund_no".to_string(), request.out_refund_no);
        params.insert("total_fee".to_string(), request.total_fee.to_string());
        params.insert("refund_fee".to_string(), request.refund_fee.to_string());
        params.insert("op_user_id".to_string(), account.merchant_id.clone());
        if let Some(reason) = request.reason {
            params.insert("refund_desc".to_string(), reason);
        }

        let fields = self.execute(&account, REFUND_PATH, params).await?;
        ensure_business_success(&fields)?;

        non_empty(&fields, "refund_id").ok_or_else(|| {
            GatewayError::Protocol("refund response is missing refund_id".to_string())
        })
    }

    /// Verify an inbound callback against the merchant key of the
    /// account the callback names.
    pub async fn verify_callback(&self, params: &Params) -> Result<(), GatewayError> {
        let app_id = params
            .get("appid")
            .filter(|v| !v.is_empty())
            .ok_or_else(|| GatewayError::Protocol("callback is missing appid".to_string()))?;
        let account = self.payment_account(app_id).await?;
        if sign::verify(params, &account.merchant_key) {
            Ok(())
        } else {
            Err(GatewayError::SignatureMismatch)
        }
    }

    /// Resolve the usable account for an application id. Exposed so the
    /// reconciliation layer can stamp merchant identity onto payment
    /// rows without holding its own credential lookup.
    pub async fn account_for(&self, app_id: &str) -> Result<AccountConfig, GatewayError> {
        self.payment_account(app_id).await
    }

    /// Resolve an account and refuse to operate when it is unusable.
    async fn payment_account(&self, app_id: &str) -> Result<AccountConfig, GatewayError> {
        let account = self.accounts.account(app_id).await?;
        if account.merchant_id.is_empty() || account.merchant_key.is_empty() {
            return Err(GatewayError::Account(format!(
                "gateway account {app_id} is missing merchant credentials"
            )));
        }
        if !account.payment_enabled {
            return Err(GatewayError::Account(format!(
                "payments are disabled for application {app_id}"
            )));
        }
        Ok(account)
    }

    /// Sign, encode, POST, decode, verify. Returns the response fields
    /// after the top-level return code and signature checks; business
    /// result codes are the caller's concern.
    async fn execute(
        &self,
        account: &AccountConfig,
        path: &str,
        mut params: Params,
    ) -> Result<Params, GatewayError> {
        let signature = sign::sign(&params, &account.merchant_key);
        params.insert("sign".to_string(), signature);
        let body = wire::encode(&params)?;

        let url = format!("{}{}", self.api_base, path);
        debug!(%url, "posting gateway request");
        let response = self
            .http
            .post(&url)
            .header("Content-Type", "text/xml; charset=utf-8")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::Communication(format!(
                "gateway returned HTTP {status}"
            )));
        }

        let bytes = response.bytes().await?;
        let fields = wire::decode(&bytes)?;

        if fields.get("return_code").map(String::as_str) != Some(SUCCESS) {
            return Err(GatewayError::Protocol(format!(
                "return_code={}, return_msg={}",
                fields.get("return_code").cloned().unwrap_or_default(),
                fields.get("return_msg").cloned().unwrap_or_default(),
            )));
        }
        if !sign::verify(&fields, &account.merchant_key) {
            return Err(GatewayError::SignatureMismatch);
        }
        Ok(fields)
    }
}

fn base_params(account: &AccountConfig) -> Params {
    let mut params = Params::new();
    params.insert("appid".to_string(), account.app_id.clone());
    params.insert("mch_id".to_string(), account.merchant_id.clone());
    params.insert("nonce_str".to_string(), new_nonce());
    params.insert(
        "sign_type".to_string(),
        SignType::Md5.as_wire().to_string(),
    );
    params
}

fn new_nonce() -> String {
    Uuid::new_v4().simple().to_string()
}

fn non_empty(fields: &Params, key: &str) -> Option<String> {
    fields.get(key).filter(|v| !v.is_empty()).cloned()
}

fn parse_fee(fields: &Params, key: &str) -> Option<i64> {
    fields.get(key).and_then(|v| v.parse().ok())
}

fn business_success(fields: &Params) -> bool {
    fields.get("result_code").map(String::as_str) == Some(SUCCESS)
}

fn ensure_business_success(fields: &Params) -> Result<(), GatewayError> {
    if business_success(fields) {
        return Ok(());
    }
    Err(GatewayError::Business {
        code: fields
            .get("err_code")
            .cloned()
            .unwrap_or_else(|| "UNKNOWN".to_string()),
        description: fields.get("err_code_des").cloned().unwrap_or_default(),
    })
}

/// Gateway trade-state vocabulary mapped to internal payment status.
/// Unrecognized states fall back to pending as the conservative default.
fn map_trade_state(state: &str) -> PaymentStatus {
    match state {
        "SUCCESS" => PaymentStatus::Paid,
        "REFUND" => PaymentStatus::Refunded,
        "NOTPAY" | "USERPAYING" => PaymentStatus::Pending,
        "CLOSED" | "REVOKED" => PaymentStatus::Cancelled,
        "PAYERROR" => PaymentStatus::Failed,
        other => {
            warn!(trade_state = other, "unrecognized trade state, treating as pending");
            PaymentStatus::Pending
        }
    }
}

fn build_client_pay_params(account: &AccountConfig, prepay_id: &str) -> ClientPayParams {
    let time_stamp = Utc::now().timestamp().to_string();
    let nonce_str = new_nonce();
    let package = format!("prepay_id={prepay_id}");

    let mut params = Params::new();
    params.insert("appId".to_string(), account.app_id.clone());
    params.insert("timeStamp".to_string(), time_stamp.clone());
    params.insert("nonceStr".to_string(), nonce_str.clone());
    params.insert("package".to_string(), package.clone());
    params.insert(
        "signType".to_string(),
        SignType::Md5.as_wire().to_string(),
    );
    let pay_sign = sign::sign(&params, &account.merchant_key);

    ClientPayParams {
        app_id: account.app_id.clone(),
        time_stamp,
        nonce_str,
        package,
        sign_type: SignType::Md5.as_wire().to_string(),
        pay_sign,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account() -> AccountConfig {
        AccountConfig {
            app_id: "wx74862e0dfcf04954".to_string(),
            app_secret: "secret".to_string(),
            merchant_id: "10000100".to_string(),
            merchant_key: "192006250b4c09247ec02edce69f6a2d".to_string(),
            payment_enabled: true,
            refund_enabled: true,
        }
    }

    #[test]
    fn trade_state_vocabulary_maps_conservatively() {
        assert_eq!(map_trade_state("SUCCESS"), PaymentStatus::Paid);
        assert_eq!(map_trade_state("REFUND"), PaymentStatus::Refunded);
        assert_eq!(map_trade_state("NOTPAY"), PaymentStatus::Pending);
        assert_eq!(map_trade_state("USERPAYING"), PaymentStatus::Pending);
        assert_eq!(map_trade_state("CLOSED"), PaymentStatus::Cancelled);
        assert_eq!(map_trade_state("REVOKED"), PaymentStatus::Cancelled);
        assert_eq!(map_trade_state("PAYERROR"), PaymentStatus::Failed);
        assert_eq!(map_trade_state("SOMETHING_NEW"), PaymentStatus::Pending);
        assert_eq!(map_trade_state(""), PaymentStatus::Pending);
    }

    #[test]
    fn client_pay_params_are_signed_and_fresh() {
        let first = build_client_pay_params(&account(), "wx20260806prepay");
        let second = build_client_pay_params(&account(), "wx20260806prepay");

        assert_eq!(first.package, "prepay_id=wx20260806prepay");
        assert_eq!(first.sign_type, "MD5");
        assert_ne!(first.nonce_str, second.nonce_str);

        // The package signature must verify under the same canonical form.
        let mut params = Params::new();
        params.insert("appId".to_string(), first.app_id.clone());
        params.insert("timeStamp".to_string(), first.time_stamp.clone());
        params.insert("nonceStr".to_string(), first.nonce_str.clone());
        params.insert("package".to_string(), first.package.clone());
        params.insert("signType".to_string(), first.sign_type.clone());
        assert_eq!(sign::sign(&params, &account().merchant_key), first.pay_sign);
    }

    #[test]
    fn business_failure_carries_gateway_code() {
        let mut fields = Params::new();
        fields.insert("result_code".to_string(), "FAIL".to_string());
        fields.insert("err_code".to_string(), "NOTENOUGH".to_string());
        fields.insert(
            "err_code_des".to_string(),
            "insufficient balance".to_string(),
        );
        match ensure_business_success(&fields) {
            Err(GatewayError::Business { code, description }) => {
                assert_eq!(code, "NOTENOUGH");
                assert_eq!(description, "insufficient balance");
            }
            other => panic!("expected business error, got {other:?}"),
        }
    }

    #[test]
    fn base_params_carry_account_identity_and_nonce() {
        let params = base_params(&account());
        assert_eq!(
            params.get("appid").map(String::as_str),
            Some("wx74862e0dfcf04954")
        );
        assert_eq!(params.get("mch_id").map(String::as_str), Some("10000100"));
        assert_eq!(params.get("sign_type").map(String::as_str), Some("MD5"));
        assert_eq!(params.get("nonce_str").map(|n| n.len()), Some(32));
    }
}
