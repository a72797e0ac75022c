//! Gateway client tests against a wire-level test double: signing,
//! envelope handling, outcome mapping and the error taxonomy.

mod common;

use std::sync::Arc;

use cardpay_api::config::ConfigAccountProvider;
use cardpay_api::entities::payment::{PaymentStatus, TradeType};
use cardpay_api::gateway::{
    sign, GatewayClient, GatewayError, RefundRequest, UnifiedOrderRequest,
};
use common::{signed_xml, tampered_xml, TEST_APP_ID, TEST_MCH_ID, TEST_MERCHANT_KEY};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client_for(server: &MockServer) -> GatewayClient {
    let provider = Arc::new(ConfigAccountProvider::new([common::test_account()]));
    GatewayClient::with_api_base(provider, server.uri())
}

fn unified_order_request(trade_type: TradeType) -> UnifiedOrderRequest {
    UnifiedOrderRequest {
        body: "Embossed card pack".to_string(),
        out_trade_no: "PT2608061200000000aaaaaaaaaaaa".to_string(),
        total_fee: 3001,
        spbill_create_ip: "203.0.113.7".to_string(),
        notify_url: common::TEST_NOTIFY_URL.to_string(),
        trade_type,
        openid: Some("o6_bmjrPTlm6_2sgVt7hMZOPfL2M".to_string()),
        attach: Some("ORD-20260806120000-0001".to_string()),
    }
}

#[tokio::test]
async fn unified_order_returns_a_signed_client_package_for_jsapi() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/pay/unifiedorder"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(signed_xml(&[
            ("return_code", "SUCCESS"),
            ("result_code", "SUCCESS"),
            ("appid", TEST_APP_ID),
            ("mch_id", TEST_MCH_ID),
            ("nonce_str", "responsenonce0001"),
            ("trade_type", "JSAPI"),
            ("prepay_id", "wx0806fakeprepayid001"),
        ])))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let outcome = client
        .create_unified_order(TEST_APP_ID, unified_order_request(TradeType::Jsapi))
        .await
        .unwrap();

    assert_eq!(outcome.prepay_id.as_deref(), Some("wx0806fakeprepayid001"));
    let package = outcome.client_params.expect("jsapi client package");
    assert_eq!(package.package, "prepay_id=wx0806fakeprepayid001");
    assert_eq!(package.sign_type, "MD5");
    assert!(!package.nonce_str.is_empty());
    assert!(!package.time_stamp.is_empty());

    // The returned pay_sign verifies under the merchant key.
    let mut params = sign::Params::new();
    params.insert("appId".to_string(), package.app_id.clone());
    params.insert("timeStamp".to_string(), package.time_stamp.clone());
    params.insert("nonceStr".to_string(), package.nonce_str.clone());
    params.insert("package".to_string(), package.package.clone());
    params.insert("signType".to_string(), package.sign_type.clone());
    params.insert("sign".to_string(), package.pay_sign.clone());
    assert!(sign::verify(&params, TEST_MERCHANT_KEY));
}

#[tokio::test]
async fn unified_order_returns_a_code_url_for_native() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/pay/unifiedorder"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(signed_xml(&[
            ("return_code", "SUCCESS"),
            ("result_code", "SUCCESS"),
            ("appid", TEST_APP_ID),
            ("mch_id", TEST_MCH_ID),
            ("nonce_str", "responsenonce0002"),
            ("trade_type", "NATIVE"),
            ("prepay_id", "wx0806fakeprepayid002"),
            ("code_url", "weixin://wxpay/bizpayurl?pr=abcd123"),
        ])))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let mut request = unified_order_request(TradeType::Native);
    request.openid = None;
    let outcome = client.create_unified_order(TEST_APP_ID, request).await.unwrap();

    assert_eq!(
        outcome.code_url.as_deref(),
        Some("weixin://wxpay/bizpayurl?pr=abcd123")
    );
    assert!(outcome.client_params.is_none());
}

#[tokio::test]
async fn failed_return_code_is_a_protocol_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/pay/unifiedorder"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(signed_xml(&[
            ("return_code", "FAIL"),
            ("return_msg", "appid not registered"),
        ])))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let result = client
        .create_unified_order(TEST_APP_ID, unified_order_request(TradeType::Jsapi))
        .await;
    assert!(matches!(result, Err(GatewayError::Protocol(_))));
}

#[tokio::test]
async fn failed_result_code_carries_the_gateway_error_code() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/pay/unifiedorder"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(signed_xml(&[
            ("return_code", "SUCCESS"),
            ("result_code", "FAIL"),
            ("appid", TEST_APP_ID),
            ("mch_id", TEST_MCH_ID),
            ("nonce_str", "responsenonce0003"),
            ("err_code", "NOTENOUGH"),
            ("err_code_des", "payer balance insufficient"),
        ])))
        .mount(&server)
        .await;

    let client = client_for(&server);
    match client
        .create_unified_order(TEST_APP_ID, unified_order_request(TradeType::Jsapi))
        .await
    {
        Err(GatewayError::Business { code, description }) => {
            assert_eq!(code, "NOTENOUGH");
            assert_eq!(description, "payer balance insufficient");
        }
        other => panic!("expected business error, got {other:?}"),
    }
}

#[tokio::test]
async fn tampered_response_signature_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/pay/unifiedorder"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(tampered_xml(
            &[
                ("return_code", "SUCCESS"),
                ("result_code", "SUCCESS"),
                ("appid", TEST_APP_ID),
                ("mch_id", TEST_MCH_ID),
                ("nonce_str", "responsenonce0004"),
                ("prepay_id", "wx0806fakeprepayid004"),
            ],
            "prepay_id",
            "wx0806-swapped-prepay",
        )))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let result = client
        .create_unified_order(TEST_APP_ID, unified_order_request(TradeType::Jsapi))
        .await;
    assert!(matches!(result, Err(GatewayError::SignatureMismatch)));
}

#[tokio::test]
async fn undecodable_response_is_a_protocol_error_not_a_crash() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/pay/unifiedorder"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<xml><broken"))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let result = client
        .create_unified_order(TEST_APP_ID, unified_order_request(TradeType::Jsapi))
        .await;
    assert!(matches!(result, Err(GatewayError::Protocol(_))));
}

#[tokio::test]
async fn query_maps_the_trade_state_vocabulary() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/pay/orderquery"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(signed_xml(&[
            ("return_code", "SUCCESS"),
            ("result_code", "SUCCESS"),
            ("appid", TEST_APP_ID),
            ("mch_id", TEST_MCH_ID),
            ("nonce_str", "responsenonce0005"),
            ("trade_state", "SUCCESS"),
            ("transaction_id", "4200001234202608069999"),
            ("out_trade_no", "PT2608061200000000aaaaaaaaaaaa"),
            ("total_fee", "3001"),
            ("cash_fee", "3001"),
            ("fee_type", "CNY"),
            ("time_end", "20260806143015"),
        ])))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let outcome = client
        .query_status(TEST_APP_ID, "PT2608061200000000aaaaaaaaaaaa")
        .await
        .unwrap();

    assert_eq!(outcome.status, PaymentStatus::Paid);
    assert_eq!(
        outcome.transaction_id.as_deref(),
        Some("4200001234202608069999")
    );
    assert_eq!(outcome.total_fee, Some(3001));
    assert_eq!(outcome.cash_fee, Some(3001));
}

#[tokio::test]
async fn query_treats_unknown_orders_as_not_paid_yet() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/pay/orderquery"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(signed_xml(&[
            ("return_code", "SUCCESS"),
            ("result_code", "FAIL"),
            ("appid", TEST_APP_ID),
            ("mch_id", TEST_MCH_ID),
            ("nonce_str", "responsenonce0006"),
            ("err_code", "ORDERNOTEXIST"),
            ("err_code_des", "order not exist"),
        ])))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let outcome = client.query_status(TEST_APP_ID, "PT-never-sent").await.unwrap();
    assert_eq!(outcome.status, PaymentStatus::Pending);
    assert!(outcome.transaction_id.is_none());
}

#[tokio::test]
async fn refund_returns_the_gateway_refund_id() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/secapi/pay/refund"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(signed_xml(&[
            ("return_code", "SUCCESS"),
            ("result_code", "SUCCESS"),
            ("appid", TEST_APP_ID),
            ("mch_id", TEST_MCH_ID),
            ("nonce_str", "responsenonce0007"),
            ("refund_id", "50000001234520260806000001"),
            ("refund_fee", "1500"),
        ])))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let refund_id = client
        .refund(
            TEST_APP_ID,
            RefundRequest {
                out_trade_no: "PT2608061200000000aaaaaaaaaaaa".to_string(),
                out_refund_no: "RT2608061230000000bbbbbbbbbbbb".to_string(),
                total_fee: 3001,
                refund_fee: 1500,
                reason: Some("damaged in transit".to_string()),
            },
        )
        .await
        .unwrap();
    assert_eq!(refund_id, "50000001234520260806000001");
}

#[tokio::test]
async fn disabled_accounts_refuse_before_any_network_call() {
    // No mock mounted: a network attempt would surface as Communication.
    let server = MockServer::start().await;

    let mut disabled_payments = common::test_account();
    disabled_payments.payment_enabled = false;
    let provider = Arc::new(ConfigAccountProvider::new([disabled_payments]));
    let client = GatewayClient::with_api_base(provider, server.uri());
    let result = client
        .create_unified_order(TEST_APP_ID, unified_order_request(TradeType::Jsapi))
        .await;
    assert!(matches!(result, Err(GatewayError::Account(_))));

    let mut disabled_refunds = common::test_account();
    disabled_refunds.refund_enabled = false;
    let provider = Arc::new(ConfigAccountProvider::new([disabled_refunds]));
    let client = GatewayClient::with_api_base(provider, server.uri());
    let result = client
        .refund(
            TEST_APP_ID,
            RefundRequest {
                out_trade_no: "PT1".to_string(),
                out_refund_no: "RT1".to_string(),
                total_fee: 100,
                refund_fee: 100,
                reason: None,
            },
        )
        .await;
    assert!(matches!(result, Err(GatewayError::Account(_))));

    let provider = Arc::new(ConfigAccountProvider::new([common::test_account()]));
    let client = GatewayClient::with_api_base(provider, server.uri());
    let result = client
        .query_status("wx-unknown-app", "PT1")
        .await;
    assert!(matches!(result, Err(GatewayError::Account(_))));
}
