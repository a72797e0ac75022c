//! Payment gateway protocol stack: canonical signing, the XML wire
//! codec, and the HTTPS client for the unified-order operations.

pub mod client;
pub mod sign;
pub mod wire;

pub use client::{
    AccountProvider, ClientPayParams, GatewayClient, GatewayError, RefundRequest,
    TradeStateOutcome, UnifiedOrderOutcome, UnifiedOrderRequest, DEFAULT_API_BASE,
};
