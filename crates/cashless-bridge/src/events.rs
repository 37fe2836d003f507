//! Wire types for the event channel
//!
//! Every frame is a JSON envelope `{"event": <name>, "data": <payload>}`.
//! Outbound payloads all carry a `timestamp` in epoch seconds.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Epoch seconds, the timestamp format every outbound event carries.
pub fn now_ts() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Cardholder summary attached to a successful PIN verification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserSummary {
    pub name: String,
    pub balance: f64,
    pub card_id: String,
}

/// Notifications pushed to connected clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum OutboundEvent {
    CardInserted {
        card_id: String,
        activated: bool,
        timestamp: f64,
    },
    CardRemoved {
        card_id: String,
        timestamp: f64,
    },
    PinVerificationResult {
        success: bool,
        attempts_remaining: Option<u8>,
        blocked: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        user: Option<UserSummary>,
        timestamp: f64,
    },
    TransactionResult {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        transaction_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        new_balance: Option<f64>,
        refund: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        timestamp: f64,
    },
    BalanceResult {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        balance: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        timestamp: f64,
    },
    Pong {
        timestamp: f64,
    },
}

impl OutboundEvent {
    pub fn card_inserted(card_id: String, activated: bool) -> Self {
        Self::CardInserted {
            card_id,
            activated,
            timestamp: now_ts(),
        }
    }

    pub fn card_removed(card_id: String) -> Self {
        Self::CardRemoved {
            card_id,
            timestamp: now_ts(),
        }
    }

    pub fn pin_failure(error: String) -> Self {
        Self::PinVerificationResult {
            success: false,
            attempts_remaining: None,
            blocked: false,
            error: Some(error),
            user: None,
            timestamp: now_ts(),
        }
    }

    pub fn transaction_failure(refund: bool, error: String) -> Self {
        Self::TransactionResult {
            success: false,
            transaction_id: None,
            new_balance: None,
            refund,
            error: Some(error),
            timestamp: now_ts(),
        }
    }

    pub fn balance_failure(error: String) -> Self {
        Self::BalanceResult {
            success: false,
            balance: None,
            error: Some(error),
            timestamp: now_ts(),
        }
    }
}

/// Requests decoded off the event channel.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum InboundRequest {
    VerifyPin {
        pin: String,
    },
    CreateTransaction {
        amount: f64,
        #[serde(default)]
        merchant: Option<String>,
        #[serde(default)]
        refund: bool,
    },
    GetBalance {},
    Ping,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outbound_envelope_shape() {
        let json = serde_json::to_value(OutboundEvent::CardInserted {
            card_id: "ABC123".into(),
            activated: true,
            timestamp: 1.5,
        })
        .unwrap();
        assert_eq!(json["event"], "card_inserted");
        assert_eq!(json["data"]["card_id"], "ABC123");
        assert_eq!(json["data"]["activated"], true);
        assert_eq!(json["data"]["timestamp"], 1.5);
    }

    #[test]
    fn failure_results_omit_empty_fields() {
        let json =
            serde_json::to_value(OutboundEvent::transaction_failure(false, "Montant invalide".into()))
                .unwrap();
        assert_eq!(json["event"], "transaction_result");
        assert_eq!(json["data"]["success"], false);
        assert!(json["data"].get("transaction_id").is_none());
        assert!(json["data"].get("new_balance").is_none());
    }

    #[test]
    fn inbound_requests_decode() {
        let req: InboundRequest =
            serde_json::from_str(r#"{"event":"verify_pin","data":{"pin":"1234"}}"#).unwrap();
        assert_eq!(req, InboundRequest::VerifyPin { pin: "1234".into() });

        let req: InboundRequest = serde_json::from_str(
            r#"{"event":"create_transaction","data":{"amount":2.0,"merchant":"CoffeeShop"}}"#,
        )
        .unwrap();
        assert_eq!(
            req,
            InboundRequest::CreateTransaction {
                amount: 2.0,
                merchant: Some("CoffeeShop".into()),
                refund: false,
            }
        );

        let req: InboundRequest =
            serde_json::from_str(r#"{"event":"get_balance","data":{}}"#).unwrap();
        assert_eq!(req, InboundRequest::GetBalance {});

        let req: InboundRequest = serde_json::from_str(r#"{"event":"ping"}"#).unwrap();
        assert_eq!(req, InboundRequest::Ping);
    }
}
