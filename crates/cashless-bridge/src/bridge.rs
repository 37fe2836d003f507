//! Request orchestration
//!
//! Each inbound request becomes exactly one outbound result event. Card
//! exchanges run on the blocking pool while holding the session lock;
//! backend calls run without it, so the card id is re-checked after every
//! await before the session is touched again. Failures short-circuit into
//! result events carrying the user-facing message; the terminal UI shows
//! these verbatim, hence the French.

use std::sync::Arc;

use cashless_card::CardProtocol;
use tokio::task;
use tracing::{info, warn};

use crate::backend::CashlessApi;
use crate::events::{now_ts, InboundRequest, OutboundEvent, UserSummary};
use crate::session::SharedSession;

const NO_CARD: &str = "Aucune carte insérée";
const NOT_AUTHENTICATED: &str = "Non authentifié. Veuillez d'abord vérifier votre PIN.";
const INVALID_AMOUNT: &str = "Montant invalide";
const PIN_BAD_LENGTH: &str = "PIN invalide (4 chiffres requis)";
const PIN_NOT_NUMERIC: &str = "PIN doit contenir uniquement des chiffres";

pub struct Bridge {
    session: SharedSession,
    api: Arc<dyn CashlessApi>,
    protocol: CardProtocol,
}

impl Bridge {
    pub fn new(session: SharedSession, api: Arc<dyn CashlessApi>, protocol: CardProtocol) -> Self {
        Self {
            session,
            api,
            protocol,
        }
    }

    pub async fn dispatch(&self, request: InboundRequest) -> OutboundEvent {
        match request {
            InboundRequest::VerifyPin { pin } => self.verify_pin(pin).await,
            InboundRequest::CreateTransaction {
                amount,
                merchant,
                refund,
            } => self.create_transaction(amount, merchant, refund).await,
            InboundRequest::GetBalance {} => self.get_balance().await,
            InboundRequest::Ping => OutboundEvent::Pong {
                timestamp: now_ts(),
            },
        }
    }

    /// Present the PIN to the card and, on acceptance, establish the
    /// backend session via challenge-response.
    pub async fn verify_pin(&self, pin: String) -> OutboundEvent {
        // Shape validation happens here; a malformed PIN never reaches the
        // card and never burns an attempt.
        if pin.len() != self.protocol.profile().pin_len {
            return OutboundEvent::pin_failure(PIN_BAD_LENGTH.into());
        }
        if !pin.chars().all(|c| c.is_ascii_digit()) {
            return OutboundEvent::pin_failure(PIN_NOT_NUMERIC.into());
        }

        let Some(card_id) = self.session.current_card_id() else {
            return OutboundEvent::pin_failure(NO_CARD.into());
        };

        let outcome = {
            let session = self.session.clone();
            let protocol = self.protocol.clone();
            let expected = card_id.clone();
            task::spawn_blocking(move || {
                let guard = session.lock();
                if guard.card_id.as_deref() != Some(expected.as_str()) {
                    return None;
                }
                guard
                    .connection
                    .as_deref()
                    .map(|conn| protocol.verify_pin(conn, &pin))
            })
            .await
            .unwrap_or(None)
        };

        let Some(outcome) = outcome else {
            return OutboundEvent::pin_failure(NO_CARD.into());
        };
        if let Some(error) = outcome.error {
            return OutboundEvent::pin_failure(error);
        }
        if !outcome.success {
            info!(
                card_id = %card_id,
                attempts_remaining = ?outcome.attempts_remaining,
                blocked = outcome.blocked,
                "PIN refused by card"
            );
            return OutboundEvent::PinVerificationResult {
                success: false,
                attempts_remaining: outcome.attempts_remaining,
                blocked: outcome.blocked,
                error: None,
                user: None,
                timestamp: now_ts(),
            };
        }

        match self.authenticate(&card_id).await {
            Ok(user) => OutboundEvent::PinVerificationResult {
                success: true,
                attempts_remaining: outcome.attempts_remaining,
                blocked: false,
                error: None,
                user: Some(user),
                timestamp: now_ts(),
            },
            Err(message) => {
                warn!(card_id = %card_id, error = %message, "authentication failed after PIN acceptance");
                OutboundEvent::pin_failure(message)
            }
        }
    }

    /// Challenge-response against the backend, then cardholder resolution.
    async fn authenticate(&self, card_id: &str) -> Result<UserSummary, String> {
        let challenge = self
            .api
            .get_challenge(card_id)
            .await
            .map_err(|e| e.to_string())?;

        let signature = {
            let session = self.session.clone();
            let protocol = self.protocol.clone();
            let expected = card_id.to_string();
            let challenge = challenge.clone();
            task::spawn_blocking(move || {
                let guard = session.lock();
                if guard.card_id.as_deref() != Some(expected.as_str()) {
                    return Err(NO_CARD.to_string());
                }
                let conn = guard.connection.as_deref().ok_or_else(|| NO_CARD.to_string())?;
                protocol
                    .sign_challenge(conn, &challenge)
                    .map_err(|e| e.to_string())
            })
            .await
            .map_err(|e| e.to_string())?
        }?;

        let token = self
            .api
            .authenticate_card(card_id, &challenge, &signature)
            .await
            .map_err(|e| e.to_string())?;

        // Store the token only if the same card is still on the contacts.
        {
            let mut guard = self.session.lock();
            if guard.card_id.as_deref() != Some(card_id) {
                return Err(NO_CARD.to_string());
            }
            guard.token = Some(token.clone());
            guard.authenticated = true;
        }

        let profile = self
            .api
            .fetch_user_by_card(card_id, &token)
            .await
            .map_err(|e| e.to_string())?;
        if self.session.current_card_id().as_deref() != Some(card_id) {
            return Err(NO_CARD.to_string());
        }

        info!(card_id = %card_id, user = %profile.display_name, "cardholder authenticated");
        Ok(UserSummary {
            name: profile.display_name,
            balance: profile.balance,
            card_id: card_id.to_string(),
        })
    }

    pub async fn create_transaction(
        &self,
        amount: f64,
        merchant: Option<String>,
        refund: bool,
    ) -> OutboundEvent {
        let (card_id, token) = {
            let session = self.session.lock();
            match (&session.card_id, &session.token, session.authenticated) {
                (Some(id), Some(token), true) => (id.clone(), token.clone()),
                (None, ..) => {
                    return OutboundEvent::transaction_failure(refund, NO_CARD.into());
                }
                _ => {
                    return OutboundEvent::transaction_failure(refund, NOT_AUTHENTICATED.into());
                }
            }
        };

        if !amount.is_finite() || amount <= 0.0 {
            return OutboundEvent::transaction_failure(refund, INVALID_AMOUNT.into());
        }
        // Decimal in, integer minor units over the wire.
        let amount_minor = (amount * 100.0).round() as i64;
        if amount_minor <= 0 {
            return OutboundEvent::transaction_failure(refund, INVALID_AMOUNT.into());
        }

        // The merchant field is advisory: the configured account is always
        // the one that gets paid.
        if let Some(requested) = merchant.as_deref() {
            if requested != self.api.merchant_account() {
                warn!(requested, "merchant field does not match the configured account, ignoring");
            }
        }

        info!(card_id = %card_id, amount_minor, refund, "creating transaction");
        match self
            .api
            .create_transaction(&token, &card_id, amount_minor, refund)
            .await
        {
            Ok(done) => OutboundEvent::TransactionResult {
                success: true,
                transaction_id: done.transaction_id,
                new_balance: Some(done.new_balance),
                refund,
                error: None,
                timestamp: now_ts(),
            },
            Err(e) => {
                warn!(card_id = %card_id, error = %e, "transaction failed");
                OutboundEvent::transaction_failure(refund, e.to_string())
            }
        }
    }

    pub async fn get_balance(&self) -> OutboundEvent {
        let (card_id, token) = {
            let session = self.session.lock();
            match (&session.card_id, &session.token, session.authenticated) {
                (Some(id), Some(token), true) => (id.clone(), token.clone()),
                (None, ..) => return OutboundEvent::balance_failure(NO_CARD.into()),
                _ => return OutboundEvent::balance_failure(NOT_AUTHENTICATED.into()),
            }
        };

        match self.api.get_user_balance(&token, &card_id).await {
            Ok(balance) => OutboundEvent::BalanceResult {
                success: true,
                balance: Some(balance),
                error: None,
                timestamp: now_ts(),
            },
            Err(e) => OutboundEvent::balance_failure(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{
        BackendError, BackendUser, CashlessApi, TransactionReceipt,
    };
    use async_trait::async_trait;
    use cashless_card::{ApduResponse, CardError, CardTransport, ProtocolProfile};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Card double for the first firmware revision, replaying scripted
    /// responses and recording what hit the wire.
    struct ScriptedCard {
        script: Mutex<VecDeque<Result<ApduResponse, CardError>>>,
        sent: Mutex<Vec<Vec<u8>>>,
    }

    impl ScriptedCard {
        fn new(script: Vec<Result<ApduResponse, CardError>>) -> Box<Self> {
            Box::new(Self {
                script: Mutex::new(script.into()),
                sent: Mutex::new(Vec::new()),
            })
        }
    }

    impl CardTransport for ScriptedCard {
        fn transmit(&self, apdu: &[u8]) -> Result<ApduResponse, CardError> {
            self.sent.lock().unwrap().push(apdu.to_vec());
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(CardError::Transport("script exhausted".into())))
        }
    }

    fn ok(data: &[u8]) -> Result<ApduResponse, CardError> {
        Ok(ApduResponse {
            data: data.to_vec(),
            sw1: 0x90,
            sw2: 0x00,
        })
    }

    fn status(sw1: u8, sw2: u8) -> Result<ApduResponse, CardError> {
        Ok(ApduResponse {
            data: Vec::new(),
            sw1,
            sw2,
        })
    }

    #[derive(Default)]
    struct StubBackend {
        calls: Mutex<Vec<String>>,
        balance_script: Mutex<Vec<i64>>,
        // Simulates the card being pulled while the named backend call is
        // in flight.
        clear_session_on_challenge: Mutex<Option<SharedSession>>,
        clear_session_on_auth: Mutex<Option<SharedSession>>,
    }

    impl StubBackend {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: impl Into<String>) {
            self.calls.lock().unwrap().push(call.into());
        }
    }

    #[async_trait]
    impl CashlessApi for StubBackend {
        async fn get_challenge(&self, card_id: &str) -> Result<String, BackendError> {
            self.record(format!("challenge:{card_id}"));
            if let Some(session) = self.clear_session_on_challenge.lock().unwrap().take() {
                session.lock().finalize();
            }
            Ok("deadbeef".into())
        }

        async fn authenticate_card(
            &self,
            card_id: &str,
            challenge: &str,
            signature: &[u8],
        ) -> Result<String, BackendError> {
            self.record(format!(
                "auth:{card_id}:{challenge}:{}",
                hex::encode(signature)
            ));
            if let Some(session) = self.clear_session_on_auth.lock().unwrap().take() {
                session.lock().finalize();
            }
            Ok("tok1".into())
        }

        async fn merchant_token(&self) -> Result<String, BackendError> {
            self.record("merchant_token");
            Ok("merchant-tok".into())
        }

        fn invalidate_merchant_token(&self) {}

        async fn get_user(&self, card_id: &str, _token: &str) -> Result<BackendUser, BackendError> {
            self.record(format!("get_user:{card_id}"));
            Ok(BackendUser {
                id: "u42".into(),
                name: "Alice Dupont".into(),
            })
        }

        async fn get_balance_minor(&self, user_id: &str, _token: &str) -> Result<i64, BackendError> {
            self.record(format!("balance:{user_id}"));
            Ok(self.balance_script.lock().unwrap().pop().unwrap_or(1250))
        }

        async fn post_transaction(
            &self,
            token: &str,
            destination_user_id: &str,
            operation_minor: i64,
        ) -> Result<TransactionReceipt, BackendError> {
            self.record(format!("post:{token}:{destination_user_id}:{operation_minor}"));
            Ok(TransactionReceipt {
                transaction_id: Some("tx1".into()),
                reported_balance_minor: None,
            })
        }

        fn merchant_account(&self) -> &str {
            "merchant-account"
        }
    }

    fn setup(
        card: Option<Box<ScriptedCard>>,
        authenticated: bool,
    ) -> (Bridge, Arc<StubBackend>, SharedSession) {
        let session = SharedSession::new();
        if let Some(card) = card {
            let mut guard = session.lock();
            guard.card_id = Some("ABC123".into());
            guard.connection = Some(card);
            guard.activated = true;
            if authenticated {
                guard.token = Some("tok1".into());
                guard.authenticated = true;
            }
        }
        let api = Arc::new(StubBackend::default());
        let bridge = Bridge::new(
            session.clone(),
            api.clone(),
            CardProtocol::new(ProtocolProfile::basic()),
        );
        (bridge, api, session)
    }

    #[tokio::test]
    async fn malformed_pin_is_rejected_before_any_traffic() {
        let (bridge, api, _session) = setup(Some(ScriptedCard::new(vec![])), false);

        let short = bridge.verify_pin("123".into()).await;
        match short {
            OutboundEvent::PinVerificationResult { success, error, .. } => {
                assert!(!success);
                assert_eq!(error.as_deref(), Some("PIN invalide (4 chiffres requis)"));
            }
            other => panic!("unexpected event {other:?}"),
        }

        let letters = bridge.verify_pin("12a4".into()).await;
        match letters {
            OutboundEvent::PinVerificationResult { error, .. } => {
                assert_eq!(
                    error.as_deref(),
                    Some("PIN doit contenir uniquement des chiffres")
                );
            }
            other => panic!("unexpected event {other:?}"),
        }

        assert!(api.calls().is_empty());
    }

    #[tokio::test]
    async fn verify_pin_without_card() {
        let (bridge, api, _session) = setup(None, false);
        match bridge.verify_pin("1234".into()).await {
            OutboundEvent::PinVerificationResult { error, .. } => {
                assert_eq!(error.as_deref(), Some("Aucune carte insérée"));
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(api.calls().is_empty());
    }

    #[tokio::test]
    async fn verify_pin_end_to_end() {
        // Card accepts the PIN, then signs the 4-byte challenge.
        let card = ScriptedCard::new(vec![status(0x90, 0x00), ok(&[0x11, 0x22, 0x33, 0x44])]);
        let (bridge, api, _session) = setup(Some(card), false);

        match bridge.verify_pin("1234".into()).await {
            OutboundEvent::PinVerificationResult {
                success,
                blocked,
                user: Some(user),
                ..
            } => {
                assert!(success);
                assert!(!blocked);
                assert_eq!(user.name, "Alice");
                assert_eq!(user.balance, 12.50);
                assert_eq!(user.card_id, "ABC123");
            }
            other => panic!("unexpected event {other:?}"),
        }

        assert_eq!(
            api.calls(),
            vec![
                "challenge:ABC123",
                "auth:ABC123:deadbeef:11223344",
                "get_user:ABC123",
                "balance:u42",
            ]
        );
    }

    #[tokio::test]
    async fn wrong_pin_reports_the_counter_and_skips_the_backend() {
        let card = ScriptedCard::new(vec![status(0x63, 0xC2)]);
        let (bridge, api, _session) = setup(Some(card), false);

        match bridge.verify_pin("0000".into()).await {
            OutboundEvent::PinVerificationResult {
                success,
                attempts_remaining,
                blocked,
                error,
                user,
                ..
            } => {
                assert!(!success);
                assert_eq!(attempts_remaining, Some(2));
                assert!(!blocked);
                assert_eq!(error, None);
                assert_eq!(user, None);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(api.calls().is_empty());
    }

    #[tokio::test]
    async fn card_pulled_during_challenge_fetch_aborts_the_chain() {
        // Card accepts the PIN; the session empties while the challenge
        // request is in flight, so signing must never be attempted.
        let card = ScriptedCard::new(vec![status(0x90, 0x00)]);
        let (bridge, api, session) = setup(Some(card), false);
        *api.clear_session_on_challenge.lock().unwrap() = Some(session.clone());

        match bridge.verify_pin("1234".into()).await {
            OutboundEvent::PinVerificationResult {
                success,
                error,
                user,
                ..
            } => {
                assert!(!success);
                assert_eq!(error.as_deref(), Some("Aucune carte insérée"));
                assert_eq!(user, None);
            }
            other => panic!("unexpected event {other:?}"),
        }

        assert_eq!(api.calls(), vec!["challenge:ABC123"]);
        let guard = session.lock();
        assert_eq!(guard.token, None);
        assert!(!guard.authenticated);
    }

    #[tokio::test]
    async fn card_pulled_during_backend_auth_never_stores_the_token() {
        // PIN and signing succeed; the session empties while the backend
        // authentication call is in flight. The issued token must be
        // discarded, not attached to the next card's session.
        let card = ScriptedCard::new(vec![status(0x90, 0x00), ok(&[0x11, 0x22, 0x33, 0x44])]);
        let (bridge, api, session) = setup(Some(card), false);
        *api.clear_session_on_auth.lock().unwrap() = Some(session.clone());

        match bridge.verify_pin("1234".into()).await {
            OutboundEvent::PinVerificationResult { success, error, .. } => {
                assert!(!success);
                assert_eq!(error.as_deref(), Some("Aucune carte insérée"));
            }
            other => panic!("unexpected event {other:?}"),
        }

        // User resolution was never reached.
        assert_eq!(
            api.calls(),
            vec!["challenge:ABC123", "auth:ABC123:deadbeef:11223344"]
        );
        let guard = session.lock();
        assert_eq!(guard.token, None);
        assert!(!guard.authenticated);
    }

    #[tokio::test]
    async fn transaction_requires_authentication() {
        let (bridge, api, _session) = setup(Some(ScriptedCard::new(vec![])), false);
        match bridge.create_transaction(2.0, None, false).await {
            OutboundEvent::TransactionResult { success, error, .. } => {
                assert!(!success);
                assert_eq!(
                    error.as_deref(),
                    Some("Non authentifié. Veuillez d'abord vérifier votre PIN.")
                );
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(api.calls().is_empty());
    }

    #[tokio::test]
    async fn transaction_end_to_end() {
        let (bridge, api, _session) = setup(Some(ScriptedCard::new(vec![])), true);
        api.balance_script.lock().unwrap().push(1050);

        match bridge.create_transaction(2.0, None, false).await {
            OutboundEvent::TransactionResult {
                success,
                transaction_id,
                new_balance,
                refund,
                ..
            } => {
                assert!(success);
                assert_eq!(transaction_id.as_deref(), Some("tx1"));
                assert_eq!(new_balance, Some(10.50));
                assert!(!refund);
            }
            other => panic!("unexpected event {other:?}"),
        }

        assert!(api
            .calls()
            .contains(&"post:tok1:merchant-account:200".to_string()));
    }

    #[tokio::test]
    async fn invalid_amounts_never_reach_the_backend() {
        let (bridge, api, _session) = setup(Some(ScriptedCard::new(vec![])), true);

        for amount in [0.0, -5.0, 0.001, f64::NAN, f64::INFINITY] {
            match bridge.create_transaction(amount, None, false).await {
                OutboundEvent::TransactionResult { success, error, .. } => {
                    assert!(!success, "amount {amount}");
                    assert_eq!(error.as_deref(), Some("Montant invalide"), "amount {amount}");
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert!(api.calls().is_empty());
    }

    #[tokio::test]
    async fn balance_query_end_to_end() {
        let (bridge, _api, _session) = setup(Some(ScriptedCard::new(vec![])), true);
        match bridge.get_balance().await {
            OutboundEvent::BalanceResult {
                success, balance, ..
            } => {
                assert!(success);
                assert_eq!(balance, Some(12.50));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn ping_answers_pong() {
        let (bridge, _api, _session) = setup(None, false);
        assert!(matches!(
            bridge.dispatch(InboundRequest::Ping).await,
            OutboundEvent::Pong { .. }
        ));
    }
}
