//! Cashless backend client
//!
//! Raw endpoint contracts live on the [`CashlessApi`] trait; the multi-step
//! operations (user resolution, transaction creation with its refund and
//! balance-refresh rules) are provided methods on the trait so the
//! orchestration layer and the tests exercise the exact same sequencing.
//!
//! Monetary amounts cross the HTTP boundary as integer minor units and are
//! decimal everywhere else.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::BridgeConfig;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// Non-2xx answer; carries the backend's own message when parseable.
    #[error("{message}")]
    Api { status: u16, message: String },
    #[error("Request timeout")]
    Timeout,
    #[error("backend request failed: {0}")]
    Http(String),
    #[error("invalid response: missing {0}")]
    MissingField(&'static str),
}

impl From<reqwest::Error> for BackendError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            BackendError::Timeout
        } else {
            BackendError::Http(e.to_string())
        }
    }
}

/// User record as the backend returns it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendUser {
    pub id: String,
    pub name: String,
}

/// Resolved cardholder: display name, decimal balance, account id.
#[derive(Debug, Clone, PartialEq)]
pub struct UserProfile {
    pub user_id: String,
    pub display_name: String,
    pub balance: f64,
}

/// What `POST /transactions` reports back. The reported balance is only
/// ever logged; the authoritative balance comes from a fresh fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionReceipt {
    pub transaction_id: Option<String>,
    pub reported_balance_minor: Option<i64>,
}

/// Final result of a committed-and-confirmed transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedTransaction {
    pub transaction_id: Option<String>,
    pub new_balance: f64,
}

/// Backend contract. Raw operations mirror single HTTP calls; provided
/// methods compose them with the sequencing rules the terminal relies on.
#[async_trait]
pub trait CashlessApi: Send + Sync {
    async fn get_challenge(&self, card_id: &str) -> Result<String, BackendError>;

    async fn authenticate_card(
        &self,
        card_id: &str,
        challenge: &str,
        signature: &[u8],
    ) -> Result<String, BackendError>;

    /// The terminal's own operating credential, logged in lazily and cached.
    async fn merchant_token(&self) -> Result<String, BackendError>;

    /// Drop the cached merchant credential so the next use re-logs-in.
    fn invalidate_merchant_token(&self);

    async fn get_user(&self, card_id: &str, token: &str) -> Result<BackendUser, BackendError>;

    async fn get_balance_minor(&self, user_id: &str, token: &str) -> Result<i64, BackendError>;

    async fn post_transaction(
        &self,
        token: &str,
        destination_user_id: &str,
        operation_minor: i64,
    ) -> Result<TransactionReceipt, BackendError>;

    /// Account receiving normal payments, from terminal configuration.
    fn merchant_account(&self) -> &str;

    /// Two sequential lookups: user by card, then balance by resolved id.
    /// The second is skipped when the first fails. The display name is the
    /// first token of the full name.
    async fn fetch_user_by_card(
        &self,
        card_id: &str,
        token: &str,
    ) -> Result<UserProfile, BackendError> {
        let user = self.get_user(card_id, token).await?;
        let minor = self.get_balance_minor(&user.id, token).await?;
        let display_name = user
            .name
            .split_whitespace()
            .next()
            .unwrap_or("Utilisateur")
            .to_string();
        Ok(UserProfile {
            user_id: user.id,
            display_name,
            balance: minor as f64 / 100.0,
        })
    }

    /// Standalone balance refresh for an already-identified session.
    async fn get_user_balance(&self, token: &str, card_id: &str) -> Result<f64, BackendError> {
        let user = self.get_user(card_id, token).await?;
        Ok(self.get_balance_minor(&user.id, token).await? as f64 / 100.0)
    }

    /// Create a debit or refund transaction.
    ///
    /// A payment is authorized by the cardholder's token towards the
    /// configured merchant account. A refund flips the principal: the
    /// merchant's own token pays back the cardholder's account, which must
    /// resolve first - if it does not, no transaction is attempted.
    ///
    /// After a commit the new balance is always re-fetched; a failed
    /// refresh fails the whole operation even though the money has moved.
    async fn create_transaction(
        &self,
        card_token: &str,
        card_id: &str,
        amount_minor: i64,
        is_refund: bool,
    ) -> Result<CompletedTransaction, BackendError> {
        let (auth_token, destination) = if is_refund {
            let holder = self.fetch_user_by_card(card_id, card_token).await?;
            (self.merchant_token().await?, holder.user_id)
        } else {
            (card_token.to_string(), self.merchant_account().to_string())
        };

        let receipt = match self
            .post_transaction(&auth_token, &destination, amount_minor)
            .await
        {
            // A stale cached merchant credential earns one re-login.
            Err(BackendError::Api { status: 401, .. }) if is_refund => {
                self.invalidate_merchant_token();
                let fresh = self.merchant_token().await?;
                self.post_transaction(&fresh, &destination, amount_minor)
                    .await?
            }
            other => other?,
        };

        if let Some(reported) = receipt.reported_balance_minor {
            debug!(reported, "transaction response balance ignored, re-fetching");
        }
        let new_balance = self.get_user_balance(card_token, card_id).await?;

        Ok(CompletedTransaction {
            transaction_id: receipt.transaction_id,
            new_balance,
        })
    }
}

/// Cached merchant identity: bearer token plus the merchant's account id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerchantIdentity {
    pub token: String,
    pub user_id: String,
}

/// Credential holder for the terminal's merchant login: lazily populated,
/// externally invalidatable, never a process-wide global.
#[derive(Debug, Default)]
pub struct MerchantCredential {
    cached: Mutex<Option<MerchantIdentity>>,
}

impl MerchantCredential {
    pub fn cached(&self) -> Option<MerchantIdentity> {
        self.cached
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn store(&self, identity: MerchantIdentity) {
        *self.cached.lock().unwrap_or_else(PoisonError::into_inner) = Some(identity);
    }

    pub fn invalidate(&self) {
        *self.cached.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChallengeBody {
    challenge: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenBody {
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LoginBody {
    token: Option<String>,
    user: Option<LoginUser>,
}

#[derive(Debug, Deserialize)]
struct LoginUser {
    id: String,
}

#[derive(Debug, Deserialize)]
struct UserBody {
    #[serde(rename = "_id")]
    id: Option<String>,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BalanceBody {
    balance: Option<i64>,
}

#[derive(Debug, Serialize)]
struct TransactionRequestBody<'a> {
    destination_user_id: &'a str,
    operation: i64,
}

#[derive(Debug, Deserialize)]
struct TransactionBody {
    id: Option<String>,
    #[serde(rename = "newBalance")]
    new_balance: Option<i64>,
}

/// HTTP implementation of the backend contract.
pub struct BackendClient {
    http: reqwest::Client,
    base_url: String,
    merchant_account: String,
    merchant_username: String,
    merchant_password: String,
    merchant: MerchantCredential,
}

impl BackendClient {
    pub fn new(config: &BridgeConfig) -> Result<Self, BackendError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            http,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            merchant_account: config.merchant_account.clone(),
            merchant_username: config.merchant_username.clone(),
            merchant_password: config.merchant_password.clone(),
            merchant: MerchantCredential::default(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Turn a non-2xx response into an error carrying the backend's own
    /// message when the body is parseable.
    async fn api_error(resp: reqwest::Response) -> BackendError {
        let status = resp.status().as_u16();
        let message = match resp.json::<ApiErrorBody>().await {
            Ok(ApiErrorBody { error: Some(msg) }) => msg,
            _ => format!("Status {status}"),
        };
        BackendError::Api { status, message }
    }
}

#[async_trait]
impl CashlessApi for BackendClient {
    async fn get_challenge(&self, card_id: &str) -> Result<String, BackendError> {
        let resp = self
            .http
            .get(self.url("/auth/challenge"))
            .query(&[("card_id", card_id)])
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Self::api_error(resp).await);
        }
        resp.json::<ChallengeBody>()
            .await?
            .challenge
            .ok_or(BackendError::MissingField("challenge"))
    }

    async fn authenticate_card(
        &self,
        card_id: &str,
        challenge: &str,
        signature: &[u8],
    ) -> Result<String, BackendError> {
        use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

        let resp = self
            .http
            .post(self.url("/auth/card"))
            .json(&serde_json::json!({
                "card_id": card_id,
                "challenge": challenge,
                "signature": BASE64.encode(signature),
            }))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Self::api_error(resp).await);
        }
        resp.json::<TokenBody>()
            .await?
            .token
            .ok_or(BackendError::MissingField("token"))
    }

    async fn merchant_token(&self) -> Result<String, BackendError> {
        if let Some(identity) = self.merchant.cached() {
            return Ok(identity.token);
        }

        let resp = self
            .http
            .post(self.url("/auth/login"))
            .json(&serde_json::json!({
                "username": self.merchant_username,
                "password": self.merchant_password,
            }))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Self::api_error(resp).await);
        }
        let body: LoginBody = resp.json().await?;
        let token = body.token.ok_or(BackendError::MissingField("token"))?;
        let user_id = body.user.map(|u| u.id).unwrap_or_default();

        info!("merchant login succeeded");
        self.merchant.store(MerchantIdentity {
            token: token.clone(),
            user_id,
        });
        Ok(token)
    }

    fn invalidate_merchant_token(&self) {
        self.merchant.invalidate();
    }

    async fn get_user(&self, card_id: &str, token: &str) -> Result<BackendUser, BackendError> {
        let resp = self
            .http
            .get(self.url("/user"))
            .query(&[("card_id", card_id)])
            .bearer_auth(token)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Self::api_error(resp).await);
        }
        let body: UserBody = resp.json().await?;
        Ok(BackendUser {
            id: body.id.ok_or(BackendError::MissingField("_id"))?,
            name: body.name.ok_or(BackendError::MissingField("name"))?,
        })
    }

    async fn get_balance_minor(&self, user_id: &str, token: &str) -> Result<i64, BackendError> {
        let resp = self
            .http
            .get(self.url(&format!("/user/{user_id}/balance")))
            .bearer_auth(token)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Self::api_error(resp).await);
        }
        resp.json::<BalanceBody>()
            .await?
            .balance
            .ok_or(BackendError::MissingField("balance"))
    }

    async fn post_transaction(
        &self,
        token: &str,
        destination_user_id: &str,
        operation_minor: i64,
    ) -> Result<TransactionReceipt, BackendError> {
        let resp = self
            .http
            .post(self.url("/transactions"))
            .bearer_auth(token)
            .json(&TransactionRequestBody {
                destination_user_id,
                operation: operation_minor,
            })
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Self::api_error(resp).await);
        }
        let body: TransactionBody = resp.json().await?;
        Ok(TransactionReceipt {
            transaction_id: body.id,
            reported_balance_minor: body.new_balance,
        })
    }

    fn merchant_account(&self) -> &str {
        &self.merchant_account
    }
}
