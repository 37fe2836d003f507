//! Terminal configuration
//!
//! Everything is settable from the command line; deployment-sensitive
//! values (backend URL, merchant credentials) also read from the
//! environment so service units never put secrets in argv.

use std::net::SocketAddr;

use cashless_card::{CardProtocol, ProtocolProfile};
use clap::{Parser, ValueEnum};

/// Which card firmware revision the terminal's card stock runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CardProtocolVersion {
    /// First revision: 4-byte challenge, single-shot signing.
    Basic,
    /// Second revision: 32-byte challenge, two-step signing.
    Extended,
}

impl CardProtocolVersion {
    pub fn profile(self) -> ProtocolProfile {
        match self {
            Self::Basic => ProtocolProfile::basic(),
            Self::Extended => ProtocolProfile::extended(),
        }
    }

    pub fn protocol(self) -> CardProtocol {
        CardProtocol::new(self.profile())
    }
}

/// Point-of-sale bridge between the card reader and the cashless backend.
#[derive(Debug, Clone, Parser)]
#[command(name = "cashless-bridge", version, about)]
pub struct BridgeConfig {
    /// Address the event-channel server listens on
    #[arg(long, default_value = "0.0.0.0:8001")]
    pub listen: SocketAddr,

    /// Base URL of the cashless backend API
    #[arg(long, env = "API_BASE_URL", default_value = "http://localhost:3000")]
    pub api_base_url: String,

    /// Account id that receives payments made at this terminal
    #[arg(long, env = "MERCHANT_ACCOUNT")]
    pub merchant_account: String,

    /// Merchant login for refund authorization
    #[arg(long, env = "MERCHANT_USERNAME")]
    pub merchant_username: String,

    /// Merchant password for refund authorization
    #[arg(long, env = "MERCHANT_PASSWORD", hide_env_values = true)]
    pub merchant_password: String,

    /// Card firmware revision to speak
    #[arg(long, value_enum, default_value_t = CardProtocolVersion::Extended)]
    pub card_protocol: CardProtocolVersion,

    /// Presence poll cadence in milliseconds
    #[arg(long, default_value_t = 500)]
    pub poll_interval_ms: u64,

    /// Contact settle time after insertion, in milliseconds
    #[arg(long, default_value_t = 200)]
    pub settle_delay_ms: u64,

    /// Retry cadence while no reader is attached, in milliseconds
    #[arg(long, default_value_t = 2000)]
    pub reader_retry_ms: u64,

    /// Backoff after an unexpected detection failure, in milliseconds
    #[arg(long, default_value_t = 2000)]
    pub error_backoff_ms: u64,
}

impl BridgeConfig {
    pub fn poll_timing(&self) -> crate::session::PollTiming {
        use std::time::Duration;
        crate::session::PollTiming {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            settle_delay: Duration::from_millis(self.settle_delay_ms),
            reader_retry: Duration::from_millis(self.reader_retry_ms),
            error_backoff: Duration::from_millis(self.error_backoff_ms),
        }
    }
}
