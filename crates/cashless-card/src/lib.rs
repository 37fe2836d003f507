//! Cashless card - smart card access for the cashless POS terminal
//!
//! This crate talks to the payment card via PC/SC readers: raw command
//! transmission, the versioned command protocol (identifier, PIN
//! verification, challenge signing) and status-word classification.

pub mod apdu;
pub mod protocol;
pub mod reader;

pub use apdu::{ApduCommand, ApduResponse, CardError, CardTransport};
pub use protocol::{CardProtocol, PinOutcome, ProtocolProfile, SignCommand, MAX_PIN_ATTEMPTS};
pub use reader::CardReader;
