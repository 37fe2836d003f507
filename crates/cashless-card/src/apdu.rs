//! APDU command encoding and the card transport abstraction

use pcsc::MAX_BUFFER_SIZE;
use thiserror::Error;

/// Errors produced by card communication.
///
/// Transport faults never unwind as panics or raw `pcsc::Error` values past
/// this crate; callers receive one of these and decide whether it means
/// "card removed" (transport) or "broken exchange" (status/malformed).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CardError {
    /// The reader/card link failed mid-exchange. The poller treats this as
    /// "card no longer present".
    #[error("card transport failure: {0}")]
    Transport(String),
    /// The card answered with a status word we do not handle. Carries the
    /// raw word for diagnostics.
    #[error("unexpected status word {0:04X}")]
    Status(u16),
    /// The exchange succeeded at the wire level but the payload is unusable.
    #[error("malformed card response: {0}")]
    Malformed(String),
}

/// APDU response containing data and status word
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApduResponse {
    /// Response data (without status word)
    pub data: Vec<u8>,
    /// Status word SW1
    pub sw1: u8,
    /// Status word SW2
    pub sw2: u8,
}

impl ApduResponse {
    /// Check if the response indicates success (9000)
    pub fn is_success(&self) -> bool {
        self.sw1 == 0x90 && self.sw2 == 0x00
    }

    /// Get the full status word as a 16-bit value
    pub fn status_word(&self) -> u16 {
        ((self.sw1 as u16) << 8) | (self.sw2 as u16)
    }

    /// Get status word as hex string (e.g., "9000")
    pub fn status_string(&self) -> String {
        format!("{:02X}{:02X}", self.sw1, self.sw2)
    }

    /// Wrong-length status (SW1 = 6C). SW2 carries the expected length the
    /// command should be re-issued with.
    pub fn wrong_length(&self) -> Option<u8> {
        (self.sw1 == 0x6C).then_some(self.sw2)
    }

    /// Parse a raw reader response into data + status word.
    pub fn parse(raw: &[u8]) -> Result<Self, CardError> {
        if raw.len() < 2 {
            return Err(CardError::Malformed(format!(
                "response too short: {} byte(s)",
                raw.len()
            )));
        }
        Ok(Self {
            data: raw[..raw.len() - 2].to_vec(),
            sw1: raw[raw.len() - 2],
            sw2: raw[raw.len() - 1],
        })
    }
}

/// Raw command transmission to an inserted card.
///
/// Implemented for `pcsc::Card`; tests and the protocol client depend only
/// on this trait so card behaviour can be scripted without hardware.
pub trait CardTransport: Send {
    fn transmit(&self, apdu: &[u8]) -> Result<ApduResponse, CardError>;
}

impl CardTransport for pcsc::Card {
    fn transmit(&self, apdu: &[u8]) -> Result<ApduResponse, CardError> {
        let mut rapdu_buf = [0; MAX_BUFFER_SIZE];
        let rapdu = pcsc::Card::transmit(self, apdu, &mut rapdu_buf)
            .map_err(|e| CardError::Transport(e.to_string()))?;
        ApduResponse::parse(rapdu)
    }
}

/// APDU command builder.
///
/// Commands are a fixed 5-byte header (class, instruction, P1, P2,
/// data-length-or-expected-length) optionally followed by a data body.
#[derive(Debug, Clone)]
pub struct ApduCommand {
    cla: u8,
    ins: u8,
    p1: u8,
    p2: u8,
    data: Vec<u8>,
    le: Option<u8>,
}

impl ApduCommand {
    /// Create a new APDU command
    pub fn new(cla: u8, ins: u8, p1: u8, p2: u8) -> Self {
        Self {
            cla,
            ins,
            p1,
            p2,
            data: Vec::new(),
            le: None,
        }
    }

    /// Set command data
    pub fn data(mut self, data: Vec<u8>) -> Self {
        self.data = data;
        self
    }

    /// Set expected response length
    pub fn le(mut self, le: u8) -> Self {
        self.le = Some(le);
        self
    }

    /// Build the APDU command bytes
    pub fn build(&self) -> Vec<u8> {
        let mut apdu = vec![self.cla, self.ins, self.p1, self.p2];

        if !self.data.is_empty() {
            apdu.push(self.data.len() as u8);
            apdu.extend_from_slice(&self.data);
        }

        if let Some(le) = self.le {
            apdu.push(le);
        }

        apdu
    }

    /// Send this command to the card
    pub fn send(&self, card: &dyn CardTransport) -> Result<ApduResponse, CardError> {
        card.transmit(&self.build())
    }
}
