//! Cashless card command protocol
//!
//! Two incompatible firmware revisions exist in the field. They share the
//! command framing and the read-id/read-version/verify-pin instructions but
//! differ in how a challenge is signed and in whether the card can report
//! its provisioning state. Rather than two code paths, every operation is
//! driven by a [`ProtocolProfile`] selected once at startup.

use tracing::debug;

use crate::apdu::{ApduCommand, CardError, CardTransport};

/// Maximum PIN attempts the card grants before blocking
pub const MAX_PIN_ATTEMPTS: u8 = 3;

/// How a challenge signature is obtained from the card.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignCommand {
    /// One round trip: challenge in the body, signature in the response.
    Single { ins: u8 },
    /// Two round trips: load the challenge, then request the signature.
    TwoStep { set_ins: u8, get_ins: u8 },
}

/// Instruction-code table and field sizes for one card firmware revision.
#[derive(Debug, Clone)]
pub struct ProtocolProfile {
    pub cla: u8,
    pub ins_read_card_id: u8,
    pub ins_read_version: u8,
    pub ins_verify_pin: u8,
    /// Provisioning probe; absent on the first firmware revision.
    pub ins_pin_defined: Option<u8>,
    /// PIN/PUK counter probe; absent on the first firmware revision.
    pub ins_remaining_attempts: Option<u8>,
    pub card_id_len: u8,
    pub pin_len: usize,
    pub challenge_len: usize,
    pub signature_len: u8,
    pub sign: SignCommand,
}

impl ProtocolProfile {
    /// First firmware revision: 4-byte challenge signed in a single
    /// command, no provisioning probe.
    pub fn basic() -> Self {
        Self {
            cla: 0x80,
            ins_read_card_id: 0x01,
            ins_read_version: 0x02,
            ins_verify_pin: 0x06,
            ins_pin_defined: None,
            ins_remaining_attempts: None,
            card_id_len: 24,
            pin_len: 4,
            challenge_len: 4,
            signature_len: 4,
            sign: SignCommand::Single { ins: 0x08 },
        }
    }

    /// Second firmware revision: 32-byte challenge loaded with one command,
    /// 64-byte signature fetched with another.
    pub fn extended() -> Self {
        Self {
            cla: 0x80,
            ins_read_card_id: 0x01,
            ins_read_version: 0x02,
            ins_verify_pin: 0x06,
            ins_pin_defined: Some(0x0E),
            ins_remaining_attempts: Some(0x0D),
            card_id_len: 24,
            pin_len: 4,
            challenge_len: 32,
            signature_len: 64,
            sign: SignCommand::TwoStep {
                set_ins: 0x0C,
                get_ins: 0x0B,
            },
        }
    }
}

/// Outcome of a PIN presentation.
///
/// A wrong PIN is an expected business result, not an error;
/// `attempts_remaining` is authoritative only when `success` is false and
/// `error` is empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinOutcome {
    pub success: bool,
    pub attempts_remaining: Option<u8>,
    pub blocked: bool,
    pub error: Option<String>,
}

impl PinOutcome {
    fn error(message: String) -> Self {
        Self {
            success: false,
            attempts_remaining: None,
            blocked: false,
            error: Some(message),
        }
    }
}

/// Protocol client for one firmware revision.
///
/// Operations transmit over any [`CardTransport`] and classify the status
/// word into typed outcomes; nothing below this layer surfaces to callers.
#[derive(Debug, Clone)]
pub struct CardProtocol {
    profile: ProtocolProfile,
}

impl CardProtocol {
    pub fn new(profile: ProtocolProfile) -> Self {
        Self { profile }
    }

    pub fn profile(&self) -> &ProtocolProfile {
        &self.profile
    }

    /// Read the card identifier field.
    ///
    /// An all-zero field means the card was never assigned: reported as
    /// `None`, not as an error. Trailing zero padding is stripped.
    pub fn read_card_id(&self, card: &dyn CardTransport) -> Result<Option<String>, CardError> {
        let p = &self.profile;
        let resp = ApduCommand::new(p.cla, p.ins_read_card_id, 0x00, 0x00)
            .le(p.card_id_len)
            .send(card)?;

        if !resp.is_success() {
            return Err(CardError::Status(resp.status_word()));
        }

        let id: String = resp
            .data
            .iter()
            .take_while(|b| **b != 0)
            .map(|b| *b as char)
            .collect();

        Ok((!id.is_empty()).then_some(id))
    }

    /// Read the firmware version byte.
    pub fn read_version(&self, card: &dyn CardTransport) -> Result<u8, CardError> {
        let p = &self.profile;
        let resp = ApduCommand::new(p.cla, p.ins_read_version, 0x00, 0x00)
            .le(0x01)
            .send(card)?;

        if !resp.is_success() {
            return Err(CardError::Status(resp.status_word()));
        }
        resp.data
            .first()
            .copied()
            .ok_or_else(|| CardError::Malformed("empty version response".into()))
    }

    /// Presence heartbeat. The version probe doubles as presence detection:
    /// any successful transmission means the card is still on the contacts,
    /// any transport failure means it was removed.
    pub fn is_card_present(&self, card: &dyn CardTransport) -> bool {
        let p = &self.profile;
        ApduCommand::new(p.cla, p.ins_read_version, 0x00, 0x00)
            .le(0x01)
            .send(card)
            .is_ok()
    }

    /// Whether a PIN has been provisioned on the card.
    ///
    /// Firmware without the probe predates unprovisioned cards in the
    /// field, so those report `true` without touching the wire.
    pub fn check_pin_defined(&self, card: &dyn CardTransport) -> Result<bool, CardError> {
        let p = &self.profile;
        let Some(ins) = p.ins_pin_defined else {
            return Ok(true);
        };
        let resp = ApduCommand::new(p.cla, ins, 0x00, 0x00).le(0x01).send(card)?;
        if !resp.is_success() {
            return Err(CardError::Status(resp.status_word()));
        }
        Ok(resp.data.first() == Some(&1))
    }

    /// Remaining PIN and PUK attempt counters, where the firmware exposes
    /// them. Used for diagnostics logging at insertion.
    pub fn get_remaining_attempts(
        &self,
        card: &dyn CardTransport,
    ) -> Result<Option<(u8, u8)>, CardError> {
        let p = &self.profile;
        let Some(ins) = p.ins_remaining_attempts else {
            return Ok(None);
        };
        let resp = ApduCommand::new(p.cla, ins, 0x00, 0x00).le(0x02).send(card)?;
        if !resp.is_success() {
            return Err(CardError::Status(resp.status_word()));
        }
        match resp.data.as_slice() {
            [pin, puk, ..] => Ok(Some((*pin, *puk))),
            _ => Err(CardError::Malformed("short attempts response".into())),
        }
    }

    /// Present a PIN to the card.
    ///
    /// The PIN travels as raw decimal digit bytes, not ASCII. Callers are
    /// expected to have validated the shape already; a malformed PIN is
    /// still refused here so it can never reach the wire.
    pub fn verify_pin(&self, card: &dyn CardTransport, pin: &str) -> PinOutcome {
        let p = &self.profile;
        if pin.len() != p.pin_len || !pin.chars().all(|c| c.is_ascii_digit()) {
            return PinOutcome::error(format!("PIN must be {} digits", p.pin_len));
        }

        let pin_bytes: Vec<u8> = pin.bytes().map(|b| b - b'0').collect();
        let resp = match ApduCommand::new(p.cla, p.ins_verify_pin, 0x00, 0x00)
            .data(pin_bytes)
            .send(card)
        {
            Ok(resp) => resp,
            Err(e) => return PinOutcome::error(e.to_string()),
        };

        match (resp.sw1, resp.sw2) {
            (0x90, 0x00) => PinOutcome {
                success: true,
                attempts_remaining: Some(MAX_PIN_ATTEMPTS),
                blocked: false,
                error: None,
            },
            // 63Cx: verification failed, low nibble is the counter
            (0x63, sw2) if sw2 & 0xF0 == 0xC0 => {
                let remaining = sw2 & 0x0F;
                PinOutcome {
                    success: false,
                    attempts_remaining: Some(remaining),
                    blocked: remaining == 0,
                    error: None,
                }
            }
            // 6983: counter exhausted in a prior session
            (0x69, 0x83) => PinOutcome {
                success: false,
                attempts_remaining: Some(0),
                blocked: true,
                error: None,
            },
            _ => PinOutcome::error(format!("unexpected status {}", resp.status_string())),
        }
    }

    /// Ask the card to sign a backend-issued challenge.
    ///
    /// The challenge arrives hex-encoded (8 chars on the first firmware
    /// revision, 64 on the second) and the signature is returned raw.
    pub fn sign_challenge(
        &self,
        card: &dyn CardTransport,
        challenge_hex: &str,
    ) -> Result<Vec<u8>, CardError> {
        let p = &self.profile;
        let challenge = hex::decode(challenge_hex)
            .map_err(|e| CardError::Malformed(format!("invalid challenge hex: {e}")))?;
        if challenge.len() != p.challenge_len {
            return Err(CardError::Malformed(format!(
                "challenge must be {} bytes, got {}",
                p.challenge_len,
                challenge.len()
            )));
        }

        match p.sign {
            SignCommand::Single { ins } => {
                let resp = ApduCommand::new(p.cla, ins, 0x00, 0x00)
                    .data(challenge)
                    .le(p.signature_len)
                    .send(card)?;
                if !resp.is_success() {
                    return Err(CardError::Status(resp.status_word()));
                }
                if resp.data.len() != p.signature_len as usize {
                    return Err(CardError::Malformed(format!(
                        "signature length {} instead of {}",
                        resp.data.len(),
                        p.signature_len
                    )));
                }
                Ok(resp.data)
            }
            SignCommand::TwoStep { set_ins, get_ins } => {
                let set = ApduCommand::new(p.cla, set_ins, 0x00, 0x00)
                    .data(challenge)
                    .send(card)?;
                if !set.is_success() {
                    return Err(CardError::Status(set.status_word()));
                }

                let mut resp = ApduCommand::new(p.cla, get_ins, 0x00, 0x00)
                    .le(p.signature_len)
                    .send(card)?;

                // Wrong-length: SW2 encodes the expected length. Re-issue
                // once with the corrected value, then it is a hard failure.
                if let Some(expected) = resp.wrong_length() {
                    debug!(expected, "re-issuing signature request with corrected length");
                    resp = ApduCommand::new(p.cla, get_ins, 0x00, 0x00)
                        .le(expected)
                        .send(card)?;
                }

                if !resp.is_success() {
                    return Err(CardError::Status(resp.status_word()));
                }
                if resp.data.is_empty() {
                    return Err(CardError::Malformed("empty signature".into()));
                }
                Ok(resp.data)
            }
        }
    }
}
