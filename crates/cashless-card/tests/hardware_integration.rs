//! Hardware-dependent integration tests
//!
//! These tests require a physical cashless card in a card reader.
//! They are ignored by default and must be explicitly run with:
//!
//!     cargo test --package cashless-card --test hardware_integration -- --ignored

use cashless_card::{CardProtocol, CardReader, CardTransport, ProtocolProfile};

/// Test that we can connect to a card reader
///
/// **Requires**: Card reader connected (card not required)
#[test]
#[ignore = "requires hardware: card reader"]
fn test_connect_to_reader() {
    let result = CardReader::new();
    assert!(
        result.is_ok(),
        "Failed to connect to card reader. Is a reader connected?"
    );
}

/// Test that we can detect an inserted card
///
/// **Requires**: Card reader with card inserted
#[test]
#[ignore = "requires hardware: card inserted in reader"]
fn test_card_present() {
    let reader = CardReader::new().expect("Failed to connect to reader");
    let (_card, reader_name) = reader.connect_first().expect("Failed to connect to card");
    println!("Connected to reader: {}", reader_name);
}

/// Read the identifier off an assigned card
///
/// **Requires**: Assigned cashless card inserted
#[test]
#[ignore = "requires hardware: assigned cashless card"]
fn test_read_card_id() {
    let reader = CardReader::new().expect("Failed to connect to reader");
    let (card, _reader_name) = reader.connect_first().expect("Failed to connect to card");
    let protocol = CardProtocol::new(ProtocolProfile::extended());

    let id = protocol
        .read_card_id(&card as &dyn CardTransport)
        .expect("read_card_id failed");
    println!("Card identifier: {:?}", id);
    assert!(id.is_some(), "Card reports no identifier; is it assigned?");
}

/// The version probe doubles as the presence heartbeat
///
/// **Requires**: Cashless card inserted
#[test]
#[ignore = "requires hardware: cashless card"]
fn test_presence_heartbeat() {
    let reader = CardReader::new().expect("Failed to connect to reader");
    let (card, _reader_name) = reader.connect_first().expect("Failed to connect to card");
    let protocol = CardProtocol::new(ProtocolProfile::extended());

    assert!(protocol.is_card_present(&card as &dyn CardTransport));
    let version = protocol
        .read_version(&card as &dyn CardTransport)
        .expect("read_version failed");
    println!("Firmware version: {}", version);
}
