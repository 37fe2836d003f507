//! Card session state and the presence-polling loop
//!
//! One physical reader, one active session. The poller is the only writer
//! for insertion/removal; request handlers read and write the same
//! aggregate through [`SharedSession`], so everything goes through a single
//! mutex. Card readers expose no asynchronous removal notification, hence
//! the bounded-latency poll (detection latency is one poll interval plus
//! the settle delay).

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use cashless_card::{CardError, CardProtocol, CardReader, CardTransport};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::events::OutboundEvent;

/// The single mutable session aggregate.
#[derive(Default)]
pub struct Session {
    pub card_id: Option<String>,
    pub connection: Option<Box<dyn CardTransport>>,
    pub token: Option<String>,
    pub activated: bool,
    pub authenticated: bool,
}

impl Session {
    /// Tear the session down, returning the card id that was active.
    /// Dropping the connection releases it; release failures never surface.
    pub fn finalize(&mut self) -> Option<String> {
        let old = self.card_id.take();
        self.connection = None;
        self.token = None;
        self.activated = false;
        self.authenticated = false;
        old
    }
}

/// Handle to the session shared between the poller and request handlers.
#[derive(Clone, Default)]
pub struct SharedSession(Arc<Mutex<Session>>);

impl SharedSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, Session> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn current_card_id(&self) -> Option<String> {
        self.lock().card_id.clone()
    }

    /// Insertion state for late-joining event-channel clients.
    pub fn insertion_snapshot(&self) -> Option<(String, bool)> {
        let session = self.lock();
        session.card_id.clone().map(|id| (id, session.activated))
    }
}

/// Where cards come from: reader binding and connection attempts.
/// Abstracted so the poller can run against scripted hardware in tests.
pub trait CardSource: Send {
    /// Enumerate devices and bind the first reader, if any.
    fn bind_reader(&mut self) -> Option<String>;
    /// Device-enumeration membership test for the bound reader.
    fn reader_present(&self, name: &str) -> bool;
    /// Try to open a connection; `None` means no card on the contacts.
    fn connect(&mut self) -> Option<Box<dyn CardTransport>>;
}

/// PC/SC-backed card source.
#[derive(Default)]
pub struct PcscSource {
    reader: Option<CardReader>,
}

impl CardSource for PcscSource {
    fn bind_reader(&mut self) -> Option<String> {
        if self.reader.is_none() {
            match CardReader::new() {
                Ok(reader) => self.reader = Some(reader),
                Err(e) => {
                    debug!(error = %e, "PC/SC context unavailable");
                    return None;
                }
            }
        }
        match self.reader.as_ref()?.list_readers() {
            Ok(readers) => readers.into_iter().next(),
            Err(e) => {
                debug!(error = %e, "reader enumeration failed");
                self.reader = None;
                None
            }
        }
    }

    fn reader_present(&self, name: &str) -> bool {
        self.reader
            .as_ref()
            .map(|r| r.reader_present(name))
            .unwrap_or(false)
    }

    fn connect(&mut self) -> Option<Box<dyn CardTransport>> {
        match self.reader.as_ref()?.connect_first() {
            Ok((card, _reader_name)) => Some(Box::new(card)),
            Err(_) => None,
        }
    }
}

/// Polling cadences, all configurable.
#[derive(Debug, Clone, Copy)]
pub struct PollTiming {
    pub poll_interval: Duration,
    pub settle_delay: Duration,
    pub reader_retry: Duration,
    pub error_backoff: Duration,
}

/// Commands sent to the poller thread.
#[derive(Debug)]
pub enum PollerCommand {
    Stop,
}

/// Background worker owning presence detection for the process lifetime.
pub struct CardPoller {
    session: SharedSession,
    events: broadcast::Sender<OutboundEvent>,
    protocol: CardProtocol,
    timing: PollTiming,
    commands: Receiver<PollerCommand>,
}

impl CardPoller {
    /// Spawn the polling loop on a dedicated thread (PC/SC calls block).
    pub fn spawn(
        session: SharedSession,
        events: broadcast::Sender<OutboundEvent>,
        protocol: CardProtocol,
        timing: PollTiming,
        source: Box<dyn CardSource>,
    ) -> (thread::JoinHandle<()>, Sender<PollerCommand>) {
        let (command_tx, command_rx) = mpsc::channel();
        let poller = CardPoller {
            session,
            events,
            protocol,
            timing,
            commands: command_rx,
        };
        let handle = thread::spawn(move || poller.run(source));
        (handle, command_tx)
    }

    fn run(self, mut source: Box<dyn CardSource>) {
        info!("card detection loop started");

        let mut reader: Option<String> = None;

        loop {
            if let Ok(PollerCommand::Stop) = self.commands.try_recv() {
                info!("card detection loop stopping");
                break;
            }

            // Re-validate the bound reader by enumeration each cycle.
            if let Some(name) = &reader {
                if !source.reader_present(name) {
                    warn!(reader = %name, "card reader disappeared");
                    self.finalize_session();
                    reader = None;
                }
            }

            if reader.is_none() {
                match source.bind_reader() {
                    Some(name) => {
                        info!(reader = %name, "card reader bound");
                        reader = Some(name);
                    }
                    None => {
                        thread::sleep(self.timing.reader_retry);
                        continue;
                    }
                }
            }

            match self.cycle(source.as_mut()) {
                Ok(()) => thread::sleep(self.timing.poll_interval),
                Err(e) => {
                    // The loop must survive anything short of Stop.
                    error!(error = %e, "card detection cycle failed");
                    self.finalize_session();
                    thread::sleep(self.timing.error_backoff);
                }
            }
        }

        // Controlled shutdown: release quietly, no removal event.
        self.session.lock().finalize();
        info!("card detection loop stopped");
    }

    fn cycle(&self, source: &mut dyn CardSource) -> Result<(), CardError> {
        if self.session.lock().connection.is_some() {
            self.heartbeat();
            return Ok(());
        }

        let Some(connection) = source.connect() else {
            // No card on the contacts.
            return Ok(());
        };

        // Contact settle time before the first exchange.
        thread::sleep(self.timing.settle_delay);

        let card_id = match self.protocol.read_card_id(connection.as_ref()) {
            Ok(Some(id)) => id,
            // Unassigned card: nothing to announce.
            Ok(None) => return Ok(()),
            // Pulled again before identification.
            Err(CardError::Transport(e)) => {
                debug!(error = %e, "card gone before identification");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let activated = match self.protocol.check_pin_defined(connection.as_ref()) {
            Ok(activated) => activated,
            Err(e) => {
                warn!(error = %e, "activation probe failed, assuming provisioned");
                true
            }
        };
        if let Ok(Some((pin, puk))) = self.protocol.get_remaining_attempts(connection.as_ref()) {
            debug!(pin_attempts = pin, puk_attempts = puk, "card attempt counters");
        }

        self.start_session(card_id, activated, connection);
        Ok(())
    }

    /// Same-card presence check. Repeated successes never re-emit the
    /// insertion; the first failure finalizes the session.
    fn heartbeat(&self) {
        let mut session = self.session.lock();
        let alive = session
            .connection
            .as_ref()
            .map(|conn| self.protocol.is_card_present(conn.as_ref()))
            .unwrap_or(false);
        if alive {
            return;
        }
        let old = session.finalize();
        drop(session);
        if let Some(card_id) = old {
            info!(card_id = %card_id, "card removed");
            self.emit(OutboundEvent::card_removed(card_id));
        }
    }

    /// Start a session for a newly identified card. A still-active prior
    /// session is finalized first: a changed id always produces exactly one
    /// removal followed by one insertion.
    fn start_session(
        &self,
        card_id: String,
        activated: bool,
        connection: Box<dyn CardTransport>,
    ) {
        let replaced = {
            let mut session = self.session.lock();
            let replaced = session.finalize();
            session.card_id = Some(card_id.clone());
            session.connection = Some(connection);
            session.activated = activated;
            replaced
        };
        if let Some(old) = replaced {
            info!(card_id = %old, "card session replaced");
            self.emit(OutboundEvent::card_removed(old));
        }
        info!(card_id = %card_id, activated, "card inserted");
        self.emit(OutboundEvent::card_inserted(card_id, activated));
    }

    fn finalize_session(&self) {
        let old = self.session.lock().finalize();
        if let Some(card_id) = old {
            self.emit(OutboundEvent::card_removed(card_id));
        }
    }

    fn emit(&self, event: OutboundEvent) {
        // No connected clients is fine.
        let _ = self.events.send(event);
    }
}
