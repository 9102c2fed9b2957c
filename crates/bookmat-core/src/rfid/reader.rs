//! Card and tag readers.
//!
//! Two readers watch the patron panel: a short-range NFC reader for
//! library cards and a long-range UHF reader for city cards. Both are
//! polled cooperatively and fan into the same `card_detected` event with
//! a normalized UID, so the rest of the system never cares which antenna
//! saw the patron. A third, long-range UHF reader lives inside the
//! cabinet and is used by inventory scans.
//!
//! The hardware sits behind the [`TagPort`] trait; host builds and tests
//! use [`MockTagPort`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::events::{Event, EventBus};

use super::normalize::{normalize_epc, normalize_uid};

/// Default reader poll cadence.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(300);
/// Window in which repeat sightings of the same UID are suppressed.
pub const DEBOUNCE_MS: u64 = 800;

/// Which antenna produced a detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CardSource {
    Nfc,
    Uhf,
}

impl CardSource {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Nfc => "nfc",
            Self::Uhf => "uhf",
        }
    }
}

/// Reader-side failures.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RfidError {
    #[error("reader port: {0}")]
    Port(String),

    #[error(transparent)]
    Frame(#[from] super::frame::FrameError),
}

/// One polling round against a physical reader.
///
/// Implementations return the raw identifiers seen in the field this
/// round; normalization and debouncing happen above.
pub trait TagPort: Send {
    fn poll(&mut self) -> Result<Vec<String>, RfidError>;
}

/// Scripted port for host builds and tests.
pub struct MockTagPort {
    rounds: Arc<Mutex<std::collections::VecDeque<Vec<String>>>>,
}

/// Producer half of a [`MockTagPort`]; tests push tag rounds through it.
#[derive(Clone)]
pub struct MockTagFeed {
    rounds: Arc<Mutex<std::collections::VecDeque<Vec<String>>>>,
}

impl MockTagFeed {
    /// Queues one poll round's worth of raw identifiers.
    pub fn push(&self, tags: Vec<String>) {
        self.rounds.lock().expect("mock tag feed").push_back(tags);
    }
}

impl MockTagPort {
    /// An empty port plus its feed handle.
    #[must_use]
    pub fn new() -> (Self, MockTagFeed) {
        let rounds = Arc::new(Mutex::new(std::collections::VecDeque::new()));
        (
            Self {
                rounds: rounds.clone(),
            },
            MockTagFeed { rounds },
        )
    }
}

impl TagPort for MockTagPort {
    fn poll(&mut self) -> Result<Vec<String>, RfidError> {
        Ok(self
            .rounds
            .lock()
            .expect("mock tag feed")
            .pop_front()
            .unwrap_or_default())
    }
}

/// Serial-attached UHF reader (feature `hardware`).
#[cfg(feature = "hardware")]
pub struct SerialTagPort {
    port: Box<dyn serialport::SerialPort>,
    address: u8,
}

#[cfg(feature = "hardware")]
impl SerialTagPort {
    /// Opens the reader's serial line at the protocol baud rate.
    pub fn open(path: &str, baud: u32) -> Result<Self, RfidError> {
        let port = serialport::new(path, baud)
            .timeout(Duration::from_secs(1))
            .open()
            .map_err(|e| RfidError::Port(e.to_string()))?;
        Ok(Self { port, address: 0 })
    }
}

#[cfg(feature = "hardware")]
impl TagPort for SerialTagPort {
    fn poll(&mut self) -> Result<Vec<String>, RfidError> {
        use std::io::{Read, Write};

        use super::frame::{build_frame, parse_inventory, CMD_INVENTORY};

        let command = build_frame(self.address, CMD_INVENTORY, &[]);
        self.port
            .write_all(&command)
            .map_err(|e| RfidError::Port(e.to_string()))?;

        let mut response = [0u8; 64];
        let n = self
            .port
            .read(&mut response)
            .map_err(|e| RfidError::Port(e.to_string()))?;
        if n == 0 {
            return Ok(Vec::new());
        }
        Ok(parse_inventory(&response[..n])?)
    }
}

/// Unified patron-card reader: two cooperative poll loops feeding one
/// debounced detection stream.
pub struct UnifiedCardReader {
    events: EventBus,
    poll_interval: Duration,
    debounce: Duration,
    running: AtomicBool,
    last_seen: Mutex<HashMap<String, Instant>>,
}

impl UnifiedCardReader {
    #[must_use]
    pub fn new(events: EventBus) -> Self {
        Self {
            events,
            poll_interval: DEFAULT_POLL_INTERVAL,
            debounce: Duration::from_millis(DEBOUNCE_MS),
            running: AtomicBool::new(false),
            last_seen: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stops both poll loops after their current round.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Runs the NFC and UHF poll loops until [`stop`](Self::stop).
    ///
    /// Either port may be absent (reader unplugged); the other loop
    /// still runs. Returns when both loops have wound down.
    pub async fn run(
        self: &Arc<Self>,
        nfc: Option<Box<dyn TagPort>>,
        uhf: Option<Box<dyn TagPort>>,
    ) {
        self.running.store(true, Ordering::SeqCst);
        self.last_seen.lock().expect("debounce table").clear();

        let nfc_loop = self.clone().poll_loop(nfc, CardSource::Nfc);
        let uhf_loop = self.clone().poll_loop(uhf, CardSource::Uhf);
        tokio::join!(nfc_loop, uhf_loop);
        tracing::info!("card reader polling stopped");
    }

    async fn poll_loop(self: Arc<Self>, port: Option<Box<dyn TagPort>>, source: CardSource) {
        let Some(mut port) = port else {
            return;
        };
        tracing::info!(source = source.as_str(), "card poll loop started");
        while self.running.load(Ordering::SeqCst) {
            match port.poll() {
                Ok(tags) => {
                    for raw in tags {
                        self.handle_detection(&raw, source);
                    }
                }
                Err(err) => {
                    tracing::warn!(source = source.as_str(), %err, "card poll failed");
                }
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Normalizes, debounces, and publishes one raw sighting. Public so
    /// tests and the maintenance console can simulate a card tap.
    pub fn handle_detection(&self, raw: &str, source: CardSource) {
        let normalized = match source {
            CardSource::Nfc => normalize_uid(raw),
            CardSource::Uhf => normalize_epc(raw),
        };
        let Some(uid) = normalized else {
            return;
        };

        let now = Instant::now();
        {
            let mut last_seen = self.last_seen.lock().expect("debounce table");
            if let Some(previous) = last_seen.get(&uid) {
                if now.duration_since(*previous) < self.debounce {
                    return;
                }
            }
            last_seen.insert(uid.clone(), now);
        }

        tracing::debug!(uid = %uid, source = source.as_str(), "card detected");
        self.events.publish(Event::CardDetected { uid, source });
    }
}

/// In-cabinet book-tag reader used by inventory scans.
pub struct BookReader {
    port: Mutex<Box<dyn TagPort>>,
}

impl BookReader {
    #[must_use]
    pub fn new(port: Box<dyn TagPort>) -> Self {
        Self {
            port: Mutex::new(port),
        }
    }

    /// Runs `rounds` inventory rounds and returns the distinct
    /// normalized EPCs seen.
    pub fn scan(&self, rounds: u32) -> Result<Vec<String>, RfidError> {
        let mut port = self.port.lock().expect("book reader port");
        let mut seen = Vec::new();
        for _ in 0..rounds {
            for raw in port.poll()? {
                if let Some(epc) = normalize_uid(&raw) {
                    if !seen.contains(&epc) {
                        seen.push(epc);
                    }
                }
            }
        }
        Ok(seen)
    }
}
