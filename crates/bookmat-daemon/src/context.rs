//! System context.
//!
//! One owned aggregate constructed at startup and passed by `Arc` to
//! everything that needs a component. There are no process-wide
//! singletons: tests build as many contexts as they like, each with its
//! own mock hardware and its own store.

use std::sync::Arc;

use bookmat_core::calibration::CalibrationStore;
use bookmat_core::events::EventBus;
use bookmat_core::gpio::{Gpio, GpioError, MockGpio, PinMap};
use bookmat_core::motion::Algorithms;
use bookmat_core::motors::MotorDriver;
use bookmat_core::rfid::UnifiedCardReader;
use bookmat_core::sensors::SensorFilter;
use bookmat_core::servos::LatchDriver;
use bookmat_core::shutters::ShutterDriver;
use bookmat_irbis::{IrbisService, LibraryClient, MockLibrary};

use crate::config::Config;
use crate::services::Transactions;
use crate::store::{Store, StoreError};

/// Context construction failures.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ContextError {
    #[error(transparent)]
    Gpio(#[from] GpioError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Everything the daemon runs on.
pub struct SystemContext {
    pub config: Config,
    pub gpio: Arc<Gpio>,
    pub sensors: Arc<SensorFilter>,
    pub motors: Arc<MotorDriver>,
    pub latches: Arc<LatchDriver>,
    pub shutters: Arc<ShutterDriver>,
    pub algorithms: Arc<Algorithms>,
    pub calibration: Arc<CalibrationStore>,
    pub store: Store,
    pub library: Arc<dyn LibraryClient>,
    pub events: EventBus,
    pub card_reader: Arc<UnifiedCardReader>,
    pub transactions: Arc<Transactions>,
    /// Present only on mock builds; test hooks into the fake hardware.
    pub mock_gpio: Option<Arc<MockGpio>>,
}

impl SystemContext {
    /// Builds a context for the configured deployment.
    ///
    /// Mock mode wires the in-memory GPIO backend and, unless overridden,
    /// the in-memory library backend; the store always lives at the
    /// configured path.
    pub fn build(config: Config) -> Result<Arc<Self>, ContextError> {
        let store = Store::open(&config.database_path)?;
        Self::assemble(config, store)
    }

    /// Builds a fully in-memory context for tests and host smoke runs.
    pub fn build_mock(config: &Config) -> Result<Arc<Self>, ContextError> {
        let mut config = config.clone();
        config.mock_mode = true;
        let store = Store::open_in_memory()?;
        Self::assemble(config, store)
    }

    fn assemble(config: Config, store: Store) -> Result<Arc<Self>, ContextError> {
        #[cfg(feature = "hardware")]
        let (gpio, mock_gpio) = if config.mock_mode {
            let (gpio, mock) = Gpio::mock();
            (gpio, Some(mock))
        } else {
            let backend = Arc::new(bookmat_core::gpio::RaspiGpio::open()?);
            (Arc::new(Gpio::new(backend)), None)
        };
        #[cfg(not(feature = "hardware"))]
        let (gpio, mock_gpio) = {
            if !config.mock_mode {
                tracing::warn!("built without the hardware feature; using mock GPIO");
            }
            let (gpio, mock) = Gpio::mock();
            (gpio, Some(mock))
        };

        let pins = PinMap::default();

        let calibration = Arc::new(CalibrationStore::open(&config.calibration_path));
        let sensors = Arc::new(SensorFilter::new(gpio.clone(), &pins)?);
        let motors = Arc::new(MotorDriver::new(
            gpio.clone(),
            pins,
            calibration.clone(),
            sensors.clone(),
        )?);
        let latches = Arc::new(LatchDriver::new(gpio.clone(), &pins, calibration.clone())?);
        let shutters = Arc::new(ShutterDriver::new(gpio.clone(), &pins)?);
        let events = EventBus::default();
        let algorithms = Arc::new(Algorithms::new(
            motors.clone(),
            latches.clone(),
            shutters.clone(),
            sensors.clone(),
            calibration.clone(),
            events.clone(),
        ));

        if config.mock_mode {
            store.seed_demo_data()?;
        }

        let library: Arc<dyn LibraryClient> = if config.use_mock_library() {
            Arc::new(MockLibrary::seeded())
        } else {
            Arc::new(IrbisService::new(config.irbis.clone()))
        };

        let card_reader = Arc::new(UnifiedCardReader::new(events.clone()));
        let transactions = Arc::new(Transactions::new(
            store.clone(),
            library.clone(),
            algorithms.clone(),
            events.clone(),
            None,
            config.timeouts,
            config.irbis.loan_days,
        ));

        Ok(Arc::new(Self {
            config,
            gpio,
            sensors,
            motors,
            latches,
            shutters,
            algorithms,
            calibration,
            store,
            library,
            events,
            card_reader,
            transactions,
            mock_gpio,
        }))
    }

    /// Parks the hardware; idempotent.
    pub fn shutdown(&self) {
        self.algorithms.stop();
        self.card_reader.stop();
        self.gpio.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bookmat_core::cabinet;
    use crate::store::models::CellStatus;

    #[tokio::test]
    async fn test_mock_context_builds_and_seeds() {
        let context = SystemContext::build_mock(&Config::default()).unwrap();
        let cells = context.store.get_all_cells().unwrap();
        assert_eq!(cells.len(), cabinet::TOTAL_CELLS);
        assert!(cells.iter().any(|c| c.status == CellStatus::Occupied));
        assert!(context.store.get_user_by_rfid("CARD001").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let context = SystemContext::build_mock(&Config::default()).unwrap();
        context.shutdown();
        context.shutdown();
    }
}
