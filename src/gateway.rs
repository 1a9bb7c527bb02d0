use std::sync::Arc;

use tracing::{info, warn};

use crate::{
    config::{Config, ModemConfig},
    engine::AtEngine,
    error::Result,
    mock::MockModem,
    poller::{Poller, PollerHandle},
    sender::SmsSender,
    serial::{serial_port::SerialTransport, Transport},
    server::AppState,
    store::{JsonLinesStore, Store},
};

fn open_transport(modem: &ModemConfig) -> Result<Box<dyn Transport>> {
    match modem {
        ModemConfig::Serial(serial) => Ok(Box::new(SerialTransport::open(serial)?)),
        ModemConfig::Mock => {
            warn!("Using a mock modem, sent SMS loop back into its inbox");
            Ok(Box::new(MockModem::loopback()))
        }
    }
}

/// A running gateway: the modem, the store, and the background poller.
pub struct Gateway {
    /// What the HTTP handlers use.
    pub state: AppState,

    poller: PollerHandle,
}

impl Gateway {
    /// Open the modem and the store, and start polling.
    ///
    /// Fails with [`crate::error::Error::DeviceUnavailable`] if the modem cannot be opened.
    pub async fn start(config: &Config) -> Result<Self> {
        let transport = open_transport(&config.modem)?;
        let engine = AtEngine::new(transport, config.timings.clone());

        let store = Arc::new(JsonLinesStore::open(&config.store_path).await?);

        Ok(Self::with_parts(engine, store, &config.api_key))
    }

    /// Start polling with an engine and store built elsewhere.
    pub fn with_parts(engine: AtEngine, store: Arc<dyn Store>, api_key: &str) -> Self {
        let poller = Poller::new(engine.clone(), store.clone()).spawn();

        let state = AppState {
            sender: SmsSender::new(engine),
            store,
            api_key: Arc::from(api_key),
        };

        info!("Gateway started");

        Self { state, poller }
    }

    /// Stop the poller, letting a running cycle finish.
    pub async fn shutdown(self) {
        self.poller.shutdown().await;
        info!("Gateway stopped");
    }
}
