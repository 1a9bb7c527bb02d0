#![allow(dead_code)]

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};

use async_trait::async_trait;
use color_eyre::Result;
use sms_gateway::{
    config::Timings,
    engine::AtEngine,
    error::{self, Error},
    gateway::Gateway,
    mock::MockModem,
    server,
    store::{JsonLinesStore, NewMessage, Store, StoredMessage},
};
use tempfile::TempDir;
use tokio::sync::oneshot;
use tracing::{info, Level};

pub const API_KEY: &str = "test-key";

/// Wraps a store, counting reads and optionally failing writes.
pub struct CountingStore {
    inner: JsonLinesStore,
    pub reads: AtomicUsize,
    pub fail_inserts: AtomicBool,
}

#[async_trait]
impl Store for CountingStore {
    async fn insert(&self, message: &NewMessage) -> error::Result<u64> {
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(Error::Store("refusing on purpose".into()));
        }
        self.inner.insert(message).await
    }

    async fn list_all(&self) -> error::Result<Vec<StoredMessage>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.list_all().await
    }
}

pub struct TestGateway {
    pub modem: MockModem,
    pub store: Arc<CountingStore>,
    pub gateway: Gateway,
    pub port: u16,
    _dir: TempDir,
}

impl TestGateway {
    pub fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{path}", self.port)
    }

    pub fn reads(&self) -> usize {
        self.store.reads.load(Ordering::SeqCst)
    }
}

pub async fn start_gateway_with_modem(modem: MockModem) -> Result<TestGateway> {
    start_gateway_with_timings(modem, Timings::fast()).await
}

pub async fn start_gateway_with_timings(modem: MockModem, timings: Timings) -> Result<TestGateway> {
    sms_gateway::logging::init(Level::DEBUG, None).await;

    let dir = tempfile::tempdir()?;
    let store = Arc::new(CountingStore {
        inner: JsonLinesStore::open(dir.path().join("sms.jsonl")).await?,
        reads: AtomicUsize::new(0),
        fail_inserts: AtomicBool::new(false),
    });

    let engine = AtEngine::new(modem.clone(), timings);
    let gateway = Gateway::with_parts(engine, store.clone(), API_KEY);

    let (port_tx, port_rx) = oneshot::channel();
    let state = gateway.state.clone();
    tokio::spawn(async move { server::run_any_port(state, port_tx).await });
    let port = port_rx.await?;

    info!("Test gateway on port {port}");

    Ok(TestGateway {
        modem,
        store,
        gateway,
        port,
        _dir: dir,
    })
}

pub async fn start_gateway() -> Result<TestGateway> {
    start_gateway_with_modem(MockModem::new()).await
}

/// Poll `check` until it holds, for at most about two seconds.
pub async fn eventually<F: FnMut() -> bool>(mut check: F) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    false
}
