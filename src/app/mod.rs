//! Composition root: builds the bus and every engine once, wires them
//! together, and drives startup/shutdown.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::account::AccountRegistry;
use crate::bus::{topics, EventBus, Journal, SHUTDOWN_GRACE};
use crate::config::{AccountsConfig, Settings};
use crate::data::{DataEngine, LiveTransport, TransportFactory};
use crate::db;
use crate::error::Result;
use crate::indicator::IndicatorEngine;
use crate::store::{OrderStore, SqliteEventJournal, SqliteOrderStore, SqliteTaskStore, TaskStore};
use crate::strategy::StrategyEngine;
use crate::trade::{FeeRates, TradeExecutor};

/// The assembled runtime. Engines communicate exclusively over the bus;
/// this type only holds them alive and handles lifecycle.
pub struct App {
    pub bus: Arc<EventBus>,
    pub registry: Arc<AccountRegistry>,
    pub data: Arc<DataEngine>,
    pub indicators: Arc<IndicatorEngine>,
    pub strategies: Arc<StrategyEngine>,
    pub executor: Arc<TradeExecutor>,
}

#[derive(Serialize)]
struct ShutdownNotice {
    reason: String,
}

impl App {
    /// Production wiring: sqlite-backed journal and stores, live
    /// exchange transports.
    pub fn build(settings: &Settings) -> Result<Self> {
        let pool = db::create_pool(&settings.database_url)?;
        db::run_migrations(&pool)?;

        let journal: Arc<dyn Journal> = Arc::new(SqliteEventJournal::new(pool.clone()));
        let task_store: Arc<dyn TaskStore> = Arc::new(SqliteTaskStore::new(pool.clone()));
        let order_store: Arc<dyn OrderStore> = Arc::new(SqliteOrderStore::new(pool));

        Ok(Self::compose(
            journal,
            Arc::new(LiveTransport::default()),
            settings.config_dir.clone(),
            FeeRates { maker: settings.maker_fee, taker: settings.taker_fee },
            Some(task_store),
            Some(order_store),
        ))
    }

    /// Wire the engines around explicit collaborators. Tests use this
    /// with an in-memory journal and scripted transports.
    pub fn compose(
        journal: Arc<dyn Journal>,
        transport: Arc<dyn TransportFactory>,
        config_dir: PathBuf,
        fees: FeeRates,
        task_store: Option<Arc<dyn TaskStore>>,
        order_store: Option<Arc<dyn OrderStore>>,
    ) -> Self {
        let bus = Arc::new(EventBus::new(journal));
        let registry = Arc::new(AccountRegistry::new(Arc::clone(&bus)));

        let data = DataEngine::new(Arc::clone(&bus), Arc::clone(&registry), transport);
        data.attach();
        let indicators = IndicatorEngine::new(Arc::clone(&bus));
        indicators.attach();
        let strategies =
            StrategyEngine::new(Arc::clone(&bus), Arc::clone(&registry), config_dir);
        strategies.attach();
        let executor = TradeExecutor::new(Arc::clone(&bus), fees, task_store, order_store);
        executor.attach();

        Self { bus, registry, data, indicators, strategies, executor }
    }

    /// Load the account batch and let the event flow take over.
    pub fn start(&self, accounts: &AccountsConfig) {
        let (loaded, failed) = self.registry.load(accounts);
        info!(loaded, failed, "account batch processed");
    }

    /// Announce shutdown, then quiesce the bus within the grace period.
    pub async fn shutdown(&self) {
        self.bus.emit(
            topics::PM_SHUTDOWN,
            &ShutdownNotice { reason: "process shutdown".into() },
        );
        self.bus.shutdown(SHUTDOWN_GRACE).await;
        info!("event bus quiesced");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryJournal;
    use crate::testkit::{ScriptedApi, ScriptedTransport};
    use serde_json::json;

    #[tokio::test]
    async fn compose_wires_every_engine() {
        let app = App::compose(
            Arc::new(MemoryJournal::new()),
            Arc::new(ScriptedTransport::new(ScriptedApi::shared())),
            std::path::PathBuf::from("config"),
            FeeRates::default(),
            None,
            None,
        );
        let accounts: AccountsConfig = serde_json::from_value(json!({ "users": {} })).unwrap();
        app.start(&accounts);
        let subjects: Vec<String> =
            app.bus.query_recent(10).into_iter().map(|e| e.subject).collect();
        assert!(subjects.contains(&topics::PM_READY.to_string()));
        app.shutdown().await;
    }
}
