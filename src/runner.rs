use std::path::Path;
use std::sync::Arc;

use log::{info, warn};

use crate::config::Settings;
use crate::grid::{load_or_create, Engine, GridResult, GridRunner, JsonFileStore, LadderConfig};
use crate::market::PaperExchange;
use crate::notify::{LogNotifier, Notifier, WebhookNotifier};

/// Runner for the grid bot
pub struct BotRunner {
    config: Settings,
}

impl BotRunner {
    /// Create a new runner from a configuration file
    pub fn new(config_path: impl AsRef<Path>) -> GridResult<Self> {
        let path = config_path.as_ref().to_string_lossy();
        let config = Settings::new(&path)?;
        Ok(Self { config })
    }

    pub fn from_settings(config: Settings) -> Self {
        Self { config }
    }

    /// Run the bot against the paper venue until Ctrl+C
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        // 1. Setup Logging
        if std::env::var("RUST_LOG").is_err() {
            std::env::set_var("RUST_LOG", &self.config.log.level);
        }
        env_logger::try_init().ok();

        info!("Starting BotRunner...");

        // 2. Ladder, engine tuning and persisted state
        self.config.engine.validate()?;
        let ladder = LadderConfig::load_from_file(&self.config.ladder.ladder_file)?;
        let store = JsonFileStore::new(&self.config.ladder.state_file);
        let restored = load_or_create(&store, &ladder)?;
        let resumed = restored.resumed;

        // 3. Notifications
        let webhook = if self.config.notify.is_enabled() {
            let webhook = Arc::new(WebhookNotifier::new(self.config.notify.clone()));
            webhook.spawn_flusher();
            Some(webhook)
        } else {
            warn!("No webhook configured, alerts go to the log only");
            None
        };
        let notifier: Arc<dyn Notifier> = match &webhook {
            Some(webhook) => webhook.clone() as Arc<dyn Notifier>,
            None => Arc::new(LogNotifier),
        };

        // 4. Venue
        info!("Initializing PAPER market for {}...", ladder.instrument);
        let exchange = Arc::new(PaperExchange::new(&ladder.instrument, self.config.paper.clone()));

        // 5. Engine
        let mut engine = Engine::new(
            ladder.instrument.clone(),
            restored,
            self.config.engine.clone(),
            Box::new(store),
        )
        .with_notifier(notifier.clone());
        engine.log_ladder();

        if resumed {
            let report = engine.recover(exchange.as_ref()).await?;
            info!("Recovery done: {:?}", report);
        }

        // 6. Event loop
        let mut runner = GridRunner::new(engine, exchange.clone(), exchange.clone());
        if let Some(path) = &self.config.ladder.runtime_file {
            info!("Writing runtime view to {}", path);
            runner = runner.with_runtime_view(path);
        }
        exchange.attach(runner.event_sender()).await;
        runner.shutdown_handle().trigger_on_signal();
        let walk = exchange.spawn_price_walk();

        notifier.notify(&format!("{} grid bot started", ladder.instrument));
        let engine = runner.run().await?;
        walk.abort();

        notifier.notify(&format!("{} grid bot stopped", ladder.instrument));
        if let Some(webhook) = &webhook {
            webhook.flush().await;
        }

        let position = exchange.position().await;
        let quote = exchange.quote().await;
        info!(
            "Paper position {} @ {:.4}, realized {:.4}, unrealized {:.4}, fees {:.4}; ledger pnl {:.4}",
            position.size,
            position.entry_price,
            position.realized_pnl,
            position.unrealized_pnl(quote.mid()),
            position.fees,
            engine.ledger().realized_pnl()
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::GridError;

    #[test]
    fn test_missing_settings_file_is_invalid_config() {
        let path = std::env::temp_dir().join("grid_ladder_no_such_settings.toml");
        let result = BotRunner::new(&path);
        assert!(matches!(result, Err(GridError::InvalidConfig(_))));
    }
}
