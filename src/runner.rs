use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use rust_decimal::Decimal;

use crate::config::{PaperConfig, Settings};
use crate::grid::executor::mock::MockExchange;
use crate::grid::{
    EngineHandle, EngineView, GridConfig, GridError, GridResult, JsonFileSnapshotStore,
    ReconciliationEngine, SnapshotStore,
};

/// Ticks between status lines
const SUMMARY_EVERY: u64 = 10;

/// Runs the engine against the in-process paper exchange
pub struct EngineRunner {
    settings: Settings,
}

impl EngineRunner {
    /// Create a new runner from a configuration file
    pub fn new(config_path: impl AsRef<Path>) -> GridResult<Self> {
        let path = config_path.as_ref();
        let path = path.to_str().ok_or_else(|| {
            GridError::InvalidConfiguration(format!("config path {:?} is not valid UTF-8", path))
        })?;
        Ok(Self {
            settings: Settings::new(path)?,
        })
    }

    pub fn from_settings(settings: Settings) -> Self {
        Self { settings }
    }

    /// Run until Ctrl-C or the configured number of paper ticks
    pub async fn run(self) -> GridResult<()> {
        env_logger::Builder::from_env(
            env_logger::Env::default().default_filter_or(self.settings.log.level.as_str()),
        )
        .try_init()
        .ok();

        let grid = self.settings.grid;
        let paper = self.settings.paper;
        let start_price = paper.start_price.unwrap_or(grid.reference_price);

        info!("Starting grid engine for {}", grid.asset);
        info!("Grid range: {} - {} ({:?})", grid.lower_price, grid.upper_price, grid.spacing);
        info!("Paper market: start={}, step={}", start_price, paper.step);

        let exchange = Arc::new(MockExchange::new(start_price));
        let state_file = grid
            .state_file
            .clone()
            .unwrap_or_else(|| GridConfig::generate_state_filename(&grid.asset));
        info!("Snapshot file: {}", state_file.display());
        let store: Arc<dyn SnapshotStore> = Arc::new(JsonFileSnapshotStore::new(state_file));

        let walk = PriceWalk::new(start_price, paper.step, grid.lower_price, grid.upper_price);
        let engine = ReconciliationEngine::new(grid, exchange.clone(), store).await?;
        let handle = engine.handle();
        let engine_task = tokio::spawn(engine.run());

        drive_paper_market(&exchange, &handle, walk, &paper).await;

        if let Err(e) = handle.shutdown() {
            warn!("Engine already stopped: {}", e);
        }
        let result = engine_task
            .await
            .map_err(|e| GridError::LogicInconsistency(format!("engine task failed: {e}")))?;
        log_summary(&handle.view());
        result
    }
}

async fn drive_paper_market(
    exchange: &MockExchange,
    handle: &EngineHandle,
    mut walk: PriceWalk,
    paper: &PaperConfig,
) {
    let mut ticker = tokio::time::interval(Duration::from_millis(paper.tick_interval_ms.max(1)));
    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);
    let mut ticks: u64 = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let price = walk.next_price();
                let fills = exchange.set_mid_price(price).await;
                if let Err(e) = handle.mark_price(price) {
                    warn!("Engine stopped accepting prices: {}", e);
                    break;
                }
                debug!("Paper tick: price={}, fills={}", price, fills.len());

                ticks += 1;
                if ticks % SUMMARY_EVERY == 0 {
                    log_summary(&handle.view());
                }
                if paper.max_ticks.is_some_and(|max| ticks >= max) {
                    info!("Paper run finished after {} ticks", ticks);
                    break;
                }
            }
            _ = &mut interrupt => {
                info!("Interrupt received, shutting down");
                break;
            }
        }
    }
}

fn log_summary(view: &EngineView) {
    let open = view
        .bindings
        .iter()
        .filter(|b| b.state.is_live())
        .count();
    info!(
        "Status={:?} live_orders={} position={} realized_pnl={} round_trips={} exposure={}",
        view.status,
        open,
        view.pnl.position,
        view.pnl.realized_pnl,
        view.pnl.round_trips,
        view.reserved_exposure + view.committed_exposure
    );
}

/// Deterministic walk bouncing between two bounds
#[derive(Debug, Clone)]
struct PriceWalk {
    price: Decimal,
    step: Decimal,
    lower: Decimal,
    upper: Decimal,
    rising: bool,
}

impl PriceWalk {
    fn new(start: Decimal, step: Decimal, lower: Decimal, upper: Decimal) -> Self {
        Self {
            price: start.clamp(lower, upper),
            step: step.abs(),
            lower,
            upper,
            rising: true,
        }
    }

    fn next_price(&mut self) -> Decimal {
        let next = if self.rising {
            self.price + self.step
        } else {
            self.price - self.step
        };

        if next >= self.upper {
            self.price = self.upper;
            self.rising = false;
        } else if next <= self.lower {
            self.price = self.lower;
            self.rising = true;
        } else {
            self.price = next;
        }
        self.price
    }
}
