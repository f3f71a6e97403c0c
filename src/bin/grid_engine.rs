//! Grid Engine Binary
//!
//! Runs the grid engine against the in-process paper exchange.
//!
//! ## Setup
//!
//! 1. Write a config file, e.g. `grid.toml`:
//!    ```toml
//!    [grid]
//!    asset = "BTC/USDT"
//!    lower_price = "90"
//!    upper_price = "110"
//!    reference_price = "100"
//!    spacing = { level_count = 11 }
//!    sizing = { base = "0.01" }
//!    state_file = "grid_btc.json"
//!
//!    [paper]
//!    step = "0.5"
//!    tick_interval_ms = 500
//!    ```
//!
//! 2. Optionally put overrides in a `.env` file (`GRID__LOG__LEVEL=debug`).
//!
//! 3. Run the engine:
//!    ```bash
//!    cargo run --bin grid_engine -- grid.toml
//!    ```

use grid_engine::runner::EngineRunner;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // values from .env reach the config layer as GRID__ overrides
    dotenvy::dotenv().ok();

    let args: Vec<String> = std::env::args().collect();
    let default_config = "grid.toml".to_string();
    let config_path = args.get(1).unwrap_or(&default_config);
    if !std::path::Path::new(config_path).exists() {
        eprintln!("Config file '{}' not found. Please create one.", config_path);
        std::process::exit(1);
    }

    let runner = EngineRunner::new(config_path)?;

    if let Err(e) = runner.run().await {
        eprintln!("Engine execution error: {}", e);
        std::process::exit(1);
    }

    Ok(())
}
