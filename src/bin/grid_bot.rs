//! Grid Ladder Bot Binary
//!
//! Runs the grid ladder against the paper venue.
//!
//! ## Setup
//!
//! 1. Write a ladder definition (see `ladder.example.json`) and a settings
//!    file pointing at it (see `config.example.toml`).
//!
//! 2. Optionally put overrides in `.env`, e.g.
//!    `GRID__NOTIFY__URL=https://chat.example/hook`.
//!
//! 3. Run the bot:
//!    ```bash
//!    cargo run --bin grid_bot -- config.toml
//!    ```

use grid_ladder::BotRunner;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env file; missing is fine
    let _ = dotenvy::dotenv();

    let args: Vec<String> = std::env::args().collect();
    let default_config = "config.toml".to_string();
    let config_path = args.get(1).unwrap_or(&default_config);
    if !std::path::Path::new(config_path).exists() {
        eprintln!("Config file '{}' not found. Please create one.", config_path);
        std::process::exit(1);
    }

    let runner = BotRunner::new(config_path)?;

    if let Err(e) = runner.run().await {
        eprintln!("Bot execution error: {}", e);
        std::process::exit(1);
    }

    Ok(())
}
