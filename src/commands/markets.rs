use std::io::{self, Write};

use anyhow::{Context, Result, bail};
use rusqlite::Connection;
use serde::Serialize;
use tracing::info;

use crate::canon::{Market, load_registry, store_markets};
use crate::cli::MarketsArgs;
use crate::commands::ingest::{configure_connection, ensure_schema};
use crate::util::read_json;

#[derive(Debug, Serialize)]
struct MarketsResponse<'a> {
    market_count: usize,
    markets: &'a [Market],
}

pub fn run(args: MarketsArgs) -> Result<()> {
    let db_path = args
        .db_path
        .clone()
        .unwrap_or_else(|| args.cache_root.join("agrisignals_index.sqlite"));

    let mut connection = Connection::open(&db_path)
        .with_context(|| format!("failed to open {}", db_path.display()))?;
    configure_connection(&connection)?;
    ensure_schema(&connection)?;

    if let Some(seed_path) = &args.seed_path {
        let markets: Vec<Market> = read_json(seed_path)?;
        if markets.is_empty() {
            bail!("markets file {} contains no markets", seed_path.display());
        }

        let seeded = store_markets(&mut connection, &markets)?;
        info!(path = %seed_path.display(), count = seeded, "seeded markets");
    }

    let registry = load_registry(&connection)?;

    if args.json {
        let response = MarketsResponse {
            market_count: registry.markets().len(),
            markets: registry.markets(),
        };

        let mut output = io::BufWriter::new(io::stdout().lock());
        serde_json::to_writer_pretty(&mut output, &response)
            .context("failed to serialize markets json output")?;
        writeln!(output)?;
        output.flush()?;
        return Ok(());
    }

    let mut output = io::BufWriter::new(io::stdout().lock());
    writeln!(output, "Markets: {}", registry.markets().len())?;

    for market in registry.markets() {
        let aliases = if market.aliases.is_empty() {
            "(none)".to_string()
        } else {
            market.aliases.join(", ")
        };
        writeln!(output, "{} ({})\taliases: {}", market.name, market.state, aliases)?;
    }

    output.flush()?;
    Ok(())
}
