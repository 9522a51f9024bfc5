use anyhow::{Context, Result};
use rusqlite::Connection;
use tracing::{info, warn};

use crate::cli::StatusArgs;
use crate::model::ReportInventoryManifest;
use crate::util::read_json;

pub fn run(args: StatusArgs) -> Result<()> {
    let manifest_dir = args.cache_root.join("manifests");
    let inventory_path = manifest_dir.join("report_inventory.json");
    let db_path = args.cache_root.join("agrisignals_index.sqlite");

    info!(cache_root = %args.cache_root.display(), "status requested");

    if inventory_path.exists() {
        let inventory: ReportInventoryManifest = read_json(&inventory_path)?;

        info!(
            generated_at = %inventory.generated_at,
            report_count = inventory.report_count,
            source = %inventory.source_directory,
            "loaded inventory manifest"
        );
    } else {
        warn!(path = %inventory_path.display(), "inventory manifest missing");
    }

    if db_path.exists() {
        let connection = Connection::open(&db_path)
            .with_context(|| format!("failed to open {}", db_path.display()))?;

        let reports_count = query_count(&connection, "SELECT COUNT(*) FROM reports").unwrap_or(0);
        let markets_count = query_count(&connection, "SELECT COUNT(*) FROM markets").unwrap_or(0);
        let schedule_count =
            query_count(&connection, "SELECT COUNT(*) FROM auction_schedule").unwrap_or(0);
        let results_count =
            query_count(&connection, "SELECT COUNT(*) FROM auction_results").unwrap_or(0);
        let last_run = query_metadata(&connection, "last_ingest_run_id");
        let updated_at = query_metadata(&connection, "db_updated_at");

        info!(
            path = %db_path.display(),
            reports = reports_count,
            markets = markets_count,
            schedule = schedule_count,
            results = results_count,
            last_ingest_run_id = %last_run.unwrap_or_default(),
            db_updated_at = %updated_at.unwrap_or_default(),
            "database status"
        );
    } else {
        warn!(path = %db_path.display(), "database file missing");
    }

    Ok(())
}

fn query_count(connection: &Connection, sql: &str) -> Result<i64> {
    let count = connection.query_row(sql, [], |row| row.get(0))?;
    Ok(count)
}

fn query_metadata(connection: &Connection, key: &str) -> Option<String> {
    connection
        .query_row(
            "SELECT value FROM metadata WHERE key = ?1",
            [key],
            |row| row.get(0),
        )
        .ok()
}
