use std::fs;
use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result, bail};
use chrono::{Datelike, Utc};
use rusqlite::{Connection, params};
use tracing::{info, warn};

use crate::canon::{
    DEFAULT_SCORE_CUTOFF, Market, MarketRegistry, default_markets, load_registry, store_markets,
};
use crate::cli::IngestArgs;
use crate::commands::inventory;
use crate::extract::{ReportParser, ResultDraft, ScheduleDraft, extract_pdf_pages};
use crate::model::{
    IngestCounts, IngestPaths, IngestRunManifest, ReportEntry, ReportInventoryManifest,
    ReportKind, ToolVersions,
};
use crate::util::{
    condense_whitespace, ensure_directory, now_utc_string, read_json, sanitize_for_id,
    utc_compact_string, write_json_pretty,
};

pub const DB_SCHEMA_VERSION: &str = "0.1.0";

pub fn run(args: IngestArgs) -> Result<()> {
    let started_ts = Utc::now();
    let started_at = now_utc_string();
    let run_id = format!("run-{}", utc_compact_string(started_ts));

    let cache_root = args.cache_root.clone();
    let manifest_dir = cache_root.join("manifests");
    ensure_directory(&manifest_dir)?;

    let reports_dir = inventory::resolve_reports_dir(&cache_root, args.reports_dir.as_deref());
    let inventory_manifest_path = args
        .inventory_manifest_path
        .clone()
        .unwrap_or_else(|| inventory::default_manifest_path(&cache_root));
    let ingest_manifest_path = args.ingest_manifest_path.clone().unwrap_or_else(|| {
        manifest_dir.join(format!("ingest_run_{}.json", utc_compact_string(started_ts)))
    });
    let db_path = args
        .db_path
        .clone()
        .unwrap_or_else(|| cache_root.join("agrisignals_index.sqlite"));

    info!(cache_root = %cache_root.display(), run_id = %run_id, "starting ingest");

    let inventory_manifest = load_or_refresh_inventory(
        &reports_dir,
        &inventory_manifest_path,
        args.refresh_inventory,
    )?;

    let tool_versions = collect_tool_versions();

    let mut connection = Connection::open(&db_path)
        .with_context(|| format!("failed to open {}", db_path.display()))?;
    configure_connection(&connection)?;
    ensure_schema(&connection)?;

    let markets_seeded = seed_markets(&mut connection, args.markets_path.as_deref())?;
    let registry = load_registry(&connection)?;
    if registry.is_empty() {
        bail!("market registry is empty after seeding");
    }

    let parser = ReportParser::new()?;
    let default_year = args.default_year.unwrap_or_else(|| Utc::now().year());

    let mut stats = process_reports(
        &mut connection,
        &reports_dir,
        &inventory_manifest.reports,
        &parser,
        &registry,
        default_year,
        args.max_reports,
        args.max_pages_per_pdf,
    )?;
    stats.counts.markets_seeded = markets_seeded;
    stats.counts.report_count = inventory_manifest.report_count;

    sync_fts_index(&connection)?;

    stats.counts.schedule_total = count_rows(&connection, "SELECT COUNT(*) FROM auction_schedule")?;
    stats.counts.results_total = count_rows(&connection, "SELECT COUNT(*) FROM auction_results")?;
    let updated_at = now_utc_string();

    connection.execute(
        "INSERT INTO metadata(key, value) VALUES('last_ingest_run_id', ?1)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
        [&run_id],
    )?;

    let manifest = IngestRunManifest {
        manifest_version: 1,
        run_id: run_id.clone(),
        db_schema_version: DB_SCHEMA_VERSION.to_string(),
        status: "completed".to_string(),
        started_at,
        updated_at,
        command: render_ingest_command(&args),
        tool_versions,
        paths: IngestPaths {
            cache_root: cache_root.display().to_string(),
            reports_dir: reports_dir.display().to_string(),
            manifest_dir: manifest_dir.display().to_string(),
            inventory_manifest_path: inventory_manifest_path.display().to_string(),
            db_path: db_path.display().to_string(),
        },
        counts: stats.counts,
        source_hashes: inventory_manifest.reports,
        warnings: stats.warnings,
        notes: vec![
            "Ingest completed against local report files and sqlite index.".to_string(),
            "Market names canonicalized by indel ratio against the markets registry; unmatched lines keep their raw text with confidence 0."
                .to_string(),
        ],
    };

    write_json_pretty(&ingest_manifest_path, &manifest)?;

    info!(path = %ingest_manifest_path.display(), "wrote ingest run manifest");
    info!(
        schedule = manifest.counts.schedule_total,
        results = manifest.counts.results_total,
        warnings = manifest.warnings.len(),
        "ingest completed"
    );

    Ok(())
}

fn load_or_refresh_inventory(
    reports_dir: &Path,
    inventory_manifest_path: &Path,
    refresh_inventory: bool,
) -> Result<ReportInventoryManifest> {
    if refresh_inventory || !inventory_manifest_path.exists() {
        let manifest = inventory::build_manifest(reports_dir)?;
        write_json_pretty(inventory_manifest_path, &manifest)?;
        info!(
            path = %inventory_manifest_path.display(),
            report_count = manifest.report_count,
            "refreshed inventory manifest"
        );
        return Ok(manifest);
    }

    let manifest: ReportInventoryManifest = read_json(inventory_manifest_path)?;

    info!(
        path = %inventory_manifest_path.display(),
        report_count = manifest.report_count,
        "loaded existing inventory manifest"
    );

    Ok(manifest)
}

pub fn configure_connection(connection: &Connection) -> Result<()> {
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .context("failed to set journal_mode=WAL")?;
    connection
        .pragma_update(None, "synchronous", "NORMAL")
        .context("failed to set synchronous=NORMAL")?;
    Ok(())
}

pub fn ensure_schema(connection: &Connection) -> Result<()> {
    connection.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS metadata (
          key TEXT PRIMARY KEY,
          value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS markets (
          name TEXT PRIMARY KEY,
          state TEXT NOT NULL,
          aliases TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS reports (
          report_id TEXT PRIMARY KEY,
          filename TEXT NOT NULL,
          kind TEXT NOT NULL,
          sha256 TEXT NOT NULL,
          ingested_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS auction_schedule (
          event_id TEXT PRIMARY KEY,
          market TEXT NOT NULL,
          market_confidence INTEGER NOT NULL DEFAULT 0,
          sale_date TEXT NOT NULL,
          est_head INTEGER,
          raw_text TEXT NOT NULL,
          report_id TEXT NOT NULL,
          ingested_at TEXT NOT NULL,
          UNIQUE(market, sale_date, report_id),
          FOREIGN KEY(report_id) REFERENCES reports(report_id)
        );

        CREATE TABLE IF NOT EXISTS auction_results (
          result_id INTEGER PRIMARY KEY,
          market TEXT NOT NULL,
          market_confidence INTEGER NOT NULL DEFAULT 0,
          sale_date TEXT NOT NULL,
          total_head INTEGER,
          report_id TEXT NOT NULL,
          ingested_at TEXT NOT NULL,
          UNIQUE(market, sale_date),
          FOREIGN KEY(report_id) REFERENCES reports(report_id)
        );

        CREATE TABLE IF NOT EXISTS result_classes (
          result_id INTEGER NOT NULL,
          class_label TEXT NOT NULL,
          avg_cwt REAL NOT NULL,
          lots INTEGER NOT NULL,
          UNIQUE(result_id, class_label),
          FOREIGN KEY(result_id) REFERENCES auction_results(result_id)
        );
        ",
    )?;

    connection
        .execute(
            "
            CREATE VIRTUAL TABLE IF NOT EXISTS schedule_fts
            USING fts5(event_id, market, raw_text, content='auction_schedule', content_rowid='rowid')
            ",
            [],
        )
        .context("failed to initialize FTS5 table schedule_fts")?;

    let now = now_utc_string();
    connection.execute(
        "INSERT INTO metadata(key, value) VALUES('db_schema_version', ?1)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
        [DB_SCHEMA_VERSION],
    )?;
    connection.execute(
        "INSERT INTO metadata(key, value) VALUES('db_updated_at', ?1)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
        [now],
    )?;

    Ok(())
}

fn seed_markets(connection: &mut Connection, markets_path: Option<&Path>) -> Result<usize> {
    if let Some(path) = markets_path {
        let markets: Vec<Market> = read_json(path)?;
        if markets.is_empty() {
            bail!("markets file {} contains no markets", path.display());
        }
        let seeded = store_markets(connection, &markets)?;
        info!(path = %path.display(), count = seeded, "seeded markets from file");
        return Ok(seeded);
    }

    let existing: i64 = connection.query_row("SELECT COUNT(*) FROM markets", [], |row| row.get(0))?;
    if existing > 0 {
        return Ok(0);
    }

    let seeded = store_markets(connection, &default_markets())?;
    info!(count = seeded, "seeded default markets");
    Ok(seeded)
}

#[derive(Debug, Default)]
struct ProcessStats {
    counts: IngestCounts,
    warnings: Vec<String>,
}

#[allow(clippy::too_many_arguments)]
fn process_reports(
    connection: &mut Connection,
    reports_dir: &Path,
    reports: &[ReportEntry],
    parser: &ReportParser,
    registry: &MarketRegistry,
    default_year: i32,
    max_reports: Option<usize>,
    max_pages_per_pdf: Option<usize>,
) -> Result<ProcessStats> {
    let mut stats = ProcessStats::default();
    let limit = max_reports.unwrap_or(reports.len());

    let tx = connection.transaction()?;

    for entry in reports.iter().take(limit) {
        let report_path = reports_dir.join(&entry.filename);
        let report_id = report_id_for(entry);

        if !report_path.exists() {
            stats.counts.skipped_report_count += 1;
            stats
                .warnings
                .push(format!("missing source report: {}", report_path.display()));
            continue;
        }

        let text = match read_report_text(&report_path, entry.kind, max_pages_per_pdf) {
            Ok(text) => text,
            Err(err) => {
                let warning =
                    format!("failed to extract text for {}: {err:#}", report_path.display());
                warn!(warning = %warning, "report extraction warning");
                stats.counts.skipped_report_count += 1;
                stats.warnings.push(warning);
                continue;
            }
        };

        let ingested_at = now_utc_string();

        tx.execute(
            "
            INSERT INTO reports(report_id, filename, kind, sha256, ingested_at)
            VALUES(?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(report_id) DO UPDATE SET
              filename=excluded.filename,
              kind=excluded.kind,
              sha256=excluded.sha256,
              ingested_at=excluded.ingested_at
            ",
            params![
                &report_id,
                &entry.filename,
                entry.kind.as_str(),
                &entry.sha256,
                &ingested_at
            ],
        )?;

        tx.execute(
            "DELETE FROM auction_schedule WHERE report_id = ?1",
            [&report_id],
        )?;

        let events = parser.parse_schedule_events(&text, default_year);
        for (sequence, event) in events.iter().enumerate() {
            let upserted = upsert_schedule_event(
                &tx,
                &report_id,
                sequence,
                event,
                registry,
                &ingested_at,
            )?;
            stats.counts.schedule_events_upserted += upserted.upserted as usize;
            stats.counts.unmatched_market_count += upserted.unmatched as usize;
        }

        match parser.parse_result_summary(&text, default_year) {
            Some(summary) => {
                let outcome =
                    upsert_result(&tx, &report_id, &summary, registry, &ingested_at)?;
                match outcome {
                    Some(class_rows) => {
                        stats.counts.results_upserted += 1;
                        stats.counts.class_rows_upserted += class_rows;
                    }
                    None => {
                        stats.warnings.push(format!(
                            "{}: result summary has no market line, skipped",
                            entry.filename
                        ));
                    }
                }
            }
            None => {
                if events.is_empty() {
                    stats.warnings.push(format!(
                        "{}: no dated lines and no result summary extracted",
                        entry.filename
                    ));
                }
            }
        }

        stats.counts.processed_report_count += 1;
    }

    tx.commit()?;
    Ok(stats)
}

struct ScheduleUpsert {
    upserted: bool,
    unmatched: bool,
}

fn upsert_schedule_event(
    connection: &Connection,
    report_id: &str,
    sequence: usize,
    event: &ScheduleDraft,
    registry: &MarketRegistry,
    ingested_at: &str,
) -> Result<ScheduleUpsert> {
    let (market, confidence) = match registry.canonicalize(&event.raw_line, DEFAULT_SCORE_CUTOFF) {
        Some(matched) => (matched.canonical, matched.score),
        None => (condense_whitespace(&event.raw_line), 0),
    };

    let event_id = format!(
        "{}:{}:{:03}",
        report_id,
        event.sale_date.format("%Y%m%d"),
        sequence + 1
    );

    connection.execute(
        "
        INSERT INTO auction_schedule(
          event_id, market, market_confidence, sale_date, est_head, raw_text, report_id, ingested_at
        )
        VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        ON CONFLICT(market, sale_date, report_id) DO UPDATE SET
          est_head=COALESCE(excluded.est_head, est_head),
          raw_text=excluded.raw_text,
          market_confidence=excluded.market_confidence,
          ingested_at=excluded.ingested_at
        ",
        params![
            event_id,
            &market,
            confidence,
            event.sale_date.format("%Y-%m-%d").to_string(),
            event.est_head,
            &event.raw_line,
            report_id,
            ingested_at
        ],
    )?;

    Ok(ScheduleUpsert {
        upserted: true,
        unmatched: confidence == 0,
    })
}

fn upsert_result(
    connection: &Connection,
    report_id: &str,
    summary: &ResultDraft,
    registry: &MarketRegistry,
    ingested_at: &str,
) -> Result<Option<usize>> {
    let Some(market_line) = summary.market_line.as_deref() else {
        return Ok(None);
    };

    let (market, confidence) = match registry.canonicalize(market_line, DEFAULT_SCORE_CUTOFF) {
        Some(matched) => (matched.canonical, matched.score),
        None => (market_line.to_string(), 0),
    };

    let sale_date = summary.sale_date.format("%Y-%m-%d").to_string();

    connection.execute(
        "
        INSERT INTO auction_results(
          market, market_confidence, sale_date, total_head, report_id, ingested_at
        )
        VALUES(?1, ?2, ?3, ?4, ?5, ?6)
        ON CONFLICT(market, sale_date) DO UPDATE SET
          total_head=COALESCE(excluded.total_head, total_head),
          market_confidence=MAX(market_confidence, excluded.market_confidence),
          report_id=excluded.report_id,
          ingested_at=excluded.ingested_at
        ",
        params![
            &market,
            confidence,
            &sale_date,
            summary.total_head,
            report_id,
            ingested_at
        ],
    )?;

    let result_id: i64 = connection.query_row(
        "SELECT result_id FROM auction_results WHERE market = ?1 AND sale_date = ?2",
        params![&market, &sale_date],
        |row| row.get(0),
    )?;

    let mut class_rows = 0;
    for class in &summary.classes {
        connection.execute(
            "
            INSERT INTO result_classes(result_id, class_label, avg_cwt, lots)
            VALUES(?1, ?2, ?3, ?4)
            ON CONFLICT(result_id, class_label) DO UPDATE SET
              avg_cwt=excluded.avg_cwt,
              lots=excluded.lots
            ",
            params![result_id, class.label, class.avg_cwt, class.lots],
        )?;
        class_rows += 1;
    }

    Ok(Some(class_rows))
}

fn read_report_text(
    path: &Path,
    kind: ReportKind,
    max_pages_per_pdf: Option<usize>,
) -> Result<String> {
    match kind {
        ReportKind::Text => {
            fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
        }
        ReportKind::Pdf => {
            let pages = extract_pdf_pages(path, max_pages_per_pdf)?;
            Ok(pages.join("\n"))
        }
    }
}

fn report_id_for(entry: &ReportEntry) -> String {
    let stem = entry
        .filename
        .rsplit_once('.')
        .map(|(stem, _)| stem)
        .unwrap_or(&entry.filename);
    let hash_prefix = entry.sha256.get(..8).unwrap_or(&entry.sha256);
    format!("{}-{}", sanitize_for_id(stem), hash_prefix)
}

fn sync_fts_index(connection: &Connection) -> Result<()> {
    connection
        .execute("INSERT INTO schedule_fts(schedule_fts) VALUES('rebuild')", [])
        .context("failed to rebuild FTS index")?;
    Ok(())
}

fn count_rows(connection: &Connection, sql: &str) -> Result<i64> {
    let count = connection.query_row(sql, [], |row| row.get(0))?;
    Ok(count)
}

fn collect_tool_versions() -> ToolVersions {
    ToolVersions {
        rustc: command_version("rustc", &["--version"]),
        cargo: command_version("cargo", &["--version"]),
        pdftotext: command_version("pdftotext", &["-v"]),
    }
}

fn command_version(program: &str, args: &[&str]) -> String {
    let output = match Command::new(program).args(args).output() {
        Ok(output) => output,
        Err(_) => return "unavailable".to_string(),
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    let source = if stdout.trim().is_empty() {
        stderr.trim().to_string()
    } else {
        stdout.trim().to_string()
    };

    source
        .lines()
        .next()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .unwrap_or("unknown")
        .to_string()
}

fn render_ingest_command(args: &IngestArgs) -> String {
    let mut command = vec![
        "agrisignals".to_string(),
        "ingest".to_string(),
        "--cache-root".to_string(),
        args.cache_root.display().to_string(),
    ];

    if let Some(path) = &args.reports_dir {
        command.push("--reports-dir".to_string());
        command.push(path.display().to_string());
    }
    if let Some(path) = &args.inventory_manifest_path {
        command.push("--inventory-manifest-path".to_string());
        command.push(path.display().to_string());
    }
    if let Some(path) = &args.ingest_manifest_path {
        command.push("--ingest-manifest-path".to_string());
        command.push(path.display().to_string());
    }
    if let Some(path) = &args.db_path {
        command.push("--db-path".to_string());
        command.push(path.display().to_string());
    }
    if args.refresh_inventory {
        command.push("--refresh-inventory".to_string());
    }
    if let Some(path) = &args.markets_path {
        command.push("--markets-path".to_string());
        command.push(path.display().to_string());
    }
    if let Some(year) = args.default_year {
        command.push("--default-year".to_string());
        command.push(year.to_string());
    }
    if let Some(max_reports) = args.max_reports {
        command.push("--max-reports".to_string());
        command.push(max_reports.to_string());
    }
    if let Some(max_pages) = args.max_pages_per_pdf {
        command.push("--max-pages-per-pdf".to_string());
        command.push(max_pages.to_string());
    }

    command.join(" ")
}
