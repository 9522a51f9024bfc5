use std::collections::HashMap;
use std::io::{self, Write};

use anyhow::{Context, Result, bail};
use chrono::NaiveDate;
use rusqlite::{Connection, OpenFlags, params};
use serde::Serialize;
use tracing::info;

use crate::canon::{DEFAULT_SCORE_CUTOFF, load_registry};
use crate::cli::{QueryArgs, RecordKind};
use crate::util::condense_whitespace;

const MAX_QUERY_CANDIDATES: i64 = 256;

#[derive(Debug, Clone)]
struct QueryCandidate {
    key: String,
    score: f64,
    match_kind: &'static str,
    kind: &'static str,
    market: String,
    market_confidence: u32,
    sale_date: String,
    head_count: Option<i64>,
    raw_text: Option<String>,
    result_id: Option<i64>,
    report_id: String,
}

#[derive(Debug, Clone, Serialize)]
struct ClassRow {
    class_label: String,
    avg_cwt: f64,
    lots: i64,
}

#[derive(Debug, Clone, Serialize)]
struct QueryRow {
    rank: usize,
    score: f64,
    match_kind: String,
    kind: String,
    market: String,
    market_confidence: u32,
    sale_date: String,
    head_count: Option<i64>,
    raw_text: Option<String>,
    classes: Option<Vec<ClassRow>>,
    report_id: String,
    citation: String,
}

#[derive(Debug, Serialize)]
struct QueryResponse {
    market_filter: Option<String>,
    text_filter: Option<String>,
    since: Option<String>,
    until: Option<String>,
    kind_filter: Option<String>,
    limit: usize,
    returned: usize,
    results: Vec<QueryRow>,
}

pub fn run(args: QueryArgs) -> Result<()> {
    let market_filter = normalized_filter(args.market.as_deref());
    let text_filter = normalized_filter(args.text.as_deref());
    let since = parse_iso_date(args.since.as_deref(), "--since")?;
    let until = parse_iso_date(args.until.as_deref(), "--until")?;

    if market_filter.is_none() && text_filter.is_none() && since.is_none() && until.is_none() {
        bail!("query needs at least one of --market, --text, --since, or --until");
    }

    let db_path = args
        .db_path
        .clone()
        .unwrap_or_else(|| args.cache_root.join("agrisignals_index.sqlite"));

    let connection = Connection::open_with_flags(
        &db_path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .with_context(|| format!("failed to open database read-only: {}", db_path.display()))?;

    // the market filter goes through the same canonicalization as ingest
    let canonical_market = match market_filter.as_deref() {
        Some(raw) => {
            let registry = load_registry(&connection)?;
            Some(
                registry
                    .canonicalize(raw, DEFAULT_SCORE_CUTOFF)
                    .map(|matched| matched.canonical)
                    .unwrap_or_else(|| raw.to_string()),
            )
        }
        None => None,
    };

    let since_str = since.map(|date| date.format("%Y-%m-%d").to_string());
    let until_str = until.map(|date| date.format("%Y-%m-%d").to_string());

    let mut candidates = collect_candidates(
        &connection,
        args.kind,
        canonical_market.as_deref(),
        text_filter.as_deref(),
        since_str.as_deref(),
        until_str.as_deref(),
    )?;

    if candidates.len() > args.limit {
        candidates.truncate(args.limit);
    }

    let results = to_rows(&connection, candidates)?;

    info!(
        market = ?canonical_market,
        text = ?text_filter,
        since = ?since_str,
        until = ?until_str,
        kind = ?args.kind.map(RecordKind::as_str),
        result_count = results.len(),
        "query completed"
    );

    if args.json {
        write_json_response(&args, canonical_market, text_filter, since_str, until_str, results)?;
    } else {
        write_text_response(&results)?;
    }

    Ok(())
}

fn normalized_filter(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
}

fn parse_iso_date(raw: Option<&str>, flag: &str) -> Result<Option<NaiveDate>> {
    match raw.map(str::trim).filter(|value| !value.is_empty()) {
        Some(value) => {
            let date = NaiveDate::parse_from_str(value, "%Y-%m-%d")
                .with_context(|| format!("{flag} must be an ISO date (YYYY-MM-DD): {value}"))?;
            Ok(Some(date))
        }
        None => Ok(None),
    }
}

fn collect_candidates(
    connection: &Connection,
    kind: Option<RecordKind>,
    market_filter: Option<&str>,
    text_filter: Option<&str>,
    since: Option<&str>,
    until: Option<&str>,
) -> Result<Vec<QueryCandidate>> {
    let mut dedup = HashMap::<String, QueryCandidate>::new();

    if kind != Some(RecordKind::Results) {
        // --text narrows schedule rows to FTS matches only
        match text_filter {
            Some(text) => {
                for candidate in query_fts_rows(connection, text, market_filter, since, until)? {
                    upsert_candidate(&mut dedup, candidate);
                }
            }
            None => {
                for candidate in query_schedule_rows(connection, market_filter, since, until)? {
                    upsert_candidate(&mut dedup, candidate);
                }
            }
        }
    }

    if kind != Some(RecordKind::Schedule) {
        for candidate in query_result_rows(connection, market_filter, since, until, text_filter)? {
            upsert_candidate(&mut dedup, candidate);
        }
    }

    let mut candidates: Vec<QueryCandidate> = dedup.into_values().collect();
    candidates.sort_by(|left, right| {
        right
            .score
            .total_cmp(&left.score)
            .then(right.sale_date.cmp(&left.sale_date))
            .then(left.key.cmp(&right.key))
    });

    Ok(candidates)
}

fn market_score(row_market: &str, market_filter: Option<&str>) -> (f64, &'static str) {
    match market_filter {
        Some(filter) if row_market.eq_ignore_ascii_case(filter) => (1000.0, "exact_market"),
        Some(_) => (700.0, "market_contains"),
        None => (600.0, "date_range"),
    }
}

fn query_schedule_rows(
    connection: &Connection,
    market_filter: Option<&str>,
    since: Option<&str>,
    until: Option<&str>,
) -> Result<Vec<QueryCandidate>> {
    let mut statement = connection.prepare(
        "
        SELECT event_id, market, market_confidence, sale_date, est_head, raw_text, report_id
        FROM auction_schedule
        WHERE
          (?1 IS NULL OR lower(market) = lower(?1) OR lower(market) LIKE '%' || lower(?1) || '%')
          AND (?2 IS NULL OR sale_date >= ?2)
          AND (?3 IS NULL OR sale_date <= ?3)
        ORDER BY sale_date DESC
        LIMIT ?4
        ",
    )?;

    let mut rows = statement.query(params![market_filter, since, until, MAX_QUERY_CANDIDATES])?;
    let mut out = Vec::new();

    while let Some(row) = rows.next()? {
        let event_id: String = row.get(0)?;
        let market: String = row.get(1)?;
        let (score, match_kind) = market_score(&market, market_filter);

        out.push(QueryCandidate {
            key: format!("schedule:{event_id}"),
            score,
            match_kind,
            kind: "schedule",
            market,
            market_confidence: row.get(2)?,
            sale_date: row.get(3)?,
            head_count: row.get(4)?,
            raw_text: row.get(5)?,
            result_id: None,
            report_id: row.get(6)?,
        });
    }

    Ok(out)
}

fn query_fts_rows(
    connection: &Connection,
    text: &str,
    market_filter: Option<&str>,
    since: Option<&str>,
    until: Option<&str>,
) -> Result<Vec<QueryCandidate>> {
    let fts_query = to_fts_query(text);
    if fts_query.is_empty() {
        return Ok(Vec::new());
    }

    let mut statement = connection.prepare(
        "
        SELECT
          s.event_id,
          s.market,
          s.market_confidence,
          s.sale_date,
          s.est_head,
          snippet(schedule_fts, 2, '[', ']', ' ... ', 18),
          s.report_id
        FROM schedule_fts
        JOIN auction_schedule s ON s.rowid = schedule_fts.rowid
        WHERE
          schedule_fts MATCH ?1
          AND (?2 IS NULL OR lower(s.market) = lower(?2)
               OR lower(s.market) LIKE '%' || lower(?2) || '%')
          AND (?3 IS NULL OR s.sale_date >= ?3)
          AND (?4 IS NULL OR s.sale_date <= ?4)
        ORDER BY bm25(schedule_fts) ASC
        LIMIT ?5
        ",
    )?;

    let mut rows = statement.query(params![
        fts_query,
        market_filter,
        since,
        until,
        MAX_QUERY_CANDIDATES
    ])?;

    let mut out = Vec::new();
    let mut index = 0usize;

    while let Some(row) = rows.next()? {
        let event_id: String = row.get(0)?;
        out.push(QueryCandidate {
            key: format!("schedule:{event_id}"),
            score: 500.0 - (index as f64),
            match_kind: "fts",
            kind: "schedule",
            market: row.get(1)?,
            market_confidence: row.get(2)?,
            sale_date: row.get(3)?,
            head_count: row.get(4)?,
            raw_text: row.get(5)?,
            result_id: None,
            report_id: row.get(6)?,
        });
        index += 1;
    }

    Ok(out)
}

fn query_result_rows(
    connection: &Connection,
    market_filter: Option<&str>,
    since: Option<&str>,
    until: Option<&str>,
    text_filter: Option<&str>,
) -> Result<Vec<QueryCandidate>> {
    let mut statement = connection.prepare(
        "
        SELECT result_id, market, market_confidence, sale_date, total_head, report_id
        FROM auction_results
        WHERE
          (?1 IS NULL OR lower(market) = lower(?1) OR lower(market) LIKE '%' || lower(?1) || '%')
          AND (?2 IS NULL OR sale_date >= ?2)
          AND (?3 IS NULL OR sale_date <= ?3)
          AND (?4 IS NULL OR lower(market) LIKE '%' || lower(?4) || '%')
        ORDER BY sale_date DESC
        LIMIT ?5
        ",
    )?;

    let mut rows = statement.query(params![
        market_filter,
        since,
        until,
        text_filter,
        MAX_QUERY_CANDIDATES
    ])?;
    let mut out = Vec::new();

    while let Some(row) = rows.next()? {
        let result_id: i64 = row.get(0)?;
        let market: String = row.get(1)?;
        let (score, match_kind) = market_score(&market, market_filter);

        out.push(QueryCandidate {
            key: format!("results:{result_id}"),
            // results rank just above schedule rows of the same match kind
            score: score + 10.0,
            match_kind,
            kind: "results",
            market,
            market_confidence: row.get(2)?,
            sale_date: row.get(3)?,
            head_count: row.get(4)?,
            raw_text: None,
            result_id: Some(result_id),
            report_id: row.get(5)?,
        });
    }

    Ok(out)
}

fn upsert_candidate(dedup: &mut HashMap<String, QueryCandidate>, candidate: QueryCandidate) {
    match dedup.get(&candidate.key) {
        Some(existing) if existing.score >= candidate.score => {}
        _ => {
            dedup.insert(candidate.key.clone(), candidate);
        }
    }
}

fn to_rows(connection: &Connection, candidates: Vec<QueryCandidate>) -> Result<Vec<QueryRow>> {
    let mut out = Vec::with_capacity(candidates.len());

    for (index, candidate) in candidates.into_iter().enumerate() {
        let classes = match candidate.result_id {
            Some(result_id) => Some(fetch_classes(connection, result_id)?),
            None => None,
        };

        let citation = format!(
            "{}, sale {}, report {}",
            candidate.market, candidate.sale_date, candidate.report_id
        );

        out.push(QueryRow {
            rank: index + 1,
            score: candidate.score,
            match_kind: candidate.match_kind.to_string(),
            kind: candidate.kind.to_string(),
            market: candidate.market,
            market_confidence: candidate.market_confidence,
            sale_date: candidate.sale_date,
            head_count: candidate.head_count,
            raw_text: candidate.raw_text.as_deref().map(condense_whitespace),
            classes,
            report_id: candidate.report_id,
            citation,
        });
    }

    Ok(out)
}

fn fetch_classes(connection: &Connection, result_id: i64) -> Result<Vec<ClassRow>> {
    let mut statement = connection.prepare(
        "
        SELECT class_label, avg_cwt, lots
        FROM result_classes
        WHERE result_id = ?1
        ORDER BY class_label
        ",
    )?;

    let mut rows = statement.query(params![result_id])?;
    let mut classes = Vec::new();

    while let Some(row) = rows.next()? {
        classes.push(ClassRow {
            class_label: row.get(0)?,
            avg_cwt: row.get(1)?,
            lots: row.get(2)?,
        });
    }

    Ok(classes)
}

fn write_json_response(
    args: &QueryArgs,
    market_filter: Option<String>,
    text_filter: Option<String>,
    since: Option<String>,
    until: Option<String>,
    results: Vec<QueryRow>,
) -> Result<()> {
    let response = QueryResponse {
        market_filter,
        text_filter,
        since,
        until,
        kind_filter: args.kind.map(|kind| kind.as_str().to_string()),
        limit: args.limit,
        returned: results.len(),
        results,
    };

    let mut output = io::BufWriter::new(io::stdout().lock());
    serde_json::to_writer_pretty(&mut output, &response)
        .context("failed to serialize query json output")?;
    writeln!(output)?;
    output.flush()?;
    Ok(())
}

fn write_text_response(results: &[QueryRow]) -> Result<()> {
    let mut output = io::BufWriter::new(io::stdout().lock());

    writeln!(output, "Results: {}", results.len())?;

    for result in results {
        let head = result
            .head_count
            .map(|value| value.to_string())
            .unwrap_or_else(|| "unknown".to_string());

        writeln!(
            output,
            "{}.\t{}\t{}\t{}\thead {}",
            result.rank, result.kind, result.market, result.sale_date, head
        )?;
        writeln!(
            output,
            "\tmatch={} score={:.1} confidence={}",
            result.match_kind, result.score, result.market_confidence
        )?;
        if let Some(raw_text) = &result.raw_text {
            writeln!(output, "\traw: {raw_text}")?;
        }
        if let Some(classes) = &result.classes {
            for class in classes {
                writeln!(
                    output,
                    "\tclass {}: avg {:.2} cwt over {} lots",
                    class.class_label, class.avg_cwt, class.lots
                )?;
            }
        }
        writeln!(output, "\tcitation: {}", result.citation)?;
    }

    output.flush()?;
    Ok(())
}

fn to_fts_query(text: &str) -> String {
    text.split_whitespace()
        .filter(|token| !token.trim().is_empty())
        .map(|token| format!("\"{}\"", token.replace('"', "")))
        .collect::<Vec<String>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::ingest::ensure_schema;

    fn seeded_connection() -> Connection {
        let connection = Connection::open_in_memory().unwrap();
        ensure_schema(&connection).unwrap();

        connection
            .execute_batch(
                "
                INSERT INTO reports(report_id, filename, kind, sha256, ingested_at) VALUES
                  ('r1', 'weekly.txt', 'text', '1111aaaa', 't0'),
                  ('r2', 'results.txt', 'text', '2222bbbb', 't0');

                INSERT INTO auction_schedule
                  (event_id, market, market_confidence, sale_date, est_head, raw_text, report_id, ingested_at)
                VALUES
                  ('r1:20250826:001', 'Dodge City', 100, '2025-08-26', 1500,
                   'Dodge City 8/26/2025 expecting 1,500 head', 'r1', 't0'),
                  ('r1:20250902:002', 'Pratt', 95, '2025-09-02', NULL,
                   'Pratt special sale Sept 2', 'r1', 't0');

                INSERT INTO auction_results
                  (market, market_confidence, sale_date, total_head, report_id, ingested_at)
                VALUES
                  ('Dodge City', 100, '2025-08-21', 1805, 'r2', 't0');

                INSERT INTO schedule_fts(schedule_fts) VALUES('rebuild');
                ",
            )
            .unwrap();

        connection
    }

    #[test]
    fn to_fts_query_quotes_tokens() {
        assert_eq!(to_fts_query("special sale"), "\"special\" \"sale\"");
        assert_eq!(to_fts_query("  \"quoted\"  "), "\"quoted\"");
        assert_eq!(to_fts_query("   "), "");
    }

    #[test]
    fn schedule_rows_filter_by_market_and_score_exact_matches() {
        let connection = seeded_connection();
        let rows = query_schedule_rows(&connection, Some("Dodge City"), None, None).unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].market, "Dodge City");
        assert_eq!(rows[0].match_kind, "exact_market");
        assert_eq!(rows[0].head_count, Some(1500));
    }

    #[test]
    fn schedule_rows_filter_by_date_range() {
        let connection = seeded_connection();
        let rows =
            query_schedule_rows(&connection, None, Some("2025-09-01"), None).unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].sale_date, "2025-09-02");
        assert_eq!(rows[0].match_kind, "date_range");
    }

    #[test]
    fn fts_rows_match_raw_text_tokens() {
        let connection = seeded_connection();
        let rows = query_fts_rows(&connection, "special sale", None, None, None).unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].market, "Pratt");
        assert_eq!(rows[0].match_kind, "fts");
    }

    #[test]
    fn result_rows_rank_above_schedule_rows_for_same_market() {
        let connection = seeded_connection();
        let candidates =
            collect_candidates(&connection, None, Some("Dodge City"), None, None, None).unwrap();

        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].kind, "results");
        assert_eq!(candidates[1].kind, "schedule");
    }

    #[test]
    fn text_filter_restricts_candidates_to_fts_matches() {
        let connection = seeded_connection();
        let candidates =
            collect_candidates(&connection, None, None, Some("special sale"), None, None).unwrap();

        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].market, "Pratt");
        assert_eq!(candidates[0].match_kind, "fts");

        let bounded = collect_candidates(
            &connection,
            None,
            None,
            Some("special sale"),
            Some("2025-08-01"),
            None,
        )
        .unwrap();
        assert_eq!(bounded.len(), 1);
        assert_eq!(bounded[0].sale_date, "2025-09-02");
    }

    #[test]
    fn dedup_keeps_highest_scoring_candidate() {
        let connection = seeded_connection();
        let mut dedup = HashMap::new();

        for candidate in query_schedule_rows(&connection, None, Some("2025-08-01"), None).unwrap()
        {
            upsert_candidate(&mut dedup, candidate);
        }
        for candidate in
            query_schedule_rows(&connection, Some("Dodge City"), None, None).unwrap()
        {
            upsert_candidate(&mut dedup, candidate);
        }

        let dodge = dedup.get("schedule:r1:20250826:001").unwrap();
        assert_eq!(dodge.match_kind, "exact_market");
        assert_eq!(dodge.score, 1000.0);
    }

    #[test]
    fn parse_iso_date_rejects_non_iso_input() {
        assert!(parse_iso_date(Some("08/26/2025"), "--since").is_err());
        assert_eq!(
            parse_iso_date(Some("2025-08-26"), "--since").unwrap(),
            Some(NaiveDate::from_ymd_opt(2025, 8, 26).unwrap())
        );
        assert_eq!(parse_iso_date(None, "--since").unwrap(), None);
    }

    #[test]
    fn fetch_classes_returns_rows_in_label_order() {
        let connection = seeded_connection();
        connection
            .execute_batch(
                "
                INSERT INTO result_classes(result_id, class_label, avg_cwt, lots) VALUES
                  (1, 'feeder_steers', 238.75, 2),
                  (1, 'bulls', 155.0, 1);
                ",
            )
            .unwrap();

        let classes = fetch_classes(&connection, 1).unwrap();
        assert_eq!(classes.len(), 2);
        assert_eq!(classes[0].class_label, "bulls");
        assert_eq!(classes[1].class_label, "feeder_steers");
    }
}
