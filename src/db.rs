use std::collections::BTreeSet;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::warn;

use crate::fingerprint::Fingerprint;
use crate::pipeline::{BatchReport, Document};
use crate::registry::{RuleRecord, RuleRegistry, SiteRuleSet};

const DB_PATH: &str = "data/fare_rules.sqlite";

pub fn connect() -> Result<Connection> {
    std::fs::create_dir_all("data").context("Failed to create data directory")?;
    let conn = Connection::open(DB_PATH)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS captures (
            id          INTEGER PRIMARY KEY,
            source      TEXT NOT NULL,
            body        TEXT NOT NULL,
            captured_at TEXT NOT NULL,
            analyzed    BOOLEAN NOT NULL DEFAULT 0,
            created_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_captures_pending ON captures(source, analyzed);

        CREATE TABLE IF NOT EXISTS rule_sets (
            source       TEXT PRIMARY KEY,
            rules        TEXT NOT NULL,
            rule_count   INTEGER NOT NULL,
            last_updated TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS runs (
            id                  INTEGER PRIMARY KEY,
            source              TEXT NOT NULL,
            documents           INTEGER NOT NULL,
            previous_rule_count INTEGER NOT NULL,
            new_rule_count      INTEGER NOT NULL,
            updated             BOOLEAN NOT NULL,
            ran_at              TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_runs_source ON runs(source);

        CREATE TABLE IF NOT EXISTS baselines (
            source      TEXT PRIMARY KEY,
            digest      TEXT NOT NULL,
            features    TEXT NOT NULL,
            captured_at TEXT NOT NULL
        );
        ",
    )?;
    Ok(())
}

pub struct CaptureRow {
    pub id: i64,
    pub doc: Document,
}

pub fn insert_captures(conn: &Connection, docs: &[Document]) -> Result<usize> {
    let mut stmt =
        conn.prepare("INSERT INTO captures (source, body, captured_at) VALUES (?1, ?2, ?3)")?;
    for doc in docs {
        stmt.execute(rusqlite::params![
            doc.source,
            doc.body,
            doc.captured_at.to_rfc3339(),
        ])?;
    }
    Ok(docs.len())
}

pub fn fetch_unanalyzed(
    conn: &Connection,
    source: Option<&str>,
    limit: Option<usize>,
) -> Result<Vec<CaptureRow>> {
    let mut sql =
        String::from("SELECT id, source, body, captured_at FROM captures WHERE analyzed = 0");
    if source.is_some() {
        sql.push_str(" AND source = ?1");
    }
    sql.push_str(" ORDER BY id");
    if let Some(n) = limit {
        sql.push_str(&format!(" LIMIT {}", n));
    }

    let mut stmt = conn.prepare(&sql)?;
    let map_row = |row: &rusqlite::Row| -> rusqlite::Result<(i64, String, String, String)> {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
    };
    let rows: Vec<(i64, String, String, String)> = match source {
        Some(s) => stmt
            .query_map(rusqlite::params![s], map_row)?
            .collect::<rusqlite::Result<_>>()?,
        None => stmt
            .query_map([], map_row)?
            .collect::<rusqlite::Result<_>>()?,
    };

    Ok(rows
        .into_iter()
        .map(|(id, source, body, captured_at)| CaptureRow {
            id,
            doc: Document {
                source,
                body,
                captured_at: parse_ts(&captured_at),
            },
        })
        .collect())
}

pub fn mark_analyzed(conn: &Connection, ids: &[i64]) -> Result<()> {
    let mut stmt = conn.prepare("UPDATE captures SET analyzed = 1 WHERE id = ?1")?;
    for id in ids {
        stmt.execute(rusqlite::params![id])?;
    }
    Ok(())
}

/// Load every persisted rule set into the registry. A row with undecodable
/// rule JSON is skipped with a warning, never fatal.
pub fn load_rule_sets(conn: &Connection, registry: &RuleRegistry) -> Result<usize> {
    let mut stmt = conn.prepare("SELECT source, rules, last_updated FROM rule_sets")?;
    let rows: Vec<(String, String, String)> = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
        .collect::<rusqlite::Result<_>>()?;

    let mut loaded = 0;
    for (source, rules_json, last_updated) in rows {
        let records: Vec<RuleRecord> = match serde_json::from_str(&rules_json) {
            Ok(r) => r,
            Err(e) => {
                warn!("Skipping rule set for {}: {}", source, e);
                continue;
            }
        };
        let set = SiteRuleSet::from_records(records, parse_ts(&last_updated));
        registry.restore(&source, set);
        loaded += 1;
    }
    Ok(loaded)
}

pub fn save_rule_set(conn: &Connection, source: &str, set: &SiteRuleSet) -> Result<()> {
    let rules_json = serde_json::to_string(&set.to_records())?;
    conn.execute(
        "INSERT INTO rule_sets (source, rules, rule_count, last_updated)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(source) DO UPDATE SET
            rules = excluded.rules,
            rule_count = excluded.rule_count,
            last_updated = excluded.last_updated",
        rusqlite::params![
            source,
            rules_json,
            set.rule_count() as i64,
            set.last_updated.to_rfc3339(),
        ],
    )?;
    Ok(())
}

pub fn save_run(conn: &Connection, report: &BatchReport, documents: usize) -> Result<()> {
    conn.execute(
        "INSERT INTO runs (source, documents, previous_rule_count, new_rule_count, updated)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        rusqlite::params![
            report.source,
            documents as i64,
            report.previous_rule_count as i64,
            report.new_rule_count as i64,
            report.updated,
        ],
    )?;
    Ok(())
}

pub fn save_baseline(
    conn: &Connection,
    source: &str,
    fp: &Fingerprint,
    captured_at: DateTime<Utc>,
) -> Result<()> {
    let features: Vec<&String> = fp.features.iter().collect();
    conn.execute(
        "INSERT INTO baselines (source, digest, features, captured_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(source) DO UPDATE SET
            digest = excluded.digest,
            features = excluded.features,
            captured_at = excluded.captured_at",
        rusqlite::params![
            source,
            fp.digest,
            serde_json::to_string(&features)?,
            captured_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

pub fn load_baseline(conn: &Connection, source: &str) -> Result<Option<Fingerprint>> {
    let mut stmt = conn.prepare("SELECT digest, features FROM baselines WHERE source = ?1")?;
    let row: Option<(String, String)> = stmt
        .query_map(rusqlite::params![source], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?
        .next()
        .transpose()?;

    Ok(match row {
        Some((digest, features_json)) => {
            let features: BTreeSet<String> = serde_json::from_str::<Vec<String>>(&features_json)?
                .into_iter()
                .collect();
            Some(Fingerprint { digest, features })
        }
        None => None,
    })
}

pub struct Stats {
    pub captures: usize,
    pub unanalyzed: usize,
    pub sources_with_rules: usize,
    pub total_rules: usize,
    pub runs: usize,
}

pub fn get_stats(conn: &Connection) -> Result<Stats> {
    let one = |sql: &str| -> Result<usize> {
        let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
        Ok(n as usize)
    };
    Ok(Stats {
        captures: one("SELECT COUNT(*) FROM captures")?,
        unanalyzed: one("SELECT COUNT(*) FROM captures WHERE analyzed = 0")?,
        sources_with_rules: one("SELECT COUNT(*) FROM rule_sets")?,
        total_rules: one("SELECT COALESCE(SUM(rule_count), 0) FROM rule_sets")?,
        runs: one("SELECT COUNT(*) FROM runs")?,
    })
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| DateTime::<Utc>::MIN_UTC)
}
