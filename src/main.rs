mod db;
mod extract;
mod fingerprint;
mod health;
mod pipeline;
mod registry;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};
use tracing::warn;

use crate::extract::rank::RankWeights;
use crate::pipeline::Document;
use crate::registry::{RuleRegistry, RuleSetRecord};

#[derive(Parser)]
#[command(name = "fare_rules", about = "Adaptive price-selector discovery for booking sites")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load capture files (<source>_*.html|json) into the capture queue
    Ingest {
        /// Directory of capture files
        #[arg(short, long)]
        dir: PathBuf,
        /// Force all files under one source id (default: filename prefix)
        #[arg(short, long)]
        source: Option<String>,
    },
    /// Derive and rank rules from unanalyzed captures, merge into registry
    Analyze {
        /// Only this source
        #[arg(short, long)]
        source: Option<String>,
        /// Max captures to analyze (default: all unanalyzed)
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
    /// Current trusted rules, per source or all sources
    Rules {
        #[arg(short, long)]
        source: Option<String>,
    },
    /// Apply a source's rules to a fresh capture and print the price
    Extract {
        #[arg(short, long)]
        source: String,
        #[arg(short, long)]
        file: PathBuf,
    },
    /// Test how many trusted rules still fire against a fresh capture
    Check {
        #[arg(short, long)]
        source: String,
        #[arg(short, long)]
        file: PathBuf,
    },
    /// Compare a fresh capture's markup fingerprint against the baseline
    Drift {
        #[arg(short, long)]
        source: String,
        #[arg(short, long)]
        file: PathBuf,
        /// Store this capture as the new baseline
        #[arg(long)]
        baseline: bool,
    },
    /// List sources whose rules predate now - max-age
    Stale {
        #[arg(long, default_value = "24")]
        max_age_hours: i64,
    },
    /// Dump the registry as JSON for the serving layer
    Export {
        #[arg(short, long, default_value = "rules_export.json")]
        out: PathBuf,
    },
    /// Show capture and rule-set statistics
    Stats,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Ingest { dir, source } => cmd_ingest(&dir, source.as_deref()),
        Commands::Analyze { source, limit } => cmd_analyze(source.as_deref(), limit),
        Commands::Rules { source } => cmd_rules(source.as_deref()),
        Commands::Extract { source, file } => cmd_extract(&source, &file),
        Commands::Check { source, file } => cmd_check(&source, &file),
        Commands::Drift {
            source,
            file,
            baseline,
        } => cmd_drift(&source, &file, baseline),
        Commands::Stale { max_age_hours } => cmd_stale(max_age_hours),
        Commands::Export { out } => cmd_export(&out),
        Commands::Stats => cmd_stats(),
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

fn cmd_ingest(dir: &Path, source_override: Option<&str>) -> Result<()> {
    let conn = db::connect()?;
    db::init_schema(&conn)?;

    let docs = read_capture_dir(dir, source_override)?;
    if docs.is_empty() {
        println!("No capture files (*.html, *.json) found in {}", dir.display());
        return Ok(());
    }
    let inserted = db::insert_captures(&conn, &docs)?;
    let sources: std::collections::BTreeSet<&str> =
        docs.iter().map(|d| d.source.as_str()).collect();
    println!(
        "Ingested {} captures from {} sources: {}",
        inserted,
        sources.len(),
        sources.into_iter().collect::<Vec<_>>().join(", ")
    );
    Ok(())
}

/// Capture files are named `<source>_<anything>.html` / `.json`; the capture
/// timestamp is the file mtime. One unreadable file is skipped, not fatal.
fn read_capture_dir(dir: &Path, source_override: Option<&str>) -> Result<Vec<Document>> {
    let mut docs = Vec::new();
    let mut entries: Vec<_> = std::fs::read_dir(dir)?.filter_map(|e| e.ok()).collect();
    entries.sort_by_key(|e| e.path());

    for entry in entries {
        let path = entry.path();
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        if !matches!(ext, "html" | "htm" | "json") {
            continue;
        }
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
        let source = match source_override {
            Some(s) => s.to_string(),
            None => stem.split('_').next().unwrap_or(stem).to_string(),
        };
        if source.is_empty() {
            continue;
        }
        let body = match std::fs::read_to_string(&path) {
            Ok(b) => b,
            Err(e) => {
                warn!("Skipping {}: {}", path.display(), e);
                continue;
            }
        };
        let captured_at = entry
            .metadata()
            .ok()
            .and_then(|m| m.modified().ok())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(Utc::now);
        docs.push(Document {
            source,
            body,
            captured_at,
        });
    }
    Ok(docs)
}

fn cmd_analyze(source: Option<&str>, limit: Option<usize>) -> Result<()> {
    use indicatif::{ProgressBar, ProgressStyle};
    use rayon::prelude::*;

    let conn = db::connect()?;
    db::init_schema(&conn)?;

    let reg = RuleRegistry::new();
    db::load_rule_sets(&conn, &reg)?;

    let rows = db::fetch_unanalyzed(&conn, source, limit)?;
    if rows.is_empty() {
        println!("No unanalyzed captures. Run 'ingest' first.");
        return Ok(());
    }

    let mut groups: BTreeMap<String, Vec<db::CaptureRow>> = BTreeMap::new();
    for row in rows {
        groups.entry(row.doc.source.clone()).or_default().push(row);
    }
    let total: usize = groups.values().map(|v| v.len()).sum();
    println!("Analyzing {} captures across {} sources...", total, groups.len());

    let pb = ProgressBar::new(groups.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec})")
            .unwrap()
            .progress_chars("#>-"),
    );

    let weights = RankWeights::default();
    let entries: Vec<(String, Vec<db::CaptureRow>)> = groups.into_iter().collect();
    let reports: Vec<pipeline::BatchReport> = entries
        .par_iter()
        .map(|(src, batch)| {
            let docs: Vec<Document> = batch.iter().map(|r| r.doc.clone()).collect();
            let report = pipeline::run_batch(&reg, src, &docs, &weights);
            pb.inc(1);
            report
        })
        .collect();
    pb.finish_and_clear();

    let mut updated = 0;
    for ((src, batch), report) in entries.iter().zip(&reports) {
        if report.updated {
            if let Some(set) = reg.get_rules(src) {
                db::save_rule_set(&conn, src, &set)?;
            }
            updated += 1;
        }
        db::save_run(&conn, report, batch.len())?;
        let ids: Vec<i64> = batch.iter().map(|r| r.id).collect();
        db::mark_analyzed(&conn, &ids)?;
        println!(
            "  {:<20} {} docs, rules {} -> {}{}",
            report.source,
            batch.len(),
            report.previous_rule_count,
            report.new_rule_count,
            if report.updated { "" } else { " (no signal, kept previous)" },
        );
    }
    println!("Updated {} of {} sources.", updated, entries.len());
    Ok(())
}

fn cmd_rules(source: Option<&str>) -> Result<()> {
    let conn = db::connect()?;
    db::init_schema(&conn)?;
    let reg = RuleRegistry::new();
    db::load_rule_sets(&conn, &reg)?;

    match source {
        Some(src) => {
            let Some(set) = reg.get_rules(src) else {
                println!("No rules for '{}'. Run 'analyze' first.", src);
                return Ok(());
            };
            println!(
                "{} — {} rules, updated {}",
                src,
                set.rule_count(),
                set.last_updated.format("%Y-%m-%d %H:%M UTC")
            );
            println!(
                "{:>3} | {:<10} | {:>5} | {:>7} | {}",
                "#", "Kind", "Score", "Support", "Rule"
            );
            println!("{}", "-".repeat(80));
            for (i, rule) in set.rules.iter().enumerate() {
                let kind = if rule.candidate.is_structural() {
                    "structural"
                } else {
                    "textual"
                };
                println!(
                    "{:>3} | {:<10} | {:>5.2} | {:>7} | {}",
                    i + 1,
                    kind,
                    rule.score,
                    rule.support,
                    truncate(&rule.candidate.key(), 48)
                );
            }
        }
        None => {
            let snapshot = reg.snapshot();
            if snapshot.is_empty() {
                println!("Registry is empty. Run 'analyze' first.");
                return Ok(());
            }
            println!(
                "{:>3} | {:<20} | {:>5} | {:<17} | {}",
                "#", "Source", "Rules", "Updated", "Top rule"
            );
            println!("{}", "-".repeat(90));
            for (i, (src, set)) in snapshot.iter().enumerate() {
                let top = set
                    .rules
                    .first()
                    .map(|r| truncate(&r.candidate.key(), 32))
                    .unwrap_or_else(|| "-".into());
                println!(
                    "{:>3} | {:<20} | {:>5} | {:<17} | {}",
                    i + 1,
                    truncate(src, 20),
                    set.rule_count(),
                    set.last_updated.format("%Y-%m-%d %H:%M"),
                    top
                );
            }
            println!("\n{} sources", snapshot.len());
        }
    }
    Ok(())
}

fn cmd_extract(source: &str, file: &Path) -> Result<()> {
    let conn = db::connect()?;
    db::init_schema(&conn)?;
    let reg = RuleRegistry::new();
    db::load_rule_sets(&conn, &reg)?;

    let Some(set) = reg.get_rules(source) else {
        println!("No rules for '{}'. Run 'analyze' first.", source);
        return Ok(());
    };
    let body = std::fs::read_to_string(file)?;
    match set.extract_first(&body) {
        Some(hit) => {
            println!("{}", hit.value);
            println!("  matched: {}", truncate(hit.matched.trim(), 60));
        }
        None => println!(
            "No rule matched. Run 'check -s {}' to see rule health.",
            source
        ),
    }
    Ok(())
}

fn cmd_check(source: &str, file: &Path) -> Result<()> {
    let conn = db::connect()?;
    db::init_schema(&conn)?;
    let reg = RuleRegistry::new();
    db::load_rule_sets(&conn, &reg)?;

    let Some(set) = reg.get_rules(source) else {
        println!("No rules for '{}'. Run 'analyze' first.", source);
        return Ok(());
    };
    let body = std::fs::read_to_string(file)?;
    let report = health::check_rules(&set, &body);
    println!(
        "{}: {}/{} rules working ({:.0}%)",
        source,
        report.working,
        report.total,
        report.healthy_ratio() * 100.0
    );
    if let Some(hit) = &report.sample {
        println!("  sample value: {}", hit.value);
    }
    if report.healthy_ratio() < 0.5 {
        println!("  markup likely changed; ingest fresh captures and re-run 'analyze'");
    }
    Ok(())
}

fn cmd_drift(source: &str, file: &Path, store_baseline: bool) -> Result<()> {
    let conn = db::connect()?;
    db::init_schema(&conn)?;

    let body = std::fs::read_to_string(file)?;
    let current = fingerprint::fingerprint(&body);

    match db::load_baseline(&conn, source)? {
        Some(baseline) => {
            let sim = fingerprint::similarity(&baseline, &current);
            println!("{}: {:.1}% similar to baseline", source, sim * 100.0);
            if sim < 0.7 {
                println!("  significant markup change; rules likely need re-deriving");
            }
        }
        None => {
            println!("No baseline for '{}' yet.", source);
            if !store_baseline {
                println!("  re-run with --baseline to store this capture as the baseline");
            }
        }
    }

    if store_baseline {
        db::save_baseline(&conn, source, &current, Utc::now())?;
        println!("Baseline stored ({} features).", current.features.len());
    }
    Ok(())
}

fn cmd_stale(max_age_hours: i64) -> Result<()> {
    let conn = db::connect()?;
    db::init_schema(&conn)?;
    let reg = RuleRegistry::new();
    db::load_rule_sets(&conn, &reg)?;

    let now = Utc::now();
    let max_age = Duration::hours(max_age_hours);
    let stale: Vec<String> = reg
        .sources()
        .into_iter()
        .filter(|s| reg.is_stale(s, max_age, now))
        .collect();

    if stale.is_empty() {
        println!(
            "All {} sources fresh (max age {}h).",
            reg.sources().len(),
            max_age_hours
        );
        return Ok(());
    }
    println!("{} stale sources (older than {}h):", stale.len(), max_age_hours);
    for src in stale {
        let updated = reg
            .get_rules(&src)
            .map(|s| s.last_updated.format("%Y-%m-%d %H:%M UTC").to_string())
            .unwrap_or_else(|| "never".into());
        println!("  {:<20} last updated {}", src, updated);
    }
    Ok(())
}

fn cmd_export(out: &Path) -> Result<()> {
    let conn = db::connect()?;
    db::init_schema(&conn)?;
    let reg = RuleRegistry::new();
    db::load_rule_sets(&conn, &reg)?;

    let snapshot = reg.snapshot();
    let export: BTreeMap<&str, RuleSetRecord> = snapshot
        .iter()
        .map(|(src, set)| (src.as_str(), RuleSetRecord::from_set(set)))
        .collect();
    std::fs::write(out, serde_json::to_string_pretty(&export)?)?;
    println!("Exported {} sources to {}", export.len(), out.display());
    Ok(())
}

fn cmd_stats() -> Result<()> {
    let conn = db::connect()?;
    db::init_schema(&conn)?;
    let s = db::get_stats(&conn)?;
    println!("Captures:   {}", s.captures);
    println!("Unanalyzed: {}", s.unanalyzed);
    println!("Sources:    {}", s.sources_with_rules);
    println!("Rules:      {}", s.total_rules);
    println!("Runs:       {}", s.runs);
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{}...", truncated)
    }
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
