//! Read-only reporting over stored scores: per-run summary files, parquet
//! snapshots with a checksum manifest, and the per-channel sentiment table.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Float64Array, Int64Array, RecordBatch, StringArray, UInt64Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use parquet::arrow::ArrowWriter;
use rsm_core::{ScoredItem, SentimentLabel};
use rsm_storage::Store;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;

use crate::RunSummary;

const NO_CHANNEL: &str = "(none)";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelSentiment {
    pub channel: String,
    pub positive: u64,
    pub negative: u64,
    pub neutral: u64,
    pub total: u64,
    /// positive minus negative
    pub net: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub files: Vec<SnapshotManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Mention counts per channel, busiest first.
pub fn channel_breakdown(items: &[ScoredItem]) -> Vec<ChannelSentiment> {
    let mut by_channel: BTreeMap<&str, ChannelSentiment> = BTreeMap::new();
    for item in items {
        let channel = item.channel.as_deref().unwrap_or(NO_CHANNEL);
        let row = by_channel.entry(channel).or_insert_with(|| ChannelSentiment {
            channel: channel.to_string(),
            positive: 0,
            negative: 0,
            neutral: 0,
            total: 0,
            net: 0,
        });
        match item.sentiment.label {
            SentimentLabel::Positive => row.positive += 1,
            SentimentLabel::Negative => row.negative += 1,
            SentimentLabel::Neutral => row.neutral += 1,
        }
        row.total += 1;
        row.net = row.positive as i64 - row.negative as i64;
    }

    let mut rows: Vec<_> = by_channel.into_values().collect();
    rows.sort_by(|a, b| b.total.cmp(&a.total).then_with(|| a.channel.cmp(&b.channel)));
    rows
}

pub fn channel_table_markdown(rows: &[ChannelSentiment], top_n: usize) -> String {
    let mut lines = vec![
        "| channel | positive | negative | neutral | total | net |".to_string(),
        "|---|---:|---:|---:|---:|---:|".to_string(),
    ];
    for row in rows.iter().take(top_n) {
        lines.push(format!(
            "| {} | {} | {} | {} | {} | {:+} |",
            row.channel, row.positive, row.negative, row.neutral, row.total, row.net
        ));
    }
    lines.join("\n")
}

/// Sentiment report for scored items fetched in `[since, until)`.
pub async fn report_markdown(
    store: &Store,
    since: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
    top_n: usize,
) -> Result<String> {
    let items = store
        .get_scores(since, until)
        .await
        .context("loading scored items")?;
    let counts = store.status_counts().await.context("counting score states")?;
    let rows = channel_breakdown(&items);

    let window = |ts: Option<DateTime<Utc>>| ts.map_or_else(|| "-".to_string(), |ts| ts.to_rfc3339());
    let mut out = vec![
        "# RSM Sentiment Report".to_string(),
        String::new(),
        format!("- Window: {} .. {}", window(since), window(until)),
        format!("- Scored items in window: {}", items.len()),
        format!(
            "- Store: {} scored, {} pending, {} failed, {} not yet seeded",
            counts.scored, counts.pending, counts.failed, counts.unscored
        ),
        String::new(),
    ];
    if rows.is_empty() {
        out.push("No scored items in this window.".to_string());
    } else {
        out.push(format!("## Top {} channels", top_n.min(rows.len())));
        out.push(String::new());
        out.push(channel_table_markdown(&rows, top_n));
    }
    out.push(String::new());
    Ok(out.join("\n"))
}

/// Write `<reports_root>/<run_id>/` with the run summary and parquet snapshots.
pub async fn write_reports(
    reports_root: &Path,
    summary: &RunSummary,
    store: &Store,
) -> Result<PathBuf> {
    let reports_dir = reports_root.join(summary.run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let items = store
        .get_scores(None, None)
        .await
        .context("loading scored items")?;
    let rows = channel_breakdown(&items);

    let markdown = summary_markdown(summary, &rows);
    fs::write(reports_dir.join("run_summary.md"), markdown)
        .await
        .context("writing run_summary.md")?;
    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(reports_dir.join("run_summary.json"), json)
        .await
        .context("writing run_summary.json")?;

    export_snapshots(&reports_dir, &items, &rows).await?;
    Ok(reports_dir)
}

fn summary_markdown(summary: &RunSummary, rows: &[ChannelSentiment]) -> String {
    let mut lines = vec![
        "# RSM Run Summary".to_string(),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
        format!("- Source: {}", summary.source),
        format!("- Started: {}", summary.started_at),
        format!("- Finished: {}", summary.finished_at),
        format!(
            "- Ingestion: {} fetched, {} new, {} pages",
            summary.fetched, summary.inserted, summary.pages
        ),
        format!(
            "- Scoring: {} scored, {} failed, {} skipped, {} model calls",
            summary.scored, summary.failed, summary.skipped, summary.model_calls
        ),
    ];
    if let Some(err) = &summary.ingest_error {
        lines.push(format!("- Ingestion error: {err}"));
    }
    if let Some(stopped) = &summary.stopped {
        lines.push(format!("- Scoring stopped early: {stopped:?}"));
    }
    lines.push(format!(
        "- Backlog: {} pending, {} failed",
        summary.counts.pending + summary.counts.unscored,
        summary.counts.failed
    ));

    if !summary.last_errors.is_empty() {
        lines.push(String::new());
        lines.push("## Recent errors".to_string());
        lines.extend(summary.last_errors.iter().map(|e| format!("- {e}")));
    }
    if !rows.is_empty() {
        lines.push(String::new());
        lines.push("## Channels".to_string());
        lines.push(String::new());
        lines.push(channel_table_markdown(rows, 10));
    }
    lines.push(String::new());
    lines.join("\n")
}

async fn export_snapshots(
    reports_dir: &Path,
    items: &[ScoredItem],
    rows: &[ChannelSentiment],
) -> Result<PathBuf> {
    let snapshot_dir = reports_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let sentiment_path = snapshot_dir.join("sentiment.parquet");
    let channels_path = snapshot_dir.join("channels.parquet");
    write_sentiment_parquet(&sentiment_path, items)?;
    write_channels_parquet(&channels_path, rows)?;

    let manifest = SnapshotManifest {
        schema_version: 1,
        files: vec![
            manifest_entry("sentiment", reports_dir, &sentiment_path)?,
            manifest_entry("channels", reports_dir, &channels_path)?,
        ],
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing snapshot manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_sentiment_parquet(path: &Path, items: &[ScoredItem]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("item_id", DataType::Utf8, false),
        ArrowField::new("label", DataType::Utf8, false),
        ArrowField::new("confidence", DataType::Float64, false),
        ArrowField::new("fetched_at_ms", DataType::Int64, false),
        ArrowField::new("channel", DataType::Utf8, true),
    ]));

    let ids = StringArray::from(items.iter().map(|i| Some(i.item_id.as_str())).collect::<Vec<_>>());
    let labels = StringArray::from(
        items
            .iter()
            .map(|i| Some(i.sentiment.label.as_str()))
            .collect::<Vec<_>>(),
    );
    let confidences =
        Float64Array::from(items.iter().map(|i| i.sentiment.confidence).collect::<Vec<_>>());
    let fetched_at = Int64Array::from(
        items
            .iter()
            .map(|i| i.fetched_at.timestamp_millis())
            .collect::<Vec<_>>(),
    );
    let channels = StringArray::from(items.iter().map(|i| i.channel.as_deref()).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(ids),
            Arc::new(labels),
            Arc::new(confidences),
            Arc::new(fetched_at),
            Arc::new(channels),
        ],
    )
    .context("building sentiment record batch")?;
    write_parquet(path, batch)
}

fn write_channels_parquet(path: &Path, rows: &[ChannelSentiment]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("channel", DataType::Utf8, false),
        ArrowField::new("positive", DataType::UInt64, false),
        ArrowField::new("negative", DataType::UInt64, false),
        ArrowField::new("neutral", DataType::UInt64, false),
        ArrowField::new("total", DataType::UInt64, false),
        ArrowField::new("net", DataType::Int64, false),
    ]));

    let channels = StringArray::from(rows.iter().map(|r| Some(r.channel.as_str())).collect::<Vec<_>>());
    let count = |f: fn(&ChannelSentiment) -> u64| UInt64Array::from(rows.iter().map(f).collect::<Vec<_>>());
    let net = Int64Array::from(rows.iter().map(|r| r.net).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(channels),
            Arc::new(count(|r| r.positive)),
            Arc::new(count(|r| r.negative)),
            Arc::new(count(|r| r.neutral)),
            Arc::new(count(|r| r.total)),
            Arc::new(net),
        ],
    )
    .context("building channels record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, reports_dir: &Path, path: &Path) -> Result<SnapshotManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path
        .strip_prefix(reports_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(SnapshotManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}
