//! Reporting and administrative subcommands.
//!
//! Each command takes a ledger handle and returns a serializable view; the
//! caller prints it as JSON. Heavy summaries go through the read pool the
//! engine uses, so a report never runs on the caller's thread.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use forgeshare_storage::{LedgerReader, LedgerStore};
use forgeshare_sync::ReadPool;
use forgeshare_treasury::PlanBook;
use forgeshare_types::{AddressScan, LedgerEntry, NetworkParams, Plan};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use tracing::info;

/// Accepts unix seconds, RFC 3339, `YYYY-MM-DD HH:MM:SS` (UTC) or
/// `YYYY-MM-DD`.
pub fn parse_time(value: &str) -> Result<i64> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<i64>() {
        return Ok(secs);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.timestamp());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S") {
        return Ok(dt.and_utc().timestamp());
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().timestamp())
        .with_context(|| format!("Unrecognised time '{value}'"))
}

/// `[start, end)` in unix seconds; open ends default to the whole ledger.
pub fn parse_window(start: Option<&String>, end: Option<&String>) -> Result<(i64, i64)> {
    let start = start.map(|s| parse_time(s)).transpose()?.unwrap_or(0);
    let end = end.map(|s| parse_time(s)).transpose()?.unwrap_or(i64::MAX);
    if end <= start {
        anyhow::bail!("Empty time window: end {end} is not after start {start}");
    }
    Ok((start, end))
}

pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[derive(Debug, Serialize)]
pub struct PlanReport {
    pub present: Plan,
    pub first_allocating: Option<Plan>,
    pub resolved: Option<Plan>,
}

pub fn plan_report(book: &PlanBook, height: Option<u64>, at: Option<i64>) -> PlanReport {
    let now = at.unwrap_or_else(|| Utc::now().timestamp());
    PlanReport {
        present: book.present_at(now),
        first_allocating: book.first_allocating_plan(),
        resolved: height.map(|h| book.resolve(h, book.network().epochstamp(now))),
    }
}

pub fn ledger_report(
    reader: &dyn LedgerReader,
    height: Option<u64>,
    round: Option<u64>,
    net: &NetworkParams,
) -> Result<Vec<LedgerEntry>> {
    let entries = match round {
        Some(round) => reader.ledger_at_round(Some(round), net)?,
        None => reader.ledger_at_height(height, net)?,
    };
    Ok(entries)
}

/// Voter addresses with at least one anti-bot corrected row in the window.
pub fn corrected_addresses(
    reader: &dyn LedgerReader,
    start: i64,
    end: i64,
    net: &NetworkParams,
) -> Result<Vec<String>> {
    let forged_at: HashMap<u64, i64> = reader
        .forged_blocks()?
        .into_iter()
        .map(|b| (b.height, net.unix_time(b.timestamp)))
        .collect();
    let addresses: BTreeSet<String> = reader
        .allocations()?
        .into_iter()
        .filter(|a| a.is_corrected())
        .filter(|a| {
            forged_at
                .get(&a.height)
                .map_or(false, |t| (start..end).contains(t))
        })
        .map(|a| a.address)
        .collect();
    Ok(addresses.into_iter().collect())
}

pub fn antibot_report(
    reader: &dyn LedgerReader,
    start: i64,
    end: i64,
    net: &NetworkParams,
) -> Result<Vec<AddressScan>> {
    let addresses = corrected_addresses(reader, start, end, net)?;
    if addresses.is_empty() {
        return Ok(Vec::new());
    }
    Ok(reader.scan_addresses(&addresses, start, end, net)?)
}

/// Roll the ledger back to the first height of the round holding `height`.
/// Returns that height.
pub fn rollback(store: &dyn LedgerStore, height: u64, net: &NetworkParams) -> Result<u64> {
    let target = net.round_of(height).round_height;
    let before = store.height()?;
    store.rollback_to(target)?;
    store.flush()?;
    info!(
        target: "ledger",
        requested = height,
        rolled_back_to = target,
        previous_height = before,
        "Ledger rolled back"
    );
    Ok(target)
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub height: u64,
    pub unsettled_txids: Vec<String>,
    pub last_paid: Option<forgeshare_types::LastPaidSummary>,
    pub pending: Option<forgeshare_types::PendingSummary>,
    pub read_workers: usize,
}

pub async fn status_report(pool: &ReadPool) -> Result<StatusReport> {
    let (height, unsettled_txids, last_paid, pending) = tokio::try_join!(
        pool.height(),
        pool.unsettled_txids(),
        pool.last_paid_summary(),
        pool.pending_summary(),
    )?;
    Ok(StatusReport {
        height,
        unsettled_txids,
        last_paid,
        pending,
        read_workers: pool.workers(),
    })
}
