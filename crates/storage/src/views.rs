//! Derived read views over ledger rows.
//!
//! These are pure functions over already loaded rows so both backends share
//! one implementation of every report.

use crate::UnpaidAllocation;
use chrono::DateTime;
use forgeshare_types::{
    AddressScan, Allocation, Amount, ForgedBlock, ForgingStats, LastPaidSummary, LedgerEntry,
    MissedBlock, NetworkParams, PayeeType, PendingSummary, VoterCommitment,
};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

pub fn format_unix(secs: i64) -> String {
    DateTime::from_timestamp(secs, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| secs.to_string())
}

fn fmt_amount(amount: Amount, net: &NetworkParams) -> String {
    amount.format_units(net.atomic_decimals)
}

fn block_index(blocks: &[ForgedBlock]) -> HashMap<u64, &ForgedBlock> {
    blocks.iter().map(|b| (b.height, b)).collect()
}

fn in_window(block: &ForgedBlock, start: i64, end: i64, net: &NetworkParams) -> bool {
    let t = net.unix_time(block.timestamp);
    t >= start && t < end
}

/// Each voter's row at its highest height, ascending by height.
pub fn latest_per_address(allocations: Vec<Allocation>) -> Vec<Allocation> {
    let mut latest: HashMap<String, Allocation> = HashMap::new();
    for row in allocations
        .into_iter()
        .filter(|a| a.payee_type == PayeeType::Voter)
    {
        match latest.get(&row.address) {
            Some(existing) if existing.height >= row.height => {}
            _ => {
                latest.insert(row.address.clone(), row);
            }
        }
    }
    let mut rows: Vec<Allocation> = latest.into_values().collect();
    rows.sort_by(|a, b| a.height.cmp(&b.height).then_with(|| a.address.cmp(&b.address)));
    rows
}

pub fn unpaid(
    blocks: &[ForgedBlock],
    allocations: Vec<Allocation>,
    cutoff_unix: i64,
    net: &NetworkParams,
) -> Vec<UnpaidAllocation> {
    let index = block_index(blocks);
    allocations
        .into_iter()
        .filter(|a| !a.is_paid() && !a.allotment.is_zero())
        .filter_map(|a| {
            let forged_unix = net.unix_time(index.get(&a.height)?.timestamp);
            (forged_unix < cutoff_unix).then_some(UnpaidAllocation {
                allocation: a,
                forged_unix,
            })
        })
        .collect()
}

/// Left join of allocation rows onto their blocks.
pub fn ledger_entries(
    blocks: &[ForgedBlock],
    allocations: &[Allocation],
    net: &NetworkParams,
) -> Vec<LedgerEntry> {
    let index = block_index(blocks);
    allocations
        .iter()
        .map(|a| {
            let block = index.get(&a.height);
            let amount = |f: fn(&ForgedBlock) -> Amount| {
                fmt_amount(block.map(|b| f(b)).unwrap_or_default(), net)
            };
            LedgerEntry {
                round: block.map(|b| b.round).unwrap_or_default(),
                height: a.height,
                forged_time: block
                    .map(|b| format_unix(net.unix_time(b.timestamp)))
                    .unwrap_or_default(),
                reward: amount(|b| b.reward),
                earned_rewards: amount(ForgedBlock::earned_rewards),
                earned_fees: amount(ForgedBlock::earned_fees),
                net_reward: amount(ForgedBlock::net_reward),
                valid_votes: amount(|b| b.valid_votes),
                address: a.address.clone(),
                payee_type: a.payee_type,
                balance: fmt_amount(a.balance, net),
                vote_percent: a.vote_percent,
                vote: fmt_amount(a.vote(), net),
                valid_vote: fmt_amount(a.valid_vote, net),
                share_ratio: a.share_ratio,
                allotment: fmt_amount(a.allotment, net),
                booked_time: format_unix(a.booked),
                transaction_id: a.transaction_id.clone(),
                settled_time: (a.settled != 0).then(|| format_unix(a.settled)),
                org_balance: fmt_amount(a.org_balance, net),
                org_vote_percent: a.org_vote_percent,
            }
        })
        .collect()
}

/// The most recently settled payment in the highest round with any
/// settled row.
pub fn last_paid(blocks: &[ForgedBlock], allocations: &[Allocation]) -> Option<LastPaidSummary> {
    let index = block_index(blocks);
    let settled: Vec<(u64, &Allocation)> = allocations
        .iter()
        .filter(|a| a.settled != 0)
        .map(|a| (index.get(&a.height).map(|b| b.round).unwrap_or_default(), a))
        .collect();
    let round = settled.iter().map(|(r, _)| *r).max()?;
    settled
        .into_iter()
        .filter(|(r, _)| *r == round)
        .max_by_key(|(_, a)| (a.settled, a.height))
        .map(|(round, a)| LastPaidSummary {
            round,
            height: a.height,
            transaction_id: a.transaction_id.clone(),
            settled: a.settled,
        })
}

pub fn pending(blocks: &[ForgedBlock], allocations: &[Allocation]) -> Option<PendingSummary> {
    let selected: Vec<&ForgedBlock> = match last_paid(blocks, allocations) {
        Some(paid) => blocks.iter().filter(|b| b.height > paid.height).collect(),
        None => {
            let from = allocations
                .iter()
                .filter(|a| !a.allotment.is_zero())
                .map(|a| a.height)
                .min()?;
            blocks.iter().filter(|b| b.height >= from).collect()
        }
    };

    let mut summary = PendingSummary::default();
    let rounds: BTreeSet<u64> = selected.iter().map(|b| b.round).collect();
    summary.rounds = rounds.len() as u64;
    summary.min_round = rounds.first().copied().unwrap_or_default();
    summary.max_round = rounds.last().copied().unwrap_or_default();
    summary.blocks = selected.len() as u64;
    summary.min_height = selected.iter().map(|b| b.height).min().unwrap_or_default();
    summary.max_height = selected.iter().map(|b| b.height).max().unwrap_or_default();
    for b in selected {
        summary.block_rewards += b.reward;
        summary.block_funds += b.fund_deduction;
        summary.block_fees += b.fees;
        summary.burned_fees += b.burned_fees;
        summary.earned_rewards += b.earned_rewards();
        summary.earned_fees += b.earned_fees();
    }
    Some(summary)
}

pub fn forging_stats(
    blocks: &[ForgedBlock],
    start: i64,
    end: i64,
    net: &NetworkParams,
) -> ForgingStats {
    let selected: Vec<&ForgedBlock> = blocks
        .iter()
        .filter(|b| in_window(b, start, end, net))
        .collect();
    let mut stats = ForgingStats::default();
    if selected.is_empty() {
        return stats;
    }
    let rounds: BTreeSet<u64> = selected.iter().map(|b| b.round).collect();
    stats.first_round = rounds.first().copied().unwrap_or_default();
    stats.last_round = rounds.last().copied().unwrap_or_default();
    stats.round_count = rounds.len() as u64;
    stats.first_forged = selected.iter().map(|b| b.height).min().unwrap_or_default();
    stats.last_forged = selected.iter().map(|b| b.height).max().unwrap_or_default();
    stats.forged_count = selected.len() as u64;

    let count = selected.len() as u128;
    let mut votes = Amount::ZERO;
    let mut voters: u64 = 0;
    for b in &selected {
        stats.block_rewards += b.reward;
        stats.block_funds += b.fund_deduction;
        stats.block_fees += b.fees;
        stats.burned_fees += b.burned_fees;
        stats.earned_rewards += b.earned_rewards();
        stats.earned_fees += b.earned_fees();
        votes = votes.saturating_add(b.valid_votes);
        voters += u64::from(b.voter_count);
    }
    stats.avg_votes = Amount((votes.0 + count / 2) / count);
    stats.avg_voter_count = voters as f64 / count as f64;
    stats
}

/// Per address: blocks credited in the window, and how many of those were
/// followed by an allocation with an equal or higher valid vote.
pub fn voter_commitment(
    blocks: &[ForgedBlock],
    allocations: &[Allocation],
    start: i64,
    end: i64,
    net: &NetworkParams,
) -> Vec<VoterCommitment> {
    let index = block_index(blocks);
    let mut by_address: BTreeMap<&str, Vec<&Allocation>> = BTreeMap::new();
    for a in allocations
        .iter()
        .filter(|a| a.payee_type == PayeeType::Voter && a.vote_percent > 0.0)
    {
        by_address.entry(a.address.as_str()).or_default().push(a);
    }

    let mut out = Vec::new();
    for (address, mut rows) in by_address {
        rows.sort_by_key(|a| a.height);
        let mut block_count = 0;
        let mut not_reduced = 0;
        for (i, row) in rows.iter().enumerate() {
            let Some(block) = index.get(&row.height) else {
                continue;
            };
            if !in_window(block, start, end, net) {
                continue;
            }
            block_count += 1;
            let next = rows.get(i + 1).map(|n| n.valid_vote).unwrap_or_default();
            if row.valid_vote <= next {
                not_reduced += 1;
            }
        }
        if block_count > 0 {
            out.push(VoterCommitment {
                address: address.to_string(),
                block_count,
                blocks_vote_not_reduced: not_reduced,
            });
        }
    }
    out
}

pub fn scan_addresses(
    blocks: &[ForgedBlock],
    allocations: &[Allocation],
    addresses: &[String],
    start: i64,
    end: i64,
    net: &NetworkParams,
) -> Vec<AddressScan> {
    let index = block_index(blocks);
    let wanted: HashSet<&str> = addresses.iter().map(String::as_str).collect();
    let mut scans: BTreeMap<&str, AddressScan> = BTreeMap::new();
    for a in allocations.iter().filter(|a| wanted.contains(a.address.as_str())) {
        let Some(block) = index.get(&a.height) else {
            continue;
        };
        if !in_window(block, start, end, net) {
            continue;
        }
        let scan = scans.entry(a.address.as_str()).or_insert_with(|| AddressScan {
            address: a.address.clone(),
            block_count: 0,
            corrected_blocks: 0,
            org_allotted: Amount::ZERO,
            allotted: Amount::ZERO,
        });
        scan.block_count += 1;
        if a.is_corrected() {
            scan.corrected_blocks += 1;
        }
        scan.org_allotted += a.org_allotment;
        scan.allotted += a.allotment;
    }
    scans.into_values().collect()
}

pub fn missed_rounds(
    blocks: &[ForgedBlock],
    missed: Vec<MissedBlock>,
    delegate: &str,
    below_height: u64,
) -> Vec<MissedBlock> {
    let forged_rounds: HashSet<u64> = blocks
        .iter()
        .filter(|b| b.delegate == delegate)
        .map(|b| b.round)
        .collect();
    missed
        .into_iter()
        .filter(|m| {
            m.delegate == delegate && m.height < below_height && !forged_rounds.contains(&m.round)
        })
        .collect()
}
