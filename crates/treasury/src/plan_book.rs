//! Reward sharing plans.
//!
//! Operators declare an ordered list of partial plans. [`PlanBook`] validates
//! and normalises that list once, then answers "which plan applies here" by
//! merging, left to right, every declaration already in effect. Nothing is
//! mutated after construction.

use crate::errors::PlanError;
use chrono::Utc;
use forgeshare_types::{
    NetworkParams, Payee, Plan, PlanDecl, PlanTimestamp, ALLOWED_PAYPERIODS, DEFAULT_GUARDTIME,
    DEFAULT_PAYOFFSET, DEFAULT_PAYPERIOD,
};
use std::collections::HashSet;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct PlanBook {
    /// Normalised declarations: height and unix timestamp always present.
    steps: Vec<PlanDecl>,
    net: NetworkParams,
}

fn check_payees(index: usize, payees: &[Payee]) -> Result<(), PlanError> {
    let mut seen = HashSet::new();
    for payee in payees {
        if !(0.0..=100.0).contains(&payee.share) {
            return Err(PlanError::ShareOutOfRange {
                index,
                share: payee.share,
            });
        }
        if !seen.insert(payee.address.as_str()) {
            return Err(PlanError::DuplicatePayee {
                index,
                address: payee.address.clone(),
            });
        }
    }
    Ok(())
}

fn coerce_cadence(index: usize, decl: &mut PlanDecl) {
    if let Some(period) = decl.payperiod {
        if !ALLOWED_PAYPERIODS.contains(&period) {
            warn!(index, period, "Unsupported payperiod, using {}", DEFAULT_PAYPERIOD);
            decl.payperiod = Some(DEFAULT_PAYPERIOD);
        }
    }
    if let Some(offset) = decl.payoffset {
        if offset >= 24 {
            warn!(index, offset, "Unsupported payoffset, using {}", DEFAULT_PAYOFFSET);
            decl.payoffset = Some(DEFAULT_PAYOFFSET);
        }
    }
    if let Some(guard) = decl.guardtime {
        if guard >= 60 {
            warn!(index, guard, "Unsupported guardtime, using {}", DEFAULT_GUARDTIME);
            decl.guardtime = Some(DEFAULT_GUARDTIME);
        }
    }
}

impl PlanBook {
    pub fn new(decls: Vec<PlanDecl>, net: NetworkParams) -> Result<Self, PlanError> {
        let first = decls.first().ok_or(PlanError::NoPlans)?;
        if first.share.is_none() {
            return Err(PlanError::BaseShareMissing);
        }
        let base_reserve = first
            .reserves
            .as_ref()
            .and_then(|r| r.first())
            .filter(|r| !r.address.is_empty())
            .ok_or(PlanError::BaseReserveMissing)?
            .address
            .clone();

        let mut steps: Vec<PlanDecl> = Vec::with_capacity(decls.len() + 1);
        let (mut prev_height, mut prev_ts) = (0u64, 0i64);
        for (index, mut decl) in decls.into_iter().enumerate() {
            if let Some(share) = decl.share {
                if !(0.0..=100.0).contains(&share) {
                    return Err(PlanError::ShareOutOfRange { index, share });
                }
            }
            check_payees(index, decl.reserves.as_deref().unwrap_or_default())?;
            check_payees(index, decl.donations.as_deref().unwrap_or_default())?;
            coerce_cadence(index, &mut decl);

            let height = decl.height.unwrap_or(prev_height);
            let ts = match &decl.timestamp {
                None => prev_ts,
                Some(declared) => declared.unix().ok_or_else(|| PlanError::InvalidTimestamp {
                    index,
                    value: format!("{declared:?}"),
                })?,
            };
            if index > 0 && (height < prev_height || ts < prev_ts) {
                return Err(PlanError::NotMonotonic { index });
            }
            decl.height = Some(height);
            decl.timestamp = Some(PlanTimestamp::Unix(ts));
            prev_height = height;
            prev_ts = ts;
            steps.push(decl);
        }

        if steps.first().and_then(|s| s.height) != Some(0) {
            debug!(reserve = %base_reserve, "Inserting placeholder plan at height 0");
            steps.insert(
                0,
                PlanDecl {
                    height: Some(0),
                    timestamp: Some(PlanTimestamp::Unix(0)),
                    share: Some(0.0),
                    reserves: Some(vec![Payee {
                        address: base_reserve,
                        share: 0.0,
                    }]),
                    donations: Some(Vec::new()),
                    blacklist: Some(Vec::new()),
                    mincap: Some(0),
                    ..Default::default()
                },
            );
        }

        Ok(Self { steps, net })
    }

    fn step_height(step: &PlanDecl) -> u64 {
        step.height.unwrap_or_default()
    }

    fn step_unix(step: &PlanDecl) -> i64 {
        step.timestamp
            .as_ref()
            .and_then(PlanTimestamp::unix)
            .unwrap_or_default()
    }

    fn merge_where(&self, keep: impl Fn(&PlanDecl) -> bool) -> Plan {
        let mut plan = Plan::default();
        for step in self.steps.iter().filter(|s| keep(s)) {
            plan.merge(step);
        }
        plan
    }

    /// Plan in effect for a block at `height` forged at chain `epochstamp`.
    pub fn resolve(&self, height: u64, epochstamp: u64) -> Plan {
        let unix = self.net.unix_time(epochstamp);
        self.merge_where(|s| Self::step_height(s) <= height && Self::step_unix(s) <= unix)
    }

    /// Plan in effect now.
    pub fn present(&self) -> Plan {
        self.present_at(Utc::now().timestamp())
    }

    /// Plan in effect at unix time `now`, regardless of height.
    pub fn present_at(&self, now: i64) -> Plan {
        self.merge_where(|s| Self::step_unix(s) <= now)
    }

    /// The first plan that hands out any reward. Heights below it need no
    /// allocation.
    pub fn first_allocating_plan(&self) -> Option<Plan> {
        let mut plan = Plan::default();
        for step in &self.steps {
            plan.merge(step);
            if plan.allocates() {
                return Some(plan);
            }
        }
        None
    }

    pub fn network(&self) -> &NetworkParams {
        &self.net
    }

    /// Normalised declarations, placeholder included.
    pub fn steps(&self) -> &[PlanDecl] {
        &self.steps
    }
}

/// Tracks the present plan so a change can be signalled once.
#[derive(Debug, Clone)]
pub struct PlanWatch {
    last_height: u64,
    last_timestamp: i64,
}

impl PlanWatch {
    pub fn new(book: &PlanBook) -> Self {
        Self::new_at(book, Utc::now().timestamp())
    }

    pub fn new_at(book: &PlanBook, now: i64) -> Self {
        let present = book.present_at(now);
        Self {
            last_height: present.height,
            last_timestamp: present.timestamp,
        }
    }

    pub fn has_present_plan_changed(&mut self, book: &PlanBook) -> bool {
        self.has_changed_at(book, Utc::now().timestamp())
    }

    pub fn has_changed_at(&mut self, book: &PlanBook, now: i64) -> bool {
        let present = book.present_at(now);
        if present.height > self.last_height || present.timestamp > self.last_timestamp {
            self.last_height = present.height;
            self.last_timestamp = present.timestamp;
            return true;
        }
        false
    }
}
