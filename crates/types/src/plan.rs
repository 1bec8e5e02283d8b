use crate::amount::Amount;
use chrono::DateTime;
use serde::{Deserialize, Serialize};

/// Payment cycle lengths (hours) the payment scheduler understands.
pub const ALLOWED_PAYPERIODS: [u32; 9] = [0, 1, 2, 3, 4, 6, 8, 12, 24];
pub const DEFAULT_PAYPERIOD: u32 = 24;
pub const DEFAULT_PAYOFFSET: u32 = 0;
pub const DEFAULT_GUARDTIME: u32 = 10;

/// A reward recipient with its share of the net reward in percent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payee {
    pub address: String,
    pub share: f64,
}

/// Plan activation time as declared by the operator: unix seconds or an
/// RFC 3339 date string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PlanTimestamp {
    Unix(i64),
    Text(String),
}

impl PlanTimestamp {
    /// Unix seconds, or `None` for an unparseable string.
    pub fn unix(&self) -> Option<i64> {
        match self {
            PlanTimestamp::Unix(secs) => Some(*secs),
            PlanTimestamp::Text(text) => {
                let text = text.trim();
                if let Ok(secs) = text.parse::<i64>() {
                    return Some(secs);
                }
                DateTime::parse_from_rfc3339(text)
                    .ok()
                    .map(|dt| dt.timestamp())
            }
        }
    }
}

impl From<i64> for PlanTimestamp {
    fn from(secs: i64) -> Self {
        PlanTimestamp::Unix(secs)
    }
}

/// A plan as declared: every field optional, later declarations override
/// earlier ones field by field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanDecl {
    pub height: Option<u64>,
    pub timestamp: Option<PlanTimestamp>,
    pub share: Option<f64>,
    pub reserves: Option<Vec<Payee>>,
    pub donations: Option<Vec<Payee>>,
    pub mincap: Option<u64>,
    pub maxcap: Option<u64>,
    pub blacklist: Option<Vec<String>>,
    pub payperiod: Option<u32>,
    pub payoffset: Option<u32>,
    pub guardtime: Option<u32>,
}

/// The effective reward sharing configuration at some point of the chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub height: u64,
    /// Unix seconds.
    pub timestamp: i64,
    pub share: f64,
    pub reserves: Vec<Payee>,
    pub donations: Vec<Payee>,
    pub mincap: Amount,
    /// `None` when votes are not capped.
    pub maxcap: Option<Amount>,
    pub blacklist: Vec<String>,
    pub payperiod: u32,
    pub payoffset: u32,
    pub guardtime: u32,
}

impl Default for Plan {
    fn default() -> Self {
        Self {
            height: 0,
            timestamp: 0,
            share: 0.0,
            reserves: vec![Payee {
                address: String::new(),
                share: 0.0,
            }],
            donations: Vec::new(),
            mincap: Amount::ZERO,
            maxcap: None,
            blacklist: Vec::new(),
            payperiod: DEFAULT_PAYPERIOD,
            payoffset: DEFAULT_PAYOFFSET,
            guardtime: DEFAULT_GUARDTIME,
        }
    }
}

impl Plan {
    /// Shallow merge: every field present in `decl` replaces ours.
    pub fn merge(&mut self, decl: &PlanDecl) {
        if let Some(height) = decl.height {
            self.height = height;
        }
        if let Some(ts) = decl.timestamp.as_ref().and_then(PlanTimestamp::unix) {
            self.timestamp = ts;
        }
        if let Some(share) = decl.share {
            self.share = share;
        }
        if let Some(reserves) = &decl.reserves {
            self.reserves = reserves.clone();
        }
        if let Some(donations) = &decl.donations {
            self.donations = donations.clone();
        }
        if let Some(mincap) = decl.mincap {
            self.mincap = Amount::from(mincap);
        }
        if let Some(maxcap) = decl.maxcap {
            self.maxcap = (maxcap > 0).then(|| Amount::from(maxcap));
        }
        if let Some(blacklist) = &decl.blacklist {
            self.blacklist = blacklist.clone();
        }
        if let Some(payperiod) = decl.payperiod {
            self.payperiod = payperiod;
        }
        if let Some(payoffset) = decl.payoffset {
            self.payoffset = payoffset;
        }
        if let Some(guardtime) = decl.guardtime {
            self.guardtime = guardtime;
        }
    }

    pub fn first_reserve(&self) -> Option<&Payee> {
        self.reserves.first()
    }

    pub fn is_blacklisted(&self, address: &str) -> bool {
        self.blacklist.iter().any(|a| a == address)
    }

    /// True when this plan hands out any part of the reward.
    pub fn allocates(&self) -> bool {
        self.share > 0.0 || self.first_reserve().map_or(false, |r| r.share > 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_accepts_unix_and_rfc3339() {
        assert_eq!(PlanTimestamp::Unix(42).unix(), Some(42));
        assert_eq!(
            PlanTimestamp::Text("2022-03-28T18:00:00.000Z".into()).unix(),
            Some(1_648_490_400)
        );
        assert_eq!(
            PlanTimestamp::Text("2022-03-28T20:00:00+02:00".into()).unix(),
            Some(1_648_490_400)
        );
        assert_eq!(PlanTimestamp::Text("1700000000".into()).unix(), Some(1_700_000_000));
        assert_eq!(PlanTimestamp::Text("yesterday".into()).unix(), None);
    }

    #[test]
    fn merge_overrides_only_declared_fields() {
        let mut plan = Plan::default();
        plan.merge(&PlanDecl {
            share: Some(50.0),
            reserves: Some(vec![Payee {
                address: "SR1".into(),
                share: 50.0,
            }]),
            maxcap: Some(1_000),
            ..Default::default()
        });
        plan.merge(&PlanDecl {
            height: Some(100),
            mincap: Some(10),
            maxcap: Some(0),
            ..Default::default()
        });
        assert_eq!(plan.height, 100);
        assert_eq!(plan.share, 50.0);
        assert_eq!(plan.first_reserve().map(|r| r.address.as_str()), Some("SR1"));
        assert_eq!(plan.mincap, Amount(10));
        assert_eq!(plan.maxcap, None);
        assert!(plan.allocates());
        assert!(!Plan::default().allocates());
    }

    #[test]
    fn decl_deserializes_partial_toml_like_json() {
        let decl: PlanDecl =
            serde_json::from_str(r#"{"height": 5, "timestamp": "2023-01-01T00:00:00Z"}"#).unwrap();
        assert_eq!(decl.height, Some(5));
        assert!(matches!(decl.timestamp, Some(PlanTimestamp::Text(_))));
        assert!(decl.share.is_none());
    }
}
