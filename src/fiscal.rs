//! Fiscal calendar: mapping calendar dates to reporting quarters.
//!
//! The fiscal year is April-anchored (FY 2026 runs Apr 2025 – Mar 2026).
//! Earnings calls happen *after* a quarter ends and discuss that quarter's
//! results, so a call held in November 2025 covers Q2 FY26 (Jul–Sep 2025).
//! The polling target at any moment is the most recently ended quarter.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};

/// A fiscal quarter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Quarter {
    Q1,
    Q2,
    Q3,
    Q4,
}

impl Quarter {
    /// The quarter preceding this one. `Q1.prev()` wraps to `Q4` (of the
    /// previous fiscal year; callers adjust the year).
    pub fn prev(self) -> Quarter {
        match self {
            Quarter::Q1 => Quarter::Q4,
            Quarter::Q2 => Quarter::Q1,
            Quarter::Q3 => Quarter::Q2,
            Quarter::Q4 => Quarter::Q3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Quarter::Q1 => "Q1",
            Quarter::Q2 => "Q2",
            Quarter::Q3 => "Q3",
            Quarter::Q4 => "Q4",
        }
    }
}

impl fmt::Display for Quarter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Quarter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Q1" => Ok(Quarter::Q1),
            "Q2" => Ok(Quarter::Q2),
            "Q3" => Ok(Quarter::Q3),
            "Q4" => Ok(Quarter::Q4),
            other => Err(format!("not a quarter: '{}'", other)),
        }
    }
}

/// A `(quarter, fiscal year)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QuarterYear {
    pub quarter: Quarter,
    pub year: i32,
}

impl QuarterYear {
    pub fn new(quarter: Quarter, year: i32) -> Self {
        Self { quarter, year }
    }

    /// The quarter before this one, crossing the fiscal-year boundary when
    /// needed.
    pub fn prev(self) -> QuarterYear {
        let quarter = self.quarter.prev();
        let year = if self.quarter == Quarter::Q1 {
            self.year - 1
        } else {
            self.year
        };
        QuarterYear { quarter, year }
    }
}

impl fmt::Display for QuarterYear {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} FY{}", self.quarter, self.year)
    }
}

/// The fiscal quarter a calendar date falls inside.
///
/// April–June is Q1 of the *next* calendar year's fiscal label
/// (Apr 2025 → Q1 FY26); January–March is Q4 of the current one.
pub fn quarter_containing(date: DateTime<Utc>) -> QuarterYear {
    let (month, year) = (date.month(), date.year());
    match month {
        4..=6 => QuarterYear::new(Quarter::Q1, year + 1),
        7..=9 => QuarterYear::new(Quarter::Q2, year + 1),
        10..=12 => QuarterYear::new(Quarter::Q3, year + 1),
        _ => QuarterYear::new(Quarter::Q4, year),
    }
}

/// The reporting quarter an earnings call held on `event_date` covers:
/// always the quarter that ended just before the call.
pub fn quarter_covered_by_event(event_date: DateTime<Utc>) -> QuarterYear {
    quarter_containing(event_date).prev()
}

/// The target `(quarter, year)` for polling at time `now` — the most
/// recently ended quarter, whose transcripts are being released.
pub fn target_quarter(now: DateTime<Utc>) -> QuarterYear {
    quarter_containing(now).prev()
}
