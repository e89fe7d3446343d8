//! Computed parameter defaults.
//!
//! A default is a tiny expression rather than arbitrary code: an anchor
//! (`today`, `now`, `first_of_month`, `first_of_year`, or a quoted literal)
//! optionally followed by one signed offset in days or weeks, e.g.
//! `today - 7d` or `first_of_month + 1w`. There are no loops or calls, so
//! evaluation is constant-time.

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime};

use crate::domain::ValidationError;

const DATE_FMT: &str = "%Y-%m-%d";
const DATETIME_FMT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Anchor {
    Today,
    Now,
    FirstOfMonth,
    FirstOfYear,
    Literal(String),
}

/// A parsed default expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultExpr {
    anchor: Anchor,
    offset_days: i64,
}

impl DefaultExpr {
    /// Evaluate against the local wall-clock time `now`.
    pub fn evaluate(&self, now: NaiveDateTime) -> String {
        let shift = Duration::days(self.offset_days);
        let date = |d: NaiveDate| (d + shift).format(DATE_FMT).to_string();

        match &self.anchor {
            Anchor::Today => date(now.date()),
            Anchor::Now => (now + shift).format(DATETIME_FMT).to_string(),
            Anchor::FirstOfMonth => date(now.date().with_day(1).unwrap_or(now.date())),
            Anchor::FirstOfYear => date(
                NaiveDate::from_ymd_opt(now.year(), 1, 1).unwrap_or(now.date()),
            ),
            Anchor::Literal(s) => s.clone(),
        }
    }
}

impl FromStr for DefaultExpr {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ValidationError::DefaultExpr {
            expr: s.to_string(),
            reason: reason.to_string(),
        };

        let text = s.trim();
        if let Some(rest) = text.strip_prefix('"') {
            let literal = rest
                .strip_suffix('"')
                .filter(|l| !l.contains('"'))
                .ok_or_else(|| invalid("unterminated string literal"))?;
            return Ok(Self {
                anchor: Anchor::Literal(literal.to_string()),
                offset_days: 0,
            });
        }

        let split = text.find(|c: char| c == '+' || c == '-').unwrap_or(text.len());
        let (head, tail) = text.split_at(split);
        let anchor = match head.trim() {
            "today" => Anchor::Today,
            "now" => Anchor::Now,
            "first_of_month" => Anchor::FirstOfMonth,
            "first_of_year" => Anchor::FirstOfYear,
            "" => return Err(invalid("missing anchor")),
            _ => return Err(invalid("unknown anchor")),
        };

        let offset_days = if tail.is_empty() {
            0
        } else {
            parse_offset(tail).ok_or_else(|| invalid("offset must look like +3d or -2w"))?
        };

        Ok(Self {
            anchor,
            offset_days,
        })
    }
}

fn parse_offset(tail: &str) -> Option<i64> {
    let sign = match tail.chars().next()? {
        '+' => 1,
        '-' => -1,
        _ => return None,
    };
    let body = tail[1..].trim();
    let (last, _) = body.char_indices().last()?;
    let (digits, unit) = body.split_at(last);
    let n = i64::from(digits.trim().parse::<u32>().ok()?);
    let per_unit = match unit {
        "d" => 1,
        "w" => 7,
        _ => return None,
    };
    // Keep offsets well inside chrono's date range.
    (n <= 36_500).then_some(sign * n * per_unit)
}

impl fmt::Display for DefaultExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.anchor {
            Anchor::Literal(s) => return write!(f, "\"{}\"", s),
            Anchor::Today => f.write_str("today")?,
            Anchor::Now => f.write_str("now")?,
            Anchor::FirstOfMonth => f.write_str("first_of_month")?,
            Anchor::FirstOfYear => f.write_str("first_of_year")?,
        }
        match self.offset_days {
            0 => Ok(()),
            d if d > 0 => write!(f, " + {}d", d),
            d => write!(f, " - {}d", -d),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
    }

    fn eval(expr: &str) -> String {
        expr.parse::<DefaultExpr>()
            .unwrap()
            .evaluate(at(2024, 3, 15, 6, 30))
    }

    #[test]
    fn test_anchors() {
        assert_eq!(eval("today"), "2024-03-15");
        assert_eq!(eval("now"), "2024-03-15 06:30:00");
        assert_eq!(eval("first_of_month"), "2024-03-01");
        assert_eq!(eval("first_of_year"), "2024-01-01");
        assert_eq!(eval("\"EMEA\""), "EMEA");
    }

    #[test]
    fn test_offsets() {
        assert_eq!(eval("today - 7d"), "2024-03-08");
        assert_eq!(eval("today+1w"), "2024-03-22");
        assert_eq!(eval("first_of_month - 1d"), "2024-02-29");
        assert_eq!(eval("  now + 1d "), "2024-03-16 06:30:00");
    }

    #[test]
    fn test_rejects_code() {
        for bad in [
            "",
            "import os",
            "today * 2",
            "today - 7",
            "today - xd",
            "yesterday",
            "\"open",
            "today - 999999d",
        ] {
            assert!(bad.parse::<DefaultExpr>().is_err(), "{:?} should be rejected", bad);
        }
    }

    #[test]
    fn test_display_round_trips() {
        for src in ["today", "now + 3d", "first_of_year - 14d", "\"x\""] {
            let expr: DefaultExpr = src.parse().unwrap();
            assert_eq!(expr.to_string().parse::<DefaultExpr>().unwrap(), expr);
        }
    }
}
