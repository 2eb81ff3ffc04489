// Copyright (c) Barry contributors
// SPDX-License-Identifier: Apache-2.0

//! Retention ("expiration") policies.
//!
//! A policy is an ordered list of lines of the form `keep N UNIT` or
//! `keep N UNIT every M (files|days)`. Exactly one line must be a *default* line (no `every`
//! clause). When a file is registered, the policy selects the line with the largest `keep`
//! duration among the lines whose `every` condition matches that file; the default line always
//! matches, so evaluation can never come up empty.
//!
//! Policies are parsed once into data; evaluation is a pure function of
//! `(policy, mod_time, file_count)` and therefore reproducible.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};

const SECS_PER_MINUTE: u64 = 60;
const SECS_PER_HOUR: u64 = 60 * 60;
const SECS_PER_DAY: u64 = 24 * SECS_PER_HOUR;
const SECS_PER_YEAR: u64 = 365 * SECS_PER_DAY;

/// Error returned when parsing an expiration policy.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ExpirationError {
    /// The line does not have the `keep N UNIT [every M UNIT]` shape.
    #[error("syntax error on expiration line '{0}': invalid length")]
    InvalidLength(String),
    /// The line does not start with the `keep` keyword.
    #[error("syntax error on expiration line '{0}': missing 'keep' keyword")]
    MissingKeep(String),
    /// The `keep` count is not a positive integer.
    #[error("syntax error on expiration line '{0}': invalid count")]
    InvalidCount(String),
    /// The `keep` unit is not one of minute(s), hour(s), day(s), year(s).
    #[error("syntax error on expiration line '{0}': invalid 'keep' unit '{1}'")]
    InvalidKeepUnit(String, String),
    /// The fourth word is not the `every` keyword.
    #[error("syntax error on expiration line '{0}': missing 'every' keyword")]
    MissingEvery(String),
    /// The `every` unit is not one of file(s), day(s).
    #[error("syntax error on expiration line '{0}': invalid 'every' unit '{1}'")]
    InvalidEveryUnit(String, String),
    /// A policy must have exactly one line without an `every` clause.
    #[error("expiration policy must have exactly one default line (found {0})")]
    DefaultLineCount(usize),
}

/// Cadence unit of the `every` clause of an [`ExpirationLine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EveryUnit {
    /// No `every` clause; the line matches every file.
    Default,
    /// Matches every Mth registered file.
    File,
    /// Matches files whose `mod_time` falls on every Mth day since the policy reference date.
    Day,
}

/// A single parsed retention rule.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpirationLine {
    /// The original expression string, kept for display.
    pub original: String,
    /// How long matching files are retained.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub keep: Duration,
    /// Cadence of the `every` clause (meaningless for [`EveryUnit::Default`]).
    pub every: u32,
    /// Unit of the `every` clause.
    pub every_unit: EveryUnit,
}

/// An ordered retention policy; each project carries two (local and remote).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Expiration {
    /// The parsed lines, in configuration order.
    pub lines: Vec<ExpirationLine>,
    /// Reference date for day-cadenced lines.
    pub reference_date: DateTime<Utc>,
    /// Number of files registered against this policy so far.
    pub file_count: u64,
    /// True for per-project overrides, false for the policy cloned from global configuration.
    pub custom: bool,
}

impl Expiration {
    /// Parses an array of `keep ...` expression strings into a policy.
    ///
    /// The reference date for day-cadenced lines is set to the time of parsing.
    pub fn parse(lines: &[String]) -> Result<Self, ExpirationError> {
        Self::parse_at(lines, Utc::now())
    }

    /// Same as [`Expiration::parse`] with an explicit reference date.
    pub fn parse_at(
        lines: &[String],
        reference_date: DateTime<Utc>,
    ) -> Result<Self, ExpirationError> {
        let lines = lines
            .iter()
            .map(|line| ExpirationLine::parse(line))
            .collect::<Result<Vec<_>, _>>()?;

        let defaults = lines
            .iter()
            .filter(|line| line.every_unit == EveryUnit::Default)
            .count();
        if defaults != 1 {
            return Err(ExpirationError::DefaultLineCount(defaults));
        }

        Ok(Self {
            lines,
            reference_date,
            file_count: 0,
            custom: false,
        })
    }

    /// Registers one file and returns the retention line applying to it.
    ///
    /// The policy file counter is incremented first, so a `keep ... every M files` line matches
    /// the Mth, 2Mth, ... registered files. Among matching lines, the one with the largest
    /// `keep` wins; ties resolve to the earliest configured line.
    pub fn next(&mut self, mod_time: DateTime<Utc>) -> ExpirationLine {
        self.file_count += 1;
        self.evaluate(mod_time)
    }

    /// Pure evaluation against the current counter; see [`Expiration::next`].
    pub fn evaluate(&self, mod_time: DateTime<Utc>) -> ExpirationLine {
        let mut best: Option<&ExpirationLine> = None;
        for line in &self.lines {
            if !self.line_matches(line, mod_time) {
                continue;
            }
            match best {
                Some(current) if current.keep >= line.keep => {}
                _ => best = Some(line),
            }
        }
        best.expect("a policy always contains a matching default line")
            .clone()
    }

    fn line_matches(&self, line: &ExpirationLine, mod_time: DateTime<Utc>) -> bool {
        match line.every_unit {
            EveryUnit::Default => true,
            EveryUnit::File => self.file_count % u64::from(line.every) == 0,
            EveryUnit::Day => {
                let days = (mod_time - self.reference_date)
                    .num_seconds()
                    .div_euclid(SECS_PER_DAY as i64);
                days.rem_euclid(i64::from(line.every)) == 0
            }
        }
    }
}

impl ExpirationLine {
    /// Parses a single `keep N UNIT [every M UNIT]` expression.
    pub fn parse(line: &str) -> Result<Self, ExpirationError> {
        let original = line.to_string();
        let words: Vec<&str> = line.split_whitespace().collect();

        if words.len() != 3 && words.len() != 6 {
            return Err(ExpirationError::InvalidLength(original));
        }
        if words[0] != "keep" {
            return Err(ExpirationError::MissingKeep(original));
        }

        let keep_count: u64 = words[1]
            .parse()
            .map_err(|_| ExpirationError::InvalidCount(original.clone()))?;
        let keep_unit_secs = match words[2] {
            "minute" | "minutes" => SECS_PER_MINUTE,
            "hour" | "hours" => SECS_PER_HOUR,
            "day" | "days" => SECS_PER_DAY,
            "year" | "years" => SECS_PER_YEAR,
            unit => {
                return Err(ExpirationError::InvalidKeepUnit(original, unit.to_string()));
            }
        };

        let mut parsed = Self {
            original: original.clone(),
            keep: Duration::from_secs(keep_count * keep_unit_secs),
            every: 0,
            every_unit: EveryUnit::Default,
        };

        if words.len() == 6 {
            if words[3] != "every" {
                return Err(ExpirationError::MissingEvery(original));
            }
            let every: u32 = words[4]
                .parse()
                .map_err(|_| ExpirationError::InvalidCount(original.clone()))?;
            if every == 0 {
                return Err(ExpirationError::InvalidCount(original));
            }
            parsed.every = every;
            parsed.every_unit = match words[5] {
                "file" | "files" => EveryUnit::File,
                "day" | "days" => EveryUnit::Day,
                unit => {
                    return Err(ExpirationError::InvalidEveryUnit(
                        original,
                        unit.to_string(),
                    ));
                }
            };
        }

        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use barry_test_utils::param_test;
    use chrono::TimeDelta;

    use super::*;

    fn strings(lines: &[&str]) -> Vec<String> {
        lines.iter().map(|line| line.to_string()).collect()
    }

    param_test! {
        parses_keep_duration: [
            minutes: ("keep 30 minutes", 30 * 60),
            one_hour: ("keep 1 hour", 3600),
            days: ("keep 30 days", 30 * 86_400),
            years: ("keep 2 years", 2 * 365 * 86_400),
        ]
    }
    fn parses_keep_duration(line: &str, expected_secs: u64) {
        let parsed = ExpirationLine::parse(line).expect("line should parse");
        assert_eq!(parsed.keep, Duration::from_secs(expected_secs));
        assert_eq!(parsed.every_unit, EveryUnit::Default);
        assert_eq!(parsed.original, line);
    }

    param_test! {
        rejects_invalid_lines: [
            empty: (""),
            missing_keep: ("retain 3 days"),
            bad_count: ("keep three days"),
            bad_unit: ("keep 3 weeks"),
            missing_every: ("keep 3 days all 7 files"),
            bad_every_unit: ("keep 3 days every 7 months"),
            zero_every: ("keep 3 days every 0 files"),
            truncated: ("keep 3 days every 7"),
        ]
    }
    fn rejects_invalid_lines(line: &str) {
        ExpirationLine::parse(line).expect_err("line should be rejected");
    }

    #[test]
    fn policy_requires_exactly_one_default_line() {
        let no_default = strings(&["keep 30 days every 7 files"]);
        assert_eq!(
            Expiration::parse(&no_default),
            Err(ExpirationError::DefaultLineCount(0))
        );

        let two_defaults = strings(&["keep 30 days", "keep 60 days"]);
        assert_eq!(
            Expiration::parse(&two_defaults),
            Err(ExpirationError::DefaultLineCount(2))
        );
    }

    #[test]
    fn file_cadence_selects_max_keep_every_nth_file() {
        let mut policy =
            Expiration::parse(&strings(&["keep 30 days", "keep 90 days every 3 files"]))
                .expect("policy should parse");
        let now = Utc::now();

        let picks: Vec<u64> = (0..6)
            .map(|_| policy.next(now).keep.as_secs() / 86_400)
            .collect();
        assert_eq!(picks, [30, 30, 90, 30, 30, 90]);
        assert_eq!(policy.file_count, 6);
    }

    #[test]
    fn day_cadence_uses_reference_date() {
        let reference = Utc::now();
        let mut policy = Expiration::parse_at(
            &strings(&["keep 1 day", "keep 10 days every 2 days"]),
            reference,
        )
        .expect("policy should parse");

        // Day 0 and day 2 match the cadence, day 1 and day 3 do not.
        for (day, expected_days) in [(0, 10), (1, 1), (2, 10), (3, 1)] {
            let mod_time = reference + TimeDelta::days(day) + TimeDelta::seconds(60);
            assert_eq!(
                policy.next(mod_time).keep.as_secs() / 86_400,
                expected_days,
                "unexpected pick for day {day}"
            );
        }
    }

    #[test]
    fn evaluation_returns_max_keep_across_matching_lines() {
        let mut policy = Expiration::parse(&strings(&[
            "keep 7 days",
            "keep 90 days every 1 files",
            "keep 30 days every 1 files",
        ]))
        .expect("policy should parse");

        // All three lines match every file; the largest keep must win.
        assert_eq!(policy.next(Utc::now()).keep.as_secs() / 86_400, 90);
    }
}
