//! Interval-set algebra over MySQL GTID sets.
//!
//! A GTID set maps an origin (the server UUID, treated as an opaque string) to sorted, disjoint
//! closed intervals of transaction sequence numbers. The textual form is a comma separated list
//! of `origin:interval[:interval...]` entries where an interval is `n` or `n-m`.
//!
//! Every constructed [`GtidSet`] is canonical: intervals are sorted, overlapping and adjacent
//! intervals are merged, and origins without intervals are dropped. Two sets describing the same
//! transactions therefore compare equal regardless of how their text was written.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Errors raised while parsing the textual form of a GTID set.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseGtidError {
    #[error("invalid interval `{interval}` for origin `{origin}`")]
    InvalidInterval { origin: String, interval: String },
}

/// A closed range `[start, end]` of transaction sequence numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Interval {
    pub start: u64,
    pub end: u64,
}

impl Interval {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn single(sequence: u64) -> Self {
        Self::new(sequence, sequence)
    }

    /// Number of transactions covered. Inverted intervals are empty.
    pub fn len(&self) -> u64 {
        if self.start > self.end {
            0
        } else {
            self.end - self.start + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, sequence: u64) -> bool {
        self.start <= sequence && sequence <= self.end
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// A canonical set of GTIDs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct GtidSet {
    origins: BTreeMap<String, Vec<Interval>>,
}

impl GtidSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a set from raw per-origin intervals, canonicalising them.
    pub fn from_intervals<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, Vec<Interval>)>,
        S: Into<String>,
    {
        let mut set = GtidSet::new();
        for (origin, intervals) in entries {
            set.insert_intervals(origin.into(), intervals);
        }
        set
    }

    pub fn is_empty(&self) -> bool {
        self.origins.is_empty()
    }

    /// Canonical intervals of `origin`, empty when the origin is absent.
    pub fn intervals(&self, origin: &str) -> &[Interval] {
        self.origins.get(origin).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn origins(&self) -> impl Iterator<Item = &str> {
        self.origins.keys().map(String::as_str)
    }

    /// Total number of transactions in the set.
    pub fn count(&self) -> u64 {
        self.origins
            .values()
            .flat_map(|intervals| intervals.iter())
            .map(Interval::len)
            .sum()
    }

    /// Returns the transactions of `self` that are not in `other`.
    ///
    /// Origins that only appear in `other` are ignored and origins left without intervals are
    /// dropped from the result.
    pub fn subtract(&self, other: &GtidSet) -> GtidSet {
        let mut result = GtidSet::new();

        for (origin, intervals) in &self.origins {
            let remaining = match other.origins.get(origin) {
                Some(removed) => subtract_intervals(intervals, removed),
                None => intervals.clone(),
            };

            if !remaining.is_empty() {
                result.origins.insert(origin.clone(), remaining);
            }
        }

        result
    }

    /// Returns the transactions present in either set.
    pub fn union(&self, other: &GtidSet) -> GtidSet {
        let mut result = self.clone();
        for (origin, intervals) in &other.origins {
            result.insert_intervals(origin.clone(), intervals.clone());
        }
        result
    }

    /// Returns `true` when every transaction of `self` is also in `other`.
    pub fn is_subset(&self, other: &GtidSet) -> bool {
        self.subtract(other).is_empty()
    }

    /// Tests membership of a single GTID written as `origin[:tag...]:sequence`.
    ///
    /// Only the first field (origin) and the last field (sequence number) take part in the
    /// lookup. Malformed identifiers are never members.
    pub fn contains(&self, gtid: &str) -> bool {
        let gtid = gtid.trim();
        let Some((origin, rest)) = gtid.split_once(':') else {
            return false;
        };
        let sequence = rest.rsplit(':').next().unwrap_or(rest);
        let Ok(sequence) = sequence.trim().parse::<u64>() else {
            return false;
        };

        self.intervals(origin.trim())
            .iter()
            .any(|interval| interval.contains(sequence))
    }

    fn insert_intervals(&mut self, origin: String, intervals: Vec<Interval>) {
        let mut combined = self.origins.remove(&origin).unwrap_or_default();
        combined.extend(intervals);

        let merged = canonicalize(combined);
        if !merged.is_empty() {
            self.origins.insert(origin, merged);
        }
    }
}

impl FromStr for GtidSet {
    type Err = ParseGtidError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let mut set = GtidSet::new();

        for entry in text.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }

            let mut fields = entry.split(':');
            let origin = fields.next().unwrap_or_default().trim();

            let mut intervals = Vec::new();
            for field in fields {
                let field = field.trim();
                if field.is_empty() {
                    continue;
                }
                intervals.push(parse_interval(origin, field)?);
            }

            set.insert_intervals(origin.to_owned(), intervals);
        }

        Ok(set)
    }
}

impl fmt::Display for GtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, (origin, intervals)) in self.origins.iter().enumerate() {
            if index > 0 {
                f.write_str(",")?;
            }
            f.write_str(origin)?;
            for interval in intervals {
                write!(f, ":{interval}")?;
            }
        }
        Ok(())
    }
}

fn parse_interval(origin: &str, field: &str) -> Result<Interval, ParseGtidError> {
    let invalid = || ParseGtidError::InvalidInterval {
        origin: origin.to_owned(),
        interval: field.to_owned(),
    };

    let (start, end) = match field.split_once('-') {
        Some((start, end)) => (start.trim(), end.trim()),
        None => (field, field),
    };

    let start = start.parse::<u64>().map_err(|_| invalid())?;
    let end = end.parse::<u64>().map_err(|_| invalid())?;

    Ok(Interval::new(start, end))
}

/// Sorts, drops inverted intervals and merges overlapping or adjacent ones.
fn canonicalize(mut intervals: Vec<Interval>) -> Vec<Interval> {
    intervals.retain(|interval| !interval.is_empty());
    intervals.sort_unstable();

    let mut merged: Vec<Interval> = Vec::with_capacity(intervals.len());
    for interval in intervals {
        match merged.last_mut() {
            Some(last) if interval.start <= last.end.saturating_add(1) => {
                last.end = last.end.max(interval.end);
            }
            _ => merged.push(interval),
        }
    }

    merged
}

/// Difference of two canonical interval lists.
fn subtract_intervals(intervals: &[Interval], removed: &[Interval]) -> Vec<Interval> {
    let mut result = Vec::with_capacity(intervals.len());

    for interval in intervals {
        let mut start = interval.start;
        let mut exhausted = false;

        for cut in removed {
            if cut.end < start || cut.start > interval.end {
                continue;
            }
            if cut.start > start {
                result.push(Interval::new(start, cut.start - 1));
            }
            if cut.end >= interval.end {
                exhausted = true;
                break;
            }
            start = cut.end + 1;
        }

        if !exhausted {
            result.push(Interval::new(start, interval.end));
        }
    }

    result
}

/// Subtracts two textual GTID sets, returning the textual difference.
pub fn gtid_subtract(a: &str, b: &str) -> Result<String, ParseGtidError> {
    let a: GtidSet = a.parse()?;
    let b: GtidSet = b.parse()?;
    Ok(a.subtract(&b).to_string())
}

/// Counts the transactions of a textual GTID set.
pub fn gtid_count(text: &str) -> Result<u64, ParseGtidError> {
    Ok(text.parse::<GtidSet>()?.count())
}

/// Tests membership of `gtid` in the textual GTID set `text`.
///
/// An unparsable set contains nothing.
pub fn gtid_contains(text: &str, gtid: &str) -> bool {
    text.parse::<GtidSet>()
        .map(|set| set.contains(gtid))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    const U: &str = "3e11fa47-71ca-11e1-9e33-c80aa9429562";

    fn set(text: &str) -> GtidSet {
        text.parse().unwrap()
    }

    #[test]
    fn empty_and_blank_text_parse_to_empty_set() {
        assert!(set("").is_empty());
        assert!(set("  \n ").is_empty());
        assert_eq!(set("").to_string(), "");
    }

    #[test]
    fn parses_and_canonicalises_intervals() {
        let parsed = set(&format!("{U}:7-9:1-3:4-6, {U}:20"));

        assert_eq!(
            parsed.intervals(U),
            &[Interval::new(1, 9), Interval::new(20, 20)]
        );
        assert_eq!(parsed.to_string(), format!("{U}:1-9:20"));
    }

    #[test]
    fn skips_empty_interval_fields() {
        let parsed = set("a::5:");

        assert_eq!(parsed.to_string(), "a:5");
    }

    #[test]
    fn accepts_opaque_origins_and_zero() {
        let parsed = set("invalid-uuid:0-0");

        assert_eq!(parsed.count(), 1);
        assert!(parsed.contains("invalid-uuid:0"));
    }

    #[test]
    fn rejects_non_numeric_interval() {
        let err = "a:1-x".parse::<GtidSet>().unwrap_err();

        assert_eq!(
            err,
            ParseGtidError::InvalidInterval {
                origin: "a".to_owned(),
                interval: "1-x".to_owned()
            }
        );
    }

    #[test]
    fn origin_without_intervals_is_dropped() {
        assert!(set("a").is_empty());
        assert_eq!(set("a,b:1").to_string(), "b:1");
    }

    #[test]
    fn serialized_form_parses_back_to_same_set() {
        for text in [
            "",
            "a:1",
            "b:1-5:7:9-12,a:3",
            "a:10-20:1-30,c:5-5:6-6:7",
            &format!("{U}:1-100,\n{U}:200-300"),
        ] {
            let parsed = set(text);
            assert_eq!(set(&parsed.to_string()), parsed, "round trip of {text:?}");
        }
    }

    #[test]
    fn subtracting_a_set_from_itself_is_empty() {
        let a = set("a:1-10:15,b:3-4");

        assert_eq!(a.subtract(&a).count(), 0);
        assert!(a.subtract(&a).is_empty());
    }

    #[test]
    fn subtracting_empty_set_is_identity() {
        let a = set("a:1-10:15,b:3-4");

        assert_eq!(a.subtract(&GtidSet::new()), a);
    }

    #[test]
    fn subtracting_middle_splits_interval() {
        let a = set("u:1-10");
        let b = set("u:4-7");

        assert_eq!(a.subtract(&b), set("u:1-3:8-10"));
    }

    #[test]
    fn subtracting_covering_interval_removes_origin() {
        let a = set("u:3-5,v:1");
        let b = set("u:1-10");

        assert_eq!(a.subtract(&b).to_string(), "v:1");
    }

    #[test]
    fn subtracting_several_cuts() {
        let a = set("u:1-20");
        let b = set("u:5-8:12-15");

        assert_eq!(a.subtract(&b).to_string(), "u:1-4:9-11:16-20");
    }

    #[test]
    fn subtraction_ignores_origins_only_in_right_side() {
        let a = set("u:1-3");
        let b = set("v:1-3");

        assert_eq!(a.subtract(&b), a);
    }

    #[test]
    fn inverted_interval_is_empty() {
        let a = set("u:1-10");
        let b = set("u:8-5");

        assert!(b.is_empty());
        assert_eq!(a.subtract(&b), a);
    }

    #[test]
    fn counts_transactions() {
        assert_eq!(gtid_count("u:0-4").unwrap(), 5);
        assert_eq!(gtid_count("u:1:2:3:4:5").unwrap(), 5);
        assert_eq!(gtid_count("u:1-10,v:5").unwrap(), 11);
        assert_eq!(gtid_count("").unwrap(), 0);
    }

    #[test]
    fn membership_uses_last_field() {
        let a = set("u:1-5");

        assert!(a.contains("u:3"));
        assert!(!a.contains("u:6"));
        assert!(a.contains("u:tag1:tag2:3"));
        assert!(!a.contains("u:abc"));
        assert!(!a.contains("u"));
        assert!(!a.contains("v:3"));
        assert!(!GtidSet::new().contains("u:1"));
        assert!(!gtid_contains("", "u:1"));
    }

    #[test]
    fn text_subtraction_returns_empty_string_for_empty_result() {
        assert_eq!(gtid_subtract("u:1-5", "u:1-5").unwrap(), "");
        assert_eq!(gtid_subtract("u:1-5", "").unwrap(), "u:1-5");
    }

    #[test]
    fn union_merges_adjacent_ranges() {
        let merged = set("u:1-5").union(&set("u:6-9,v:1"));

        assert_eq!(merged.to_string(), "u:1-9,v:1");
        assert!(set("u:2-3").is_subset(&merged));
        assert!(!set("u:10").is_subset(&merged));
    }
}
