//! Per-question marks awarded through numeric stamps.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Highest mark a single numeric stamp can award.
pub const MAX_MARKS: f32 = 10.0;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("question number must be a positive integer, got {input:?}")]
    InvalidQuestion { input: String },
    #[error("marks must be between 0 and 10 in steps of 0.5, got {input:?}")]
    InvalidMarks { input: String },
    #[error("unknown stamp {input:?}")]
    UnknownStamp { input: String },
}

/// A mark value between 0 and 10 in half-point steps, stored as half-points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Marks(u8);

impl Marks {
    pub fn from_halves(halves: u8) -> Option<Self> {
        (halves <= (MAX_MARKS * 2.0) as u8).then_some(Self(halves))
    }

    pub fn from_value(value: f32) -> Option<Self> {
        if !value.is_finite() || !(0.0..=MAX_MARKS).contains(&value) {
            return None;
        }
        let halves = value * 2.0;
        if (halves - halves.round()).abs() > f32::EPSILON {
            return None;
        }
        Self::from_halves(halves.round() as u8)
    }

    pub fn halves(&self) -> u8 {
        self.0
    }

    pub fn value(&self) -> f32 {
        self.0 as f32 / 2.0
    }

    /// Every stampable value, ascending.
    pub fn all() -> impl Iterator<Item = Marks> {
        (0..=(MAX_MARKS * 2.0) as u8).map(Marks)
    }
}

impl fmt::Display for Marks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 % 2 == 0 {
            write!(f, "{}", self.0 / 2)
        } else {
            write!(f, "{}.5", self.0 / 2)
        }
    }
}

impl FromStr for Marks {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<f32>()
            .ok()
            .and_then(Marks::from_value)
            .ok_or_else(|| LedgerError::InvalidMarks {
                input: s.to_string(),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stamp {
    Numeric(Marks),
    Tick,
    Cross,
}

impl Stamp {
    /// The numeric values 0, 0.5, … 10 followed by the two symbols.
    pub fn catalog() -> Vec<Stamp> {
        Marks::all()
            .map(Stamp::Numeric)
            .chain([Stamp::Tick, Stamp::Cross])
            .collect()
    }

    pub fn marks(&self) -> Option<Marks> {
        match self {
            Stamp::Numeric(marks) => Some(*marks),
            Stamp::Tick | Stamp::Cross => None,
        }
    }
}

impl fmt::Display for Stamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stamp::Numeric(marks) => marks.fmt(f),
            Stamp::Tick => f.write_str("tick"),
            Stamp::Cross => f.write_str("cross"),
        }
    }
}

impl FromStr for Stamp {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tick" | "check" | "✓" => Ok(Stamp::Tick),
            "cross" | "x" | "✗" => Ok(Stamp::Cross),
            other => other
                .parse::<Marks>()
                .map(Stamp::Numeric)
                .map_err(|_| LedgerError::UnknownStamp {
                    input: s.to_string(),
                }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MarkEntry {
    pub question: u32,
    pub marks: f32,
}

/// Parses a question-number prompt answer. Only strictly positive integers
/// are accepted; surrounding whitespace is ignored.
pub fn parse_question(input: &str) -> Result<u32, LedgerError> {
    match input.trim().parse::<u32>() {
        Ok(question) if question > 0 => Ok(question),
        _ => Err(LedgerError::InvalidQuestion {
            input: input.to_string(),
        }),
    }
}

/// Token returned when a numeric stamp is placed. The caller resolves it
/// once with the question number (or cancels) to finish the ledger update.
#[derive(Debug, PartialEq, Eq)]
pub struct PendingAssignment {
    pub(crate) id: u64,
    pub(crate) page_index: usize,
    pub(crate) marks: Marks,
}

impl PendingAssignment {
    pub fn marks(&self) -> Marks {
        self.marks
    }

    /// 1-based page number the stamp was placed on.
    pub fn page(&self) -> usize {
        self.page_index + 1
    }
}

/// One entry per question, always ordered by question number.
#[derive(Debug, Clone, Default)]
pub struct MarksLedger {
    entries: BTreeMap<u32, Marks>,
}

impl MarksLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the marks for `question`. Returns the previous
    /// value when one was replaced.
    pub fn upsert(&mut self, question: u32, marks: Marks) -> Result<Option<Marks>, LedgerError> {
        if question == 0 {
            return Err(LedgerError::InvalidQuestion {
                input: question.to_string(),
            });
        }
        Ok(self.entries.insert(question, marks))
    }

    pub fn get(&self, question: u32) -> Option<Marks> {
        self.entries.get(&question).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total(&self) -> f32 {
        self.entries.values().map(Marks::value).sum()
    }

    pub fn to_vec(&self) -> Vec<MarkEntry> {
        self.entries
            .iter()
            .map(|(question, marks)| MarkEntry {
                question: *question,
                marks: marks.value(),
            })
            .collect()
    }

    /// Full session reset; the only way entries are ever removed.
    pub fn reset(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn marks(value: f32) -> Marks {
        Marks::from_value(value).unwrap()
    }

    #[test]
    fn upsert_replaces_existing_question() {
        let mut ledger = MarksLedger::new();
        assert_eq!(ledger.upsert(3, marks(2.0)).unwrap(), None);
        assert_eq!(ledger.upsert(3, marks(4.0)).unwrap(), Some(marks(2.0)));

        assert_eq!(
            ledger.to_vec(),
            vec![MarkEntry {
                question: 3,
                marks: 4.0
            }]
        );
    }

    #[test]
    fn entries_stay_sorted_by_question() {
        let mut ledger = MarksLedger::new();
        for question in [7, 2, 9, 1, 4] {
            ledger.upsert(question, marks(1.5)).unwrap();
        }
        let questions: Vec<u32> = ledger.to_vec().iter().map(|e| e.question).collect();
        assert_eq!(questions, vec![1, 2, 4, 7, 9]);
        assert_eq!(ledger.total(), 7.5);
    }

    #[test]
    fn question_zero_is_rejected() {
        let mut ledger = MarksLedger::new();
        assert!(ledger.upsert(0, marks(1.0)).is_err());
        assert!(ledger.is_empty());
    }

    #[test]
    fn reset_clears_everything() {
        let mut ledger = MarksLedger::new();
        ledger.upsert(1, marks(10.0)).unwrap();
        ledger.reset();
        assert!(ledger.is_empty());
        assert_eq!(ledger.get(1), None);
    }

    #[test]
    fn parse_question_accepts_only_positive_integers() {
        assert_eq!(parse_question(" 4 ").unwrap(), 4);
        for bad in ["", "0", "-2", "4.5", "four"] {
            assert!(parse_question(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn marks_are_half_point_steps_up_to_ten() {
        assert_eq!(marks(7.5).halves(), 15);
        assert_eq!(marks(7.5).to_string(), "7.5");
        assert_eq!(marks(9.0).to_string(), "9");
        assert!(Marks::from_value(10.5).is_none());
        assert!(Marks::from_value(0.25).is_none());
        assert!(Marks::from_value(-0.5).is_none());
        assert_eq!(Marks::all().count(), 21);
    }

    #[test]
    fn stamp_catalog_has_numbers_and_symbols() {
        let catalog = Stamp::catalog();
        assert_eq!(catalog.len(), 23);
        assert_eq!(catalog[0], Stamp::Numeric(marks(0.0)));
        assert_eq!(catalog[22], Stamp::Cross);
    }

    #[test]
    fn stamps_parse_from_labels() {
        assert_eq!("7.5".parse::<Stamp>().unwrap(), Stamp::Numeric(marks(7.5)));
        assert_eq!("Tick".parse::<Stamp>().unwrap(), Stamp::Tick);
        assert_eq!("cross".parse::<Stamp>().unwrap(), Stamp::Cross);
        assert!("11".parse::<Stamp>().is_err());
        assert_eq!(Stamp::Tick.marks(), None);
    }
}
