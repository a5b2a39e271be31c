//! Human-readable document numbers: `PREFIX-YY-NNNN`.
//!
//! Sequence numbers use 4 to 7 digits. Numbers minted while the sequence is
//! unavailable always carry exactly 8 digits so they can be told apart during
//! reconciliation. The fallback digits come from a microsecond clock and are
//! only unique per machine; two hosts allocating in the same microsecond
//! window (mod 10^8) would collide.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const SEQUENCE_MAX: u64 = 9_999_999;
const FALLBACK_DIGITS: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NumberFormatError {
    #[error("`{0}` does not match PREFIX-YY-NNNN")]
    Malformed(String),
    #[error("prefix `{0}` must be 2-4 uppercase ASCII letters")]
    BadPrefix(String),
    #[error("sequence value {0} exceeds {SEQUENCE_MAX}")]
    SequenceExhausted(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NumberSource {
    Sequence,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContractNumber(String);

impl ContractNumber {
    pub fn parse(value: &str) -> Result<Self, NumberFormatError> {
        let malformed = || NumberFormatError::Malformed(value.to_string());
        let mut parts = value.split('-');
        let (Some(prefix), Some(year), Some(digits), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(malformed());
        };
        check_prefix(prefix).map_err(|_| malformed())?;
        if year.len() != 2 || !year.bytes().all(|b| b.is_ascii_digit()) {
            return Err(malformed());
        }
        if !(4..=8).contains(&digits.len()) || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(malformed());
        }
        Ok(Self(value.to_string()))
    }

    pub fn from_sequence(prefix: &str, year: i32, value: u64) -> Result<Self, NumberFormatError> {
        check_prefix(prefix)?;
        if value > SEQUENCE_MAX {
            return Err(NumberFormatError::SequenceExhausted(value));
        }
        Ok(Self(format!("{prefix}-{:02}-{value:04}", year.rem_euclid(100))))
    }

    pub fn from_fallback(prefix: &str, year: i32, clock_micros: u64) -> Result<Self, NumberFormatError> {
        check_prefix(prefix)?;
        let digits = clock_micros % 10u64.pow(FALLBACK_DIGITS as u32);
        Ok(Self(format!(
            "{prefix}-{:02}-{digits:0width$}",
            year.rem_euclid(100),
            width = FALLBACK_DIGITS
        )))
    }

    pub fn source(&self) -> NumberSource {
        match self.0.rsplit('-').next() {
            Some(digits) if digits.len() == FALLBACK_DIGITS => NumberSource::Fallback,
            _ => NumberSource::Sequence,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn check_prefix(prefix: &str) -> Result<(), NumberFormatError> {
    if (2..=4).contains(&prefix.len()) && prefix.bytes().all(|b| b.is_ascii_uppercase()) {
        Ok(())
    } else {
        Err(NumberFormatError::BadPrefix(prefix.to_string()))
    }
}

impl fmt::Display for ContractNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ContractNumber {
    type Error = NumberFormatError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ContractNumber> for String {
    fn from(value: ContractNumber) -> Self {
        value.0
    }
}
