use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::Row;
use serde::{Deserialize, Serialize};

/// Marks a successful call whose output still flags something worth a second look
static PARTIAL_MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(warning|warn:|deprecated|deprecation)")
        .expect("invalid partial marker pattern")
});

#[repr(i64)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success = 0,
    Failure = 1,
    Partial = 2,
}

impl Outcome {
    pub fn as_i64(&self) -> i64 {
        *self as i64
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(Outcome::Success),
            1 => Some(Outcome::Failure),
            2 => Some(Outcome::Partial),
            _ => None,
        }
    }

    pub fn full_name(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
            Outcome::Partial => "partial",
        }
    }

    /// Failure if the call did not succeed, Partial if its output carries a
    /// warning/deprecation marker, Success otherwise
    pub fn classify(succeeded: bool, output: &str) -> Self {
        if !succeeded {
            Outcome::Failure
        } else if PARTIAL_MARKER.is_match(output) {
            Outcome::Partial
        } else {
            Outcome::Success
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_name())
    }
}

/// One unit of work reported by the host, before sanitizing
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub session_id: String,
    pub tool_name: String,
    pub succeeded: bool,
    pub input: String,
    pub output: String,
}

impl ToolCall {
    pub fn new(
        session_id: impl Into<String>,
        tool_name: impl Into<String>,
        succeeded: bool,
        input: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            tool_name: tool_name.into(),
            succeeded,
            input: input.into(),
            output: output.into(),
        }
    }
}

/// A recorded, sanitized outcome. Append-only apart from `analyzed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeEvent {
    pub event_id: i64,
    pub session_id: String,
    pub tool_name: String,
    pub outcome: Outcome,
    pub input: String,
    pub message: String,
    pub preceding_id: Option<i64>,
    pub analyzed: bool,
    pub created_at: i64, // Unix ms (UTC)
}

impl OutcomeEvent {
    pub const COLUMNS: &'static str =
        "event_id, session_id, tool_name, outcome, input, message, preceding_id, analyzed, created_at";

    pub fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let outcome_val: i64 = row.get(3)?;
        let outcome = Outcome::from_i64(outcome_val).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                3,
                rusqlite::types::Type::Integer,
                Box::new(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("invalid outcome value: {}", outcome_val),
                )),
            )
        })?;

        Ok(OutcomeEvent {
            event_id: row.get(0)?,
            session_id: row.get(1)?,
            tool_name: row.get(2)?,
            outcome,
            input: row.get(4)?,
            message: row.get(5)?,
            preceding_id: row.get(6)?,
            analyzed: row.get(7)?,
            created_at: row.get(8)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(Outcome::classify(false, "all good"), Outcome::Failure);
        assert_eq!(Outcome::classify(false, "warning: x"), Outcome::Failure);
        assert_eq!(Outcome::classify(true, "Compiled 3 files"), Outcome::Success);
        assert_eq!(
            Outcome::classify(true, "WARNING: unused variable"),
            Outcome::Partial
        );
        assert_eq!(
            Outcome::classify(true, "this API is deprecated since 2.0"),
            Outcome::Partial
        );
        // Marker must start a word
        assert_eq!(Outcome::classify(true, "forewarning"), Outcome::Success);
    }

    #[test]
    fn test_outcome_integer_round_trip() {
        for outcome in [Outcome::Success, Outcome::Failure, Outcome::Partial] {
            assert_eq!(Outcome::from_i64(outcome.as_i64()), Some(outcome));
        }
        assert_eq!(Outcome::from_i64(7), None);
        assert_eq!(Outcome::Partial.to_string(), "partial");
    }
}
