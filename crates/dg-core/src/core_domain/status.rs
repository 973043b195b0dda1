use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::ValidationError;

// ---------------------------------------------------------------------------
// Status — lifecycle state shared by datasets and fine-tunes
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Planning,
    Running,
    Aborted,
    Failed,
    Done,
    Deleted,
}

impl Status {
    pub const ALL: [Status; 6] = [
        Status::Planning,
        Status::Running,
        Status::Aborted,
        Status::Failed,
        Status::Done,
        Status::Deleted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planning => "PLANNING",
            Self::Running => "RUNNING",
            Self::Aborted => "ABORTED",
            Self::Failed => "FAILED",
            Self::Done => "DONE",
            Self::Deleted => "DELETED",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Status::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ValidationError::UnknownStatus(s.to_owned()))
    }
}

// ---------------------------------------------------------------------------
// Lifecycle guard — whitelist of externally settable destinations
// ---------------------------------------------------------------------------

/// Returns whether the external update path may move an entity from
/// `current` to `requested`.
///
/// Only the destination is checked: RUNNING, FAILED and DONE are accepted
/// from any current state (including DONE → RUNNING and same-state updates).
/// PLANNING and DELETED are never set through this path.
pub fn validate_transition(_current: Status, requested: Status) -> bool {
    matches!(requested, Status::Running | Status::Failed | Status::Done)
}

/// Like [`validate_transition`], but reports the rejection as an error.
pub fn check_transition(current: Status, requested: Status) -> Result<(), ValidationError> {
    if validate_transition(current, requested) {
        Ok(())
    } else {
        Err(ValidationError::InvalidTransition {
            from: current,
            to: requested,
        })
    }
}

/// Parses a raw status value received from outside and checks it against
/// the guard in one step.
pub fn parse_requested_status(current: Status, raw: &str) -> Result<Status, ValidationError> {
    let requested: Status = raw.parse()?;
    check_transition(current, requested)?;
    Ok(requested)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table_every_combination() {
        for current in Status::ALL {
            for requested in Status::ALL {
                let expected = matches!(requested, Status::Running | Status::Failed | Status::Done);
                assert_eq!(
                    validate_transition(current, requested),
                    expected,
                    "{current} -> {requested}"
                );
            }
        }
    }

    #[test]
    fn test_done_to_running_is_accepted() {
        // Regression pin: the guard does not enforce ordering.
        assert!(validate_transition(Status::Done, Status::Running));
        assert!(validate_transition(Status::Deleted, Status::Done));
        assert!(validate_transition(Status::Running, Status::Running));
    }

    #[test]
    fn test_check_transition_error_message() {
        let err = check_transition(Status::Running, Status::Planning).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid status transition from RUNNING to PLANNING"
        );

        let err = check_transition(Status::Done, Status::Deleted).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid status transition from DONE to DELETED"
        );
    }

    #[test]
    fn test_parse_requested_status_rejects_unknown_values() {
        let err = parse_requested_status(Status::Planning, "FINISHED").unwrap_err();
        assert!(matches!(err, ValidationError::UnknownStatus(ref v) if v == "FINISHED"));

        let err = parse_requested_status(Status::Planning, "done").unwrap_err();
        assert!(matches!(err, ValidationError::UnknownStatus(_)));
    }

    #[test]
    fn test_parse_requested_status_accepts_whitelist() {
        for raw in ["RUNNING", "FAILED", "DONE"] {
            let status = parse_requested_status(Status::Planning, raw).expect("accepted");
            assert_eq!(status.as_str(), raw);
        }
        assert!(parse_requested_status(Status::Running, "ABORTED").is_err());
    }

    #[test]
    fn test_status_serde_uses_upper_case() {
        let json = serde_json::to_string(&Status::Planning).expect("serialize");
        assert_eq!(json, "\"PLANNING\"");
        let status: Status = serde_json::from_str("\"DELETED\"").expect("deserialize");
        assert_eq!(status, Status::Deleted);
    }
}
