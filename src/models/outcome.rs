use crate::error::AppError;
use serde::{Deserialize, Serialize};

/// Processing state of the action a record carries
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum Outcome {
    Draft,
    Waiting,
    BeingProcessed,
    Success,
    UserError,
    SystemError,
}

impl Outcome {
    pub const ALL: [Outcome; 6] = [
        Outcome::Draft,
        Outcome::Waiting,
        Outcome::BeingProcessed,
        Outcome::Success,
        Outcome::UserError,
        Outcome::SystemError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Draft => "draft",
            Outcome::Waiting => "waiting",
            Outcome::BeingProcessed => "beingProcessed",
            Outcome::Success => "success",
            Outcome::UserError => "userError",
            Outcome::SystemError => "systemError",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Outcome::ALL.into_iter().find(|o| o.as_str() == value)
    }

    /// Terminal for the action currently carried by the record
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Outcome::Success | Outcome::UserError | Outcome::SystemError
        )
    }

    /// Whether `from -> to` is a legal transition. `from == None` is a freshly
    /// queued action.
    pub fn can_transition(from: Option<Outcome>, to: Outcome) -> bool {
        use Outcome::*;
        match (from, to) {
            (None, Draft | Waiting) => true,
            (None, _) => false,
            (Some(Waiting), BeingProcessed) => true,
            // Nothing but a completion may touch an in-flight action
            (Some(BeingProcessed), to) => to.is_terminal(),
            // New edits, explicit retries and finalized drafts
            (Some(_), Draft | Waiting) => true,
            (Some(_), _) => false,
        }
    }

    /// Checked transition
    pub fn transition(from: Option<Outcome>, to: Outcome) -> Result<Outcome, AppError> {
        if Outcome::can_transition(from, to) {
            Ok(to)
        } else {
            Err(AppError::Consistency(format!(
                "Illegal outcome transition {} -> {}",
                from.map(|o| o.as_str()).unwrap_or("none"),
                to.as_str()
            )))
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
