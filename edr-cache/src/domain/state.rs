//! EDR entry state machine.

use serde::{Deserialize, Serialize};

use crate::Error;

/// Lifecycle states of a cached EDR entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EdrState {
    /// Usable credential, not being refreshed.
    #[default]
    Negotiated,
    /// A refresh is in flight; the credential is the last known good one.
    Refreshing,
    /// The last refresh failed or the transfer was terminated mid-refresh.
    /// Retryable.
    Error,
    /// Superseded or invalidated. Terminal.
    Expired,
}

impl EdrState {
    pub const ALL: [EdrState; 4] = [
        Self::Negotiated,
        Self::Refreshing,
        Self::Error,
        Self::Expired,
    ];

    /// States in which an entry still counts as the live entry for its transfer.
    pub const LIVE: [EdrState; 3] = [Self::Negotiated, Self::Refreshing, Self::Error];

    /// Convert to database string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Negotiated => "NEGOTIATED",
            Self::Refreshing => "REFRESHING",
            Self::Error => "ERROR",
            Self::Expired => "EXPIRED",
        }
    }

    /// Parse from database string representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NEGOTIATED" => Some(Self::Negotiated),
            "REFRESHING" => Some(Self::Refreshing),
            "ERROR" => Some(Self::Error),
            "EXPIRED" => Some(Self::Expired),
            _ => None,
        }
    }

    pub fn is_live(&self) -> bool {
        !matches!(self, Self::Expired)
    }

    /// Whether a refresh may be started from this state.
    pub fn can_start_refresh(&self) -> bool {
        self.can_transition_to(Self::Refreshing)
    }

    /// Validate a state transition.
    pub fn can_transition_to(&self, target: EdrState) -> bool {
        use EdrState::*;
        matches!(
            (self, target),
            (Negotiated, Refreshing)
                | (Refreshing, Negotiated)
                | (Refreshing, Error)
                | (Error, Refreshing)
                | (Negotiated | Error | Refreshing, Expired)
        )
    }

    /// Pure transition function: returns the target state or the rejection.
    pub fn transition_to(self, target: EdrState) -> Result<EdrState, Error> {
        if self.can_transition_to(target) {
            Ok(target)
        } else {
            Err(Error::InvalidStateTransition {
                from: self.as_str().to_string(),
                to: target.as_str().to_string(),
            })
        }
    }
}

impl std::fmt::Display for EdrState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
