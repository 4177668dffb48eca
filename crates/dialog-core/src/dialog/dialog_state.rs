//! Dialog lifecycle

use std::fmt;

use serde::{Deserialize, Serialize};

/// State of a dialog
///
/// ```text
/// Early ──2xx──▶ Confirmed ──BYE──▶ Terminated
///   └──────3xx-6xx / CANCEL─────────▶ Terminated
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DialogState {
    /// Created by a provisional response carrying a To tag
    Early,
    /// 2xx sent or received
    Confirmed,
    Terminated,
}

impl fmt::Display for DialogState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DialogState::Early => write!(f, "Early"),
            DialogState::Confirmed => write!(f, "Confirmed"),
            DialogState::Terminated => write!(f, "Terminated"),
        }
    }
}
