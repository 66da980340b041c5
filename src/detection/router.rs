//! Event routing
//!
//! Each destination has its own predicate. An event is delivered to every
//! destination whose predicate holds, and to `Other` only when none of the
//! named predicates hold.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::models::event::SENSITIVE_DATA_ACCESS;
use crate::models::Event;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Access,
    DataTransfer,
    Privileged,
    Authentication,
    SensitiveData,
    Other,
}

impl Category {
    /// Categories with their own predicate, in routing order
    pub const NAMED: [Category; 5] = [
        Category::Access,
        Category::DataTransfer,
        Category::Privileged,
        Category::Authentication,
        Category::SensitiveData,
    ];

    pub const ALL: [Category; 6] = [
        Category::Access,
        Category::DataTransfer,
        Category::Privileged,
        Category::Authentication,
        Category::SensitiveData,
        Category::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Access => "access",
            Category::DataTransfer => "data_transfer",
            Category::Privileged => "privileged",
            Category::Authentication => "authentication",
            Category::SensitiveData => "sensitive_data",
            Category::Other => "other",
        }
    }

    /// Destination table for this category
    pub fn table_name(&self) -> &'static str {
        match self {
            Category::Access => "access_events",
            Category::DataTransfer => "data_transfer_events",
            Category::Privileged => "privileged_action_events",
            Category::Authentication => "authentication_events",
            Category::SensitiveData => "sensitive_data_access_events",
            Category::Other => "other_events",
        }
    }

    /// Lowercase substrings of `event_type` that select this category
    fn keywords(&self) -> &'static [&'static str] {
        match self {
            Category::Access => &["access", "file"],
            Category::DataTransfer => &["transfer", "download", "export"],
            Category::Privileged => &["privileged", "admin"],
            Category::Authentication => &["authentication", "login"],
            Category::SensitiveData => &["sensitive"],
            Category::Other => &[],
        }
    }

    /// Whether `event` belongs in this category
    pub fn matches(&self, event: &Event) -> bool {
        let event_type = event.event_type().to_lowercase();
        match self {
            Category::Other => !Category::NAMED.iter().any(|c| c.matches(event)),
            Category::SensitiveData => {
                event.flag(SENSITIVE_DATA_ACCESS) || contains_any(&event_type, self.keywords())
            }
            _ => contains_any(&event_type, self.keywords()),
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| haystack.contains(needle))
}

/// Fan-out classifier
#[derive(Debug, Clone, Default)]
pub struct EventRouter;

impl EventRouter {
    pub fn new() -> Self {
        EventRouter
    }

    /// Every category the event should be delivered to, never empty
    pub fn classify(&self, event: &Event) -> Vec<Category> {
        Category::ALL
            .iter()
            .copied()
            .filter(|category| category.matches(event))
            .collect()
    }

    /// Destination tables for the event
    pub fn destinations(&self, event: &Event) -> Vec<&'static str> {
        self.classify(event)
            .iter()
            .map(Category::table_name)
            .collect()
    }
}
