//! Core domain model for JLH.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "jlh-core";

/// Exact-match key for the `locations` table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct LocationKey {
    pub city: String,
    pub state_province: String,
    pub country: String,
}

impl LocationKey {
    pub fn new(
        city: impl Into<String>,
        state_province: impl Into<String>,
        country: impl Into<String>,
    ) -> Self {
        Self {
            city: city.into(),
            state_province: state_province.into(),
            country: country.into(),
        }
    }
}

impl fmt::Display for LocationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, {}", self.city, self.state_province)
    }
}

/// Normalized job record handed from the detail fetcher to the upserter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub title: String,
    pub description: String,
    pub company_name: String,
    /// External application URL. `None` is stored as SQL `NULL` and never
    /// takes part in link matching.
    pub apply_url: Option<String>,
    pub location: LocationKey,
    pub posted_at: DateTime<Utc>,
}

/// Which weak identity signal resolved an existing listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStrategy {
    /// Same title and same description text.
    Description,
    /// Same title posted by a company with the same name.
    Company,
    /// Same external link URL.
    Link,
}

impl fmt::Display for MatchStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            MatchStrategy::Description => "title+description",
            MatchStrategy::Company => "title+company",
            MatchStrategy::Link => "link",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UpsertOutcome {
    Created {
        job_id: i64,
        company_id: i64,
        location_id: i64,
    },
    Matched {
        job_id: i64,
        strategy: MatchStrategy,
    },
}

impl UpsertOutcome {
    pub fn job_id(&self) -> i64 {
        match self {
            UpsertOutcome::Created { job_id, .. } | UpsertOutcome::Matched { job_id, .. } => *job_id,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, UpsertOutcome::Created { .. })
    }
}

/// Result shape reported by the `/start` control endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStatus {
    pub running: bool,
    pub tries: u32,
    pub message: String,
}
