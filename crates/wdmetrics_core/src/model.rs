use std::collections::BTreeSet;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{MetricsError, Result};

static ENTITY_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Q[1-9][0-9]*$").expect("entity id pattern"));
static TIMESTAMP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^20[12][0-9]-(0[0-9]|1[0-2])-[0-3][0-9]T[0-2][0-9]:[0-5][0-9]:[0-5][0-9]Z$")
        .expect("timestamp pattern")
});
static HTTP_URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^https?://\S+$").expect("url pattern"));

/// Knowledge-base item identifier such as `Q42`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntityId(String);

impl EntityId {
    pub fn parse(value: &str) -> Result<Self> {
        if !ENTITY_ID_RE.is_match(value) {
            return Err(MetricsError::validation(format!(
                "malformed entity id: {value:?}"
            )));
        }
        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Validate and deduplicate a list of raw entity ids. Output order is sorted.
pub fn dedupe_entity_ids<I, S>(values: I) -> Result<Vec<EntityId>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut unique = BTreeSet::new();
    for value in values {
        unique.insert(EntityId::parse(value.as_ref().trim())?);
    }
    Ok(unique.into_iter().collect())
}

pub fn validate_http_url(value: &str) -> Result<()> {
    if HTTP_URL_RE.is_match(value) {
        Ok(())
    } else {
        Err(MetricsError::validation(format!(
            "not an http(s) URL: {value:?}"
        )))
    }
}

/// Closed time interval in MediaWiki timestamp form (`YYYY-MM-DDTHH:MM:SSZ`).
///
/// Timestamps in this form order lexicographically, so containment is a pair
/// of string comparisons.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeWindow {
    start: String,
    end: String,
    first_year: i32,
    last_year: i32,
}

impl TimeWindow {
    pub fn new(start: &str, end: &str) -> Result<Self> {
        for value in [start, end] {
            if !TIMESTAMP_RE.is_match(value) {
                return Err(MetricsError::validation(format!(
                    "malformed timestamp: {value:?} (expected YYYY-MM-DDTHH:MM:SSZ)"
                )));
            }
        }
        if start >= end {
            return Err(MetricsError::validation(format!(
                "window start {start} must be before end {end}"
            )));
        }
        Ok(Self {
            start: start.to_string(),
            end: end.to_string(),
            first_year: parse_year(start)?,
            last_year: parse_year(end)?,
        })
    }

    pub fn start(&self) -> &str {
        &self.start
    }

    pub fn end(&self) -> &str {
        &self.end
    }

    pub fn contains(&self, timestamp: &str) -> bool {
        timestamp >= self.start.as_str() && timestamp <= self.end.as_str()
    }

    pub fn years(&self) -> Vec<i32> {
        (self.first_year..=self.last_year).collect()
    }

    pub fn year_labels(&self) -> Vec<String> {
        self.years().iter().map(ToString::to_string).collect()
    }

    pub fn year_count(&self) -> usize {
        self.years().len()
    }

    /// Offset of `year` from the first year of the window.
    pub fn year_index(&self, year: i32) -> Option<usize> {
        if year < self.first_year || year > self.last_year {
            return None;
        }
        usize::try_from(year - self.first_year).ok()
    }

    /// `YYYYMMDD` form of the start instant.
    pub fn start_day(&self) -> String {
        compact_day(&self.start)
    }

    /// `YYYYMMDD` form of the end instant.
    pub fn end_day(&self) -> String {
        compact_day(&self.end)
    }
}

fn parse_year(timestamp: &str) -> Result<i32> {
    timestamp
        .get(0..4)
        .and_then(|year| year.parse::<i32>().ok())
        .ok_or_else(|| MetricsError::validation(format!("no year in {timestamp:?}")))
}

fn compact_day(timestamp: &str) -> String {
    timestamp.get(0..10).unwrap_or(timestamp).replace('-', "")
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub login_name: String,
    pub password: String,
}

impl Credentials {
    pub fn new(login_name: &str, password: &str) -> Result<Self> {
        if login_name.is_empty() {
            return Err(MetricsError::validation("login name must not be empty"));
        }
        if password.is_empty() {
            return Err(MetricsError::validation("password must not be empty"));
        }
        Ok(Self {
            login_name: login_name.to_string(),
            password: password.to_string(),
        })
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("login_name", &self.login_name)
            .field("password", &"<redacted>")
            .finish()
    }
}
