use std::collections::BTreeSet;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::bots::BotSet;
use crate::client::{ActionApi, params};
use crate::error::Result;
use crate::model::{EntityId, TimeWindow};
use crate::pagination::{continue_envelope, drain_pages};
use crate::retry::RetryingClient;
use crate::table::{Cell, MetricsTable};

pub const REVISION_PROPS: &str = "timestamp|ids|userid|user";

pub const EDITS: &str = "edits";
pub const ACTIVITY_DAYS: &str = "activity_days";
pub const HUMAN_EDITORS: &str = "human_editors";

pub fn yearly_column(metric: &str, year: &str) -> String {
    format!("{metric}_{year}")
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Revision {
    pub timestamp: String,
    #[serde(default)]
    pub revid: Option<i64>,
    #[serde(default)]
    pub userid: Option<i64>,
    /// Absent for hidden or suppressed accounts.
    #[serde(default)]
    pub user: Option<String>,
}

/// Per-year buckets for one entity, indexed by offset from the first year of
/// the window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContributionTally {
    edits: Vec<i64>,
    activity_days: Vec<BTreeSet<String>>,
    human_editors: Vec<BTreeSet<String>>,
}

impl ContributionTally {
    pub fn new(window: &TimeWindow) -> Self {
        let years = window.year_count();
        Self {
            edits: vec![0; years],
            activity_days: vec![BTreeSet::new(); years],
            human_editors: vec![BTreeSet::new(); years],
        }
    }

    /// Count `revision` if it falls inside the window. Returns whether it did.
    pub fn record(&mut self, window: &TimeWindow, bots: &BotSet, revision: &Revision) -> bool {
        if !window.contains(&revision.timestamp) {
            return false;
        }
        let Some(slot) = revision
            .timestamp
            .get(0..4)
            .and_then(|year| year.parse::<i32>().ok())
            .and_then(|year| window.year_index(year))
        else {
            return false;
        };

        self.edits[slot] += 1;
        if let Some(day) = revision.timestamp.get(0..10) {
            self.activity_days[slot].insert(day.to_string());
        }
        if let Some(user) = &revision.user
            && !bots.contains(user)
        {
            self.human_editors[slot].insert(user.clone());
        }
        true
    }

    pub fn edits(&self, slot: usize) -> i64 {
        self.edits.get(slot).copied().unwrap_or(0)
    }

    pub fn activity_days(&self, slot: usize) -> usize {
        self.activity_days.get(slot).map_or(0, BTreeSet::len)
    }

    pub fn human_editors(&self, slot: usize) -> usize {
        self.human_editors.get(slot).map_or(0, BTreeSet::len)
    }

    /// Distinct human editors across the whole window.
    pub fn human_editors_total(&self) -> usize {
        self.human_editors
            .iter()
            .flatten()
            .collect::<BTreeSet<_>>()
            .len()
    }
}

/// Revisions of every page in an action API `query.pages` payload. Handles
/// both the object-keyed and the array form.
pub fn revisions_in_response(response: &Value) -> Result<Vec<Revision>> {
    let pages: Vec<&Value> = match response.pointer("/query/pages") {
        Some(Value::Object(map)) => map.values().collect(),
        Some(Value::Array(items)) => items.iter().collect(),
        _ => Vec::new(),
    };
    let mut revisions = Vec::new();
    for page in pages {
        if let Some(items) = page.get("revisions") {
            let parsed: Vec<Revision> = serde_json::from_value(items.clone())?;
            revisions.extend(parsed);
        }
    }
    Ok(revisions)
}

pub fn init_contribution_columns(table: &mut MetricsTable, window: &TimeWindow) {
    for year in window.year_labels() {
        table.assign(&yearly_column(EDITS, &year), Cell::Count(0));
        table.assign(&yearly_column(ACTIVITY_DAYS, &year), Cell::Count(0));
        table.assign(&yearly_column(HUMAN_EDITORS, &year), Cell::Count(0));
    }
    table.assign(HUMAN_EDITORS, Cell::Count(0));
}

pub fn write_tally(
    table: &mut MetricsTable,
    id: &EntityId,
    window: &TimeWindow,
    tally: &ContributionTally,
) -> Result<()> {
    for (slot, year) in window.year_labels().iter().enumerate() {
        table.set(id, &yearly_column(EDITS, year), Cell::Count(tally.edits(slot)))?;
        table.set(
            id,
            &yearly_column(ACTIVITY_DAYS, year),
            Cell::Count(count_cell(tally.activity_days(slot))),
        )?;
        table.set(
            id,
            &yearly_column(HUMAN_EDITORS, year),
            Cell::Count(count_cell(tally.human_editors(slot))),
        )?;
    }
    table.set(
        id,
        HUMAN_EDITORS,
        Cell::Count(count_cell(tally.human_editors_total())),
    )
}

pub fn sum_contribution_totals(table: &mut MetricsTable, window: &TimeWindow) -> Result<()> {
    let years = window.year_labels();
    let activity = years
        .iter()
        .map(|year| yearly_column(ACTIVITY_DAYS, year))
        .collect::<Vec<_>>();
    let edits = years
        .iter()
        .map(|year| yearly_column(EDITS, year))
        .collect::<Vec<_>>();
    table.sum_columns(ACTIVITY_DAYS, &activity)?;
    table.sum_columns(EDITS, &edits)
}

/// Page through the revision history of every entity in `table` and add the
/// edit, activity-day and human-editor columns.
pub fn append_contribution_metrics<A: ActionApi>(
    client: &mut RetryingClient<A>,
    table: &mut MetricsTable,
    window: &TimeWindow,
    bots: &BotSet,
) -> Result<()> {
    init_contribution_columns(table, window);
    let ids = table.index().to_vec();
    info!(entities = ids.len(), "collecting contribution metrics");

    for id in &ids {
        let base = params([
            ("action", "query"),
            ("continue", ""),
            ("titles", id.as_str()),
            ("prop", "revisions"),
            ("rvprop", REVISION_PROPS),
            ("rvlimit", "max"),
        ]);
        let mut tally = ContributionTally::new(window);
        let mut counted = 0usize;
        let pages = drain_pages(
            &base,
            |request| client.get(request),
            continue_envelope,
            |page| {
                for revision in revisions_in_response(page)? {
                    if tally.record(window, bots, &revision) {
                        counted += 1;
                    }
                }
                Ok(())
            },
        )?;
        debug!(entity = %id, pages, revisions = counted, "revision history drained");
        write_tally(table, id, window, &tally)?;
    }

    sum_contribution_totals(table, window)
}

fn count_cell(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::{Value, json};

    use super::{ContributionTally, Revision, append_contribution_metrics, revisions_in_response};
    use crate::bots::BotSet;
    use crate::client::{ActionApi, Params, RequestMethod};
    use crate::error::{MetricsError, Result};
    use crate::model::{EntityId, TimeWindow};
    use crate::retry::{RetryPolicy, RetryingClient};
    use crate::table::MetricsTable;

    fn window() -> TimeWindow {
        TimeWindow::new("2020-01-01T00:00:00Z", "2021-12-31T23:59:59Z").expect("window")
    }

    fn revision(timestamp: &str, user: Option<&str>) -> Revision {
        Revision {
            timestamp: timestamp.to_string(),
            revid: Some(1),
            userid: Some(1),
            user: user.map(ToString::to_string),
        }
    }

    fn qid(value: &str) -> EntityId {
        EntityId::parse(value).expect("qid")
    }

    #[test]
    fn boundary_revisions_are_counted_outside_ones_are_not() {
        let window = window();
        let bots = BotSet::default();
        let mut tally = ContributionTally::new(&window);
        assert!(tally.record(&window, &bots, &revision("2020-01-01T00:00:00Z", Some("A"))));
        assert!(tally.record(&window, &bots, &revision("2021-12-31T23:59:59Z", Some("B"))));
        assert!(!tally.record(&window, &bots, &revision("2019-12-31T23:59:59Z", Some("C"))));
        assert!(!tally.record(&window, &bots, &revision("2022-01-01T00:00:00Z", Some("D"))));
        assert_eq!(tally.edits(0), 1);
        assert_eq!(tally.edits(1), 1);
        assert_eq!(tally.human_editors_total(), 2);
    }

    #[test]
    fn bots_and_hidden_users_count_as_edits_only() {
        let window = window();
        let bots = BotSet::from_names(["HelperBot"]);
        let mut tally = ContributionTally::new(&window);
        tally.record(&window, &bots, &revision("2020-03-01T10:00:00Z", Some("HelperBot")));
        tally.record(&window, &bots, &revision("2020-03-01T11:00:00Z", None));
        tally.record(&window, &bots, &revision("2020-03-02T11:00:00Z", Some("Alice")));
        tally.record(&window, &bots, &revision("2020-03-02T12:00:00Z", Some("Alice")));

        assert_eq!(tally.edits(0), 4);
        assert_eq!(tally.activity_days(0), 2);
        assert_eq!(tally.human_editors(0), 1);
    }

    #[test]
    fn window_editor_total_is_union_of_years() {
        let window = window();
        let bots = BotSet::default();
        let mut tally = ContributionTally::new(&window);
        tally.record(&window, &bots, &revision("2020-05-01T00:00:00Z", Some("Alice")));
        tally.record(&window, &bots, &revision("2021-05-01T00:00:00Z", Some("Alice")));
        tally.record(&window, &bots, &revision("2021-06-01T00:00:00Z", Some("Bob")));

        let per_year_sum = tally.human_editors(0) + tally.human_editors(1);
        assert_eq!(per_year_sum, 3);
        assert_eq!(tally.human_editors_total(), 2);
        assert!(tally.human_editors_total() <= per_year_sum);
    }

    #[test]
    fn revisions_parse_from_keyed_and_array_pages() {
        let keyed = json!({"query": {"pages": {"123": {"pageid": 123, "revisions": [
            {"revid": 5, "timestamp": "2020-01-01T00:00:00Z", "user": "A", "userid": 9},
            {"revid": 6, "timestamp": "2020-01-02T00:00:00Z", "userhidden": ""}
        ]}}}});
        let revisions = revisions_in_response(&keyed).expect("parse");
        assert_eq!(revisions.len(), 2);
        assert_eq!(revisions[1].user, None);

        let array = json!({"query": {"pages": [{"pageid": 1, "missing": true}]}});
        assert!(revisions_in_response(&array).expect("parse").is_empty());
    }

    /// Serves revision pages per `titles`, continuing via `rvcontinue`.
    #[derive(Default)]
    struct RevisionApi {
        pages: BTreeMap<(String, String), Value>,
        requests: usize,
    }

    impl ActionApi for RevisionApi {
        fn request(
            &mut self,
            params: &Params,
            _method: RequestMethod,
            _require_success: bool,
        ) -> Result<Value> {
            self.requests += 1;
            let key = (
                params.get("titles").cloned().unwrap_or_default(),
                params.get("rvcontinue").cloned().unwrap_or_default(),
            );
            self.pages
                .get(&key)
                .cloned()
                .ok_or_else(|| MetricsError::protocol(format!("no page for {key:?}")))
        }

        fn login(&mut self) -> Result<()> {
            Ok(())
        }

        fn request_count(&self) -> usize {
            self.requests
        }
    }

    #[test]
    fn append_fills_yearly_and_total_columns() {
        let mut api = RevisionApi::default();
        api.pages.insert(
            ("Q1".to_string(), String::new()),
            json!({
                "continue": {"rvcontinue": "20200601|7", "continue": "||"},
                "query": {"pages": {"1": {"revisions": [
                    {"timestamp": "2021-02-01T00:00:00Z", "user": "Alice"},
                    {"timestamp": "2021-02-01T05:00:00Z", "user": "HelperBot"}
                ]}}}
            }),
        );
        api.pages.insert(
            ("Q1".to_string(), "20200601|7".to_string()),
            json!({"query": {"pages": {"1": {"revisions": [
                {"timestamp": "2020-06-01T00:00:00Z", "user": "Alice"},
                {"timestamp": "2019-06-01T00:00:00Z", "user": "Old"}
            ]}}}}),
        );
        api.pages.insert(
            ("Q2".to_string(), String::new()),
            json!({"query": {"pages": {"2": {"revisions": []}}}}),
        );

        let mut client = RetryingClient::new(api, RetryPolicy::immediate(1));
        let mut table = MetricsTable::from_raw_ids(["Q1", "Q2", "Q1"]).expect("table");
        let bots = BotSet::from_names(["HelperBot"]);
        append_contribution_metrics(&mut client, &mut table, &window(), &bots).expect("append");

        assert_eq!(client.api().requests, 3);
        let q1 = qid("Q1");
        assert_eq!(table.count(&q1, "edits_2020"), Some(1));
        assert_eq!(table.count(&q1, "edits_2021"), Some(2));
        assert_eq!(table.count(&q1, "activity_days_2021"), Some(1));
        assert_eq!(table.count(&q1, "human_editors_2021"), Some(1));
        assert_eq!(table.count(&q1, "human_editors"), Some(1));
        assert_eq!(table.count(&q1, "edits"), Some(3));
        assert_eq!(table.count(&q1, "activity_days"), Some(2));

        let q2 = qid("Q2");
        for column in ["edits", "activity_days", "human_editors", "edits_2020"] {
            assert_eq!(table.count(&q2, column), Some(0), "{column}");
        }
    }
}
