use tracing::info;

use crate::bots::BotSet;
use crate::client::ActionApi;
use crate::contribution::append_contribution_metrics;
use crate::demand::{DemandOptions, append_demand_metrics};
use crate::error::Result;
use crate::model::TimeWindow;
use crate::pageviews::PageviewsApi;
use crate::retry::{RetryPolicy, RetryingClient};
use crate::table::MetricsTable;

/// A logged-in action API session plus everything both aggregators share:
/// the time window, the languages to report on and the bot set, which is
/// fetched once when the session opens.
pub struct MetricsSession<A> {
    client: RetryingClient<A>,
    window: TimeWindow,
    languages: Vec<String>,
    sitelink_chunk_size: usize,
    pageview_retry: RetryPolicy,
    bots: BotSet,
}

impl<A: ActionApi> MetricsSession<A> {
    pub fn open(
        mut client: RetryingClient<A>,
        window: TimeWindow,
        languages: Vec<String>,
        sitelink_chunk_size: usize,
        pageview_retry: RetryPolicy,
    ) -> Result<Self> {
        client.login()?;
        let bots = BotSet::fetch(&mut client)?;
        info!(
            start = window.start(),
            end = window.end(),
            languages = languages.len(),
            bots = bots.len(),
            "metrics session ready"
        );
        Ok(Self {
            client,
            window,
            languages,
            sitelink_chunk_size,
            pageview_retry,
            bots,
        })
    }

    pub fn window(&self) -> &TimeWindow {
        &self.window
    }

    pub fn bots(&self) -> &BotSet {
        &self.bots
    }

    pub fn client(&self) -> &RetryingClient<A> {
        &self.client
    }

    pub fn append_contribution_metrics(&mut self, table: &mut MetricsTable) -> Result<()> {
        append_contribution_metrics(&mut self.client, table, &self.window, &self.bots)
    }

    pub fn append_demand_metrics<P: PageviewsApi>(
        &mut self,
        table: &mut MetricsTable,
        pageviews: &mut P,
    ) -> Result<()> {
        let options = DemandOptions {
            window: &self.window,
            languages: &self.languages,
            sitelink_chunk_size: self.sitelink_chunk_size,
            pageview_retry: &self.pageview_retry,
        };
        append_demand_metrics(&mut self.client, pageviews, table, &options)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::{Value, json};

    use super::MetricsSession;
    use crate::client::{ActionApi, Params, RequestMethod};
    use crate::error::Result;
    use crate::model::{EntityId, TimeWindow};
    use crate::pageviews::{MonthlyViews, PageviewsApi};
    use crate::retry::{RetryPolicy, RetryingClient};
    use crate::table::MetricsTable;

    #[derive(Default)]
    struct WikiApi {
        logins: usize,
        requests: Vec<Params>,
    }

    impl ActionApi for WikiApi {
        fn request(
            &mut self,
            params: &Params,
            _method: RequestMethod,
            _require_success: bool,
        ) -> Result<Value> {
            self.requests.push(params.clone());
            let field = |key: &str| params.get(key).map(String::as_str);
            let response = match (field("action"), field("list"), field("prop")) {
                (Some("query"), Some("categorymembers"), _) => {
                    if field("cmtitle") == Some("Category:Bots with botflag") {
                        json!({"query": {"categorymembers": [
                            {"ns": 2, "title": "User:HelperBot"}
                        ]}})
                    } else {
                        json!({"query": {"categorymembers": []}})
                    }
                }
                (Some("query"), Some("allusers"), _) => {
                    json!({"query": {"allusers": [{"userid": 9, "name": "GroupBot"}]}})
                }
                (Some("query"), None, Some("revisions")) => json!({"query": {"pages": {
                    "1": {"title": "Q1", "revisions": [
                        {"timestamp": "2020-03-01T10:00:00Z", "revid": 1, "userid": 5, "user": "Alice"},
                        {"timestamp": "2020-03-01T11:00:00Z", "revid": 2, "userid": 6, "user": "HelperBot"},
                        {"timestamp": "2021-07-04T09:00:00Z", "revid": 3, "userid": 9, "user": "GroupBot"}
                    ]}
                }}}),
                (Some("wbgetentities"), _, _) => json!({"success": 1, "entities": {
                    "Q1": {"sitelinks": {"enwiki": {"title": "Universe"}}}
                }}),
                _ => json!({}),
            };
            Ok(response)
        }

        fn login(&mut self) -> Result<()> {
            self.logins += 1;
            Ok(())
        }

        fn request_count(&self) -> usize {
            self.requests.len()
        }
    }

    struct FixedViews;

    impl PageviewsApi for FixedViews {
        fn monthly_views(
            &mut self,
            _project: &str,
            titles: &[String],
            _start_day: &str,
            _end_day: &str,
        ) -> Result<MonthlyViews> {
            let row = titles
                .iter()
                .map(|title| (title.clone(), Some(7)))
                .collect::<BTreeMap<_, _>>();
            Ok(BTreeMap::from([
                ("2020050100".to_string(), row.clone()),
                ("2021050100".to_string(), row),
            ]))
        }
    }

    fn session() -> MetricsSession<WikiApi> {
        MetricsSession::open(
            RetryingClient::new(WikiApi::default(), RetryPolicy::immediate(1)),
            TimeWindow::new("2020-01-01T00:00:00Z", "2021-12-31T23:59:59Z").expect("window"),
            vec!["en".to_string()],
            50,
            RetryPolicy::immediate(1),
        )
        .expect("session")
    }

    #[test]
    fn open_logs_in_and_fetches_bots_once() {
        let session = session();
        assert_eq!(session.client().api().logins, 1);
        assert!(session.bots().contains("HelperBot"));
        assert!(session.bots().contains("GroupBot"));
        assert_eq!(session.client().api().request_count(), 5);
    }

    #[test]
    fn both_aggregators_fill_one_table() {
        let mut session = session();
        let mut table = MetricsTable::from_raw_ids(["Q1"]).expect("table");
        session
            .append_contribution_metrics(&mut table)
            .expect("contribution");
        session
            .append_demand_metrics(&mut table, &mut FixedViews)
            .expect("demand");

        let q1 = EntityId::parse("Q1").expect("qid");
        assert_eq!(table.count(&q1, "edits"), Some(3));
        assert_eq!(table.count(&q1, "edits_2020"), Some(2));
        assert_eq!(table.count(&q1, "human_editors"), Some(1));
        assert_eq!(table.text(&q1, "enwikititle"), Some("Universe"));
        assert_eq!(table.count(&q1, "pageviews"), Some(14));
        assert_eq!(session.client().api().logins, 1);
    }
}
