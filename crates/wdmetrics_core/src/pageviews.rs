use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use tracing::debug;

use crate::config::PageviewsSection;
use crate::error::{MetricsError, Result};
use crate::model::validate_http_url;

/// Month key (`YYYYMMDD00`) to underscored title to view count. Every
/// requested title appears under every month; `None` means no data.
pub type MonthlyViews = BTreeMap<String, BTreeMap<String, Option<i64>>>;

pub trait PageviewsApi {
    /// Monthly user views of `titles` on `project` (e.g. `en.wikipedia`)
    /// between two `YYYYMMDD` days.
    fn monthly_views(
        &mut self,
        project: &str,
        titles: &[String],
        start_day: &str,
        end_day: &str,
    ) -> Result<MonthlyViews>;
}

pub fn project_for_language(language: &str) -> String {
    format!("{language}.wikipedia")
}

pub fn underscored(title: &str) -> String {
    title.replace(' ', "_")
}

/// Client for the Wikimedia per-article REST endpoint, one request per title.
pub struct PageviewsClient {
    client: Client,
    base_url: Url,
    access: String,
    agent: String,
    user_agent: String,
}

impl PageviewsClient {
    pub fn new(section: &PageviewsSection, user_agent: &str, timeout_ms: u64) -> Result<Self> {
        validate_http_url(&section.rest_url)?;
        let base_url = Url::parse(&section.rest_url).map_err(|error| {
            MetricsError::validation(format!(
                "invalid pageviews URL {}: {error}",
                section.rest_url
            ))
        })?;
        let client = Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()?;
        Ok(Self {
            client,
            base_url,
            access: section.access.clone(),
            agent: section.agent.clone(),
            user_agent: user_agent.to_string(),
        })
    }

    fn article_url(&self, project: &str, title: &str, start_day: &str, end_day: &str) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| MetricsError::validation("pageviews URL cannot take a path"))?
            .pop_if_empty()
            .extend([
                project,
                self.access.as_str(),
                self.agent.as_str(),
                underscored(title).as_str(),
                "monthly",
                format!("{start_day}00").as_str(),
                format!("{end_day}00").as_str(),
            ]);
        Ok(url)
    }
}

impl PageviewsApi for PageviewsClient {
    fn monthly_views(
        &mut self,
        project: &str,
        titles: &[String],
        start_day: &str,
        end_day: &str,
    ) -> Result<MonthlyViews> {
        let mut per_title = BTreeMap::new();
        for title in titles {
            let url = self.article_url(project, title, start_day, end_day)?;
            debug!(%url, "fetching pageviews");
            let response = self
                .client
                .get(url)
                .header(reqwest::header::USER_AGENT, self.user_agent.clone())
                .send()?;
            let status = response.status();
            let body = response.text()?;
            per_title.insert(underscored(title), article_items(status, &body)?);
        }
        Ok(collect_monthly_views(per_title))
    }
}

/// Monthly items of one per-article response. A 404 means the API has no
/// data for the article.
fn article_items(status: StatusCode, body: &str) -> Result<Vec<ArticleViewsItem>> {
    if status == StatusCode::NOT_FOUND {
        return Ok(Vec::new());
    }
    if status != StatusCode::OK {
        return Err(MetricsError::Transport {
            status,
            detail: body.to_string(),
        });
    }
    let parsed: ArticleViewsResponse = serde_json::from_str(body)?;
    Ok(parsed.items)
}

fn collect_monthly_views(per_title: BTreeMap<String, Vec<ArticleViewsItem>>) -> MonthlyViews {
    let months = per_title
        .values()
        .flatten()
        .map(|item| item.timestamp.clone())
        .collect::<BTreeSet<_>>();
    let mut views = MonthlyViews::new();
    for month in months {
        let row = per_title
            .iter()
            .map(|(title, items)| {
                let count = items
                    .iter()
                    .find(|item| item.timestamp == month)
                    .and_then(|item| item.views);
                (title.clone(), count)
            })
            .collect();
        views.insert(month, row);
    }
    views
}

#[derive(Debug, Deserialize, Default)]
struct ArticleViewsResponse {
    #[serde(default)]
    items: Vec<ArticleViewsItem>,
}

#[derive(Debug, Deserialize)]
struct ArticleViewsItem {
    timestamp: String,
    views: Option<i64>,
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use reqwest::StatusCode;

    use super::{
        ArticleViewsItem, PageviewsClient, article_items, collect_monthly_views,
        project_for_language, underscored,
    };
    use crate::config::PageviewsSection;
    use crate::error::MetricsError;

    fn item(timestamp: &str, views: i64) -> ArticleViewsItem {
        ArticleViewsItem {
            timestamp: timestamp.to_string(),
            views: Some(views),
        }
    }

    #[test]
    fn naming_helpers() {
        assert_eq!(project_for_language("de"), "de.wikipedia");
        assert_eq!(underscored("New York City"), "New_York_City");
    }

    #[test]
    fn every_title_appears_in_every_month() {
        let mut per_title = BTreeMap::new();
        per_title.insert(
            "Earth".to_string(),
            vec![item("2020010100", 10), item("2020020100", 20)],
        );
        per_title.insert("Moon".to_string(), vec![item("2020020100", 5)]);
        per_title.insert("Nowhere".to_string(), Vec::new());

        let views = collect_monthly_views(per_title);
        assert_eq!(views.len(), 2);
        let january = &views["2020010100"];
        assert_eq!(january["Earth"], Some(10));
        assert_eq!(january["Moon"], None);
        assert_eq!(january["Nowhere"], None);
        assert_eq!(views["2020020100"]["Moon"], Some(5));
    }

    #[test]
    fn missing_article_reads_as_no_data_for_every_month() {
        let missing = article_items(StatusCode::NOT_FOUND, r#"{"type":"not_found"}"#)
            .expect("404 is not an error");
        assert!(missing.is_empty());

        let body = r#"{"items":[
            {"project":"en.wikipedia","article":"Earth","timestamp":"2020010100","views":10},
            {"project":"en.wikipedia","article":"Earth","timestamp":"2020020100","views":20}
        ]}"#;
        let found = article_items(StatusCode::OK, body).expect("items");

        let mut per_title = BTreeMap::new();
        per_title.insert("Earth".to_string(), found);
        per_title.insert("Ghost_town".to_string(), missing);
        let views = collect_monthly_views(per_title);
        assert_eq!(views.len(), 2);
        for counts in views.values() {
            assert_eq!(counts["Ghost_town"], None);
        }
        assert_eq!(views["2020020100"]["Earth"], Some(20));
    }

    #[test]
    fn titles_without_items_yield_no_months() {
        let mut per_title = BTreeMap::new();
        per_title.insert("Ghost_town".to_string(), Vec::new());
        assert!(collect_monthly_views(per_title).is_empty());
    }

    #[test]
    fn other_statuses_are_transport_errors() {
        let error = article_items(StatusCode::TOO_MANY_REQUESTS, "slow down").expect_err("must fail");
        assert!(matches!(
            error,
            MetricsError::Transport {
                status: StatusCode::TOO_MANY_REQUESTS,
                ..
            }
        ));
    }

    #[test]
    fn article_url_encodes_title_segment() {
        let client = PageviewsClient::new(&PageviewsSection::default(), "test", 1_000)
            .expect("client");
        let url = client
            .article_url("en.wikipedia", "AC/DC live", "20200101", "20201231")
            .expect("url");
        assert_eq!(
            url.as_str(),
            "https://wikimedia.org/api/rest_v1/metrics/pageviews/per-article/en.wikipedia/all-access/user/AC%2FDC_live/monthly/2020010100/2020123100"
        );
    }
}
