use std::collections::BTreeSet;

use tracing::{info, warn};

use crate::client::ActionApi;
use crate::error::Result;
use crate::model::TimeWindow;
use crate::pageviews::{MonthlyViews, PageviewsApi, project_for_language, underscored};
use crate::retry::{RetryPolicy, RetryingClient, run_with_retry};
use crate::sitelinks::{resolve_sitelinks, title_column, wiki_for_language};
use crate::table::{Cell, MetricsTable};

pub const PAGEVIEWS: &str = "pageviews";

/// `pageviews`, `enwikipageviews`, `pageviews_2021`, `enwikipageviews_2021`.
pub fn pageviews_column(wiki: Option<&str>, year: Option<&str>) -> String {
    let prefix = wiki.unwrap_or("");
    match year {
        Some(year) => format!("{prefix}{PAGEVIEWS}_{year}"),
        None => format!("{prefix}{PAGEVIEWS}"),
    }
}

pub fn init_demand_columns(table: &mut MetricsTable, wikis: &[String], window: &TimeWindow) {
    table.assign(&pageviews_column(None, None), Cell::Count(0));
    for wiki in wikis {
        table.assign(&pageviews_column(Some(wiki.as_str()), None), Cell::Count(0));
    }
    for year in window.year_labels() {
        table.assign(&pageviews_column(None, Some(year.as_str())), Cell::Count(0));
        for wiki in wikis {
            table.assign(
                &pageviews_column(Some(wiki.as_str()), Some(year.as_str())),
                Cell::Count(0),
            );
        }
    }
}

/// Distinct resolved titles on `wiki`, skipping entities without one.
pub fn distinct_titles(table: &MetricsTable, wiki: &str) -> Vec<String> {
    let column = title_column(wiki);
    table
        .index()
        .iter()
        .filter_map(|id| table.text(id, &column))
        .map(ToString::to_string)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Add each month's views into the per-wiki, per-year column of every row
/// whose title on `wiki` matches. Missing counts add zero.
pub fn fold_monthly_views(
    table: &mut MetricsTable,
    wiki: &str,
    titles: &[String],
    views: &MonthlyViews,
    window: &TimeWindow,
) -> Result<()> {
    let lookup = title_column(wiki);
    for (month, counts) in views {
        let year = month.get(0..4).unwrap_or_default();
        let in_window = year
            .parse::<i32>()
            .ok()
            .and_then(|year| window.year_index(year))
            .is_some();
        if !in_window {
            warn!(%wiki, %month, "pageview month outside the window, skipped");
            continue;
        }
        let column = pageviews_column(Some(wiki), Some(year));
        for title in titles {
            let count = counts.get(&underscored(title)).copied().flatten().unwrap_or(0);
            if count == 0 {
                continue;
            }
            let rows = table.select_rows(&lookup, |cell| {
                cell.as_text() == Some(title.as_str())
            });
            for id in rows {
                table.add_count(&id, &column, count)?;
            }
        }
    }
    Ok(())
}

/// Per-year across wikis, per-wiki across years, then the grand total.
pub fn sum_demand_totals(
    table: &mut MetricsTable,
    wikis: &[String],
    window: &TimeWindow,
) -> Result<()> {
    let years = window.year_labels();
    for year in &years {
        let sources = wikis
            .iter()
            .map(|wiki| pageviews_column(Some(wiki.as_str()), Some(year.as_str())))
            .collect::<Vec<_>>();
        table.sum_columns(&pageviews_column(None, Some(year.as_str())), &sources)?;
    }
    for wiki in wikis {
        let sources = years
            .iter()
            .map(|year| pageviews_column(Some(wiki.as_str()), Some(year.as_str())))
            .collect::<Vec<_>>();
        table.sum_columns(&pageviews_column(Some(wiki.as_str()), None), &sources)?;
    }
    let sources = wikis
        .iter()
        .map(|wiki| pageviews_column(Some(wiki.as_str()), None))
        .collect::<Vec<_>>();
    table.sum_columns(&pageviews_column(None, None), &sources)
}

pub struct DemandOptions<'a> {
    pub window: &'a TimeWindow,
    pub languages: &'a [String],
    pub sitelink_chunk_size: usize,
    pub pageview_retry: &'a RetryPolicy,
}

/// Resolve sitelinks for every entity, then fold monthly view counts per
/// language into the pageview columns.
pub fn append_demand_metrics<A: ActionApi, P: PageviewsApi>(
    client: &mut RetryingClient<A>,
    pageviews: &mut P,
    table: &mut MetricsTable,
    options: &DemandOptions<'_>,
) -> Result<()> {
    let wikis = options
        .languages
        .iter()
        .map(|language| wiki_for_language(language))
        .collect::<Vec<_>>();
    init_demand_columns(table, &wikis, options.window);
    resolve_sitelinks(client, table, &wikis, options.sitelink_chunk_size)?;

    let start_day = options.window.start_day();
    let end_day = options.window.end_day();
    for (language, wiki) in options.languages.iter().zip(&wikis) {
        let titles = distinct_titles(table, wiki);
        if titles.is_empty() {
            info!(wiki = %wiki, "no titles, skipping pageviews");
            continue;
        }
        info!(wiki = %wiki, titles = titles.len(), "collecting pageviews");
        let project = project_for_language(language);
        let views = run_with_retry(
            options.pageview_retry,
            pageviews,
            |api| api.monthly_views(&project, &titles, &start_day, &end_day),
            None,
        )?;
        fold_monthly_views(table, wiki, &titles, &views, options.window)?;
    }

    sum_demand_totals(table, &wikis, options.window)
}
