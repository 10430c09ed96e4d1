use serde_json::Value;
use tracing::{info, warn};

use crate::client::{ActionApi, RequestMethod, params};
use crate::error::{MetricsError, Result};
use crate::model::EntityId;
use crate::retry::RetryingClient;
use crate::table::{Cell, MetricsTable};

pub fn wiki_for_language(language: &str) -> String {
    format!("{language}wiki")
}

/// Column holding the resolved article title on `wiki`, e.g. `enwikititle`.
pub fn title_column(wiki: &str) -> String {
    format!("{wiki}title")
}

/// Resolve every entity's article title on each of `wikis`, one
/// `wbgetentities` request per chunk of `chunk_size` ids.
pub fn resolve_sitelinks<A: ActionApi>(
    client: &mut RetryingClient<A>,
    table: &mut MetricsTable,
    wikis: &[String],
    chunk_size: usize,
) -> Result<()> {
    if chunk_size == 0 {
        return Err(MetricsError::validation("sitelink chunk size must be positive"));
    }
    for wiki in wikis {
        table.assign(&title_column(wiki), Cell::Text(None));
    }

    let ids = table.index().to_vec();
    let site_filter = wikis.join("|");
    for (number, chunk) in ids.chunks(chunk_size).enumerate() {
        let joined = chunk
            .iter()
            .map(EntityId::as_str)
            .collect::<Vec<_>>()
            .join("|");
        info!(chunk = number, entities = chunk.len(), "resolving sitelinks");
        let response = client.call(
            &params([
                ("action", "wbgetentities"),
                ("ids", joined.as_str()),
                ("props", "sitelinks"),
                ("sitefilter", site_filter.as_str()),
            ]),
            RequestMethod::Get,
            true,
        )?;
        apply_sitelinks(table, chunk, wikis, &response)?;
    }
    Ok(())
}

/// Write the titles found in one `wbgetentities` response. Wikis without a
/// sitelink, and entities without any sitelink data, get no title.
pub fn apply_sitelinks(
    table: &mut MetricsTable,
    ids: &[EntityId],
    wikis: &[String],
    response: &Value,
) -> Result<()> {
    for id in ids {
        let entity = response.get("entities").and_then(|entities| entities.get(id.as_str()));
        let Some(sitelinks) = entity.and_then(|entity| entity.get("sitelinks")) else {
            warn!(
                entity = %id,
                "no sitelinks in: {}",
                entity.map_or_else(|| "<absent>".to_string(), |entity| entity.to_string())
            );
            for wiki in wikis {
                table.set(id, &title_column(wiki), Cell::Text(None))?;
            }
            continue;
        };
        for wiki in wikis {
            let title = sitelinks
                .get(wiki.as_str())
                .and_then(|link| link.get("title"))
                .and_then(Value::as_str)
                .map(ToString::to_string);
            table.set(id, &title_column(wiki), Cell::Text(title))?;
        }
    }
    Ok(())
}
