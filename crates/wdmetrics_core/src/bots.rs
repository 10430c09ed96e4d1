use std::collections::BTreeSet;

use serde::Deserialize;
use tracing::info;

use crate::client::{ActionApi, params};
use crate::error::Result;
use crate::pagination::{continue_envelope, drain_pages};
use crate::retry::RetryingClient;

pub const BOT_CATEGORIES: [&str; 4] = [
    "Category:Bots without botflag",
    "Category:Bots with botflag",
    "Category:Bots running on Wikimedia Toolforge",
    "Category:Extension bots",
];

pub const BOT_GROUPS: &str = "bot|flow-bot";

/// Account names whose edits never count as human.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BotSet {
    names: BTreeSet<String>,
}

impl BotSet {
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    /// Union of the bot categories and the bot user groups.
    ///
    /// The group listing is a single page of at most `aulimit=max` accounts;
    /// it is not continued.
    pub fn fetch<A: ActionApi>(client: &mut RetryingClient<A>) -> Result<Self> {
        let mut names = BTreeSet::new();
        for category in BOT_CATEGORIES {
            let base = params([
                ("action", "query"),
                ("list", "categorymembers"),
                ("cmtitle", category),
                ("cmlimit", "max"),
            ]);
            drain_pages(
                &base,
                |request| client.get(request),
                continue_envelope,
                |page| {
                    let parsed: CategoryMembersResponse = serde_json::from_value(page.clone())?;
                    names.extend(
                        parsed
                            .query
                            .categorymembers
                            .iter()
                            .filter_map(|member| bot_username(&member.title))
                            .map(ToString::to_string),
                    );
                    Ok(())
                },
            )?;
        }

        let response = client.get(&params([
            ("action", "query"),
            ("list", "allusers"),
            ("aulimit", "max"),
            ("augroup", BOT_GROUPS),
        ]))?;
        let parsed: AllUsersResponse = serde_json::from_value(response)?;
        names.extend(parsed.query.allusers.into_iter().map(|user| user.name));

        let bots = Self { names };
        info!("{} bots", bots.len());
        Ok(bots)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// `User:Name` with no further `:` or `/` yields `Name`; subpages and other
/// namespaces yield `None`.
pub fn bot_username(title: &str) -> Option<&str> {
    let name = title.strip_prefix("User:")?;
    if name.is_empty() || name.contains([':', '/']) {
        return None;
    }
    Some(name)
}

#[derive(Debug, Deserialize, Default)]
struct CategoryMembersResponse {
    #[serde(default)]
    query: CategoryMembersPayload,
}

#[derive(Debug, Deserialize, Default)]
struct CategoryMembersPayload {
    #[serde(default)]
    categorymembers: Vec<TitleItem>,
}

#[derive(Debug, Deserialize)]
struct TitleItem {
    title: String,
}

#[derive(Debug, Deserialize, Default)]
struct AllUsersResponse {
    #[serde(default)]
    query: AllUsersPayload,
}

#[derive(Debug, Deserialize, Default)]
struct AllUsersPayload {
    #[serde(default)]
    allusers: Vec<UserItem>,
}

#[derive(Debug, Deserialize)]
struct UserItem {
    name: String,
}
