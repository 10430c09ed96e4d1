use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_FILENAME: &str = "wdmetrics.toml";
pub const DEFAULT_API_URL: &str = "https://www.wikidata.org/w/api.php";
pub const DEFAULT_USER_AGENT: &str = "wdmetrics/0.1";
pub const DEFAULT_PAGEVIEWS_URL: &str =
    "https://wikimedia.org/api/rest_v1/metrics/pageviews/per-article";
pub const DEFAULT_SPARQL_URL: &str = "https://query.wikidata.org/sparql?query=";
pub const DEFAULT_SITELINK_CHUNK_SIZE: usize = 50;
pub const DEFAULT_SPARQL_CHUNK_SIZE: usize = 200_000;

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct MetricsConfig {
    #[serde(default)]
    pub api: ApiSection,
    #[serde(default)]
    pub metrics: MetricsSection,
    #[serde(default)]
    pub pageviews: PageviewsSection,
    #[serde(default)]
    pub sparql: SparqlSection,
    #[serde(default = "RetrySection::action_api")]
    pub retry: RetrySection,
    #[serde(default = "RetrySection::pageviews")]
    pub pageview_retry: RetrySection,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            api: ApiSection::default(),
            metrics: MetricsSection::default(),
            pageviews: PageviewsSection::default(),
            sparql: SparqlSection::default(),
            retry: RetrySection::action_api(),
            pageview_retry: RetrySection::pageviews(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ApiSection {
    pub url: String,
    pub user_agent: String,
    pub timeout_ms: u64,
}

impl Default for ApiSection {
    fn default() -> Self {
        Self {
            url: DEFAULT_API_URL.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct MetricsSection {
    pub languages: Vec<String>,
    pub sitelink_chunk_size: usize,
}

impl Default for MetricsSection {
    fn default() -> Self {
        Self {
            languages: Vec::new(),
            sitelink_chunk_size: DEFAULT_SITELINK_CHUNK_SIZE,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct PageviewsSection {
    pub rest_url: String,
    pub access: String,
    pub agent: String,
}

impl Default for PageviewsSection {
    fn default() -> Self {
        Self {
            rest_url: DEFAULT_PAGEVIEWS_URL.to_string(),
            access: "all-access".to_string(),
            agent: "user".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct SparqlSection {
    pub endpoint: String,
    pub chunk_size: usize,
}

impl Default for SparqlSection {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_SPARQL_URL.to_string(),
            chunk_size: DEFAULT_SPARQL_CHUNK_SIZE,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RetrySection {
    pub attempts: usize,
    pub initial_delay_secs: f64,
    pub factor: f64,
}

impl RetrySection {
    pub fn action_api() -> Self {
        Self {
            attempts: 4,
            initial_delay_secs: 20.0,
            factor: 2.3,
        }
    }

    pub fn pageviews() -> Self {
        Self {
            attempts: 5,
            initial_delay_secs: 12.0,
            factor: 2.0,
        }
    }
}

impl MetricsConfig {
    /// Resolve the action API URL: env WDMETRICS_API_URL > config.
    pub fn api_url(&self) -> String {
        env_override("WDMETRICS_API_URL").unwrap_or_else(|| self.api.url.clone())
    }

    /// Resolve user agent: env WDMETRICS_USER_AGENT > config.
    pub fn user_agent(&self) -> String {
        env_override("WDMETRICS_USER_AGENT").unwrap_or_else(|| self.api.user_agent.clone())
    }

    /// Resolve query endpoint prefix: env WDMETRICS_SPARQL_URL > config.
    pub fn sparql_endpoint(&self) -> String {
        env_override("WDMETRICS_SPARQL_URL").unwrap_or_else(|| self.sparql.endpoint.clone())
    }

    /// Copy with environment overrides folded into the owning sections.
    pub fn resolved(&self) -> Self {
        let mut resolved = self.clone();
        resolved.api.url = self.api_url();
        resolved.api.user_agent = self.user_agent();
        resolved.sparql.endpoint = self.sparql_endpoint();
        resolved
    }
}

/// Load and parse a MetricsConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<MetricsConfig> {
    if !config_path.exists() {
        return Ok(MetricsConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: MetricsConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

fn env_override(key: &str) -> Option<String> {
    let value = env::var(key).ok()?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.to_string())
}
