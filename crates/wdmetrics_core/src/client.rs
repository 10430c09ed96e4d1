use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::config::ApiSection;
use crate::error::{MetricsError, Result};
use crate::model::{Credentials, validate_http_url};

/// Action API request parameters. Sorted keys keep request URLs reproducible.
pub type Params = BTreeMap<String, String>;

pub fn params<const N: usize>(pairs: [(&str, &str); N]) -> Params {
    pairs
        .into_iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMethod {
    Get,
    /// Form-encoded body, used for writes and credential submission.
    Post,
}

/// A session against a MediaWiki-style action API.
///
/// `request` is exactly one attempt; retrying is layered on top by
/// [`crate::retry::RetryingClient`].
pub trait ActionApi {
    fn request(
        &mut self,
        params: &Params,
        method: RequestMethod,
        require_success: bool,
    ) -> Result<Value>;

    /// Login handshake. Safe to call again once the session has expired.
    fn login(&mut self) -> Result<()>;

    fn request_count(&self) -> usize;
}

#[derive(Debug, Clone)]
pub struct MediaWikiClientConfig {
    pub api_url: String,
    pub user_agent: String,
    pub timeout_ms: u64,
}

impl MediaWikiClientConfig {
    pub fn from_section(section: &ApiSection) -> Self {
        Self {
            api_url: section.url.clone(),
            user_agent: section.user_agent.clone(),
            timeout_ms: section.timeout_ms,
        }
    }
}

pub struct MediaWikiClient {
    client: Client,
    api_url: Url,
    user_agent: String,
    credentials: Credentials,
    request_count: usize,
}

impl MediaWikiClient {
    pub fn new(config: MediaWikiClientConfig, credentials: Credentials) -> Result<Self> {
        validate_http_url(&config.api_url)?;
        let api_url = Url::parse(&config.api_url).map_err(|error| {
            MetricsError::validation(format!("invalid API URL {}: {error}", config.api_url))
        })?;
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .cookie_store(true)
            .build()?;

        Ok(Self {
            client,
            api_url,
            user_agent: config.user_agent,
            credentials,
            request_count: 0,
        })
    }

    pub fn api_url(&self) -> &str {
        self.api_url.as_str()
    }
}

impl ActionApi for MediaWikiClient {
    fn request(
        &mut self,
        params: &Params,
        method: RequestMethod,
        require_success: bool,
    ) -> Result<Value> {
        let mut pairs = params.clone();
        pairs.insert("format".to_string(), "json".to_string());

        self.request_count += 1;
        let builder = match method {
            RequestMethod::Get => self.client.get(self.api_url.clone()).query(&pairs),
            RequestMethod::Post => self.client.post(self.api_url.clone()).form(&pairs),
        };
        let response = builder
            .header(reqwest::header::USER_AGENT, self.user_agent.clone())
            .send()?;

        let status = response.status();
        let body = response.text()?;
        if status != StatusCode::OK {
            return Err(MetricsError::Transport {
                status,
                detail: truncate(&body, 200),
            });
        }

        let payload: Value = serde_json::from_str(&body)?;
        check_envelope(&payload, require_success)?;
        Ok(payload)
    }

    fn login(&mut self) -> Result<()> {
        let token_response = self.request(
            &params([("action", "query"), ("meta", "tokens"), ("type", "login")]),
            RequestMethod::Get,
            false,
        )?;
        let token_payload: TokenQueryResponse = serde_json::from_value(token_response)?;
        let login_token = token_payload
            .query
            .tokens
            .and_then(|tokens| tokens.logintoken)
            .ok_or_else(|| MetricsError::protocol("login token missing from response"))?;

        let login_params = params([
            ("action", "login"),
            ("lgname", self.credentials.login_name.as_str()),
            ("lgpassword", self.credentials.password.as_str()),
            ("lgtoken", login_token.as_str()),
        ]);
        let login_response = self.request(&login_params, RequestMethod::Post, false)?;
        let login_payload: LoginResponse = serde_json::from_value(login_response)?;
        match login_payload.login.result.as_deref() {
            Some("Success") => {
                info!(
                    user = %login_payload.login.lgusername.as_deref().unwrap_or("?"),
                    "logged in"
                );
                Ok(())
            }
            other => Err(MetricsError::protocol(format!(
                "login failed: {}",
                login_payload
                    .login
                    .reason
                    .or_else(|| other.map(ToString::to_string))
                    .unwrap_or_else(|| "unknown error".to_string())
            ))),
        }
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

/// Reject API-level errors and, when asked, bodies without `success: 1`.
pub fn check_envelope(payload: &Value, require_success: bool) -> Result<()> {
    if let Some(error) = payload.get("error") {
        let code = error
            .get("code")
            .and_then(Value::as_str)
            .unwrap_or("unknown_error");
        let info = error
            .get("info")
            .and_then(Value::as_str)
            .unwrap_or("unknown info");
        return Err(MetricsError::protocol(format!(
            "MediaWiki API error [{code}]: {info}"
        )));
    }
    if require_success && payload.get("success").and_then(Value::as_i64) != Some(1) {
        debug!("response without success flag: {payload}");
        return Err(MetricsError::protocol("response lacks success flag"));
    }
    Ok(())
}

fn truncate(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((end, _)) => format!("{}...", &text[..end]),
        None => text.to_string(),
    }
}

#[derive(Debug, Deserialize, Default)]
struct TokenQueryResponse {
    #[serde(default)]
    query: TokenQueryPayload,
}

#[derive(Debug, Deserialize, Default)]
struct TokenQueryPayload {
    tokens: Option<TokenPayload>,
}

#[derive(Debug, Deserialize, Default)]
struct TokenPayload {
    logintoken: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct LoginResponse {
    #[serde(default)]
    login: LoginPayload,
}

#[derive(Debug, Deserialize, Default)]
struct LoginPayload {
    result: Option<String>,
    reason: Option<String>,
    lgusername: Option<String>,
}
