use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use regex::Regex;
use reqwest::StatusCode;
use reqwest::blocking::Client;
use tracing::{debug, info};

use crate::error::{MetricsError, Result};
use crate::model::validate_http_url;

/// Entity URIs in query output are rewritten to bare ids by dropping this
/// prefix up to the `Q`.
pub const ENTITY_URI_PREFIX: &str = "http://www.wikidata.org/entity/Q";

static SELECT_QUERY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)^select.+?\?.+?where.+?\?.").expect("query pattern"));
static DESCRIPTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[ A-Za-z0-9.,;:_-]{1,120}$").expect("description pattern"));
static DESCRIPTION_PUNCTUATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[,;:]").expect("punctuation pattern"));
static WHITESPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("whitespace pattern"));

/// Something that runs a query and answers with delimited text.
pub trait QueryEndpoint {
    fn run_csv(&mut self, query: &str) -> Result<String>;
}

pub struct SparqlEndpoint {
    client: Client,
    url_prefix: String,
    user_agent: String,
}

impl SparqlEndpoint {
    /// `url_prefix` is the endpoint URL up to and including `query=`.
    pub fn new(url_prefix: &str, user_agent: &str, timeout_ms: u64) -> Result<Self> {
        validate_http_url(url_prefix)?;
        let client = Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()?;
        Ok(Self {
            client,
            url_prefix: url_prefix.to_string(),
            user_agent: user_agent.to_string(),
        })
    }
}

impl QueryEndpoint for SparqlEndpoint {
    fn run_csv(&mut self, query: &str) -> Result<String> {
        let url = format!(
            "{}{}",
            self.url_prefix,
            utf8_percent_encode(query, NON_ALPHANUMERIC)
        );
        let response = self
            .client
            .get(&url)
            .header(reqwest::header::ACCEPT, "text/csv")
            .header(reqwest::header::USER_AGENT, self.user_agent.clone())
            .send()?;
        let status = response.status();
        let body = response.text()?;
        if status != StatusCode::OK {
            return Err(MetricsError::Transport {
                status,
                detail: body,
            });
        }
        Ok(body)
    }
}

/// Trim, drop `,;:`, collapse whitespace, strip a trailing `.csv`.
pub fn sanitize_description(raw: &str) -> String {
    let stripped = DESCRIPTION_PUNCTUATION_RE.replace_all(raw.trim(), "");
    let collapsed = WHITESPACE_RE.replace_all(&stripped, " ").into_owned();
    match collapsed
        .strip_suffix(".csv")
        .or_else(|| collapsed.strip_suffix(".CSV"))
    {
        Some(base) => base.to_string(),
        None => collapsed,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkedQueryReport {
    /// Matching rows per chunk, terminal empty chunk included.
    pub rows_per_chunk: Vec<usize>,
    pub merged_chunks: usize,
    pub output: PathBuf,
}

/// A query template run page by page via an `OFFSET n LIMIT m` placeholder.
#[derive(Debug, Clone)]
pub struct ChunkedQuery {
    query: String,
    placeholder: String,
    description: String,
    chunk_size: usize,
    out_dir: PathBuf,
}

impl ChunkedQuery {
    /// Validate the arguments and write `<description>.query.txt`.
    pub fn new(
        query: &str,
        placeholder: &str,
        description: &str,
        chunk_size: usize,
        out_dir: &Path,
    ) -> Result<Self> {
        if !SELECT_QUERY_RE.is_match(query) {
            return Err(MetricsError::validation(
                "query must be a SELECT ... WHERE query with variables",
            ));
        }
        if placeholder.chars().count() <= 2 {
            return Err(MetricsError::validation(
                "offset placeholder must be longer than two characters",
            ));
        }
        if !query.contains(placeholder) {
            return Err(MetricsError::validation(format!(
                "placeholder {placeholder:?} does not occur in the query"
            )));
        }
        if !DESCRIPTION_RE.is_match(description) {
            return Err(MetricsError::validation(format!(
                "description {description:?} must be 1-120 characters of letters, digits, spaces and .,;:_-"
            )));
        }
        if chunk_size == 0 {
            return Err(MetricsError::validation("chunk size must be positive"));
        }

        let chunked = Self {
            query: query.to_string(),
            placeholder: placeholder.to_string(),
            description: sanitize_description(description),
            chunk_size,
            out_dir: out_dir.to_path_buf(),
        };
        fs::create_dir_all(out_dir).map_err(|error| MetricsError::io(out_dir, error))?;
        let query_path = chunked.query_path();
        fs::write(&query_path, &chunked.query)
            .map_err(|error| MetricsError::io(&query_path, error))?;
        Ok(chunked)
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn query_path(&self) -> PathBuf {
        self.out_dir.join(format!("{}.query.txt", self.description))
    }

    pub fn chunk_path(&self, index: usize) -> PathBuf {
        self.out_dir.join(format!("{}.{index}.csv", self.description))
    }

    pub fn merged_path(&self) -> PathBuf {
        self.out_dir.join(format!("{}.csv", self.description))
    }

    pub fn chunk_query(&self, index: usize) -> String {
        let offset = index * self.chunk_size;
        self.query.replace(
            &self.placeholder,
            &format!("OFFSET {offset} LIMIT {}", self.chunk_size),
        )
    }

    /// Run chunks until one has no entity rows, then merge the non-empty
    /// chunks into `<description>.csv`. Endpoint failures are not retried.
    pub fn run<E: QueryEndpoint>(&self, endpoint: &mut E) -> Result<ChunkedQueryReport> {
        info!(description = %self.description, "running chunked query");
        let mut rows_per_chunk = Vec::new();
        loop {
            let index = rows_per_chunk.len();
            let query = self.chunk_query(index);
            debug!(chunk = index, %query, "running chunk");
            let response = endpoint.run_csv(&query)?;
            let rows = response.matches(ENTITY_URI_PREFIX).count();
            let path = self.chunk_path(index);
            fs::write(&path, response.replace(ENTITY_URI_PREFIX, "Q"))
                .map_err(|error| MetricsError::io(&path, error))?;
            info!(chunk = index, rows, "chunk written");
            rows_per_chunk.push(rows);
            if rows == 0 {
                break;
            }
        }

        let merged_chunks = rows_per_chunk.len() - 1;
        let inputs = (0..merged_chunks)
            .map(|index| self.chunk_path(index))
            .collect::<Vec<_>>();
        let output = self.merged_path();
        merge_chunks(&inputs, &output)?;
        Ok(ChunkedQueryReport {
            rows_per_chunk,
            merged_chunks,
            output,
        })
    }
}

/// Concatenate `inputs` into `output`, keeping only the first file's header.
/// Chunks are streamed, never held in memory whole.
pub fn merge_chunks(inputs: &[PathBuf], output: &Path) -> Result<()> {
    let file = File::create(output).map_err(|error| MetricsError::io(output, error))?;
    let mut writer = BufWriter::new(file);
    for (position, input) in inputs.iter().enumerate() {
        let file = File::open(input).map_err(|error| MetricsError::io(input, error))?;
        let mut reader = BufReader::new(file);
        if position > 0 {
            let mut header = Vec::new();
            reader
                .read_until(b'\n', &mut header)
                .map_err(|error| MetricsError::io(input, error))?;
        }
        io::copy(&mut reader, &mut writer).map_err(|error| MetricsError::io(output, error))?;
    }
    writer
        .flush()
        .map_err(|error| MetricsError::io(output, error))
}
