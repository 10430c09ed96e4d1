use serde_json::Value;
use tracing::debug;

use crate::client::Params;
use crate::error::Result;

/// Pulls the next-page parameters out of a response, `None` when done.
pub type ContinuationExtractor = fn(&Value) -> Option<Params>;

/// Standard action API cursor: every key of the `continue` object, verbatim.
pub fn continue_envelope(response: &Value) -> Option<Params> {
    let object = response.get("continue")?.as_object()?;
    if object.is_empty() {
        return None;
    }
    Some(
        object
            .iter()
            .map(|(key, value)| (key.clone(), param_value(value)))
            .collect(),
    )
}

/// Fetch pages until the extractor reports no continuation, handing each page
/// to `merge`. Returns the number of pages fetched.
///
/// There is no page cap: an endpoint that never stops continuing keeps this
/// looping.
pub fn drain_pages(
    base: &Params,
    mut fetch: impl FnMut(&Params) -> Result<Value>,
    extract: ContinuationExtractor,
    mut merge: impl FnMut(&Value) -> Result<()>,
) -> Result<usize> {
    let mut params = base.clone();
    let mut pages = 0usize;
    loop {
        let response = fetch(&params)?;
        merge(&response)?;
        pages += 1;
        match extract(&response) {
            Some(cursor) => {
                debug!(page = pages, ?cursor, "continuing");
                params.extend(cursor);
            }
            None => return Ok(pages),
        }
    }
}

fn param_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
