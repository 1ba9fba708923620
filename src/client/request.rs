//! Request construction: endpoint resolution and argument placement.

use serde_json::{Map, Value};
use url::Url;

use super::error::InvocationError;
use crate::config::{RuntimeConfig, PROTOCOL_VERSION};
use crate::protocol::{Capability, ParamLocation};
use crate::transport::{PreparedRequest, RequestBody};

pub const PROTOCOL_VERSION_HEADER: &str = "X-ATP-Version";
pub const REQUEST_ID_HEADER: &str = "X-Request-Id";

/// Where a parameter goes: explicit `in`, else a path placeholder, else body or query by method.
pub(crate) fn location_of(cap: &Capability, name: &str, placeholders: &[&str]) -> ParamLocation {
    if let Some(loc) = cap.parameter(name).and_then(|p| p.location) {
        return loc;
    }
    if placeholders.contains(&name) {
        ParamLocation::Path
    } else if cap.method.carries_body() {
        ParamLocation::Body
    } else {
        ParamLocation::Query
    }
}

pub(crate) fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// RFC 3986 unreserved characters pass through; everything else is percent-encoded.
fn encode_segment(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for b in raw.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(b as char),
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

/// Absolute endpoint URL; relative endpoints resolve against `base`.
pub(crate) fn resolve_endpoint(endpoint: &str, base: &Url) -> Result<Url, InvocationError> {
    let url = if endpoint.contains("://") {
        Url::parse(endpoint)
    } else {
        base.join(endpoint)
    }
    .map_err(|_| InvocationError::InsecureEndpoint {
        url: endpoint.to_string(),
    })?;
    if url.scheme() != "https" {
        return Err(InvocationError::InsecureEndpoint { url: url.to_string() });
    }
    Ok(url)
}

/// Build the outgoing request for validated `arguments`.
pub(crate) fn build_request(
    cap: &Capability,
    base: &Url,
    arguments: &Map<String, Value>,
    config: &RuntimeConfig,
    request_id: &str,
) -> Result<PreparedRequest, InvocationError> {
    let placeholders = cap.path_placeholders();

    let mut endpoint = cap.endpoint.clone();
    let mut query = Vec::new();
    let mut headers = Vec::new();
    let mut body = Map::new();

    for (name, value) in arguments {
        match location_of(cap, name, &placeholders) {
            ParamLocation::Path => {
                endpoint = endpoint.replace(&format!("{{{}}}", name), &encode_segment(&scalar_text(value)));
            }
            ParamLocation::Query => match value {
                Value::Array(items) => {
                    for item in items {
                        query.push((name.clone(), scalar_text(item)));
                    }
                }
                other => query.push((name.clone(), scalar_text(other))),
            },
            ParamLocation::Header => headers.push((name.clone(), scalar_text(value))),
            ParamLocation::Body => {
                body.insert(name.clone(), value.clone());
            }
        }
    }

    let url = resolve_endpoint(&endpoint, base)?;
    let mut request = PreparedRequest::new(cap.method, url.as_str())
        .with_header("Accept", "application/json")
        .with_header("User-Agent", config.user_agent.clone())
        .with_header(PROTOCOL_VERSION_HEADER, PROTOCOL_VERSION)
        .with_header(REQUEST_ID_HEADER, request_id);
    for (name, value) in headers {
        request.set_header(name, value);
    }
    request.query = query;
    if cap.method.carries_body() {
        request.body = Some(RequestBody::Json(Value::Object(body)));
    }
    Ok(request)
}
