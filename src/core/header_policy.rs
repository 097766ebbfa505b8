//! Header rewrite rules between the client and a backend.

use crate::core::config::BackendConfig;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue};
use std::collections::BTreeMap;

/// Headers that describe a single connection and never cross the proxy.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Client headers that would leak caller identity or confuse the backend.
/// `content-length` is recomputed for the forwarded body.
const CLIENT_ONLY_HEADERS: &[&str] = &["host", "cookie", "origin", "content-length"];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS.contains(&name) || name.starts_with("proxy-")
}

/// Whether a client header is forwarded to the backend at all.
pub fn should_forward_request_header(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    !is_hop_by_hop(&lower) && !CLIENT_ONLY_HEADERS.contains(&lower.as_str())
}

/// Whether a backend response header is copied to the client.
///
/// CORS headers are owned by the proxy's own middleware. `content-length`
/// is kept: the body is relayed byte for byte.
pub fn should_forward_response_header(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    !is_hop_by_hop(&lower) && !lower.starts_with("access-control-")
}

/// Build the header set sent to `backend`.
///
/// Strips connection and client-only headers, replaces `Authorization`
/// when the backend has a static key, then applies the rename table.
pub fn rewrite_request_headers(headers: &HeaderMap, backend: &BackendConfig) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if should_forward_request_header(name.as_str()) {
            out.append(name.clone(), value.clone());
        }
    }

    if let Some(key) = backend.credential() {
        match HeaderValue::from_str(&format!("Bearer {}", key)) {
            Ok(value) => {
                out.insert(header::AUTHORIZATION, value);
            }
            Err(_) => {
                tracing::warn!(backend = %backend.id, "API key is not a valid header value, skipping");
            }
        }
    }

    for (from, to) in &backend.header_mapping {
        let (Ok(from), Ok(to)) = (
            HeaderName::from_bytes(from.as_bytes()),
            HeaderName::from_bytes(to.as_bytes()),
        ) else {
            tracing::warn!(backend = %backend.id, from = %from, to = %to, "Invalid header mapping, skipping");
            continue;
        };
        if from == to {
            continue;
        }

        let values: Vec<HeaderValue> = out.get_all(&from).iter().cloned().collect();
        if values.is_empty() {
            continue;
        }
        out.remove(&from);
        for value in values {
            out.append(to.clone(), value);
        }
    }

    out
}

/// Serialize headers as a JSON object of name to list of values.
pub fn headers_to_json<'a, I>(headers: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a [u8])>,
{
    let mut map: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    for (name, value) in headers {
        map.entry(name)
            .or_default()
            .push(String::from_utf8_lossy(value).into_owned());
    }
    serde_json::to_string(&map).unwrap_or_default()
}
