//! Bearer token extraction.

use tonic::metadata::MetadataMap;

use super::error::AuthError;

/// Pull the token out of exactly one `authorization` metadata entry.
pub fn bearer_from_metadata(metadata: &MetadataMap) -> Result<&str, AuthError> {
    let values: Vec<&str> = metadata
        .get_all("authorization")
        .iter()
        .map(|v| v.to_str().unwrap_or_default())
        .collect();
    parse_single(&values)
}

/// Pull the token out of exactly one `Authorization` header.
pub fn bearer_from_headers(headers: &http::HeaderMap) -> Result<&str, AuthError> {
    let values: Vec<&str> = headers
        .get_all(http::header::AUTHORIZATION)
        .iter()
        .map(|v| v.to_str().unwrap_or_default())
        .collect();
    parse_single(&values)
}

fn parse_single<'a>(values: &[&'a str]) -> Result<&'a str, AuthError> {
    let [value] = values else {
        return Err(AuthError::unauthenticated(format!(
            "found {} authorization headers, expected 1",
            values.len()
        )));
    };
    parse_bearer(*value)
}

/// Split `<scheme> <token>`, accepting only the bearer scheme.
pub fn parse_bearer(value: &str) -> Result<&str, AuthError> {
    let Some((scheme, token)) = value.split_once(' ') else {
        return Err(AuthError::unauthenticated(
            "authorization header is not in '<type> <token>' format",
        ));
    };
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AuthError::unauthenticated(format!(
            "only bearer tokens are supported, not {scheme}"
        )));
    }
    let token = token.trim();
    if token.is_empty() {
        return Err(AuthError::unauthenticated("empty bearer token"));
    }
    Ok(token)
}
