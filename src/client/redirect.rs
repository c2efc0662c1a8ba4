//! Redirect policy.
//!
//! Computes the next request of a redirect chain: the target is resolved from `Location`, the
//! method and body are rewritten according to the status code, and credentials are not carried to
//! a different destination.

use bytes::Bytes;
use http::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, HOST};
use http::uri::{PathAndQuery, Scheme};
use http::{HeaderValue, Method, StatusCode, Uri};

use crate::destination::Destination;
use crate::error::Error;
use crate::request::RequestParts;

/// Returns `true` for the statuses which carry a `Location` to follow.
pub(crate) fn is_redirect(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    )
}

/// Resolve a `Location` header against the URI of the request which received it.
///
/// A location with a scheme replaces the target entirely, `//authority/...` keeps the scheme,
/// `/path` keeps the authority, and anything else is relative to the last segment of the
/// request path.
pub(crate) fn resolve_location(base: &Uri, location: &str) -> Result<Uri, Error> {
    let location = location.trim();
    let invalid = |reason: &dyn std::fmt::Display| {
        Error::InvalidUri(format!("invalid redirect location {location:?}: {reason}"))
    };

    let has_scheme = location
        .split_once(':')
        .is_some_and(|(scheme, rest)| {
            rest.starts_with("//")
                && !scheme.is_empty()
                && scheme
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        });
    if has_scheme {
        return location.parse().map_err(|error| invalid(&error));
    }

    let scheme = base.scheme().cloned().unwrap_or(Scheme::HTTP);
    if let Some(rest) = location.strip_prefix("//") {
        return format!("{scheme}://{rest}")
            .parse()
            .map_err(|error| invalid(&error));
    }

    let path = if location.starts_with('/') {
        location.to_owned()
    } else {
        let base_path = base.path();
        let directory = match base_path.rfind('/') {
            Some(index) => &base_path[..=index],
            None => "/",
        };
        format!("{directory}{location}")
    };

    let path: PathAndQuery = path.parse().map_err(|error| invalid(&error))?;
    let mut parts = base.clone().into_parts();
    parts.path_and_query = Some(path);
    Uri::from_parts(parts).map_err(|error| invalid(&error))
}

/// Build the request for the next hop of a redirect chain.
pub(crate) fn next_request(
    previous: &RequestParts,
    from: &Destination,
    status: StatusCode,
    location: &HeaderValue,
) -> Result<(RequestParts, Destination), Error> {
    let location = location
        .to_str()
        .map_err(|_| Error::Protocol("redirect location is not valid ASCII".into()))?;
    let uri = resolve_location(&previous.uri, location)?;
    let destination = Destination::from_uri(&uri)?;

    let mut headers = previous.headers.clone();
    headers.remove(HOST);
    if destination != *from {
        headers.remove(AUTHORIZATION);
    }

    let (method, body) = match status {
        StatusCode::TEMPORARY_REDIRECT | StatusCode::PERMANENT_REDIRECT => {
            (previous.method.clone(), previous.body.clone())
        }
        StatusCode::SEE_OTHER if previous.method != Method::HEAD => (Method::GET, Bytes::new()),
        StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND if previous.method == Method::POST => {
            (Method::GET, Bytes::new())
        }
        _ => (previous.method.clone(), Bytes::new()),
    };
    if body.is_empty() {
        headers.remove(CONTENT_LENGTH);
        headers.remove(CONTENT_TYPE);
    }

    Ok((
        RequestParts {
            method,
            uri,
            headers,
            body,
        },
        destination,
    ))
}

#[cfg(test)]
mod tests {
    use http::HeaderMap;

    use super::*;

    fn resolve(base: &str, location: &str) -> String {
        resolve_location(&base.parse().unwrap(), location)
            .unwrap()
            .to_string()
    }

    fn post(uri: &str) -> RequestParts {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer secret"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("4"));
        headers.insert(HOST, HeaderValue::from_static("example.com"));
        RequestParts {
            method: Method::POST,
            uri: uri.parse().unwrap(),
            headers,
            body: Bytes::from_static(b"body"),
        }
    }

    #[test]
    fn location_resolution() {
        assert_eq!(
            resolve("http://a.example/x/y?q=1", "https://b.example/z"),
            "https://b.example/z"
        );
        assert_eq!(
            resolve("https://a.example/x", "//b.example/z"),
            "https://b.example/z"
        );
        assert_eq!(
            resolve("http://a.example:8080/x/y", "/z?k=v"),
            "http://a.example:8080/z?k=v"
        );
        assert_eq!(
            resolve("http://a.example/x/y", "z"),
            "http://a.example/x/z"
        );
        assert_eq!(resolve("http://a.example", "z"), "http://a.example/z");
    }

    #[test]
    fn see_other_becomes_get() {
        let previous = post("http://example.com/form");
        let from = Destination::from_uri(&previous.uri).unwrap();
        let (next, destination) = next_request(
            &previous,
            &from,
            StatusCode::SEE_OTHER,
            &HeaderValue::from_static("/done"),
        )
        .unwrap();

        assert_eq!(next.method, Method::GET);
        assert!(next.body.is_empty());
        assert!(!next.headers.contains_key(CONTENT_LENGTH));
        assert!(!next.headers.contains_key(CONTENT_TYPE));
        assert!(!next.headers.contains_key(HOST));
        assert_eq!(next.headers[AUTHORIZATION], "Bearer secret");
        assert_eq!(destination, from);
    }

    #[test]
    fn temporary_redirect_keeps_body() {
        let previous = post("http://example.com/upload");
        let from = Destination::from_uri(&previous.uri).unwrap();
        let (next, _) = next_request(
            &previous,
            &from,
            StatusCode::TEMPORARY_REDIRECT,
            &HeaderValue::from_static("/upload2"),
        )
        .unwrap();

        assert_eq!(next.method, Method::POST);
        assert_eq!(next.body, "body");
        assert_eq!(next.headers[CONTENT_LENGTH], "4");
    }

    #[test]
    fn credentials_stay_on_their_destination() {
        let previous = post("http://example.com/a");
        let from = Destination::from_uri(&previous.uri).unwrap();
        let (next, destination) = next_request(
            &previous,
            &from,
            StatusCode::FOUND,
            &HeaderValue::from_static("http://other.example/b"),
        )
        .unwrap();

        assert_ne!(destination, from);
        assert!(!next.headers.contains_key(AUTHORIZATION));
        assert_eq!(next.method, Method::GET);
    }

    #[test]
    fn redirect_statuses() {
        assert!(is_redirect(StatusCode::FOUND));
        assert!(is_redirect(StatusCode::PERMANENT_REDIRECT));
        assert!(!is_redirect(StatusCode::NOT_MODIFIED));
        assert!(!is_redirect(StatusCode::OK));
    }
}
