//! The HTTP/1.1 upgrade handshake.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use http::header::{CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_PROTOCOL};
use http::header::{SEC_WEBSOCKET_VERSION, UPGRADE};
use http::{HeaderMap, HeaderValue, StatusCode};
use sha1::{Digest, Sha1};

use crate::error::Error;

/// WebSocket magic string for handshake
const WS_MAGIC: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Generate a random `Sec-WebSocket-Key`.
pub fn generate_key() -> String {
    let nonce: [u8; 16] = rand::random();
    BASE64.encode(nonce)
}

/// Calculate WebSocket accept key
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_MAGIC.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Add the upgrade request headers.
pub(crate) fn upgrade_headers(
    headers: &mut HeaderMap,
    key: &str,
    protocols: &[String],
) -> Result<(), Error> {
    headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
    headers.insert(SEC_WEBSOCKET_VERSION, HeaderValue::from_static("13"));
    headers.insert(
        SEC_WEBSOCKET_KEY,
        HeaderValue::from_str(key).map_err(|_| Error::InvalidState("invalid websocket key"))?,
    );
    if !protocols.is_empty() {
        let value = HeaderValue::from_str(&protocols.join(", "))
            .map_err(|_| Error::InvalidState("invalid websocket sub-protocol"))?;
        headers.insert(SEC_WEBSOCKET_PROTOCOL, value);
    }
    Ok(())
}

fn header_contains_token(headers: &HeaderMap, name: http::header::HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|item| item.trim().eq_ignore_ascii_case(token))
}

/// Validate the server's upgrade response, returning the negotiated sub-protocol.
pub fn validate(
    status: StatusCode,
    headers: &HeaderMap,
    key: &str,
    protocols: &[String],
) -> Result<Option<String>, Error> {
    if status != StatusCode::SWITCHING_PROTOCOLS {
        return Err(Error::Handshake(format!("unexpected status {status}")));
    }

    if !header_contains_token(headers, UPGRADE, "websocket") {
        return Err(Error::Handshake("missing `Upgrade: websocket` header".into()));
    }

    if !header_contains_token(headers, CONNECTION, "upgrade") {
        return Err(Error::Handshake("missing `Connection: upgrade` header".into()));
    }

    let accept = headers
        .get(SEC_WEBSOCKET_ACCEPT)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| Error::Handshake("missing Sec-WebSocket-Accept header".into()))?;

    if accept.trim() != accept_key(key) {
        return Err(Error::Handshake(format!(
            "Sec-WebSocket-Accept mismatch: {accept}"
        )));
    }

    match headers
        .get(SEC_WEBSOCKET_PROTOCOL)
        .and_then(|value| value.to_str().ok())
    {
        None => Ok(None),
        Some(chosen) if protocols.iter().any(|p| p == chosen.trim()) => {
            Ok(Some(chosen.trim().to_owned()))
        }
        Some(chosen) => Err(Error::Handshake(format!(
            "server selected unrequested sub-protocol {chosen}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response_headers(key: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(UPGRADE, HeaderValue::from_static("WebSocket"));
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive, Upgrade"));
        headers.insert(
            SEC_WEBSOCKET_ACCEPT,
            HeaderValue::from_str(&accept_key(key)).unwrap(),
        );
        headers
    }

    #[test]
    fn rfc6455_accept_key() {
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn generated_keys_are_unique() {
        let a = generate_key();
        let b = generate_key();
        assert_ne!(a, b);
        assert_eq!(BASE64.decode(a).unwrap().len(), 16);
    }

    #[test]
    fn valid_handshake() {
        let key = generate_key();
        let headers = response_headers(&key);
        assert_eq!(
            validate(StatusCode::SWITCHING_PROTOCOLS, &headers, &key, &[]).unwrap(),
            None
        );
    }

    #[test]
    fn accept_mismatch() {
        let key = generate_key();
        let headers = response_headers("some other key");
        let error = validate(StatusCode::SWITCHING_PROTOCOLS, &headers, &key, &[]).unwrap_err();
        assert!(matches!(error, Error::Handshake(_)));
    }

    #[test]
    fn wrong_status_and_headers() {
        let key = generate_key();
        let headers = response_headers(&key);
        assert!(validate(StatusCode::OK, &headers, &key, &[]).is_err());

        let mut missing_upgrade = headers.clone();
        missing_upgrade.remove(UPGRADE);
        assert!(validate(StatusCode::SWITCHING_PROTOCOLS, &missing_upgrade, &key, &[]).is_err());

        let mut missing_connection = headers;
        missing_connection.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        assert!(
            validate(StatusCode::SWITCHING_PROTOCOLS, &missing_connection, &key, &[]).is_err()
        );
    }

    #[test]
    fn subprotocol_negotiation() {
        let key = generate_key();
        let requested = vec!["chat".to_owned(), "superchat".to_owned()];

        let mut headers = response_headers(&key);
        headers.insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("superchat"));
        assert_eq!(
            validate(StatusCode::SWITCHING_PROTOCOLS, &headers, &key, &requested).unwrap(),
            Some("superchat".to_owned())
        );

        headers.insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("mqtt"));
        assert!(validate(StatusCode::SWITCHING_PROTOCOLS, &headers, &key, &requested).is_err());
    }

    #[test]
    fn request_headers() {
        let mut headers = HeaderMap::new();
        upgrade_headers(&mut headers, "abc", &["chat".to_owned(), "v2".to_owned()]).unwrap();
        assert_eq!(headers[UPGRADE], "websocket");
        assert_eq!(headers[SEC_WEBSOCKET_VERSION], "13");
        assert_eq!(headers[SEC_WEBSOCKET_KEY], "abc");
        assert_eq!(headers[SEC_WEBSOCKET_PROTOCOL], "chat, v2");
    }
}
