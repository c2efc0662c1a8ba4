use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use tracing::debug;

use super::handshake;
use super::socket::{WebSocket, WebSocketListener};
use crate::config::WebSocketConfig;
use crate::error::Error;
use crate::handler::BodyConsumer;
use crate::transport::Connection;
use crate::BoxError;

/// The client side of a WebSocket opening handshake.
///
/// Pass this to [`Client::websocket`](crate::Client::websocket). It adds the upgrade headers to the
/// request, validates the server's response, and turns the upgraded connection into a
/// [`WebSocket`].
pub struct WebSocketUpgrade {
    key: String,
    protocols: Vec<String>,
    listeners: Vec<Arc<dyn WebSocketListener>>,
    config: Option<WebSocketConfig>,
    status: Option<StatusCode>,
    subprotocol: Option<String>,
    socket: Option<WebSocket>,
}

impl fmt::Debug for WebSocketUpgrade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketUpgrade")
            .field("key", &self.key)
            .field("protocols", &self.protocols)
            .field("listeners", &self.listeners.len())
            .field("config", &self.config)
            .finish()
    }
}

impl Default for WebSocketUpgrade {
    fn default() -> Self {
        Self::new()
    }
}

impl WebSocketUpgrade {
    /// A new handshake with a fresh random key.
    pub fn new() -> Self {
        Self {
            key: handshake::generate_key(),
            protocols: Vec::new(),
            listeners: Vec::new(),
            config: None,
            status: None,
            subprotocol: None,
            socket: None,
        }
    }

    /// Offer a sub-protocol.
    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocols.push(protocol.into());
        self
    }

    /// Register a listener. Listeners see every event from `on_open` onwards.
    pub fn with_listener(mut self, listener: impl WebSocketListener) -> Self {
        self.listeners.push(Arc::new(listener));
        self
    }

    /// Register a shared listener.
    pub fn with_shared_listener(mut self, listener: Arc<dyn WebSocketListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Use this configuration instead of the client's.
    pub fn with_config(mut self, config: WebSocketConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// The `Sec-WebSocket-Key` sent with the request.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub(crate) fn prepare(
        &mut self,
        headers: &mut HeaderMap,
        defaults: &WebSocketConfig,
    ) -> Result<(), Error> {
        if self.config.is_none() {
            self.config = Some(defaults.clone());
        }
        handshake::upgrade_headers(headers, &self.key, &self.protocols)
    }
}

impl BodyConsumer for WebSocketUpgrade {
    type Output = WebSocket;

    fn on_status(&mut self, status: StatusCode) -> Result<(), BoxError> {
        self.status = Some(status);
        Ok(())
    }

    fn on_headers(&mut self, headers: &HeaderMap) -> Result<(), BoxError> {
        let status = self
            .status
            .ok_or_else(|| Error::Handshake("headers arrived before the status".into()))?;
        self.subprotocol = handshake::validate(status, headers, &self.key, &self.protocols)?;
        debug!(subprotocol = ?self.subprotocol, "websocket handshake accepted");
        Ok(())
    }

    fn on_body_start(
        &mut self,
        _content_type: Option<&str>,
        _charset: Option<&str>,
        _content_length: Option<u64>,
    ) -> Result<(), BoxError> {
        Ok(())
    }

    fn on_content_part(&mut self, _chunk: &Bytes) -> Result<(), BoxError> {
        Ok(())
    }

    fn on_completed_body(&mut self) -> Result<(), BoxError> {
        Err(Error::Handshake("server did not switch protocols".into()).into())
    }

    fn on_upgrade(&mut self, connection: Box<dyn Connection>) -> Result<(), BoxError> {
        let socket = WebSocket::new(
            self.config.clone().unwrap_or_default(),
            self.subprotocol.clone(),
            self.listeners.clone(),
        );
        let sink = connection.upgrade(socket.frame_handler())?;
        socket.attach(sink);
        self.socket = Some(socket);
        Ok(())
    }

    fn body(&mut self) -> Result<Self::Output, BoxError> {
        let socket = self
            .socket
            .take()
            .ok_or_else(|| Error::Handshake("connection was not upgraded".into()))?;
        socket.open();
        Ok(socket)
    }
}

#[cfg(test)]
mod tests {
    use http::header::{CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, UPGRADE};
    use http::HeaderValue;

    use super::*;

    #[test]
    fn prepare_adds_headers_and_config() {
        let mut upgrade = WebSocketUpgrade::new().with_protocol("chat");
        let mut headers = HeaderMap::new();
        upgrade
            .prepare(&mut headers, &WebSocketConfig::default())
            .unwrap();

        assert_eq!(headers[SEC_WEBSOCKET_KEY], upgrade.key());
        assert_eq!(headers[UPGRADE], "websocket");
        assert_eq!(upgrade.config, Some(WebSocketConfig::default()));
    }

    #[test]
    fn rejects_bad_accept() {
        let mut upgrade = WebSocketUpgrade::new();
        let mut headers = HeaderMap::new();
        headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
        headers.insert(SEC_WEBSOCKET_ACCEPT, HeaderValue::from_static("bogus"));

        upgrade.on_status(StatusCode::SWITCHING_PROTOCOLS).unwrap();
        let error = upgrade.on_headers(&headers).unwrap_err();
        let error = error.downcast::<Error>().unwrap();
        assert!(matches!(*error, Error::Handshake(_)));
    }

    #[test]
    fn plain_response_is_not_a_socket() {
        let mut upgrade = WebSocketUpgrade::new();
        upgrade.on_status(StatusCode::OK).unwrap();
        assert!(upgrade.on_headers(&HeaderMap::new()).is_err());
        assert!(upgrade.on_completed_body().is_err());
        assert!(upgrade.body().is_err());
    }
}
