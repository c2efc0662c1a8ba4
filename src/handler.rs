//! Response consumers and completion callbacks.
//!
//! A [`BodyConsumer`] turns the decoded response of a request into the value the caller receives.
//! Any error it returns fails the request, and the connection is discarded rather than pooled.
//! Returning a [`crate::Error`] (boxed) from a consumer fails the request with that exact error;
//! anything else is reported as [`crate::Error::Consumer`].

use std::fmt;

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, StatusCode};

use crate::error::Error;
use crate::transport::Connection;
use crate::BoxError;

/// Consumes a response as it arrives.
pub trait BodyConsumer: Send + 'static {
    /// The value produced once the response is complete.
    type Output: Send + 'static;

    /// The status line arrived.
    fn on_status(&mut self, status: StatusCode) -> Result<(), BoxError> {
        let _ = status;
        Ok(())
    }

    /// The response headers arrived.
    fn on_headers(&mut self, headers: &HeaderMap) -> Result<(), BoxError> {
        let _ = headers;
        Ok(())
    }

    /// The body is about to start.
    fn on_body_start(
        &mut self,
        content_type: Option<&str>,
        charset: Option<&str>,
        content_length: Option<u64>,
    ) -> Result<(), BoxError>;

    /// A chunk of the body arrived.
    fn on_content_part(&mut self, chunk: &Bytes) -> Result<(), BoxError>;

    /// The body is complete.
    fn on_completed_body(&mut self) -> Result<(), BoxError>;

    /// The server switched protocols and this consumer owns the connection now.
    ///
    /// Consumers which do not speak an upgraded protocol close the connection.
    fn on_upgrade(&mut self, mut connection: Box<dyn Connection>) -> Result<(), BoxError> {
        connection.close();
        Err(Error::Protocol("unexpected protocol upgrade".into()).into())
    }

    /// Produce the output. Called once, after the response completed.
    fn body(&mut self) -> Result<Self::Output, BoxError>;
}

/// Receives the outcome of a request executed in callback style.
pub trait AsyncCallback<T>: Send + 'static {
    /// The request completed.
    fn on_completed(self: Box<Self>, output: T);

    /// The request failed.
    fn on_error(self: Box<Self>, error: Error);
}

impl<T, F> AsyncCallback<T> for F
where
    F: FnOnce(Result<T, Error>) + Send + 'static,
{
    fn on_completed(self: Box<Self>, output: T) {
        (*self)(Ok(output))
    }

    fn on_error(self: Box<Self>, error: Error) {
        (*self)(Err(error))
    }
}

/// Map an error raised by a consumer or handler to a request error.
pub(crate) fn consumer_error(error: BoxError) -> Error {
    match error.downcast::<Error>() {
        Ok(error) => *error,
        Err(other) => Error::consumer(other),
    }
}

/// Extract the `charset` parameter of a `Content-Type` value.
pub fn charset(content_type: &str) -> Option<&str> {
    content_type
        .split(';')
        .skip(1)
        .filter_map(|param| param.split_once('='))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("charset"))
        .map(|(_, value)| value.trim().trim_matches('"'))
        .filter(|value| !value.is_empty())
}

/// Collects the response into an `http::Response<Bytes>`.
#[derive(Default)]
pub struct BytesConsumer {
    status: Option<StatusCode>,
    headers: HeaderMap,
    body: BytesMut,
    limit: Option<usize>,
}

impl fmt::Debug for BytesConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BytesConsumer")
            .field("status", &self.status)
            .field("received", &self.body.len())
            .finish()
    }
}

impl BytesConsumer {
    /// Create a consumer which buffers the whole body.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the request if the body grows beyond `limit` bytes.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }
}

/// The body exceeded the limit of a [`BytesConsumer`].
#[derive(Debug, thiserror::Error)]
#[error("response body exceeds {0} bytes")]
pub struct BodyTooLarge(pub usize);

impl BodyConsumer for BytesConsumer {
    type Output = http::Response<Bytes>;

    fn on_status(&mut self, status: StatusCode) -> Result<(), BoxError> {
        self.status = Some(status);
        Ok(())
    }

    fn on_headers(&mut self, headers: &HeaderMap) -> Result<(), BoxError> {
        self.headers = headers.clone();
        Ok(())
    }

    fn on_body_start(
        &mut self,
        _content_type: Option<&str>,
        _charset: Option<&str>,
        content_length: Option<u64>,
    ) -> Result<(), BoxError> {
        if let Some(length) = content_length {
            if self.limit.is_some_and(|limit| length > limit as u64) {
                return Err(BodyTooLarge(self.limit.unwrap_or_default()).into());
            }
            let reserve = usize::try_from(length).unwrap_or(0).min(1024 * 1024);
            self.body.reserve(reserve);
        }
        Ok(())
    }

    fn on_content_part(&mut self, chunk: &Bytes) -> Result<(), BoxError> {
        if let Some(limit) = self.limit {
            if self.body.len() + chunk.len() > limit {
                return Err(BodyTooLarge(limit).into());
            }
        }
        self.body.extend_from_slice(chunk);
        Ok(())
    }

    fn on_completed_body(&mut self) -> Result<(), BoxError> {
        Ok(())
    }

    fn body(&mut self) -> Result<Self::Output, BoxError> {
        let status = self
            .status
            .ok_or_else(|| Error::Protocol("response completed without a status".into()))?;
        let mut response = http::Response::new(std::mem::take(&mut self.body).freeze());
        *response.status_mut() = status;
        *response.headers_mut() = std::mem::take(&mut self.headers);
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn charset_parameter() {
        assert_eq!(charset("text/html; charset=UTF-8"), Some("UTF-8"));
        assert_eq!(charset("text/plain;CHARSET=\"latin1\""), Some("latin1"));
        assert_eq!(charset("application/json"), None);
        assert_eq!(charset("text/plain; boundary=x"), None);
    }

    #[test]
    fn bytes_consumer_collects() {
        let mut consumer = BytesConsumer::new();
        consumer.on_status(StatusCode::CREATED).unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("x-test", "1".parse().unwrap());
        consumer.on_headers(&headers).unwrap();
        consumer.on_body_start(None, None, Some(11)).unwrap();
        consumer.on_content_part(&Bytes::from_static(b"hello ")).unwrap();
        consumer.on_content_part(&Bytes::from_static(b"world")).unwrap();
        consumer.on_completed_body().unwrap();

        let response = consumer.body().unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()["x-test"], "1");
        assert_eq!(response.body(), "hello world");
    }

    #[test]
    fn bytes_consumer_limit() {
        let mut consumer = BytesConsumer::with_limit(4);
        assert!(consumer.on_body_start(None, None, Some(5)).is_err());

        let mut consumer = BytesConsumer::with_limit(4);
        consumer.on_content_part(&Bytes::from_static(b"abc")).unwrap();
        let error = consumer.on_content_part(&Bytes::from_static(b"de")).unwrap_err();
        assert!(matches!(consumer_error(error), Error::Consumer(_)));
    }

    #[test]
    fn typed_errors_pass_through() {
        let boxed: BoxError = Error::Handshake("mismatch".into()).into();
        assert!(matches!(consumer_error(boxed), Error::Handshake(_)));
    }

    #[test]
    fn closure_callbacks() {
        let (tx, rx) = std::sync::mpsc::channel();
        let callback: Box<dyn AsyncCallback<u8>> = Box::new(move |result: Result<u8, Error>| {
            tx.send(result.is_ok()).unwrap();
        });
        callback.on_completed(1);
        assert!(rx.recv().unwrap());
    }
}
