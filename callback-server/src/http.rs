//! HTTP front door for the callback endpoint.
//!
//! Only the configured callback path is served. Requests on it are converted
//! into a [`CallbackRequest`] and handed to the [`FrontDoor`], which either runs
//! the built-in [`Dispatcher`] or a caller-supplied [`CallbackHandler`]. Every
//! other path is answered with a 404.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use warp::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use warp::path::FullPath;
use warp::{Filter, Reply};

use crate::dispatcher::Dispatcher;

/// Largest callback body accepted, in bytes. Larger requests get a 413.
pub const MAX_BODY_BYTES: u64 = 64 * 1024;

/// An inbound request on the callback path, detached from the HTTP stack.
#[derive(Debug, Clone)]
pub struct CallbackRequest {
    pub method: Method,
    pub path: String,
    /// Decoded query parameters
    pub query: HashMap<String, String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl CallbackRequest {
    /// Build a request from its parts.
    pub fn new(method: Method, path: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            method,
            path: path.into(),
            query: HashMap::new(),
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    /// A `POST` with a JSON body.
    pub fn json(path: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self::new(Method::POST, path, body)
            .with_header(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))
    }

    /// A `POST` with a form-encoded body, the platform's native encoding.
    pub fn form(path: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self::new(Method::POST, path, body).with_header(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/x-www-form-urlencoded"),
        )
    }

    pub fn with_header(mut self, name: header::HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }

    /// The media type from `Content-Type`, without parameters.
    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.split(';').next().unwrap_or(value).trim())
    }
}

/// The acknowledgment returned to the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: String,
}

impl CallbackResponse {
    pub fn new(status: StatusCode, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: header::HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// 200 with body `OK`.
    pub fn ok() -> Self {
        Self::new(StatusCode::OK, "OK")
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

/// A complete replacement for the built-in dispatcher.
///
/// When one is configured no processor registry is built; the handler alone
/// decides what the platform receives.
#[async_trait]
pub trait CallbackHandler: Send + Sync {
    async fn handle(&self, request: CallbackRequest) -> CallbackResponse;
}

/// What sits behind the callback path.
pub enum FrontDoor {
    /// Classify and route to the per-kind processors
    Dispatch(Dispatcher),
    /// Hand the raw request to a caller-supplied handler
    Custom(Arc<dyn CallbackHandler>),
}

impl FrontDoor {
    pub async fn handle(&self, request: CallbackRequest) -> CallbackResponse {
        match self {
            FrontDoor::Dispatch(dispatcher) => dispatcher.dispatch(request).await,
            FrontDoor::Custom(handler) => handler.handle(request).await,
        }
    }
}

impl std::fmt::Debug for FrontDoor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrontDoor::Dispatch(dispatcher) => f.debug_tuple("Dispatch").field(dispatcher).finish(),
            FrontDoor::Custom(_) => f.write_str("Custom"),
        }
    }
}

/// Build the warp filter serving `path` through `front_door`.
pub(crate) fn routes(
    front_door: Arc<FrontDoor>,
    path: Arc<str>,
) -> impl Filter<Extract = (impl warp::Reply,), Error = Infallible> + Clone + Send + Sync + 'static {
    let on_path = warp::path::full()
        .and_then(move |full: FullPath| {
            let path = path.clone();
            async move {
                if full.as_str() == &*path {
                    Ok(full)
                } else {
                    Err(warp::reject::not_found())
                }
            }
        });

    let body_limit = warp::header::optional::<u64>("content-length")
        .and_then(|length: Option<u64>| async move {
            match length {
                Some(length) if length > MAX_BODY_BYTES => Err(warp::reject::custom(BodyTooLarge)),
                _ => Ok(()),
            }
        })
        .untuple_one();

    let raw_query = warp::query::raw()
        .or(warp::any().map(String::new))
        .unify();

    on_path
        .and(warp::method())
        .and(raw_query)
        .and(warp::header::headers_cloned())
        .and(body_limit)
        .and(warp::body::bytes())
        .and_then(
            move |path: FullPath, method: Method, query: String, headers: HeaderMap, body: Bytes| {
                let front_door = front_door.clone();
                async move {
                    // Bodies sent without a Content-Length are only checked once read.
                    if body.len() as u64 > MAX_BODY_BYTES {
                        return Err(warp::reject::custom(BodyTooLarge));
                    }

                    let request = CallbackRequest {
                        method,
                        path: path.as_str().to_string(),
                        query: url::form_urlencoded::parse(query.as_bytes())
                            .into_owned()
                            .collect(),
                        headers,
                        body,
                    };
                    let response = front_door.handle(request).await;
                    let mut reply =
                        warp::reply::with_status(response.body, response.status).into_response();
                    reply.headers_mut().extend(response.headers);
                    Ok::<_, warp::Rejection>(reply)
                }
            },
        )
        .recover(handle_rejection)
}

/// Declared or received body exceeds [`MAX_BODY_BYTES`].
#[derive(Debug)]
struct BodyTooLarge;

impl warp::reject::Reject for BodyTooLarge {}

/// Convert rejections into plain-text responses.
async fn handle_rejection(
    err: warp::Rejection,
) -> Result<warp::reply::WithStatus<&'static str>, Infallible> {
    let code;
    let message;

    if err.is_not_found() {
        code = StatusCode::NOT_FOUND;
        message = "Not found";
    } else if err.find::<BodyTooLarge>().is_some() {
        code = StatusCode::PAYLOAD_TOO_LARGE;
        message = "Payload too large";
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        code = StatusCode::METHOD_NOT_ALLOWED;
        message = "Method not allowed";
    } else {
        tracing::warn!(rejection = ?err, "Unhandled rejection on callback endpoint");
        code = StatusCode::INTERNAL_SERVER_ERROR;
        message = "Internal server error";
    }

    Ok(warp::reply::with_status(message, code))
}
