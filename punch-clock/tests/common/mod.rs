//! Local HTTP receiver standing in for Discord and generic webhooks.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use parking_lot::Mutex;

/// A request seen by the receiver.
#[derive(Debug, Clone)]
pub struct Captured {
    pub method: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl Captured {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).expect("request body is not JSON")
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Canned response returned for the next request.
#[derive(Debug, Clone)]
pub struct Reply {
    pub status: StatusCode,
    pub headers: Vec<(&'static str, &'static str)>,
}

impl Reply {
    pub fn status(status: StatusCode) -> Self {
        Self {
            status,
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: &'static str, value: &'static str) -> Self {
        self.headers.push((name, value));
        self
    }
}

#[derive(Clone, Default)]
pub struct Receiver {
    requests: Arc<Mutex<Vec<Captured>>>,
    replies: Arc<Mutex<VecDeque<Reply>>>,
}

impl Receiver {
    /// Queue replies; once exhausted every request gets `204 No Content`.
    pub fn reply_with(&self, replies: impl IntoIterator<Item = Reply>) {
        self.replies.lock().extend(replies);
    }

    pub fn requests(&self) -> Vec<Captured> {
        self.requests.lock().clone()
    }

    /// Bind on an ephemeral port and return the hook URL.
    pub async fn serve(&self) -> String {
        let app = Router::new()
            .route("/hook", post(handle).put(handle))
            .with_state(self.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind receiver");
        let addr = listener.local_addr().expect("Failed to read local address");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{addr}/hook")
    }
}

async fn handle(
    State(receiver): State<Receiver>,
    method: axum::http::Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    receiver.requests.lock().push(Captured {
        method: method.to_string(),
        headers,
        body: body.to_vec(),
    });

    let Some(reply) = receiver.replies.lock().pop_front() else {
        return StatusCode::NO_CONTENT.into_response();
    };

    let mut response = (reply.status, "{\"message\": \"canned\"}").into_response();
    for (name, value) in reply.headers {
        response.headers_mut().insert(
            HeaderName::from_static(name),
            HeaderValue::from_static(value),
        );
    }
    response
}
