//! Realtime Database REST transport.
//!
//! Reads and writes map to `GET`/`PUT`/`PATCH` on `{base}/{path}.json`;
//! listening uses the server-sent event stream of the same URL, whose `put`
//! and `patch` events are folded into a cached copy so every emission is the
//! full value at the listened path.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::header::ACCEPT;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::sse::{SseDecoder, SseEvent};
use super::{tree, RemoteStore, ValueStream};
use crate::error::{Error, Result};

#[derive(Clone)]
pub struct RestRemote {
    client: reqwest::Client,
    base_url: String,
    auth: Option<String>,
}

impl RestRemote {
    pub fn new(base_url: impl Into<String>, auth: Option<String>, connect_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}.json", self.base_url, tree::segments(path).join("/"))
    }

    fn with_auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth {
            Some(token) => req.query(&[("auth", token.as_str())]),
            None => req,
        }
    }
}

#[async_trait]
impl RemoteStore for RestRemote {
    async fn get(&self, path: &str) -> Result<Value> {
        let value = self
            .with_auth(self.client.get(self.url(path)))
            .send()
            .await?
            .error_for_status()?
            .json::<Value>()
            .await?;
        Ok(value)
    }

    async fn set(&self, path: &str, value: Value) -> Result<()> {
        self.with_auth(self.client.put(self.url(path)))
            .json(&value)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn update(&self, path: &str, updates: Map<String, Value>) -> Result<()> {
        self.with_auth(self.client.patch(self.url(path)))
            .json(&updates)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn listen(&self, path: &str) -> Result<ValueStream> {
        let response = self
            .with_auth(self.client.get(self.url(path)))
            .header(ACCEPT, "text/event-stream")
            .send()
            .await?
            .error_for_status()?;
        debug!(path, "opened event stream");

        let state = EventStream {
            body: response.bytes_stream().map(|r| r.map(|b| b.to_vec())).boxed(),
            decoder: SseDecoder::new(),
            cache: CachedValue::default(),
            pending: VecDeque::new(),
            finished: false,
        };

        let stream = futures::stream::unfold(state, |mut s| async move {
            loop {
                if let Some(item) = s.pending.pop_front() {
                    return Some((item, s));
                }
                if s.finished {
                    return None;
                }
                match s.body.next().await {
                    Some(Ok(chunk)) => {
                        for event in s.decoder.push(&chunk) {
                            match s.cache.apply(&event) {
                                Applied::Changed(value) => s.pending.push_back(Ok(value)),
                                Applied::Ignored => {}
                                Applied::Malformed(e) => s.pending.push_back(Err(e)),
                                Applied::Closed(e) => {
                                    s.pending.push_back(Err(e));
                                    s.finished = true;
                                    break;
                                }
                            }
                        }
                    }
                    Some(Err(e)) => {
                        s.pending.push_back(Err(e.into()));
                        s.finished = true;
                    }
                    None => {
                        s.pending
                            .push_back(Err(Error::RemoteUnavailable("event stream closed".into())));
                        s.finished = true;
                    }
                }
            }
        });
        Ok(Box::pin(stream))
    }
}

struct EventStream {
    body: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    decoder: SseDecoder,
    cache: CachedValue,
    pending: VecDeque<Result<Value>>,
    finished: bool,
}

#[derive(Debug, Deserialize)]
struct EventPayload {
    path: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug)]
enum Applied {
    Changed(Value),
    Ignored,
    Malformed(Error),
    Closed(Error),
}

/// Local mirror of the listened value, maintained from stream events.
#[derive(Debug, Default)]
struct CachedValue {
    value: Value,
}

impl CachedValue {
    fn apply(&mut self, event: &SseEvent) -> Applied {
        match event.event.as_str() {
            "put" | "patch" => {}
            "keep-alive" => return Applied::Ignored,
            "cancel" => {
                return Applied::Closed(Error::RemoteUnavailable(
                    "listener cancelled by server (permission denied)".into(),
                ))
            }
            "auth_revoked" => {
                return Applied::Closed(Error::RemoteUnavailable("credential revoked".into()))
            }
            other => {
                warn!(event = other, "ignoring unknown stream event");
                return Applied::Ignored;
            }
        }

        let payload: EventPayload = match serde_json::from_str(&event.data) {
            Ok(p) => p,
            Err(e) => return Applied::Malformed(Error::Decode(format!("bad {} event: {e}", event.event))),
        };

        if event.event == "put" {
            tree::set(&mut self.value, &payload.path, payload.data);
        } else {
            match payload.data {
                Value::Object(updates) => tree::update(&mut self.value, &payload.path, updates),
                other => {
                    return Applied::Malformed(Error::Decode(format!(
                        "patch event carried non-object data: {other}"
                    )))
                }
            }
        }
        Applied::Changed(self.value.clone())
    }
}
