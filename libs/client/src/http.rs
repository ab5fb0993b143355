//! REST client for the cluster API.
//!
//! Speaks the Kubernetes resource layout:
//! - core group: `/api/v1/namespaces/{ns}/pods[/{name}]`
//! - named groups: `/apis/{group}/{version}/namespaces/{ns}/{plural}[/{name}]`
//!
//! Every payload goes through the shared [`Scheme`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_core::Stream;
use futures_util::StreamExt;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use taskrun_api::core_v1::Pod;
use taskrun_api::v1::Task;
use taskrun_api::{ObjectList, Resource, Scheme, Selector, WatchEvent};
use tracing::{debug, error};

use crate::api::{ListWatch, PodApi, PropagationPolicy, TaskApi, WatchStream};
use crate::error::ApiError;

/// Connection settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// API server URL, e.g. `https://10.0.0.1:6443`.
    pub base_url: String,

    /// Bearer token sent with every request.
    pub token: Option<String>,

    /// Timeout for non-watch requests.
    pub timeout: Duration,
}

/// Cluster API client.
#[derive(Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    config: ClientConfig,
    scheme: Arc<Scheme>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DeleteOptions {
    propagation_policy: PropagationPolicy,
}

#[derive(Deserialize)]
struct RawWatchEvent {
    #[serde(rename = "type")]
    event_type: String,
    object: serde_json::Value,
}

/// Operation being performed, used to classify 409 answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Read,
    Create,
    Write,
}

impl HttpClient {
    /// Builds a client. Fails only if the TLS backend cannot initialize.
    pub fn new(config: ClientConfig, scheme: Arc<Scheme>) -> Result<Self, ApiError> {
        // Watches are long-lived; the timeout is applied per request instead.
        let client = reqwest::Client::builder().build()?;

        Ok(Self {
            client,
            config: ClientConfig {
                base_url: config.base_url.trim_end_matches('/').to_string(),
                ..config
            },
            scheme,
        })
    }

    fn collection_url<T: Resource>(&self, namespace: Option<&str>) -> String {
        let prefix = if T::GROUP.is_empty() {
            format!("{}/api/{}", self.config.base_url, T::VERSION)
        } else {
            format!("{}/apis/{}/{}", self.config.base_url, T::GROUP, T::VERSION)
        };

        match namespace {
            Some(ns) if !ns.is_empty() => format!("{prefix}/namespaces/{ns}/{}", T::PLURAL),
            _ => format!("{prefix}/{}", T::PLURAL),
        }
    }

    fn object_url<T: Resource>(&self, namespace: &str, name: &str) -> String {
        format!("{}/{}", self.collection_url::<T>(Some(namespace)), name)
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.config.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Maps non-success answers to [`ApiError`].
    async fn check<T: Resource>(
        response: Response,
        name: &str,
        op: Op,
    ) -> Result<Response, ApiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        match (status, op) {
            (StatusCode::NOT_FOUND, _) => Err(ApiError::not_found(T::KIND, name)),
            (StatusCode::CONFLICT, Op::Create) => Err(ApiError::already_exists(T::KIND, name)),
            (StatusCode::CONFLICT, _) => Err(ApiError::Conflict(body)),
            _ => {
                error!(status = %status, body = %body, kind = T::KIND, name, "API request failed");
                Err(ApiError::Status {
                    code: status.as_u16(),
                    message: body,
                })
            }
        }
    }

    async fn decode<T: Resource + DeserializeOwned>(
        &self,
        response: Response,
    ) -> Result<T, ApiError> {
        let value: serde_json::Value = response.json().await?;
        Ok(self.scheme.decode(value)?)
    }

    async fn get_object<T: Resource + DeserializeOwned>(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<T, ApiError> {
        let url = self.object_url::<T>(namespace, name);
        debug!(url = %url, "Getting object");

        let response = self
            .request(Method::GET, &url)
            .timeout(self.config.timeout)
            .send()
            .await?;
        let response = Self::check::<T>(response, name, Op::Read).await?;
        self.decode(response).await
    }

    async fn list_objects<T: Resource + DeserializeOwned>(
        &self,
        namespace: Option<&str>,
        selector: &Selector,
    ) -> Result<ObjectList<T>, ApiError> {
        let url = self.collection_url::<T>(namespace);
        debug!(url = %url, selector = %selector, "Listing objects");

        let mut request = self.request(Method::GET, &url).timeout(self.config.timeout);
        if !selector.is_everything() {
            request = request.query(&[("labelSelector", selector.to_string())]);
        }

        let response = Self::check::<T>(request.send().await?, "", Op::Read).await?;
        let value: serde_json::Value = response.json().await?;
        Ok(self.scheme.decode_list(value)?)
    }

    async fn create_object<T: Resource + Serialize + DeserializeOwned>(
        &self,
        namespace: &str,
        obj: &T,
    ) -> Result<T, ApiError> {
        let url = self.collection_url::<T>(Some(namespace));
        let body = self.scheme.encode(obj)?;

        let response = self
            .request(Method::POST, &url)
            .timeout(self.config.timeout)
            .json(&body)
            .send()
            .await?;
        let response = Self::check::<T>(response, &obj.meta().name, Op::Create).await?;
        self.decode(response).await
    }

    async fn update_object<T: Resource + Serialize + DeserializeOwned>(
        &self,
        namespace: &str,
        obj: &T,
    ) -> Result<T, ApiError> {
        let name = &obj.meta().name;
        let url = self.object_url::<T>(namespace, name);
        let body = self.scheme.encode(obj)?;

        let response = self
            .request(Method::PUT, &url)
            .timeout(self.config.timeout)
            .json(&body)
            .send()
            .await?;
        let response = Self::check::<T>(response, name, Op::Write).await?;
        self.decode(response).await
    }

    async fn delete_object<T: Resource>(
        &self,
        namespace: &str,
        name: &str,
        propagation: PropagationPolicy,
    ) -> Result<(), ApiError> {
        let url = self.object_url::<T>(namespace, name);

        let response = self
            .request(Method::DELETE, &url)
            .timeout(self.config.timeout)
            .json(&DeleteOptions {
                propagation_policy: propagation,
            })
            .send()
            .await?;
        Self::check::<T>(response, name, Op::Write).await?;
        Ok(())
    }

    async fn watch_objects<T>(&self, resource_version: &str) -> Result<WatchStream<T>, ApiError>
    where
        T: Resource + DeserializeOwned + Send + 'static,
    {
        let url = self.collection_url::<T>(None);
        debug!(url = %url, resource_version, "Starting watch");

        let response = self
            .request(Method::GET, &url)
            .query(&[
                ("watch", "1"),
                ("resourceVersion", resource_version),
                ("allowWatchBookmarks", "true"),
            ])
            .send()
            .await?;
        let response = Self::check::<T>(response, "", Op::Read).await?;

        Ok(watch_events(response.bytes_stream(), Arc::clone(&self.scheme)))
    }
}

/// Splits a chunked body into newline-delimited watch events.
///
/// A decode or transport failure is yielded once and ends the stream.
fn watch_events<T, S>(body: S, scheme: Arc<Scheme>) -> WatchStream<T>
where
    T: Resource + DeserializeOwned + Send + 'static,
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
{
    futures_util::stream::unfold(
        (body.boxed(), BytesMut::new(), false),
        move |(mut body, mut buffer, finished)| {
            let scheme = Arc::clone(&scheme);
            async move {
                if finished {
                    return None;
                }
                loop {
                    if let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                        let line = buffer.split_to(pos + 1);
                        if line.iter().all(u8::is_ascii_whitespace) {
                            continue;
                        }
                        let event = decode_watch_event::<T>(&scheme, &line);
                        let finished = event.is_err();
                        return Some((event, (body, buffer, finished)));
                    }

                    match body.next().await {
                        Some(Ok(chunk)) => buffer.extend_from_slice(&chunk),
                        Some(Err(e)) => {
                            return Some((Err(ApiError::from(e)), (body, buffer, true)));
                        }
                        None => return None,
                    }
                }
            }
        },
    )
    .boxed()
}

/// Decodes one line of a watch response.
fn decode_watch_event<T: Resource + DeserializeOwned>(
    scheme: &Scheme,
    line: &[u8],
) -> Result<WatchEvent<T>, ApiError> {
    let raw: RawWatchEvent = serde_json::from_slice(line)?;

    match raw.event_type.as_str() {
        "ADDED" => Ok(WatchEvent::Added(scheme.decode(raw.object)?)),
        "MODIFIED" => Ok(WatchEvent::Modified(scheme.decode(raw.object)?)),
        "DELETED" => Ok(WatchEvent::Deleted(scheme.decode(raw.object)?)),
        "BOOKMARK" => Ok(WatchEvent::Bookmark {
            resource_version: raw
                .object
                .pointer("/metadata/resourceVersion")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
        }),
        "ERROR" => Err(ApiError::Status {
            code: raw
                .object
                .get("code")
                .and_then(|v| v.as_u64())
                .and_then(|c| u16::try_from(c).ok())
                .unwrap_or(500),
            message: raw
                .object
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
        }),
        other => Err(ApiError::Decode(format!("unknown watch event type {other:?}"))),
    }
}

#[async_trait]
impl TaskApi for HttpClient {
    async fn get_task(&self, namespace: &str, name: &str) -> Result<Task, ApiError> {
        self.get_object(namespace, name).await
    }

    async fn list_tasks(
        &self,
        namespace: Option<&str>,
        selector: &Selector,
    ) -> Result<Vec<Task>, ApiError> {
        Ok(self.list_objects(namespace, selector).await?.items)
    }

    async fn update_task(&self, namespace: &str, task: &Task) -> Result<Task, ApiError> {
        self.update_object(namespace, task).await
    }
}

#[async_trait]
impl PodApi for HttpClient {
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod, ApiError> {
        self.create_object(namespace, pod).await
    }

    async fn list_pods(&self, namespace: &str, selector: &Selector) -> Result<Vec<Pod>, ApiError> {
        Ok(self.list_objects(Some(namespace), selector).await?.items)
    }

    async fn delete_pod(
        &self,
        namespace: &str,
        name: &str,
        propagation: PropagationPolicy,
    ) -> Result<(), ApiError> {
        self.delete_object::<Pod>(namespace, name, propagation).await
    }
}

#[async_trait]
impl ListWatch<Task> for HttpClient {
    async fn list_all(&self) -> Result<ObjectList<Task>, ApiError> {
        self.list_objects(None, &Selector::everything()).await
    }

    async fn watch(&self, resource_version: &str) -> Result<WatchStream<Task>, ApiError> {
        self.watch_objects(resource_version).await
    }
}

#[async_trait]
impl ListWatch<Pod> for HttpClient {
    async fn list_all(&self) -> Result<ObjectList<Pod>, ApiError> {
        self.list_objects(None, &Selector::everything()).await
    }

    async fn watch(&self, resource_version: &str) -> Result<WatchStream<Pod>, ApiError> {
        self.watch_objects(resource_version).await
    }
}
