//! Kong admin API client.
//!
//! Upstreams are named `<service><dns_name>` and targets `<hostname>:<port>`,
//! so the targets of one host are found by listing the upstreams carrying
//! the DNS suffix and keeping the entries whose address starts with the
//! hostname.  Kong below 0.11 keeps deleted targets in its history with a
//! zero weight, which is why those releases are read through
//! `/targets/active`.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt, TryStreamExt};
use log::{debug, info};
use reqwest::{Client, Method, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::{json, Value};

use super::{Gateway, RetryPolicy};
use crate::error::GatewayError;
use crate::types::{GatewayApiDescriptor, HostIdentity, RegisteredTarget, UpstreamTarget};

const PAGE_SIZE: u32 = 100;

/// Upstreams whose targets are listed at once.
const MAX_CONCURRENT_LISTINGS: usize = 8;

pub struct KongAdminClient {
    client: Client,
    base_url: String,
    retry: RetryPolicy,
    legacy_targets: bool,
}

#[derive(Debug, Deserialize)]
struct NodeInfo {
    version: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
struct Page<T> {
    #[serde(default = "Vec::new", deserialize_with = "list_or_empty_object")]
    data: Vec<T>,
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct KongUpstream {
    name: String,
}

#[derive(Debug, Deserialize)]
struct KongTarget {
    id: String,
    target: String,
    #[serde(default = "default_weight")]
    weight: i64,
}

fn default_weight() -> i64 {
    100
}

/// Older Kong releases encode an empty `data` array as `{}`.
fn list_or_empty_object<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum ListOrObject<T> {
        List(Vec<T>),
        Object(serde_json::Map<String, Value>),
    }

    Ok(match ListOrObject::deserialize(deserializer)? {
        ListOrObject::List(items) => items,
        ListOrObject::Object(_) => Vec::new(),
    })
}

/// Parses the numeric prefix of a Kong version such as `0.10.3` or
/// `2.8.1-enterprise`.
fn parse_version(version: &str) -> Vec<u32> {
    version
        .split(|c: char| !c.is_ascii_digit())
        .take_while(|part| !part.is_empty())
        .filter_map(|part| part.parse().ok())
        .collect()
}

impl KongAdminClient {
    pub fn new(
        admin_url: &str,
        timeout: Duration,
        verify_ssl: bool,
        retry: RetryPolicy,
    ) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(!verify_ssl)
            .build()?;

        Ok(Self {
            client,
            base_url: admin_url.trim_end_matches('/').to_string(),
            retry,
            legacy_targets: false,
        })
    }

    /// Checks that the admin API answers and adapts to its version.
    pub async fn probe(&mut self) -> Result<String, GatewayError> {
        let response = self.execute(Method::GET, "/", None).await?;
        let info: NodeInfo = Self::into_json(response).await?;
        let version = info.version.unwrap_or_else(|| "0.11.0".to_string());
        let parts = parse_version(&version);
        self.legacy_targets = matches!(parts.as_slice(), [0, minor, ..] if *minor < 11);
        info!(
            "Connected to Kong {} at {}{}",
            version,
            self.base_url,
            if self.legacy_targets {
                " (reading active targets)"
            } else {
                ""
            }
        );
        Ok(version)
    }

    fn url(&self, path_or_url: &str) -> String {
        if path_or_url.starts_with("http://") || path_or_url.starts_with("https://") {
            path_or_url.to_string()
        } else {
            format!("{}{}", self.base_url, path_or_url)
        }
    }

    /// Builds an admin URL from raw path segments, percent-encoding each one
    /// so user-supplied names cannot change the route.
    fn endpoint(&self, segments: &[&str]) -> Result<String, GatewayError> {
        let mut url = Url::parse(&self.base_url).map_err(|e| {
            GatewayError::Protocol(format!("invalid admin URL {}: {}", self.base_url, e))
        })?;
        url.path_segments_mut()
            .map_err(|_| {
                GatewayError::Protocol(format!("admin URL {} cannot carry a path", self.base_url))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url.into())
    }

    /// Sends a request with retries.  Any response below 500 is returned to
    /// the caller, which decides what the status means.
    async fn execute(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Response, GatewayError> {
        let url = self.url(path);
        let what = format!("{} {}", method, url);
        self.retry
            .run(&what, || async {
                let mut request = self.client.request(method.clone(), &url);
                if let Some(body) = body {
                    request = request.json(body);
                }
                let response = request.send().await?;
                let status = response.status();
                if status.is_server_error() {
                    let message = response.text().await.unwrap_or_default();
                    return Err(GatewayError::Unavailable {
                        status: status.as_u16(),
                        message,
                    });
                }
                Ok(response)
            })
            .await
    }

    async fn rejected(response: Response) -> GatewayError {
        let status = response.status().as_u16();
        let message = response.text().await.unwrap_or_default();
        GatewayError::Rejected { status, message }
    }

    async fn into_json<T: DeserializeOwned>(response: Response) -> Result<T, GatewayError> {
        if !response.status().is_success() {
            return Err(Self::rejected(response).await);
        }
        Ok(response.json().await?)
    }

    /// Follows `next` links until the listing is exhausted.  A 404 means the
    /// collection does not exist (yet), which reads as empty.
    async fn list_all<T: DeserializeOwned>(&self, path: &str) -> Result<Vec<T>, GatewayError> {
        let mut items = Vec::new();
        let mut next = Some(format!("{}?size={}", path, PAGE_SIZE));
        while let Some(page_url) = next.take() {
            let response = self.execute(Method::GET, &page_url, None).await?;
            if response.status() == StatusCode::NOT_FOUND {
                break;
            }
            let page: Page<T> = Self::into_json(response).await?;
            items.extend(page.data);
            next = page.next.filter(|n| !n.is_empty());
        }
        Ok(items)
    }

    async fn list_targets(&self, upstream: &str) -> Result<Vec<KongTarget>, GatewayError> {
        let path = if self.legacy_targets {
            self.endpoint(&["upstreams", upstream, "targets", "active"])?
        } else {
            self.endpoint(&["upstreams", upstream, "targets"])?
        };
        self.list_all(&path).await
    }

    async fn ensure_upstream(&self, name: &str) -> Result<(), GatewayError> {
        let body = json!({ "name": name });
        let response = self.execute(Method::POST, "/upstreams", Some(&body)).await?;
        match response.status() {
            s if s.is_success() => {
                info!("Created upstream {}", name);
                Ok(())
            }
            StatusCode::CONFLICT => Ok(()),
            _ => Err(Self::rejected(response).await),
        }
    }
}

#[async_trait]
impl Gateway for KongAdminClient {
    async fn list_targets_for_host(
        &self,
        host: &HostIdentity,
    ) -> Result<Vec<RegisteredTarget>, GatewayError> {
        let upstreams: Vec<KongUpstream> = self.list_all("/upstreams").await?;
        let managed = upstreams
            .into_iter()
            .filter(|u| host.manages_upstream(&u.name));

        let per_upstream: Vec<Vec<RegisteredTarget>> = stream::iter(managed)
            .map(|u| async move {
                let targets = self.list_targets(&u.name).await?;
                Ok::<_, GatewayError>(
                    targets
                        .into_iter()
                        .filter(|t| t.weight > 0 && host.owns_address(&t.target))
                        .map(|t| RegisteredTarget {
                            id: t.id,
                            target: UpstreamTarget {
                                upstream: u.name.clone(),
                                address: t.target,
                                owner: host.hostname.clone(),
                            },
                        })
                        .collect::<Vec<_>>(),
                )
            })
            .buffer_unordered(MAX_CONCURRENT_LISTINGS)
            .try_collect()
            .await?;

        Ok(per_upstream.into_iter().flatten().collect())
    }

    async fn add_target(&self, target: &UpstreamTarget) -> Result<(), GatewayError> {
        self.ensure_upstream(&target.upstream).await?;

        let body = json!({ "target": target.address });
        let path = self.endpoint(&["upstreams", target.upstream.as_str(), "targets"])?;
        let response = self.execute(Method::POST, &path, Some(&body)).await?;
        match response.status() {
            s if s.is_success() => Ok(()),
            // Newer Kong refuses duplicate targets.
            StatusCode::CONFLICT => {
                debug!("Target {} already registered", target.key());
                Ok(())
            }
            _ => Err(Self::rejected(response).await),
        }
    }

    async fn remove_target(&self, target: &RegisteredTarget) -> Result<(), GatewayError> {
        let path = self.endpoint(&[
            "upstreams",
            target.target.upstream.as_str(),
            "targets",
            target.id.as_str(),
        ])?;
        let response = self.execute(Method::DELETE, &path, None).await?;
        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Ok(()),
            _ => Err(Self::rejected(response).await),
        }
    }

    async fn list_apis_for_host(
        &self,
        host: &HostIdentity,
    ) -> Result<Vec<GatewayApiDescriptor>, GatewayError> {
        let apis: Vec<GatewayApiDescriptor> = self.list_all("/apis").await?;
        Ok(apis
            .into_iter()
            .filter(|api| host.owns_upstream_url(&api.upstream_url))
            .collect())
    }

    async fn upsert_api(&self, api: &GatewayApiDescriptor) -> Result<bool, GatewayError> {
        let path = self.endpoint(&["apis", api.name.as_str()])?;
        let body = serde_json::to_value(api)
            .map_err(|e| GatewayError::Protocol(format!("cannot encode API {}: {}", api.name, e)))?;

        let response = self.execute(Method::GET, &path, None).await?;
        if response.status() == StatusCode::NOT_FOUND {
            let response = self.execute(Method::POST, "/apis", Some(&body)).await?;
            if !response.status().is_success() {
                return Err(Self::rejected(response).await);
            }
            info!("Created API definition {}", api.name);
            return Ok(true);
        }

        let current: GatewayApiDescriptor = Self::into_json(response).await?;
        if current == *api {
            debug!("API definition {} is up-to-date", api.name);
            return Ok(false);
        }

        let response = self.execute(Method::PATCH, &path, Some(&body)).await?;
        if !response.status().is_success() {
            return Err(Self::rejected(response).await);
        }
        info!("Updated API definition {}", api.name);
        Ok(true)
    }

    async fn remove_api(&self, name: &str) -> Result<(), GatewayError> {
        let path = self.endpoint(&["apis", name])?;
        let response = self.execute(Method::DELETE, &path, None).await?;
        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Ok(()),
            _ => Err(Self::rejected(response).await),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, method, path, path_regex, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        }
    }

    fn client(server: &MockServer) -> KongAdminClient {
        KongAdminClient::new(&server.uri(), Duration::from_secs(5), true, fast_retry()).unwrap()
    }

    fn host() -> HostIdentity {
        HostIdentity::new(".docker.internal", "node1")
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("0.10.3"), vec![0, 10, 3]);
        assert_eq!(parse_version("2.8.1-enterprise"), vec![2, 8, 1]);
        assert!(parse_version("next").is_empty());
    }

    #[test]
    fn test_client_url_normalization() {
        let c = KongAdminClient::new(
            "http://localhost:8001/",
            Duration::from_secs(1),
            true,
            RetryPolicy::default(),
        )
        .unwrap();
        assert_eq!(c.url("/apis"), "http://localhost:8001/apis");
        assert_eq!(
            c.url("http://kong:8001/apis?offset=x"),
            "http://kong:8001/apis?offset=x"
        );
    }

    #[tokio::test]
    async fn test_probe_detects_legacy_targets() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"version": "0.10.3"})))
            .mount(&server)
            .await;

        let mut c = client(&server);
        assert_eq!(c.probe().await.unwrap(), "0.10.3");
        assert!(c.legacy_targets);
    }

    #[tokio::test]
    async fn test_lists_only_owned_targets_across_pages() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/upstreams"))
            .and(query_param("size", "100"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"name": "web.docker.internal"}],
                "next": "/upstreams?offset=p2"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/upstreams"))
            .and(query_param("offset", "p2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"name": "unrelated"}, {"name": "db.docker.internal"}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/upstreams/web.docker.internal/targets"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [
                    {"id": "t1", "target": "node1:32768", "weight": 100},
                    {"id": "t2", "target": "node2:32768", "weight": 100},
                    {"id": "t3", "target": "node1:32769", "weight": 0}
                ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/upstreams/db.docker.internal/targets"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {}, "total": 0})))
            .mount(&server)
            .await;

        let targets = client(&server).list_targets_for_host(&host()).await.unwrap();
        assert_eq!(
            targets,
            vec![RegisteredTarget {
                id: "t1".into(),
                target: UpstreamTarget {
                    upstream: "web.docker.internal".into(),
                    address: "node1:32768".into(),
                    owner: "node1".into(),
                },
            }]
        );
    }

    #[tokio::test]
    async fn test_add_target_tolerates_existing_upstream() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/upstreams"))
            .and(body_json(json!({"name": "web.docker.internal"})))
            .respond_with(ResponseTemplate::new(409))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/upstreams/web.docker.internal/targets"))
            .and(body_json(json!({"target": "node1:32768"})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": "t1"})))
            .expect(1)
            .mount(&server)
            .await;

        let target = UpstreamTarget {
            upstream: "web.docker.internal".into(),
            address: "node1:32768".into(),
            owner: "node1".into(),
        };
        client(&server).add_target(&target).await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_missing_target_is_ok() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/upstreams/web.docker.internal/targets/t1"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let target = RegisteredTarget {
            id: "t1".into(),
            target: UpstreamTarget {
                upstream: "web.docker.internal".into(),
                address: "node1:32768".into(),
                owner: "node1".into(),
            },
        };
        client(&server).remove_target(&target).await.unwrap();
    }

    #[tokio::test]
    async fn test_server_errors_are_retried_then_reported() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let err = client(&server).remove_api("web").await.unwrap_err();
        assert!(matches!(err, GatewayError::Unavailable { status: 503, .. }));
    }

    #[tokio::test]
    async fn test_upsert_api_creates_then_patches_only_on_change() {
        let api = GatewayApiDescriptor {
            name: "web".into(),
            upstream_url: "http://node1:32768".into(),
            uris: vec!["/web".into()],
            strip_uri: true,
            preserve_host: false,
        };

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/apis/web"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/apis"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": "a1"})))
            .expect(1)
            .mount(&server)
            .await;
        assert!(client(&server).upsert_api(&api).await.unwrap());

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/apis/web"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "a1",
                "created_at": 1,
                "name": "web",
                "upstream_url": "http://node1:32768",
                "uris": ["/web"],
                "strip_uri": true,
                "preserve_host": false,
                "retries": 5
            })))
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;
        assert!(!client(&server).upsert_api(&api).await.unwrap());

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/apis/web"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "name": "web",
                "upstream_url": "http://node1:30000",
                "uris": ["/web"]
            })))
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/apis/web"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "a1"})))
            .expect(1)
            .mount(&server)
            .await;
        assert!(client(&server).upsert_api(&api).await.unwrap());
    }

    #[tokio::test]
    async fn test_rejected_api_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/apis/web"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/apis"))
            .respond_with(ResponseTemplate::new(400).set_body_string("uris: invalid"))
            .expect(1)
            .mount(&server)
            .await;

        let api = GatewayApiDescriptor {
            name: "web".into(),
            upstream_url: "http://node1:32768".into(),
            uris: vec!["bad".into()],
            strip_uri: true,
            preserve_host: false,
        };
        let err = client(&server).upsert_api(&api).await.unwrap_err();
        assert!(matches!(err, GatewayError::Rejected { status: 400, .. }));
    }

    #[tokio::test]
    async fn test_missing_apis_endpoint_reads_as_empty() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/apis"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let apis = client(&server).list_apis_for_host(&host()).await.unwrap();
        assert!(apis.is_empty());
    }

    #[test]
    fn test_endpoint_encodes_names() {
        let c = KongAdminClient::new(
            "http://localhost:8001/admin/",
            Duration::from_secs(1),
            true,
            RetryPolicy::default(),
        )
        .unwrap();
        assert_eq!(
            c.endpoint(&["apis", "team/site?x=1"]).unwrap(),
            "http://localhost:8001/admin/apis/team%2Fsite%3Fx=1"
        );
        assert_eq!(
            c.endpoint(&["upstreams", "web.docker.internal", "targets"]).unwrap(),
            "http://localhost:8001/admin/upstreams/web.docker.internal/targets"
        );
    }

    #[tokio::test]
    async fn test_api_names_stay_in_one_path_segment() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/apis/team%2Fsite%20v2"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        client(&server).remove_api("team/site v2").await.unwrap();
    }

    #[tokio::test]
    async fn test_target_listing_is_bounded() {
        let server = MockServer::start().await;
        let names: Vec<Value> = (0..20)
            .map(|i| json!({ "name": format!("svc{}.docker.internal", i) }))
            .collect();
        Mock::given(method("GET"))
            .and(path("/upstreams"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": names })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/upstreams/[^/]+/targets$"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({
                        "data": [{"id": "t", "target": "node1:32768", "weight": 100}]
                    }))
                    .set_delay(Duration::from_millis(100)),
            )
            .expect(20)
            .mount(&server)
            .await;

        let started = std::time::Instant::now();
        let targets = client(&server).list_targets_for_host(&host()).await.unwrap();
        assert_eq!(targets.len(), 20);
        // 20 listings at most 8 at a time take at least three rounds.
        assert!(started.elapsed() >= Duration::from_millis(300));
    }
}
