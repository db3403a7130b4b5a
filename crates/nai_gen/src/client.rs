use bytes::Bytes;
use futures::future::join_all;
use reqwest::{header, Client, StatusCode};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::{future::Future, time::Duration};

use crate::{request::GenerateRequest, GenError, Result};

/// Budget each request of a batch gets per member of the batch
pub const BATCH_TIMEOUT_UNIT: Duration = Duration::from_secs(30);

/// The client used to talk to a generation server
#[derive(Debug, Clone)]
pub struct GenClient {
    api: Client,
    base_url: String,
    gen_url: String,
}

impl GenClient {
    /// `host` is either a bare `host:port`, which gets `http://` and `/gen` added,
    /// or a full URL that is used verbatim for generation requests.
    pub fn new(host: impl AsRef<str>) -> Result<Self> {
        let host = host.as_ref().trim_end_matches('/');
        let (base_url, gen_url) = if host.starts_with("http") {
            let base = host.strip_suffix("/gen").unwrap_or(host);
            (base.to_string(), host.to_string())
        } else {
            (format!("http://{host}"), format!("http://{host}/gen"))
        };

        let mut headers = header::HeaderMap::new();
        headers.insert(header::ACCEPT, "image/*, application/json".try_into()?);

        let api = Client::builder().default_headers(headers).build()?;

        Ok(Self {
            api,
            base_url,
            gen_url,
        })
    }

    /// Where generation requests are posted to
    pub fn gen_url(&self) -> &str {
        &self.gen_url
    }

    /// Send a single generation request. The whole `timeout` applies to this one call.
    /// Anything but an `image/*` response is turned into [`GenError::Response`]
    /// carrying the body and the status code.
    pub async fn send(
        &self,
        request: &GenerateRequest,
        sub_folder: &str,
        timeout: Duration,
    ) -> Result<Bytes> {
        request.validate()?;
        let payload = payload(request, sub_folder)?;

        let res = self
            .api
            .post(&self.gen_url)
            .timeout(timeout)
            .json(&payload)
            .send()
            .await
            .map_err(|e| GenError::from_transport(e, timeout))?;

        let status = res.status();
        let is_image = res
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("image"));

        if is_image {
            res.bytes()
                .await
                .map_err(|e| GenError::from_transport(e, timeout))
        } else {
            let message = res
                .text()
                .await
                .map_err(|e| GenError::from_transport(e, timeout))?;
            Err(GenError::Response { status, message })
        }
    }

    /// Fire `count` copies of the request at once and wait for all of them.
    /// Every request gets `count` times [`BATCH_TIMEOUT_UNIT`], so the deadline is
    /// loose rather than split between them. Results come back in submission
    /// order and a failed slot never cancels its siblings.
    pub async fn run_batch(
        &self,
        request: &GenerateRequest,
        sub_folder: &str,
        count: usize,
    ) -> Vec<Result<Bytes>> {
        let timeout = batch_timeout(count);
        tracing::debug!(count, ?timeout, url = %self.gen_url, "dispatching batch");

        fan_out(count, |_| self.send(request, sub_folder, timeout)).await
    }

    /// Log in against the server's password endpoint. Returns the `status` of the
    /// response on success and `None` when the server refuses.
    pub async fn login(&self, password: &str) -> Result<Option<Value>> {
        let res = self
            .api
            .post(format!("{}/login", self.base_url))
            .query(&[("password", password)])
            .send()
            .await?;

        match res.status() {
            StatusCode::OK => Ok(Some(res.json::<LoginResponse>().await?.status)),
            code => {
                tracing::warn!(%code, "login refused");
                Ok(None)
            }
        }
    }
}

pub fn batch_timeout(count: usize) -> Duration {
    BATCH_TIMEOUT_UNIT.saturating_mul(u32::try_from(count).unwrap_or(u32::MAX))
}

// polls every slot concurrently, output index matches the slot index
async fn fan_out<F, Fut>(count: usize, slot: F) -> Vec<Fut::Output>
where
    F: FnMut(usize) -> Fut,
    Fut: Future,
{
    join_all((0..count).map(slot)).await
}

#[derive(Deserialize)]
struct LoginResponse {
    status: Value,
}

// extra_infos travels as a JSON string holding an object
fn payload(request: &GenerateRequest, sub_folder: &str) -> Result<Value> {
    let mut extra = match serde_json::from_str::<Value>(request.extra_infos()) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    };
    if !sub_folder.is_empty() {
        extra.insert("save_folder".into(), Value::String(sub_folder.into()));
    }

    let mut payload = serde_json::to_value(request)?;
    payload["extra_infos"] = Value::String(serde_json::to_string(&extra)?);

    Ok(payload)
}

#[cfg(test)]
mod tests {
    use axum::{
        extract::{Query, State},
        http::{header as axum_header, StatusCode as AxumStatus},
        response::{IntoResponse, Response},
        routing::post,
        Json, Router,
    };
    use serde_json::json;
    use std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
    };
    use tokio::net::TcpListener;

    use super::*;

    async fn serve(app: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        addr.to_string()
    }

    fn image(body: Vec<u8>) -> Response {
        ([(axum_header::CONTENT_TYPE, "image/webp")], body).into_response()
    }

    async fn echo(Json(body): Json<Value>) -> Response {
        image(serde_json::to_vec(&body).unwrap())
    }

    async fn flaky(State(hits): State<Arc<AtomicUsize>>) -> Response {
        if hits.fetch_add(1, Ordering::SeqCst) == 0 {
            (AxumStatus::INTERNAL_SERVER_ERROR, "out of memory").into_response()
        } else {
            image(vec![0x52, 0x49, 0x46, 0x46])
        }
    }

    #[test]
    fn host_normalization() {
        let client = GenClient::new("127.0.0.1:7000").unwrap();
        assert_eq!(client.gen_url(), "http://127.0.0.1:7000/gen");
        assert_eq!(client.base_url, "http://127.0.0.1:7000");

        let client = GenClient::new("https://gen.example.com/gen").unwrap();
        assert_eq!(client.gen_url(), "https://gen.example.com/gen");
        assert_eq!(client.base_url, "https://gen.example.com");
    }

    #[test]
    fn batch_timeout_scales_with_count() {
        assert_eq!(batch_timeout(1), Duration::from_secs(30));
        assert_eq!(batch_timeout(4), Duration::from_secs(120));
    }

    #[test]
    fn payload_merges_extra_infos() {
        let request = GenerateRequest::new("x").update_extra_infos(r#"{"tag":"a"}"#);
        let value = payload(&request, "cats").unwrap();
        let extra: Value = serde_json::from_str(value["extra_infos"].as_str().unwrap()).unwrap();
        assert_eq!(extra, json!({"tag": "a", "save_folder": "cats"}));

        let value = payload(&GenerateRequest::new("x"), "").unwrap();
        assert_eq!(value["extra_infos"], json!("{}"));
    }

    #[tokio::test]
    async fn image_response_is_returned_verbatim() {
        let host = serve(Router::new().route("/gen", post(|| async { image(vec![1, 2, 3]) }))).await;
        let client = GenClient::new(host).unwrap();

        let bytes = client
            .send(&GenerateRequest::new("1girl"), "", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(&bytes[..], &[1, 2, 3]);
    }

    #[tokio::test]
    async fn request_body_carries_sub_folder() {
        let host = serve(Router::new().route("/gen", post(echo))).await;
        let client = GenClient::new(host).unwrap();
        let request = GenerateRequest::new("1girl").update_seed(42);

        let bytes = client.send(&request, "portraits", Duration::from_secs(5)).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["prompt"], json!("1girl"));
        assert_eq!(body["seed"], json!(42));
        assert_eq!(body["sampler"], json!("k_euler"));
        assert_eq!(body["extra_infos"], json!(r#"{"save_folder":"portraits"}"#));
    }

    #[tokio::test]
    async fn full_url_is_used_verbatim() {
        let addr = serve(Router::new().route("/custom", post(echo))).await;
        let client = GenClient::new(format!("http://{addr}/custom")).unwrap();

        let result = client
            .send(&GenerateRequest::new("x"), "", Duration::from_secs(5))
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn non_image_response_is_an_error() {
        let app = Router::new().route(
            "/gen",
            post(|| async {
                (
                    AxumStatus::UNPROCESSABLE_ENTITY,
                    Json(json!({"detail": "width must be a multiple of 64"})),
                )
            }),
        );
        let client = GenClient::new(serve(app).await).unwrap();

        let err = client
            .send(&GenerateRequest::new("x"), "", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(StatusCode::UNPROCESSABLE_ENTITY));
        match err {
            GenError::Response { message, .. } => assert!(message.contains("multiple of 64")),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn slow_server_times_out() {
        let app = Router::new().route(
            "/gen",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                image(vec![1])
            }),
        );
        let client = GenClient::new(serve(app).await).unwrap();

        let err = client
            .send(&GenerateRequest::new("x"), "", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, GenError::Timeout(d) if d == Duration::from_millis(100)));
        assert_eq!(err.status(), None);
    }

    #[tokio::test]
    async fn unreachable_server_is_a_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = GenClient::new(addr.to_string()).unwrap();
        let err = client
            .send(&GenerateRequest::new("x"), "", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, GenError::ReqwestError(_)));
        assert_eq!(err.status(), None);
    }

    #[tokio::test]
    async fn invalid_request_never_leaves_the_process() {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route("/gen", post(flaky))
            .with_state(hits.clone());
        let client = GenClient::new(serve(app).await).unwrap();

        let err = client
            .send(&GenerateRequest::new("x").update_steps(0), "", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, GenError::InvalidParameter(_)));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn batch_isolates_failures() {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route("/gen", post(flaky))
            .with_state(hits.clone());
        let client = GenClient::new(serve(app).await).unwrap();

        let results = client.run_batch(&GenerateRequest::new("x"), "", 3).await;
        assert_eq!(results.len(), 3);
        assert_eq!(hits.load(Ordering::SeqCst), 3);

        let failures: Vec<_> = results.iter().filter_map(|r| r.as_ref().err()).collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].status(), Some(StatusCode::INTERNAL_SERVER_ERROR));
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 2);
    }

    #[tokio::test]
    async fn slots_keep_submission_order() {
        // later slots finish first
        let order = fan_out(4, |i| async move {
            tokio::time::sleep(Duration::from_millis(20 * (4 - i) as u64)).await;
            i
        })
        .await;
        assert_eq!(order, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn empty_batch_sends_nothing() {
        let client = GenClient::new("127.0.0.1:1").unwrap();
        assert!(client.run_batch(&GenerateRequest::new("x"), "", 0).await.is_empty());
    }

    #[tokio::test]
    async fn login_returns_status() {
        let app = Router::new().route(
            "/login",
            post(|Query(q): Query<HashMap<String, String>>| async move {
                if q.get("password").map(String::as_str) == Some("hunter2") {
                    Json(json!({"status": "ok"})).into_response()
                } else {
                    AxumStatus::UNAUTHORIZED.into_response()
                }
            }),
        );
        let client = GenClient::new(serve(app).await).unwrap();

        assert_eq!(client.login("hunter2").await.unwrap(), Some(json!("ok")));
        assert_eq!(client.login("wrong").await.unwrap(), None);
    }
}
