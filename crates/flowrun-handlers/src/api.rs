//! Api handler: drives an HTTP request from resolved params. The wire client
//! sits behind [`HttpRequester`]; pass your own when constructing the handler,
//! or use the reqwest-backed default.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use flowrun_core::HandlerError;
use flowrun_core::handler::{BlockHandler, ExecutionOutcome, HandlerContext};
use flowrun_core::output::{ApiOutput, NormalizedOutput};
use flowrun_core::workflow::{Block, BlockKind};

const DEFAULT_TIMEOUT_MS: u64 = 15_000;

/// Error from HTTP request operations.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct HttpRequestError(pub String);

/// One outbound request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
    pub timeout: Duration,
}

/// One response, body kept raw.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
}

/// HTTP client abstraction. Implement and pass when constructing the handler.
#[async_trait]
pub trait HttpRequester: Send + Sync {
    async fn request(&self, request: HttpRequest) -> Result<HttpResponse, HttpRequestError>;
}

/// Default requester backed by reqwest with rustls.
pub struct ReqwestRequester {
    client: reqwest::Client,
}

impl Default for ReqwestRequester {
    fn default() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl HttpRequester for ReqwestRequester {
    async fn request(&self, request: HttpRequest) -> Result<HttpResponse, HttpRequestError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|_| HttpRequestError(format!("invalid method: {}", request.method)))?;
        let mut builder = self
            .client
            .request(method, &request.url)
            .timeout(request.timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| HttpRequestError(e.to_string()))?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.to_string(), v.to_string()))
            })
            .collect();
        let body = response
            .text()
            .await
            .map_err(|e| HttpRequestError(e.to_string()))?;
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

/// Executes `api` blocks: `url` (required), `method` (default GET), `headers`
/// (object), `body`, `timeoutMs`. JSON bodies parse into `data`; non-2xx
/// responses become handler errors carrying the status.
pub struct ApiBlockHandler {
    requester: Arc<dyn HttpRequester>,
}

impl ApiBlockHandler {
    pub fn new(requester: Arc<dyn HttpRequester>) -> Self {
        Self { requester }
    }
}

impl Default for ApiBlockHandler {
    fn default() -> Self {
        Self::new(Arc::new(ReqwestRequester::default()))
    }
}

#[async_trait]
impl BlockHandler for ApiBlockHandler {
    fn can_handle(&self, block: &Block) -> bool {
        block.kind == BlockKind::Api
    }

    async fn execute(
        &self,
        block: &Block,
        inputs: Map<String, Value>,
        _ctx: &HandlerContext,
    ) -> Result<ExecutionOutcome, HandlerError> {
        let url = inputs
            .get("url")
            .and_then(Value::as_str)
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| HandlerError::new(format!("api block {} has no url", block.id)))?
            .trim()
            .to_string();
        let method = inputs
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("GET")
            .to_uppercase();
        let headers = match inputs.get("headers") {
            Some(Value::Object(map)) => map
                .iter()
                .map(|(k, v)| {
                    let value = v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string());
                    (k.clone(), value)
                })
                .collect(),
            _ => Vec::new(),
        };
        let timeout = inputs
            .get("timeoutMs")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_TIMEOUT_MS);

        debug!(block = %block.id, %method, %url, "api request");
        let response = self
            .requester
            .request(HttpRequest {
                method,
                url,
                headers,
                body: inputs.get("body").cloned(),
                timeout: Duration::from_millis(timeout),
            })
            .await
            .map_err(|e| HandlerError::new(e.0))?;

        if response.status >= 400 {
            return Err(HandlerError::with_status(
                format!("request failed with status {}", response.status),
                response.status,
            ));
        }

        let data = serde_json::from_str(&response.body)
            .unwrap_or(Value::String(response.body.clone()));
        Ok(ExecutionOutcome::Output(NormalizedOutput::Api(ApiOutput {
            data,
            status: response.status,
            headers: response.headers,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct FixedResponse(u16, &'static str);

    #[async_trait]
    impl HttpRequester for FixedResponse {
        async fn request(&self, request: HttpRequest) -> Result<HttpResponse, HttpRequestError> {
            assert_eq!(request.method, "GET");
            Ok(HttpResponse {
                status: self.0,
                headers: HashMap::from([("content-type".to_string(), "application/json".to_string())]),
                body: self.1.to_string(),
            })
        }
    }

    fn inputs(url: &str) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("url".to_string(), json!(url));
        map
    }

    #[tokio::test]
    async fn json_body_parses_into_data() {
        let handler = ApiBlockHandler::new(Arc::new(FixedResponse(200, r#"{"users": [1, 2]}"#)));
        let block = Block::new("api1", BlockKind::Api);
        let out = handler
            .execute(&block, inputs("https://api.test/users"), &HandlerContext::standalone("wf", "api1"))
            .await
            .unwrap();
        match out {
            ExecutionOutcome::Output(NormalizedOutput::Api(api)) => {
                assert_eq!(api.status, 200);
                assert_eq!(api.data, json!({"users": [1, 2]}));
                assert!(api.headers.contains_key("content-type"));
            }
            _ => panic!("expected api output"),
        }
    }

    #[tokio::test]
    async fn non_2xx_is_a_handler_error_with_status() {
        let handler = ApiBlockHandler::new(Arc::new(FixedResponse(404, "not found")));
        let block = Block::new("api1", BlockKind::Api);
        let err = handler
            .execute(&block, inputs("https://api.test/missing"), &HandlerContext::standalone("wf", "api1"))
            .await
            .unwrap_err();
        assert_eq!(err.status, Some(404));
    }

    #[tokio::test]
    async fn missing_url_is_an_error() {
        let handler = ApiBlockHandler::new(Arc::new(FixedResponse(200, "{}")));
        let block = Block::new("api1", BlockKind::Api);
        let err = handler
            .execute(&block, Map::new(), &HandlerContext::standalone("wf", "api1"))
            .await
            .unwrap_err();
        assert!(err.message.contains("no url"));
    }
}
