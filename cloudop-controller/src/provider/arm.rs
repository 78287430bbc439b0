//! ARM-style REST provider.

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, LOCATION};
use reqwest::{Client, Method, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::{CloudProvider, Credentials, Poll, ProviderError, RemoteResource, ResourceAddress, Result};

const SUBSCRIPTION_API_VERSION: &str = "2020-01-01";
const ASYNC_OPERATION: &str = "azure-asyncoperation";

/// How a pending operation reports progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
enum PollStyle {
    /// Status document with a `status` field.
    AsyncOperation,
    /// 202 while running, 2xx once done.
    Location,
}

/// What gets persisted as the continuation token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct PendingOperation {
    url: String,
    style: PollStyle,
    #[serde(default)]
    delete: bool,
}

impl PendingOperation {
    fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| ProviderError::InvalidToken(e.to_string()))
    }

    fn decode(token: &[u8]) -> Result<Self> {
        serde_json::from_slice(token).map_err(|e| ProviderError::InvalidToken(e.to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct OperationStatus {
    status: String,
    #[serde(default)]
    error: Option<ErrorDetail>,
}

/// Provider speaking the ARM REST dialect with a static bearer token.
pub struct ArmProvider {
    http: Client,
    endpoint: String,
    token: String,
    verified: Mutex<HashSet<String>>,
}

impl ArmProvider {
    pub fn new(endpoint: impl Into<String>, token: impl Into<String>) -> Result<Self> {
        let http = Client::builder().build()?;
        Ok(Self {
            http,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            token: token.into(),
            verified: Mutex::new(HashSet::new()),
        })
    }

    fn url(&self, addr: &ResourceAddress) -> String {
        format!("{}{}?api-version={}", self.endpoint, addr.id, addr.api_version)
    }

    async fn send(&self, method: Method, url: &str, body: Option<&Value>) -> Result<Response> {
        let mut request = self.http.request(method.clone(), url).bearer_auth(&self.token);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await?;
        debug!(%method, url, status = %response.status(), "Provider request");
        Ok(response)
    }

    fn is_verified(&self, subscription_id: &str) -> bool {
        self.verified
            .lock()
            .map(|set| set.contains(subscription_id))
            .unwrap_or(false)
    }

    fn mark_verified(&self, subscription_id: &str) {
        if let Ok(mut set) = self.verified.lock() {
            set.insert(subscription_id.to_string());
        }
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn pending_from_headers(headers: &HeaderMap, delete: bool) -> Option<PendingOperation> {
    if let Some(url) = header_value(headers, ASYNC_OPERATION) {
        return Some(PendingOperation {
            url,
            style: PollStyle::AsyncOperation,
            delete,
        });
    }
    header_value(headers, LOCATION.as_str()).map(|url| PendingOperation {
        url,
        style: PollStyle::Location,
        delete,
    })
}

async fn error_from_response(response: Response, scope: &str) -> ProviderError {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    let message = match serde_json::from_str::<ErrorBody>(&text) {
        Ok(body) if !body.error.code.is_empty() => {
            format!("{}: {}", body.error.code, body.error.message)
        }
        Ok(body) => body.error.message,
        Err(_) if text.is_empty() => status.to_string(),
        Err(_) => text,
    };
    classify(status, scope, message)
}

fn classify(status: StatusCode, scope: &str, message: String) -> ProviderError {
    match status {
        StatusCode::NOT_FOUND => ProviderError::NotFound(message),
        StatusCode::CONFLICT => ProviderError::Conflict(message),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderError::Unauthorized {
            scope: scope.to_string(),
            message,
        },
        StatusCode::TOO_MANY_REQUESTS => ProviderError::Throttled(message),
        s if s.is_server_error() => ProviderError::Transport(format!("{}: {}", s, message)),
        s => ProviderError::Operation {
            status: s.as_u16(),
            message,
        },
    }
}

#[async_trait]
impl CloudProvider for ArmProvider {
    async fn authorize(&self, subscription_id: &str) -> Result<Credentials> {
        let creds = Credentials {
            subscription_id: subscription_id.to_string(),
        };
        if self.is_verified(subscription_id) {
            return Ok(creds);
        }

        let url = format!(
            "{}/subscriptions/{}?api-version={}",
            self.endpoint, subscription_id, SUBSCRIPTION_API_VERSION
        );
        let response = self.send(Method::GET, &url, None).await?;
        if !response.status().is_success() {
            return Err(match error_from_response(response, subscription_id).await {
                ProviderError::NotFound(message) => ProviderError::Unauthorized {
                    scope: subscription_id.to_string(),
                    message,
                },
                other => other,
            });
        }

        self.mark_verified(subscription_id);
        Ok(creds)
    }

    async fn get(&self, creds: &Credentials, addr: &ResourceAddress) -> Result<Option<RemoteResource>> {
        let response = self.send(Method::GET, &self.url(addr), None).await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => Ok(Some(response.json().await?)),
            _ => Err(error_from_response(response, &creds.subscription_id).await),
        }
    }

    async fn begin_put(&self, creds: &Credentials, addr: &ResourceAddress, body: Value) -> Result<Poll> {
        let response = self.send(Method::PUT, &self.url(addr), Some(&body)).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(error_from_response(response, &creds.subscription_id).await);
        }
        if status == StatusCode::OK {
            return Ok(Poll::Done);
        }
        match pending_from_headers(response.headers(), false) {
            Some(op) => Ok(Poll::Pending(op.encode()?)),
            None => Ok(Poll::Done),
        }
    }

    async fn begin_delete(&self, creds: &Credentials, addr: &ResourceAddress) -> Result<Poll> {
        let response = self.send(Method::DELETE, &self.url(addr), None).await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::NO_CONTENT {
            return Ok(Poll::Done);
        }
        if !status.is_success() {
            return Err(error_from_response(response, &creds.subscription_id).await);
        }
        match pending_from_headers(response.headers(), true) {
            Some(op) if status == StatusCode::ACCEPTED => Ok(Poll::Pending(op.encode()?)),
            _ => Ok(Poll::Done),
        }
    }

    async fn poll(&self, creds: &Credentials, token: &[u8]) -> Result<Poll> {
        let op = PendingOperation::decode(token)?;
        let response = self.send(Method::GET, &op.url, None).await?;
        let status = response.status();

        match op.style {
            PollStyle::AsyncOperation => {
                if !status.is_success() {
                    return Err(error_from_response(response, &creds.subscription_id).await);
                }
                let body: OperationStatus = response.json().await?;
                match body.status.to_ascii_lowercase().as_str() {
                    "succeeded" => Ok(Poll::Done),
                    "failed" | "canceled" | "cancelled" => Err(ProviderError::Operation {
                        status: status.as_u16(),
                        message: body
                            .error
                            .map(|e| format!("{}: {}", e.code, e.message))
                            .unwrap_or(body.status),
                    }),
                    _ => Ok(Poll::Pending(token.to_vec())),
                }
            }
            PollStyle::Location => match status {
                StatusCode::ACCEPTED => Ok(Poll::Pending(token.to_vec())),
                StatusCode::NOT_FOUND if op.delete => Ok(Poll::Done),
                s if s.is_success() => Ok(Poll::Done),
                _ => Err(error_from_response(response, &creds.subscription_id).await),
            },
        }
    }

    async fn invoke(&self, creds: &Credentials, addr: &ResourceAddress, action: &str) -> Result<Value> {
        let url = format!(
            "{}{}/{}?api-version={}",
            self.endpoint, addr.id, action, addr.api_version
        );
        let response = self.send(Method::POST, &url, None).await?;
        if !response.status().is_success() {
            return Err(error_from_response(response, &creds.subscription_id).await);
        }
        Ok(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_async_operation_header_wins_over_location() {
        let mut headers = HeaderMap::new();
        headers.insert(LOCATION, HeaderValue::from_static("https://mgmt/loc"));
        headers.insert(ASYNC_OPERATION, HeaderValue::from_static("https://mgmt/op"));

        let op = pending_from_headers(&headers, false).unwrap();
        assert_eq!(op.url, "https://mgmt/op");
        assert_eq!(op.style, PollStyle::AsyncOperation);
    }

    #[test]
    fn test_token_round_trip() {
        let op = PendingOperation {
            url: "https://mgmt/op/1".into(),
            style: PollStyle::Location,
            delete: true,
        };
        let token = op.encode().unwrap();
        assert_eq!(PendingOperation::decode(&token).unwrap(), op);
        assert!(matches!(
            PendingOperation::decode(b"garbage"),
            Err(ProviderError::InvalidToken(_))
        ));
    }

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            classify(StatusCode::CONFLICT, "sub", "busy".into()),
            ProviderError::Conflict(_)
        ));
        assert!(matches!(
            classify(StatusCode::FORBIDDEN, "sub", "no".into()),
            ProviderError::Unauthorized { .. }
        ));
        assert!(classify(StatusCode::TOO_MANY_REQUESTS, "sub", "later".into()).is_transient());
        assert!(classify(StatusCode::BAD_GATEWAY, "sub", "oops".into()).is_transient());
        assert!(matches!(
            classify(StatusCode::BAD_REQUEST, "sub", "bad sku".into()),
            ProviderError::Operation { status: 400, .. }
        ));
    }
}
