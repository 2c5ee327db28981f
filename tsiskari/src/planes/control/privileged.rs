use crate::domain::InvokeRequest;
use crate::ports::Backend;
use serde_json::{Value, json};
use shared::{Error, Result};
use std::sync::Arc;
use tracing::{error, info};

pub const DEACTIVATE_ACCOUNT: &str = "deactivate-account";

/// Serverless functions that act on the caller's account. They need the
/// session token and are never retried.
#[derive(Clone)]
pub struct PrivilegedCalls {
    backend: Arc<dyn Backend>,
}

impl PrivilegedCalls {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    pub async fn call(&self, function: &str, body: Value, token: Option<&str>) -> Result<Value> {
        let token = match token.map(str::trim) {
            Some(token) if !token.is_empty() => token,
            _ => return Err(surface(function, Error::Auth("no session token".into()))),
        };

        let request = InvokeRequest::post(function, body).with_token(token);
        let response = self
            .backend
            .invoke(request)
            .await
            .map_err(|e| surface(function, e))?;

        match response.status {
            200..=299 => {
                info!(function, status = response.status, "privileged call succeeded");
                Ok(response.body)
            }
            401 | 403 => Err(surface(
                function,
                Error::Auth(format!("rejected with status {}", response.status)),
            )),
            status => Err(surface(
                function,
                Error::Internal(format!("{function} returned status {status}: {}", response.body)),
            )),
        }
    }

    pub async fn deactivate_account(&self, token: Option<&str>) -> Result<Value> {
        self.call(DEACTIVATE_ACCOUNT, json!({}), token).await
    }
}

impl std::fmt::Debug for PrivilegedCalls {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivilegedCalls").finish_non_exhaustive()
    }
}

fn surface(function: &str, err: Error) -> Error {
    error!(
        function,
        error = %err,
        message = err.user_message().unwrap_or_default(),
        "privileged call failed"
    );
    err
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ConflictTarget, InvokeResponse, Query, QueryResult, Row};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Answers every invoke with a fixed status and records the requests.
    struct FunctionStub {
        status: u16,
        seen: Mutex<Vec<InvokeRequest>>,
    }

    impl FunctionStub {
        fn new(status: u16) -> Arc<Self> {
            Arc::new(Self {
                status,
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Backend for FunctionStub {
        async fn query(&self, _: &str, _: &Query) -> Result<QueryResult> {
            Err(Error::Internal("unused".into()))
        }

        async fn insert(&self, _: &str, _: Row) -> Result<Row> {
            Err(Error::Internal("unused".into()))
        }

        async fn upsert(&self, _: &str, _: Row, _: &ConflictTarget) -> Result<Row> {
            Err(Error::Internal("unused".into()))
        }

        async fn delete(&self, _: &str, _: &Query) -> Result<usize> {
            Err(Error::Internal("unused".into()))
        }

        async fn invoke(&self, request: InvokeRequest) -> Result<InvokeResponse> {
            self.seen.lock().unwrap().push(request);
            Ok(InvokeResponse::new(self.status, json!({ "ok": self.status < 300 })))
        }
    }

    #[tokio::test]
    async fn test_missing_token_never_reaches_backend() {
        let stub = FunctionStub::new(200);
        let calls = PrivilegedCalls::new(stub.clone());

        for token in [None, Some(""), Some("   ")] {
            let err = calls.deactivate_account(token).await.unwrap_err();
            assert!(matches!(err, Error::Auth(_)));
            assert!(err.user_message().is_some());
        }
        assert!(stub.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_token_is_forwarded() {
        let stub = FunctionStub::new(200);
        let calls = PrivilegedCalls::new(stub.clone());

        let body = calls.deactivate_account(Some("session-1")).await.unwrap();
        assert_eq!(body, json!({ "ok": true }));

        let seen = stub.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].function, DEACTIVATE_ACCOUNT);
        assert_eq!(seen[0].auth_token.as_deref(), Some("session-1"));
    }

    #[tokio::test]
    async fn test_rejections_are_surfaced_once() {
        let forbidden = FunctionStub::new(403);
        let err = PrivilegedCalls::new(forbidden.clone())
            .deactivate_account(Some("stale"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
        assert_eq!(forbidden.seen.lock().unwrap().len(), 1);

        let broken = FunctionStub::new(500);
        let err = PrivilegedCalls::new(broken.clone())
            .call("export-data", json!({}), Some("t"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
        assert_eq!(broken.seen.lock().unwrap().len(), 1);
    }
}
