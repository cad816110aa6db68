//! HTTP host run inside each supervised service process.
//!
//! Routes:
//! - `GET /health`: liveness JSON polled by the supervisor
//! - `GET /events`: push stream of operation events
//! - `POST /operations/{name}`: run a registered operation, publish `<name>_completed`
//! - `GET /`: plain-text summary

pub mod operations;

pub use operations::{Operation, OperationContext, OperationRegistry};

use crate::broadcaster::EventBroadcaster;
use crate::health::{HealthReport, HealthState};
use crate::{Event, HubError};
use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::convert::Infallible;
use std::future::Future;
use std::path::Path as FsPath;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::TcpListener;
use tokio_stream::StreamExt;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthStatus {
    ServiceAccount,
    NotAuthenticated,
}

impl AuthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthStatus::ServiceAccount => "service_account",
            AuthStatus::NotAuthenticated => "not_authenticated",
        }
    }
}

/// The fields of a service-account key file this host cares about
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ServiceAccount {
    pub client_email: String,
    #[serde(default)]
    pub project_id: Option<String>,
}

impl ServiceAccount {
    pub fn load(path: &FsPath) -> Result<Self, HubError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            HubError::ConfigurationError(format!("cannot read {}: {e}", path.display()))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            HubError::ConfigurationError(format!("invalid service account {}: {e}", path.display()))
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OperationError {
    #[error("unknown operation: {0}")]
    NotFound(String),
    #[error("{0} requires credentials, service is not authenticated")]
    Unauthenticated(String),
    #[error("invalid request body: {0}")]
    InvalidInput(String),
    #[error("{name} failed: {source}")]
    Failed {
        name: String,
        #[source]
        source: anyhow::Error,
    },
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

impl IntoResponse for OperationError {
    fn into_response(self) -> Response {
        let status = match &self {
            OperationError::NotFound(_) => StatusCode::NOT_FOUND,
            OperationError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            OperationError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            OperationError::Failed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorResponse {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

pub struct ServiceHost {
    name: String,
    description: String,
    broadcaster: EventBroadcaster,
    operations: OperationRegistry,
    credentials: Option<Arc<ServiceAccount>>,
    event_seq: AtomicU64,
}

impl ServiceHost {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        operations: OperationRegistry,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            broadcaster: EventBroadcaster::default(),
            operations,
            credentials: None,
            event_seq: AtomicU64::new(1),
        }
    }

    /// Load the optional service-account file. A missing or unreadable file
    /// leaves the host running unauthenticated.
    pub fn with_credentials_from(mut self, path: Option<&FsPath>) -> Self {
        self.credentials = match path {
            None => None,
            Some(path) => match ServiceAccount::load(path) {
                Ok(account) => {
                    info!(service = %self.name, client_email = %account.client_email, "Loaded service account");
                    Some(Arc::new(account))
                }
                Err(e) => {
                    warn!(service = %self.name, error = %e, "Running without credentials");
                    None
                }
            },
        };
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn broadcaster(&self) -> &EventBroadcaster {
        &self.broadcaster
    }

    pub fn auth_status(&self) -> AuthStatus {
        if self.credentials.is_some() {
            AuthStatus::ServiceAccount
        } else {
            AuthStatus::NotAuthenticated
        }
    }

    pub fn health(&self) -> HealthReport {
        HealthReport {
            status: HealthState::Healthy,
            service: self.name.clone(),
            timestamp: Utc::now().to_rfc3339(),
            auth_status: self.auth_status().as_str().to_string(),
            connections: self.broadcaster.subscriber_count(),
        }
    }

    /// Run `name` and publish `<name>_completed` with its result
    pub async fn invoke(&self, name: &str, input: Value) -> Result<Value, OperationError> {
        let operation = self
            .operations
            .get(name)
            .ok_or_else(|| OperationError::NotFound(name.to_string()))?;

        if operation.requires_auth() && self.credentials.is_none() {
            return Err(OperationError::Unauthenticated(name.to_string()));
        }

        let ctx = OperationContext {
            service: self.name.clone(),
            credentials: self.credentials.clone(),
        };
        let result = operation
            .invoke(&ctx, input)
            .await
            .map_err(|source| OperationError::Failed {
                name: name.to_string(),
                source,
            })?;

        let seq = self.event_seq.fetch_add(1, Ordering::Relaxed);
        let event = Event::new(format!("{name}_completed"), result.clone())
            .with_id(format!("{}-{seq}", self.name));
        let report = self.broadcaster.publish(&event).await;
        info!(
            service = %self.name,
            operation = name,
            delivered = report.delivered,
            "Operation completed"
        );

        Ok(result)
    }

    fn summary(&self) -> String {
        let operations = self.operations.names().collect::<Vec<_>>().join(", ");
        format!(
            "{} - {}\nauth: {}\nsubscribers: {}\noperations: {}\nendpoints: GET /health, GET /events, POST /operations/{{name}}\n",
            self.name,
            self.description,
            self.auth_status().as_str(),
            self.broadcaster.subscriber_count(),
            operations,
        )
    }

    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/", get(root))
            .route("/health", get(health))
            .route("/events", get(events))
            .route("/operations/{name}", post(operation))
            .with_state(self)
    }
}

type AppState = Arc<ServiceHost>;

async fn root(State(host): State<AppState>) -> String {
    host.summary()
}

async fn health(State(host): State<AppState>) -> Json<HealthReport> {
    Json(host.health())
}

async fn events(State(host): State<AppState>) -> Response {
    let (id, stream) = host.broadcaster.subscribe();
    info!(service = %host.name, subscriber = %id, "Push stream opened");

    (
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(stream.map(Ok::<_, Infallible>)),
    )
        .into_response()
}

async fn operation(
    State(host): State<AppState>,
    Path(name): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, OperationError> {
    let input = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).map_err(|e| OperationError::InvalidInput(e.to_string()))?
    };

    match host.invoke(&name, input).await {
        Ok(result) => Ok(Json(json!({
            "success": true,
            "operation": name,
            "result": result,
        }))),
        Err(e) => {
            if matches!(e, OperationError::Failed { .. }) {
                error!(service = %host.name, error = %e, "Operation failed");
            }
            Err(e)
        }
    }
}

/// Serve `host` on `listener` until `shutdown` completes
pub async fn serve<F>(host: Arc<ServiceHost>, listener: TcpListener, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    info!(service = %host.name, %addr, "Service host listening");
    axum::serve(listener, host.router())
        .with_graceful_shutdown(shutdown)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn host() -> ServiceHost {
        ServiceHost::new("sheets", "Google Sheets API server", OperationRegistry::with_builtins())
    }

    #[test]
    fn test_missing_credentials_degrade_to_unauthenticated() {
        let host = host().with_credentials_from(Some(FsPath::new("/nonexistent/key.json")));
        assert_eq!(host.auth_status(), AuthStatus::NotAuthenticated);
        assert_eq!(host.health().auth_status, "not_authenticated");
    }

    #[test]
    fn test_service_account_file_authenticates() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"type": "service_account", "client_email": "bot@project.iam.gserviceaccount.com", "project_id": "project"}}"#
        )
        .unwrap();

        let host = host().with_credentials_from(Some(file.path()));
        assert_eq!(host.auth_status(), AuthStatus::ServiceAccount);
    }

    #[tokio::test]
    async fn test_invoke_publishes_completion_event() {
        let host = host();
        let (_, mut stream) = host.broadcaster().subscribe();

        host.invoke("ping", json!({"x": 1})).await.unwrap();

        let frame = stream.next().await.unwrap();
        let frame = std::str::from_utf8(&frame).unwrap();
        assert!(frame.starts_with("event: ping_completed\nid: sheets-1\n"));
        assert!(frame.ends_with("\n\n"));
    }

    #[tokio::test]
    async fn test_auth_required_operation_is_rejected() {
        let result = host().invoke("whoami", Value::Null).await;
        assert!(matches!(result, Err(OperationError::Unauthenticated(_))));
    }

    #[tokio::test]
    async fn test_unknown_operation() {
        let result = host().invoke("create_sheet", Value::Null).await;
        assert!(matches!(result, Err(OperationError::NotFound(_))));
    }
}
