pub mod api;
pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod store;

use axum::Router;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::db::Database;
use crate::store::{AccountStore, MemoryStore, ShareStore, WorkspaceStore};

/// Which store implementation backs the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Postgres,
    Memory,
}

impl Backend {
    pub fn as_str(self) -> &'static str {
        match self {
            Backend::Postgres => "postgres",
            Backend::Memory => "memory",
        }
    }
}

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub workspaces: Arc<dyn WorkspaceStore>,
    pub shares: Arc<dyn ShareStore>,
    pub accounts: Arc<dyn AccountStore>,
    pub backend: Backend,
}

impl AppState {
    pub fn postgres(db: Database) -> Self {
        let db = Arc::new(db);
        Self {
            workspaces: db.clone(),
            shares: db.clone(),
            accounts: db,
            backend: Backend::Postgres,
        }
    }

    pub fn in_memory(store: Arc<MemoryStore>) -> Self {
        Self {
            workspaces: store.clone(),
            shares: store.clone(),
            accounts: store,
            backend: Backend::Memory,
        }
    }
}

/// Build the HTTP application
pub fn build_router(state: AppState, config: &Config) -> Router {
    let cors = if config.cors_allow_any {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        CorsLayer::new()
    };

    Router::new()
        .merge(api::router(state.clone()))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(RequestBodyLimitLayer::new(config.max_body_bytes))
        .with_state(state)
}

/// Serve on an already-bound listener
pub async fn serve(listener: TcpListener, state: AppState, config: &Config) -> anyhow::Result<()> {
    let backend = state.backend;
    let app = build_router(state, config);
    tracing::info!(
        "Server listening on {} ({} storage)",
        listener.local_addr()?,
        backend.as_str()
    );
    axum::serve(listener, app).await?;
    Ok(())
}

/// Run the server with the given configuration
pub async fn run_server(config: Config) -> anyhow::Result<()> {
    let state = match &config.database_url {
        Some(url) => {
            let db = Database::connect(url).await?;
            db.migrate().await?;
            AppState::postgres(db)
        }
        None => {
            tracing::warn!(
                "DATABASE_URL is not set; using the in-memory store, data will not survive a restart"
            );
            AppState::in_memory(Arc::new(MemoryStore::new()))
        }
    };

    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr).await?;
    serve(listener, state, &config).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    struct TestServer {
        app: Router,
        store: Arc<MemoryStore>,
    }

    impl TestServer {
        fn new() -> Self {
            let store = Arc::new(MemoryStore::new());
            let app = build_router(AppState::in_memory(store.clone()), &Config::default());
            Self { app, store }
        }

        async fn send(
            &self,
            method: &str,
            uri: &str,
            token: Option<&str>,
            body: Option<Value>,
        ) -> (StatusCode, Value) {
            let mut builder = Request::builder().method(method).uri(uri);
            if let Some(token) = token {
                builder = builder.header("authorization", format!("Bearer {}", token));
            }
            let request = match body {
                Some(body) => builder
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
                None => builder.body(Body::empty()).unwrap(),
            };

            let response = self.app.clone().oneshot(request).await.unwrap();
            let status = response.status();
            let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
                .await
                .unwrap();
            let value = if bytes.is_empty() {
                Value::Null
            } else {
                serde_json::from_slice(&bytes).unwrap()
            };
            (status, value)
        }
    }

    #[tokio::test]
    async fn test_health() {
        let server = TestServer::new();
        let (status, body) = server.send("GET", "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["storage"], "memory");
    }

    #[tokio::test]
    async fn test_requires_session() {
        let server = TestServer::new();
        let (status, _) = server.send("GET", "/workspace", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, body) = server
            .send("GET", "/workspace", Some("bogus"), None)
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn test_workspace_cas_over_http() {
        let server = TestServer::new();
        server.store.seed_user("ada@example.com", "ada").await;

        let (status, body) = server.send("GET", "/workspace", Some("ada"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"data": null, "version": 0}));

        let (status, body) = server
            .send(
                "POST",
                "/workspace",
                Some("ada"),
                Some(json!({"data": "blob-1", "expectedVersion": 1})),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["version"], 1);

        // Another device that still thinks the server is empty
        let (status, body) = server
            .send(
                "POST",
                "/workspace",
                Some("ada"),
                Some(json!({"data": "blob-other", "expectedVersion": 1})),
            )
            .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["currentVersion"], 1);
        assert!(body["error"].is_string());

        let (_, body) = server
            .send("GET", "/workspace/version", Some("ada"), None)
            .await;
        assert_eq!(body["version"], 1);
        let (_, body) = server.send("GET", "/workspace", Some("ada"), None).await;
        assert_eq!(body["data"], "blob-1");

        let (status, _) = server
            .send(
                "POST",
                "/workspace",
                Some("ada"),
                Some(json!({"data": "x", "expectedVersion": 0})),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    async fn create_share(server: &TestServer) -> String {
        let (status, body) = server
            .send(
                "POST",
                "/shares",
                Some("owner"),
                Some(json!({
                    "tableId": "table-1",
                    "recipientEmail": "friend@example.com",
                    "permission": "edit",
                    "encryptedTableData": "v1",
                    "encryptedDek": "dek-friend",
                    "wrappedDekForOwner": "dek-owner"
                })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["version"], 1);
        body["shareId"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_recipient_push_then_owner_resolve() {
        let server = TestServer::new();
        server.store.seed_user("owner@example.com", "owner").await;
        let friend = server.store.seed_user("friend@example.com", "friend").await;
        let share_id = create_share(&server).await;

        let (status, body) = server
            .send(
                "PUT",
                &format!("/shares/{}", share_id),
                Some("friend"),
                Some(json!({"encryptedTableData": "friend-v2", "version": 2})),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["version"], 2);

        let (status, pushes) = server
            .send("GET", &format!("/shares/{}/pushes", share_id), Some("owner"), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(pushes.as_array().unwrap().len(), 1);
        assert_eq!(pushes[0]["userId"], friend.to_string());
        assert_eq!(pushes[0]["encryptedTableData"], "friend-v2");

        let (status, body) = server
            .send(
                "POST",
                &format!("/shares/{}/resolve", share_id),
                Some("owner"),
                Some(json!({"encryptedTableData": "merged-v3", "version": 3})),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["version"], 3);

        let (_, pushes) = server
            .send("GET", &format!("/shares/{}/pushes", share_id), Some("owner"), None)
            .await;
        assert_eq!(pushes, json!([]));

        // Stale write from the recipient is rejected with the current version
        let (status, body) = server
            .send(
                "PUT",
                &format!("/shares/{}", share_id),
                Some("friend"),
                Some(json!({"encryptedTableData": "stale", "version": 3})),
            )
            .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["currentVersion"], 3);

        let (status, _) = server
            .send(
                "POST",
                &format!("/shares/{}/resolve", share_id),
                Some("friend"),
                Some(json!({"encryptedTableData": "x", "version": 4})),
            )
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_lapsed_entitlement_blocks_recipient_write() {
        let server = TestServer::new();
        server.store.seed_user("owner@example.com", "owner").await;
        let friend = server.store.seed_user("friend@example.com", "friend").await;
        let share_id = create_share(&server).await;

        server.store.set_entitlement(friend, false).await;
        let (status, _) = server
            .send(
                "PUT",
                &format!("/shares/{}", share_id),
                Some("friend"),
                Some(json!({"encryptedTableData": "friend-v2", "version": 2})),
            )
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (_, view) = server
            .send("GET", &format!("/shares/{}", share_id), Some("friend"), None)
            .await;
        assert_eq!(view["version"], 1);
        assert_eq!(view["wrappedDek"], "dek-friend");
        assert_eq!(view["permission"], "edit");
    }

    #[tokio::test]
    async fn test_share_validation_and_patch() {
        let server = TestServer::new();
        server.store.seed_user("owner@example.com", "owner").await;
        let friend = server.store.seed_user("friend@example.com", "friend").await;

        let (status, _) = server
            .send(
                "POST",
                "/shares",
                Some("owner"),
                Some(json!({
                    "tableId": "t",
                    "recipientEmail": "nobody@example.com",
                    "permission": "view",
                    "encryptedTableData": "x",
                    "encryptedDek": "y",
                    "wrappedDekForOwner": "z"
                })),
            )
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = server
            .send(
                "POST",
                "/shares",
                Some("owner"),
                Some(json!({
                    "tableId": "t",
                    "recipientEmail": "owner@example.com",
                    "permission": "view",
                    "encryptedTableData": "x",
                    "encryptedDek": "y",
                    "wrappedDekForOwner": "z"
                })),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let share_id = create_share(&server).await;
        let uri = format!("/shares/{}", share_id);

        let (status, _) = server
            .send(
                "PATCH",
                &uri,
                Some("owner"),
                Some(json!({"recipientUserId": friend, "permission": "view", "revoke": true})),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = server
            .send(
                "PATCH",
                &uri,
                Some("owner"),
                Some(json!({"recipientUserId": friend, "alwaysAcceptFrom": true})),
            )
            .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (_, outgoing) = server
            .send("GET", "/shares/outgoing", Some("owner"), None)
            .await;
        assert_eq!(outgoing[0]["alwaysAcceptFrom"], true);
        assert_eq!(outgoing[0]["recipientEmail"], "friend@example.com");

        let (status, _) = server.send("DELETE", &uri, Some("owner"), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (_, incoming) = server
            .send("GET", "/shares/incoming", Some("friend"), None)
            .await;
        assert_eq!(incoming, json!([]));
    }

    #[tokio::test]
    async fn test_key_directory() {
        let server = TestServer::new();
        server.store.seed_user("ada@example.com", "ada").await;
        let public_key = planvault_core::WorkspaceKey::generate()
            .keypair()
            .unwrap()
            .public_key();

        let (status, _) = server
            .send("GET", "/keys/ada@example.com", Some("ada"), None)
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = server
            .send(
                "PUT",
                "/keys",
                Some("ada"),
                Some(json!({"publicKey": "not-a-key"})),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = server
            .send(
                "PUT",
                "/keys",
                Some("ada"),
                Some(json!({"publicKey": public_key})),
            )
            .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, body) = server
            .send("GET", "/keys/ada@example.com", Some("ada"), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["publicKey"], public_key);
    }

    #[tokio::test]
    async fn test_body_limit() {
        let store = Arc::new(MemoryStore::new());
        store.seed_user("ada@example.com", "ada").await;
        let config = Config {
            max_body_bytes: 64,
            ..Config::default()
        };
        let app = build_router(AppState::in_memory(store), &config);

        let body = json!({"data": "x".repeat(200), "expectedVersion": 1}).to_string();
        let request = Request::builder()
            .method("POST")
            .uri("/workspace")
            .header("authorization", "Bearer ada")
            .header("content-type", "application/json")
            .header("content-length", body.len())
            .body(Body::from(body))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }
}
