//! Defines the HTTP surface.
//!
//! ## Structure
//! - **Media** (caller identified by `X-User-Id`)
//!   - `POST   /api/media` — multipart upload
//!   - `GET    /api/media` — paginated list (`?page=&page_size=`)
//!   - `GET    /api/media/{id}` — one record (`?signed_url_ttl=` adds a signed URL)
//!   - `GET    /api/media/{id}/content` — streamed bytes
//!   - `DELETE /api/media/{id}` — remove bytes and record
//!
//! - **Storage**
//!   - `GET /api/storage/providers` — supported and configured backends
//!   - `GET /api/storage/health` — aggregate or `?provider=` health
//!
//! - **Local files**: `GET /files/{*key}` serves the filesystem backend.

use crate::{
    handlers::{
        files_handler::serve_file,
        health_handlers::{healthz, readyz},
        media_handlers::{delete_media, get_media, list_media, media_content, upload_media},
        storage_handlers::{list_providers, storage_health},
    },
    state::AppState,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::get,
};

/// Build the router. `max_upload_bytes` bounds multipart upload bodies.
pub fn routes(max_upload_bytes: usize) -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route(
            "/api/media",
            get(list_media)
                .post(upload_media)
                .layer(DefaultBodyLimit::max(max_upload_bytes)),
        )
        .route("/api/media/{id}", get(get_media).delete(delete_media))
        .route("/api/media/{id}/content", get(media_content))
        .route("/api/storage/providers", get(list_providers))
        .route("/api/storage/health", get(storage_health))
        .route("/files/{*key}", get(serve_file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{LocalConfig, StorageConfig},
        db::memory_pool,
        models::file_object::ProviderType,
        services::{health_service::HealthService, media_service::MediaService},
        storage::registry::ProviderRegistry,
    };
    use reqwest::{StatusCode, multipart};
    use serde_json::Value;
    use std::sync::Arc;
    use tempfile::TempDir;

    const SECRET: &str = "route-test-secret";

    struct TestServer {
        base: String,
        client: reqwest::Client,
        _dir: TempDir,
    }

    impl TestServer {
        fn url(&self, path: &str) -> String {
            format!("{}{}", self.base, path)
        }
    }

    async fn spawn() -> TestServer {
        let dir = TempDir::new().unwrap();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());

        let registry = Arc::new(ProviderRegistry::new(StorageConfig {
            local: Some(LocalConfig {
                root: dir.path().to_path_buf(),
                base_url: format!("{}/files", base),
                signing_secret: Some(SECRET.into()),
            }),
            ..Default::default()
        }));
        let db = Arc::new(memory_pool().await);
        let state = AppState {
            db: db.clone(),
            media: MediaService::new(db, registry.clone(), ProviderType::Local),
            health: HealthService::new(registry, HealthService::DEFAULT_TIMEOUT),
            local_signing_secret: Some(Arc::from(SECRET.as_bytes())),
        };
        let app = routes(1024 * 1024).with_state(state);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        TestServer {
            base,
            client: reqwest::Client::new(),
            _dir: dir,
        }
    }

    async fn upload(server: &TestServer, user: &str, name: &str, data: &'static [u8]) -> Value {
        let form = multipart::Form::new()
            .part("file", multipart::Part::bytes(data).file_name(name.to_string()));
        let response = server
            .client
            .post(server.url("/api/media"))
            .header("X-User-Id", user)
            .multipart(form)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        response.json().await.unwrap()
    }

    #[tokio::test]
    async fn media_lifecycle_over_http() {
        let server = spawn().await;
        let media = upload(&server, "U1", "notes.txt", b"0123456789").await;
        assert_eq!(media["file_size"], 10);
        assert_eq!(media["provider"], "local");
        assert_eq!(media["media_type"], "other");
        let id = media["id"].as_str().unwrap().to_string();

        let list: Value = server
            .client
            .get(server.url("/api/media?page=1&page_size=5"))
            .header("X-User-Id", "U1")
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(list["pagination"]["total"], 1);
        assert_eq!(list["data"][0]["id"], id.as_str());

        let content = server
            .client
            .get(server.url(&format!("/api/media/{id}/content")))
            .header("X-User-Id", "U1")
            .send()
            .await
            .unwrap();
        assert_eq!(content.status(), StatusCode::OK);
        assert_eq!(content.headers()["content-type"], "text/plain");
        assert_eq!(&content.bytes().await.unwrap()[..], b"0123456789");

        let foreign = server
            .client
            .get(server.url(&format!("/api/media/{id}")))
            .header("X-User-Id", "U2")
            .send()
            .await
            .unwrap();
        assert_eq!(foreign.status(), StatusCode::NOT_FOUND);
        let body: Value = foreign.json().await.unwrap();
        assert_eq!(body["status"], 404);

        let deleted = server
            .client
            .delete(server.url(&format!("/api/media/{id}")))
            .header("X-User-Id", "U1")
            .send()
            .await
            .unwrap();
        assert_eq!(deleted.status(), StatusCode::NO_CONTENT);

        let again = server
            .client
            .delete(server.url(&format!("/api/media/{id}")))
            .header("X-User-Id", "U1")
            .send()
            .await
            .unwrap();
        assert_eq!(again.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn requests_need_a_user_and_a_file() {
        let server = spawn().await;
        let anonymous = server
            .client
            .get(server.url("/api/media"))
            .send()
            .await
            .unwrap();
        assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);

        let form = multipart::Form::new().text("provider", "local");
        let no_file = server
            .client
            .post(server.url("/api/media"))
            .header("X-User-Id", "U1")
            .multipart(form)
            .send()
            .await
            .unwrap();
        assert_eq!(no_file.status(), StatusCode::BAD_REQUEST);

        let form = multipart::Form::new()
            .text("provider", "dropbox")
            .part("file", multipart::Part::bytes(&b"x"[..]).file_name("a.txt"));
        let bad_provider = server
            .client
            .post(server.url("/api/media"))
            .header("X-User-Id", "U1")
            .multipart(form)
            .send()
            .await
            .unwrap();
        assert_eq!(bad_provider.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn signed_local_urls_are_verified() {
        let server = spawn().await;
        let media = upload(&server, "U1", "pic.png", b"png-bytes").await;
        let id = media["id"].as_str().unwrap();

        let detail: Value = server
            .client
            .get(server.url(&format!("/api/media/{id}?signed_url_ttl=60")))
            .header("X-User-Id", "U1")
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let signed = detail["signed_url"].as_str().unwrap().to_string();
        assert!(signed.contains("signature="));

        let ok = server.client.get(&signed).send().await.unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
        assert_eq!(&ok.bytes().await.unwrap()[..], b"png-bytes");

        let tampered = signed.replace("signature=", "signature=AAAA");
        let rejected = server.client.get(&tampered).send().await.unwrap();
        assert_eq!(rejected.status(), StatusCode::FORBIDDEN);

        let direct = server
            .client
            .get(media["public_url"].as_str().unwrap())
            .send()
            .await
            .unwrap();
        assert_eq!(direct.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn urls_for_names_with_reserved_characters_resolve() {
        let server = spawn().await;
        for (name, data) in [("report#1.txt", &b"hash"[..]), ("a?b.txt", &b"query"[..])] {
            let media = upload(&server, "U1", name, data).await;
            let public = media["public_url"].as_str().unwrap();
            assert!(!public.contains('#') && !public.contains('?'), "{public}");

            let direct = server.client.get(public).send().await.unwrap();
            assert_eq!(direct.status(), StatusCode::OK, "{public}");
            assert_eq!(&direct.bytes().await.unwrap()[..], data);

            let id = media["id"].as_str().unwrap();
            let detail: Value = server
                .client
                .get(server.url(&format!("/api/media/{id}?signed_url_ttl=60")))
                .header("X-User-Id", "U1")
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            let signed = detail["signed_url"].as_str().unwrap();
            let fetched = server.client.get(signed).send().await.unwrap();
            assert_eq!(fetched.status(), StatusCode::OK, "{signed}");
            assert_eq!(&fetched.bytes().await.unwrap()[..], data);
        }
    }

    #[tokio::test]
    async fn storage_endpoints_report_backends() {
        let server = spawn().await;

        let providers: Value = server
            .client
            .get(server.url("/api/storage/providers"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(providers["providers"].as_array().unwrap().len(), 5);
        assert_eq!(providers["configured"], serde_json::json!(["local"]));
        assert_eq!(providers["default"], "local");

        let health = server
            .client
            .get(server.url("/api/storage/health"))
            .send()
            .await
            .unwrap();
        assert_eq!(health.status(), StatusCode::OK);
        let report: Value = health.json().await.unwrap();
        assert_eq!(report["providers"]["local"]["status"], "healthy");

        let unconfigured = server
            .client
            .get(server.url("/api/storage/health?provider=s3"))
            .send()
            .await
            .unwrap();
        assert_eq!(unconfigured.status(), StatusCode::SERVICE_UNAVAILABLE);

        let unknown = server
            .client
            .get(server.url("/api/storage/health?provider=dropbox"))
            .send()
            .await
            .unwrap();
        assert_eq!(unknown.status(), StatusCode::BAD_REQUEST);

        let ready = server.client.get(server.url("/readyz")).send().await.unwrap();
        assert_eq!(ready.status(), StatusCode::OK);
        let ready: Value = ready.json().await.unwrap();
        assert_eq!(ready["database"]["ok"], true);
        assert_eq!(ready["providers"], serde_json::json!(["local"]));
    }
}
