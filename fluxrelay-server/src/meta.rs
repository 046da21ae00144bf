//! Metadata service for members started without an external store
//!
//! Every operation is a `POST /meta/v1/<op>` with a JSON body; failures are
//! reported in the `error` field of the response.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::post,
    Router,
};
use fluxrelay_core::meta::http::{
    KeyRequest, LeaseRequest, MetaResponse, PrefixRequest, PutRequest, WatchRequest, META_PATH, WATCH_POLL,
};
use fluxrelay_core::meta::{MemoryMetaStore, MetaStore};
use fluxrelay_core::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

type MetaState = Arc<MemoryMetaStore>;

pub fn create_router(store: Arc<MemoryMetaStore>) -> Router {
    let routes = Router::new()
        .route("/get", post(get))
        .route("/range", post(range))
        .route("/put", post(put))
        .route("/create", post(create))
        .route("/delete", post(delete))
        .route("/delete_prefix", post(delete_prefix))
        .route("/watch", post(watch))
        .route("/lease/grant", post(grant))
        .route("/lease/keepalive", post(keep_alive))
        .route("/lease/revoke", post(revoke))
        .route("/revision", post(revision));
    Router::new().nest(META_PATH, routes).with_state(store)
}

fn reply(result: Result<MetaResponse>) -> Response {
    match result {
        Ok(resp) => Json(resp).into_response(),
        Err(e) => {
            debug!(error = %e, "metadata operation failed");
            let status = StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            let body = MetaResponse {
                error: Some(e.to_string()),
                ..Default::default()
            };
            (status, Json(body)).into_response()
        }
    }
}

async fn get(State(store): State<MetaState>, Json(req): Json<KeyRequest>) -> Response {
    reply(store.get(&req.key).await.map(|value| MetaResponse {
        value,
        ..Default::default()
    }))
}

async fn range(State(store): State<MetaState>, Json(req): Json<PrefixRequest>) -> Response {
    reply(store.get_prefix(&req.prefix).await.map(|kvs| MetaResponse {
        kvs,
        ..Default::default()
    }))
}

async fn put(State(store): State<MetaState>, Json(req): Json<PutRequest>) -> Response {
    reply(
        store
            .put(&req.key, &req.value, req.lease)
            .await
            .map(|_| MetaResponse {
                ok: true,
                ..Default::default()
            }),
    )
}

async fn create(State(store): State<MetaState>, Json(req): Json<PutRequest>) -> Response {
    reply(
        store
            .create(&req.key, &req.value, req.lease)
            .await
            .map(|ok| MetaResponse {
                ok,
                ..Default::default()
            }),
    )
}

async fn delete(State(store): State<MetaState>, Json(req): Json<KeyRequest>) -> Response {
    reply(store.delete(&req.key).await.map(|ok| MetaResponse {
        ok,
        ..Default::default()
    }))
}

async fn delete_prefix(State(store): State<MetaState>, Json(req): Json<PrefixRequest>) -> Response {
    reply(store.delete_prefix(&req.prefix).await.map(|count| MetaResponse {
        count,
        ..Default::default()
    }))
}

/// Long poll for events after `req.after`
///
/// An empty answer keeps the caller's revision so nothing written between
/// the wait and the reply is skipped.
async fn watch(State(store): State<MetaState>, Json(req): Json<WatchRequest>) -> Response {
    let timeout = Duration::from_millis(req.timeout_ms).min(WATCH_POLL);
    let resp = match store.wait_events(&req.prefix, req.after, timeout).await {
        Some(events) => MetaResponse {
            revision: events.iter().map(|e| e.revision).max().unwrap_or(req.after),
            events,
            ..Default::default()
        },
        None => match store.revision().await {
            Ok(revision) => MetaResponse {
                revision,
                compacted: true,
                ..Default::default()
            },
            Err(e) => return reply(Err(e)),
        },
    };
    reply(Ok(resp))
}

async fn grant(State(store): State<MetaState>, Json(req): Json<LeaseRequest>) -> Response {
    reply(
        store
            .grant_lease(Duration::from_millis(req.ttl_ms))
            .await
            .map(|lease| MetaResponse {
                lease,
                ok: true,
                ..Default::default()
            }),
    )
}

async fn keep_alive(State(store): State<MetaState>, Json(req): Json<LeaseRequest>) -> Response {
    reply(store.keep_alive(req.id).await.map(|_| MetaResponse {
        ok: true,
        ..Default::default()
    }))
}

async fn revoke(State(store): State<MetaState>, Json(req): Json<LeaseRequest>) -> Response {
    reply(store.revoke_lease(req.id).await.map(|_| MetaResponse {
        ok: true,
        ..Default::default()
    }))
}

async fn revision(State(store): State<MetaState>) -> Response {
    reply(store.revision().await.map(|revision| MetaResponse {
        revision,
        ..Default::default()
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use fluxrelay_core::meta::HttpMetaStore;
    use serde_json::json;
    use tower::ServiceExt;

    async fn call(app: &Router, op: &str, body: serde_json::Value) -> (StatusCode, MetaResponse) {
        let response = app
            .clone()
            .oneshot(
                Request::post(format!("{}/{}", META_PATH, op))
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_kv_operations() {
        let app = create_router(Arc::new(MemoryMetaStore::new()));

        let (_, resp) = call(&app, "create", json!({"key": "/a/1", "value": "x"})).await;
        assert!(resp.ok);
        let (_, resp) = call(&app, "create", json!({"key": "/a/1", "value": "y"})).await;
        assert!(!resp.ok);
        call(&app, "put", json!({"key": "/a/2", "value": "z"})).await;

        let (_, resp) = call(&app, "get", json!({"key": "/a/1"})).await;
        assert_eq!(resp.value.as_deref(), Some("x"));
        let (_, resp) = call(&app, "range", json!({"prefix": "/a/"})).await;
        assert_eq!(resp.kvs.len(), 2);

        let (_, resp) = call(&app, "delete_prefix", json!({"prefix": "/a/"})).await;
        assert_eq!(resp.count, 2);
        let (_, resp) = call(&app, "get", json!({"key": "/a/1"})).await;
        assert!(resp.value.is_none());
    }

    #[tokio::test]
    async fn test_watch_returns_new_events() {
        let store = Arc::new(MemoryMetaStore::new());
        let app = create_router(store.clone());
        let (_, resp) = call(&app, "revision", json!({})).await;
        let after = resp.revision;

        store.put("/w/k", "v", None).await.unwrap();
        store.put("/other", "v", None).await.unwrap();
        let (_, resp) = call(&app, "watch", json!({"prefix": "/w/", "after": after, "timeout_ms": 100})).await;
        assert_eq!(resp.events.len(), 1);
        assert_eq!(resp.events[0].key, "/w/k");
        assert!(resp.revision > after);

        let (_, idle) = call(&app, "watch", json!({"prefix": "/w/", "after": resp.revision, "timeout_ms": 50})).await;
        assert!(idle.events.is_empty());
        assert_eq!(idle.revision, resp.revision);
    }

    #[tokio::test]
    async fn test_client_watch_closes_when_compacted() {
        // every poll answers as if the caller fell behind the retained log
        let app = Router::new()
            .route(
                &format!("{}/revision", META_PATH),
                post(|| async {
                    Json(MetaResponse {
                        revision: 7,
                        ..Default::default()
                    })
                }),
            )
            .route(
                &format!("{}/watch", META_PATH),
                post(|| async {
                    Json(MetaResponse {
                        revision: 20_000,
                        compacted: true,
                        ..Default::default()
                    })
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let client = HttpMetaStore::new(vec![format!("http://{}", addr)]).unwrap();
        let mut watch = client.watch("/w/").await.unwrap();
        let event = tokio::time::timeout(Duration::from_secs(5), watch.recv())
            .await
            .expect("watch stayed open after compaction");
        assert!(event.is_none());
    }

    #[tokio::test]
    async fn test_leases() {
        let app = create_router(Arc::new(MemoryMetaStore::new()));
        let (_, resp) = call(&app, "lease/grant", json!({"ttl_ms": 60_000})).await;
        let lease = resp.lease;

        call(&app, "put", json!({"key": "/l", "value": "v", "lease": lease})).await;
        call(&app, "lease/revoke", json!({"id": lease})).await;
        let (_, resp) = call(&app, "get", json!({"key": "/l"})).await;
        assert!(resp.value.is_none());

        let (status, resp) = call(&app, "put", json!({"key": "/l", "value": "v", "lease": lease})).await;
        assert!(!status.is_success());
        assert!(resp.error.is_some());
    }
}
