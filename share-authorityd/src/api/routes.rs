use std::net::SocketAddr;
use std::sync::Arc;
use axum::{
    extract::{ConnectInfo, Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use shared::protocol::API_PREFIX;
use shared::types::{
    AuthorizationView, NamePort, PendingNotification, RecordKey, ServiceListing, ServiceRecord,
};
use crate::error::Result;
use crate::identity::{IdentityProvider, WorkerAuth};
use crate::service::ShareService;
use crate::store::db::UndeliveredFilter;

#[derive(Clone)]
pub struct AppState {
    pub service: ShareService,
    pub identity: Arc<dyn IdentityProvider>,
    pub worker: Arc<WorkerAuth>,
}

#[derive(Deserialize)]
pub struct HostnameQuery {
    pub service: String,
}

#[derive(Deserialize)]
pub struct NamePortQuery {
    pub service: String,
    pub hostname: String,
}

#[derive(Deserialize)]
pub struct NotificationQuery {
    pub origin: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Deserialize)]
pub struct GrantRequest {
    #[serde(flatten)]
    pub record: RecordKey,
    pub friend_id: String,
}

#[derive(Serialize)]
pub struct EnrollResponse {
    pub new_user: bool,
}

#[derive(Serialize)]
pub struct HashResponse {
    pub digest: String,
}

#[derive(Serialize)]
pub struct NotificationResponse {
    pub notification_id: i64,
}

#[derive(Serialize)]
pub struct DeleteAllResponse {
    pub notification_ids: Vec<i64>,
}

#[derive(Serialize)]
pub struct DeliveredResponse {
    pub changed: bool,
}

/// Owner-facing routes, every one resolved through the identity provider
pub fn router(state: AppState) -> Router {
    let routes = Router::new()
        .route("/enroll", post(enroll))
        .route("/services", get(list_services))
        .route("/services/hash", get(get_hash))
        .route("/hostnames", get(list_hostnames))
        .route("/name-ports", get(list_name_ports))
        .route("/records", put(register_record))
        .route("/records/details", post(details))
        .route("/records/authorize", post(authorize))
        .route("/records/deauthorize", post(deauthorize))
        .route("/records/delete", post(delete_record))
        .route("/records/delete-all", post(delete_all))
        .route("/friends/:friend_id/records", get(records_for_friend));

    Router::new().nest(API_PREFIX, routes).with_state(state)
}

/// Notification queue routes for the delivery worker, served on their own
/// listener and guarded by the worker token
pub fn worker_router(state: AppState) -> Router {
    let routes = Router::new()
        .route("/notifications", get(list_undelivered))
        .route("/notifications/:id/delivered", post(mark_delivered));

    Router::new().nest(API_PREFIX, routes).with_state(state)
}

fn origin(addr: SocketAddr) -> String {
    addr.ip().to_string()
}

async fn enroll(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<EnrollResponse>> {
    let owner = state.identity.current_user(&headers)?;
    let new_user = state.service.enroll(&owner).await?;
    Ok(Json(EnrollResponse { new_user }))
}

async fn list_services(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<ServiceListing>>> {
    let owner = state.identity.current_user(&headers)?;
    state.service.list_services(&owner).await.map(Json)
}

async fn get_hash(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<HashResponse>> {
    let owner = state.identity.current_user(&headers)?;
    let digest = state.service.digest(&owner).await?;
    Ok(Json(HashResponse { digest }))
}

async fn list_hostnames(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<HostnameQuery>,
) -> Result<Json<Vec<String>>> {
    let owner = state.identity.current_user(&headers)?;
    state
        .service
        .list_hostnames(&owner, &params.service)
        .await
        .map(Json)
}

async fn list_name_ports(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<NamePortQuery>,
) -> Result<Json<Vec<NamePort>>> {
    let owner = state.identity.current_user(&headers)?;
    state
        .service
        .list_name_ports(&owner, &params.hostname, &params.service)
        .await
        .map(Json)
}

/// Ingestion from the discovery pipeline, which authenticates as the owner
async fn register_record(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(key): Json<RecordKey>,
) -> Result<StatusCode> {
    let owner = state.identity.current_user(&headers)?;
    let new = state
        .service
        .register_record(ServiceRecord::new(owner, key))
        .await?;
    Ok(if new { StatusCode::CREATED } else { StatusCode::OK })
}

async fn details(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(key): Json<RecordKey>,
) -> Result<Json<AuthorizationView>> {
    let owner = state.identity.current_user(&headers)?;
    state.service.get_details(&owner, &key).await.map(Json)
}

async fn authorize(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(req): Json<GrantRequest>,
) -> Result<Json<NotificationResponse>> {
    let owner = state.identity.current_user(&headers)?;
    let notification_id = state
        .service
        .authorize(&owner, &req.record, &req.friend_id, &origin(addr))
        .await?;
    Ok(Json(NotificationResponse { notification_id }))
}

async fn deauthorize(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(req): Json<GrantRequest>,
) -> Result<Json<NotificationResponse>> {
    let owner = state.identity.current_user(&headers)?;
    let notification_id = state
        .service
        .deauthorize(&owner, &req.record, &req.friend_id, &origin(addr))
        .await?;
    Ok(Json(NotificationResponse { notification_id }))
}

async fn delete_record(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(key): Json<RecordKey>,
) -> Result<Json<NotificationResponse>> {
    let owner = state.identity.current_user(&headers)?;
    let notification_id = state
        .service
        .delete_record(&owner, &key, &origin(addr))
        .await?;
    Ok(Json(NotificationResponse { notification_id }))
}

async fn delete_all(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Json<DeleteAllResponse>> {
    let owner = state.identity.current_user(&headers)?;
    let notification_ids = state.service.delete_all(&owner, &origin(addr)).await?;
    Ok(Json(DeleteAllResponse { notification_ids }))
}

async fn records_for_friend(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(friend_id): Path<String>,
) -> Result<Json<Vec<RecordKey>>> {
    let owner = state.identity.current_user(&headers)?;
    state
        .service
        .records_for_friend(&owner, &friend_id)
        .await
        .map(Json)
}

/// Polled by the delivery worker
async fn list_undelivered(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<NotificationQuery>,
) -> Result<Json<Vec<PendingNotification>>> {
    state.worker.verify(&headers)?;
    state
        .service
        .list_undelivered(UndeliveredFilter {
            origin: params.origin,
            limit: params.limit,
        })
        .await
        .map(Json)
}

async fn mark_delivered(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<DeliveredResponse>> {
    state.worker.verify(&headers)?;
    let changed = state.service.mark_delivered(id).await?;
    Ok(Json(DeliveredResponse { changed }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        extract::connect_info::MockConnectInfo,
        http::{header::AUTHORIZATION, Method, Request},
    };
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt;
    use crate::identity::HeaderIdentity;
    use crate::service::tests::{friend, service_with, DownFriends, StaticFriends, OWNER};
    use crate::friends::FriendSource;
    use crate::store::db::StoreDb;

    const USER_HEADER: &str = "x-authenticated-user";
    const WORKER_TOKEN: &str = "worker-s3cret";

    struct TestApp {
        owner: Router,
        worker: Router,
    }

    fn app_with(friends: Arc<dyn FriendSource>) -> TestApp {
        let state = AppState {
            service: service_with(StoreDb::open(":memory:").unwrap(), friends),
            identity: Arc::new(HeaderIdentity::new(USER_HEADER).unwrap()),
            worker: Arc::new(WorkerAuth::new(Some(WORKER_TOKEN))),
        };
        let peer = MockConnectInfo(SocketAddr::from(([10, 0, 0, 7], 40000)));
        TestApp {
            owner: router(state.clone()).layer(peer.clone()),
            worker: worker_router(state).layer(peer),
        }
    }

    fn app() -> TestApp {
        app_with(Arc::new(StaticFriends(vec![friend("A"), friend("B"), friend("C")])))
    }

    fn record_json() -> Value {
        json!({
            "service_type": "_afpovertcp",
            "hostname": "nas.local.",
            "instance_name": "Office",
            "port": 548,
            "transport": "tcp"
        })
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    async fn call(
        app: &Router,
        method: Method,
        uri: &str,
        user: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(user) = user {
            builder = builder.header(USER_HEADER, user);
        }
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        send(app, request).await
    }

    async fn call_worker(
        app: &Router,
        method: Method,
        uri: &str,
        token: Option<&str>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        send(app, builder.body(Body::empty()).unwrap()).await
    }

    async fn grant_office(app: &TestApp) -> i64 {
        call(&app.owner, Method::PUT, "/v1/records", Some(OWNER), Some(record_json())).await;
        let mut grant = record_json();
        grant["friend_id"] = json!("A");
        let (status, body) =
            call(&app.owner, Method::POST, "/v1/records/authorize", Some(OWNER), Some(grant)).await;
        assert_eq!(status, StatusCode::OK);
        body["notification_id"].as_i64().unwrap()
    }

    #[tokio::test]
    async fn test_requires_identity() {
        let app = app();

        let (status, _) = call(&app.owner, Method::GET, "/v1/services", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = call(
            &app.owner,
            Method::POST,
            "/v1/records/delete-all",
            None,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_worker_routes_reject_anonymous_callers() {
        let app = app();
        let id = grant_office(&app).await;
        let delivered_uri = format!("/v1/notifications/{}/delivered", id);

        for token in [None, Some("wrong")] {
            let (status, body) =
                call_worker(&app.worker, Method::GET, "/v1/notifications", token).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED);
            assert!(body.get(0).is_none(), "Rejected callers see no payloads");

            let (status, _) = call_worker(&app.worker, Method::POST, &delivered_uri, token).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED);
        }

        // An owner identity is not a worker credential
        let (status, _) = call(&app.worker, Method::GET, "/v1/notifications", Some(OWNER), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, body) =
            call_worker(&app.worker, Method::GET, "/v1/notifications", Some(WORKER_TOKEN)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["id"], id);
    }

    #[tokio::test]
    async fn test_queue_routes_not_served_to_owners() {
        let app = app();
        grant_office(&app).await;

        let (status, _) = call(&app.owner, Method::GET, "/v1/notifications", Some(OWNER), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call_worker(&app.worker, Method::GET, "/v1/services", Some(WORKER_TOKEN)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unconfigured_worker_token_rejects_all() {
        let state = AppState {
            service: service_with(
                StoreDb::open(":memory:").unwrap(),
                Arc::new(StaticFriends(Vec::new())),
            ),
            identity: Arc::new(HeaderIdentity::new(USER_HEADER).unwrap()),
            worker: Arc::new(WorkerAuth::new(None)),
        };
        let worker = worker_router(state);

        let (status, _) = call_worker(&worker, Method::GET, "/v1/notifications", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) =
            call_worker(&worker, Method::GET, "/v1/notifications", Some(WORKER_TOKEN)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_share_flow() {
        let app = app();

        let (status, _) =
            call(&app.owner, Method::PUT, "/v1/records", Some(OWNER), Some(record_json())).await;
        assert_eq!(status, StatusCode::CREATED);
        let (status, _) =
            call(&app.owner, Method::PUT, "/v1/records", Some(OWNER), Some(record_json())).await;
        assert_eq!(status, StatusCode::OK);

        for user in ["A", "B"] {
            let (status, body) = call(&app.owner, Method::POST, "/v1/enroll", Some(user), None).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["new_user"], true);
        }

        let mut grant = record_json();
        grant["friend_id"] = json!("A");
        let (status, body) =
            call(&app.owner, Method::POST, "/v1/records/authorize", Some(OWNER), Some(grant)).await;
        assert_eq!(status, StatusCode::OK);
        let notification_id = body["notification_id"].as_i64().unwrap();

        let (status, body) = call(
            &app.owner,
            Method::POST,
            "/v1/records/details",
            Some(OWNER),
            Some(record_json()),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["authorized_friends"][0]["friend_id"], "A");
        assert_eq!(body["denied_friends"].as_array().unwrap().len(), 1);
        assert_eq!(body["denied_friends"][0]["friend_id"], "B");

        let (_, body) = call(&app.owner, Method::GET, "/v1/services", Some(OWNER), None).await;
        assert_eq!(body[0]["display_name"], "AppleShare");
        assert_eq!(body[0]["owner_id"], OWNER);

        let (_, body) = call(
            &app.owner,
            Method::GET,
            "/v1/hostnames?service=_afpovertcp",
            Some(OWNER),
            None,
        )
        .await;
        assert_eq!(body, json!(["nas.local."]));

        let (_, body) = call(
            &app.owner,
            Method::GET,
            "/v1/name-ports?service=_afpovertcp&hostname=nas.local.",
            Some(OWNER),
            None,
        )
        .await;
        assert_eq!(body[0]["instance_name"], "Office");
        assert_eq!(body[0]["port"], 548);

        let (_, body) =
            call(&app.owner, Method::GET, "/v1/friends/A/records", Some(OWNER), None).await;
        assert_eq!(body.as_array().unwrap().len(), 1);

        let (_, body) =
            call_worker(&app.worker, Method::GET, "/v1/notifications", Some(WORKER_TOKEN)).await;
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["id"], notification_id);
        assert_eq!(body[0]["origin_address"], "10.0.0.7");

        let uri = format!("/v1/notifications/{}/delivered", notification_id);
        let (_, body) = call_worker(&app.worker, Method::POST, &uri, Some(WORKER_TOKEN)).await;
        assert_eq!(body["changed"], true);
        let (_, body) = call_worker(&app.worker, Method::POST, &uri, Some(WORKER_TOKEN)).await;
        assert_eq!(body["changed"], false);

        let (_, body) =
            call_worker(&app.worker, Method::GET, "/v1/notifications", Some(WORKER_TOKEN)).await;
        assert!(body.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_other_owner_sees_not_found() {
        let app = app();
        call(&app.owner, Method::PUT, "/v1/records", Some(OWNER), Some(record_json())).await;

        let mut grant = record_json();
        grant["friend_id"] = json!("A");
        let (status, _) = call(
            &app.owner,
            Method::POST,
            "/v1/records/authorize",
            Some("intruder"),
            Some(grant),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(
            &app.owner,
            Method::POST,
            "/v1/records/delete",
            Some("intruder"),
            Some(record_json()),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, body) =
            call_worker(&app.worker, Method::GET, "/v1/notifications", Some(WORKER_TOKEN)).await;
        assert!(body.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_all_returns_notification_ids() {
        let app = app();
        for name in ["One", "Two", "Three"] {
            let mut record = record_json();
            record["instance_name"] = json!(name);
            call(&app.owner, Method::PUT, "/v1/records", Some(OWNER), Some(record)).await;
        }

        let (status, body) =
            call(&app.owner, Method::POST, "/v1/records/delete-all", Some(OWNER), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["notification_ids"].as_array().unwrap().len(), 3);

        let (_, body) = call(&app.owner, Method::GET, "/v1/services", Some(OWNER), None).await;
        assert_eq!(body, json!([]));
    }

    #[tokio::test]
    async fn test_friend_outage_is_bad_gateway() {
        let app = app_with(Arc::new(DownFriends));
        call(&app.owner, Method::PUT, "/v1/records", Some(OWNER), Some(record_json())).await;

        let (status, body) = call(
            &app.owner,
            Method::POST,
            "/v1/records/details",
            Some(OWNER),
            Some(record_json()),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(body["error"].as_str().unwrap().contains("friend source unavailable"));
    }
}
