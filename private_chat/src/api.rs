use crate::{
    auth,
    config::Config,
    db,
    files::{self, AttachmentStore},
    hub::Hub,
    identity::{self, RegisterError, SqliteIdentityStore},
    messages::SqliteMessageLog,
    model::{Message, UserProfile},
    ws,
};
use anyhow::{Context, Result};
use axum::{
    body::StreamBody,
    extract::{DefaultBodyLimit, Extension, Multipart, Path, Query, State},
    http::{header, HeaderMap, HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, sync::Arc};
use tokio_util::io::ReaderStream;
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub hub: Arc<Hub>,
    pub identity: Arc<SqliteIdentityStore>,
    pub attachments: AttachmentStore,
    pub jwt_secret: Arc<Vec<u8>>,
    pub login_limiter: auth::LoginRateLimiter,
}

impl AppState {
    pub async fn new(config: Config) -> Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir)
            .await
            .with_context(|| format!("create data dir {}", config.data_dir.display()))?;
        let db_path = config.data_dir.join("chat.db");
        let pool = tokio::task::spawn_blocking(move || db::open_pool(db_path)).await??;
        let attachments = AttachmentStore::open(config.data_dir.join("uploads")).await?;
        let jwt_secret = load_jwt_secret(&config).await?;
        let identity = Arc::new(SqliteIdentityStore::new(pool.clone()));
        let hub = Hub::new(Arc::new(SqliteMessageLog::new(pool)), identity.clone());
        Ok(Self {
            config,
            hub,
            identity,
            attachments,
            jwt_secret: Arc::new(jwt_secret),
            login_limiter: auth::LoginRateLimiter::new(5, std::time::Duration::from_secs(60)),
        })
    }
}

/// Configured secret, else the one persisted in the data dir, else a fresh
/// one that gets persisted.
async fn load_jwt_secret(config: &Config) -> Result<Vec<u8>> {
    if let Some(secret) = &config.jwt_secret {
        return Ok(secret.as_bytes().to_vec());
    }
    let path = config.data_dir.join("jwt.secret");
    if let Ok(text) = tokio::fs::read_to_string(&path).await {
        match STANDARD.decode(text.trim()) {
            Ok(bytes) if !bytes.is_empty() => return Ok(bytes),
            _ => warn!(path = %path.display(), "ignoring unreadable jwt secret"),
        }
    }
    let mut secret = vec![0u8; 32];
    rand::thread_rng().fill_bytes(&mut secret);
    tokio::fs::write(&path, STANDARD.encode(&secret))
        .await
        .context("persist jwt secret")?;
    info!(path = %path.display(), "generated jwt secret");
    Ok(secret)
}

/// Build the HTTP application router.
pub fn build_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/api/users", get(list_users))
        .route("/api/messages", get(history))
        .route("/api/update-profile", post(update_profile))
        .route("/api/upload-attachment", post(upload_attachment))
        .route("/ws", get(ws::ws_handler))
        .layer(DefaultBodyLimit::max(
            state.config.max_upload_bytes() as usize,
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));
    Router::new()
        .route("/api/health", get(health))
        .route("/api/register", post(register))
        .route("/api/login", post(login))
        .route("/uploads/:id", get(download_file))
        .merge(protected)
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

fn query_token(query: &str) -> Option<&str> {
    query
        .split('&')
        .find_map(|pair| pair.strip_prefix("token="))
}

async fn auth_middleware<B>(
    State(state): State<AppState>,
    mut req: Request<B>,
    next: Next<B>,
) -> Result<Response, StatusCode> {
    // browsers cannot set headers on a websocket upgrade
    let token = bearer_token(req.headers())
        .or_else(|| {
            if req.uri().path() == "/ws" {
                req.uri().query().and_then(query_token)
            } else {
                None
            }
        })
        .map(str::to_owned)
        .ok_or(StatusCode::UNAUTHORIZED)?;
    let claims =
        auth::verify_jwt(&state.jwt_secret, &token).map_err(|_| StatusCode::UNAUTHORIZED)?;
    req.extensions_mut().insert(claims);
    Ok(next.run(req).await)
}

#[derive(Serialize)]
struct ErrorResp {
    error: String,
}

type ApiError = (StatusCode, Json<ErrorResp>);

fn err(status: StatusCode, msg: &str) -> ApiError {
    (status, Json(ErrorResp { error: msg.into() }))
}

fn internal(e: anyhow::Error) -> ApiError {
    warn!(error = %e, "request failed");
    err(StatusCode::INTERNAL_SERVER_ERROR, "internal")
}

/// Run blocking storage work off the async workers.
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .context("blocking task failed")?
}

#[derive(Deserialize)]
struct RegisterReq {
    username: String,
    password: String,
}

async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterReq>,
) -> Result<Json<UserProfile>, ApiError> {
    if !identity::is_valid_username(&req.username) {
        return Err(err(StatusCode::BAD_REQUEST, "invalid_username"));
    }
    if req.password.chars().count() < auth::MIN_PASSWORD_LEN {
        return Err(err(StatusCode::BAD_REQUEST, "weak_password"));
    }
    let store = state.identity.clone();
    let created = blocking(move || {
        let hash = auth::hash_password(&req.password)?;
        store.create_user(&req.username, &hash)
    })
    .await;
    match created {
        Ok(profile) => {
            info!(username = %profile.username, "user registered");
            Ok(Json(profile))
        }
        Err(e) => match e.downcast_ref::<RegisterError>() {
            Some(reason) => Err(err(StatusCode::BAD_REQUEST, &reason.to_string())),
            None => Err(internal(e)),
        },
    }
}

#[derive(Deserialize)]
struct LoginReq {
    username: String,
    password: String,
}

#[derive(Serialize)]
struct LoginResp {
    token: String,
    #[serde(flatten)]
    user: UserProfile,
}

async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginReq>,
) -> Result<Json<LoginResp>, ApiError> {
    if !state.login_limiter.check(&req.username) {
        return Err(err(StatusCode::TOO_MANY_REQUESTS, "rate_limited"));
    }
    let store = state.identity.clone();
    let password = req.password;
    let username = req.username;
    let user = blocking(move || {
        Ok(store
            .credentials(&username)?
            .filter(|(_, hash)| auth::verify_password(&password, hash))
            .map(|(user, _)| user))
    })
    .await
    .map_err(internal)?
    .ok_or_else(|| err(StatusCode::BAD_REQUEST, "invalid_credentials"))?;
    let token = auth::issue_jwt(
        &state.jwt_secret,
        &user.username,
        time::Duration::minutes(state.config.token_ttl_minutes),
    )
    .map_err(internal)?;
    info!(username = %user.username, "user logged in");
    Ok(Json(LoginResp { token, user }))
}

async fn list_users(State(state): State<AppState>) -> Result<Json<Vec<UserProfile>>, ApiError> {
    let identity = state.hub.identity().clone();
    blocking(move || identity.list_all())
        .await
        .map(Json)
        .map_err(internal)
}

#[derive(Deserialize)]
struct HistoryQuery {
    user1: Option<String>,
    user2: Option<String>,
}

async fn history(
    State(state): State<AppState>,
    Extension(claims): Extension<auth::Claims>,
    Query(q): Query<HistoryQuery>,
) -> Result<Json<Vec<Message>>, ApiError> {
    let present = |v: Option<String>| v.filter(|s| !s.is_empty());
    let (Some(a), Some(b)) = (present(q.user1), present(q.user2)) else {
        return Err(err(StatusCode::BAD_REQUEST, "missing_users"));
    };
    if claims.sub != a && claims.sub != b {
        return Err(err(StatusCode::FORBIDDEN, "forbidden"));
    }
    let hub = state.hub.clone();
    blocking(move || hub.router().log().query_conversation(&a, &b))
        .await
        .map(Json)
        .map_err(internal)
}

async fn update_profile(
    State(state): State<AppState>,
    Extension(claims): Extension<auth::Claims>,
    mut multipart: Multipart,
) -> Result<Json<UserProfile>, ApiError> {
    let mut display_name = None;
    let mut avatar = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|_| err(StatusCode::BAD_REQUEST, "bad_multipart"))?
    {
        let name = field.name().unwrap_or_default().to_owned();
        match name.as_str() {
            "displayName" => {
                let text = field
                    .text()
                    .await
                    .map_err(|_| err(StatusCode::BAD_REQUEST, "bad_multipart"))?;
                display_name = Some(text);
            }
            "username" => {
                let text = field
                    .text()
                    .await
                    .map_err(|_| err(StatusCode::BAD_REQUEST, "bad_multipart"))?;
                if text != claims.sub {
                    return Err(err(StatusCode::FORBIDDEN, "forbidden"));
                }
            }
            "avatar" => {
                let file_name = field.file_name().map(str::to_owned);
                let data = field
                    .bytes()
                    .await
                    .map_err(|_| err(StatusCode::BAD_REQUEST, "bad_multipart"))?;
                if data.is_empty() {
                    continue;
                }
                if !files::is_image(&data) {
                    return Err(err(StatusCode::BAD_REQUEST, "not_an_image"));
                }
                let stored = state
                    .attachments
                    .save(data, file_name.as_deref())
                    .await
                    .map_err(internal)?;
                avatar = Some(stored.uri);
            }
            _ => {}
        }
    }

    let store = state.identity.clone();
    let username = claims.sub.clone();
    let profile = blocking(move || {
        store.update_profile(&username, display_name.as_deref(), avatar.as_deref())
    })
    .await
    .map_err(internal)?
    .ok_or_else(|| err(StatusCode::BAD_REQUEST, "user_not_found"))?;
    info!(username = %profile.username, "profile updated");
    state.hub.fanout().broadcast_profile_changed(&profile.username);
    Ok(Json(profile))
}

#[derive(Serialize)]
struct UploadResp {
    #[serde(rename = "fileUrl")]
    file_url: String,
}

async fn upload_attachment(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResp>, ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|_| err(StatusCode::BAD_REQUEST, "bad_multipart"))?
    {
        if field.name() != Some("attachment") {
            continue;
        }
        let file_name = field.file_name().map(str::to_owned);
        let data = field
            .bytes()
            .await
            .map_err(|_| err(StatusCode::BAD_REQUEST, "bad_multipart"))?;
        if data.is_empty() {
            break;
        }
        let stored = state
            .attachments
            .save(data, file_name.as_deref())
            .await
            .map_err(internal)?;
        return Ok(Json(UploadResp {
            file_url: stored.uri,
        }));
    }
    Err(err(StatusCode::BAD_REQUEST, "no_file"))
}

async fn download_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, StatusCode> {
    let path = state
        .attachments
        .file_path(&id)
        .ok_or(StatusCode::NOT_FOUND)?;
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|_| StatusCode::NOT_FOUND)?;
    let body = StreamBody::new(ReaderStream::new(file));
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&files::mime_for(&id))
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?,
    );
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("public, max-age=31536000, immutable"),
    );
    Ok((headers, body))
}

/// Run the HTTP server until ctrl-c.
pub async fn run_http_server(config: Config) -> Result<()> {
    let addr: SocketAddr = config.bind.parse().context("invalid bind address")?;
    let state = AppState::new(config).await?;
    info!(%addr, "listening");
    axum::Server::try_bind(&addr)?
        .serve(build_router(state).into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use tower::ServiceExt;

    async fn state() -> (AppState, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config {
            bind: "127.0.0.1:0".into(),
            data_dir: tmp.path().to_path_buf(),
            max_upload_mb: 1,
            logging_enabled: false,
            jwt_secret: None,
            token_ttl_minutes: 60,
        };
        (AppState::new(config).await.unwrap(), tmp)
    }

    #[test]
    fn token_sources() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert_eq!(bearer_token(&headers), Some("abc"));
        assert_eq!(query_token("x=1&token=def.ghi"), Some("def.ghi"));
        assert_eq!(query_token("x=1"), None);
    }

    #[tokio::test]
    async fn jwt_secret_persists_across_restarts() {
        let (first, tmp) = state().await;
        let mut config = first.config.clone();
        config.data_dir = tmp.path().to_path_buf();
        let second = AppState::new(config).await.unwrap();
        assert_eq!(first.jwt_secret, second.jwt_secret);
        assert_eq!(first.jwt_secret.len(), 32);
    }

    #[tokio::test]
    async fn protected_routes_need_token() {
        let (state, _tmp) = state().await;
        let app = build_router(state);
        for uri in ["/api/users", "/api/messages?user1=a&user2=b", "/ws?token=bogus"] {
            let resp = app
                .clone()
                .oneshot(Request::get(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::UNAUTHORIZED, "{uri}");
        }
        let resp = app
            .oneshot(Request::get("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn duplicate_registration_is_a_client_error() {
        let (state, _tmp) = state().await;
        let app = build_router(state);
        let register = || {
            Request::post("/api/register")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(r#"{"username":"alice","password":"hunter22"}"#))
                .unwrap()
        };
        let resp = app.clone().oneshot(register()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let resp = app.oneshot(register()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["error"], "user_exists");
    }

    #[tokio::test]
    async fn history_only_for_participants() {
        let (state, _tmp) = state().await;
        let token = auth::issue_jwt(&state.jwt_secret, "mallory", time::Duration::minutes(5))
            .unwrap();
        let app = build_router(state);
        let resp = app
            .clone()
            .oneshot(
                Request::get("/api/messages?user1=alice&user2=bob")
                    .header(header::AUTHORIZATION, format!("Bearer {token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        let resp = app
            .oneshot(
                Request::get("/api/messages?user1=mallory")
                    .header(header::AUTHORIZATION, format!("Bearer {token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
