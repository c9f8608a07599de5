//! HTTP surface of the vote server: public voting endpoints, the live vote
//! feed and the token-protected moderation console.

use crate::auth_utils::AuthUtils;
use crate::config::ServerConfig;
use crate::db_utils::{DbUtils, RECENT_REPORTS_LIMIT};
use crate::error::ApiError;
use crate::events::{VoteEvent, VoteEvents, NEW_VOTE_EVENT};
use crate::guard::{ceil_secs, client_key, Decision, UNKNOWN_CLIENT};
use crate::login_guard::{FailureOutcome, LoginGuard};
use crate::response::{success_response, vote_denial_message};
use crate::vote_guard::VoteGuard;
use anyhow::{Context, Result};
use axum::{
    extract::{ConnectInfo, Path, Query, Request, State},
    http::{
        header::{AUTHORIZATION, CONTENT_TYPE},
        HeaderMap, HeaderValue, Method,
    },
    middleware::{self, Next},
    response::{
        sse::{Event, KeepAlive, Sse},
        Response,
    },
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tokio_stream::{Stream, StreamExt};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

/// Longest report message kept, in characters.
pub const MAX_MESSAGE_CHARS: usize = 1000;
/// Default page size of the moderation report listing.
pub const ADMIN_PAGE_SIZE: i64 = 100;

#[derive(Clone)]
pub struct AppState {
    pub db: DbUtils,
    pub vote_guard: Arc<VoteGuard>,
    pub login_guard: Arc<LoginGuard>,
    pub auth: Arc<AuthUtils>,
    pub events: VoteEvents,
}

impl AppState {
    /// Wire the guards to `db`, which also serves as the durable ban store.
    pub fn new(db: DbUtils, config: &ServerConfig, auth: AuthUtils) -> Self {
        let vote_guard = VoteGuard::new(Arc::new(db.clone()), &config.vote_guard);
        let login_guard = LoginGuard::new(&config.login_guard);
        Self {
            db,
            vote_guard: Arc::new(vote_guard),
            login_guard: Arc::new(login_guard),
            auth: Arc::new(auth),
            events: VoteEvents::new(),
        }
    }
}

pub fn router(state: AppState, cors_origins: &[String]) -> Result<Router> {
    let admin = Router::new()
        .route("/api/admin/reports", get(admin_reports))
        .route("/api/admin/reports/:id", delete(delete_report))
        .route("/api/admin/player/:name", delete(delete_player))
        .route("/api/admin/bans", get(list_bans))
        .route("/api/admin/bans/:ip", delete(revoke_ban))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_admin));

    Ok(Router::new()
        .route("/api/vote", post(vote))
        .route("/api/leaderboard", get(leaderboard))
        .route("/api/recent", get(recent))
        .route("/api/player/:name", get(player))
        .route("/api/search", get(search))
        .route("/api/events", get(vote_feed))
        .route("/api/admin/login", post(admin_login))
        .route("/health", get(health))
        .merge(admin)
        .layer(cors_layer(cors_origins)?)
        .with_state(state))
}

fn cors_layer(origins: &[String]) -> Result<CorsLayer> {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([CONTENT_TYPE, AUTHORIZATION]);

    if origins.is_empty() {
        return Ok(layer.allow_origin(Any));
    }
    let origins = origins
        .iter()
        .map(|o| {
            HeaderValue::from_str(o).with_context(|| format!("Invalid CORS origin {:?}", o))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(layer.allow_origin(AllowOrigin::list(origins)))
}

/// First `X-Forwarded-For` entry, else the socket peer, else [`UNKNOWN_CLIENT`].
fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .map(|v| client_key(Some(v)));
    match forwarded {
        Some(ip) if ip != UNKNOWN_CLIENT => ip,
        _ => client_key(peer.map(|addr| addr.ip().to_string()).as_deref()),
    }
}

// ========== Public ==========

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteRequest {
    #[serde(default)]
    pub player_name: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Trimmed player name plus the trimmed, length-capped message.
fn validate_vote(request: VoteRequest) -> Result<(String, Option<String>), ApiError> {
    let player_name = request
        .player_name
        .ok_or_else(|| ApiError::BadRequest("Player name is required".to_string()))?;
    let player_name = player_name.trim();
    if player_name.is_empty() {
        return Err(ApiError::BadRequest("Player name cannot be empty".to_string()));
    }

    let message = request
        .message
        .map(|m| m.trim().chars().take(MAX_MESSAGE_CHARS).collect::<String>())
        .filter(|m| !m.is_empty());

    Ok((player_name.to_string(), message))
}

async fn vote(
    State(state): State<AppState>,
    headers: HeaderMap,
    peer: Option<ConnectInfo<SocketAddr>>,
    Json(request): Json<VoteRequest>,
) -> Result<Json<Value>, ApiError> {
    let ip = client_ip(&headers, peer.map(|ConnectInfo(addr)| addr));
    if let Decision::Deny(denial) = state.vote_guard.check_and_record(&ip, Utc::now()).await {
        return Err(ApiError::Denied {
            message: vote_denial_message(&denial),
            denial,
        });
    }

    let (player_name, message) = validate_vote(request)?;
    let total_votes = state
        .db
        .register_vote(&player_name, message.as_deref())
        .await?;

    state.events.publish(VoteEvent {
        player_name: player_name.clone(),
        message,
        total_votes,
        voted_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
    });

    Ok(Json(success_response(json!({
        "message": "Vote registered",
        "playerName": player_name,
        "totalVotes": total_votes,
    }))))
}

async fn leaderboard(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let leaderboard = state.db.get_leaderboard().await?;
    Ok(Json(success_response(json!({ "leaderboard": leaderboard }))))
}

async fn recent(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let recent_reports = state.db.get_recent_reports(RECENT_REPORTS_LIMIT).await?;
    Ok(Json(success_response(json!({ "recentReports": recent_reports }))))
}

async fn player(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    match state.db.get_player_details(&name).await? {
        Some(player) => Ok(Json(success_response(json!({ "player": player })))),
        None => Err(ApiError::NotFound("Player not found".to_string())),
    }
}

#[derive(Debug, Default, Deserialize)]
struct SearchQuery {
    q: Option<String>,
}

async fn search(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<Value>, ApiError> {
    let results = match query.q.as_deref().map(str::trim) {
        Some(q) if !q.is_empty() => state.db.search_players(q).await?,
        _ => Vec::new(),
    };
    Ok(Json(success_response(json!({ "results": results }))))
}

async fn vote_feed(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(state.events.subscribe()).filter_map(|received| {
        match received {
            Ok(vote) => Event::default()
                .event(NEW_VOTE_EVENT)
                .json_data(&vote)
                .ok()
                .map(Ok),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                log::warn!("vote feed subscriber lagged, skipped {} events", skipped);
                None
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

// ========== Admin ==========

#[derive(Debug, Default, Deserialize)]
pub struct LoginRequest {
    #[serde(default, alias = "key")]
    pub password: Option<String>,
}

async fn admin_login(
    State(state): State<AppState>,
    headers: HeaderMap,
    peer: Option<ConnectInfo<SocketAddr>>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<Value>, ApiError> {
    let ip = client_ip(&headers, peer.map(|ConnectInfo(addr)| addr));
    let now = Utc::now();

    if let Decision::Deny(denial) = state.login_guard.is_blocked(&ip, now) {
        return Err(ApiError::LoginBlocked {
            retry_after_secs: denial.retry_after_secs.unwrap_or(0),
        });
    }

    let password = request.password.unwrap_or_default();
    if !state.auth.verify_password(&password) {
        log::warn!("admin login failed: ip={}", ip);
        return Err(match state.login_guard.record_failure(&ip, now) {
            FailureOutcome::AttemptsLeft(attempts_left) => {
                ApiError::InvalidCredentials { attempts_left }
            }
            FailureOutcome::Block { duration } => ApiError::LoginBlocked {
                retry_after_secs: ceil_secs(duration),
            },
        });
    }

    state.login_guard.record_success(&ip);
    let token = state.auth.issue_token(now)?;
    log::info!("admin login: ip={}", ip);
    Ok(Json(success_response(json!({ "token": token }))))
}

/// Missing or malformed `Authorization` is 401; a token that fails verification is 403.
fn authorize(auth: &AuthUtils, headers: &HeaderMap) -> Result<(), ApiError> {
    let token = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or(ApiError::Unauthorized)?;
    if auth.verify_token(token) {
        Ok(())
    } else {
        Err(ApiError::Forbidden)
    }
}

async fn require_admin(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    authorize(&state.auth, request.headers())?;
    Ok(next.run(request).await)
}

#[derive(Debug, Default, Deserialize)]
struct AdminReportsQuery {
    q: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
}

async fn admin_reports(
    State(state): State<AppState>,
    Query(query): Query<AdminReportsQuery>,
) -> Result<Json<Value>, ApiError> {
    let reports = match query.q.as_deref().map(str::trim) {
        Some(q) if !q.is_empty() => state.db.search_admin_reports(q).await?,
        _ => {
            let limit = query.limit.unwrap_or(ADMIN_PAGE_SIZE).clamp(1, ADMIN_PAGE_SIZE);
            let offset = query.offset.unwrap_or(0).max(0);
            state.db.get_admin_reports(limit, offset).await?
        }
    };
    Ok(Json(success_response(json!({ "reports": reports }))))
}

async fn delete_report(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    if !state.db.delete_report(id).await? {
        return Err(ApiError::NotFound("Report not found".to_string()));
    }
    Ok(Json(success_response(json!({ "message": "Report deleted" }))))
}

async fn delete_player(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let deleted = state.db.delete_player_reports(&name).await?;
    Ok(Json(success_response(json!({
        "message": "Player reports deleted",
        "deleted": deleted,
    }))))
}

async fn list_bans(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let bans = state.db.get_bans(Utc::now()).await?;
    Ok(Json(success_response(json!({ "bans": bans }))))
}

async fn revoke_ban(
    State(state): State<AppState>,
    Path(ip): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if !state.db.revoke_ban(&ip).await? {
        return Err(ApiError::NotFound("Ban not found".to_string()));
    }
    Ok(Json(success_response(json!({ "message": "Ban revoked" }))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ban_store::BanStore;
    use axum::http::{header::RETRY_AFTER, StatusCode};
    use axum::response::IntoResponse;
    use chrono::Duration;
    use secrecy::SecretString;

    const PASSWORD: &str = "Sup3r!secret";

    async fn test_state() -> AppState {
        let db = DbUtils::new(":memory:").await.unwrap();
        let auth = AuthUtils::new(
            SecretString::new(PASSWORD.to_string()),
            SecretString::new("unit-test-signing-key".to_string()),
        );
        AppState::new(db, &ServerConfig::default(), auth)
    }

    fn from_ip(ip: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_str(ip).unwrap());
        headers
    }

    fn vote_request(name: &str, message: Option<&str>) -> Json<VoteRequest> {
        Json(VoteRequest {
            player_name: Some(name.to_string()),
            message: message.map(str::to_string),
        })
    }

    fn login_request(password: &str) -> Json<LoginRequest> {
        Json(LoginRequest {
            password: Some(password.to_string()),
        })
    }

    #[test]
    fn test_client_ip_resolution() {
        let peer: SocketAddr = "192.0.2.7:5555".parse().unwrap();

        assert_eq!(client_ip(&from_ip("203.0.113.9, 10.0.0.1"), Some(peer)), "203.0.113.9");
        assert_eq!(client_ip(&HeaderMap::new(), Some(peer)), "192.0.2.7");
        assert_eq!(client_ip(&from_ip(" , "), Some(peer)), "192.0.2.7");
        assert_eq!(client_ip(&HeaderMap::new(), None), UNKNOWN_CLIENT);
    }

    #[test]
    fn test_validate_vote() {
        let (name, message) =
            validate_vote(vote_request("  Raider  ", Some("  camping  ")).0).unwrap();
        assert_eq!(name, "Raider");
        assert_eq!(message.as_deref(), Some("camping"));

        let (_, blank) = validate_vote(vote_request("Raider", Some("   ")).0).unwrap();
        assert_eq!(blank, None);

        let long = "é".repeat(MAX_MESSAGE_CHARS + 500);
        let (_, truncated) = validate_vote(vote_request("Raider", Some(&long)).0).unwrap();
        assert_eq!(truncated.unwrap().chars().count(), MAX_MESSAGE_CHARS);

        assert!(matches!(
            validate_vote(vote_request("   ", None).0),
            Err(ApiError::BadRequest(_))
        ));
        assert!(matches!(
            validate_vote(VoteRequest::default()),
            Err(ApiError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_vote_then_rate_limited() -> anyhow::Result<()> {
        let state = test_state().await;
        let mut feed = state.events.subscribe();

        let Json(body) = vote(
            State(state.clone()),
            from_ip("198.51.100.1"),
            None,
            vote_request("Raider", Some("griefing")),
        )
        .await
        .unwrap();
        assert_eq!(body["success"], true);
        assert_eq!(body["playerName"], "Raider");
        assert_eq!(body["totalVotes"], 1);

        let event = feed.recv().await?;
        assert_eq!(event.player_name, "Raider");
        assert_eq!(event.total_votes, 1);

        let response = vote(
            State(state.clone()),
            from_ip("198.51.100.1"),
            None,
            vote_request("Raider", None),
        )
        .await
        .unwrap_err()
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[RETRY_AFTER], "30");

        assert_eq!(state.db.get_player_votes("Raider").await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_banned_client_is_forbidden() -> anyhow::Result<()> {
        let state = test_state().await;
        state
            .db
            .upsert("198.51.100.2", Utc::now() + Duration::hours(12))
            .await?;

        let response = vote(
            State(state.clone()),
            from_ip("198.51.100.2"),
            None,
            vote_request("Raider", None),
        )
        .await
        .unwrap_err()
        .into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        Ok(())
    }

    #[tokio::test]
    async fn test_empty_name_rejected() {
        let state = test_state().await;
        let response = vote(State(state), from_ip("198.51.100.3"), None, vote_request(" ", None))
            .await
            .unwrap_err()
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_player_and_search() -> anyhow::Result<()> {
        let state = test_state().await;
        state.db.register_vote("Raider", None).await?;

        let Json(body) = player(State(state.clone()), Path("Raider".to_string()))
            .await
            .unwrap();
        assert_eq!(body["player"]["totalVotes"], 1);

        let missing = player(State(state.clone()), Path("Nobody".to_string()))
            .await
            .unwrap_err()
            .into_response();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let Json(empty) = search(State(state.clone()), Query(SearchQuery { q: None }))
            .await
            .unwrap();
        assert_eq!(empty["results"], json!([]));

        let Json(found) = search(
            State(state),
            Query(SearchQuery {
                q: Some("rai".to_string()),
            }),
        )
        .await
        .unwrap();
        assert_eq!(found["results"][0]["playerName"], "Raider");
        Ok(())
    }

    #[tokio::test]
    async fn test_admin_login_flow() {
        let state = test_state().await;
        let ip = from_ip("198.51.100.4");

        for expected_left in (0..5).rev() {
            let err = admin_login(State(state.clone()), ip.clone(), None, login_request("wrong"))
                .await
                .unwrap_err();
            assert!(matches!(
                err,
                ApiError::InvalidCredentials { attempts_left } if attempts_left == expected_left
            ));
        }

        let err = admin_login(State(state.clone()), ip.clone(), None, login_request("wrong"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::LoginBlocked { retry_after_secs: 60 }));

        // Even the right password is refused while blocked.
        let err = admin_login(State(state.clone()), ip.clone(), None, login_request(PASSWORD))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::LoginBlocked { .. }));

        let Json(body) = admin_login(
            State(state.clone()),
            from_ip("198.51.100.5"),
            None,
            login_request(PASSWORD),
        )
        .await
        .unwrap();
        let token = body["token"].as_str().unwrap();
        assert!(state.auth.verify_token(token));
    }

    #[tokio::test]
    async fn test_authorize() {
        let state = test_state().await;
        let token = state.auth.issue_token(Utc::now()).unwrap();

        assert!(matches!(
            authorize(&state.auth, &HeaderMap::new()),
            Err(ApiError::Unauthorized)
        ));

        let mut bad = HeaderMap::new();
        bad.insert(AUTHORIZATION, HeaderValue::from_static("Bearer not-a-token"));
        assert!(matches!(authorize(&state.auth, &bad), Err(ApiError::Forbidden)));

        let mut good = HeaderMap::new();
        good.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", token)).unwrap(),
        );
        assert!(authorize(&state.auth, &good).is_ok());
    }

    #[tokio::test]
    async fn test_moderation_endpoints() -> anyhow::Result<()> {
        let state = test_state().await;
        let now = Utc::now();
        state.db.register_vote("Raider", Some("spawn camping")).await?;
        state.db.upsert("198.51.100.6", now + Duration::hours(1)).await?;

        let Json(body) = admin_reports(State(state.clone()), Query(AdminReportsQuery::default()))
            .await
            .unwrap();
        let id = body["reports"][0]["id"].as_i64().unwrap();

        delete_report(State(state.clone()), Path(id)).await.unwrap();
        let gone = delete_report(State(state.clone()), Path(id))
            .await
            .unwrap_err()
            .into_response();
        assert_eq!(gone.status(), StatusCode::NOT_FOUND);

        let Json(bans) = list_bans(State(state.clone())).await.unwrap();
        assert_eq!(bans["bans"][0]["ip"], "198.51.100.6");

        revoke_ban(State(state.clone()), Path("198.51.100.6".to_string()))
            .await
            .unwrap();
        assert_eq!(state.db.get("198.51.100.6").await?, None);
        Ok(())
    }

    #[test]
    fn test_cors_layer_rejects_bad_origin() {
        assert!(cors_layer(&[]).is_ok());
        assert!(cors_layer(&["https://votes.example.com".to_string()]).is_ok());
        assert!(cors_layer(&["bad\norigin".to_string()]).is_err());
    }
}
