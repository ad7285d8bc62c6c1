use anyhow::{Context, Result};
use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::validate_request::ValidateRequestHeaderLayer;
use tracing::{error, info, warn};

use crate::bid::{Bid, BidQuery, BidStatus, BidType};
use crate::cache::Cache;
use crate::config::{Config, ConfigSnapshot};
use crate::db::{now_local, BlacklistedPhone, ConfigRow, CycleLogRow, DbHandle, EventRow};
use crate::error::CrawlerError;
use crate::rate::DailyRate;
use crate::scheduler::working_time;
use crate::stats::{daily_statistics, DailyStatistics};
use crate::transaction::{Transaction, TransactionStatus};
use crate::websocket::{ws_handler, DashboardEvent, EventSender};

/// Shared state for the dashboard server.
#[derive(Clone)]
pub struct AppState {
    pub db: DbHandle,
    pub cache: Arc<dyn Cache>,
    pub event_tx: EventSender,
    pub default_refresh_minutes: u64,
    pub trader_bank: String,
    pub trader_currency: String,
}

// ─── REST response types ───────────────────────────────

#[derive(Serialize)]
pub struct ErrorResponse {
    error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);
type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

fn api_error(e: anyhow::Error) -> ApiError {
    let status = match e.downcast_ref::<CrawlerError>() {
        Some(CrawlerError::NotFound { .. }) => StatusCode::NOT_FOUND,
        Some(CrawlerError::InvalidTransition { .. }) => StatusCode::CONFLICT,
        Some(CrawlerError::InvalidConfig(_)) | Some(CrawlerError::InvalidTime(_)) => {
            StatusCode::BAD_REQUEST
        }
        Some(CrawlerError::ConfigMissing) => StatusCode::SERVICE_UNAVAILABLE,
        _ => {
            error!("Dashboard request failed: {:#}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (
        status,
        Json(ErrorResponse {
            error: format!("{:#}", e),
        }),
    )
}

#[derive(Serialize)]
struct StatusResponse {
    config_loaded: bool,
    dry_run: Option<bool>,
    working_time: Option<bool>,
    refresh_minutes: Option<u64>,
    resources: usize,
    next_cycle: i64,
    last_cycle: Option<CycleLogRow>,
    fund: f64,
    hanging_transactions: usize,
}

#[derive(Serialize)]
struct ConfigResponse {
    current: Option<ConfigSnapshot>,
    history: Vec<ConfigRow>,
}

#[derive(Deserialize)]
pub struct BidsQuery {
    date: Option<NaiveDate>,
    bid_type: Option<BidType>,
    status: Option<BidStatus>,
    resource_id: Option<i64>,
    limit: Option<i64>,
}

impl BidsQuery {
    fn day(&self) -> NaiveDate {
        self.date.unwrap_or_else(|| now_local().date())
    }

    fn to_filter(&self) -> BidQuery {
        BidQuery {
            resource_id: self.resource_id,
            bid_type: self.bid_type,
            statuses: self.status.into_iter().collect(),
            in_use_only: false,
            limit: self.limit.map(|l| l.clamp(1, 1000)),
        }
    }
}

#[derive(Deserialize)]
pub struct DayQuery {
    date: Option<NaiveDate>,
}

#[derive(Deserialize)]
pub struct LimitQuery {
    limit: Option<i64>,
}

#[derive(Deserialize)]
pub struct RatesQuery {
    bank: Option<String>,
    currency: Option<String>,
    limit: Option<i64>,
}

#[derive(Deserialize)]
pub struct BidStatusRequest {
    status: BidStatus,
}

#[derive(Deserialize, Default)]
pub struct BanRequest {
    reason: Option<String>,
}

#[derive(Deserialize)]
pub struct TransactionStatusRequest {
    status: TransactionStatus,
}

// ─── Handlers ──────────────────────────────────────────

async fn api_status(State(state): State<AppState>) -> ApiResult<StatusResponse> {
    let db = state.db.acquire().map_err(api_error)?;
    let snapshot = db.load_config().ok();
    let now = now_local();

    Ok(Json(StatusResponse {
        config_loaded: snapshot.is_some(),
        dry_run: snapshot.as_ref().map(|s| s.dry_run),
        working_time: snapshot
            .as_ref()
            .and_then(|s| working_time(s, now).ok()),
        refresh_minutes: snapshot.as_ref().map(|s| {
            s.refresh_interval(state.default_refresh_minutes).as_secs() / 60
        }),
        resources: db.list_resources().map_err(api_error)?.len(),
        next_cycle: db.next_cycle_number().map_err(api_error)?,
        last_cycle: db
            .recent_cycles(1)
            .map_err(api_error)?
            .into_iter()
            .next(),
        fund: db.current_fund().map_err(api_error)?,
        hanging_transactions: db.hanging_transactions().map_err(api_error)?.len(),
    }))
}

async fn api_bids(
    State(state): State<AppState>,
    Query(params): Query<BidsQuery>,
) -> ApiResult<Vec<Bid>> {
    let db = state.db.acquire().map_err(api_error)?;
    let bids = db
        .daily_bids(params.day(), &params.to_filter())
        .map_err(api_error)?;
    Ok(Json(bids))
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

pub fn bids_to_csv(bids: &[Bid]) -> String {
    let mut out =
        String::from("id,created,resource,bid_type,currency,rate,amount,phone,status,dry_run\n");
    for b in bids {
        let row = [
            b.id.to_string(),
            b.created.format("%Y-%m-%d %H:%M:%S").to_string(),
            csv_field(b.resource.as_deref().unwrap_or("")),
            b.bid_type.to_string(),
            csv_field(&b.currency),
            b.rate.to_string(),
            b.amount.to_string(),
            csv_field(&b.phone),
            b.status.to_string(),
            b.dry_run.to_string(),
        ];
        out.push_str(&row.join(","));
        out.push('\n');
    }
    out
}

async fn api_bids_csv(
    State(state): State<AppState>,
    Query(params): Query<BidsQuery>,
) -> std::result::Result<Response, ApiError> {
    let day = params.day();
    let bids = {
        let db = state.db.acquire().map_err(api_error)?;
        db.daily_bids(day, &params.to_filter()).map_err(api_error)?
    };
    let filename = format!("attachment; filename=\"bids-{}.csv\"", day);
    Ok((
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (header::CONTENT_DISPOSITION, filename),
        ],
        bids_to_csv(&bids),
    )
        .into_response())
}

async fn api_set_bid_status(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<BidStatusRequest>,
) -> ApiResult<Bid> {
    let bid = state
        .db
        .acquire()
        .map_err(api_error)?
        .set_bid_status(id, body.status)
        .map_err(api_error)?;
    info!(bid_id = id, status = %bid.status, "Bid status changed");
    let _ = state.event_tx.send(DashboardEvent::BidStatusChanged {
        bid_id: id,
        status: bid.status,
    });
    Ok(Json(bid))
}

/// Blacklist the phone of a bid and reject the bid when its status allows.
async fn api_ban_bid(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    body: Option<Json<BanRequest>>,
) -> ApiResult<Value> {
    let reason = body
        .and_then(|Json(b)| b.reason)
        .unwrap_or_else(|| "banned from dashboard".to_string());

    let db = state.db.acquire().map_err(api_error)?;
    let bid = db
        .get_bid(id)
        .map_err(api_error)?
        .ok_or_else(|| api_error(CrawlerError::NotFound { entity: "bid", id }.into()))?;

    db.blacklist_phone(&bid.phone, &reason).map_err(api_error)?;
    let status = if bid.status.can_transition_to(BidStatus::Rejected) {
        db.set_bid_status(id, BidStatus::Rejected)
            .map_err(api_error)?
            .status
    } else {
        bid.status
    };
    warn!(phone = %bid.phone, reason = %reason, "Phone banned");

    Ok(Json(json!({ "phone": bid.phone, "banned": true, "status": status })))
}

async fn api_delete_bid(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> std::result::Result<StatusCode, ApiError> {
    let deleted = state
        .db
        .acquire()
        .map_err(api_error)?
        .delete_bid(id)
        .map_err(api_error)?;
    if deleted {
        info!(bid_id = id, "Bid deleted");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(api_error(CrawlerError::NotFound { entity: "bid", id }.into()))
    }
}

async fn api_get_config(
    State(state): State<AppState>,
    Query(params): Query<LimitQuery>,
) -> ApiResult<ConfigResponse> {
    let db = state.db.acquire().map_err(api_error)?;
    Ok(Json(ConfigResponse {
        current: db.load_config().ok(),
        history: db
            .config_history(params.limit.unwrap_or(20).clamp(1, 200))
            .map_err(api_error)?,
    }))
}

async fn api_push_config(
    State(state): State<AppState>,
    Json(snapshot): Json<ConfigSnapshot>,
) -> std::result::Result<(StatusCode, Json<Value>), ApiError> {
    let id = state
        .db
        .acquire()
        .map_err(api_error)?
        .insert_config(&snapshot, now_local())
        .map_err(api_error)?;
    info!(config_id = id, "Config updated from dashboard");
    Ok((StatusCode::CREATED, Json(json!({ "id": id }))))
}

async fn api_stats(
    State(state): State<AppState>,
    Query(params): Query<DayQuery>,
) -> ApiResult<DailyStatistics> {
    let day = params.date.unwrap_or_else(|| now_local().date());
    let db = state.db.acquire().map_err(api_error)?;
    let snapshot = db.load_config().map_err(api_error)?;
    let stats = daily_statistics(&db, &snapshot, day).map_err(api_error)?;
    Ok(Json(stats))
}

async fn api_transactions(State(state): State<AppState>) -> ApiResult<Vec<Transaction>> {
    let db = state.db.acquire().map_err(api_error)?;
    Ok(Json(db.transactions(&[]).map_err(api_error)?))
}

async fn api_set_transaction_status(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<TransactionStatusRequest>,
) -> ApiResult<Transaction> {
    let t = state
        .db
        .acquire()
        .map_err(api_error)?
        .set_transaction_status(id, body.status)
        .map_err(api_error)?;
    info!(transaction_id = id, status = %t.status, "Transaction status changed");
    Ok(Json(t))
}

async fn api_rates(
    State(state): State<AppState>,
    Query(params): Query<RatesQuery>,
) -> ApiResult<Vec<DailyRate>> {
    let bank = params.bank.unwrap_or_else(|| state.trader_bank.clone());
    let currency = params
        .currency
        .unwrap_or_else(|| state.trader_currency.clone());
    let db = state.db.acquire().map_err(api_error)?;
    let rates = db
        .rates(&bank, &currency, params.limit.unwrap_or(30).clamp(1, 365))
        .map_err(api_error)?;
    Ok(Json(rates))
}

async fn api_phones(State(state): State<AppState>) -> ApiResult<Vec<BlacklistedPhone>> {
    let db = state.db.acquire().map_err(api_error)?;
    Ok(Json(db.blacklisted_phones().map_err(api_error)?))
}

async fn api_events(
    State(state): State<AppState>,
    Query(params): Query<LimitQuery>,
) -> ApiResult<Vec<EventRow>> {
    let db = state.db.acquire().map_err(api_error)?;
    let events = db
        .recent_events(params.limit.unwrap_or(50).clamp(1, 500))
        .map_err(api_error)?;
    Ok(Json(events))
}

/// Latest `{in_bids, out_bids}` grabbed for a resource.
async fn api_cache(
    State(state): State<AppState>,
    Path(resource): Path<String>,
) -> ApiResult<Value> {
    match state.cache.get(&resource).await.map_err(api_error)? {
        Some(value) => Ok(Json(value)),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("Nothing cached for '{}'", resource),
            }),
        )),
    }
}

// ─── Router & server startup ───────────────────────────

fn build_router(state: AppState, password: &str) -> Router {
    let api_routes = Router::new()
        .route("/api/status", get(api_status))
        .route("/api/bids", get(api_bids))
        .route("/api/bids.csv", get(api_bids_csv))
        .route("/api/bids/:id", axum::routing::delete(api_delete_bid))
        .route("/api/bids/:id/status", post(api_set_bid_status))
        .route("/api/bids/:id/ban", post(api_ban_bid))
        .route("/api/config", get(api_get_config).post(api_push_config))
        .route("/api/stats", get(api_stats))
        .route("/api/transactions", get(api_transactions))
        .route(
            "/api/transactions/:id/status",
            post(api_set_transaction_status),
        )
        .route("/api/rates", get(api_rates))
        .route("/api/phones", get(api_phones))
        .route("/api/events", get(api_events))
        .route("/api/cache/:resource", get(api_cache))
        .route("/ws", get(ws_handler).with_state(state.event_tx.clone()));

    let app = api_routes.with_state(state);

    if password.is_empty() {
        app
    } else {
        app.layer(ValidateRequestHeaderLayer::basic("admin", password))
    }
}

/// Start the dashboard HTTP + WebSocket server.
/// Runs forever; call from `tokio::spawn`.
pub async fn start_dashboard(
    config: &Config,
    db: DbHandle,
    cache: Arc<dyn Cache>,
    event_tx: EventSender,
) -> Result<()> {
    let state = AppState {
        db,
        cache,
        event_tx,
        default_refresh_minutes: config.default_refresh_minutes,
        trader_bank: config.trader_bank.clone(),
        trader_currency: config.trader_currency.clone(),
    };

    let app = build_router(state, &config.dashboard_password);
    let addr = format!("0.0.0.0:{}", config.dashboard_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind dashboard to {}", addr))?;

    info!("Dashboard listening on http://{}", addr);
    axum::serve(listener, app)
        .await
        .context("Dashboard server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bid::NewBid;
    use crate::cache::MemoryCache;
    use crate::db::Database;
    use crate::resource::Resource;
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    fn test_state() -> AppState {
        let db = Database::open_in_memory().unwrap();
        db.ensure_fund_seeded(10_000.0).unwrap();
        AppState {
            db: DbHandle::new(db),
            cache: Arc::new(MemoryCache::new(Duration::from_secs(60))),
            event_tx: crate::websocket::new_event_channel(),
            default_refresh_minutes: 5,
            trader_bank: "privatbank".to_string(),
            trader_currency: "USD".to_string(),
        }
    }

    fn test_router(state: AppState) -> Router {
        build_router(state, "")
    }

    fn seed_bid(state: &AppState, phone: &str) -> i64 {
        let db = state.db.acquire().unwrap();
        let (resource_id, _) = db.get_or_insert_resource(&Resource::named("finance")).unwrap();
        let bid = NewBid {
            rate: 26.0,
            amount: 100.0,
            currency: "USD".to_string(),
            phone: phone.to_string(),
            bid_type: BidType::In,
        };
        db.insert_bid(&bid, resource_id, false, now_local()).unwrap()
    }

    async fn body_json(resp: Response) -> Value {
        let body = axum::body::to_bytes(resp.into_body(), 1_000_000)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_status_without_config() {
        let app = test_router(test_state());
        let resp = app
            .oneshot(Request::get("/api/status").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["config_loaded"], false);
        assert_eq!(json["fund"], 10_000.0);
        assert_eq!(json["next_cycle"], 1);
    }

    #[tokio::test]
    async fn test_push_and_read_config() {
        let state = test_state();
        let resp = test_router(state.clone())
            .oneshot(post_json(
                "/api/config",
                json!({"DRY_RUN": true, "REFRESH_PERIOD_MINUTES": 10, "TIME_DAY_STARTS": "06:00"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);

        let resp = test_router(state.clone())
            .oneshot(Request::get("/api/config").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json = body_json(resp).await;
        assert_eq!(json["current"]["REFRESH_PERIOD_MINUTES"], 10);
        assert_eq!(json["history"].as_array().unwrap().len(), 1);

        let resp = test_router(state)
            .oneshot(Request::get("/api/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json = body_json(resp).await;
        assert_eq!(json["dry_run"], true);
        assert_eq!(json["refresh_minutes"], 10);
    }

    #[tokio::test]
    async fn test_push_invalid_config_rejected() {
        let resp = test_router(test_state())
            .oneshot(post_json("/api/config", json!({"TIME_DAY_ENDS": "late"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_push_oversized_refresh_rejected() {
        let state = test_state();
        let resp = test_router(state.clone())
            .oneshot(post_json(
                "/api/config",
                json!({"REFRESH_PERIOD_MINUTES": 400_000_000_000_000_000u64}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = test_router(state)
            .oneshot(Request::get("/api/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["config_loaded"], false);
    }

    #[tokio::test]
    async fn test_bids_listing_and_status_change() {
        let state = test_state();
        let id = seed_bid(&state, "+380501112233");
        let mut events = state.event_tx.subscribe();

        let resp = test_router(state.clone())
            .oneshot(Request::get("/api/bids").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json = body_json(resp).await;
        assert_eq!(json.as_array().unwrap().len(), 1);
        assert_eq!(json[0]["status"], "new");
        assert_eq!(json[0]["resource"], "finance");

        let resp = test_router(state.clone())
            .oneshot(post_json(
                &format!("/api/bids/{}/status", id),
                json!({"status": "called"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["status"], "called");
        assert!(matches!(
            events.try_recv().unwrap(),
            DashboardEvent::BidStatusChanged {
                status: BidStatus::Called,
                ..
            }
        ));

        // Called bids cannot go back to notified
        let resp = test_router(state)
            .oneshot(post_json(
                &format!("/api/bids/{}/status", id),
                json!({"status": "notified"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_ban_and_delete_bid() {
        let state = test_state();
        let id = seed_bid(&state, "+380671234567");

        let resp = test_router(state.clone())
            .oneshot(post_json(
                &format!("/api/bids/{}/ban", id),
                json!({"reason": "reseller"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["status"], "rejected");

        let resp = test_router(state.clone())
            .oneshot(Request::get("/api/phones").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json = body_json(resp).await;
        assert_eq!(json[0]["phone"], "+380671234567");
        assert_eq!(json[0]["reason"], "reseller");

        let resp = test_router(state.clone())
            .oneshot(
                Request::delete(format!("/api/bids/{}", id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        let resp = test_router(state)
            .oneshot(
                Request::delete(format!("/api/bids/{}", id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_bids_csv_export() {
        let state = test_state();
        seed_bid(&state, "+380, office");

        let resp = test_router(state)
            .oneshot(Request::get("/api/bids.csv").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers()[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/csv"));

        let body = axum::body::to_bytes(resp.into_body(), 1_000_000)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("id,created,resource"));
        assert!(lines[1].contains("\"+380, office\""));
    }

    #[tokio::test]
    async fn test_stats_requires_config() {
        let state = test_state();
        let resp = test_router(state.clone())
            .oneshot(Request::get("/api/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        state
            .db
            .acquire()
            .unwrap()
            .insert_config(&ConfigSnapshot::default(), now_local())
            .unwrap();
        seed_bid(&state, "a");
        let resp = test_router(state)
            .oneshot(Request::get("/api/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["total_bids"], 1);
    }

    #[tokio::test]
    async fn test_cache_endpoint() {
        let state = test_state();
        state
            .cache
            .set("finance", json!({"in_bids": [], "out_bids": []}))
            .await
            .unwrap();

        let resp = test_router(state.clone())
            .oneshot(Request::get("/api/cache/finance").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = test_router(state)
            .oneshot(Request::get("/api/cache/unknown").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_transaction_endpoints() {
        let state = test_state();
        let id = {
            let db = state.db.acquire().unwrap();
            let id = db
                .insert_transaction(&crate::transaction::NewTransaction {
                    bank: "privatbank".to_string(),
                    currency: "USD".to_string(),
                    amount: 100.0,
                    rate_buy: 26.4,
                    rate_sale: 26.0,
                    date_opened: now_local(),
                })
                .unwrap();
            db.close_transaction(id, 26.8, now_local()).unwrap();
            id
        };

        let resp = test_router(state.clone())
            .oneshot(Request::get("/api/transactions").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(body_json(resp).await[0]["status"], "wait_sale");

        let resp = test_router(state)
            .oneshot(post_json(
                &format!("/api/transactions/{}/status", id),
                json!({"status": "completed"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["status"], "completed");
    }

    #[tokio::test]
    async fn test_basic_auth_enforced() {
        let app = build_router(test_state(), "secret");
        let resp = app
            .oneshot(Request::get("/api/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }
}
