use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::bid::BidStatus;

/// Events pushed to connected dashboard clients via WebSocket.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DashboardEvent {
    CycleComplete {
        cycle_number: i64,
        working: bool,
        grabbers_run: i64,
        grabbers_failed: i64,
        bids_inserted: i64,
        bids_inactivated: i64,
        bids_notified: i64,
    },
    ResourceUpdated {
        resource: String,
        fetched: usize,
        inserted: usize,
        inactivated: usize,
    },
    BidStatusChanged {
        bid_id: i64,
        status: BidStatus,
    },
    TransactionOpened {
        transaction_id: i64,
        amount: f64,
        rate_buy: f64,
    },
    TransactionClosed {
        transaction_id: i64,
        amount: f64,
        rate_close: f64,
        profit: f64,
    },
}

pub type EventSender = broadcast::Sender<DashboardEvent>;

/// Create a new broadcast channel for dashboard events.
pub fn new_event_channel() -> EventSender {
    let (tx, _) = broadcast::channel(64);
    tx
}

impl DashboardEvent {
    /// Wire name of the event, as found in its `type` field.
    pub fn kind(&self) -> &'static str {
        match self {
            DashboardEvent::CycleComplete { .. } => "cycle_complete",
            DashboardEvent::ResourceUpdated { .. } => "resource_updated",
            DashboardEvent::BidStatusChanged { .. } => "bid_status_changed",
            DashboardEvent::TransactionOpened { .. } => "transaction_opened",
            DashboardEvent::TransactionClosed { .. } => "transaction_closed",
        }
    }
}

/// What a client may send: `{"subscribe": ["cycle_complete", ...]}`.
/// An empty list means every event.
#[derive(Debug, Default, Deserialize)]
struct Subscription {
    #[serde(default)]
    subscribe: Vec<String>,
}

impl Subscription {
    fn wants(&self, event: &DashboardEvent) -> bool {
        self.subscribe.is_empty() || self.subscribe.iter().any(|k| k == event.kind())
    }
}

/// Axum handler: upgrade HTTP to WebSocket, then forward events.
pub async fn ws_handler(ws: WebSocketUpgrade, State(tx): State<EventSender>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| forward_events(socket, tx))
}

async fn forward_events(mut socket: WebSocket, tx: EventSender) {
    let mut rx = tx.subscribe();
    let mut subscription = Subscription::default();
    debug!("Dashboard client connected");

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Ok(event) if subscription.wants(&event) => {
                    let Ok(text) = serde_json::to_string(&event) else {
                        warn!(kind = event.kind(), "Failed to serialize dashboard event");
                        continue;
                    };
                    if socket.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Dashboard client is lagging behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<Subscription>(&text) {
                    Ok(next) => {
                        debug!(kinds = ?next.subscribe, "Dashboard client subscription changed");
                        subscription = next;
                    }
                    Err(e) => debug!("Ignoring client message: {}", e),
                },
                Some(Ok(Message::Ping(payload))) => {
                    if socket.send(Message::Pong(payload)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    debug!("Dashboard client disconnected");
}
