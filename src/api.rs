//! Ops API: health, manual deposit replay, manual re-notification, and
//! outbox visibility. Validation and not-found conditions answer with a
//! structured `{reason}` body; queue-facing semantics live elsewhere.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rocket::http::Status;
use rocket::response::status::Custom;
use rocket::serde::json::Json;
use rocket::{Route, State, get, post, routes};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::deposit::{DepositVerifierRegistry, Verification, publish_verified};
use crate::model::Blockchain;
use crate::outbox::Outbox;
use crate::transaction::{self as transaction_repo, TransactionEventDispatcher};

#[derive(Serialize, Deserialize)]
struct HealthResponse {
    status: String,
    timestamp: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
struct ReasonBody {
    reason: String,
}

type OpsError = Custom<Json<ReasonBody>>;

fn ops_error(status: Status, reason: impl Into<String>) -> OpsError {
    Custom(
        status,
        Json(ReasonBody {
            reason: reason.into(),
        }),
    )
}

#[get("/health")]
fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: Utc::now(),
    })
}

#[derive(Serialize, Deserialize)]
struct ReplayRequest {
    blockchain: Blockchain,
    on_chain_id: String,
    transaction_id: Uuid,
}

#[derive(Serialize, Deserialize)]
struct ReplayResponse {
    status: String,
    transaction_id: Uuid,
}

/// Manual replay of one on-chain event through the verifier and the outbox,
/// identical in effect to the listener and the reconciliation sweep
/// observing it.
#[post("/ops/deposits/replay", format = "json", data = "<request>")]
async fn replay_deposit(
    request: Json<ReplayRequest>,
    verifiers: &State<Arc<DepositVerifierRegistry>>,
    outbox: &State<Arc<Outbox>>,
) -> Result<Json<ReplayResponse>, OpsError> {
    let verifier = verifiers
        .get(request.blockchain)
        .map_err(|e| ops_error(Status::BadRequest, e.to_string()))?;

    let verification = verifier
        .verify_notification(&request.on_chain_id, request.transaction_id)
        .await
        .map_err(|e| ops_error(Status::BadGateway, e.to_string()))?;

    match verification {
        Verification::Verified(msg) => {
            publish_verified(outbox, &msg)
                .await
                .map_err(|e| ops_error(Status::InternalServerError, e.to_string()))?;

            Ok(Json(ReplayResponse {
                status: "enqueued".to_string(),
                transaction_id: msg.transaction_id,
            }))
        }
        Verification::Rejected(rejection) => Err(ops_error(
            Status::new(rejection.http_status()),
            rejection.to_string(),
        )),
    }
}

#[derive(Serialize, Deserialize)]
struct NotifyRequest {
    transaction_id: Uuid,
}

#[post("/ops/transactions/notify", format = "json", data = "<request>")]
async fn manual_notify(
    request: Json<NotifyRequest>,
    pool: &State<SqlitePool>,
    events: &State<TransactionEventDispatcher>,
) -> Result<Json<ReplayResponse>, OpsError> {
    let tx = transaction_repo::find(pool, request.transaction_id)
        .await
        .map_err(|e| ops_error(Status::InternalServerError, e.to_string()))?
        .ok_or_else(|| {
            ops_error(
                Status::NotFound,
                format!("transaction not found: {}", request.transaction_id),
            )
        })?;

    events
        .status_snapshot(&tx)
        .await
        .map_err(|e| ops_error(Status::InternalServerError, e.to_string()))?;

    Ok(Json(ReplayResponse {
        status: "enqueued".to_string(),
        transaction_id: tx.id,
    }))
}

#[derive(Serialize, Deserialize)]
struct BacklogResponse {
    pending: i64,
    delivering: i64,
    failed: i64,
}

#[get("/ops/outbox/backlog")]
async fn outbox_backlog(outbox: &State<Arc<Outbox>>) -> Result<Json<BacklogResponse>, OpsError> {
    let backlog = outbox
        .backlog()
        .await
        .map_err(|e| ops_error(Status::InternalServerError, e.to_string()))?;

    Ok(Json(BacklogResponse {
        pending: backlog.pending,
        delivering: backlog.delivering,
        failed: backlog.failed,
    }))
}

pub fn routes() -> Vec<Route> {
    routes![health, replay_deposit, manual_notify, outbox_backlog]
}
