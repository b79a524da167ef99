use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{ApiError, ApiResult};
use crate::{
    app_state::AppState,
    credential::{CardIdentity, CredentialPayload, MintedCredential, TokenType, ValidationResult},
    db::{
        models::{Client, SyncJob, SyncOperation},
        queries,
    },
    queue::NewSyncJob,
};

#[derive(Debug, Default, Deserialize)]
pub struct RegisterCardBody {
    pub branch_id: Option<i64>,
    pub pass_serial_number: Option<String>,
    pub display_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DeactivateCardBody {
    pub branch_id: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CredentialBody {
    pub pass_serial_number: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ValidateBody {
    pub token: String,
}

#[derive(Debug, Serialize)]
pub struct ValidationResponse {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<CredentialPayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_type: Option<TokenType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<ValidationResult> for ValidationResponse {
    fn from(result: ValidationResult) -> Self {
        match result {
            ValidationResult::Valid {
                payload,
                token_type,
                expires_at,
            } => Self {
                valid: true,
                payload: Some(payload),
                token_type: Some(token_type),
                expires_at: Some(expires_at),
                error: None,
            },
            ValidationResult::Invalid(e) => Self {
                valid: false,
                payload: None,
                token_type: None,
                expires_at: None,
                error: Some(e.to_string()),
            },
        }
    }
}

async fn load_client(state: &AppState, client_id: i64) -> Result<Client, ApiError> {
    queries::get_client(&state.pool, client_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("client not found: {client_id}")))
}

fn identity(client: &Client, pass_serial_number: Option<String>) -> CardIdentity {
    CardIdentity {
        client_id: client.client_id,
        client_number: client.client_number.clone(),
        pass_serial_number: pass_serial_number.unwrap_or_else(CardIdentity::generate_serial),
        company_id: client.company_id,
    }
}

/// POST /api/clients/{client_id}/card
/// Queues registration of a wallet card at the provider
pub async fn register_card(
    State(state): State<AppState>,
    Path(client_id): Path<i64>,
    Json(body): Json<RegisterCardBody>,
) -> Result<(StatusCode, Json<SyncJob>), ApiError> {
    load_client(&state, client_id).await?;

    let job = NewSyncJob::new(
        SyncOperation::CardRegister,
        client_id,
        json!({
            "passSerialNumber": body.pass_serial_number,
            "displayName": body.display_name,
        }),
    )
    .with_branch(body.branch_id)
    .with_priority(8);
    let job = state.queue.enqueue(job).await?;

    Ok((StatusCode::ACCEPTED, Json(job)))
}

/// POST /api/clients/{client_id}/card/deactivate
pub async fn deactivate_card(
    State(state): State<AppState>,
    Path(client_id): Path<i64>,
    Json(body): Json<DeactivateCardBody>,
) -> Result<(StatusCode, Json<SyncJob>), ApiError> {
    let link = queries::get_active_card_link(&state.pool, client_id, body.branch_id)
        .await?
        .ok_or_else(|| ApiError::not_found("no active card for client"))?;

    let job = NewSyncJob::new(SyncOperation::CardDeactivate, client_id, json!({}))
        .with_card_link(link.link_id)
        .with_branch(link.branch_id);
    let job = state.queue.enqueue(job).await?;

    Ok((StatusCode::ACCEPTED, Json(job)))
}

/// POST /api/clients/{client_id}/credential
/// Mints a long-lived card credential with its QR code
pub async fn mint_credential(
    State(state): State<AppState>,
    Path(client_id): Path<i64>,
    Json(body): Json<CredentialBody>,
) -> ApiResult<MintedCredential> {
    let client = load_client(&state, client_id).await?;
    let minted = state
        .codec
        .mint(&identity(&client, body.pass_serial_number))?;

    Ok(Json(minted))
}

/// POST /api/clients/{client_id}/credential/rotate
/// Re-issues the credential for an existing pass serial
pub async fn rotate_credential(
    State(state): State<AppState>,
    Path(client_id): Path<i64>,
    Json(body): Json<CredentialBody>,
) -> ApiResult<MintedCredential> {
    let serial = body
        .pass_serial_number
        .ok_or_else(|| ApiError::bad_request("pass_serial_number is required"))?;
    let client = load_client(&state, client_id).await?;
    let minted = state
        .codec
        .rotate(&identity(&client, Some(serial.clone())), &serial)?;

    Ok(Json(minted))
}

/// POST /api/clients/{client_id}/credential/transient
/// Short-lived token for a single in-store transaction
pub async fn mint_transient_credential(
    State(state): State<AppState>,
    Path(client_id): Path<i64>,
    Json(body): Json<CredentialBody>,
) -> ApiResult<MintedCredential> {
    let client = load_client(&state, client_id).await?;
    let minted = state
        .codec
        .mint_transient(&identity(&client, body.pass_serial_number))?;

    Ok(Json(minted))
}

/// POST /api/credentials/validate
/// Always 200; the verdict is in the body
pub async fn validate_credential(
    State(state): State<AppState>,
    Json(body): Json<ValidateBody>,
) -> Json<ValidationResponse> {
    Json(state.codec.validate(&body.token).into())
}
