use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, patch, post, put},
};
use serde::{Deserialize, Serialize};

use super::access::{
    Scope, authorize, authorize_agency, authorize_sub_account, resolve_sub_account_id,
    resolve_user,
};
use super::account;
use super::activity::{ActivityLog, notifications_for_viewer, save_activity_log};
use super::db::DbHandle;
use super::identity::{IdentityProvider, Principal};
use super::invitation::{send_invitation, verify_and_accept_invitation};
use super::models::*;
use super::validation;
use crate::config::HubToml;
use crate::errors::HubError;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub identity: Arc<dyn IdentityProvider>,
    pub config: HubToml,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize, Default)]
pub struct InitUserRequest {
    pub role: Option<Role>,
}

#[derive(Deserialize)]
pub struct InviteRequest {
    pub email: String,
    pub role: Role,
}

#[derive(Deserialize)]
pub struct GoalRequest {
    pub goal: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePermissionRequest {
    pub permission_id: Option<String>,
    pub email: String,
    pub sub_account_id: String,
    pub access: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationsQuery {
    pub sub_account_id: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Landing {
    pub agency_id: Option<String>,
    pub sub_account_id: Option<String>,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unauthenticated(String),
    Forbidden(String),
    Conflict(String),
    BadGateway(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthenticated(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<HubError> for ApiError {
    fn from(err: HubError) -> Self {
        let msg = err.to_string();
        match err {
            HubError::AgencyNotFound { .. }
            | HubError::SubAccountNotFound { .. }
            | HubError::UserNotFound { .. }
            | HubError::PipelineNotFound { .. }
            | HubError::LaneNotFound { .. }
            | HubError::TicketNotFound { .. }
            | HubError::MediaNotFound { .. }
            | HubError::FunnelNotFound { .. } => ApiError::NotFound(msg),
            HubError::MediaLinkExists { .. } => ApiError::Conflict(msg),
            HubError::Unauthenticated => ApiError::Unauthenticated(msg),
            HubError::Unauthorized(_) => ApiError::Forbidden(msg),
            HubError::Validation(_) => ApiError::BadRequest(msg),
            HubError::IdentityProvider(_) => ApiError::BadGateway(msg),
            HubError::LockPoisoned | HubError::Database(_) | HubError::Other(_) => {
                tracing::error!(error = ?err, "Request failed");
                ApiError::Internal(msg)
            }
        }
    }
}

fn db_err(err: anyhow::Error) -> ApiError {
    HubError::from_db(err).into()
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/me", get(get_me).post(init_me))
        .route("/api/me/landing", get(landing))
        .route("/api/invitations/accept", post(accept_invitation))
        .route("/api/agencies", post(upsert_agency))
        .route("/api/agencies/{id}", get(get_agency).delete(delete_agency))
        .route("/api/agencies/{id}/goal", put(update_agency_goal))
        .route(
            "/api/agencies/{id}/invitations",
            get(list_invitations).post(invite_member),
        )
        .route("/api/agencies/{id}/notifications", get(agency_notifications))
        .route("/api/agencies/{id}/team", get(list_team))
        .route(
            "/api/agencies/{id}/sub-accounts",
            get(list_sub_accounts).post(upsert_sub_account),
        )
        .route(
            "/api/sub-accounts/{id}",
            get(get_sub_account).delete(delete_sub_account),
        )
        .route(
            "/api/sub-accounts/{id}/notifications",
            get(sub_account_notifications),
        )
        .route(
            "/api/sub-accounts/{id}/media",
            get(list_media).post(create_media),
        )
        .route(
            "/api/sub-accounts/{id}/pipelines",
            get(list_pipelines).post(upsert_pipeline),
        )
        .route(
            "/api/sub-accounts/{id}/funnels",
            get(list_funnels).post(upsert_funnel),
        )
        .route("/api/sub-accounts/{id}/tags", get(list_tags).post(upsert_tag))
        .route(
            "/api/sub-accounts/{id}/contacts",
            get(list_contacts).post(create_contact),
        )
        .route("/api/media/{id}", delete(delete_media))
        .route(
            "/api/pipelines/{id}",
            get(get_pipeline).delete(delete_pipeline),
        )
        .route("/api/pipelines/{id}/lanes", get(get_board).post(upsert_lane))
        .route("/api/pipelines/{id}/lanes/order", put(reorder_lanes))
        .route("/api/pipelines/{id}/tickets", get(list_pipeline_tickets))
        .route("/api/pipelines/{id}/tickets/order", put(reorder_tickets))
        .route("/api/lanes/{id}", delete(delete_lane))
        .route("/api/lanes/{id}/tickets", post(upsert_ticket))
        .route("/api/tickets/{id}", delete(delete_ticket))
        .route("/api/tags/{id}", delete(delete_tag))
        .route("/api/users", patch(update_user))
        .route("/api/users/{id}", delete(delete_user))
        .route("/api/users/{id}/permissions", get(user_permissions))
        .route("/api/permissions", put(change_permission))
        .route("/health", get(health_check))
}

// ── Helpers ───────────────────────────────────────────────────────────

/// Read the principal forwarded by the upstream auth proxy.
pub fn principal_from_headers(headers: &HeaderMap) -> Result<Principal, ApiError> {
    let get = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_string())
            .unwrap_or_default()
    };
    let id = get("x-auth-user-id");
    let email = get("x-auth-email");
    if id.is_empty() || email.is_empty() {
        return Err(HubError::Unauthenticated.into());
    }
    Ok(Principal {
        id,
        email,
        first_name: get("x-auth-first-name"),
        last_name: get("x-auth-last-name"),
        image_url: get("x-auth-image-url"),
    })
}

/// Write an activity entry for a completed mutation. A failure here is
/// logged and does not fail the request.
async fn record(state: &SharedState, principal: &Principal, log: ActivityLog) {
    if let Err(e) = save_activity_log(&state.db, Some(principal), log).await {
        tracing::warn!(error = %e, "Failed to write activity log");
    }
}

// ── Handlers: account ─────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn get_me(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let principal = principal_from_headers(&headers)?;
    let details = account::get_auth_user_details(&state.db, &principal).await?;
    Ok(Json(details))
}

/// Onboard the caller. Only the agency sign-up flow may claim a role.
async fn init_me(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Option<Json<InitUserRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = principal_from_headers(&headers)?;
    let role = body.map(|Json(b)| b.role).unwrap_or_default();
    if role.is_some_and(|r| r != Role::AgencyOwner) {
        return Err(ApiError::BadRequest(
            "Only AGENCY_OWNER can be requested at sign-up".into(),
        ));
    }
    let user = account::init_user(&state.db, state.identity.as_ref(), &principal, role).await?;
    Ok(Json(user))
}

/// Where the caller should land after sign-in: accepts a pending invitation,
/// then picks the agency for agency roles or the first permitted sub-account.
async fn landing(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let principal = principal_from_headers(&headers)?;
    let agency_id =
        verify_and_accept_invitation(&state.db, state.identity.as_ref(), &principal).await?;
    let email = principal.email.clone();
    let user = state
        .db
        .call(move |db| db.get_user_by_email(&email))
        .await
        .map_err(db_err)?;

    let landing = match user {
        Some(user) if user.role.is_agency_level() => Landing {
            agency_id,
            sub_account_id: None,
        },
        Some(_) => Landing {
            agency_id,
            sub_account_id: account::first_accessible_sub_account(&state.db, &principal).await?,
        },
        None => Landing {
            agency_id: None,
            sub_account_id: None,
        },
    };
    Ok(Json(landing))
}

async fn accept_invitation(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let principal = principal_from_headers(&headers)?;
    let agency_id =
        verify_and_accept_invitation(&state.db, state.identity.as_ref(), &principal).await?;
    Ok(Json(serde_json::json!({ "agencyId": agency_id })))
}

// ── Handlers: agency ──────────────────────────────────────────────────

async fn upsert_agency(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(input): Json<AgencyInput>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = principal_from_headers(&headers)?;
    validation::validate_agency(&input)?;

    let status = match &input.id {
        Some(id) => {
            authorize_agency(&state.db, &principal, id).await?;
            StatusCode::OK
        }
        None => {
            if input.company_email != principal.email {
                return Err(ApiError::BadRequest(
                    "companyEmail: must be your own sign-in email".into(),
                ));
            }
            let email = principal.email.clone();
            let existing = state
                .db
                .call(move |db| db.get_user_by_email(&email))
                .await
                .map_err(db_err)?;
            if existing.is_some_and(|u| u.agency_id.is_some()) {
                return Err(ApiError::Forbidden(format!(
                    "{} already belongs to an agency",
                    principal.email
                )));
            }
            account::init_user(
                &state.db,
                state.identity.as_ref(),
                &principal,
                Some(Role::AgencyOwner),
            )
            .await?;
            StatusCode::CREATED
        }
    };

    let agency = state
        .db
        .call(move |db| db.upsert_agency(&input))
        .await
        .map_err(db_err)?
        .ok_or_else(|| ApiError::BadRequest("companyEmail is required".into()))?;

    record(
        &state,
        &principal,
        ActivityLog::agency(&agency.id, format!("Updated agency details | {}", agency.name)),
    )
    .await;
    Ok((status, Json(agency)))
}

async fn get_agency(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = principal_from_headers(&headers)?;
    authorize_agency(&state.db, &principal, &id).await?;
    let agency = state
        .db
        .call(move |db| {
            db.get_agency_with_sidebar(&id)?
                .ok_or_else(|| HubError::AgencyNotFound { id }.into())
        })
        .await
        .map_err(db_err)?;
    Ok(Json(agency))
}

async fn delete_agency(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = principal_from_headers(&headers)?;
    let user = authorize_agency(&state.db, &principal, &id).await?;
    if user.role != Role::AgencyOwner {
        return Err(ApiError::Forbidden("Only the agency owner can delete it".into()));
    }
    let deleted = state
        .db
        .call(move |db| db.delete_agency(&id))
        .await
        .map_err(db_err)?;
    if !deleted {
        return Err(ApiError::NotFound("Agency not found".into()));
    }
    tracing::info!(user = %user.email, "Agency deleted");
    Ok(StatusCode::NO_CONTENT)
}

async fn update_agency_goal(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<GoalRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = principal_from_headers(&headers)?;
    authorize_agency(&state.db, &principal, &id).await?;
    if req.goal < 1 {
        return Err(ApiError::BadRequest("goal: must be at least 1".into()));
    }
    let agency = state
        .db
        .call(move |db| db.update_agency_goal(&id, req.goal))
        .await
        .map_err(db_err)?;
    record(
        &state,
        &principal,
        ActivityLog::agency(&agency.id, format!("Updated the agency goal to | {}", agency.goal)),
    )
    .await;
    Ok(Json(agency))
}

async fn list_invitations(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = principal_from_headers(&headers)?;
    authorize_agency(&state.db, &principal, &id).await?;
    let invitations = state
        .db
        .call(move |db| db.list_invitations(&id))
        .await
        .map_err(db_err)?;
    Ok(Json(invitations))
}

async fn invite_member(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<InviteRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = principal_from_headers(&headers)?;
    authorize_agency(&state.db, &principal, &id).await?;
    let invitation = send_invitation(
        &state.db,
        state.identity.as_ref(),
        &state.config.identity.invitation_redirect_url,
        req.role,
        &req.email,
        &id,
    )
    .await?;
    record(
        &state,
        &principal,
        ActivityLog::agency(&id, format!("Invited | {}", invitation.email)),
    )
    .await;
    Ok((StatusCode::CREATED, Json(invitation)))
}

async fn agency_notifications(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<NotificationsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = principal_from_headers(&headers)?;
    let user = resolve_user(&state.db, &principal).await?;
    if user.agency_id.as_deref() != Some(id.as_str()) {
        return Err(ApiError::Forbidden(format!(
            "{} is not a member of agency {}",
            user.email, id
        )));
    }
    let notifications =
        notifications_for_viewer(&state.db, &id, user.role, query.sub_account_id.as_deref())
            .await?;
    Ok(Json(notifications))
}

async fn list_team(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = principal_from_headers(&headers)?;
    authorize_agency(&state.db, &principal, &id).await?;
    let team = state
        .db
        .call(move |db| db.list_team(&id))
        .await
        .map_err(db_err)?;
    Ok(Json(team))
}

// ── Handlers: sub-account ─────────────────────────────────────────────

/// Agency roles see every sub-account; others only the ones they can access.
async fn list_sub_accounts(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = principal_from_headers(&headers)?;
    let user = resolve_user(&state.db, &principal).await?;
    if user.agency_id.as_deref() != Some(id.as_str()) {
        return Err(ApiError::Forbidden(format!(
            "{} is not a member of agency {}",
            user.email, id
        )));
    }
    let sub_accounts = state
        .db
        .call(move |db| {
            let all = db.list_sub_accounts(&id)?;
            if user.role.is_agency_level() {
                return Ok(all);
            }
            let mut visible = Vec::new();
            for sub_account in all {
                if db.has_sub_account_access(&user.email, &sub_account.id)? {
                    visible.push(sub_account);
                }
            }
            Ok(visible)
        })
        .await
        .map_err(db_err)?;
    Ok(Json(sub_accounts))
}

async fn upsert_sub_account(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(agency_id): Path<String>,
    Json(mut input): Json<SubAccountInput>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = principal_from_headers(&headers)?;
    authorize_agency(&state.db, &principal, &agency_id).await?;
    validation::validate_sub_account(&input)?;
    input.agency_id = agency_id.clone();

    let creating = input.id.is_none();
    let sub_account = state
        .db
        .call(move |db| {
            if let Some(id) = &input.id
                && let Some(existing) = db.get_sub_account(id)?
                && existing.agency_id != input.agency_id
            {
                return Err(HubError::SubAccountNotFound { id: id.clone() }.into());
            }
            db.upsert_sub_account(&input)
        })
        .await
        .map_err(db_err)?
        .ok_or_else(|| {
            ApiError::BadRequest(format!("Agency {} has no owner to grant access", agency_id))
        })?;

    record(
        &state,
        &principal,
        ActivityLog::sub_account(
            &sub_account.id,
            format!("Updated sub account | {}", sub_account.name),
        ),
    )
    .await;
    let status = if creating {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(sub_account)))
}

async fn get_sub_account(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = principal_from_headers(&headers)?;
    let (_, sub_account) = authorize(&state.db, &principal, Scope::SubAccount(id)).await?;
    let view = state
        .db
        .call(move |db| {
            let sidebar_options = db.list_sub_account_sidebar(&sub_account.id)?;
            Ok(SubAccountWithSidebar {
                sub_account,
                sidebar_options,
            })
        })
        .await
        .map_err(db_err)?;
    Ok(Json(view))
}

async fn delete_sub_account(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = principal_from_headers(&headers)?;
    let (_, sub_account) = authorize(&state.db, &principal, Scope::SubAccount(id.clone())).await?;
    authorize_agency(&state.db, &principal, &sub_account.agency_id).await?;

    state
        .db
        .call(move |db| db.delete_sub_account(&id))
        .await
        .map_err(db_err)?;
    record(
        &state,
        &principal,
        ActivityLog::agency(
            &sub_account.agency_id,
            format!("Deleted a subaccount | {}", sub_account.name),
        ),
    )
    .await;
    Ok(StatusCode::NO_CONTENT)
}

async fn sub_account_notifications(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = principal_from_headers(&headers)?;
    let (user, sub_account) = authorize(&state.db, &principal, Scope::SubAccount(id)).await?;
    let notifications = notifications_for_viewer(
        &state.db,
        &sub_account.agency_id,
        user.role,
        Some(&sub_account.id),
    )
    .await?;
    Ok(Json(notifications))
}

// ── Handlers: media ───────────────────────────────────────────────────

async fn list_media(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = principal_from_headers(&headers)?;
    authorize_sub_account(&state.db, &principal, &id).await?;
    let media = state
        .db
        .call(move |db| {
            db.get_sub_account_media(&id)?
                .ok_or_else(|| HubError::SubAccountNotFound { id }.into())
        })
        .await
        .map_err(db_err)?;
    Ok(Json(media))
}

async fn create_media(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(input): Json<MediaInput>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = principal_from_headers(&headers)?;
    authorize_sub_account(&state.db, &principal, &id).await?;
    validation::validate_media(&input)?;
    let sub_account_id = id.clone();
    let media = state
        .db
        .call(move |db| db.create_media(&sub_account_id, &input))
        .await
        .map_err(db_err)?;
    record(
        &state,
        &principal,
        ActivityLog::sub_account(&id, format!("Uploaded a media file | {}", media.name)),
    )
    .await;
    Ok((StatusCode::CREATED, Json(media)))
}

async fn delete_media(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = principal_from_headers(&headers)?;
    let (_, sub_account) = authorize(&state.db, &principal, Scope::Media(id.clone())).await?;
    let media = state
        .db
        .call(move |db| {
            let media = db
                .get_media(&id)?
                .ok_or_else(|| HubError::MediaNotFound { id: id.clone() })?;
            db.delete_media(&id)?;
            Ok(media)
        })
        .await
        .map_err(db_err)?;
    record(
        &state,
        &principal,
        ActivityLog::sub_account(&sub_account.id, format!("Deleted a media file | {}", media.name)),
    )
    .await;
    Ok(StatusCode::NO_CONTENT)
}

// ── Handlers: pipelines ───────────────────────────────────────────────

async fn list_pipelines(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = principal_from_headers(&headers)?;
    authorize_sub_account(&state.db, &principal, &id).await?;
    let pipelines = state
        .db
        .call(move |db| db.list_pipelines(&id))
        .await
        .map_err(db_err)?;
    Ok(Json(pipelines))
}

async fn upsert_pipeline(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(mut input): Json<PipelineInput>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = principal_from_headers(&headers)?;
    authorize_sub_account(&state.db, &principal, &id).await?;
    validation::validate_pipeline(&input)?;
    input.sub_account_id = id.clone();

    let creating = input.id.is_none();
    let pipeline = state
        .db
        .call(move |db| {
            if let Some(pid) = &input.id
                && let Some(existing) = db.get_pipeline(pid)?
                && existing.sub_account_id != input.sub_account_id
            {
                return Err(HubError::PipelineNotFound { id: pid.clone() }.into());
            }
            db.upsert_pipeline(&input)
        })
        .await
        .map_err(db_err)?;
    record(
        &state,
        &principal,
        ActivityLog::sub_account(&id, format!("Updated a pipeline | {}", pipeline.name)),
    )
    .await;
    let status = if creating {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(pipeline)))
}

async fn get_pipeline(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = principal_from_headers(&headers)?;
    authorize(&state.db, &principal, Scope::Pipeline(id.clone())).await?;
    let pipeline = state
        .db
        .call(move |db| {
            db.get_pipeline(&id)?
                .ok_or_else(|| HubError::PipelineNotFound { id }.into())
        })
        .await
        .map_err(db_err)?;
    Ok(Json(pipeline))
}

async fn delete_pipeline(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = principal_from_headers(&headers)?;
    let (_, sub_account) = authorize(&state.db, &principal, Scope::Pipeline(id.clone())).await?;
    let pipeline = state
        .db
        .call(move |db| {
            let pipeline = db
                .get_pipeline(&id)?
                .ok_or_else(|| HubError::PipelineNotFound { id: id.clone() })?;
            db.delete_pipeline(&id)?;
            Ok(pipeline)
        })
        .await
        .map_err(db_err)?;
    record(
        &state,
        &principal,
        ActivityLog::sub_account(&sub_account.id, format!("Deleted pipeline | {}", pipeline.name)),
    )
    .await;
    Ok(StatusCode::NO_CONTENT)
}

// ── Handlers: lanes & tickets ─────────────────────────────────────────

async fn get_board(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = principal_from_headers(&headers)?;
    authorize(&state.db, &principal, Scope::Pipeline(id.clone())).await?;
    let lanes = state
        .db
        .call(move |db| db.get_lanes_with_tickets_and_tags(&id))
        .await
        .map_err(db_err)?;
    Ok(Json(lanes))
}

async fn upsert_lane(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(mut input): Json<LaneInput>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = principal_from_headers(&headers)?;
    let (_, sub_account) = authorize(&state.db, &principal, Scope::Pipeline(id.clone())).await?;
    validation::validate_lane(&input)?;
    input.pipeline_id = id;

    let creating = input.id.is_none();
    let lane = state
        .db
        .call(move |db| {
            if let Some(lid) = &input.id
                && let Some(existing) = db.get_lane(lid)?
                && existing.pipeline_id != input.pipeline_id
            {
                return Err(HubError::LaneNotFound { id: lid.clone() }.into());
            }
            db.upsert_lane(&input)
        })
        .await
        .map_err(db_err)?;
    record(
        &state,
        &principal,
        ActivityLog::sub_account(&sub_account.id, format!("Updated a lane | {}", lane.name)),
    )
    .await;
    let status = if creating {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(lane)))
}

async fn reorder_lanes(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(lanes): Json<Vec<LaneOrder>>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = principal_from_headers(&headers)?;
    let (_, sub_account) = authorize(&state.db, &principal, Scope::Pipeline(id.clone())).await?;
    let count = lanes.len();
    state
        .db
        .call(move |db| {
            for lane in &lanes {
                match db.get_lane(&lane.id)? {
                    Some(existing) if existing.pipeline_id == id => {}
                    _ => return Err(HubError::LaneNotFound { id: lane.id.clone() }.into()),
                }
            }
            db.update_lanes_order(&lanes)
        })
        .await
        .map_err(db_err)?;
    record(
        &state,
        &principal,
        ActivityLog::sub_account(&sub_account.id, format!("Reordered lanes | {} moved", count)),
    )
    .await;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_pipeline_tickets(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = principal_from_headers(&headers)?;
    authorize(&state.db, &principal, Scope::Pipeline(id.clone())).await?;
    let tickets = state
        .db
        .call(move |db| db.get_tickets_with_tags(&id))
        .await
        .map_err(db_err)?;
    Ok(Json(tickets))
}

async fn reorder_tickets(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(tickets): Json<Vec<TicketOrder>>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = principal_from_headers(&headers)?;
    let (_, sub_account) = authorize(&state.db, &principal, Scope::Pipeline(id.clone())).await?;
    let count = tickets.len();
    state
        .db
        .call(move |db| {
            for ticket in &tickets {
                let in_pipeline = |lane_id: &str| -> anyhow::Result<bool> {
                    Ok(db.get_lane(lane_id)?.is_some_and(|l| l.pipeline_id == id))
                };
                let current = db
                    .get_ticket(&ticket.id)?
                    .ok_or_else(|| HubError::TicketNotFound { id: ticket.id.clone() })?;
                if !in_pipeline(&current.lane_id)? {
                    return Err(HubError::TicketNotFound { id: ticket.id.clone() }.into());
                }
                if !in_pipeline(&ticket.lane_id)? {
                    return Err(HubError::LaneNotFound { id: ticket.lane_id.clone() }.into());
                }
            }
            db.update_tickets_order(&tickets)
        })
        .await
        .map_err(db_err)?;
    record(
        &state,
        &principal,
        ActivityLog::sub_account(&sub_account.id, format!("Moved tickets | {} moved", count)),
    )
    .await;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_lane(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = principal_from_headers(&headers)?;
    let (_, sub_account) = authorize(&state.db, &principal, Scope::Lane(id.clone())).await?;
    let lane = state
        .db
        .call(move |db| {
            let lane = db
                .get_lane(&id)?
                .ok_or_else(|| HubError::LaneNotFound { id: id.clone() })?;
            db.delete_lane(&id)?;
            Ok(lane)
        })
        .await
        .map_err(db_err)?;
    record(
        &state,
        &principal,
        ActivityLog::sub_account(&sub_account.id, format!("Deleted lane | {}", lane.name)),
    )
    .await;
    Ok(StatusCode::NO_CONTENT)
}

async fn upsert_ticket(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(lane_id): Path<String>,
    Json(mut input): Json<TicketInput>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = principal_from_headers(&headers)?;
    let (_, sub_account) = authorize(&state.db, &principal, Scope::Lane(lane_id.clone())).await?;
    validation::validate_ticket(&input)?;
    input.lane_id = lane_id;

    let creating = input.id.is_none();
    let sub_account_id = sub_account.id.clone();
    let agency_id = sub_account.agency_id.clone();
    let ticket = state
        .db
        .call(move |db| {
            if let Some(tid) = &input.id
                && db.get_ticket(tid)?.is_some()
                && resolve_sub_account_id(db, &Scope::Ticket(tid.clone()))? != sub_account_id
            {
                return Err(HubError::TicketNotFound { id: tid.clone() }.into());
            }
            let tags = db.list_tags(&sub_account_id)?;
            for tag_id in &input.tag_ids {
                if !tags.iter().any(|t| &t.id == tag_id) {
                    let message = format!("tagIds: unknown tag {}", tag_id);
                    return Err(HubError::Validation(message).into());
                }
            }
            if let Some(customer_id) = &input.customer_id
                && !db
                    .get_contact(customer_id)?
                    .is_some_and(|c| c.sub_account_id == sub_account_id)
            {
                let message = format!("customerId: unknown contact {}", customer_id);
                return Err(HubError::Validation(message).into());
            }
            if let Some(assigned) = &input.assigned_user_id
                && !db
                    .get_user(assigned)?
                    .is_some_and(|u| u.agency_id.as_deref() == Some(agency_id.as_str()))
            {
                return Err(HubError::UserNotFound { id: assigned.clone() }.into());
            }
            db.upsert_ticket(&input)
        })
        .await
        .map_err(db_err)?;
    record(
        &state,
        &principal,
        ActivityLog::sub_account(&sub_account.id, format!("Updated a ticket | {}", ticket.name)),
    )
    .await;
    let status = if creating {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(ticket)))
}

async fn delete_ticket(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = principal_from_headers(&headers)?;
    let (_, sub_account) = authorize(&state.db, &principal, Scope::Ticket(id.clone())).await?;
    let ticket = state
        .db
        .call(move |db| {
            let ticket = db
                .get_ticket(&id)?
                .ok_or_else(|| HubError::TicketNotFound { id: id.clone() })?;
            db.delete_ticket(&id)?;
            Ok(ticket)
        })
        .await
        .map_err(db_err)?;
    record(
        &state,
        &principal,
        ActivityLog::sub_account(&sub_account.id, format!("Deleted a ticket | {}", ticket.name)),
    )
    .await;
    Ok(StatusCode::NO_CONTENT)
}

// ── Handlers: funnels ─────────────────────────────────────────────────

async fn list_funnels(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = principal_from_headers(&headers)?;
    authorize_sub_account(&state.db, &principal, &id).await?;
    let funnels = state
        .db
        .call(move |db| db.list_funnels(&id))
        .await
        .map_err(db_err)?;
    Ok(Json(funnels))
}

async fn upsert_funnel(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(input): Json<FunnelInput>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = principal_from_headers(&headers)?;
    authorize_sub_account(&state.db, &principal, &id).await?;
    validation::validate_funnel(&input)?;

    let creating = input.id.is_none();
    let sub_account_id = id.clone();
    let funnel = state
        .db
        .call(move |db| {
            if let Some(fid) = &input.id
                && let Some(existing) = db.get_funnel(fid)?
                && existing.sub_account_id != sub_account_id
            {
                return Err(HubError::FunnelNotFound { id: fid.clone() }.into());
            }
            db.upsert_funnel(&sub_account_id, &input)
        })
        .await
        .map_err(db_err)?;
    record(
        &state,
        &principal,
        ActivityLog::sub_account(&id, format!("Updated a funnel | {}", funnel.name)),
    )
    .await;
    let status = if creating {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(funnel)))
}

// ── Handlers: tags & contacts ─────────────────────────────────────────

async fn list_tags(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = principal_from_headers(&headers)?;
    authorize_sub_account(&state.db, &principal, &id).await?;
    let tags = state
        .db
        .call(move |db| db.list_tags(&id))
        .await
        .map_err(db_err)?;
    Ok(Json(tags))
}

async fn upsert_tag(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(input): Json<TagInput>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = principal_from_headers(&headers)?;
    authorize_sub_account(&state.db, &principal, &id).await?;
    validation::validate_tag(&input)?;
    let creating = input.id.is_none();
    let sub_account_id = id.clone();
    let tag = state
        .db
        .call(move |db| {
            if let Some(tid) = &input.id
                && let Some(existing) = db.get_tag(tid)?
                && existing.sub_account_id != sub_account_id
            {
                return Err(HubError::Validation(format!("id: unknown tag {}", tid)).into());
            }
            db.upsert_tag(&sub_account_id, &input)
        })
        .await
        .map_err(db_err)?;
    record(
        &state,
        &principal,
        ActivityLog::sub_account(&id, format!("Updated a tag | {}", tag.name)),
    )
    .await;
    let status = if creating {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(tag)))
}

async fn delete_tag(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = principal_from_headers(&headers)?;
    let tag_id = id.clone();
    let tag = state
        .db
        .call(move |db| db.get_tag(&tag_id))
        .await
        .map_err(db_err)?
        .ok_or_else(|| ApiError::NotFound(format!("Tag {} not found", id)))?;
    authorize_sub_account(&state.db, &principal, &tag.sub_account_id).await?;
    state
        .db
        .call(move |db| db.delete_tag(&id))
        .await
        .map_err(db_err)?;
    record(
        &state,
        &principal,
        ActivityLog::sub_account(&tag.sub_account_id, format!("Deleted a tag | {}", tag.name)),
    )
    .await;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_contacts(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = principal_from_headers(&headers)?;
    authorize_sub_account(&state.db, &principal, &id).await?;
    let contacts = state
        .db
        .call(move |db| db.list_contacts(&id))
        .await
        .map_err(db_err)?;
    Ok(Json(contacts))
}

async fn create_contact(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(input): Json<ContactInput>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = principal_from_headers(&headers)?;
    authorize_sub_account(&state.db, &principal, &id).await?;
    validation::validate_contact(&input)?;
    let sub_account_id = id.clone();
    let contact = state
        .db
        .call(move |db| db.create_contact(&sub_account_id, &input))
        .await
        .map_err(db_err)?;
    record(
        &state,
        &principal,
        ActivityLog::sub_account(&id, format!("Created a contact | {}", contact.name)),
    )
    .await;
    Ok((StatusCode::CREATED, Json(contact)))
}

// ── Handlers: users & permissions ─────────────────────────────────────

/// The target user, provided the caller administers the target's agency.
async fn administered_user(
    state: &SharedState,
    principal: &Principal,
    user_id: String,
) -> Result<User, ApiError> {
    let target = state
        .db
        .call(move |db| {
            db.get_user(&user_id)?
                .ok_or_else(|| HubError::UserNotFound { id: user_id }.into())
        })
        .await
        .map_err(db_err)?;
    let agency_id = target
        .agency_id
        .clone()
        .ok_or_else(|| ApiError::Forbidden(format!("{} has no agency", target.email)))?;
    authorize_agency(&state.db, principal, &agency_id).await?;
    Ok(target)
}

async fn user_permissions(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = principal_from_headers(&headers)?;
    let caller = resolve_user(&state.db, &principal).await?;
    if caller.id != id {
        administered_user(&state, &principal, id.clone()).await?;
    }
    let permissions = state
        .db
        .call(move |db| db.get_user_permissions(&id))
        .await
        .map_err(db_err)?;
    Ok(Json(permissions))
}

async fn change_permission(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(req): Json<ChangePermissionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = principal_from_headers(&headers)?;
    let sub_account_id = req.sub_account_id.clone();
    let email = req.email.clone();
    let (sub_account, target) = state
        .db
        .call(move |db| {
            let sub_account = db
                .get_sub_account(&sub_account_id)?
                .ok_or_else(|| HubError::SubAccountNotFound { id: sub_account_id.clone() })?;
            let target = db
                .get_user_by_email(&email)?
                .ok_or_else(|| HubError::UserNotFound { id: email.clone() })?;
            Ok((sub_account, target))
        })
        .await
        .map_err(db_err)?;
    authorize_agency(&state.db, &principal, &sub_account.agency_id).await?;
    if target.agency_id.as_deref() != Some(sub_account.agency_id.as_str()) {
        return Err(ApiError::BadRequest(format!(
            "{} is not a member of this agency",
            target.email
        )));
    }

    let permission = state
        .db
        .call(move |db| {
            db.change_user_permission(
                req.permission_id.as_deref(),
                &req.email,
                &req.sub_account_id,
                req.access,
            )
        })
        .await
        .map_err(db_err)?;
    let verb = if permission.access { "Gave" } else { "Removed" };
    record(
        &state,
        &principal,
        ActivityLog::sub_account(
            &sub_account.id,
            format!("{} {} access to | {}", verb, target.name, sub_account.name),
        ),
    )
    .await;
    Ok(Json(permission))
}

/// Users may edit their own profile. Changing a role, or anyone else's
/// profile, requires agency-level access to the target's agency.
async fn update_user(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(update): Json<UserUpdate>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = principal_from_headers(&headers)?;
    validation::validate_user_update(&update)?;
    if update.role == Some(Role::AgencyOwner) {
        return Err(ApiError::BadRequest("role: cannot assign AGENCY_OWNER".into()));
    }

    let email = update.email.clone();
    let target = state
        .db
        .call(move |db| {
            db.get_user_by_email(&email)?
                .ok_or_else(|| HubError::UserNotFound { id: email }.into())
        })
        .await
        .map_err(db_err)?;
    if target.email != principal.email || update.role.is_some() {
        administered_user(&state, &principal, target.id.clone()).await?;
    }

    let user = account::update_user(&state.db, state.identity.as_ref(), update).await?;
    if let Some(agency_id) = &user.agency_id {
        record(
            &state,
            &principal,
            ActivityLog::agency(agency_id, format!("Updated {} information", user.name)),
        )
        .await;
    }
    Ok(Json(user))
}

async fn delete_user(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = principal_from_headers(&headers)?;
    let target = administered_user(&state, &principal, id.clone()).await?;
    if target.role == Role::AgencyOwner {
        return Err(ApiError::Forbidden("The agency owner cannot be removed".into()));
    }
    let deleted = account::delete_user(&state.db, state.identity.as_ref(), &id).await?;
    if let Some(agency_id) = &target.agency_id {
        record(
            &state,
            &principal,
            ActivityLog::agency(agency_id, format!("Removed {} from the team", deleted.name)),
        )
        .await;
    }
    Ok(StatusCode::NO_CONTENT)
}
