use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Redirect, Response},
    routing::{delete, get, patch, post, put},
};
use serde::{Deserialize, Serialize};

use super::db::{DbHandle, HubDb, INVITATION_TTL_HOURS};
use super::github::{self, WebhookEvent};
use super::models::*;
use super::ws::{self, ActivityHub, StompSettings};
use crate::errors::HubError;

const DEFAULT_ACTIVITY_LIMIT: i64 = 50;
const MAX_ACTIVITY_LIMIT: i64 = 200;
const DEFAULT_DASHBOARD_TASKS: i64 = 20;

// ── Shared application state ──────────────────────────────────────────

/// GitHub integration settings resolved at startup.
#[derive(Debug, Clone, Default)]
pub struct GitHubSettings {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub webhook_secret: Option<String>,
    pub redirect_uri: Option<String>,
    /// Where the OAuth callback sends the browser afterwards.
    pub frontend_url: String,
}

pub struct AppState {
    pub db: DbHandle,
    pub hub: ActivityHub,
    pub stomp: StompSettings,
    pub github: GitHubSettings,
    pub github_token: Mutex<Option<String>>,
    /// Outstanding OAuth `state` values → project that started the flow.
    pub oauth_states: Mutex<HashMap<String, Option<i64>>>,
}

impl AppState {
    pub fn new(db: DbHandle, hub: ActivityHub, stomp: StompSettings, github: GitHubSettings) -> Self {
        Self {
            db,
            hub,
            stomp,
            github,
            github_token: Mutex::new(None),
            oauth_states: Mutex::new(HashMap::new()),
        }
    }
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateProjectRequest {
    pub name: String,
    pub description: Option<String>,
    pub status: Option<String>,
    pub due_date: Option<String>,
}

#[derive(Deserialize)]
pub struct CreateTaskRequest {
    pub title: String,
    pub description: Option<String>,
    pub status: Option<String>,
    pub priority: Option<String>,
    pub assignee_id: Option<i64>,
    pub due_date: Option<String>,
}

#[derive(Deserialize)]
pub struct MoveTaskRequest {
    pub status: String,
    pub position: Option<i32>,
}

#[derive(Deserialize)]
pub struct TaskListQuery {
    pub status: Option<String>,
}

#[derive(Deserialize)]
pub struct AddMemberRequest {
    pub user_id: i64,
    pub display_name: String,
    pub email: Option<String>,
    pub role: Option<String>,
}

#[derive(Deserialize)]
pub struct UpdateMemberRequest {
    pub role: String,
}

#[derive(Deserialize)]
pub struct CreateInvitationRequest {
    pub email: String,
    pub role: Option<String>,
    pub invited_by: Option<i64>,
}

#[derive(Deserialize)]
pub struct AcceptInvitationRequest {
    pub user_id: i64,
    pub display_name: String,
}

#[derive(Deserialize)]
pub struct ActivitiesQuery {
    pub project_id: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Deserialize)]
pub struct LimitQuery {
    pub limit: Option<i64>,
}

#[derive(Deserialize)]
pub struct LinkRepoRequest {
    pub repo: String,
}

#[derive(Deserialize)]
pub struct AuthorizeQuery {
    pub project_id: Option<i64>,
}

#[derive(Deserialize)]
pub struct CallbackQuery {
    pub code: String,
    pub state: String,
}

#[derive(Serialize)]
pub struct GitHubAuthStatus {
    pub connected: bool,
    pub oauth_configured: bool,
    pub webhook_configured: bool,
}

#[derive(Serialize)]
pub struct SyncResult {
    pub imported: usize,
    pub skipped: usize,
    pub total_github: usize,
}

#[derive(Serialize)]
pub struct AcceptedInvitation {
    pub invitation: Invitation,
    pub member: TeamMember,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unauthorized(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

/// Store errors carry a `HubError` when the failure is the caller's fault.
impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        let Some(hub) = err.downcast_ref::<HubError>() else {
            tracing::error!(event = "api.internal_error", error = %format!("{:#}", err));
            return ApiError::Internal(err.to_string());
        };
        let msg = hub.to_string();
        match hub {
            HubError::ProjectNotFound { .. }
            | HubError::TaskNotFound { .. }
            | HubError::MemberNotFound { .. }
            | HubError::InvitationNotFound(_) => ApiError::NotFound(msg),
            HubError::DuplicateMember { .. }
            | HubError::InvitationPending { .. }
            | HubError::InvitationNotPending { .. } => ApiError::Conflict(msg),
            HubError::InvitationExpired | HubError::Validation(_) => ApiError::BadRequest(msg),
            HubError::Unauthorized(_) => ApiError::Unauthorized(msg),
            HubError::GitHub(_) | HubError::LockPoisoned => {
                tracing::error!(event = "api.internal_error", error = %msg);
                ApiError::Internal(msg)
            }
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(ws::ws_handler))
        .route("/api/projects", get(list_projects).post(create_project))
        .route(
            "/api/projects/{id}",
            get(get_project).patch(update_project).delete(delete_project),
        )
        .route("/api/projects/{id}/tasks", get(list_tasks).post(create_task))
        .route(
            "/api/tasks/{id}",
            get(get_task).patch(update_task).delete(delete_task),
        )
        .route("/api/tasks/{id}/status", patch(move_task))
        .route("/api/projects/{id}/members", get(list_members).post(add_member))
        .route(
            "/api/projects/{id}/members/{member_id}",
            patch(update_member).delete(remove_member),
        )
        .route(
            "/api/projects/{id}/invitations",
            get(list_invitations).post(create_invitation),
        )
        .route("/api/invitations/{token}/accept", post(accept_invitation))
        .route("/api/invitations/{token}/decline", post(decline_invitation))
        .route("/api/invitations/{id}", delete(revoke_invitation))
        .route("/api/activities", get(list_activities))
        .route("/api/dashboard/stats", get(dashboard_stats))
        .route("/api/dashboard/projects", get(dashboard_projects))
        .route("/api/dashboard/tasks", get(dashboard_tasks))
        .route("/api/projects/{id}/github", put(link_github_repo))
        .route("/api/projects/{id}/github/sync", post(sync_github_issues))
        .route("/api/github/status", get(github_status))
        .route("/api/github/oauth/authorize", get(github_authorize))
        .route("/api/github/oauth/callback", get(github_callback))
        .route("/api/github/disconnect", post(github_disconnect))
        .route("/api/github/repos", get(github_list_repos))
        .route("/api/github/webhook", post(github_webhook))
}

// ── Helpers ───────────────────────────────────────────────────────────

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, ApiError> {
    mutex
        .lock()
        .map_err(|_| ApiError::Internal("Lock poisoned".into()))
}

/// Parse an optional enum field, falling back to `default` when absent.
fn parse_or<T: FromStr<Err = String>>(raw: Option<&str>, default: T) -> Result<T, ApiError> {
    match raw {
        Some(s) => T::from_str(s).map_err(ApiError::BadRequest),
        None => Ok(default),
    }
}

/// Who performed the request, from the optional `X-Actor` header.
fn actor(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-actor")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn require_non_empty(field: &str, value: &str) -> Result<(), ApiError> {
    if value.trim().is_empty() {
        return Err(ApiError::BadRequest(format!("{} is required", field)));
    }
    Ok(())
}

fn notify_member(state: &SharedState, member: &TeamMember, activity: &Activity) {
    state.hub.notify_user(
        member.user_id,
        serde_json::json!({
            "message": activity.message,
            "project_id": member.project_id,
            "activity": activity,
        }),
    );
}

fn github_token(state: &SharedState) -> Result<String, ApiError> {
    lock(&state.github_token)?
        .clone()
        .ok_or_else(|| ApiError::BadRequest("Not connected to GitHub".into()))
}

// ── Handlers: projects ────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn list_projects(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let projects = state.db.call(|db| db.list_projects()).await?;
    Ok(Json(projects))
}

async fn create_project(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(req): Json<CreateProjectRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_non_empty("name", &req.name)?;
    let status = parse_or(req.status.as_deref(), ProjectStatus::Planning)?;
    let actor = actor(&headers);
    let (project, activity) = state
        .db
        .transaction(move |db| {
            let project = db.create_project(
                req.name.trim(),
                req.description.as_deref().unwrap_or_default(),
                status,
                req.due_date.as_deref(),
            )?;
            let activity = db.record_activity(
                &NewActivity::new(
                    ActivityType::ProjectCreated,
                    format!("Project '{}' created", project.name),
                )
                .project(project.id)
                .actor(actor),
            )?;
            Ok((project, activity))
        })
        .await?;
    state.hub.publish_activity(&activity);
    Ok((StatusCode::CREATED, Json(project)))
}

async fn get_project(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let detail = state.db.call(move |db| db.get_project_detail(id)).await?;
    match detail {
        Some(detail) => Ok(Json(detail)),
        None => Err(ApiError::NotFound(format!("Project {} not found", id))),
    }
}

async fn update_project(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    Json(patch): Json<ProjectPatch>,
) -> Result<impl IntoResponse, ApiError> {
    if let Some(name) = &patch.name {
        require_non_empty("name", name)?;
    }
    let actor = actor(&headers);
    let (project, activity) = state
        .db
        .transaction(move |db| {
            let project = db.update_project(id, &patch)?;
            let activity = db.record_activity(
                &NewActivity::new(
                    ActivityType::ProjectUpdated,
                    format!("Project '{}' updated", project.name),
                )
                .project(id)
                .actor(actor)
                .metadata(serde_json::json!({"status": project.status})),
            )?;
            Ok((project, activity))
        })
        .await?;
    state.hub.publish_activity(&activity);
    Ok(Json(project))
}

async fn delete_project(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let actor = actor(&headers);
    let activity = state
        .db
        .transaction(move |db| {
            let project = db.require_project(id)?;
            db.delete_project(id)?;
            db.record_activity(
                &NewActivity::new(
                    ActivityType::ProjectDeleted,
                    format!("Project '{}' deleted", project.name),
                )
                .project(id)
                .actor(actor),
            )
        })
        .await?;
    state.hub.publish_activity(&activity);
    Ok(StatusCode::NO_CONTENT)
}

// ── Handlers: tasks ───────────────────────────────────────────────────

async fn list_tasks(
    State(state): State<SharedState>,
    Path(project_id): Path<i64>,
    Query(query): Query<TaskListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let status = query
        .status
        .as_deref()
        .map(TaskStatus::from_str)
        .transpose()
        .map_err(ApiError::BadRequest)?;
    let tasks = state
        .db
        .call(move |db| {
            db.require_project(project_id)?;
            db.list_tasks(project_id, status)
        })
        .await?;
    Ok(Json(tasks))
}

async fn create_task(
    State(state): State<SharedState>,
    Path(project_id): Path<i64>,
    headers: HeaderMap,
    Json(req): Json<CreateTaskRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_non_empty("title", &req.title)?;
    let new_task = NewTask {
        title: req.title.trim().to_string(),
        description: req.description.unwrap_or_default(),
        status: parse_or(req.status.as_deref(), TaskStatus::Todo)?,
        priority: parse_or(req.priority.as_deref(), Priority::Medium)?,
        assignee_id: req.assignee_id,
        due_date: req.due_date,
    };
    let actor = actor(&headers);
    let (task, activity) = state
        .db
        .transaction(move |db| {
            let task = db.create_task(project_id, &new_task)?;
            let activity = db.record_activity(
                &NewActivity::new(
                    ActivityType::TaskCreated,
                    format!("Task '{}' created", task.title),
                )
                .project(project_id)
                .task(task.id)
                .actor(actor),
            )?;
            Ok((task, activity))
        })
        .await?;
    state.hub.publish_activity(&activity);
    Ok((StatusCode::CREATED, Json(task)))
}

async fn get_task(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let task = state.db.call(move |db| db.require_task(id)).await?;
    Ok(Json(task))
}

async fn update_task(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    Json(patch): Json<TaskPatch>,
) -> Result<impl IntoResponse, ApiError> {
    if let Some(title) = &patch.title {
        require_non_empty("title", title)?;
    }
    let actor = actor(&headers);
    let (task, activity) = state
        .db
        .transaction(move |db| {
            let task = db.update_task(id, &patch)?;
            let activity = db.record_activity(
                &NewActivity::new(
                    ActivityType::TaskUpdated,
                    format!("Task '{}' updated", task.title),
                )
                .project(task.project_id)
                .task(id)
                .actor(actor),
            )?;
            Ok((task, activity))
        })
        .await?;
    state.hub.publish_activity(&activity);
    Ok(Json(task))
}

async fn move_task(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    Json(req): Json<MoveTaskRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let status = TaskStatus::from_str(&req.status).map_err(ApiError::BadRequest)?;
    let position = req.position;
    let actor = actor(&headers);
    let (task, activity) = state
        .db
        .transaction(move |db| {
            // Capture the original status before the move for the activity
            let from = db.require_task(id)?.status;
            let task = db.move_task(id, status, position)?;
            let activity = db.record_activity(
                &NewActivity::new(
                    ActivityType::TaskStatusChanged,
                    format!(
                        "Task '{}' moved from {} to {}",
                        task.title,
                        from.as_str(),
                        status.as_str()
                    ),
                )
                .project(task.project_id)
                .task(id)
                .actor(actor)
                .metadata(serde_json::json!({"from": from, "to": status, "position": task.position})),
            )?;
            Ok((task, activity))
        })
        .await?;
    state.hub.publish_activity(&activity);
    Ok(Json(task))
}

async fn delete_task(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let actor = actor(&headers);
    let activity = state
        .db
        .transaction(move |db| {
            let task = db.require_task(id)?;
            db.delete_task(id)?;
            db.record_activity(
                &NewActivity::new(
                    ActivityType::TaskDeleted,
                    format!("Task '{}' deleted", task.title),
                )
                .project(task.project_id)
                .task(id)
                .actor(actor),
            )
        })
        .await?;
    state.hub.publish_activity(&activity);
    Ok(StatusCode::NO_CONTENT)
}

// ── Handlers: team members ────────────────────────────────────────────

async fn list_members(
    State(state): State<SharedState>,
    Path(project_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let members = state
        .db
        .call(move |db| {
            db.require_project(project_id)?;
            db.list_members(project_id)
        })
        .await?;
    Ok(Json(members))
}

async fn add_member(
    State(state): State<SharedState>,
    Path(project_id): Path<i64>,
    headers: HeaderMap,
    Json(req): Json<AddMemberRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_non_empty("display_name", &req.display_name)?;
    let role = parse_or(req.role.as_deref(), TeamRole::Member)?;
    let actor = actor(&headers);
    let (member, activity) = state
        .db
        .transaction(move |db| {
            let project = db.require_project(project_id)?;
            let member = db.add_member(
                project_id,
                req.user_id,
                req.display_name.trim(),
                req.email.as_deref().unwrap_or_default(),
                role,
            )?;
            let activity = db.record_activity(
                &NewActivity::new(
                    ActivityType::MemberAdded,
                    format!(
                        "{} joined '{}' as {}",
                        member.display_name,
                        project.name,
                        role.as_str()
                    ),
                )
                .project(project_id)
                .actor(actor)
                .metadata(serde_json::json!({"member_id": member.id, "user_id": member.user_id})),
            )?;
            Ok((member, activity))
        })
        .await?;
    state.hub.publish_activity(&activity);
    notify_member(&state, &member, &activity);
    Ok((StatusCode::CREATED, Json(member)))
}

async fn update_member(
    State(state): State<SharedState>,
    Path((project_id, member_id)): Path<(i64, i64)>,
    headers: HeaderMap,
    Json(req): Json<UpdateMemberRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let role = TeamRole::from_str(&req.role).map_err(ApiError::BadRequest)?;
    let actor = actor(&headers);
    let (member, activity) = state
        .db
        .transaction(move |db| {
            let member = db.update_member_role(project_id, member_id, role)?;
            let activity = db.record_activity(
                &NewActivity::new(
                    ActivityType::MemberRoleChanged,
                    format!("{} is now {}", member.display_name, role.as_str()),
                )
                .project(project_id)
                .actor(actor)
                .metadata(serde_json::json!({"member_id": member.id, "role": role})),
            )?;
            Ok((member, activity))
        })
        .await?;
    state.hub.publish_activity(&activity);
    notify_member(&state, &member, &activity);
    Ok(Json(member))
}

async fn remove_member(
    State(state): State<SharedState>,
    Path((project_id, member_id)): Path<(i64, i64)>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let actor = actor(&headers);
    let (member, activity) = state
        .db
        .transaction(move |db| {
            let member = db.remove_member(project_id, member_id)?;
            let activity = db.record_activity(
                &NewActivity::new(
                    ActivityType::MemberRemoved,
                    format!("{} was removed from the team", member.display_name),
                )
                .project(project_id)
                .actor(actor)
                .metadata(serde_json::json!({"member_id": member.id, "user_id": member.user_id})),
            )?;
            Ok((member, activity))
        })
        .await?;
    state.hub.publish_activity(&activity);
    notify_member(&state, &member, &activity);
    Ok(StatusCode::NO_CONTENT)
}

// ── Handlers: invitations ─────────────────────────────────────────────

async fn list_invitations(
    State(state): State<SharedState>,
    Path(project_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let invitations = state
        .db
        .call(move |db| {
            db.require_project(project_id)?;
            db.list_invitations(project_id)
        })
        .await?;
    Ok(Json(invitations))
}

async fn create_invitation(
    State(state): State<SharedState>,
    Path(project_id): Path<i64>,
    headers: HeaderMap,
    Json(req): Json<CreateInvitationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let email = req.email.trim().to_string();
    if !email.contains('@') {
        return Err(ApiError::BadRequest(format!("Invalid email address: {}", email)));
    }
    let role = parse_or(req.role.as_deref(), TeamRole::Member)?;
    let actor = actor(&headers);
    let (invitation, activity) = state
        .db
        .transaction(move |db| {
            let invitation =
                db.create_invitation(project_id, &email, role, req.invited_by, INVITATION_TTL_HOURS)?;
            let activity = db.record_activity(
                &NewActivity::new(
                    ActivityType::InvitationSent,
                    format!("{} was invited as {}", invitation.email, role.as_str()),
                )
                .project(project_id)
                .actor(actor)
                .metadata(serde_json::json!({"invitation_id": invitation.id})),
            )?;
            Ok((invitation, activity))
        })
        .await?;
    state.hub.publish_activity(&activity);
    Ok((StatusCode::CREATED, Json(invitation)))
}

async fn accept_invitation(
    State(state): State<SharedState>,
    Path(token): Path<String>,
    Json(req): Json<AcceptInvitationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_non_empty("display_name", &req.display_name)?;
    let (invitation, member, activity) = state
        .db
        .transaction(move |db| {
            let (invitation, member) =
                db.accept_invitation(&token, req.user_id, req.display_name.trim())?;
            let activity = db.record_activity(
                &NewActivity::new(
                    ActivityType::InvitationAccepted,
                    format!("{} accepted the invitation", member.display_name),
                )
                .project(invitation.project_id)
                .actor(Some(member.display_name.clone()))
                .metadata(serde_json::json!({"invitation_id": invitation.id, "member_id": member.id})),
            )?;
            Ok((invitation, member, activity))
        })
        .await?;
    state.hub.publish_activity(&activity);
    notify_member(&state, &member, &activity);
    Ok(Json(AcceptedInvitation { invitation, member }))
}

async fn decline_invitation(
    State(state): State<SharedState>,
    Path(token): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let (invitation, activity) = state
        .db
        .transaction(move |db| {
            let invitation = db.decline_invitation(&token)?;
            let activity = db.record_activity(
                &NewActivity::new(
                    ActivityType::InvitationDeclined,
                    format!("{} declined the invitation", invitation.email),
                )
                .project(invitation.project_id),
            )?;
            Ok((invitation, activity))
        })
        .await?;
    state.hub.publish_activity(&activity);
    Ok(Json(invitation))
}

async fn revoke_invitation(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let actor = actor(&headers);
    let (invitation, activity) = state
        .db
        .transaction(move |db| {
            let invitation = db.revoke_invitation(id)?;
            let activity = db.record_activity(
                &NewActivity::new(
                    ActivityType::InvitationRevoked,
                    format!("Invitation for {} was revoked", invitation.email),
                )
                .project(invitation.project_id)
                .actor(actor),
            )?;
            Ok((invitation, activity))
        })
        .await?;
    state.hub.publish_activity(&activity);
    Ok(Json(invitation))
}

// ── Handlers: activities and dashboard ────────────────────────────────

async fn list_activities(
    State(state): State<SharedState>,
    Query(query): Query<ActivitiesQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_ACTIVITY_LIMIT)
        .clamp(1, MAX_ACTIVITY_LIMIT);
    let project_id = query.project_id;
    let activities = state
        .db
        .call(move |db| db.list_activities(project_id, limit))
        .await?;
    Ok(Json(activities))
}

async fn dashboard_stats(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let stats = state.db.call(|db| db.dashboard_stats()).await?;
    Ok(Json(stats))
}

async fn dashboard_projects(
    State(state): State<SharedState>,
) -> Result<impl IntoResponse, ApiError> {
    let projects = state.db.call(|db| db.dashboard_projects()).await?;
    Ok(Json(projects))
}

async fn dashboard_tasks(
    State(state): State<SharedState>,
    Query(query): Query<LimitQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_DASHBOARD_TASKS)
        .clamp(1, MAX_ACTIVITY_LIMIT);
    let tasks = state.db.call(move |db| db.dashboard_tasks(limit)).await?;
    Ok(Json(tasks))
}

// ── Handlers: GitHub ──────────────────────────────────────────────────

async fn link_github_repo(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    Json(req): Json<LinkRepoRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let owner_repo = github::parse_owner_repo(&req.repo)
        .ok_or_else(|| ApiError::BadRequest(format!("Not a GitHub repository: {}", req.repo)))?;
    let actor = actor(&headers);
    let (project, activity) = state
        .db
        .transaction(move |db| {
            let project = db.update_project_github_repo(id, &owner_repo)?;
            let activity = db.record_activity(
                &NewActivity::new(
                    ActivityType::GithubLinked,
                    format!("Project '{}' linked to {}", project.name, owner_repo),
                )
                .project(id)
                .actor(actor),
            )?;
            Ok((project, activity))
        })
        .await?;
    state.hub.publish_activity(&activity);
    Ok(Json(project))
}

/// Import every open issue of the linked repository as a task.
async fn sync_github_issues(
    State(state): State<SharedState>,
    Path(project_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let github_repo = state
        .db
        .call(move |db| Ok(db.require_project(project_id)?.github_repo))
        .await?
        .ok_or_else(|| ApiError::BadRequest("Project has no GitHub repo linked".into()))?;
    let token = github_token(&state)?;

    let gh_issues = github::list_issues(&token, &github_repo)
        .await
        .map_err(|e| ApiError::Internal(format!("Failed to fetch GitHub issues: {}", e)))?;
    let total_github = gh_issues.len();

    // Collect data needed for DB closure (must be owned)
    let gh_data: Vec<(String, String, i64)> = gh_issues
        .into_iter()
        .map(|gh| (gh.title, gh.body.unwrap_or_default(), gh.number))
        .collect();

    let repo = github_repo.clone();
    let (imported, activity) = state
        .db
        .transaction(move |db| {
            let mut imported = 0usize;
            for (title, body, number) in &gh_data {
                if db
                    .create_task_from_github(project_id, title, body, *number)?
                    .is_some()
                {
                    imported += 1;
                }
            }
            let activity = if imported > 0 {
                Some(db.record_activity(
                    &NewActivity::new(
                        ActivityType::GithubIssue,
                        format!("Imported {} issue(s) from {}", imported, repo),
                    )
                    .project(project_id),
                )?)
            } else {
                None
            };
            Ok((imported, activity))
        })
        .await?;

    if let Some(activity) = activity {
        state.hub.publish_activity(&activity);
    }
    tracing::info!(event = "github.sync", project_id, repo = %github_repo, imported, total_github);
    Ok(Json(SyncResult {
        imported,
        skipped: total_github - imported,
        total_github,
    }))
}

async fn github_status(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let connected = lock(&state.github_token)?.is_some();
    Ok(Json(GitHubAuthStatus {
        connected,
        oauth_configured: state.github.client_id.is_some() && state.github.client_secret.is_some(),
        webhook_configured: state.github.webhook_secret.is_some(),
    }))
}

async fn github_authorize(
    State(state): State<SharedState>,
    Query(query): Query<AuthorizeQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let client_id = state
        .github
        .client_id
        .as_deref()
        .ok_or_else(|| ApiError::BadRequest("GITHUB_CLIENT_ID not configured".into()))?;
    let oauth_state = uuid::Uuid::new_v4().simple().to_string();
    let url = github::authorize_url(client_id, state.github.redirect_uri.as_deref(), &oauth_state)?;
    lock(&state.oauth_states)?.insert(oauth_state, query.project_id);
    Ok(Redirect::to(url.as_str()))
}

async fn github_callback(
    State(state): State<SharedState>,
    Query(query): Query<CallbackQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let project_id = lock(&state.oauth_states)?
        .remove(&query.state)
        .ok_or_else(|| ApiError::BadRequest("Unknown or reused OAuth state".into()))?;
    let (Some(client_id), Some(client_secret)) = (
        state.github.client_id.as_deref(),
        state.github.client_secret.as_deref(),
    ) else {
        return Err(ApiError::BadRequest("GitHub OAuth is not configured".into()));
    };

    let token = github::exchange_code(
        client_id,
        client_secret,
        &query.code,
        state.github.redirect_uri.as_deref(),
    )
    .await
    .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let token_for_db = token.clone();
    *lock(&state.github_token)? = Some(token);
    // Persist token to DB settings
    state
        .db
        .call(move |db| db.set_setting("github_token", &token_for_db))
        .await?;
    tracing::info!(event = "github.connected", project_id = ?project_id);

    let target = match project_id {
        Some(id) => format!(
            "{}/projects/{}?github=connected",
            state.github.frontend_url.trim_end_matches('/'),
            id
        ),
        None => format!(
            "{}/?github=connected",
            state.github.frontend_url.trim_end_matches('/')
        ),
    };
    Ok(Redirect::to(&target))
}

async fn github_disconnect(
    State(state): State<SharedState>,
) -> Result<impl IntoResponse, ApiError> {
    *lock(&state.github_token)? = None;
    state
        .db
        .call(|db| db.delete_setting("github_token"))
        .await?;
    Ok(Json(serde_json::json!({"status": "disconnected"})))
}

async fn github_list_repos(
    State(state): State<SharedState>,
) -> Result<impl IntoResponse, ApiError> {
    let token = github_token(&state)?;
    let repos = github::list_repos(&token, 1, 100)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(repos))
}

/// GitHub webhook receiver. Verifies the signature, then turns events into
/// activities on every project linked to the repository.
async fn github_webhook(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let secret = state
        .github
        .webhook_secret
        .as_deref()
        .ok_or_else(|| ApiError::NotFound("Webhook not configured".into()))?;
    let signature = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok());
    if !github::verify_signature(secret, &body, signature) {
        tracing::warn!(event = "github.webhook_rejected");
        return Err(ApiError::Unauthorized("Invalid webhook signature".into()));
    }
    let event_name = headers
        .get("x-github-event")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::BadRequest("Missing X-GitHub-Event header".into()))?
        .to_string();
    let event = github::parse_webhook(&event_name, &body)
        .map_err(|e| ApiError::BadRequest(format!("{:#}", e)))?;
    tracing::debug!(event = "github.webhook", kind = %event_name);

    let activities = match event {
        WebhookEvent::Ping => {
            return Ok(Json(serde_json::json!({"status": "pong"})).into_response());
        }
        WebhookEvent::Ignored(kind) => {
            return Ok((
                StatusCode::ACCEPTED,
                Json(serde_json::json!({"status": "ignored", "event": kind})),
            )
                .into_response());
        }
        WebhookEvent::Push(push) => {
            state
                .db
                .transaction(move |db| {
                    let mut recorded = Vec::new();
                    for project in db.projects_for_repo(&push.repository.full_name)? {
                        let who = push
                            .sender
                            .as_ref()
                            .map(|s| s.login.clone());
                        recorded.push(db.record_activity(
                            &NewActivity::new(
                                ActivityType::GithubPush,
                                format!(
                                    "{} pushed {} commit(s) to {}",
                                    who.as_deref().unwrap_or("someone"),
                                    push.commits.len(),
                                    push.branch()
                                ),
                            )
                            .project(project.id)
                            .actor(who)
                            .metadata(serde_json::json!({
                                "repo": push.repository.full_name,
                                "branch": push.branch(),
                                "commits": push.commits.iter().map(|c| &c.id).collect::<Vec<_>>(),
                            })),
                        )?);
                    }
                    Ok(recorded)
                })
                .await?
        }
        WebhookEvent::Issues(ev) => state.db.transaction(move |db| apply_issue_event(db, &ev)).await?,
        WebhookEvent::PullRequest(ev) => {
            state
                .db
                .transaction(move |db| {
                    let mut recorded = Vec::new();
                    for project in db.projects_for_repo(&ev.repository.full_name)? {
                        let action = match (ev.action.as_str(), ev.pull_request.merged) {
                            ("closed", Some(true)) => "merged",
                            (action, _) => action,
                        };
                        recorded.push(db.record_activity(
                            &NewActivity::new(
                                ActivityType::GithubPullRequest,
                                format!(
                                    "Pull request #{} '{}' {}",
                                    ev.number, ev.pull_request.title, action
                                ),
                            )
                            .project(project.id)
                            .actor(ev.sender.as_ref().map(|s| s.login.clone()))
                            .metadata(serde_json::json!({
                                "number": ev.number,
                                "url": ev.pull_request.html_url,
                                "action": action,
                            })),
                        )?);
                    }
                    Ok(recorded)
                })
                .await?
        }
    };

    for activity in &activities {
        state.hub.publish_activity(activity);
    }
    Ok(Json(serde_json::json!({"status": "processed", "activities": activities.len()})).into_response())
}

/// Mirror an `issues` webhook onto tasks: opened/reopened imports (or
/// reopens) the task, closed moves it to done.
fn apply_issue_event(db: &HubDb, ev: &github::IssuesEvent) -> anyhow::Result<Vec<Activity>> {
    let mut recorded = Vec::new();
    let who = ev.sender.as_ref().map(|s| s.login.clone());
    for project in db.projects_for_repo(&ev.repository.full_name)? {
        let task = match ev.action.as_str() {
            "opened" | "reopened" => {
                match db.create_task_from_github(
                    project.id,
                    &ev.issue.title,
                    ev.issue.body.as_deref().unwrap_or_default(),
                    ev.issue.number,
                )? {
                    Some(task) => Some(task),
                    None => match db.find_task_by_issue(project.id, ev.issue.number)? {
                        Some(task) if task.status == TaskStatus::Done => {
                            Some(db.move_task(task.id, TaskStatus::Todo, None)?)
                        }
                        _ => None,
                    },
                }
            }
            "closed" => match db.find_task_by_issue(project.id, ev.issue.number)? {
                Some(task) if task.status != TaskStatus::Done => {
                    Some(db.move_task(task.id, TaskStatus::Done, None)?)
                }
                _ => None,
            },
            _ => None,
        };
        let Some(task) = task else { continue };
        recorded.push(db.record_activity(
            &NewActivity::new(
                ActivityType::GithubIssue,
                format!("Issue #{} '{}' {}", ev.issue.number, ev.issue.title, ev.action),
            )
            .project(project.id)
            .task(task.id)
            .actor(who.clone())
            .metadata(serde_json::json!({
                "number": ev.issue.number,
                "url": ev.issue.html_url,
                "action": ev.action,
            })),
        )?);
    }
    Ok(recorded)
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    const WEBHOOK_SECRET: &str = "hook-secret";

    fn test_state_with(github: GitHubSettings) -> SharedState {
        let db = HubDb::new_in_memory().unwrap();
        Arc::new(AppState::new(
            DbHandle::new(db),
            ActivityHub::new(64),
            StompSettings::default(),
            github,
        ))
    }

    fn test_state() -> SharedState {
        test_state_with(GitHubSettings {
            webhook_secret: Some(WEBHOOK_SECRET.to_string()),
            frontend_url: "http://localhost:3000".to_string(),
            ..Default::default()
        })
    }

    fn app(state: &SharedState) -> Router {
        api_router().with_state(state.clone())
    }

    async fn body_json<T: serde::de::DeserializeOwned>(body: Body) -> T {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<serde_json::Value>) -> Response {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        app.clone().oneshot(request).await.unwrap()
    }

    async fn create_project(app: &Router, name: &str) -> i64 {
        let resp = send(app, "POST", "/api/projects", Some(serde_json::json!({"name": name}))).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let project: serde_json::Value = body_json(resp.into_body()).await;
        project["id"].as_i64().unwrap()
    }

    async fn create_task(app: &Router, project_id: i64, title: &str) -> serde_json::Value {
        let resp = send(
            app,
            "POST",
            &format!("/api/projects/{}/tasks", project_id),
            Some(serde_json::json!({"title": title})),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        body_json(resp.into_body()).await
    }

    fn webhook_request(event: &str, body: &serde_json::Value, secret: &str) -> Request<Body> {
        let raw = body.to_string();
        let signature = github::sign_payload(secret, raw.as_bytes()).unwrap();
        Request::builder()
            .method("POST")
            .uri("/api/github/webhook")
            .header("content-type", "application/json")
            .header("x-github-event", event)
            .header("x-hub-signature-256", signature)
            .body(Body::from(raw))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let state = test_state();
        let resp = send(&app(&state), "GET", "/health", None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_create_and_list_projects() {
        let state = test_state();
        let app = app(&state);

        let resp = send(&app, "GET", "/api/projects", None).await;
        let projects: Vec<serde_json::Value> = body_json(resp.into_body()).await;
        assert!(projects.is_empty());

        let resp = send(
            &app,
            "POST",
            "/api/projects",
            Some(serde_json::json!({"name": "Apollo", "status": "active", "due_date": "2030-01-01"})),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let project: serde_json::Value = body_json(resp.into_body()).await;
        assert_eq!(project["name"], "Apollo");
        assert_eq!(project["status"], "active");
        assert_eq!(project["due_date"], "2030-01-01");

        let resp = send(&app, "GET", "/api/projects", None).await;
        let projects: Vec<serde_json::Value> = body_json(resp.into_body()).await;
        assert_eq!(projects.len(), 1);
    }

    #[tokio::test]
    async fn test_create_project_validation() {
        let state = test_state();
        let app = app(&state);
        let resp = send(&app, "POST", "/api/projects", Some(serde_json::json!({"name": "  "}))).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let err: serde_json::Value = body_json(resp.into_body()).await;
        assert_eq!(err["error"], "name is required");

        let resp = send(
            &app,
            "POST",
            "/api/projects",
            Some(serde_json::json!({"name": "x", "status": "paused"})),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_project_detail_update_and_delete() {
        let state = test_state();
        let app = app(&state);
        let id = create_project(&app, "Apollo").await;
        create_task(&app, id, "Build rocket").await;

        let resp = send(&app, "GET", &format!("/api/projects/{}", id), None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let detail: serde_json::Value = body_json(resp.into_body()).await;
        assert_eq!(detail["project"]["name"], "Apollo");
        assert_eq!(detail["tasks"].as_array().unwrap().len(), 1);
        assert!(detail["members"].as_array().unwrap().is_empty());

        let resp = send(
            &app,
            "PATCH",
            &format!("/api/projects/{}", id),
            Some(serde_json::json!({"status": "completed"})),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let project: serde_json::Value = body_json(resp.into_body()).await;
        assert_eq!(project["status"], "completed");

        let resp = send(&app, "DELETE", &format!("/api/projects/{}", id), None).await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        let resp = send(&app, "GET", &format!("/api/projects/{}", id), None).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let resp = send(&app, "DELETE", &format!("/api/projects/{}", id), None).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_task_lifecycle() {
        let state = test_state();
        let app = app(&state);
        let pid = create_project(&app, "Apollo").await;
        let first = create_task(&app, pid, "first").await;
        let second = create_task(&app, pid, "second").await;
        assert_eq!(first["position"], 0);
        assert_eq!(second["position"], 1);
        assert_eq!(first["priority"], "medium");

        let tid = first["id"].as_i64().unwrap();
        let resp = send(
            &app,
            "PATCH",
            &format!("/api/tasks/{}/status", tid),
            Some(serde_json::json!({"status": "in_progress"})),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let moved: serde_json::Value = body_json(resp.into_body()).await;
        assert_eq!(moved["status"], "in_progress");
        assert_eq!(moved["position"], 0);

        let resp = send(&app, "GET", &format!("/api/projects/{}/tasks?status=todo", pid), None).await;
        let todo: Vec<serde_json::Value> = body_json(resp.into_body()).await;
        assert_eq!(todo.len(), 1);
        assert_eq!(todo[0]["title"], "second");

        let resp = send(&app, "GET", &format!("/api/projects/{}/tasks?status=blocked", pid), None).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = send(
            &app,
            "PATCH",
            &format!("/api/tasks/{}", tid),
            Some(serde_json::json!({"title": "renamed", "priority": "high"})),
        )
        .await;
        let updated: serde_json::Value = body_json(resp.into_body()).await;
        assert_eq!(updated["title"], "renamed");
        assert_eq!(updated["priority"], "high");

        let resp = send(&app, "DELETE", &format!("/api/tasks/{}", tid), None).await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        let resp = send(&app, "GET", &format!("/api/tasks/{}", tid), None).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_create_task_for_missing_project_is_404() {
        let state = test_state();
        let resp = send(
            &app(&state),
            "POST",
            "/api/projects/999/tasks",
            Some(serde_json::json!({"title": "orphan"})),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_member_management() {
        let state = test_state();
        let app = app(&state);
        let pid = create_project(&app, "Apollo").await;
        let uri = format!("/api/projects/{}/members", pid);
        let body = serde_json::json!({"user_id": 7, "display_name": "Grace", "role": "admin"});

        let resp = send(&app, "POST", &uri, Some(body.clone())).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let member: serde_json::Value = body_json(resp.into_body()).await;
        assert_eq!(member["role"], "admin");
        let mid = member["id"].as_i64().unwrap();

        let resp = send(&app, "POST", &uri, Some(body)).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let resp = send(
            &app,
            "PATCH",
            &format!("{}/{}", uri, mid),
            Some(serde_json::json!({"role": "viewer"})),
        )
        .await;
        let member: serde_json::Value = body_json(resp.into_body()).await;
        assert_eq!(member["role"], "viewer");

        let resp = send(&app, "DELETE", &format!("{}/{}", uri, mid), None).await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        let resp = send(&app, "DELETE", &format!("{}/{}", uri, mid), None).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_member_added_notifies_team_and_user() {
        let state = test_state();
        let app = app(&state);
        let pid = create_project(&app, "Apollo").await;
        let mut rx = state.hub.subscribe();

        send(
            &app,
            "POST",
            &format!("/api/projects/{}/members", pid),
            Some(serde_json::json!({"user_id": 42, "display_name": "Ada"})),
        )
        .await;

        let mut destinations = Vec::new();
        while let Ok(out) = rx.try_recv() {
            destinations.push(out.destination.clone());
        }
        assert!(destinations.contains(&format!("/topic/teams/{}/updates", pid)));
        assert!(destinations.contains(&"/topic/notifications/user/42".to_string()));
        assert!(destinations.contains(&"/topic/activities/global".to_string()));
    }

    #[tokio::test]
    async fn test_invitation_flow() {
        let state = test_state();
        let app = app(&state);
        let pid = create_project(&app, "Apollo").await;
        let uri = format!("/api/projects/{}/invitations", pid);

        let resp = send(&app, "POST", &uri, Some(serde_json::json!({"email": "not-an-email"}))).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = send(
            &app,
            "POST",
            &uri,
            Some(serde_json::json!({"email": "kim@example.com", "role": "viewer"})),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let invitation: serde_json::Value = body_json(resp.into_body()).await;
        let token = invitation["token"].as_str().unwrap().to_string();
        assert_eq!(invitation["status"], "pending");

        let resp = send(&app, "POST", &uri, Some(serde_json::json!({"email": "kim@example.com"}))).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let accept_uri = format!("/api/invitations/{}/accept", token);
        let accept_body = serde_json::json!({"user_id": 11, "display_name": "Kim"});
        let resp = send(&app, "POST", &accept_uri, Some(accept_body.clone())).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let accepted: serde_json::Value = body_json(resp.into_body()).await;
        assert_eq!(accepted["invitation"]["status"], "accepted");
        assert_eq!(accepted["member"]["role"], "viewer");

        let resp = send(&app, "POST", &accept_uri, Some(accept_body)).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let resp = send(&app, "POST", "/api/invitations/unknown/decline", None).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_revoke_invitation() {
        let state = test_state();
        let app = app(&state);
        let pid = create_project(&app, "Apollo").await;
        let resp = send(
            &app,
            "POST",
            &format!("/api/projects/{}/invitations", pid),
            Some(serde_json::json!({"email": "a@example.com"})),
        )
        .await;
        let invitation: serde_json::Value = body_json(resp.into_body()).await;
        let id = invitation["id"].as_i64().unwrap();

        let resp = send(&app, "DELETE", &format!("/api/invitations/{}", id), None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let revoked: serde_json::Value = body_json(resp.into_body()).await;
        assert_eq!(revoked["status"], "revoked");

        let resp = send(&app, "DELETE", &format!("/api/invitations/{}", id), None).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_expired_invitation_is_bad_request() {
        let state = test_state();
        let app = app(&state);
        let pid = create_project(&app, "Apollo").await;
        let token = state
            .db
            .call(move |db| {
                Ok(db
                    .create_invitation(pid, "late@example.com", TeamRole::Member, None, -1)?
                    .token)
            })
            .await
            .unwrap();
        let resp = send(
            &app,
            "POST",
            &format!("/api/invitations/{}/accept", token),
            Some(serde_json::json!({"user_id": 1, "display_name": "Late"})),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_activities_are_recorded_and_limited() {
        let state = test_state();
        let app = app(&state);
        let pid = create_project(&app, "Apollo").await;
        create_task(&app, pid, "a").await;
        create_task(&app, pid, "b").await;
        create_project(&app, "Other").await;

        let resp = send(&app, "GET", "/api/activities", None).await;
        let all: Vec<serde_json::Value> = body_json(resp.into_body()).await;
        assert_eq!(all.len(), 4);
        assert_eq!(all[0]["activity_type"], "project_created");

        let resp = send(&app, "GET", &format!("/api/activities?project_id={}&limit=2", pid), None).await;
        let scoped: Vec<serde_json::Value> = body_json(resp.into_body()).await;
        assert_eq!(scoped.len(), 2);
        assert_eq!(scoped[0]["activity_type"], "task_created");

        // Oversized limits are capped rather than rejected.
        let resp = send(&app, "GET", "/api/activities?limit=100000", None).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_dashboard_endpoints() {
        let state = test_state();
        let app = app(&state);
        let pid = create_project(&app, "Apollo").await;
        create_task(&app, pid, "a").await;

        let resp = send(&app, "GET", "/api/dashboard/stats", None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let stats: DashboardStats = body_json(resp.into_body()).await;
        assert_eq!(stats.total_projects, 1);
        assert_eq!(stats.total_tasks, 1);
        assert_eq!(stats.tasks_by_status["todo"], 1);

        let resp = send(&app, "GET", "/api/dashboard/projects", None).await;
        let projects: Vec<serde_json::Value> = body_json(resp.into_body()).await;
        assert_eq!(projects[0]["task_count"], 1);

        let resp = send(&app, "GET", "/api/dashboard/tasks?limit=5", None).await;
        let tasks: Vec<serde_json::Value> = body_json(resp.into_body()).await;
        assert_eq!(tasks.len(), 1);
    }

    #[tokio::test]
    async fn test_create_task_publishes_on_project_and_task_topics() {
        let state = test_state();
        let app = app(&state);
        let pid = create_project(&app, "Apollo").await;
        let mut rx = state.hub.subscribe();

        let task = create_task(&app, pid, "Broadcast me").await;
        let tid = task["id"].as_i64().unwrap();

        let mut messages = Vec::new();
        while let Ok(out) = rx.try_recv() {
            messages.push(out);
        }
        let destinations: Vec<&str> = messages.iter().map(|o| o.destination.as_str()).collect();
        assert_eq!(
            destinations,
            vec![
                "/topic/activities/global".to_string(),
                format!("/topic/activities/project/{}", pid),
                format!("/topic/activities/task/{}", tid),
            ]
        );
        let body: serde_json::Value = serde_json::from_str(&messages[0].body).unwrap();
        assert_eq!(body["type"], "ACTIVITY_UPDATE");
        assert_eq!(body["payload"]["message"], "Task 'Broadcast me' created");
    }

    #[tokio::test]
    async fn test_actor_header_is_recorded() {
        let state = test_state();
        let app = app(&state);
        let request = Request::builder()
            .method("POST")
            .uri("/api/projects")
            .header("content-type", "application/json")
            .header("x-actor", "ada")
            .body(Body::from(r#"{"name":"Apollo"}"#))
            .unwrap();
        app.clone().oneshot(request).await.unwrap();
        let activities = state.db.call(|db| db.list_activities(None, 1)).await.unwrap();
        assert_eq!(activities[0].actor.as_deref(), Some("ada"));
    }

    #[tokio::test]
    async fn test_link_github_repo() {
        let state = test_state();
        let app = app(&state);
        let pid = create_project(&app, "Apollo").await;
        let uri = format!("/api/projects/{}/github", pid);

        let resp = send(&app, "PUT", &uri, Some(serde_json::json!({"repo": "nonsense"}))).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = send(
            &app,
            "PUT",
            &uri,
            Some(serde_json::json!({"repo": "https://github.com/acme/rocket.git"})),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let project: serde_json::Value = body_json(resp.into_body()).await;
        assert_eq!(project["github_repo"], "acme/rocket");
    }

    #[tokio::test]
    async fn test_sync_requires_linked_repo_and_token() {
        let state = test_state();
        let app = app(&state);
        let pid = create_project(&app, "Apollo").await;
        let uri = format!("/api/projects/{}/github/sync", pid);

        let resp = send(&app, "POST", &uri, None).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        send(
            &app,
            "PUT",
            &format!("/api/projects/{}/github", pid),
            Some(serde_json::json!({"repo": "acme/rocket"})),
        )
        .await;
        let resp = send(&app, "POST", &uri, None).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let err: serde_json::Value = body_json(resp.into_body()).await;
        assert_eq!(err["error"], "Not connected to GitHub");
    }

    #[tokio::test]
    async fn test_github_status_and_oauth_authorize() {
        let state = test_state();
        let resp = send(&app(&state), "GET", "/api/github/status", None).await;
        let status: serde_json::Value = body_json(resp.into_body()).await;
        assert_eq!(status["connected"], false);
        assert_eq!(status["oauth_configured"], false);
        assert_eq!(status["webhook_configured"], true);

        let resp = send(&app(&state), "GET", "/api/github/oauth/authorize", None).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let state = test_state_with(GitHubSettings {
            client_id: Some("cid".to_string()),
            client_secret: Some("csecret".to_string()),
            frontend_url: "http://localhost:3000".to_string(),
            ..Default::default()
        });
        let resp = send(&app(&state), "GET", "/api/github/oauth/authorize?project_id=3", None).await;
        assert_eq!(resp.status(), StatusCode::SEE_OTHER);
        let location = resp.headers()["location"].to_str().unwrap().to_string();
        assert!(location.starts_with("https://github.com/login/oauth/authorize?"));
        assert!(location.contains("client_id=cid"));

        let states = state.oauth_states.lock().unwrap();
        assert_eq!(states.len(), 1);
        let (oauth_state, project) = states.iter().next().unwrap();
        assert!(location.contains(oauth_state.as_str()));
        assert_eq!(*project, Some(3));
    }

    #[tokio::test]
    async fn test_oauth_callback_rejects_unknown_state() {
        let state = test_state();
        let resp = send(
            &app(&state),
            "GET",
            "/api/github/oauth/callback?code=abc&state=forged",
            None,
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_github_disconnect_clears_token() {
        let state = test_state();
        *state.github_token.lock().unwrap() = Some("gho_x".to_string());
        state
            .db
            .call(|db| db.set_setting("github_token", "gho_x"))
            .await
            .unwrap();

        let resp = send(&app(&state), "POST", "/api/github/disconnect", None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(state.github_token.lock().unwrap().is_none());
        let stored = state.db.call(|db| db.get_setting("github_token")).await.unwrap();
        assert!(stored.is_none());
    }

    #[tokio::test]
    async fn test_webhook_disabled_without_secret() {
        let state = test_state_with(GitHubSettings::default());
        let resp = app(&state)
            .oneshot(webhook_request("ping", &serde_json::json!({}), "anything"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_webhook_rejects_bad_signature() {
        let state = test_state();
        let resp = app(&state)
            .oneshot(webhook_request("ping", &serde_json::json!({}), "wrong-secret"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_webhook_ping_and_unknown_event() {
        let state = test_state();
        let resp = app(&state)
            .oneshot(webhook_request("ping", &serde_json::json!({"zen": "hi"}), WEBHOOK_SECRET))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body: serde_json::Value = body_json(resp.into_body()).await;
        assert_eq!(body["status"], "pong");

        let resp = app(&state)
            .oneshot(webhook_request("star", &serde_json::json!({}), WEBHOOK_SECRET))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn test_webhook_issue_opened_then_closed() {
        let state = test_state();
        let app = app(&state);
        let pid = create_project(&app, "Apollo").await;
        send(
            &app,
            "PUT",
            &format!("/api/projects/{}/github", pid),
            Some(serde_json::json!({"repo": "acme/rocket"})),
        )
        .await;

        let issue = |action: &str| {
            serde_json::json!({
                "action": action,
                "issue": {"number": 7, "title": "Crash", "body": "boom", "state": "open",
                          "html_url": "https://github.com/acme/rocket/issues/7"},
                "repository": {"full_name": "acme/rocket"},
                "sender": {"login": "octocat"}
            })
        };

        for _ in 0..2 {
            let resp = app
                .clone()
                .oneshot(webhook_request("issues", &issue("opened"), WEBHOOK_SECRET))
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
        }
        let tasks = state.db.call(move |db| db.list_tasks(pid, None)).await.unwrap();
        assert_eq!(tasks.len(), 1, "issue import must be idempotent");
        assert_eq!(tasks[0].github_issue_number, Some(7));

        let resp = app
            .clone()
            .oneshot(webhook_request("issues", &issue("closed"), WEBHOOK_SECRET))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let tasks = state.db.call(move |db| db.list_tasks(pid, None)).await.unwrap();
        assert_eq!(tasks[0].status, TaskStatus::Done);

        let activities = state.db.call(move |db| db.list_activities(Some(pid), 10)).await.unwrap();
        let issue_events = activities
            .iter()
            .filter(|a| a.activity_type == ActivityType::GithubIssue)
            .count();
        assert_eq!(issue_events, 2);
        assert_eq!(activities[0].actor.as_deref(), Some("octocat"));
    }

    #[tokio::test]
    async fn test_webhook_push_records_activity_per_linked_project() {
        let state = test_state();
        let app = app(&state);
        for name in ["One", "Two"] {
            let pid = create_project(&app, name).await;
            send(
                &app,
                "PUT",
                &format!("/api/projects/{}/github", pid),
                Some(serde_json::json!({"repo": "Acme/Rocket"})),
            )
            .await;
        }
        create_project(&app, "Unlinked").await;

        let push = serde_json::json!({
            "ref": "refs/heads/main",
            "repository": {"full_name": "acme/rocket"},
            "commits": [{"id": "a1", "message": "m1"}, {"id": "b2", "message": "m2"}],
            "sender": {"login": "octocat"}
        });
        let resp = app
            .clone()
            .oneshot(webhook_request("push", &push, WEBHOOK_SECRET))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body: serde_json::Value = body_json(resp.into_body()).await;
        assert_eq!(body["activities"], 2);

        let activities = state.db.call(|db| db.list_activities(None, 1)).await.unwrap();
        assert_eq!(activities[0].activity_type, ActivityType::GithubPush);
        assert_eq!(activities[0].message, "octocat pushed 2 commit(s) to main");
    }

    #[tokio::test]
    async fn test_webhook_pull_request_merged() {
        let state = test_state();
        let app = app(&state);
        let pid = create_project(&app, "Apollo").await;
        send(
            &app,
            "PUT",
            &format!("/api/projects/{}/github", pid),
            Some(serde_json::json!({"repo": "acme/rocket"})),
        )
        .await;
        let pr = serde_json::json!({
            "action": "closed",
            "number": 12,
            "pull_request": {"title": "Add boosters", "html_url": "https://github.com/acme/rocket/pull/12", "merged": true},
            "repository": {"full_name": "acme/rocket"}
        });
        let resp = app
            .clone()
            .oneshot(webhook_request("pull_request", &pr, WEBHOOK_SECRET))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let activities = state.db.call(move |db| db.list_activities(Some(pid), 1)).await.unwrap();
        assert_eq!(activities[0].activity_type, ActivityType::GithubPullRequest);
        assert_eq!(activities[0].message, "Pull request #12 'Add boosters' merged");
    }

    #[test]
    fn test_api_error_mapping() {
        let cases: Vec<(anyhow::Error, StatusCode)> = vec![
            (HubError::TaskNotFound { id: 1 }.into(), StatusCode::NOT_FOUND),
            (
                HubError::DuplicateMember {
                    project_id: 1,
                    user_id: 2,
                }
                .into(),
                StatusCode::CONFLICT,
            ),
            (HubError::InvitationExpired.into(), StatusCode::BAD_REQUEST),
            (HubError::Unauthorized("x".into()).into(), StatusCode::UNAUTHORIZED),
            (anyhow::anyhow!("disk on fire"), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, expected) in cases {
            let resp = ApiError::from(err).into_response();
            assert_eq!(resp.status(), expected);
        }
    }
}
