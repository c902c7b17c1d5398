use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::models::*;
use crate::errors::HubError;

/// Invitations stay acceptable for seven days.
pub const INVITATION_TTL_HOURS: i64 = 7 * 24;

/// Async-safe handle to the hub database.
///
/// Wraps `HubDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O
/// never ties up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<HubDb>>,
}

impl DbHandle {
    pub fn new(db: HubDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&HubDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|_| HubError::LockPoisoned)?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Like `call`, but everything `f` writes commits atomically.
    pub async fn transaction<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&HubDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.call(move |db| db.atomically(f)).await
    }
}

pub struct HubDb {
    conn: Connection,
}

const PROJECT_COLUMNS: &str =
    "id, name, description, status, github_repo, due_date, created_at, updated_at";

const TASK_COLUMNS: &str = "id, project_id, title, description, status, priority, assignee_id, \
     due_date, position, github_issue_number, created_at, updated_at";

const MEMBER_COLUMNS: &str = "id, project_id, user_id, display_name, email, role, joined_at";

const INVITATION_COLUMNS: &str =
    "id, project_id, email, role, token, status, invited_by, created_at, expires_at";

const ACTIVITY_COLUMNS: &str =
    "id, activity_type, project_id, task_id, actor, message, metadata, created_at";

impl HubDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Run `f` inside a savepoint: its writes commit together or roll back
    /// together. Savepoints nest, so atomic helpers compose into wider units.
    pub fn atomically<R>(&self, f: impl FnOnce(&Self) -> Result<R>) -> Result<R> {
        self.conn
            .execute_batch("SAVEPOINT hub_op")
            .context("Failed to begin savepoint")?;
        match f(self) {
            Ok(value) => {
                self.conn
                    .execute_batch("RELEASE hub_op")
                    .context("Failed to commit savepoint")?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = self.conn.execute_batch("ROLLBACK TO hub_op; RELEASE hub_op") {
                    tracing::warn!(event = "db.rollback_failed", error = %rollback);
                }
                Err(e)
            }
        }
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS projects (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    status TEXT NOT NULL DEFAULT 'planning',
                    due_date TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS tasks (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    title TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    status TEXT NOT NULL DEFAULT 'todo',
                    priority TEXT NOT NULL DEFAULT 'medium',
                    assignee_id INTEGER,
                    due_date TEXT,
                    position INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS team_members (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    user_id INTEGER NOT NULL,
                    display_name TEXT NOT NULL,
                    email TEXT NOT NULL DEFAULT '',
                    role TEXT NOT NULL DEFAULT 'member',
                    joined_at TEXT NOT NULL DEFAULT (datetime('now')),
                    UNIQUE(project_id, user_id)
                );

                CREATE TABLE IF NOT EXISTS invitations (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    email TEXT NOT NULL,
                    role TEXT NOT NULL DEFAULT 'member',
                    token TEXT NOT NULL UNIQUE,
                    status TEXT NOT NULL DEFAULT 'pending',
                    invited_by INTEGER,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    expires_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS activities (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    activity_type TEXT NOT NULL,
                    project_id INTEGER,
                    task_id INTEGER,
                    actor TEXT,
                    message TEXT NOT NULL,
                    metadata TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS settings (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL,
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE INDEX IF NOT EXISTS idx_tasks_project ON tasks(project_id);
                CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(project_id, status);
                CREATE INDEX IF NOT EXISTS idx_members_project ON team_members(project_id);
                CREATE INDEX IF NOT EXISTS idx_invitations_project ON invitations(project_id);
                CREATE INDEX IF NOT EXISTS idx_activities_project ON activities(project_id);
                ",
            )
            .context("Failed to create tables")?;

        // Additive migrations (columns are nullable, safe to re-run).
        // We only ignore "duplicate column" errors; any other error is propagated.
        for (sql, what) in [
            ("ALTER TABLE projects ADD COLUMN github_repo TEXT", "github_repo"),
            (
                "ALTER TABLE tasks ADD COLUMN github_issue_number INTEGER",
                "github_issue_number",
            ),
        ] {
            match self.conn.execute(sql, []) {
                Ok(_) => {}
                Err(e) if e.to_string().contains("duplicate column") => {}
                Err(e) => return Err(anyhow::anyhow!("Failed to add {} column: {}", what, e)),
            }
        }
        self.conn
            .execute_batch(
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_tasks_github_number
             ON tasks(project_id, github_issue_number)
             WHERE github_issue_number IS NOT NULL;",
            )
            .context("Failed to create github_issue_number index")?;

        Ok(())
    }

    // ── Project CRUD ──────────────────────────────────────────────────

    pub fn create_project(
        &self,
        name: &str,
        description: &str,
        status: ProjectStatus,
        due_date: Option<&str>,
    ) -> Result<Project> {
        self.conn
            .execute(
                "INSERT INTO projects (name, description, status, due_date) VALUES (?1, ?2, ?3, ?4)",
                params![name, description, status.as_str(), due_date],
            )
            .context("Failed to insert project")?;
        let id = self.conn.last_insert_rowid();
        self.get_project(id)?
            .context("Project not found after insert")
    }

    pub fn list_projects(&self) -> Result<Vec<Project>> {
        let sql = format!("SELECT {} FROM projects ORDER BY id", PROJECT_COLUMNS);
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_projects")?;
        let rows = stmt
            .query_map([], ProjectRow::read)
            .context("Failed to query projects")?;
        let mut projects = Vec::new();
        for row in rows {
            projects.push(row.context("Failed to read project row")?.into_project()?);
        }
        Ok(projects)
    }

    pub fn get_project(&self, id: i64) -> Result<Option<Project>> {
        let sql = format!("SELECT {} FROM projects WHERE id = ?1", PROJECT_COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![id], ProjectRow::read)
            .optional()
            .context("Failed to query project")?;
        row.map(ProjectRow::into_project).transpose()
    }

    /// Like `get_project`, but a missing row is a `HubError::ProjectNotFound`.
    pub fn require_project(&self, id: i64) -> Result<Project> {
        self.get_project(id)?
            .ok_or_else(|| HubError::ProjectNotFound { id }.into())
    }

    pub fn update_project(&self, id: i64, patch: &ProjectPatch) -> Result<Project> {
        self.require_project(id)?;

        self.atomically(|db| {
            if let Some(name) = &patch.name {
                db.conn.execute(
                    "UPDATE projects SET name = ?1, updated_at = datetime('now') WHERE id = ?2",
                    params![name, id],
                )
                .context("Failed to update project name")?;
            }
            if let Some(description) = &patch.description {
                db.conn.execute(
                    "UPDATE projects SET description = ?1, updated_at = datetime('now') WHERE id = ?2",
                    params![description, id],
                )
                .context("Failed to update project description")?;
            }
            if let Some(status) = patch.status {
                db.conn.execute(
                    "UPDATE projects SET status = ?1, updated_at = datetime('now') WHERE id = ?2",
                    params![status.as_str(), id],
                )
                .context("Failed to update project status")?;
            }
            if let Some(due_date) = &patch.due_date {
                db.conn.execute(
                    "UPDATE projects SET due_date = ?1, updated_at = datetime('now') WHERE id = ?2",
                    params![due_date, id],
                )
                .context("Failed to update project due date")?;
            }
            Ok(())
        })?;
        self.require_project(id)
    }

    pub fn delete_project(&self, id: i64) -> Result<bool> {
        let count = self
            .conn
            .execute("DELETE FROM projects WHERE id = ?1", params![id])
            .context("Failed to delete project")?;
        Ok(count > 0)
    }

    pub fn update_project_github_repo(&self, id: i64, github_repo: &str) -> Result<Project> {
        let count = self
            .conn
            .execute(
                "UPDATE projects SET github_repo = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![github_repo, id],
            )
            .context("Failed to update project github_repo")?;
        if count == 0 {
            return Err(HubError::ProjectNotFound { id }.into());
        }
        self.require_project(id)
    }

    /// Projects linked to a GitHub `owner/repo` (case-insensitive).
    pub fn projects_for_repo(&self, full_name: &str) -> Result<Vec<Project>> {
        let sql = format!(
            "SELECT {} FROM projects WHERE lower(github_repo) = lower(?1) ORDER BY id",
            PROJECT_COLUMNS
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare projects_for_repo")?;
        let rows = stmt
            .query_map(params![full_name], ProjectRow::read)
            .context("Failed to query projects by repo")?;
        let mut projects = Vec::new();
        for row in rows {
            projects.push(row.context("Failed to read project row")?.into_project()?);
        }
        Ok(projects)
    }

    pub fn get_project_detail(&self, id: i64) -> Result<Option<ProjectDetail>> {
        let project = match self.get_project(id)? {
            Some(p) => p,
            None => return Ok(None),
        };
        let tasks = self.list_tasks(id, None)?;
        let members = self.list_members(id)?;
        Ok(Some(ProjectDetail {
            project,
            tasks,
            members,
        }))
    }

    // ── Task CRUD ─────────────────────────────────────────────────────

    fn next_position(&self, project_id: i64, status: TaskStatus) -> Result<i32> {
        let max_pos: i32 = self
            .conn
            .query_row(
                "SELECT COALESCE(MAX(position), -1) FROM tasks WHERE project_id = ?1 AND status = ?2",
                params![project_id, status.as_str()],
                |row| row.get(0),
            )
            .context("Failed to get max position")?;
        Ok(max_pos + 1)
    }

    pub fn create_task(&self, project_id: i64, task: &NewTask) -> Result<Task> {
        self.require_project(project_id)?;
        let position = self.next_position(project_id, task.status)?;

        self.conn
            .execute(
                "INSERT INTO tasks (project_id, title, description, status, priority, assignee_id, due_date, position)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    project_id,
                    task.title,
                    task.description,
                    task.status.as_str(),
                    task.priority.as_str(),
                    task.assignee_id,
                    task.due_date,
                    position
                ],
            )
            .context("Failed to insert task")?;
        let id = self.conn.last_insert_rowid();
        self.require_task(id)
    }

    pub fn list_tasks(&self, project_id: i64, status: Option<TaskStatus>) -> Result<Vec<Task>> {
        let sql = format!(
            "SELECT {} FROM tasks WHERE project_id = ?1 AND (?2 IS NULL OR status = ?2)
             ORDER BY status, position, id",
            TASK_COLUMNS
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_tasks")?;
        let rows = stmt
            .query_map(
                params![project_id, status.map(|s| s.as_str())],
                TaskRow::read,
            )
            .context("Failed to query tasks")?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row.context("Failed to read task row")?.into_task()?);
        }
        Ok(tasks)
    }

    pub fn get_task(&self, id: i64) -> Result<Option<Task>> {
        let sql = format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![id], TaskRow::read)
            .optional()
            .context("Failed to query task")?;
        row.map(TaskRow::into_task).transpose()
    }

    pub fn require_task(&self, id: i64) -> Result<Task> {
        self.get_task(id)?
            .ok_or_else(|| HubError::TaskNotFound { id }.into())
    }

    pub fn update_task(&self, id: i64, patch: &TaskPatch) -> Result<Task> {
        self.require_task(id)?;

        self.atomically(|db| {
            if let Some(t) = &patch.title {
                db.conn.execute(
                    "UPDATE tasks SET title = ?1, updated_at = datetime('now') WHERE id = ?2",
                    params![t, id],
                )
                .context("Failed to update task title")?;
            }
            if let Some(d) = &patch.description {
                db.conn.execute(
                    "UPDATE tasks SET description = ?1, updated_at = datetime('now') WHERE id = ?2",
                    params![d, id],
                )
                .context("Failed to update task description")?;
            }
            if let Some(p) = patch.priority {
                db.conn.execute(
                    "UPDATE tasks SET priority = ?1, updated_at = datetime('now') WHERE id = ?2",
                    params![p.as_str(), id],
                )
                .context("Failed to update task priority")?;
            }
            if let Some(a) = patch.assignee_id {
                db.conn.execute(
                    "UPDATE tasks SET assignee_id = ?1, updated_at = datetime('now') WHERE id = ?2",
                    params![a, id],
                )
                .context("Failed to update task assignee")?;
            }
            if let Some(d) = &patch.due_date {
                db.conn.execute(
                    "UPDATE tasks SET due_date = ?1, updated_at = datetime('now') WHERE id = ?2",
                    params![d, id],
                )
                .context("Failed to update task due date")?;
            }
            Ok(())
        })?;
        self.require_task(id)
    }

    /// Move a task to another status column. `position` defaults to the end
    /// of the target column.
    pub fn move_task(&self, id: i64, status: TaskStatus, position: Option<i32>) -> Result<Task> {
        let task = self.require_task(id)?;
        let position = match position {
            Some(p) => p,
            None if task.status == status => task.position,
            None => self.next_position(task.project_id, status)?,
        };
        self.conn
            .execute(
                "UPDATE tasks SET status = ?1, position = ?2, updated_at = datetime('now') WHERE id = ?3",
                params![status.as_str(), position, id],
            )
            .context("Failed to move task")?;
        self.require_task(id)
    }

    pub fn delete_task(&self, id: i64) -> Result<bool> {
        let count = self
            .conn
            .execute("DELETE FROM tasks WHERE id = ?1", params![id])
            .context("Failed to delete task")?;
        Ok(count > 0)
    }

    /// Import a GitHub issue as a `todo` task. Returns `None` when the issue
    /// was already imported for this project.
    pub fn create_task_from_github(
        &self,
        project_id: i64,
        title: &str,
        description: &str,
        github_issue_number: i64,
    ) -> Result<Option<Task>> {
        if self
            .find_task_by_issue(project_id, github_issue_number)?
            .is_some()
        {
            return Ok(None);
        }

        let position = self.next_position(project_id, TaskStatus::Todo)?;
        self.conn
            .execute(
                "INSERT INTO tasks (project_id, title, description, status, position, github_issue_number)
                 VALUES (?1, ?2, ?3, 'todo', ?4, ?5)",
                params![project_id, title, description, position, github_issue_number],
            )
            .context("Failed to insert github task")?;
        let id = self.conn.last_insert_rowid();
        self.get_task(id)
    }

    pub fn find_task_by_issue(&self, project_id: i64, github_issue_number: i64) -> Result<Option<Task>> {
        let sql = format!(
            "SELECT {} FROM tasks WHERE project_id = ?1 AND github_issue_number = ?2",
            TASK_COLUMNS
        );
        let row = self
            .conn
            .query_row(&sql, params![project_id, github_issue_number], TaskRow::read)
            .optional()
            .context("Failed to query task by issue number")?;
        row.map(TaskRow::into_task).transpose()
    }

    // ── Team members ──────────────────────────────────────────────────

    pub fn add_member(
        &self,
        project_id: i64,
        user_id: i64,
        display_name: &str,
        email: &str,
        role: TeamRole,
    ) -> Result<TeamMember> {
        self.require_project(project_id)?;
        let exists: bool = self
            .conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM team_members WHERE project_id = ?1 AND user_id = ?2",
                params![project_id, user_id],
                |row| row.get(0),
            )
            .context("Failed to check existing membership")?;
        if exists {
            return Err(HubError::DuplicateMember {
                project_id,
                user_id,
            }
            .into());
        }

        self.conn
            .execute(
                "INSERT INTO team_members (project_id, user_id, display_name, email, role)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![project_id, user_id, display_name, email, role.as_str()],
            )
            .context("Failed to insert team member")?;
        let id = self.conn.last_insert_rowid();
        self.get_member(id)?
            .context("Team member not found after insert")
    }

    pub fn list_members(&self, project_id: i64) -> Result<Vec<TeamMember>> {
        let sql = format!(
            "SELECT {} FROM team_members WHERE project_id = ?1 ORDER BY id",
            MEMBER_COLUMNS
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_members")?;
        let rows = stmt
            .query_map(params![project_id], MemberRow::read)
            .context("Failed to query team members")?;
        let mut members = Vec::new();
        for row in rows {
            members.push(row.context("Failed to read member row")?.into_member()?);
        }
        Ok(members)
    }

    pub fn get_member(&self, id: i64) -> Result<Option<TeamMember>> {
        let sql = format!("SELECT {} FROM team_members WHERE id = ?1", MEMBER_COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![id], MemberRow::read)
            .optional()
            .context("Failed to query team member")?;
        row.map(MemberRow::into_member).transpose()
    }

    fn require_member_of(&self, project_id: i64, member_id: i64) -> Result<TeamMember> {
        match self.get_member(member_id)? {
            Some(m) if m.project_id == project_id => Ok(m),
            _ => Err(HubError::MemberNotFound { id: member_id }.into()),
        }
    }

    pub fn update_member_role(&self, project_id: i64, member_id: i64, role: TeamRole) -> Result<TeamMember> {
        self.require_member_of(project_id, member_id)?;
        self.conn
            .execute(
                "UPDATE team_members SET role = ?1 WHERE id = ?2",
                params![role.as_str(), member_id],
            )
            .context("Failed to update member role")?;
        self.require_member_of(project_id, member_id)
    }

    /// Remove a member, returning the removed row.
    pub fn remove_member(&self, project_id: i64, member_id: i64) -> Result<TeamMember> {
        let member = self.require_member_of(project_id, member_id)?;
        self.conn
            .execute("DELETE FROM team_members WHERE id = ?1", params![member_id])
            .context("Failed to delete team member")?;
        Ok(member)
    }

    // ── Invitations ───────────────────────────────────────────────────

    pub fn create_invitation(
        &self,
        project_id: i64,
        email: &str,
        role: TeamRole,
        invited_by: Option<i64>,
        ttl_hours: i64,
    ) -> Result<Invitation> {
        self.require_project(project_id)?;
        self.expire_stale_invitations()?;

        let pending: bool = self
            .conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM invitations
                 WHERE project_id = ?1 AND lower(email) = lower(?2) AND status = 'pending'",
                params![project_id, email],
                |row| row.get(0),
            )
            .context("Failed to check pending invitations")?;
        if pending {
            return Err(HubError::InvitationPending {
                email: email.to_string(),
            }
            .into());
        }

        let token = uuid::Uuid::new_v4().simple().to_string();
        let modifier = format!("{:+} hours", ttl_hours);
        self.conn
            .execute(
                "INSERT INTO invitations (project_id, email, role, token, invited_by, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, datetime('now', ?6))",
                params![project_id, email, role.as_str(), token, invited_by, modifier],
            )
            .context("Failed to insert invitation")?;
        self.get_invitation_by_token(&token)?
            .context("Invitation not found after insert")
    }

    /// Flip pending invitations past their expiry to `expired`.
    fn expire_stale_invitations(&self) -> Result<usize> {
        self.conn
            .execute(
                "UPDATE invitations SET status = 'expired'
                 WHERE status = 'pending' AND expires_at <= datetime('now')",
                [],
            )
            .context("Failed to expire invitations")
    }

    pub fn list_invitations(&self, project_id: i64) -> Result<Vec<Invitation>> {
        self.expire_stale_invitations()?;
        let sql = format!(
            "SELECT {} FROM invitations WHERE project_id = ?1 ORDER BY id",
            INVITATION_COLUMNS
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_invitations")?;
        let rows = stmt
            .query_map(params![project_id], InvitationRow::read)
            .context("Failed to query invitations")?;
        let mut invitations = Vec::new();
        for row in rows {
            invitations.push(row.context("Failed to read invitation row")?.into_invitation()?);
        }
        Ok(invitations)
    }

    pub fn get_invitation_by_token(&self, token: &str) -> Result<Option<Invitation>> {
        let sql = format!("SELECT {} FROM invitations WHERE token = ?1", INVITATION_COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![token], InvitationRow::read)
            .optional()
            .context("Failed to query invitation")?;
        row.map(InvitationRow::into_invitation).transpose()
    }

    fn get_invitation(&self, id: i64) -> Result<Option<Invitation>> {
        let sql = format!("SELECT {} FROM invitations WHERE id = ?1", INVITATION_COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![id], InvitationRow::read)
            .optional()
            .context("Failed to query invitation")?;
        row.map(InvitationRow::into_invitation).transpose()
    }

    /// Load a pending invitation by token, expiring it first if due.
    fn require_pending_invitation(&self, token: &str) -> Result<Invitation> {
        self.expire_stale_invitations()?;
        let invitation = self
            .get_invitation_by_token(token)?
            .ok_or_else(|| HubError::InvitationNotFound(token.to_string()))?;
        match invitation.status {
            InvitationStatus::Pending => Ok(invitation),
            InvitationStatus::Expired => Err(HubError::InvitationExpired.into()),
            other => Err(HubError::InvitationNotPending {
                status: other.as_str().to_string(),
            }
            .into()),
        }
    }

    fn set_invitation_status(&self, id: i64, status: InvitationStatus) -> Result<Invitation> {
        self.conn
            .execute(
                "UPDATE invitations SET status = ?1 WHERE id = ?2",
                params![status.as_str(), id],
            )
            .context("Failed to update invitation status")?;
        self.get_invitation(id)?
            .context("Invitation not found after status update")
    }

    /// Accept an invitation: the invitee becomes a team member with the
    /// invited role, atomically with the status change.
    pub fn accept_invitation(
        &self,
        token: &str,
        user_id: i64,
        display_name: &str,
    ) -> Result<(Invitation, TeamMember)> {
        let invitation = self.require_pending_invitation(token)?;

        self.atomically(|db| {
            let member = db.add_member(
                invitation.project_id,
                user_id,
                display_name,
                &invitation.email,
                invitation.role,
            )?;
            let invitation = db.set_invitation_status(invitation.id, InvitationStatus::Accepted)?;
            Ok((invitation, member))
        })
    }

    pub fn decline_invitation(&self, token: &str) -> Result<Invitation> {
        let invitation = self.require_pending_invitation(token)?;
        self.set_invitation_status(invitation.id, InvitationStatus::Declined)
    }

    pub fn revoke_invitation(&self, id: i64) -> Result<Invitation> {
        let invitation = self
            .get_invitation(id)?
            .ok_or_else(|| HubError::InvitationNotFound(id.to_string()))?;
        if invitation.status != InvitationStatus::Pending {
            return Err(HubError::InvitationNotPending {
                status: invitation.status.as_str().to_string(),
            }
            .into());
        }
        self.set_invitation_status(id, InvitationStatus::Revoked)
    }

    // ── Activities ────────────────────────────────────────────────────

    pub fn record_activity(&self, activity: &NewActivity) -> Result<Activity> {
        let metadata = match &activity.metadata {
            Some(m) => Some(serde_json::to_string(m).context("Failed to serialize activity metadata")?),
            None => None,
        };
        self.conn
            .execute(
                "INSERT INTO activities (activity_type, project_id, task_id, actor, message, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    activity.activity_type.as_str(),
                    activity.project_id,
                    activity.task_id,
                    activity.actor,
                    activity.message,
                    metadata
                ],
            )
            .context("Failed to insert activity")?;
        let id = self.conn.last_insert_rowid();
        let sql = format!("SELECT {} FROM activities WHERE id = ?1", ACTIVITY_COLUMNS);
        self.conn
            .query_row(&sql, params![id], ActivityRow::read)
            .context("Activity not found after insert")?
            .into_activity()
    }

    /// Most recent activities first.
    pub fn list_activities(&self, project_id: Option<i64>, limit: i64) -> Result<Vec<Activity>> {
        let sql = format!(
            "SELECT {} FROM activities WHERE (?1 IS NULL OR project_id = ?1)
             ORDER BY id DESC LIMIT ?2",
            ACTIVITY_COLUMNS
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_activities")?;
        let rows = stmt
            .query_map(params![project_id, limit], ActivityRow::read)
            .context("Failed to query activities")?;
        let mut activities = Vec::new();
        for row in rows {
            activities.push(row.context("Failed to read activity row")?.into_activity()?);
        }
        Ok(activities)
    }

    // ── Dashboard ─────────────────────────────────────────────────────

    pub fn dashboard_stats(&self) -> Result<DashboardStats> {
        self.expire_stale_invitations()?;
        let count = |sql: &str| -> Result<i64> {
            self.conn
                .query_row(sql, [], |row| row.get(0))
                .with_context(|| format!("Failed to run dashboard query: {}", sql))
        };

        let mut tasks_by_status = std::collections::BTreeMap::new();
        for status in TaskStatus::ALL {
            tasks_by_status.insert(status.as_str().to_string(), 0);
        }
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM tasks GROUP BY status")
            .context("Failed to prepare task status counts")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .context("Failed to query task status counts")?;
        for row in rows {
            let (status, n) = row.context("Failed to read status count")?;
            tasks_by_status.insert(status, n);
        }

        Ok(DashboardStats {
            total_projects: count("SELECT COUNT(*) FROM projects")?,
            active_projects: count("SELECT COUNT(*) FROM projects WHERE status = 'active'")?,
            total_tasks: count("SELECT COUNT(*) FROM tasks")?,
            tasks_by_status,
            overdue_tasks: count(
                "SELECT COUNT(*) FROM tasks
                 WHERE due_date IS NOT NULL AND due_date < date('now') AND status != 'done'",
            )?,
            team_members: count("SELECT COUNT(DISTINCT user_id) FROM team_members")?,
            pending_invitations: count("SELECT COUNT(*) FROM invitations WHERE status = 'pending'")?,
        })
    }

    pub fn dashboard_projects(&self) -> Result<Vec<ProjectSummary>> {
        let mut summaries = Vec::new();
        for project in self.list_projects()? {
            let (task_count, done_count): (i64, i64) = self
                .conn
                .query_row(
                    "SELECT COUNT(*), COALESCE(SUM(status = 'done'), 0) FROM tasks WHERE project_id = ?1",
                    params![project.id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .context("Failed to count project tasks")?;
            summaries.push(ProjectSummary {
                project,
                task_count,
                done_count,
            });
        }
        Ok(summaries)
    }

    /// Recently touched tasks across all projects.
    pub fn dashboard_tasks(&self, limit: i64) -> Result<Vec<Task>> {
        let sql = format!(
            "SELECT {} FROM tasks ORDER BY updated_at DESC, id DESC LIMIT ?1",
            TASK_COLUMNS
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare dashboard_tasks")?;
        let rows = stmt
            .query_map(params![limit], TaskRow::read)
            .context("Failed to query dashboard tasks")?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row.context("Failed to read task row")?.into_task()?);
        }
        Ok(tasks)
    }

    // ── Settings ──────────────────────────────────────────────────────

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .context("Failed to query setting")
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, datetime('now'))
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = datetime('now')",
                params![key, value],
            )
            .context("Failed to upsert setting")?;
        Ok(())
    }

    pub fn delete_setting(&self, key: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM settings WHERE key = ?1", params![key])
            .context("Failed to delete setting")?;
        Ok(())
    }
}

// ── Internal row helpers ──────────────────────────────────────────────

/// Intermediate row structs hold enum columns as raw strings until they
/// are parsed into typed values outside the rusqlite row callback.
struct ProjectRow {
    id: i64,
    name: String,
    description: String,
    status: String,
    github_repo: Option<String>,
    due_date: Option<String>,
    created_at: String,
    updated_at: String,
}

impl ProjectRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
            status: row.get(3)?,
            github_repo: row.get(4)?,
            due_date: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }

    fn into_project(self) -> Result<Project> {
        let status = ProjectStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse project status")?;
        Ok(Project {
            id: self.id,
            name: self.name,
            description: self.description,
            status,
            github_repo: self.github_repo,
            due_date: self.due_date,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

struct TaskRow {
    id: i64,
    project_id: i64,
    title: String,
    description: String,
    status: String,
    priority: String,
    assignee_id: Option<i64>,
    due_date: Option<String>,
    position: i32,
    github_issue_number: Option<i64>,
    created_at: String,
    updated_at: String,
}

impl TaskRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            project_id: row.get(1)?,
            title: row.get(2)?,
            description: row.get(3)?,
            status: row.get(4)?,
            priority: row.get(5)?,
            assignee_id: row.get(6)?,
            due_date: row.get(7)?,
            position: row.get(8)?,
            github_issue_number: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }

    fn into_task(self) -> Result<Task> {
        let status = TaskStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse task status")?;
        let priority = Priority::from_str(&self.priority)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse task priority")?;
        Ok(Task {
            id: self.id,
            project_id: self.project_id,
            title: self.title,
            description: self.description,
            status,
            priority,
            assignee_id: self.assignee_id,
            due_date: self.due_date,
            position: self.position,
            github_issue_number: self.github_issue_number,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

struct MemberRow {
    id: i64,
    project_id: i64,
    user_id: i64,
    display_name: String,
    email: String,
    role: String,
    joined_at: String,
}

impl MemberRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            project_id: row.get(1)?,
            user_id: row.get(2)?,
            display_name: row.get(3)?,
            email: row.get(4)?,
            role: row.get(5)?,
            joined_at: row.get(6)?,
        })
    }

    fn into_member(self) -> Result<TeamMember> {
        let role = TeamRole::from_str(&self.role)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse member role")?;
        Ok(TeamMember {
            id: self.id,
            project_id: self.project_id,
            user_id: self.user_id,
            display_name: self.display_name,
            email: self.email,
            role,
            joined_at: self.joined_at,
        })
    }
}

struct InvitationRow {
    id: i64,
    project_id: i64,
    email: String,
    role: String,
    token: String,
    status: String,
    invited_by: Option<i64>,
    created_at: String,
    expires_at: String,
}

impl InvitationRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            project_id: row.get(1)?,
            email: row.get(2)?,
            role: row.get(3)?,
            token: row.get(4)?,
            status: row.get(5)?,
            invited_by: row.get(6)?,
            created_at: row.get(7)?,
            expires_at: row.get(8)?,
        })
    }

    fn into_invitation(self) -> Result<Invitation> {
        let role = TeamRole::from_str(&self.role)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse invitation role")?;
        let status = InvitationStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse invitation status")?;
        Ok(Invitation {
            id: self.id,
            project_id: self.project_id,
            email: self.email,
            role,
            token: self.token,
            status,
            invited_by: self.invited_by,
            created_at: self.created_at,
            expires_at: self.expires_at,
        })
    }
}

struct ActivityRow {
    id: i64,
    activity_type: String,
    project_id: Option<i64>,
    task_id: Option<i64>,
    actor: Option<String>,
    message: String,
    metadata: Option<String>,
    created_at: String,
}

impl ActivityRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            activity_type: row.get(1)?,
            project_id: row.get(2)?,
            task_id: row.get(3)?,
            actor: row.get(4)?,
            message: row.get(5)?,
            metadata: row.get(6)?,
            created_at: row.get(7)?,
        })
    }

    fn into_activity(self) -> Result<Activity> {
        let activity_type = ActivityType::from_str(&self.activity_type)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse activity type")?;
        let metadata = match self.metadata {
            Some(s) => Some(
                serde_json::from_str(&s)
                    .map_err(|e| anyhow::anyhow!("corrupt activity metadata JSON '{}': {}", s, e))?,
            ),
            None => None,
        };
        Ok(Activity {
            id: self.id,
            activity_type,
            project_id: self.project_id,
            task_id: self.task_id,
            actor: self.actor,
            message: self.message,
            metadata,
            created_at: self.created_at,
        })
    }
}
