use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::models::*;
use crate::errors::HubError;

/// Name of the pipeline every new sub-account starts with.
pub const DEFAULT_PIPELINE_NAME: &str = "Lead Cycle";

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
}

pub struct HubDb {
    conn: Connection,
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// RFC 3339 with microseconds so rows written in the same second still sort.
fn now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

fn parse_column<T>(idx: usize, value: String) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    value.parse::<T>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e.into())
    })
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

// ── Row mapping ───────────────────────────────────────────────────────

const AGENCY_COLUMNS: &str = "id, name, agency_logo, company_email, company_phone, white_label, \
     address, city, zip_code, state, country, goal, connect_account_id, created_at, updated_at";

fn agency_from_row(row: &Row<'_>) -> rusqlite::Result<Agency> {
    Ok(Agency {
        id: row.get(0)?,
        name: row.get(1)?,
        agency_logo: row.get(2)?,
        company_email: row.get(3)?,
        company_phone: row.get(4)?,
        white_label: row.get(5)?,
        address: row.get(6)?,
        city: row.get(7)?,
        zip_code: row.get(8)?,
        state: row.get(9)?,
        country: row.get(10)?,
        goal: row.get(11)?,
        connect_account_id: row.get(12)?,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
    })
}

const SUB_ACCOUNT_COLUMNS: &str = "id, agency_id, name, sub_account_logo, company_email, \
     company_phone, goal, address, city, zip_code, state, country, connect_account_id, \
     created_at, updated_at";

fn sub_account_from_row(row: &Row<'_>) -> rusqlite::Result<SubAccount> {
    Ok(SubAccount {
        id: row.get(0)?,
        agency_id: row.get(1)?,
        name: row.get(2)?,
        sub_account_logo: row.get(3)?,
        company_email: row.get(4)?,
        company_phone: row.get(5)?,
        goal: row.get(6)?,
        address: row.get(7)?,
        city: row.get(8)?,
        zip_code: row.get(9)?,
        state: row.get(10)?,
        country: row.get(11)?,
        connect_account_id: row.get(12)?,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
    })
}

const USER_COLUMNS: &str = "id, name, avatar_url, email, role, agency_id, created_at, updated_at";

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        name: row.get(1)?,
        avatar_url: row.get(2)?,
        email: row.get(3)?,
        role: parse_column(4, row.get(4)?)?,
        agency_id: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

const PERMISSION_COLUMNS: &str = "id, email, sub_account_id, access";

fn permission_from_row(row: &Row<'_>) -> rusqlite::Result<Permission> {
    Ok(Permission {
        id: row.get(0)?,
        email: row.get(1)?,
        sub_account_id: row.get(2)?,
        access: row.get(3)?,
    })
}

const SIDEBAR_COLUMNS: &str = "id, name, link, icon, agency_id, sub_account_id";

fn sidebar_option_from_row(row: &Row<'_>) -> rusqlite::Result<SidebarOption> {
    Ok(SidebarOption {
        id: row.get(0)?,
        name: row.get(1)?,
        link: row.get(2)?,
        icon: row.get(3)?,
        agency_id: row.get(4)?,
        sub_account_id: row.get(5)?,
    })
}

const INVITATION_COLUMNS: &str = "id, email, agency_id, status, role";

fn invitation_from_row(row: &Row<'_>) -> rusqlite::Result<Invitation> {
    Ok(Invitation {
        id: row.get(0)?,
        email: row.get(1)?,
        agency_id: row.get(2)?,
        status: parse_column(3, row.get(3)?)?,
        role: parse_column(4, row.get(4)?)?,
    })
}

const NOTIFICATION_COLUMNS: &str =
    "id, notification, agency_id, sub_account_id, user_id, created_at";

fn notification_from_row(row: &Row<'_>) -> rusqlite::Result<Notification> {
    Ok(Notification {
        id: row.get(0)?,
        notification: row.get(1)?,
        agency_id: row.get(2)?,
        sub_account_id: row.get(3)?,
        user_id: row.get(4)?,
        created_at: row.get(5)?,
    })
}

const MEDIA_COLUMNS: &str = "id, media_type, name, link, sub_account_id, created_at";

fn media_from_row(row: &Row<'_>) -> rusqlite::Result<Media> {
    Ok(Media {
        id: row.get(0)?,
        media_type: row.get(1)?,
        name: row.get(2)?,
        link: row.get(3)?,
        sub_account_id: row.get(4)?,
        created_at: row.get(5)?,
    })
}

const PIPELINE_COLUMNS: &str = "id, name, sub_account_id, created_at, updated_at";

fn pipeline_from_row(row: &Row<'_>) -> rusqlite::Result<Pipeline> {
    Ok(Pipeline {
        id: row.get(0)?,
        name: row.get(1)?,
        sub_account_id: row.get(2)?,
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
    })
}

const FUNNEL_COLUMNS: &str = "id, name, description, published, sub_domain_name, favicon, \
                              live_products, sub_account_id, created_at, updated_at";

fn funnel_from_row(row: &Row<'_>) -> rusqlite::Result<Funnel> {
    Ok(Funnel {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        published: row.get(3)?,
        sub_domain_name: row.get(4)?,
        favicon: row.get(5)?,
        live_products: row.get(6)?,
        sub_account_id: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

const LANE_COLUMNS: &str = "id, name, pipeline_id, sort_order, created_at, updated_at";

fn lane_from_row(row: &Row<'_>) -> rusqlite::Result<Lane> {
    Ok(Lane {
        id: row.get(0)?,
        name: row.get(1)?,
        pipeline_id: row.get(2)?,
        order: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

const TICKET_COLUMNS: &str = "id, name, lane_id, sort_order, value, description, customer_id, \
     assigned_user_id, created_at, updated_at";

fn ticket_from_row(row: &Row<'_>) -> rusqlite::Result<Ticket> {
    Ok(Ticket {
        id: row.get(0)?,
        name: row.get(1)?,
        lane_id: row.get(2)?,
        order: row.get(3)?,
        value: row.get(4)?,
        description: row.get(5)?,
        customer_id: row.get(6)?,
        assigned_user_id: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

const TAG_COLUMNS: &str = "id, name, color, sub_account_id";

fn tag_from_row(row: &Row<'_>) -> rusqlite::Result<Tag> {
    Ok(Tag {
        id: row.get(0)?,
        name: row.get(1)?,
        color: row.get(2)?,
        sub_account_id: row.get(3)?,
    })
}

const CONTACT_COLUMNS: &str = "id, name, email, sub_account_id, created_at";

fn contact_from_row(row: &Row<'_>) -> rusqlite::Result<Contact> {
    Ok(Contact {
        id: row.get(0)?,
        name: row.get(1)?,
        email: row.get(2)?,
        sub_account_id: row.get(3)?,
        created_at: row.get(4)?,
    })
}

/// Default sidebar entries created with a new agency: (name, icon, link suffix).
const AGENCY_SIDEBAR: [(&str, &str, &str); 6] = [
    ("Dashboard", "category", ""),
    ("Launchpad", "clipboardIcon", "/launchpad"),
    ("Billing", "payment", "/billing"),
    ("Settings", "settings", "/settings"),
    ("Sub Accounts", "person", "/all-subaccounts"),
    ("Team", "shield", "/team"),
];

/// Default sidebar entries created with a new sub-account.
const SUB_ACCOUNT_SIDEBAR: [(&str, &str, &str); 8] = [
    ("Launchpad", "clipboardIcon", "/launchpad"),
    ("Settings", "settings", "/settings"),
    ("Funnels", "pipelines", "/funnels"),
    ("Media", "database", "/media"),
    ("Automations", "chip", "/automations"),
    ("Pipelines", "flag", "/pipelines"),
    ("Contacts", "person", "/contacts"),
    ("Dashboard", "category", ""),
];

/// New user row, built from an authenticated principal or an invitation.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub id: String,
    pub name: String,
    pub avatar_url: String,
    pub email: String,
    pub role: Role,
    pub agency_id: Option<String>,
}

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
                CREATE TABLE IF NOT EXISTS agencies (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    agency_logo TEXT NOT NULL DEFAULT '',
                    company_email TEXT NOT NULL,
                    company_phone TEXT NOT NULL DEFAULT '',
                    white_label INTEGER NOT NULL DEFAULT 1,
                    address TEXT NOT NULL DEFAULT '',
                    city TEXT NOT NULL DEFAULT '',
                    zip_code TEXT NOT NULL DEFAULT '',
                    state TEXT NOT NULL DEFAULT '',
                    country TEXT NOT NULL DEFAULT '',
                    goal INTEGER NOT NULL DEFAULT 5,
                    connect_account_id TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS users (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    avatar_url TEXT NOT NULL DEFAULT '',
                    email TEXT NOT NULL UNIQUE,
                    role TEXT NOT NULL DEFAULT 'SUBACCOUNT_USER',
                    agency_id TEXT REFERENCES agencies(id) ON DELETE CASCADE,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS sub_accounts (
                    id TEXT PRIMARY KEY,
                    agency_id TEXT NOT NULL REFERENCES agencies(id) ON DELETE CASCADE,
                    name TEXT NOT NULL,
                    sub_account_logo TEXT NOT NULL DEFAULT '',
                    company_email TEXT NOT NULL,
                    company_phone TEXT NOT NULL DEFAULT '',
                    goal INTEGER NOT NULL DEFAULT 5,
                    address TEXT NOT NULL DEFAULT '',
                    city TEXT NOT NULL DEFAULT '',
                    zip_code TEXT NOT NULL DEFAULT '',
                    state TEXT NOT NULL DEFAULT '',
                    country TEXT NOT NULL DEFAULT '',
                    connect_account_id TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS permissions (
                    id TEXT PRIMARY KEY,
                    email TEXT NOT NULL REFERENCES users(email) ON DELETE CASCADE,
                    sub_account_id TEXT NOT NULL REFERENCES sub_accounts(id) ON DELETE CASCADE,
                    access INTEGER NOT NULL DEFAULT 0,
                    UNIQUE(email, sub_account_id)
                );

                CREATE TABLE IF NOT EXISTS sidebar_options (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    link TEXT NOT NULL DEFAULT '#',
                    icon TEXT NOT NULL DEFAULT 'info',
                    agency_id TEXT REFERENCES agencies(id) ON DELETE CASCADE,
                    sub_account_id TEXT REFERENCES sub_accounts(id) ON DELETE CASCADE,
                    position INTEGER NOT NULL DEFAULT 0
                );

                CREATE TABLE IF NOT EXISTS invitations (
                    id TEXT PRIMARY KEY,
                    email TEXT NOT NULL UNIQUE,
                    agency_id TEXT NOT NULL REFERENCES agencies(id) ON DELETE CASCADE,
                    status TEXT NOT NULL DEFAULT 'PENDING',
                    role TEXT NOT NULL DEFAULT 'SUBACCOUNT_USER'
                );

                CREATE TABLE IF NOT EXISTS notifications (
                    id TEXT PRIMARY KEY,
                    notification TEXT NOT NULL,
                    agency_id TEXT NOT NULL REFERENCES agencies(id) ON DELETE CASCADE,
                    sub_account_id TEXT REFERENCES sub_accounts(id) ON DELETE CASCADE,
                    user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS media (
                    id TEXT PRIMARY KEY,
                    media_type TEXT,
                    name TEXT NOT NULL,
                    link TEXT NOT NULL UNIQUE,
                    sub_account_id TEXT NOT NULL REFERENCES sub_accounts(id) ON DELETE CASCADE,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS pipelines (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    sub_account_id TEXT NOT NULL REFERENCES sub_accounts(id) ON DELETE CASCADE,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS funnels (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    description TEXT,
                    published INTEGER NOT NULL DEFAULT 0,
                    sub_domain_name TEXT UNIQUE,
                    favicon TEXT,
                    live_products TEXT NOT NULL DEFAULT '[]',
                    sub_account_id TEXT NOT NULL REFERENCES sub_accounts(id) ON DELETE CASCADE,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS lanes (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    pipeline_id TEXT NOT NULL REFERENCES pipelines(id) ON DELETE CASCADE,
                    sort_order INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS tags (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    color TEXT NOT NULL,
                    sub_account_id TEXT NOT NULL REFERENCES sub_accounts(id) ON DELETE CASCADE
                );

                CREATE TABLE IF NOT EXISTS contacts (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    email TEXT NOT NULL,
                    sub_account_id TEXT NOT NULL REFERENCES sub_accounts(id) ON DELETE CASCADE,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS tickets (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    lane_id TEXT NOT NULL REFERENCES lanes(id) ON DELETE CASCADE,
                    sort_order INTEGER NOT NULL DEFAULT 0,
                    value REAL,
                    description TEXT,
                    customer_id TEXT REFERENCES contacts(id) ON DELETE SET NULL,
                    assigned_user_id TEXT REFERENCES users(id) ON DELETE SET NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS ticket_tags (
                    ticket_id TEXT NOT NULL REFERENCES tickets(id) ON DELETE CASCADE,
                    tag_id TEXT NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
                    PRIMARY KEY (ticket_id, tag_id)
                );

                CREATE INDEX IF NOT EXISTS idx_users_agency ON users(agency_id);
                CREATE INDEX IF NOT EXISTS idx_sub_accounts_agency ON sub_accounts(agency_id);
                CREATE INDEX IF NOT EXISTS idx_notifications_agency ON notifications(agency_id);
                CREATE INDEX IF NOT EXISTS idx_lanes_pipeline ON lanes(pipeline_id, sort_order);
                CREATE INDEX IF NOT EXISTS idx_tickets_lane ON tickets(lane_id, sort_order);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Agency ────────────────────────────────────────────────────────

    /// Insert or update an agency by id.
    ///
    /// Returns `None` without touching the database when `company_email`
    /// is empty. On first creation the user whose email matches
    /// `company_email` joins the agency and the default sidebar is created.
    pub fn upsert_agency(&self, input: &AgencyInput) -> Result<Option<Agency>> {
        if input.company_email.trim().is_empty() {
            return Ok(None);
        }
        let id = input.id.clone().unwrap_or_else(new_id);
        let exists = self.get_agency(&id)?.is_some();
        let ts = now();

        // Safety: DbHandle's Mutex already guarantees single-threaded access.
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        if exists {
            tx.execute(
                "UPDATE agencies SET name = ?1, agency_logo = ?2, company_email = ?3, company_phone = ?4,
                    white_label = ?5, address = ?6, city = ?7, zip_code = ?8, state = ?9, country = ?10,
                    goal = COALESCE(?11, goal), updated_at = ?12
                 WHERE id = ?13",
                params![
                    input.name,
                    input.agency_logo,
                    input.company_email,
                    input.company_phone,
                    input.white_label,
                    input.address,
                    input.city,
                    input.zip_code,
                    input.state,
                    input.country,
                    input.goal,
                    ts,
                    id
                ],
            )
            .context("Failed to update agency")?;
        } else {
            tx.execute(
                "INSERT INTO agencies (id, name, agency_logo, company_email, company_phone, white_label,
                    address, city, zip_code, state, country, goal, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13)",
                params![
                    id,
                    input.name,
                    input.agency_logo,
                    input.company_email,
                    input.company_phone,
                    input.white_label,
                    input.address,
                    input.city,
                    input.zip_code,
                    input.state,
                    input.country,
                    input.goal.unwrap_or(5),
                    ts
                ],
            )
            .context("Failed to insert agency")?;
            tx.execute(
                "UPDATE users SET agency_id = ?1, updated_at = ?2
                 WHERE email = ?3 AND agency_id IS NULL",
                params![id, ts, input.company_email],
            )
            .context("Failed to connect agency owner")?;
            for (position, (name, icon, suffix)) in AGENCY_SIDEBAR.iter().enumerate() {
                tx.execute(
                    "INSERT INTO sidebar_options (id, name, link, icon, agency_id, position)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        new_id(),
                        name,
                        format!("/agency/{}{}", id, suffix),
                        icon,
                        id,
                        position as i64
                    ],
                )
                .context("Failed to insert agency sidebar option")?;
            }
        }

        tx.commit().context("Failed to commit agency upsert")?;
        self.get_agency(&id)
    }

    pub fn get_agency(&self, id: &str) -> Result<Option<Agency>> {
        self.conn
            .query_row(
                &format!("SELECT {AGENCY_COLUMNS} FROM agencies WHERE id = ?1"),
                params![id],
                agency_from_row,
            )
            .optional()
            .context("Failed to query agency")
    }

    pub fn get_agency_with_sidebar(&self, id: &str) -> Result<Option<AgencyWithSidebar>> {
        let agency = match self.get_agency(id)? {
            Some(a) => a,
            None => return Ok(None),
        };
        let sidebar_options = self.list_agency_sidebar(id)?;
        let mut sub_accounts = Vec::new();
        for sub_account in self.list_sub_accounts(id)? {
            let sidebar_options = self.list_sub_account_sidebar(&sub_account.id)?;
            sub_accounts.push(SubAccountWithSidebar {
                sub_account,
                sidebar_options,
            });
        }
        Ok(Some(AgencyWithSidebar {
            agency,
            sidebar_options,
            sub_accounts,
        }))
    }

    pub fn update_agency_goal(&self, id: &str, goal: i64) -> Result<Agency> {
        self.conn
            .execute(
                "UPDATE agencies SET goal = ?1, updated_at = ?2 WHERE id = ?3",
                params![goal, now(), id],
            )
            .context("Failed to update agency goal")?;
        self.get_agency(id)?
            .ok_or_else(|| HubError::AgencyNotFound { id: id.to_string() }.into())
    }

    pub fn delete_agency(&self, id: &str) -> Result<bool> {
        let count = self
            .conn
            .execute("DELETE FROM agencies WHERE id = ?1", params![id])
            .context("Failed to delete agency")?;
        Ok(count > 0)
    }

    // ── Sub-account ───────────────────────────────────────────────────

    /// Insert or update a sub-account by id.
    ///
    /// Returns `None` when `company_email` is empty or the agency has no
    /// AGENCY_OWNER. First creation also grants the owner access and creates
    /// the default pipeline and sidebar, all in one transaction.
    pub fn upsert_sub_account(&self, input: &SubAccountInput) -> Result<Option<SubAccount>> {
        if input.company_email.trim().is_empty() {
            return Ok(None);
        }
        let owner = match self.find_agency_owner(&input.agency_id)? {
            Some(owner) => owner,
            None => return Ok(None),
        };
        let id = input.id.clone().unwrap_or_else(new_id);
        let exists = self.get_sub_account(&id)?.is_some();
        let ts = now();

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        if exists {
            tx.execute(
                "UPDATE sub_accounts SET name = ?1, sub_account_logo = ?2, company_email = ?3,
                    company_phone = ?4, address = ?5, city = ?6, zip_code = ?7, state = ?8,
                    country = ?9, goal = COALESCE(?10, goal), updated_at = ?11
                 WHERE id = ?12",
                params![
                    input.name,
                    input.sub_account_logo,
                    input.company_email,
                    input.company_phone,
                    input.address,
                    input.city,
                    input.zip_code,
                    input.state,
                    input.country,
                    input.goal,
                    ts,
                    id
                ],
            )
            .context("Failed to update sub-account")?;
        } else {
            tx.execute(
                "INSERT INTO sub_accounts (id, agency_id, name, sub_account_logo, company_email,
                    company_phone, goal, address, city, zip_code, state, country, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13)",
                params![
                    id,
                    input.agency_id,
                    input.name,
                    input.sub_account_logo,
                    input.company_email,
                    input.company_phone,
                    input.goal.unwrap_or(5),
                    input.address,
                    input.city,
                    input.zip_code,
                    input.state,
                    input.country,
                    ts
                ],
            )
            .context("Failed to insert sub-account")?;
            tx.execute(
                "INSERT INTO permissions (id, email, sub_account_id, access) VALUES (?1, ?2, ?3, 1)",
                params![new_id(), owner.email, id],
            )
            .context("Failed to grant owner permission")?;
            tx.execute(
                "INSERT INTO pipelines (id, name, sub_account_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                params![new_id(), DEFAULT_PIPELINE_NAME, id, ts],
            )
            .context("Failed to create default pipeline")?;
            for (position, (name, icon, suffix)) in SUB_ACCOUNT_SIDEBAR.iter().enumerate() {
                tx.execute(
                    "INSERT INTO sidebar_options (id, name, link, icon, sub_account_id, position)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        new_id(),
                        name,
                        format!("/subaccount/{}{}", id, suffix),
                        icon,
                        id,
                        position as i64
                    ],
                )
                .context("Failed to insert sub-account sidebar option")?;
            }
        }

        tx.commit().context("Failed to commit sub-account upsert")?;
        self.get_sub_account(&id)
    }

    pub fn get_sub_account(&self, id: &str) -> Result<Option<SubAccount>> {
        self.conn
            .query_row(
                &format!("SELECT {SUB_ACCOUNT_COLUMNS} FROM sub_accounts WHERE id = ?1"),
                params![id],
                sub_account_from_row,
            )
            .optional()
            .context("Failed to query sub-account")
    }

    pub fn list_sub_accounts(&self, agency_id: &str) -> Result<Vec<SubAccount>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {SUB_ACCOUNT_COLUMNS} FROM sub_accounts WHERE agency_id = ?1 ORDER BY created_at"
            ))
            .context("Failed to prepare list_sub_accounts")?;
        let rows = stmt
            .query_map(params![agency_id], sub_account_from_row)
            .context("Failed to query sub-accounts")?;
        let mut sub_accounts = Vec::new();
        for row in rows {
            sub_accounts.push(row.context("Failed to read sub-account row")?);
        }
        Ok(sub_accounts)
    }

    pub fn delete_sub_account(&self, id: &str) -> Result<bool> {
        let count = self
            .conn
            .execute("DELETE FROM sub_accounts WHERE id = ?1", params![id])
            .context("Failed to delete sub-account")?;
        Ok(count > 0)
    }

    // ── Users ─────────────────────────────────────────────────────────

    /// Create the user, or update the role of the existing user with the
    /// same email. `role: None` keeps an existing role and defaults a new
    /// user to SUBACCOUNT_USER.
    pub fn upsert_user(&self, user: &NewUser, role: Option<Role>) -> Result<User> {
        let ts = now();
        let create_role = role.unwrap_or(user.role);
        self.conn
            .execute(
                "INSERT INTO users (id, name, avatar_url, email, role, agency_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
                 ON CONFLICT(email) DO UPDATE SET
                    role = COALESCE(?8, users.role),
                    updated_at = ?7",
                params![
                    user.id,
                    user.name,
                    user.avatar_url,
                    user.email,
                    create_role.as_str(),
                    user.agency_id,
                    ts,
                    role.map(|r| r.as_str())
                ],
            )
            .context("Failed to upsert user")?;
        self.get_user_by_email(&user.email)?
            .context("User not found after upsert")
    }

    /// Add an invited member to an agency. Refuses to create a second owner.
    pub fn create_team_user(&self, user: &NewUser) -> Result<Option<User>> {
        if user.role == Role::AgencyOwner {
            return Ok(None);
        }
        let ts = now();
        self.conn
            .execute(
                "INSERT INTO users (id, name, avatar_url, email, role, agency_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
                params![
                    user.id,
                    user.name,
                    user.avatar_url,
                    user.email,
                    user.role.as_str(),
                    user.agency_id,
                    ts
                ],
            )
            .context("Failed to insert team user")?;
        self.get_user(&user.id)
    }

    pub fn get_user(&self, id: &str) -> Result<Option<User>> {
        self.conn
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
                params![id],
                user_from_row,
            )
            .optional()
            .context("Failed to query user")
    }

    pub fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        self.conn
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE email = ?1"),
                params![email],
                user_from_row,
            )
            .optional()
            .context("Failed to query user by email")
    }

    pub fn update_user(&self, update: &UserUpdate) -> Result<User> {
        let count = self
            .conn
            .execute(
                "UPDATE users SET
                    name = COALESCE(?1, name),
                    avatar_url = COALESCE(?2, avatar_url),
                    role = COALESCE(?3, role),
                    updated_at = ?4
                 WHERE email = ?5",
                params![
                    update.name,
                    update.avatar_url,
                    update.role.map(|r| r.as_str()),
                    now(),
                    update.email
                ],
            )
            .context("Failed to update user")?;
        if count == 0 {
            return Err(HubError::UserNotFound {
                id: update.email.clone(),
            }
            .into());
        }
        self.get_user_by_email(&update.email)?
            .context("User not found after update")
    }

    /// Delete a user and return the removed row.
    pub fn delete_user(&self, id: &str) -> Result<Option<User>> {
        let user = self.get_user(id)?;
        if user.is_some() {
            self.conn
                .execute("DELETE FROM users WHERE id = ?1", params![id])
                .context("Failed to delete user")?;
        }
        Ok(user)
    }

    pub fn list_team(&self, agency_id: &str) -> Result<Vec<User>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {USER_COLUMNS} FROM users WHERE agency_id = ?1 ORDER BY created_at"
            ))
            .context("Failed to prepare list_team")?;
        let rows = stmt
            .query_map(params![agency_id], user_from_row)
            .context("Failed to query team")?;
        let mut users = Vec::new();
        for row in rows {
            users.push(row.context("Failed to read user row")?);
        }
        Ok(users)
    }

    pub fn find_agency_owner(&self, agency_id: &str) -> Result<Option<User>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {USER_COLUMNS} FROM users
                     WHERE agency_id = ?1 AND role = 'AGENCY_OWNER'
                     ORDER BY created_at LIMIT 1"
                ),
                params![agency_id],
                user_from_row,
            )
            .optional()
            .context("Failed to query agency owner")
    }

    /// Any member of the agency that owns the sub-account. Used to attribute
    /// activity when no principal is present.
    pub fn find_user_for_sub_account_agency(&self, sub_account_id: &str) -> Result<Option<User>> {
        self.conn
            .query_row(
                "SELECT u.id, u.name, u.avatar_url, u.email, u.role, u.agency_id, u.created_at, u.updated_at
                 FROM users u
                 JOIN sub_accounts s ON s.agency_id = u.agency_id
                 WHERE s.id = ?1
                 ORDER BY u.created_at LIMIT 1",
                params![sub_account_id],
                user_from_row,
            )
            .optional()
            .context("Failed to query sub-account agency user")
    }

    // ── Permissions ───────────────────────────────────────────────────

    pub fn list_permissions_for_email(&self, email: &str) -> Result<Vec<Permission>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {PERMISSION_COLUMNS} FROM permissions WHERE email = ?1 ORDER BY rowid"
            ))
            .context("Failed to prepare list_permissions_for_email")?;
        let rows = stmt
            .query_map(params![email], permission_from_row)
            .context("Failed to query permissions")?;
        let mut permissions = Vec::new();
        for row in rows {
            permissions.push(row.context("Failed to read permission row")?);
        }
        Ok(permissions)
    }

    /// Permissions of a user joined with the sub-account they grant.
    pub fn get_user_permissions(&self, user_id: &str) -> Result<Vec<PermissionWithSubAccount>> {
        let user = match self.get_user(user_id)? {
            Some(u) => u,
            None => return Ok(Vec::new()),
        };
        let mut result = Vec::new();
        for permission in self.list_permissions_for_email(&user.email)? {
            let sub_account = self
                .get_sub_account(&permission.sub_account_id)?
                .context("Permission references a missing sub-account")?;
            result.push(PermissionWithSubAccount {
                permission,
                sub_account,
            });
        }
        Ok(result)
    }

    /// Set access for (email, sub-account). Updates by `permission_id` when it
    /// names an existing row, otherwise upserts on the (email, sub-account) pair.
    pub fn change_user_permission(
        &self,
        permission_id: Option<&str>,
        email: &str,
        sub_account_id: &str,
        access: bool,
    ) -> Result<Permission> {
        if let Some(pid) = permission_id {
            let updated = self
                .conn
                .execute(
                    "UPDATE permissions SET access = ?1 WHERE id = ?2",
                    params![access, pid],
                )
                .context("Failed to update permission")?;
            if updated > 0 {
                return self
                    .conn
                    .query_row(
                        &format!("SELECT {PERMISSION_COLUMNS} FROM permissions WHERE id = ?1"),
                        params![pid],
                        permission_from_row,
                    )
                    .context("Permission not found after update");
            }
        }

        self.conn
            .execute(
                "INSERT INTO permissions (id, email, sub_account_id, access) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(email, sub_account_id) DO UPDATE SET access = excluded.access",
                params![
                    permission_id.map(str::to_string).unwrap_or_else(new_id),
                    email,
                    sub_account_id,
                    access
                ],
            )
            .context("Failed to upsert permission")?;
        self.conn
            .query_row(
                &format!(
                    "SELECT {PERMISSION_COLUMNS} FROM permissions WHERE email = ?1 AND sub_account_id = ?2"
                ),
                params![email, sub_account_id],
                permission_from_row,
            )
            .context("Permission not found after upsert")
    }

    pub fn has_sub_account_access(&self, email: &str, sub_account_id: &str) -> Result<bool> {
        let granted: bool = self
            .conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM permissions
                 WHERE email = ?1 AND sub_account_id = ?2 AND access = 1",
                params![email, sub_account_id],
                |row| row.get(0),
            )
            .context("Failed to query permission")?;
        Ok(granted)
    }

    // ── Sidebar ───────────────────────────────────────────────────────

    pub fn list_agency_sidebar(&self, agency_id: &str) -> Result<Vec<SidebarOption>> {
        self.list_sidebar("agency_id", agency_id)
    }

    pub fn list_sub_account_sidebar(&self, sub_account_id: &str) -> Result<Vec<SidebarOption>> {
        self.list_sidebar("sub_account_id", sub_account_id)
    }

    fn list_sidebar(
        &self,
        owner_column: &'static str,
        owner_id: &str,
    ) -> Result<Vec<SidebarOption>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {SIDEBAR_COLUMNS} FROM sidebar_options WHERE {owner_column} = ?1 ORDER BY position"
            ))
            .context("Failed to prepare list_sidebar")?;
        let rows = stmt
            .query_map(params![owner_id], sidebar_option_from_row)
            .context("Failed to query sidebar options")?;
        let mut options = Vec::new();
        for row in rows {
            options.push(row.context("Failed to read sidebar option row")?);
        }
        Ok(options)
    }

    // ── Invitations ───────────────────────────────────────────────────

    pub fn create_invitation(
        &self,
        email: &str,
        agency_id: &str,
        role: Role,
    ) -> Result<Invitation> {
        let id = new_id();
        self.conn
            .execute(
                "INSERT INTO invitations (id, email, agency_id, status, role) VALUES (?1, ?2, ?3, 'PENDING', ?4)",
                params![id, email, agency_id, role.as_str()],
            )
            .context("Failed to insert invitation")?;
        self.conn
            .query_row(
                &format!("SELECT {INVITATION_COLUMNS} FROM invitations WHERE id = ?1"),
                params![id],
                invitation_from_row,
            )
            .context("Invitation not found after insert")
    }

    pub fn get_pending_invitation(&self, email: &str) -> Result<Option<Invitation>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {INVITATION_COLUMNS} FROM invitations WHERE email = ?1 AND status = 'PENDING'"
                ),
                params![email],
                invitation_from_row,
            )
            .optional()
            .context("Failed to query pending invitation")
    }

    pub fn list_invitations(&self, agency_id: &str) -> Result<Vec<Invitation>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {INVITATION_COLUMNS} FROM invitations WHERE agency_id = ?1 ORDER BY rowid"
            ))
            .context("Failed to prepare list_invitations")?;
        let rows = stmt
            .query_map(params![agency_id], invitation_from_row)
            .context("Failed to query invitations")?;
        let mut invitations = Vec::new();
        for row in rows {
            invitations.push(row.context("Failed to read invitation row")?);
        }
        Ok(invitations)
    }

    pub fn delete_invitation(&self, email: &str) -> Result<bool> {
        let count = self
            .conn
            .execute("DELETE FROM invitations WHERE email = ?1", params![email])
            .context("Failed to delete invitation")?;
        Ok(count > 0)
    }

    // ── Notifications ─────────────────────────────────────────────────

    pub fn create_notification(
        &self,
        text: &str,
        agency_id: &str,
        sub_account_id: Option<&str>,
        user_id: &str,
    ) -> Result<Notification> {
        let id = new_id();
        self.conn
            .execute(
                "INSERT INTO notifications (id, notification, agency_id, sub_account_id, user_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![id, text, agency_id, sub_account_id, user_id, now()],
            )
            .context("Failed to insert notification")?;
        self.conn
            .query_row(
                &format!("SELECT {NOTIFICATION_COLUMNS} FROM notifications WHERE id = ?1"),
                params![id],
                notification_from_row,
            )
            .context("Notification not found after insert")
    }

    /// Notifications of an agency with their author, newest first.
    pub fn list_notifications_with_user(
        &self,
        agency_id: &str,
    ) -> Result<Vec<NotificationWithUser>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {NOTIFICATION_COLUMNS} FROM notifications
                 WHERE agency_id = ?1 ORDER BY created_at DESC, rowid DESC"
            ))
            .context("Failed to prepare list_notifications_with_user")?;
        let rows = stmt
            .query_map(params![agency_id], notification_from_row)
            .context("Failed to query notifications")?;

        let mut users: HashMap<String, User> = HashMap::new();
        let mut result = Vec::new();
        for row in rows {
            let notification = row.context("Failed to read notification row")?;
            let user = match users.get(&notification.user_id) {
                Some(u) => u.clone(),
                None => {
                    let u = self
                        .get_user(&notification.user_id)?
                        .context("Notification references a missing user")?;
                    users.insert(u.id.clone(), u.clone());
                    u
                }
            };
            result.push(NotificationWithUser { notification, user });
        }
        Ok(result)
    }

    // ── Media ─────────────────────────────────────────────────────────

    /// Store a media file. Links are unique across the whole store.
    pub fn create_media(&self, sub_account_id: &str, input: &MediaInput) -> Result<Media> {
        let exists: bool = self
            .conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM media WHERE link = ?1",
                params![input.link],
                |row| row.get(0),
            )
            .context("Failed to check media link")?;
        if exists {
            return Err(HubError::MediaLinkExists {
                link: input.link.clone(),
            }
            .into());
        }

        let id = new_id();
        match self.conn.execute(
            "INSERT INTO media (id, media_type, name, link, sub_account_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![id, input.media_type, input.name, input.link, sub_account_id, now()],
        ) {
            Ok(_) => {}
            Err(e) if is_constraint_violation(&e) && e.to_string().contains("media.link") => {
                return Err(HubError::MediaLinkExists {
                    link: input.link.clone(),
                }
                .into());
            }
            Err(e) => return Err(anyhow::Error::new(e).context("Failed to insert media")),
        }
        self.conn
            .query_row(
                &format!("SELECT {MEDIA_COLUMNS} FROM media WHERE id = ?1"),
                params![id],
                media_from_row,
            )
            .context("Media not found after insert")
    }

    pub fn get_sub_account_media(&self, sub_account_id: &str) -> Result<Option<SubAccountMedia>> {
        let sub_account = match self.get_sub_account(sub_account_id)? {
            Some(s) => s,
            None => return Ok(None),
        };
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {MEDIA_COLUMNS} FROM media WHERE sub_account_id = ?1 ORDER BY created_at"
            ))
            .context("Failed to prepare get_sub_account_media")?;
        let rows = stmt
            .query_map(params![sub_account_id], media_from_row)
            .context("Failed to query media")?;
        let mut media = Vec::new();
        for row in rows {
            media.push(row.context("Failed to read media row")?);
        }
        Ok(Some(SubAccountMedia { sub_account, media }))
    }

    pub fn get_media(&self, id: &str) -> Result<Option<Media>> {
        self.conn
            .query_row(
                &format!("SELECT {MEDIA_COLUMNS} FROM media WHERE id = ?1"),
                params![id],
                media_from_row,
            )
            .optional()
            .context("Failed to query media")
    }

    pub fn delete_media(&self, id: &str) -> Result<bool> {
        let count = self
            .conn
            .execute("DELETE FROM media WHERE id = ?1", params![id])
            .context("Failed to delete media")?;
        Ok(count > 0)
    }

    // ── Pipelines ─────────────────────────────────────────────────────

    pub fn upsert_pipeline(&self, input: &PipelineInput) -> Result<Pipeline> {
        let id = input.id.clone().unwrap_or_else(new_id);
        let ts = now();
        self.conn
            .execute(
                "INSERT INTO pipelines (id, name, sub_account_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)
                 ON CONFLICT(id) DO UPDATE SET name = excluded.name, updated_at = excluded.updated_at",
                params![id, input.name, input.sub_account_id, ts],
            )
            .context("Failed to upsert pipeline")?;
        self.get_pipeline(&id)?
            .context("Pipeline not found after upsert")
    }

    pub fn get_pipeline(&self, id: &str) -> Result<Option<Pipeline>> {
        self.conn
            .query_row(
                &format!("SELECT {PIPELINE_COLUMNS} FROM pipelines WHERE id = ?1"),
                params![id],
                pipeline_from_row,
            )
            .optional()
            .context("Failed to query pipeline")
    }

    pub fn list_pipelines(&self, sub_account_id: &str) -> Result<Vec<Pipeline>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {PIPELINE_COLUMNS} FROM pipelines WHERE sub_account_id = ?1 ORDER BY created_at"
            ))
            .context("Failed to prepare list_pipelines")?;
        let rows = stmt
            .query_map(params![sub_account_id], pipeline_from_row)
            .context("Failed to query pipelines")?;
        let mut pipelines = Vec::new();
        for row in rows {
            pipelines.push(row.context("Failed to read pipeline row")?);
        }
        Ok(pipelines)
    }

    pub fn delete_pipeline(&self, id: &str) -> Result<bool> {
        let count = self
            .conn
            .execute("DELETE FROM pipelines WHERE id = ?1", params![id])
            .context("Failed to delete pipeline")?;
        Ok(count > 0)
    }

    // ── Funnels ───────────────────────────────────────────────────────

    /// Insert or update a funnel by id. `published` and `live_products`
    /// keep their stored values on update when absent. A sub-domain held by
    /// another funnel is a validation error.
    pub fn upsert_funnel(&self, sub_account_id: &str, input: &FunnelInput) -> Result<Funnel> {
        let id = input.id.clone().unwrap_or_else(new_id);
        if let Some(sub_domain) = &input.sub_domain_name {
            let taken: bool = self
                .conn
                .query_row(
                    "SELECT COUNT(*) > 0 FROM funnels WHERE sub_domain_name = ?1 AND id != ?2",
                    params![sub_domain, id],
                    |row| row.get(0),
                )
                .context("Failed to check funnel sub-domain")?;
            if taken {
                return Err(HubError::Validation(format!(
                    "subDomainName: {} is already taken",
                    sub_domain
                ))
                .into());
            }
        }

        self.conn
            .execute(
                "INSERT INTO funnels (id, name, description, published, sub_domain_name, favicon,
                    live_products, sub_account_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, COALESCE(?4, 0), ?5, ?6, COALESCE(?7, '[]'), ?8, ?9, ?9)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    description = excluded.description,
                    published = COALESCE(?4, published),
                    sub_domain_name = excluded.sub_domain_name,
                    favicon = excluded.favicon,
                    live_products = COALESCE(?7, live_products),
                    updated_at = excluded.updated_at",
                params![
                    id,
                    input.name,
                    input.description,
                    input.published,
                    input.sub_domain_name,
                    input.favicon,
                    input.live_products,
                    sub_account_id,
                    now()
                ],
            )
            .context("Failed to upsert funnel")?;
        self.get_funnel(&id)?.context("Funnel not found after upsert")
    }

    pub fn get_funnel(&self, id: &str) -> Result<Option<Funnel>> {
        self.conn
            .query_row(
                &format!("SELECT {FUNNEL_COLUMNS} FROM funnels WHERE id = ?1"),
                params![id],
                funnel_from_row,
            )
            .optional()
            .context("Failed to query funnel")
    }

    pub fn list_funnels(&self, sub_account_id: &str) -> Result<Vec<Funnel>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {FUNNEL_COLUMNS} FROM funnels WHERE sub_account_id = ?1
                 ORDER BY created_at, rowid"
            ))
            .context("Failed to prepare list_funnels")?;
        let rows = stmt
            .query_map(params![sub_account_id], funnel_from_row)
            .context("Failed to query funnels")?;
        let mut funnels = Vec::new();
        for row in rows {
            funnels.push(row.context("Failed to read funnel row")?);
        }
        Ok(funnels)
    }

    // ── Lanes ─────────────────────────────────────────────────────────

    /// Insert or update a lane. A new lane without an explicit order is
    /// appended after the lanes already in the pipeline.
    pub fn upsert_lane(&self, input: &LaneInput) -> Result<Lane> {
        let id = input.id.clone().unwrap_or_else(new_id);
        let ts = now();
        if self.get_lane(&id)?.is_some() {
            self.conn
                .execute(
                    "UPDATE lanes SET name = ?1, sort_order = COALESCE(?2, sort_order), updated_at = ?3
                     WHERE id = ?4",
                    params![input.name, input.order, ts, id],
                )
                .context("Failed to update lane")?;
        } else {
            let order = match input.order {
                Some(order) => order,
                None => self
                    .conn
                    .query_row(
                        "SELECT COUNT(*) FROM lanes WHERE pipeline_id = ?1",
                        params![input.pipeline_id],
                        |row| row.get(0),
                    )
                    .context("Failed to count lanes")?,
            };
            self.conn
                .execute(
                    "INSERT INTO lanes (id, name, pipeline_id, sort_order, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                    params![id, input.name, input.pipeline_id, order, ts],
                )
                .context("Failed to insert lane")?;
        }
        self.get_lane(&id)?.context("Lane not found after upsert")
    }

    pub fn get_lane(&self, id: &str) -> Result<Option<Lane>> {
        self.conn
            .query_row(
                &format!("SELECT {LANE_COLUMNS} FROM lanes WHERE id = ?1"),
                params![id],
                lane_from_row,
            )
            .optional()
            .context("Failed to query lane")
    }

    pub fn list_lanes(&self, pipeline_id: &str) -> Result<Vec<Lane>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {LANE_COLUMNS} FROM lanes WHERE pipeline_id = ?1 ORDER BY sort_order ASC, created_at"
            ))
            .context("Failed to prepare list_lanes")?;
        let rows = stmt
            .query_map(params![pipeline_id], lane_from_row)
            .context("Failed to query lanes")?;
        let mut lanes = Vec::new();
        for row in rows {
            lanes.push(row.context("Failed to read lane row")?);
        }
        Ok(lanes)
    }

    /// Board view: lanes by `order`, each with its tickets by `order`.
    pub fn get_lanes_with_tickets_and_tags(&self, pipeline_id: &str) -> Result<Vec<LaneDetail>> {
        let mut result = Vec::new();
        for lane in self.list_lanes(pipeline_id)? {
            let mut tickets = Vec::new();
            for ticket in self.list_lane_tickets(&lane.id)? {
                tickets.push(self.ticket_detail(ticket)?);
            }
            result.push(LaneDetail { lane, tickets });
        }
        Ok(result)
    }

    pub fn delete_lane(&self, id: &str) -> Result<bool> {
        let count = self
            .conn
            .execute("DELETE FROM lanes WHERE id = ?1", params![id])
            .context("Failed to delete lane")?;
        Ok(count > 0)
    }

    /// Apply a batch of lane orders atomically. An unknown lane id aborts the
    /// whole batch and leaves every lane unchanged.
    pub fn update_lanes_order(&self, lanes: &[LaneOrder]) -> Result<()> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let ts = now();
        for lane in lanes {
            let count = tx
                .execute(
                    "UPDATE lanes SET sort_order = ?1, updated_at = ?2 WHERE id = ?3",
                    params![lane.order, ts, lane.id],
                )
                .context("Failed to update lane order")?;
            if count == 0 {
                return Err(HubError::LaneNotFound {
                    id: lane.id.clone(),
                }
                .into());
            }
        }
        tx.commit().context("Failed to commit lane order")?;
        Ok(())
    }

    // ── Tickets ───────────────────────────────────────────────────────

    /// Insert or update a ticket and replace its tag links. A new ticket
    /// without an explicit order goes to the end of its lane.
    pub fn upsert_ticket(&self, input: &TicketInput) -> Result<Ticket> {
        let id = input.id.clone().unwrap_or_else(new_id);
        let ts = now();
        let exists = self.get_ticket(&id)?.is_some();

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        if exists {
            tx.execute(
                "UPDATE tickets SET name = ?1, lane_id = ?2, sort_order = COALESCE(?3, sort_order),
                    value = ?4, description = ?5, customer_id = ?6, assigned_user_id = ?7, updated_at = ?8
                 WHERE id = ?9",
                params![
                    input.name,
                    input.lane_id,
                    input.order,
                    input.value,
                    input.description,
                    input.customer_id,
                    input.assigned_user_id,
                    ts,
                    id
                ],
            )
            .context("Failed to update ticket")?;
        } else {
            let order: i32 = match input.order {
                Some(order) => order,
                None => tx
                    .query_row(
                        "SELECT COUNT(*) FROM tickets WHERE lane_id = ?1",
                        params![input.lane_id],
                        |row| row.get(0),
                    )
                    .context("Failed to count tickets")?,
            };
            tx.execute(
                "INSERT INTO tickets (id, name, lane_id, sort_order, value, description, customer_id,
                    assigned_user_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
                params![
                    id,
                    input.name,
                    input.lane_id,
                    order,
                    input.value,
                    input.description,
                    input.customer_id,
                    input.assigned_user_id,
                    ts
                ],
            )
            .context("Failed to insert ticket")?;
        }

        tx.execute("DELETE FROM ticket_tags WHERE ticket_id = ?1", params![id])
            .context("Failed to clear ticket tags")?;
        for tag_id in &input.tag_ids {
            tx.execute(
                "INSERT INTO ticket_tags (ticket_id, tag_id) VALUES (?1, ?2)",
                params![id, tag_id],
            )
            .context("Failed to link ticket tag")?;
        }

        tx.commit().context("Failed to commit ticket upsert")?;
        self.get_ticket(&id)?.context("Ticket not found after upsert")
    }

    pub fn get_ticket(&self, id: &str) -> Result<Option<Ticket>> {
        self.conn
            .query_row(
                &format!("SELECT {TICKET_COLUMNS} FROM tickets WHERE id = ?1"),
                params![id],
                ticket_from_row,
            )
            .optional()
            .context("Failed to query ticket")
    }

    fn list_lane_tickets(&self, lane_id: &str) -> Result<Vec<Ticket>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {TICKET_COLUMNS} FROM tickets WHERE lane_id = ?1 ORDER BY sort_order ASC, created_at"
            ))
            .context("Failed to prepare list_lane_tickets")?;
        let rows = stmt
            .query_map(params![lane_id], ticket_from_row)
            .context("Failed to query tickets")?;
        let mut tickets = Vec::new();
        for row in rows {
            tickets.push(row.context("Failed to read ticket row")?);
        }
        Ok(tickets)
    }

    fn ticket_detail(&self, ticket: Ticket) -> Result<TicketDetail> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT t.id, t.name, t.color, t.sub_account_id
                 FROM tags t JOIN ticket_tags tt ON tt.tag_id = t.id
                 WHERE tt.ticket_id = ?1 ORDER BY t.name",
            )
            .context("Failed to prepare ticket tags")?;
        let rows = stmt
            .query_map(params![ticket.id], tag_from_row)
            .context("Failed to query ticket tags")?;
        let mut tags = Vec::new();
        for row in rows {
            tags.push(row.context("Failed to read tag row")?);
        }
        let assigned = match &ticket.assigned_user_id {
            Some(uid) => self.get_user(uid)?,
            None => None,
        };
        let customer = match &ticket.customer_id {
            Some(cid) => self.get_contact(cid)?,
            None => None,
        };
        Ok(TicketDetail {
            ticket,
            tags,
            assigned,
            customer,
        })
    }

    /// Every ticket of a pipeline with tags, assignee, and customer.
    pub fn get_tickets_with_tags(&self, pipeline_id: &str) -> Result<Vec<TicketDetail>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT t.id, t.name, t.lane_id, t.sort_order, t.value, t.description, t.customer_id,
                        t.assigned_user_id, t.created_at, t.updated_at
                 FROM tickets t JOIN lanes l ON l.id = t.lane_id
                 WHERE l.pipeline_id = ?1
                 ORDER BY l.sort_order, t.sort_order",
            )
            .context("Failed to prepare get_tickets_with_tags")?;
        let rows = stmt
            .query_map(params![pipeline_id], ticket_from_row)
            .context("Failed to query pipeline tickets")?;
        let mut tickets = Vec::new();
        for row in rows {
            tickets.push(row.context("Failed to read ticket row")?);
        }
        drop(stmt);
        tickets.into_iter().map(|t| self.ticket_detail(t)).collect()
    }

    pub fn delete_ticket(&self, id: &str) -> Result<bool> {
        let count = self
            .conn
            .execute("DELETE FROM tickets WHERE id = ?1", params![id])
            .context("Failed to delete ticket")?;
        Ok(count > 0)
    }

    /// Apply a batch of ticket moves (order and lane) atomically.
    pub fn update_tickets_order(&self, tickets: &[TicketOrder]) -> Result<()> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let ts = now();
        for ticket in tickets {
            let count = tx
                .execute(
                    "UPDATE tickets SET sort_order = ?1, lane_id = ?2, updated_at = ?3 WHERE id = ?4",
                    params![ticket.order, ticket.lane_id, ts, ticket.id],
                )
                .context("Failed to update ticket order")?;
            if count == 0 {
                return Err(HubError::TicketNotFound {
                    id: ticket.id.clone(),
                }
                .into());
            }
        }
        tx.commit().context("Failed to commit ticket order")?;
        Ok(())
    }

    // ── Tags & contacts ───────────────────────────────────────────────

    pub fn upsert_tag(&self, sub_account_id: &str, input: &TagInput) -> Result<Tag> {
        let id = input.id.clone().unwrap_or_else(new_id);
        self.conn
            .execute(
                "INSERT INTO tags (id, name, color, sub_account_id) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET name = excluded.name, color = excluded.color",
                params![id, input.name, input.color, sub_account_id],
            )
            .context("Failed to upsert tag")?;
        self.conn
            .query_row(
                &format!("SELECT {TAG_COLUMNS} FROM tags WHERE id = ?1"),
                params![id],
                tag_from_row,
            )
            .context("Tag not found after upsert")
    }

    pub fn get_tag(&self, id: &str) -> Result<Option<Tag>> {
        self.conn
            .query_row(
                &format!("SELECT {TAG_COLUMNS} FROM tags WHERE id = ?1"),
                params![id],
                tag_from_row,
            )
            .optional()
            .context("Failed to query tag")
    }

    pub fn list_tags(&self, sub_account_id: &str) -> Result<Vec<Tag>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {TAG_COLUMNS} FROM tags WHERE sub_account_id = ?1 ORDER BY name"
            ))
            .context("Failed to prepare list_tags")?;
        let rows = stmt
            .query_map(params![sub_account_id], tag_from_row)
            .context("Failed to query tags")?;
        let mut tags = Vec::new();
        for row in rows {
            tags.push(row.context("Failed to read tag row")?);
        }
        Ok(tags)
    }

    pub fn delete_tag(&self, id: &str) -> Result<bool> {
        let count = self
            .conn
            .execute("DELETE FROM tags WHERE id = ?1", params![id])
            .context("Failed to delete tag")?;
        Ok(count > 0)
    }

    pub fn create_contact(&self, sub_account_id: &str, input: &ContactInput) -> Result<Contact> {
        let id = new_id();
        self.conn
            .execute(
                "INSERT INTO contacts (id, name, email, sub_account_id, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id, input.name, input.email, sub_account_id, now()],
            )
            .context("Failed to insert contact")?;
        self.get_contact(&id)?.context("Contact not found after insert")
    }

    pub fn get_contact(&self, id: &str) -> Result<Option<Contact>> {
        self.conn
            .query_row(
                &format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE id = ?1"),
                params![id],
                contact_from_row,
            )
            .optional()
            .context("Failed to query contact")
    }

    pub fn list_contacts(&self, sub_account_id: &str) -> Result<Vec<Contact>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {CONTACT_COLUMNS} FROM contacts WHERE sub_account_id = ?1 ORDER BY created_at"
            ))
            .context("Failed to prepare list_contacts")?;
        let rows = stmt
            .query_map(params![sub_account_id], contact_from_row)
            .context("Failed to query contacts")?;
        let mut contacts = Vec::new();
        for row in rows {
            contacts.push(row.context("Failed to read contact row")?);
        }
        Ok(contacts)
    }
}
