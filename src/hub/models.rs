use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    AgencyOwner,
    AgencyAdmin,
    SubaccountUser,
    SubaccountGuest,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AgencyOwner => "AGENCY_OWNER",
            Self::AgencyAdmin => "AGENCY_ADMIN",
            Self::SubaccountUser => "SUBACCOUNT_USER",
            Self::SubaccountGuest => "SUBACCOUNT_GUEST",
        }
    }

    /// Agency-level roles see every sub-account of their own agency.
    pub fn is_agency_level(&self) -> bool {
        matches!(self, Self::AgencyOwner | Self::AgencyAdmin)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AGENCY_OWNER" => Ok(Self::AgencyOwner),
            "AGENCY_ADMIN" => Ok(Self::AgencyAdmin),
            "SUBACCOUNT_USER" => Ok(Self::SubaccountUser),
            "SUBACCOUNT_GUEST" => Ok(Self::SubaccountGuest),
            _ => Err(format!("Invalid role: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvitationStatus {
    Accepted,
    Revoked,
    Pending,
}

impl InvitationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accepted => "ACCEPTED",
            Self::Revoked => "REVOKED",
            Self::Pending => "PENDING",
        }
    }
}

impl FromStr for InvitationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACCEPTED" => Ok(Self::Accepted),
            "REVOKED" => Ok(Self::Revoked),
            "PENDING" => Ok(Self::Pending),
            _ => Err(format!("Invalid invitation status: {}", s)),
        }
    }
}

// ── Tenants ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Agency {
    pub id: String,
    pub name: String,
    pub agency_logo: String,
    pub company_email: String,
    pub company_phone: String,
    pub white_label: bool,
    pub address: String,
    pub city: String,
    pub zip_code: String,
    pub state: String,
    pub country: String,
    pub goal: i64,
    pub connect_account_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubAccount {
    pub id: String,
    pub agency_id: String,
    pub name: String,
    pub sub_account_logo: String,
    pub company_email: String,
    pub company_phone: String,
    pub goal: i64,
    pub address: String,
    pub city: String,
    pub zip_code: String,
    pub state: String,
    pub country: String,
    pub connect_account_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub name: String,
    pub avatar_url: String,
    pub email: String,
    pub role: Role,
    pub agency_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Permission {
    pub id: String,
    pub email: String,
    pub sub_account_id: String,
    pub access: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SidebarOption {
    pub id: String,
    pub name: String,
    pub link: String,
    pub icon: String,
    pub agency_id: Option<String>,
    pub sub_account_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Invitation {
    pub id: String,
    pub email: String,
    pub agency_id: String,
    pub status: InvitationStatus,
    pub role: Role,
}

/// Immutable audit entry. `notification` holds `"<user name> | <description>"`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    pub notification: String,
    pub agency_id: String,
    pub sub_account_id: Option<String>,
    pub user_id: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Media {
    pub id: String,
    #[serde(rename = "type")]
    pub media_type: Option<String>,
    pub name: String,
    pub link: String,
    pub sub_account_id: String,
    pub created_at: String,
}

// ── Pipelines ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Pipeline {
    pub id: String,
    pub name: String,
    pub sub_account_id: String,
    pub created_at: String,
    pub updated_at: String,
}

/// Published site of a sub-account. `live_products` is a JSON array kept
/// as text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Funnel {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub published: bool,
    pub sub_domain_name: Option<String>,
    pub favicon: Option<String>,
    pub live_products: String,
    pub sub_account_id: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Lane {
    pub id: String,
    pub name: String,
    pub pipeline_id: String,
    pub order: i32,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Ticket {
    pub id: String,
    pub name: String,
    pub lane_id: String,
    pub order: i32,
    pub value: Option<f64>,
    pub description: Option<String>,
    pub customer_id: Option<String>,
    pub assigned_user_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Tag {
    pub id: String,
    pub name: String,
    pub color: String,
    pub sub_account_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub id: String,
    pub name: String,
    pub email: String,
    pub sub_account_id: String,
    pub created_at: String,
}

// ── API view types ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubAccountWithSidebar {
    #[serde(flatten)]
    pub sub_account: SubAccount,
    pub sidebar_options: Vec<SidebarOption>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgencyWithSidebar {
    #[serde(flatten)]
    pub agency: Agency,
    pub sidebar_options: Vec<SidebarOption>,
    pub sub_accounts: Vec<SubAccountWithSidebar>,
}

/// Everything the shell of the application needs about the signed-in user.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthUserDetails {
    #[serde(flatten)]
    pub user: User,
    pub agency: Option<AgencyWithSidebar>,
    pub permissions: Vec<Permission>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationWithUser {
    #[serde(flatten)]
    pub notification: Notification,
    pub user: User,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionWithSubAccount {
    #[serde(flatten)]
    pub permission: Permission,
    pub sub_account: SubAccount,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketDetail {
    #[serde(flatten)]
    pub ticket: Ticket,
    pub tags: Vec<Tag>,
    pub assigned: Option<User>,
    pub customer: Option<Contact>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaneDetail {
    #[serde(flatten)]
    pub lane: Lane,
    pub tickets: Vec<TicketDetail>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubAccountMedia {
    #[serde(flatten)]
    pub sub_account: SubAccount,
    pub media: Vec<Media>,
}

// ── Input types ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgencyInput {
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub agency_logo: String,
    pub company_email: String,
    #[serde(default)]
    pub company_phone: String,
    #[serde(default)]
    pub white_label: bool,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub zip_code: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub country: String,
    pub goal: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubAccountInput {
    pub id: Option<String>,
    #[serde(default)]
    pub agency_id: String,
    pub name: String,
    #[serde(default)]
    pub sub_account_logo: String,
    pub company_email: String,
    #[serde(default)]
    pub company_phone: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub zip_code: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub country: String,
    pub goal: Option<i64>,
}

/// Partial user update keyed by email. Absent fields are left unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserUpdate {
    pub email: String,
    pub name: Option<String>,
    pub avatar_url: Option<String>,
    pub role: Option<Role>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineInput {
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub sub_account_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaneInput {
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub pipeline_id: String,
    pub order: Option<i32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketInput {
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub lane_id: String,
    pub order: Option<i32>,
    pub value: Option<f64>,
    pub description: Option<String>,
    pub customer_id: Option<String>,
    pub assigned_user_id: Option<String>,
    #[serde(default)]
    pub tag_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagInput {
    pub id: Option<String>,
    pub name: String,
    pub color: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunnelInput {
    pub id: Option<String>,
    pub name: String,
    pub description: Option<String>,
    pub sub_domain_name: Option<String>,
    pub favicon: Option<String>,
    pub published: Option<bool>,
    pub live_products: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactInput {
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaInput {
    #[serde(rename = "type")]
    pub media_type: Option<String>,
    pub name: String,
    pub link: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LaneOrder {
    pub id: String,
    pub order: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TicketOrder {
    pub id: String,
    pub order: i32,
    pub lane_id: String,
}
