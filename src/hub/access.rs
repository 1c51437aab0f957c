//! Access control for agency and sub-account resources.
//!
//! Agency-level roles reach every sub-account of their own agency.
//! Sub-account roles need an explicit Permission row with `access = true`.

use anyhow::Result;

use super::db::{DbHandle, HubDb};
use super::identity::Principal;
use super::models::{SubAccount, User};
use crate::errors::HubError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessDecision {
    Granted,
    Denied(String),
}

impl AccessDecision {
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted)
    }
}

/// Decide whether `user` may view or mutate `sub_account`.
pub fn check_sub_account_access(
    db: &HubDb,
    user: &User,
    sub_account: &SubAccount,
) -> Result<AccessDecision> {
    if user.role.is_agency_level() {
        return Ok(
            if user.agency_id.as_deref() == Some(sub_account.agency_id.as_str()) {
                AccessDecision::Granted
            } else {
                AccessDecision::Denied(format!(
                    "{} does not belong to the agency of sub-account {}",
                    user.email, sub_account.id
                ))
            },
        );
    }

    if db.has_sub_account_access(&user.email, &sub_account.id)? {
        Ok(AccessDecision::Granted)
    } else {
        Ok(AccessDecision::Denied(format!(
            "{} has no access to sub-account {}",
            user.email, sub_account.id
        )))
    }
}

/// Agency settings, team, and billing are reserved for the agency's own
/// owner and admins.
pub fn check_agency_access(user: &User, agency_id: &str) -> AccessDecision {
    if user.role.is_agency_level() && user.agency_id.as_deref() == Some(agency_id) {
        AccessDecision::Granted
    } else {
        AccessDecision::Denied(format!("{} is not an admin of agency {}", user.email, agency_id))
    }
}

/// A resource whose owning sub-account decides access.
#[derive(Debug, Clone)]
pub enum Scope {
    SubAccount(String),
    Pipeline(String),
    Lane(String),
    Ticket(String),
    Media(String),
}

/// Owning sub-account id of a scoped resource.
pub fn resolve_sub_account_id(db: &HubDb, scope: &Scope) -> Result<String> {
    let id = match scope {
        Scope::SubAccount(id) => id.clone(),
        Scope::Pipeline(id) => {
            db.get_pipeline(id)?
                .ok_or_else(|| HubError::PipelineNotFound { id: id.clone() })?
                .sub_account_id
        }
        Scope::Lane(id) => {
            let lane = db
                .get_lane(id)?
                .ok_or_else(|| HubError::LaneNotFound { id: id.clone() })?;
            return resolve_sub_account_id(db, &Scope::Pipeline(lane.pipeline_id));
        }
        Scope::Ticket(id) => {
            let ticket = db
                .get_ticket(id)?
                .ok_or_else(|| HubError::TicketNotFound { id: id.clone() })?;
            return resolve_sub_account_id(db, &Scope::Lane(ticket.lane_id));
        }
        Scope::Media(id) => {
            db.get_media(id)?
                .ok_or_else(|| HubError::MediaNotFound { id: id.clone() })?
                .sub_account_id
        }
    };
    Ok(id)
}

/// Signed-in user row for the principal, or `Unauthorized` when the
/// principal has never been onboarded.
pub async fn resolve_user(db: &DbHandle, principal: &Principal) -> Result<User, HubError> {
    let email = principal.email.clone();
    db.call(move |db| db.get_user_by_email(&email))
        .await
        .map_err(HubError::from_db)?
        .ok_or_else(|| HubError::Unauthorized(format!("No user record for {}", principal.email)))
}

/// Resolve the principal's user and the sub-account owning `scope`, and
/// check access. Denied access becomes `HubError::Unauthorized`.
pub async fn authorize(
    db: &DbHandle,
    principal: &Principal,
    scope: Scope,
) -> Result<(User, SubAccount), HubError> {
    let email = principal.email.clone();
    let (user, sub_account, decision) = db
        .call(move |db| {
            let user = db
                .get_user_by_email(&email)?
                .ok_or_else(|| HubError::Unauthorized(format!("No user record for {}", email)))?;
            let sub_account_id = resolve_sub_account_id(db, &scope)?;
            let sub_account = db
                .get_sub_account(&sub_account_id)?
                .ok_or(HubError::SubAccountNotFound { id: sub_account_id })?;
            let decision = check_sub_account_access(db, &user, &sub_account)?;
            Ok((user, sub_account, decision))
        })
        .await
        .map_err(HubError::from_db)?;

    match decision {
        AccessDecision::Granted => Ok((user, sub_account)),
        AccessDecision::Denied(reason) => {
            tracing::warn!(user = %user.email, sub_account = %sub_account.id, "Access denied");
            Err(HubError::Unauthorized(reason))
        }
    }
}

pub async fn authorize_sub_account(
    db: &DbHandle,
    principal: &Principal,
    sub_account_id: &str,
) -> Result<User, HubError> {
    authorize(db, principal, Scope::SubAccount(sub_account_id.to_string()))
        .await
        .map(|(user, _)| user)
}

/// Resolve the principal's user and require agency-level access.
pub async fn authorize_agency(
    db: &DbHandle,
    principal: &Principal,
    agency_id: &str,
) -> Result<User, HubError> {
    let user = resolve_user(db, principal).await?;
    match check_agency_access(&user, agency_id) {
        AccessDecision::Granted => Ok(user),
        AccessDecision::Denied(reason) => {
            tracing::warn!(user = %user.email, agency = %agency_id, "Access denied");
            Err(HubError::Unauthorized(reason))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::db::tests::seeded;
    use crate::hub::db::NewUser;
    use crate::hub::models::{LaneInput, Role};

    fn member(db: &HubDb, email: &str, role: Role, agency_id: &str) -> Result<User> {
        Ok(db
            .create_team_user(&NewUser {
                id: format!("user_{}", email),
                name: "Member".into(),
                avatar_url: String::new(),
                email: email.into(),
                role,
                agency_id: Some(agency_id.into()),
            })?
            .expect("member created"))
    }

    fn principal(email: &str) -> Principal {
        Principal {
            id: format!("user_{}", email),
            email: email.into(),
            first_name: "Test".into(),
            last_name: "User".into(),
            image_url: String::new(),
        }
    }

    #[test]
    fn test_agency_roles_pass_for_own_agency() -> Result<()> {
        let db = HubDb::new_in_memory()?;
        let (agency, owner, sub) = seeded(&db)?;
        let admin = member(&db, "admin@acme.test", Role::AgencyAdmin, &agency.id)?;
        assert!(check_sub_account_access(&db, &owner, &sub)?.is_granted());
        assert!(check_sub_account_access(&db, &admin, &sub)?.is_granted());
        Ok(())
    }

    #[test]
    fn test_agency_role_denied_for_other_agency() -> Result<()> {
        let db = HubDb::new_in_memory()?;
        let (_, _, sub) = seeded(&db)?;
        let mut outsider = db.upsert_user(
            &NewUser {
                id: "user_out".into(),
                name: "Out".into(),
                avatar_url: String::new(),
                email: "out@other.test".into(),
                role: Role::AgencyOwner,
                agency_id: None,
            },
            None,
        )?;
        outsider.agency_id = Some("other-agency".into());
        assert!(!check_sub_account_access(&db, &outsider, &sub)?.is_granted());
        Ok(())
    }

    #[test]
    fn test_sub_account_roles_require_permission_row() -> Result<()> {
        let db = HubDb::new_in_memory()?;
        let (agency, _, sub) = seeded(&db)?;
        for (email, role) in [
            ("user@acme.test", Role::SubaccountUser),
            ("guest@acme.test", Role::SubaccountGuest),
        ] {
            let user = member(&db, email, role, &agency.id)?;
            assert_eq!(
                check_sub_account_access(&db, &user, &sub)?,
                AccessDecision::Denied(format!("{} has no access to sub-account {}", email, sub.id))
            );

            db.change_user_permission(None, email, &sub.id, false)?;
            assert!(!check_sub_account_access(&db, &user, &sub)?.is_granted());

            db.change_user_permission(None, email, &sub.id, true)?;
            assert!(check_sub_account_access(&db, &user, &sub)?.is_granted());
        }
        Ok(())
    }

    #[test]
    fn test_agency_access_excludes_sub_account_roles() -> Result<()> {
        let db = HubDb::new_in_memory()?;
        let (agency, owner, _) = seeded(&db)?;
        let user = member(&db, "user@acme.test", Role::SubaccountUser, &agency.id)?;
        assert!(check_agency_access(&owner, &agency.id).is_granted());
        assert!(!check_agency_access(&owner, "another").is_granted());
        assert!(!check_agency_access(&user, &agency.id).is_granted());
        Ok(())
    }

    #[tokio::test]
    async fn test_authorize_resolves_nested_scope() -> Result<()> {
        let db = HubDb::new_in_memory()?;
        let (agency, _, sub) = seeded(&db)?;
        member(&db, "user@acme.test", Role::SubaccountUser, &agency.id)?;
        let pipeline = db.list_pipelines(&sub.id)?.remove(0);
        let lane = db.upsert_lane(&LaneInput {
            name: "New".into(),
            pipeline_id: pipeline.id.clone(),
            ..Default::default()
        })?;
        let handle = DbHandle::new(db);

        let owner = principal("owner@acme.test");
        let (_, resolved) = authorize(&handle, &owner, Scope::Lane(lane.id.clone())).await?;
        assert_eq!(resolved.id, sub.id);

        let user = principal("user@acme.test");
        let denied = authorize(&handle, &user, Scope::Pipeline(pipeline.id.clone())).await;
        assert!(matches!(denied, Err(HubError::Unauthorized(_))));

        let missing = authorize(&handle, &owner, Scope::Lane("nope".into())).await;
        assert!(matches!(missing, Err(HubError::LaneNotFound { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_principal_is_unauthorized() -> Result<()> {
        let db = HubDb::new_in_memory()?;
        let (agency, _, sub) = seeded(&db)?;
        let handle = DbHandle::new(db);
        let stranger = principal("stranger@else.test");
        assert!(matches!(
            authorize_sub_account(&handle, &stranger, &sub.id).await,
            Err(HubError::Unauthorized(_))
        ));
        assert!(matches!(
            authorize_agency(&handle, &stranger, &agency.id).await,
            Err(HubError::Unauthorized(_))
        ));
        Ok(())
    }
}
