//! Team invitations: sending and accepting.
//!
//! Acceptance runs as a sequence of independent writes. A provider failure
//! after the user row exists leaves the invitation in place for a retry.

use super::activity::{ActivityLog, save_activity_log};
use super::db::{DbHandle, NewUser};
use super::identity::{IdentityProvider, Principal};
use super::models::{Invitation, Role};
use super::validation::validate_invitation;
use crate::errors::HubError;

/// Store a PENDING invitation, then have the provider email it.
pub async fn send_invitation(
    db: &DbHandle,
    provider: &dyn IdentityProvider,
    redirect_url: &str,
    role: Role,
    email: &str,
    agency_id: &str,
) -> Result<Invitation, HubError> {
    validate_invitation(email, role)?;

    let (email_owned, agency_owned) = (email.to_string(), agency_id.to_string());
    let invitation = db
        .call(move |db| {
            if db.get_agency(&agency_owned)?.is_none() {
                return Err(HubError::AgencyNotFound { id: agency_owned }.into());
            }
            if db.get_user_by_email(&email_owned)?.is_some() {
                return Err(
                    HubError::Validation(format!("email: {} already has an account", email_owned))
                        .into(),
                );
            }
            if db.get_pending_invitation(&email_owned)?.is_some() {
                return Err(HubError::Validation(format!(
                    "email: {} already has a pending invitation",
                    email_owned
                ))
                .into());
            }
            db.create_invitation(&email_owned, &agency_owned, role)
        })
        .await
        .map_err(HubError::from_db)?;

    provider
        .create_invitation(email, role, redirect_url)
        .await
        .map_err(|e| HubError::IdentityProvider(format!("{:#}", e)))?;
    tracing::info!(email, agency_id, role = %role, "Invitation sent");
    Ok(invitation)
}

/// Accept the principal's pending invitation, if any.
///
/// Returns the agency id the principal now belongs to: the invitation's
/// agency after a successful acceptance, otherwise the existing user's
/// agency. `None` means the principal has no agency yet.
pub async fn verify_and_accept_invitation(
    db: &DbHandle,
    provider: &dyn IdentityProvider,
    principal: &Principal,
) -> Result<Option<String>, HubError> {
    let email = principal.email.clone();
    let pending = db
        .call(move |db| db.get_pending_invitation(&email))
        .await
        .map_err(HubError::from_db)?;

    let Some(invitation) = pending else {
        let email = principal.email.clone();
        let existing = db
            .call(move |db| db.get_user_by_email(&email))
            .await
            .map_err(HubError::from_db)?;
        return Ok(existing.and_then(|u| u.agency_id));
    };

    let new_user = NewUser {
        agency_id: Some(invitation.agency_id.clone()),
        ..principal.new_user(invitation.role)
    };
    let created = db
        .call(move |db| db.create_team_user(&new_user))
        .await
        .map_err(HubError::from_db)?;
    let Some(user) = created else {
        tracing::warn!(email = %principal.email, "Invitation with owner role cannot be accepted");
        return Ok(None);
    };

    save_activity_log(
        db,
        Some(principal),
        ActivityLog::agency(&invitation.agency_id, "Joined"),
    )
    .await?;

    provider
        .update_role_metadata(&user.id, Some(user.role))
        .await
        .map_err(|e| HubError::IdentityProvider(format!("{:#}", e)))?;

    let email = invitation.email.clone();
    db.call(move |db| db.delete_invitation(&email))
        .await
        .map_err(HubError::from_db)?;

    tracing::info!(email = %user.email, agency_id = %invitation.agency_id, "Invitation accepted");
    Ok(Some(invitation.agency_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::db::HubDb;
    use crate::hub::db::tests::seeded;
    use crate::hub::identity::{IdentityCall, LocalIdentityProvider};

    fn invitee() -> Principal {
        Principal {
            id: "user_new".into(),
            email: "new@acme.test".into(),
            first_name: "Nia".into(),
            last_name: "New".into(),
            image_url: String::new(),
        }
    }

    #[tokio::test]
    async fn test_send_invitation_records_row_and_provider_call() -> anyhow::Result<()> {
        let db = HubDb::new_in_memory()?;
        let (agency, _, _) = seeded(&db)?;
        let handle = DbHandle::new(db);
        let provider = LocalIdentityProvider::recording();

        let invitation = send_invitation(
            &handle,
            &provider,
            "http://app/sign-up",
            Role::AgencyAdmin,
            "new@acme.test",
            &agency.id,
        )
        .await?;
        assert_eq!(invitation.role, Role::AgencyAdmin);
        assert_eq!(
            provider.calls(),
            vec![IdentityCall::Invitation {
                email: "new@acme.test".into(),
                role: Role::AgencyAdmin,
                redirect_url: "http://app/sign-up".into()
            }]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_send_invitation_rejects_duplicates() -> anyhow::Result<()> {
        let db = HubDb::new_in_memory()?;
        let (agency, owner, _) = seeded(&db)?;
        db.create_invitation("new@acme.test", &agency.id, Role::SubaccountUser)?;
        let handle = DbHandle::new(db);
        let provider = LocalIdentityProvider::recording();

        for email in ["new@acme.test", owner.email.as_str()] {
            let result = send_invitation(
                &handle,
                &provider,
                "http://app/sign-up",
                Role::SubaccountUser,
                email,
                &agency.id,
            )
            .await;
            assert!(matches!(result, Err(HubError::Validation(_))));
        }
        assert!(provider.calls().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_send_invitation_provider_failure_keeps_row() -> anyhow::Result<()> {
        let db = HubDb::new_in_memory()?;
        let (agency, _, _) = seeded(&db)?;
        let handle = DbHandle::new(db);
        let provider = LocalIdentityProvider::recording();
        provider.set_failing(true);

        let result = send_invitation(
            &handle,
            &provider,
            "http://app/sign-up",
            Role::SubaccountUser,
            "new@acme.test",
            &agency.id,
        )
        .await;
        assert!(matches!(result, Err(HubError::IdentityProvider(_))));
        let pending = handle
            .call(|db| db.get_pending_invitation("new@acme.test"))
            .await?;
        assert!(pending.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_accept_invitation_is_idempotent() -> anyhow::Result<()> {
        let db = HubDb::new_in_memory()?;
        let (agency, _, _) = seeded(&db)?;
        db.create_invitation("new@acme.test", &agency.id, Role::SubaccountUser)?;
        let handle = DbHandle::new(db);
        let provider = LocalIdentityProvider::recording();

        let first = verify_and_accept_invitation(&handle, &provider, &invitee()).await?;
        assert_eq!(first.as_deref(), Some(agency.id.as_str()));

        let second = verify_and_accept_invitation(&handle, &provider, &invitee()).await?;
        assert_eq!(second, first);

        let agency_id = agency.id.clone();
        let (team, notifications) = handle
            .call(move |db| {
                Ok((
                    db.list_team(&agency_id)?,
                    db.list_notifications_with_user(&agency_id)?,
                ))
            })
            .await?;
        assert_eq!(team.len(), 2);
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].notification.notification, "Nia New | Joined");
        assert_eq!(provider.calls().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_accept_without_invitation_or_user() -> anyhow::Result<()> {
        let handle = DbHandle::new(HubDb::new_in_memory()?);
        let provider = LocalIdentityProvider::recording();
        assert_eq!(
            verify_and_accept_invitation(&handle, &provider, &invitee()).await?,
            None
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_provider_failure_leaves_invitation_pending() -> anyhow::Result<()> {
        let db = HubDb::new_in_memory()?;
        let (agency, _, _) = seeded(&db)?;
        db.create_invitation("new@acme.test", &agency.id, Role::SubaccountGuest)?;
        let handle = DbHandle::new(db);
        let provider = LocalIdentityProvider::recording();
        provider.set_failing(true);

        let result = verify_and_accept_invitation(&handle, &provider, &invitee()).await;
        assert!(matches!(result, Err(HubError::IdentityProvider(_))));

        let (user, pending) = handle
            .call(|db| {
                Ok((
                    db.get_user_by_email("new@acme.test")?,
                    db.get_pending_invitation("new@acme.test")?,
                ))
            })
            .await?;
        assert!(user.is_some());
        assert!(pending.is_some());
        Ok(())
    }
}
