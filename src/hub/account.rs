//! Account operations for the signed-in principal.
//!
//! Every write that changes a role is mirrored into the identity provider's
//! metadata so the provider session carries the same role as the database.

use super::db::DbHandle;
use super::identity::{IdentityProvider, Principal};
use super::models::{AuthUserDetails, Role, User, UserUpdate};
use crate::errors::HubError;

/// The principal's user row with its agency (sidebar and sub-accounts
/// included) and its permissions. `None` before onboarding.
pub async fn get_auth_user_details(
    db: &DbHandle,
    principal: &Principal,
) -> Result<Option<AuthUserDetails>, HubError> {
    let email = principal.email.clone();
    db.call(move |db| {
        let Some(user) = db.get_user_by_email(&email)? else {
            return Ok(None);
        };
        let agency = match &user.agency_id {
            Some(agency_id) => db.get_agency_with_sidebar(agency_id)?,
            None => None,
        };
        let permissions = db.list_permissions_for_email(&user.email)?;
        Ok(Some(AuthUserDetails {
            user,
            agency,
            permissions,
        }))
    })
    .await
    .map_err(HubError::from_db)
}

/// Create or refresh the principal's user row and push the stored role into
/// the provider metadata. New users default to SUBACCOUNT_USER.
pub async fn init_user(
    db: &DbHandle,
    provider: &dyn IdentityProvider,
    principal: &Principal,
    role: Option<Role>,
) -> Result<User, HubError> {
    let new_user = principal.new_user(Role::SubaccountUser);
    let user = db
        .call(move |db| db.upsert_user(&new_user, role))
        .await
        .map_err(HubError::from_db)?;

    provider
        .update_role_metadata(&user.id, Some(user.role))
        .await
        .map_err(|e| HubError::IdentityProvider(format!("{:#}", e)))?;
    tracing::info!(user = %user.email, role = %user.role, "User initialised");
    Ok(user)
}

pub async fn update_user(
    db: &DbHandle,
    provider: &dyn IdentityProvider,
    update: UserUpdate,
) -> Result<User, HubError> {
    let user = db
        .call(move |db| db.update_user(&update))
        .await
        .map_err(HubError::from_db)?;

    provider
        .update_role_metadata(&user.id, Some(user.role))
        .await
        .map_err(|e| HubError::IdentityProvider(format!("{:#}", e)))?;
    tracing::info!(user = %user.email, "User updated");
    Ok(user)
}

/// Clear the provider role first, then delete the row.
pub async fn delete_user(
    db: &DbHandle,
    provider: &dyn IdentityProvider,
    user_id: &str,
) -> Result<User, HubError> {
    provider
        .update_role_metadata(user_id, None)
        .await
        .map_err(|e| HubError::IdentityProvider(format!("{:#}", e)))?;

    let id = user_id.to_string();
    let deleted = db
        .call(move |db| db.delete_user(&id))
        .await
        .map_err(HubError::from_db)?
        .ok_or_else(|| HubError::UserNotFound {
            id: user_id.to_string(),
        })?;
    tracing::info!(user = %deleted.email, "User deleted");
    Ok(deleted)
}

/// First sub-account the principal was granted access to, for the landing
/// redirect of sub-account roles.
pub async fn first_accessible_sub_account(
    db: &DbHandle,
    principal: &Principal,
) -> Result<Option<String>, HubError> {
    let email = principal.email.clone();
    let permissions = db
        .call(move |db| db.list_permissions_for_email(&email))
        .await
        .map_err(HubError::from_db)?;
    Ok(permissions
        .into_iter()
        .find(|p| p.access)
        .map(|p| p.sub_account_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::db::HubDb;
    use crate::hub::db::tests::seeded;
    use crate::hub::identity::{IdentityCall, LocalIdentityProvider};

    fn principal(email: &str) -> Principal {
        Principal {
            id: format!("user_{}", email),
            email: email.into(),
            first_name: "Bo".into(),
            last_name: "Berg".into(),
            image_url: "https://img.test/bo.png".into(),
        }
    }

    #[tokio::test]
    async fn test_init_user_defaults_role_and_syncs_metadata() -> anyhow::Result<()> {
        let handle = DbHandle::new(HubDb::new_in_memory()?);
        let provider = LocalIdentityProvider::recording();
        let p = principal("bo@acme.test");

        let user = init_user(&handle, &provider, &p, None).await?;
        assert_eq!(user.role, Role::SubaccountUser);
        assert_eq!(user.name, "Bo Berg");
        assert_eq!(
            provider.calls(),
            vec![IdentityCall::RoleMetadata {
                user_id: p.id.clone(),
                role: Some(Role::SubaccountUser)
            }]
        );

        let promoted = init_user(&handle, &provider, &p, Some(Role::AgencyOwner)).await?;
        assert_eq!(promoted.role, Role::AgencyOwner);
        assert_eq!(promoted.id, user.id);
        Ok(())
    }

    #[tokio::test]
    async fn test_auth_user_details_include_agency_and_permissions() -> anyhow::Result<()> {
        let db = HubDb::new_in_memory()?;
        let (agency, owner, sub) = seeded(&db)?;
        let handle = DbHandle::new(db);

        let details = get_auth_user_details(&handle, &principal(&owner.email))
            .await?
            .expect("details");
        let view = details.agency.expect("agency");
        assert_eq!(view.agency.id, agency.id);
        assert_eq!(view.sub_accounts.len(), 1);
        assert_eq!(details.permissions.len(), 1);
        assert_eq!(details.permissions[0].sub_account_id, sub.id);

        assert!(
            get_auth_user_details(&handle, &principal("new@acme.test"))
                .await?
                .is_none()
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_update_user_pushes_stored_role() -> anyhow::Result<()> {
        let db = HubDb::new_in_memory()?;
        let (_, owner, _) = seeded(&db)?;
        let handle = DbHandle::new(db);
        let provider = LocalIdentityProvider::recording();

        let user = update_user(
            &handle,
            &provider,
            UserUpdate {
                email: owner.email.clone(),
                name: Some("Olivia O.".into()),
                ..Default::default()
            },
        )
        .await?;
        assert_eq!(user.name, "Olivia O.");
        assert_eq!(user.role, Role::AgencyOwner);
        assert_eq!(
            provider.calls(),
            vec![IdentityCall::RoleMetadata {
                user_id: owner.id.clone(),
                role: Some(Role::AgencyOwner)
            }]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_update_unknown_user_is_not_found() -> anyhow::Result<()> {
        let handle = DbHandle::new(HubDb::new_in_memory()?);
        let provider = LocalIdentityProvider::recording();
        let result = update_user(
            &handle,
            &provider,
            UserUpdate {
                email: "ghost@acme.test".into(),
                ..Default::default()
            },
        )
        .await;
        assert!(matches!(result, Err(HubError::UserNotFound { .. })));
        assert!(provider.calls().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_user_clears_metadata_first() -> anyhow::Result<()> {
        let db = HubDb::new_in_memory()?;
        db.upsert_user(&principal("bo@acme.test").new_user(Role::SubaccountUser), None)?;
        let handle = DbHandle::new(db);
        let provider = LocalIdentityProvider::recording();

        provider.set_failing(true);
        let failed = delete_user(&handle, &provider, "user_bo@acme.test").await;
        assert!(matches!(failed, Err(HubError::IdentityProvider(_))));

        provider.set_failing(false);
        let deleted = delete_user(&handle, &provider, "user_bo@acme.test").await?;
        assert_eq!(deleted.email, "bo@acme.test");
        assert!(matches!(
            delete_user(&handle, &provider, "user_bo@acme.test").await,
            Err(HubError::UserNotFound { .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_first_accessible_sub_account() -> anyhow::Result<()> {
        let db = HubDb::new_in_memory()?;
        let (_, owner, sub) = seeded(&db)?;
        db.upsert_user(&principal("bo@acme.test").new_user(Role::SubaccountUser), None)?;
        let handle = DbHandle::new(db);

        assert_eq!(
            first_accessible_sub_account(&handle, &principal(&owner.email)).await?,
            Some(sub.id.clone())
        );
        assert_eq!(
            first_accessible_sub_account(&handle, &principal("bo@acme.test")).await?,
            None
        );
        Ok(())
    }
}
