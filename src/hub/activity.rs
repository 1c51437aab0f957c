//! Activity log: append-only notifications attributed to a user.

use super::db::DbHandle;
use super::identity::Principal;
use super::models::{Notification, NotificationWithUser, Role};
use crate::errors::HubError;

#[derive(Debug, Clone, Default)]
pub struct ActivityLog {
    pub agency_id: Option<String>,
    pub description: String,
    pub sub_account_id: Option<String>,
}

impl ActivityLog {
    pub fn agency(agency_id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            agency_id: Some(agency_id.into()),
            description: description.into(),
            sub_account_id: None,
        }
    }

    pub fn sub_account(sub_account_id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            agency_id: None,
            description: description.into(),
            sub_account_id: Some(sub_account_id.into()),
        }
    }
}

/// Append an activity entry.
///
/// The acting user is the principal's user row, or without a principal any
/// member of the agency owning `sub_account_id`. A missing `agency_id` is
/// taken from the sub-account. When either cannot be resolved the entry is
/// dropped with a warning and `Ok(None)` is returned.
pub async fn save_activity_log(
    db: &DbHandle,
    principal: Option<&Principal>,
    log: ActivityLog,
) -> Result<Option<Notification>, HubError> {
    let email = principal.map(|p| p.email.clone());
    db.call(move |db| {
        let user = match (&email, &log.sub_account_id) {
            (Some(email), _) => db.get_user_by_email(email)?,
            (None, Some(sub_account_id)) => db.find_user_for_sub_account_agency(sub_account_id)?,
            (None, None) => None,
        };
        let Some(user) = user else {
            tracing::warn!(
                description = %log.description,
                "Could not find a user to attribute activity to; dropping entry"
            );
            return Ok(None);
        };

        let agency_id = match (&log.agency_id, &log.sub_account_id) {
            (Some(agency_id), _) => Some(agency_id.clone()),
            (None, Some(sub_account_id)) => {
                db.get_sub_account(sub_account_id)?.map(|s| s.agency_id)
            }
            (None, None) => None,
        };
        let Some(agency_id) = agency_id else {
            tracing::warn!(
                description = %log.description,
                "Activity entry has no resolvable agency; dropping entry"
            );
            return Ok(None);
        };

        let text = format!("{} | {}", user.name, log.description);
        let notification =
            db.create_notification(&text, &agency_id, log.sub_account_id.as_deref(), &user.id)?;
        tracing::debug!(agency_id = %agency_id, notification = %text, "Activity logged");
        Ok(Some(notification))
    })
    .await
    .map_err(HubError::from_db)
}

/// Notifications an agency member should see: everything in the agency for
/// agency-level roles, otherwise only entries of `sub_account_id`.
pub async fn notifications_for_viewer(
    db: &DbHandle,
    agency_id: &str,
    role: Role,
    sub_account_id: Option<&str>,
) -> Result<Vec<NotificationWithUser>, HubError> {
    let agency_id = agency_id.to_string();
    let all = db
        .call(move |db| db.list_notifications_with_user(&agency_id))
        .await
        .map_err(HubError::from_db)?;

    if role.is_agency_level() {
        return Ok(all);
    }
    Ok(all
        .into_iter()
        .filter(|n| {
            sub_account_id.is_some() && n.notification.sub_account_id.as_deref() == sub_account_id
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::db::HubDb;
    use crate::hub::db::tests::seeded;

    fn principal(email: &str) -> Principal {
        Principal {
            id: "p1".into(),
            email: email.into(),
            first_name: "Olivia".into(),
            last_name: "Owner".into(),
            image_url: String::new(),
        }
    }

    #[tokio::test]
    async fn test_logs_with_principal() -> anyhow::Result<()> {
        let db = HubDb::new_in_memory()?;
        let (agency, owner, _) = seeded(&db)?;
        let handle = DbHandle::new(db);

        let entry = save_activity_log(
            &handle,
            Some(&principal(&owner.email)),
            ActivityLog::agency(&agency.id, "Updated agency details"),
        )
        .await?
        .expect("entry saved");
        assert_eq!(entry.notification, "Olivia Owner | Updated agency details");
        assert_eq!(entry.user_id, owner.id);
        assert!(entry.sub_account_id.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_resolves_agency_from_sub_account_without_principal() -> anyhow::Result<()> {
        let db = HubDb::new_in_memory()?;
        let (agency, owner, sub) = seeded(&db)?;
        let handle = DbHandle::new(db);

        let entry = save_activity_log(
            &handle,
            None,
            ActivityLog::sub_account(&sub.id, "Contact created from webhook"),
        )
        .await?
        .expect("entry saved");
        assert_eq!(entry.agency_id, agency.id);
        assert_eq!(entry.user_id, owner.id);
        assert_eq!(entry.sub_account_id.as_deref(), Some(sub.id.as_str()));
        Ok(())
    }

    #[tokio::test]
    async fn test_unresolvable_entries_are_dropped() -> anyhow::Result<()> {
        let db = HubDb::new_in_memory()?;
        let (agency, owner, _) = seeded(&db)?;
        let handle = DbHandle::new(db);

        let orphan = ActivityLog {
            agency_id: None,
            description: "Nothing to attach to".into(),
            sub_account_id: None,
        };
        assert!(save_activity_log(&handle, None, orphan.clone()).await?.is_none());
        assert!(
            save_activity_log(&handle, Some(&principal(&owner.email)), orphan)
                .await?
                .is_none()
        );
        assert!(
            save_activity_log(
                &handle,
                Some(&principal("ghost@acme.test")),
                ActivityLog::agency(&agency.id, "x")
            )
            .await?
            .is_none()
        );

        let agency_id = agency.id.clone();
        let stored = handle
            .call(move |db| db.list_notifications_with_user(&agency_id))
            .await?;
        assert!(stored.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_viewer_scoping() -> anyhow::Result<()> {
        let db = HubDb::new_in_memory()?;
        let (agency, owner, sub) = seeded(&db)?;
        let handle = DbHandle::new(db);
        let p = principal(&owner.email);
        save_activity_log(&handle, Some(&p), ActivityLog::agency(&agency.id, "agency-wide")).await?;
        save_activity_log(&handle, Some(&p), ActivityLog::sub_account(&sub.id, "in sub")).await?;

        let all = notifications_for_viewer(&handle, &agency.id, Role::AgencyAdmin, None).await?;
        assert_eq!(all.len(), 2);

        let scoped =
            notifications_for_viewer(&handle, &agency.id, Role::SubaccountUser, Some(&sub.id))
                .await?;
        assert_eq!(scoped.len(), 1);
        assert!(scoped[0].notification.notification.ends_with("in sub"));

        let none =
            notifications_for_viewer(&handle, &agency.id, Role::SubaccountGuest, None).await?;
        assert!(none.is_empty());
        Ok(())
    }
}
