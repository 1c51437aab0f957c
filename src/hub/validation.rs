//! Request validation. Every check appends to one list so a caller sees all
//! problems at once as `HubError::Validation("field: message; ...")`.

use std::sync::LazyLock;

use regex::Regex;

use super::models::{
    AgencyInput, ContactInput, FunnelInput, LaneInput, MediaInput, PipelineInput, Role,
    SubAccountInput, TagInput, TicketInput, UserUpdate,
};
use crate::errors::HubError;

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("email regex is valid")
});

static SUB_DOMAIN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?$").expect("sub-domain regex is valid")
});

#[derive(Default)]
struct Problems(Vec<String>);

impl Problems {
    fn required(&mut self, field: &str, value: &str) {
        if value.trim().is_empty() {
            self.0.push(format!("{}: required", field));
        }
    }

    fn min_len(&mut self, field: &str, value: &str, min: usize) {
        if value.trim().chars().count() < min {
            self.0.push(format!("{}: must be at least {} characters", field, min));
        }
    }

    fn email(&mut self, field: &str, value: &str) {
        if !is_valid_email(value) {
            self.0.push(format!("{}: invalid email", field));
        }
    }

    fn finish(self) -> Result<(), HubError> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(HubError::Validation(self.0.join("; ")))
        }
    }
}

pub fn is_valid_email(value: &str) -> bool {
    EMAIL_RE.is_match(value.trim())
}

pub fn validate_agency(input: &AgencyInput) -> Result<(), HubError> {
    let mut p = Problems::default();
    p.min_len("name", &input.name, 2);
    p.email("companyEmail", &input.company_email);
    p.required("companyPhone", &input.company_phone);
    p.required("address", &input.address);
    p.required("city", &input.city);
    p.required("zipCode", &input.zip_code);
    p.required("state", &input.state);
    p.required("country", &input.country);
    p.required("agencyLogo", &input.agency_logo);
    p.finish()
}

pub fn validate_sub_account(input: &SubAccountInput) -> Result<(), HubError> {
    let mut p = Problems::default();
    p.required("name", &input.name);
    p.email("companyEmail", &input.company_email);
    p.required("companyPhone", &input.company_phone);
    p.required("address", &input.address);
    p.required("city", &input.city);
    p.required("zipCode", &input.zip_code);
    p.required("state", &input.state);
    p.required("country", &input.country);
    p.finish()
}

pub fn validate_user_update(update: &UserUpdate) -> Result<(), HubError> {
    let mut p = Problems::default();
    p.email("email", &update.email);
    if let Some(name) = &update.name {
        p.required("name", name);
    }
    p.finish()
}

/// Owners are created with their agency, never through an invitation.
pub fn validate_invitation(email: &str, role: Role) -> Result<(), HubError> {
    let mut p = Problems::default();
    p.email("email", email);
    if role == Role::AgencyOwner {
        p.0.push("role: must be AGENCY_ADMIN, SUBACCOUNT_USER or SUBACCOUNT_GUEST".to_string());
    }
    p.finish()
}

pub fn validate_pipeline(input: &PipelineInput) -> Result<(), HubError> {
    let mut p = Problems::default();
    p.required("name", &input.name);
    p.finish()
}

pub fn validate_lane(input: &LaneInput) -> Result<(), HubError> {
    let mut p = Problems::default();
    p.required("name", &input.name);
    if input.order.is_some_and(|o| o < 0) {
        p.0.push("order: must not be negative".to_string());
    }
    p.finish()
}

pub fn validate_ticket(input: &TicketInput) -> Result<(), HubError> {
    let mut p = Problems::default();
    p.required("name", &input.name);
    if input.value.is_some_and(|v| !v.is_finite()) {
        p.0.push("value: must be a number".to_string());
    }
    p.finish()
}

pub fn validate_tag(input: &TagInput) -> Result<(), HubError> {
    let mut p = Problems::default();
    p.required("name", &input.name);
    p.required("color", &input.color);
    p.finish()
}

pub fn validate_contact(input: &ContactInput) -> Result<(), HubError> {
    let mut p = Problems::default();
    p.required("name", &input.name);
    p.email("email", &input.email);
    p.finish()
}

pub fn validate_funnel(input: &FunnelInput) -> Result<(), HubError> {
    let mut p = Problems::default();
    p.required("name", &input.name);
    if let Some(sub_domain) = &input.sub_domain_name
        && !SUB_DOMAIN_RE.is_match(sub_domain)
    {
        p.0.push("subDomainName: lowercase letters, digits and hyphens only".to_string());
    }
    if let Some(products) = &input.live_products
        && !serde_json::from_str::<serde_json::Value>(products).is_ok_and(|v| v.is_array())
    {
        p.0.push("liveProducts: must be a JSON array".to_string());
    }
    p.finish()
}

pub fn validate_media(input: &MediaInput) -> Result<(), HubError> {
    let mut p = Problems::default();
    p.required("name", &input.name);
    p.required("link", &input.link);
    p.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agency() -> AgencyInput {
        AgencyInput {
            name: "Acme".into(),
            agency_logo: "https://cdn.test/acme.png".into(),
            company_email: "hello@acme.test".into(),
            company_phone: "555-0100".into(),
            address: "1 Main St".into(),
            city: "Porto".into(),
            zip_code: "4000".into(),
            state: "Norte".into(),
            country: "PT".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_email_format() {
        assert!(is_valid_email("ana@acme.test"));
        assert!(is_valid_email("  ana@acme.test "));
        assert!(!is_valid_email("ana@acme"));
        assert!(!is_valid_email("ana acme.test"));
        assert!(!is_valid_email(""));
    }

    #[test]
    fn test_valid_agency_passes() {
        assert!(validate_agency(&agency()).is_ok());
    }

    #[test]
    fn test_agency_name_minimum_and_aggregation() {
        let mut input = agency();
        input.name = "A".into();
        input.city.clear();
        match validate_agency(&input) {
            Err(HubError::Validation(msg)) => {
                assert!(msg.contains("name: must be at least 2 characters"));
                assert!(msg.contains("city: required"));
                assert_eq!(msg.matches("; ").count(), 1);
            }
            other => panic!("Expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_invitation_rejects_owner_role() {
        assert!(validate_invitation("bo@acme.test", Role::AgencyAdmin).is_ok());
        assert!(validate_invitation("bo@acme.test", Role::SubaccountGuest).is_ok());
        assert!(validate_invitation("bo@acme.test", Role::AgencyOwner).is_err());
        assert!(validate_invitation("bo", Role::SubaccountUser).is_err());
    }

    #[test]
    fn test_lane_and_media() {
        let lane = LaneInput {
            name: " ".into(),
            ..Default::default()
        };
        assert!(validate_lane(&lane).is_err());
        let media = MediaInput {
            media_type: None,
            name: "logo".into(),
            link: String::new(),
        };
        assert!(validate_media(&media).is_err());
    }

    #[test]
    fn test_funnel_sub_domain_and_products() {
        let mut input = FunnelInput {
            name: "Spring Sale".into(),
            sub_domain_name: Some("spring-sale".into()),
            live_products: Some("[]".into()),
            ..Default::default()
        };
        assert!(validate_funnel(&input).is_ok());

        input.sub_domain_name = Some("Spring Sale".into());
        input.live_products = Some("{\"id\": 1}".into());
        match validate_funnel(&input) {
            Err(HubError::Validation(msg)) => {
                assert!(msg.contains("subDomainName"));
                assert!(msg.contains("liveProducts"));
            }
            other => panic!("Expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_user_update_name_optional() {
        let update = UserUpdate {
            email: "ana@acme.test".into(),
            ..Default::default()
        };
        assert!(validate_user_update(&update).is_ok());
        let blank = UserUpdate {
            email: "ana@acme.test".into(),
            name: Some(String::new()),
            ..Default::default()
        };
        assert!(validate_user_update(&blank).is_err());
    }
}
