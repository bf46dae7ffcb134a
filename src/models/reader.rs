//! Reader model and related types

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use validator::{Validate, ValidateEmail, ValidationError};

use super::ReaderId;

/// Reader as stored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Reader {
    pub id: ReaderId,
    pub firstname: String,
    pub lastname: String,
    pub address: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    /// Library staff; re-parameterizes every lending threshold
    pub is_employee: bool,
    /// Running count of granted loan extensions
    pub number_of_extensions: i32,
    /// Bumped on every lending commit touching this reader
    pub version: i32,
}

impl Reader {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.firstname, self.lastname)
    }
}

fn has_text(value: &Option<String>) -> bool {
    value.as_deref().map(|s| !s.trim().is_empty()).unwrap_or(false)
}

fn validate_contact(reader: &CreateReader) -> Result<(), ValidationError> {
    if has_text(&reader.email) || has_text(&reader.phone) {
        Ok(())
    } else {
        let mut err = ValidationError::new("contact");
        err.message = Some("Either email or phone is required".into());
        Err(err)
    }
}

fn validate_optional_email(email: &str) -> Result<(), ValidationError> {
    if email.is_empty() || email.validate_email() {
        Ok(())
    } else {
        Err(ValidationError::new("email"))
    }
}

fn validate_optional_phone(phone: &str) -> Result<(), ValidationError> {
    let len = phone.chars().count();
    if phone.trim().is_empty() || (6..=20).contains(&len) {
        Ok(())
    } else {
        let mut err = ValidationError::new("phone");
        err.message = Some("Phone must be 6-20 characters".into());
        Err(err)
    }
}

/// Create reader request
#[derive(Debug, Clone, Deserialize, Validate)]
#[validate(schema(function = "validate_contact"))]
pub struct CreateReader {
    #[validate(length(min = 1, message = "First name is required"))]
    pub firstname: String,
    #[validate(length(min = 1, message = "Last name is required"))]
    pub lastname: String,
    pub address: Option<String>,
    #[validate(email(message = "Invalid email format"))]
    pub email: Option<String>,
    #[validate(length(min = 6, max = 20, message = "Phone must be 6-20 characters"))]
    pub phone: Option<String>,
    #[serde(default)]
    pub is_employee: bool,
}

/// Update reader request
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct UpdateReader {
    #[validate(length(min = 1, message = "First name cannot be empty"))]
    pub firstname: Option<String>,
    #[validate(length(min = 1, message = "Last name cannot be empty"))]
    pub lastname: Option<String>,
    pub address: Option<String>,
    /// `Some("")` clears the email
    #[validate(custom(function = "validate_optional_email"))]
    pub email: Option<String>,
    /// `Some("")` clears the phone
    #[validate(custom(function = "validate_optional_phone"))]
    pub phone: Option<String>,
    pub is_employee: Option<bool>,
}

impl UpdateReader {
    /// Apply the update, returning `false` if the result has no contact left
    pub fn apply(&self, reader: &mut Reader) -> bool {
        fn merge(target: &mut Option<String>, value: &Option<String>) {
            if let Some(v) = value {
                *target = if v.trim().is_empty() { None } else { Some(v.clone()) };
            }
        }

        if let Some(ref v) = self.firstname {
            reader.firstname = v.clone();
        }
        if let Some(ref v) = self.lastname {
            reader.lastname = v.clone();
        }
        merge(&mut reader.address, &self.address);
        merge(&mut reader.email, &self.email);
        merge(&mut reader.phone, &self.phone);
        if let Some(v) = self.is_employee {
            reader.is_employee = v;
        }

        has_text(&reader.email) || has_text(&reader.phone)
    }
}
