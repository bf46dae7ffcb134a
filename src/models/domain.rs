//! Domain (subject category) model

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use validator::Validate;

use super::DomainId;

/// A subject category. `parent_id` is a plain id: the hierarchy store owns
/// the links and children are derived by query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Domain {
    pub id: DomainId,
    pub name: String,
    pub parent_id: Option<DomainId>,
}

impl Domain {
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

/// Create domain request
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateDomain {
    #[validate(length(min = 1, max = 255, message = "Domain name must be 1-255 characters"))]
    pub name: String,
    /// Existing domain to attach under, `None` for a new root
    pub parent_id: Option<DomainId>,
}
