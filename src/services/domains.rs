//! Domain hierarchy service

use std::sync::Arc;

use validator::Validate;

use crate::{
    error::{AppError, AppResult},
    hierarchy::DomainHierarchy,
    models::{CreateDomain, Domain, DomainId},
    repository::RecordStore,
};

#[derive(Clone)]
pub struct DomainService {
    store: Arc<dyn RecordStore>,
}

impl DomainService {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// Create a domain, as a root or under an existing parent
    pub async fn create(&self, data: &CreateDomain) -> AppResult<Domain> {
        data.validate()?;
        let domain = self.store.create_domain(data).await?;
        tracing::info!(
            "Domain {} '{}' created under {:?}",
            domain.id,
            domain.name,
            domain.parent_id
        );
        Ok(domain)
    }

    pub async fn get(&self, id: DomainId) -> AppResult<Domain> {
        self.store.get_domain(id).await
    }

    pub async fn list(&self) -> AppResult<Vec<Domain>> {
        self.store.list_domains().await
    }

    pub async fn rename(&self, id: DomainId, name: &str) -> AppResult<Domain> {
        let name = name.trim();
        if name.is_empty() || name.len() > 255 {
            return Err(AppError::Validation(
                "Domain name must be 1-255 characters".to_string(),
            ));
        }
        self.store.rename_domain(id, name).await
    }

    /// Move a domain under another one, or make it a root. Refused when the
    /// new parent lies in the domain's own subtree, or when a book would end
    /// up filed under a domain and one of its ancestors.
    pub async fn set_parent(&self, id: DomainId, parent: Option<DomainId>) -> AppResult<Domain> {
        let domain = self.store.set_domain_parent(id, parent).await?;
        tracing::info!("Domain {} moved under {:?}", id, parent);
        Ok(domain)
    }

    /// Delete a leaf domain that no book is filed under
    pub async fn delete(&self, id: DomainId) -> AppResult<()> {
        self.store.delete_domain(id).await?;
        tracing::info!("Domain {} deleted", id);
        Ok(())
    }

    pub async fn roots(&self) -> AppResult<Vec<Domain>> {
        Ok(self
            .store
            .list_domains()
            .await?
            .into_iter()
            .filter(Domain::is_root)
            .collect())
    }

    /// Domains with no children
    pub async fn leaves(&self) -> AppResult<Vec<Domain>> {
        let domains = self.store.list_domains().await?;
        let hierarchy = DomainHierarchy::from_domains(&domains);
        let leaves = hierarchy.leaves();
        Ok(domains
            .into_iter()
            .filter(|d| leaves.contains(&d.id))
            .collect())
    }

    /// Ancestors of a domain, nearest first. Empty for roots and unknown ids.
    pub async fn ancestors(&self, id: DomainId) -> AppResult<Vec<DomainId>> {
        let domains = self.store.list_domains().await?;
        Ok(DomainHierarchy::from_domains(&domains).ancestors(id)?)
    }

    /// Every domain below `id`. Empty for leaves and unknown ids.
    pub async fn descendants(&self, id: DomainId) -> AppResult<Vec<DomainId>> {
        self.store.domain_descendants(id).await
    }

    /// `ancestor` lies strictly above `of`
    pub async fn is_ancestor(&self, ancestor: DomainId, of: DomainId) -> AppResult<bool> {
        self.store.get_domain(ancestor).await?;
        self.store.get_domain(of).await?;
        self.store.domain_is_ancestor(ancestor, of).await
    }
}
