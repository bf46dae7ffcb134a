//! Business logic services

pub mod availability;
pub mod catalog;
pub mod domains;
pub mod lending;
pub mod readers;
pub mod validation;

use std::sync::Arc;

use crate::{config::WorkflowConfig, policy::PolicyProvider, repository::RecordStore};

pub use lending::{Clock, SystemClock};

/// Container for all services
#[derive(Clone)]
pub struct Services {
    pub catalog: catalog::CatalogService,
    pub domains: domains::DomainService,
    pub readers: readers::ReaderService,
    pub lending: lending::LendingService,
}

impl Services {
    /// Create all services over one record store
    pub fn new(
        store: Arc<dyn RecordStore>,
        policy: Arc<dyn PolicyProvider>,
        clock: Arc<dyn Clock>,
        workflow: &WorkflowConfig,
    ) -> Self {
        Self {
            catalog: catalog::CatalogService::new(store.clone(), policy.clone()),
            domains: domains::DomainService::new(store.clone()),
            readers: readers::ReaderService::new(store.clone()),
            lending: lending::LendingService::new(store, policy, clock, workflow),
        }
    }
}
