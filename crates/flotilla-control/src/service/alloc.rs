//! Allocation read and client-update operations.

use std::sync::Arc;

use flotilla_proto::{
    AllocClientUpdateRequest, AllocListRequest, AllocSpecificRequest, Allocation,
    GenericResponse, QueryMeta,
};
use flotilla_state::{Table, WatchItem, WatchSet};

use crate::error::ControlResult;
use crate::log::{LogApplier, LogRequest};
use crate::service::blocking_query;

/// The `Alloc.*` RPC surface.
pub struct AllocService {
    store: Arc<flotilla_state::StateStore>,
    log: Arc<dyn LogApplier>,
}

impl AllocService {
    /// Creates the service.
    #[must_use]
    pub fn new(store: Arc<flotilla_state::StateStore>, log: Arc<dyn LogApplier>) -> Self {
        Self { store, log }
    }

    /// Applies client-reported allocation state. The clients own only the
    /// observed fields; desired state stays with the schedulers, and no
    /// allocation is ever created from a client update.
    pub async fn update_from_client(
        &self,
        req: AllocClientUpdateRequest,
    ) -> ControlResult<GenericResponse> {
        let index = self
            .log
            .apply(LogRequest::AllocClientUpdate { allocs: req.allocs })
            .await?;
        Ok(GenericResponse { index })
    }

    /// Fetches an allocation, blocking per the query options.
    pub async fn get_alloc(
        &self,
        req: &AllocSpecificRequest,
    ) -> (Option<Arc<Allocation>>, QueryMeta) {
        let items: WatchSet = [WatchItem::Alloc(req.alloc_id.clone())].into_iter().collect();
        let alloc_id = req.alloc_id.clone();
        blocking_query(
            &self.store,
            Table::Allocs,
            items,
            &req.query,
            self.log.known_leader(),
            move |snap| snap.alloc_by_id(&alloc_id),
        )
        .await
    }

    /// Lists allocations, optionally filtered by ID prefix.
    pub async fn list(&self, req: &AllocListRequest) -> (Vec<Arc<Allocation>>, QueryMeta) {
        let items: WatchSet = [WatchItem::Table(Table::Allocs)].into_iter().collect();
        let prefix = req.prefix.clone();
        blocking_query(
            &self.store,
            Table::Allocs,
            items,
            &req.query,
            self.log.known_leader(),
            move |snap| match &prefix {
                Some(prefix) => snap.allocs_by_id_prefix(prefix),
                None => snap.allocs(),
            },
        )
        .await
    }
}
