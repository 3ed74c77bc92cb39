//! Service Discovery (XEP-0030) implementation.
//!
//! ## Supported Queries
//!
//! - **Server disco#info**: server identity plus the features of every
//!   enabled module
//! - **Server disco#items**: empty
//! - **Account disco#info**: registered account identity and account
//!   features, for the owner and contacts with a presence subscription
//! - **Account disco#items**: the account's PEP nodes

pub mod info;
pub mod items;

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

pub use info::{info_query, Identity};
pub use items::{items_query, DiscoItem};

use crate::modules::{reply, IqHandler};
use crate::router::Router;
use crate::stanza::{ErrorReply, Iq};
use crate::storage::StorageError;
use crate::xep::xep0092::SERVER_NAME;
use crate::xml::ns;

pub struct Disco {
    router: Arc<Router>,
    server_features: BTreeSet<&'static str>,
    account_features: BTreeSet<&'static str>,
}

impl Disco {
    /// Collect the features of `handlers` at construction time.
    pub fn new(router: Arc<Router>, handlers: &[Arc<dyn IqHandler>]) -> Self {
        let mut server_features: BTreeSet<_> = [ns::DISCO_INFO, ns::DISCO_ITEMS].into();
        let mut account_features = server_features.clone();
        for handler in handlers {
            server_features.extend(handler.server_features());
            account_features.extend(handler.account_features());
        }
        Self {
            router,
            server_features,
            account_features,
        }
    }

    /// Whether `iq`'s sender may discover the account it is addressed to.
    async fn can_discover_account(&self, iq: &Iq) -> Result<bool, StorageError> {
        let (from, to) = (iq.from(), iq.to());
        if to.matches_bare(from) {
            return Ok(true);
        }
        let item = self
            .router
            .storage()
            .fetch_roster_item(to.node(), &from.to_bare().to_string())
            .await?;
        Ok(item.is_some_and(|i| i.subscription.has_from()))
    }

    async fn account_info(&self, iq: &Iq, node: Option<&str>) -> Result<Iq, StorageError> {
        if !self.router.storage().user_exists(iq.to().node()).await? {
            return Ok(iq.item_not_found());
        }
        if !self.can_discover_account(iq).await? {
            return Ok(iq.service_unavailable());
        }
        let identities = [Identity::account(), Identity::pep()];
        Ok(iq.result_with(info_query(&identities, self.account_features.iter().copied(), node)))
    }

    async fn account_items(&self, iq: &Iq, node: Option<&str>) -> Result<Iq, StorageError> {
        if !self.router.storage().user_exists(iq.to().node()).await? {
            return Ok(iq.item_not_found());
        }
        if !self.can_discover_account(iq).await? {
            return Ok(iq.service_unavailable());
        }
        let host = iq.to().to_bare().to_string();
        let nodes = self.router.storage().fetch_nodes(&host).await?;
        let items: Vec<_> = nodes.iter().map(|n| DiscoItem::node(&host, &n.name)).collect();
        Ok(iq.result_with(items_query(&items, node)))
    }

    async fn answer(&self, iq: &Iq) -> Result<Iq, StorageError> {
        let to = iq.to();
        if let Some(query) = iq.payload_ns("query", ns::DISCO_INFO) {
            let node = query.attr("node");
            if to.is_server() {
                let identities = [Identity::server(SERVER_NAME)];
                return Ok(iq.result_with(info_query(&identities, self.server_features.iter().copied(), node)));
            }
            return self.account_info(iq, node).await;
        }
        let node = iq.payload().and_then(|q| q.attr("node"));
        if to.is_server() {
            return Ok(iq.result_with(items_query(&[], node)));
        }
        self.account_items(iq, node).await
    }
}

#[async_trait]
impl IqHandler for Disco {
    fn name(&self) -> &'static str {
        "disco"
    }

    fn server_features(&self) -> Vec<&'static str> {
        vec![ns::DISCO_INFO, ns::DISCO_ITEMS]
    }

    fn matches_iq(&self, iq: &Iq) -> bool {
        let to = iq.to();
        iq.is_get()
            && (iq.payload_ns("query", ns::DISCO_INFO).is_some() || iq.payload_ns("query", ns::DISCO_ITEMS).is_some())
            && to.resource().is_empty()
            && self.router.hosts().is_local_host(to.domain())
    }

    async fn process_iq(&self, iq: &Iq) {
        let response = match self.answer(iq).await {
            Ok(response) => response,
            Err(e) => {
                warn!(to = %iq.to(), error = %e, "Failed to answer disco query");
                iq.internal_server_error()
            }
        };
        reply(&self.router, response).await;
    }
}
