//! XEP-0054: vcard-temp
//!
//! Users publish their own vCard and may read the vCard of any local
//! account.
//!
//! ```xml
//! <iq type='get' to='noelia@jackal.im' id='v1'>
//!   <vCard xmlns='vcard-temp'/>
//! </iq>
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::modules::{reply, IqHandler};
use crate::router::Router;
use crate::stanza::{ErrorReply, Iq, IqType};
use crate::xml::{ns, XElement};

fn empty_vcard() -> XElement {
    XElement::builder("vCard").attr("xmlns", ns::VCARD).build()
}

pub struct VCards {
    router: Arc<Router>,
}

impl VCards {
    pub fn new(router: Arc<Router>) -> Self {
        Self { router }
    }

    async fn get_vcard(&self, iq: &Iq) -> Iq {
        let owner = iq.to().node();
        match self.router.storage().fetch_vcard(owner).await {
            Ok(vcard) => iq.result_with(vcard.unwrap_or_else(empty_vcard)),
            Err(e) => {
                warn!(owner, error = %e, "Failed to fetch vCard");
                iq.internal_server_error()
            }
        }
    }

    async fn set_vcard(&self, iq: &Iq, vcard: &XElement) -> Iq {
        if !iq.to().matches_bare(iq.from()) {
            return iq.forbidden();
        }
        let owner = iq.from().node();
        match self.router.storage().upsert_vcard(owner, vcard).await {
            Ok(()) => {
                debug!(owner, "vCard updated");
                iq.result()
            }
            Err(e) => {
                warn!(owner, error = %e, "Failed to store vCard");
                iq.internal_server_error()
            }
        }
    }
}

#[async_trait]
impl IqHandler for VCards {
    fn name(&self) -> &'static str {
        "vcard"
    }

    fn server_features(&self) -> Vec<&'static str> {
        vec![ns::VCARD]
    }

    fn matches_iq(&self, iq: &Iq) -> bool {
        let to = iq.to();
        iq.is_request()
            && iq.payload_ns("vCard", ns::VCARD).is_some()
            && !to.node().is_empty()
            && to.resource().is_empty()
            && self.router.hosts().is_local_host(to.domain())
    }

    async fn process_iq(&self, iq: &Iq) {
        let Some(vcard) = iq.payload_ns("vCard", ns::VCARD) else {
            return;
        };
        let response = match iq.iq_type() {
            IqType::Get => self.get_vcard(iq).await,
            IqType::Set => self.set_vcard(iq, vcard).await,
            _ => iq.bad_request(),
        };
        reply(&self.router, response).await;
    }
}
