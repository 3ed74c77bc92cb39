//! XEP-0092: Software Version

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::modules::{reply, IqHandler};
use crate::router::Router;
use crate::stanza::{ErrorReply, Iq};
use crate::xml::{ns, XElement};

pub const SERVER_NAME: &str = "jackal";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct VersionConfig {
    /// Include the operating system in answers.
    pub show_os: bool,
}

pub struct Version {
    config: VersionConfig,
    router: Arc<Router>,
}

impl Version {
    pub fn new(config: VersionConfig, router: Arc<Router>) -> Self {
        Self { config, router }
    }

    fn query(&self) -> XElement {
        let mut query = XElement::builder("query")
            .attr("xmlns", ns::VERSION)
            .child(XElement::builder("name").text(SERVER_NAME).build())
            .child(XElement::builder("version").text(env!("CARGO_PKG_VERSION")).build());
        if self.config.show_os {
            query = query.child(XElement::builder("os").text(std::env::consts::OS).build());
        }
        query.build()
    }
}

#[async_trait]
impl IqHandler for Version {
    fn name(&self) -> &'static str {
        "version"
    }

    fn server_features(&self) -> Vec<&'static str> {
        vec![ns::VERSION]
    }

    fn matches_iq(&self, iq: &Iq) -> bool {
        iq.is_request() && iq.to().is_server() && iq.payload_ns("query", ns::VERSION).is_some()
    }

    async fn process_iq(&self, iq: &Iq) {
        let response = if iq.is_get() {
            iq.result_with(self.query())
        } else {
            iq.bad_request()
        };
        reply(&self.router, response).await;
    }
}
