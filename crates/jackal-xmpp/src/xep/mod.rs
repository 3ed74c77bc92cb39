//! XMPP Extension Protocols (XEPs) Implementation
//!
//! ## Implemented XEPs
//!
//! - **XEP-0049**: Private XML Storage.
//! - **XEP-0054**: vcard-temp.
//! - **XEP-0092**: Software Version.
//! - **XEP-0115**: Entity Capabilities - verification strings and caps
//!   disco queries. The presence hub drives resolution.
//! - **XEP-0160**: Offline message storage with a per-user quota.
//! - **XEP-0191**: Blocking Command.
//! - **XEP-0199**: XMPP Ping, including optional server-initiated pings.

pub mod xep0049;
pub mod xep0054;
pub mod xep0092;
pub mod xep0115;
pub mod xep0160;
pub mod xep0191;
pub mod xep0199;
