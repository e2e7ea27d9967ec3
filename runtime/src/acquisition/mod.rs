//! Network acquisition layer.
//!
//! `http_client` is the transport, `challenge` recognises anti-bot pages and
//! `fetch` is the single paced path every strategy request goes through.

pub mod challenge;
pub mod fetch;
pub mod http_client;
