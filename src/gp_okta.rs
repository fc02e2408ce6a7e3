//! Logs in to a GlobalProtect portal through Okta SAML and hands the
//! resulting cookie to openconnect.
//!
//! The flow is strictly sequential: portal prelogin, SAML handoff to the IdP,
//! the authn transaction (with MFA), the redirect chase back to the portal,
//! and finally the portal config request.

pub mod authn;
pub mod bundle;
pub mod config;
pub mod error;
pub mod exchange;
pub mod handoff;
pub mod logger;
pub mod markup;
pub mod mfa;
pub mod portal;
pub mod redirect;
pub mod verify;

pub use authn::{authenticate, Transaction};
pub use bundle::TrustBundle;
pub use config::RunConfig;
pub use error::{Error, Result};
pub use exchange::{Exchange, ExchangeSession};
pub use handoff::VpnHandoff;
pub use logger::{init_logger, raise_to_debug};
pub use portal::{fetch_config, prelogin, PortalGrant};
pub use redirect::{chase, relaxed_handoff, saml_handoff, SessionArtifacts};
