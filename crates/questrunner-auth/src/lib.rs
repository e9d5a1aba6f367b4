//! # Quest Runner Auth Plugins
//!
//! Concrete [`questrunner_plugin::AuthPlugin`] implementations:
//! [`bearer::BearerAuthPlugin`], [`basic::BasicAuthPlugin`], and
//! [`oauth2_auth::OAuth2AuthPlugin`] (client-credentials grant, via the
//! `oauth2` crate).

mod basic;
mod bearer;
mod error;
mod oauth2_auth;

pub use basic::BasicAuthPlugin;
pub use bearer::BearerAuthPlugin;
pub use error::AuthError;
pub use oauth2_auth::OAuth2AuthPlugin;
