//! Token pipeline: validation, scope derivation, caching, and on-behalf-of
//! exchange.

pub mod exchange;
pub mod obo;
pub mod scope;
pub mod store;
pub mod validator;

pub use exchange::{ExchangeToken, OauthExchangeClient, OboToken};
pub use obo::{ForwardingDirective, OboContext, OboError, RequestIds};
pub use scope::resolve_scope;
pub use store::{CLOCK_SKEW_SECONDS, OboTokenStore, create_token_store, obo_token_key};
pub use validator::{TokenValidator, ValidateToken};
