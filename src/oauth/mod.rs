//! OAuth 2.0 / OIDC façade: identity-provider adapters, the OAuth flow
//! engine, and RFC 8414/OIDC well-known metadata.
//!
//! The gateway is a **relying party** to upstream IdPs (Keycloak, Cognito,
//! Entra) and an **authorization server** to its own clients: it federates
//! login to the configured IdP, then mints its own opaque/HMAC-signed
//! tokens (in [`crate::key_server`]) for downstream use.

mod codes;
mod flow;
mod providers;
mod registry;
mod session;

pub use codes::{AuthCodeRecord, DeviceCodeRecord, DeviceStatus, FlowStore, RefreshTokenRecord};
pub use flow::{FlowState, routes};
pub use providers::{
    IdentityProvider, JwksCache, MappedUserContext, OidcError, TokenBundle, build_provider,
};
pub use registry::{ClientRegistrationRequest, ClientRegistry, RegisteredClient};
pub use session::SessionCookie;
