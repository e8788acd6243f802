//! Gateway: request dispatch across providers and the HTTP surface around it

pub mod auth;
pub mod collaborators;
pub mod composite;
pub mod context;
mod router;
mod server;

pub use auth::{AuthState, SESSION_COOKIE, oidc_middleware};
pub use collaborators::{
    AuthenticatorDelegates, DelegateFactory, InMemorySessionStore, InMemoryUserDirectory, LocalUser,
    LoginRedirect, ProviderDelegates, SessionRefresh, SessionStore, UserDirectory,
};
pub use composite::{CompositeRouter, RouteOutcome};
pub use context::{AuthRequest, AuthenticationResult, Principal, SecurityContext};
pub use router::{AppState, create_router};
pub use server::Gateway;
