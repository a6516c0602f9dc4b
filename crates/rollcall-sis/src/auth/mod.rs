//! OAuth credentials for SIS providers.
//!
//! - [`OAuthClient`] talks to provider token endpoints.
//! - [`OAuthTokenManager`] keeps each integration's token valid and rotates
//!   tokens ahead of expiry.
//! - [`TokenStore`] is the persistence seam for encrypted tokens.

mod client;
mod manager;
mod token;

pub use client::{OAuthClient, OAuthProviderConfig, TokenGrant};
pub use manager::{OAuthTokenManager, TokenManagerConfig};
pub use token::{InMemoryTokenStore, OAuthToken, TokenStatus, TokenStore, EXPIRES_SOON_WINDOW_MINUTES};
