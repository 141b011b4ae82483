//! Credential lifecycle of both API flavours.

mod digest;
mod token;

use std::sync::Arc;

use chrono::TimeDelta;
use url::Url;

#[cfg(test)]
pub use self::token::tests::make_jwt;
pub use self::{digest::DigestPhase, token::TokenPhase};
use self::{digest::DigestSession, token::TokenSession};
use crate::{
    prelude::*,
    transport::{Request, Response, Transport},
};

/// Externally observable session state.
#[derive(Copy, Clone, Debug, Eq, PartialEq, derive_more::Display)]
pub enum SessionPhase {
    /// No credentials are configured.
    #[display("anonymous")]
    Anonymous,

    #[display("digest: {_0}")]
    Digest(DigestPhase),

    #[display("token: {_0}")]
    Token(TokenPhase),
}

/// Authenticates requests on their way to the device.
pub enum Session {
    Anonymous(Arc<dyn Transport>),
    Digest(DigestSession),
    Token(TokenSession),
}

impl Session {
    pub fn digest(transport: Arc<dyn Transport>, username: String, password: String) -> Self {
        Self::Digest(DigestSession::new(transport, username, password))
    }

    pub fn token(
        transport: Arc<dyn Transport>,
        base_url: Url,
        username: String,
        password: String,
        refresh_margin: TimeDelta,
    ) -> Self {
        Self::Token(TokenSession::new(transport, base_url, username, password, refresh_margin))
    }

    /// Make the credentials ready for the request: fetch the digest challenge or log in.
    pub async fn acquire(&self, request: &Request) -> Result {
        match self {
            Self::Anonymous(_) => {}
            Self::Digest(session) => {
                session.acquire(request).await?;
            }
            Self::Token(session) => {
                session.acquire().await?;
            }
        }
        Ok(())
    }

    /// Send the request, authenticating and re-authenticating as the mode requires.
    pub async fn send(&self, request: Request) -> Result<Response> {
        match self {
            Self::Anonymous(transport) => Ok(transport.send(request).await?),
            Self::Digest(session) => session.send(request).await,
            Self::Token(session) => session.send(request).await,
        }
    }

    /// Forget the credential state, the next request authenticates from scratch.
    pub async fn invalidate(&self) {
        match self {
            Self::Anonymous(_) => {}
            Self::Digest(session) => session.invalidate().await,
            Self::Token(session) => session.reset().await,
        }
    }

    pub async fn phase(&self) -> SessionPhase {
        match self {
            Self::Anonymous(_) => SessionPhase::Anonymous,
            Self::Digest(session) => SessionPhase::Digest(session.phase().await),
            Self::Token(session) => SessionPhase::Token(session.phase().await),
        }
    }

    /// Release the session: log out from the JSON API, forget the digest challenge.
    pub async fn close(&self) -> Result {
        match self {
            Self::Anonymous(_) => Ok(()),
            Self::Digest(session) => {
                session.close().await;
                Ok(())
            }
            Self::Token(session) => session.close().await,
        }
    }
}
