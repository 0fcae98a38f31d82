use thiserror::Error;

use crate::auth::{AuthError, ErrorKind};

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Auth(#[from] AuthError),
}

impl Error {
    #[must_use]
    pub const fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// Taxonomy of the failure; crate configuration errors count as configuration
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Configuration,
            Self::Auth(e) => e.kind(),
        }
    }

    #[must_use]
    pub const fn as_auth(&self) -> Option<&AuthError> {
        match self {
            Self::Auth(e) => Some(e),
            Self::Config(_) => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
