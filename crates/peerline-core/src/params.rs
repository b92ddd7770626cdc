//! Connection-establishment parameters.

use crate::error::{RelayError, RelayResult};
use url::form_urlencoded;

/// Message sent in the close frame when either identifier is absent.
pub const MISSING_PARAMETER_REASON: &str = "Missing user_id or peer_id";

/// The two identifiers a client supplies when opening a relay connection.
///
/// Both identifiers are guaranteed non-empty; the only way to build one is
/// through [`ConnectParams::new`] or [`ConnectParams::from_query`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectParams {
    user_id: String,
    peer_id: String,
}

impl ConnectParams {
    pub fn new(user_id: impl Into<String>, peer_id: impl Into<String>) -> RelayResult<Self> {
        let user_id = user_id.into();
        let peer_id = peer_id.into();
        if user_id.is_empty() || peer_id.is_empty() {
            return Err(RelayError::MissingParameter(MISSING_PARAMETER_REASON.into()));
        }
        Ok(Self { user_id, peer_id })
    }

    /// The caller's own identifier.
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// The identifier of the counterpart to forward to.
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Extract `user_id` and `peer_id` from a raw URL query string.
    ///
    /// Values are percent-decoded. The first occurrence of a key wins and an
    /// empty value counts as absent.
    pub fn from_query(query: Option<&str>) -> RelayResult<Self> {
        let mut user_id = None;
        let mut peer_id = None;

        for (key, value) in form_urlencoded::parse(query.unwrap_or_default().as_bytes()) {
            match key.as_ref() {
                "user_id" if user_id.is_none() => user_id = Some(value.into_owned()),
                "peer_id" if peer_id.is_none() => peer_id = Some(value.into_owned()),
                _ => {}
            }
        }

        Self::new(user_id.unwrap_or_default(), peer_id.unwrap_or_default())
    }
}
