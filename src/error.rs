//! Error taxonomy for remote calls.
//!
//! Two failure classes matter to the cache: the request never made it
//! (transport) or the server looked at the payload and said no (validation).
//! Both roll the optimistic edit back; they differ only in what the user
//! should be told.

use thiserror::Error;

/// Failure of a remote fetch or mutation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
  /// Network/HTTP-level failure: connect error, timeout, 5xx, garbled body.
  #[error("transport failure: {0}")]
  Transport(String),

  /// The server rejected the payload (e.g. duplicate name, bad field value).
  /// The message is the server's own text when it sent one.
  #[error("{message}")]
  Validation { message: String },
}

impl RemoteError {
  pub fn is_validation(&self) -> bool {
    matches!(self, RemoteError::Validation { .. })
  }

  /// Toast text for a rolled-back mutation.
  ///
  /// Validation messages are surfaced verbatim; transport details are
  /// replaced with a generic line since raw reqwest errors help nobody.
  pub fn mutation_message(&self) -> String {
    match self {
      RemoteError::Transport(_) => "Request failed, your change was not saved".to_string(),
      RemoteError::Validation { message } => message.clone(),
    }
  }

  /// Toast text for a failed load. Same policy as `mutation_message`, with
  /// wording that does not claim an unsaved change.
  pub fn fetch_message(&self) -> String {
    match self {
      RemoteError::Transport(_) => "Request failed, the data could not be loaded".to_string(),
      RemoteError::Validation { message } => message.clone(),
    }
  }
}

impl From<reqwest::Error> for RemoteError {
  fn from(err: reqwest::Error) -> Self {
    RemoteError::Transport(err.to_string())
  }
}
