use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;

#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Error establishing or using the underlying transport
    Transport,
    /// Error encoding or decoding a wire frame
    Serialization,
    /// A message exhausted its retry budget without confirmation
    Delivery,
    /// Error related to invalid state within resilient-ws
    Validation,
}

#[derive(Debug)]
pub struct Error {
    kind: Kind,
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
    backtrace: Backtrace,
}

impl Error {
    pub fn with_source<S: StdError + Send + Sync + 'static>(kind: Kind, source: S) -> Self {
        Self {
            kind,
            source: Some(Box::new(source)),
            backtrace: Backtrace::capture(),
        }
    }

    #[must_use]
    pub fn kind(&self) -> Kind {
        self.kind
    }

    #[must_use]
    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    #[must_use]
    pub fn inner(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.source.as_deref()
    }

    #[must_use]
    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        let e = self.source.as_deref()?;
        e.downcast_ref::<E>()
    }

    pub fn validation<S: Into<String>>(message: S) -> Self {
        Validation {
            reason: message.into(),
        }
        .into()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(src) => write!(f, "{:?}: {}", self.kind, src),
            None => write!(f, "{:?}", self.kind),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn StdError + 'static))
    }
}

/// Transport error variants.
#[non_exhaustive]
#[derive(Debug)]
pub enum TransportError {
    /// Error connecting to or communicating with the remote endpoint
    Connection(tokio_tungstenite::tungstenite::Error),
    /// Transport was closed by the remote or torn down locally
    Closed,
    /// Attempted to transmit while no transport is open
    NotConnected,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection(e) => write!(f, "transport connection error: {e}"),
            Self::Closed => write!(f, "transport closed"),
            Self::NotConnected => write!(f, "no transport open"),
        }
    }
}

impl StdError for TransportError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Connection(e) => Some(e),
            _ => None,
        }
    }
}

/// A message ran out of retries without ever being confirmed by the remote.
///
/// Carried by the delivery-failure callback so the application learns exactly
/// which message was lost and after how many attempts.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct DeliveryExhausted {
    /// Id of the failed message
    pub id: String,
    /// Application-level type tag of the failed message
    pub message_type: String,
    /// Number of retransmissions that were attempted
    pub retries: u32,
}

impl fmt::Display for DeliveryExhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "message {} (type {}) unconfirmed after {} retries",
            self.id, self.message_type, self.retries
        )
    }
}

impl StdError for DeliveryExhausted {}

#[non_exhaustive]
#[derive(Debug)]
pub struct Validation {
    pub reason: String,
}

impl fmt::Display for Validation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid: {}", self.reason)
    }
}

impl StdError for Validation {}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        Self::with_source(Kind::Transport, err)
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::with_source(Kind::Transport, TransportError::Connection(e))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::with_source(Kind::Serialization, e)
    }
}

impl From<DeliveryExhausted> for Error {
    fn from(err: DeliveryExhausted) -> Self {
        Self::with_source(Kind::Delivery, err)
    }
}

impl From<Validation> for Error {
    fn from(err: Validation) -> Self {
        Self::with_source(Kind::Validation, err)
    }
}
