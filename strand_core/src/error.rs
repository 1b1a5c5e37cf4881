use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct StrandError {
    pub message: String,
    pub error_type: StrandErrorType,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StrandErrorType {
    /// Reason supplied by user code (a `reject` call or an `Err` from a handler).
    Rejected,
    /// A panic trapped inside an executor, handler or spawned task.
    Panic,
    Timeout {
        elapsed: Duration,
    },
    UnknownChannel {
        name: String,
    },
    ChannelExists {
        name: String,
    },
    ChannelLimit {
        max: usize,
    },
    EmptySelect,
    /// The executor ran out of runnable work before the awaited promise settled.
    Stalled {
        pending: usize,
    },
}

impl StrandError {
    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: StrandErrorType::Rejected,
        }
    }

    pub fn panic(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: StrandErrorType::Panic,
        }
    }

    pub fn timeout(elapsed: Duration) -> Self {
        Self {
            message: format!("await timed out after {:?}", elapsed),
            error_type: StrandErrorType::Timeout { elapsed },
        }
    }

    pub fn unknown_channel(name: &str) -> Self {
        Self {
            message: format!("Channel '{}' not found", name),
            error_type: StrandErrorType::UnknownChannel { name: name.to_string() },
        }
    }

    pub fn channel_exists(name: &str) -> Self {
        Self {
            message: format!("Channel '{}' already exists", name),
            error_type: StrandErrorType::ChannelExists { name: name.to_string() },
        }
    }

    pub fn channel_limit(max: usize) -> Self {
        Self {
            message: format!("Maximum channels ({}) exceeded", max),
            error_type: StrandErrorType::ChannelLimit { max },
        }
    }

    pub fn empty_select() -> Self {
        Self {
            message: "No select cases provided".to_string(),
            error_type: StrandErrorType::EmptySelect,
        }
    }

    pub fn stalled(pending: usize) -> Self {
        Self {
            message: format!("Executor stalled with {} blocked task(s)", pending),
            error_type: StrandErrorType::Stalled { pending },
        }
    }

    /// Converts a payload caught by `catch_unwind` into a rejection reason.
    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        };
        log::warn!("trapped panic: {}", message);
        Self::panic(message)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.error_type, StrandErrorType::Timeout { .. })
    }

    pub fn elapsed(&self) -> Option<Duration> {
        match self.error_type {
            StrandErrorType::Timeout { elapsed } => Some(elapsed),
            _ => None,
        }
    }
}

impl fmt::Display for StrandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.error_type {
            StrandErrorType::Rejected => write!(f, "{}", self.message),
            StrandErrorType::Panic => write!(f, "Panic: {}", self.message),
            StrandErrorType::Timeout { elapsed } => write!(f, "Timeout after {:?}", elapsed),
            StrandErrorType::UnknownChannel { name } => write!(f, "Unknown channel '{}'", name),
            StrandErrorType::ChannelExists { name } => write!(f, "Channel '{}' already exists", name),
            StrandErrorType::ChannelLimit { max } => write!(f, "Maximum channels ({}) exceeded", max),
            StrandErrorType::EmptySelect => write!(f, "No select cases provided"),
            StrandErrorType::Stalled { pending } => {
                write!(f, "Executor stalled with {} blocked task(s)", pending)
            }
        }
    }
}

impl std::error::Error for StrandError {}

impl From<&str> for StrandError {
    fn from(message: &str) -> Self {
        StrandError::rejected(message)
    }
}

impl From<String> for StrandError {
    fn from(message: String) -> Self {
        StrandError::rejected(message)
    }
}
