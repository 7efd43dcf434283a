use std::fmt;

#[derive(Debug)]
pub enum ViewError {
    /// The requested rectangle does not exactly match any attached
    /// monitor's desktop coordinates.
    MonitorNotFound(crate::monitor::MonitorRect),

    /// The OS invalidated the duplication handle (e.g. a full-screen
    /// exclusive application took the output).
    AccessLost,

    /// No desktop frame arrived within the acquire timeout. The monitor
    /// is idle; not an error worth surfacing.
    FrameTimeout,

    /// The source is not bound to an output; frames cannot be produced
    /// until a rebind succeeds.
    NotBound,

    /// This OS generation is not supported by any capture strategy.
    UnsupportedOs { major: u32, minor: u32 },

    /// The compositor process could not be found or could not be
    /// injected into.
    InjectionFailed(String),

    Platform(anyhow::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    InvalidInput,
    Unsupported,
    Transient,
    Fatal,
}

impl ViewError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::MonitorNotFound(_) => ErrorClass::InvalidInput,
            Self::UnsupportedOs { .. } => ErrorClass::Unsupported,
            Self::AccessLost | Self::FrameTimeout | Self::NotBound | Self::InjectionFailed(_) => {
                ErrorClass::Transient
            }
            Self::Platform(_) => ErrorClass::Fatal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.class(), ErrorClass::Transient)
    }
}

impl fmt::Display for ViewError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MonitorNotFound(rect) => write!(
                f,
                "Couldn't find display: x={} y={} w={} h={}",
                rect.left,
                rect.top,
                rect.width(),
                rect.height()
            ),
            Self::AccessLost => write!(f, "desktop duplication access lost"),
            Self::FrameTimeout => write!(f, "no desktop frame arrived within the acquire timeout"),
            Self::NotBound => write!(f, "capture source is not bound to an output"),
            Self::UnsupportedOs { major, minor } => {
                write!(f, "unsupported Windows version {major}.{minor}")
            }
            Self::InjectionFailed(message) => write!(f, "compositor injection failed: {message}"),
            Self::Platform(inner) => write!(f, "{inner}"),
        }
    }
}

impl std::error::Error for ViewError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Platform(inner) => Some(inner.as_ref()),
            _ => None,
        }
    }
}

pub type ViewResult<T> = Result<T, ViewError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::MonitorRect;

    #[test]
    fn transient_errors_are_retryable() {
        assert!(ViewError::AccessLost.is_retryable());
        assert!(ViewError::FrameTimeout.is_retryable());
        assert!(ViewError::InjectionFailed("dwm not running".into()).is_retryable());
        assert!(!ViewError::UnsupportedOs { major: 6, minor: 0 }.is_retryable());
        assert!(!ViewError::Platform(anyhow::anyhow!("boom")).is_retryable());
    }

    #[test]
    fn monitor_not_found_message_names_the_rect() {
        let rect = MonitorRect::from_position_and_size(0, 0, 1920, 1080);
        let message = ViewError::MonitorNotFound(rect).to_string();
        assert!(message.contains("Couldn't find display"));
        assert!(message.contains("w=1920"));
        assert!(message.contains("h=1080"));
    }
}
