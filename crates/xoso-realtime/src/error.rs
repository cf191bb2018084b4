use thiserror::Error;

/// Input rejected before any network call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Tin nhắn không được để trống")]
    Empty,
    #[error("Tin nhắn không được vượt quá {max} ký tự")]
    TooLong { max: usize },
    #[error("Tin nhắn chứa từ ngữ không phù hợp")]
    Profane,
}

/// Failures of a REST call against the backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("Phiên đăng nhập đã hết hạn")]
    Unauthorized,
    #[error("{0}")]
    Forbidden(String),
    #[error("Bạn thao tác quá nhanh, vui lòng chờ một lát")]
    RateLimited,
    #[error("Máy chủ trả về lỗi {status}: {message}")]
    Status { status: u16, message: String },
    #[error("Hết thời gian chờ phản hồi từ máy chủ")]
    Timeout,
    #[error("Không thể kết nối tới máy chủ: {0}")]
    Transport(String),
    #[error("Phản hồi không hợp lệ: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if e.is_decode() {
            Self::Decode(e.to_string())
        } else {
            Self::Transport(e.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Api(#[from] ApiError),

    /// The socket server refused the credential.
    #[error("Xác thực thất bại: {0}")]
    Auth(String),

    /// Socket transport failure, retried by the reconnect policy.
    #[error("Mất kết nối: {0}")]
    Connectivity(String),

    #[error("Chưa kết nối tới máy chủ")]
    NotConnected,

    /// The owning session was closed while the operation was in flight.
    #[error("Thao tác đã bị huỷ")]
    Cancelled,

    #[error("Dữ liệu sự kiện không hợp lệ: {0}")]
    InvalidEvent(String),

    /// Likes, replies and deletes only exist on event comment streams.
    #[error("Thao tác không hỗ trợ trong phòng này")]
    Unsupported,
}

/// What the caller should do with an error, per the UI error policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Banner {
    /// Clear the session and go to the login page.
    SessionExpired,
    /// Inline, dismissible message next to the input.
    Inline(String),
    /// Nothing to show.
    Silent,
}

impl ClientError {
    pub fn is_session_expired(&self) -> bool {
        matches!(self, Self::Auth(_) | Self::Api(ApiError::Unauthorized))
    }

    pub fn banner(&self) -> Banner {
        if self.is_session_expired() {
            return Banner::SessionExpired;
        }
        match self {
            Self::Cancelled => Banner::Silent,
            other => Banner::Inline(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_failures_map_to_session_expiry() {
        assert_eq!(
            ClientError::Auth("Authentication error".into()).banner(),
            Banner::SessionExpired
        );
        assert_eq!(
            ClientError::Api(ApiError::Unauthorized).banner(),
            Banner::SessionExpired
        );
        assert!(!ClientError::Connectivity("reset".into()).is_session_expired());
    }

    #[test]
    fn profane_input_message() {
        let err = ClientError::from(ValidationError::Profane);
        assert_eq!(
            err.banner(),
            Banner::Inline("Tin nhắn chứa từ ngữ không phù hợp".into())
        );
    }

    #[test]
    fn rate_limit_does_not_suggest_retry() {
        let text = ApiError::RateLimited.to_string();
        assert!(text.contains("chờ"));
        assert!(!text.to_lowercase().contains("thử lại"));
    }

    #[test]
    fn cancelled_is_silent() {
        assert_eq!(ClientError::Cancelled.banner(), Banner::Silent);
    }
}
