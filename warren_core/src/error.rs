use crate::methods::{ClassId, MethodId, ReplyCode, ReplyText};

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("fatal error")]
    Fatal,
    #[error("{0}")]
    ConException(#[from] ConException),
    #[error("{0}")]
    ChannelException(#[from] ChannelException),
    #[error("Graceful connection closing requested")]
    GracefullyClosed,
}

/// An error that closes the whole connection, reply codes per AMQP 0-9-1.
#[derive(Debug, thiserror::Error)]
pub enum ConException {
    #[error("320 Connection forced")]
    ConnectionForced,
    #[error("402 Invalid path")]
    InvalidPath,
    #[error("403 Access refused")]
    AccessRefused,
    #[error("501 Frame error")]
    FrameError,
    /// A method was received but there was a syntax error. The string stores where it occurred.
    #[error("502 Syntax error | {0:?}")]
    SyntaxError(Vec<String>),
    #[error("503 Command invalid")]
    CommandInvalid,
    #[error("504 Channel error")]
    ChannelError,
    #[error("505 Unexpected Frame")]
    UnexpectedFrame,
    #[error("506 Resource Error")]
    ResourceError,
    #[error("530 Not allowed")]
    NotAllowed,
    #[error("540 Not implemented. '{0}'")]
    NotImplemented(&'static str),
    #[error("541 Internal error")]
    InternalError,
}

impl ConException {
    pub fn reply_code(&self) -> ReplyCode {
        match self {
            ConException::ConnectionForced => 320,
            ConException::InvalidPath => 402,
            ConException::AccessRefused => 403,
            ConException::FrameError => 501,
            ConException::SyntaxError(_) => 502,
            ConException::CommandInvalid => 503,
            ConException::ChannelError => 504,
            ConException::UnexpectedFrame => 505,
            ConException::ResourceError => 506,
            ConException::NotAllowed => 530,
            ConException::NotImplemented(_) => 540,
            ConException::InternalError => 541,
        }
    }

    pub fn reply_text(&self) -> ReplyText {
        match self {
            ConException::ConnectionForced => "connection-forced",
            ConException::InvalidPath => "invalid-path",
            ConException::AccessRefused => "access-refused",
            ConException::FrameError => "frame-error",
            ConException::SyntaxError(_) => "syntax-error",
            ConException::CommandInvalid => "command-invalid",
            ConException::ChannelError => "channel-error",
            ConException::UnexpectedFrame => "unexpected-frame",
            ConException::ResourceError => "resource-error",
            ConException::NotAllowed => "not-allowed",
            ConException::NotImplemented(_) => "not-implemented",
            ConException::InternalError => "internal-error",
        }
        .to_owned()
    }
}

/// An error that closes the channel it occurred on but leaves the rest of
/// the connection running.
#[derive(Debug, thiserror::Error)]
pub enum ChannelException {
    #[error("311 Content too large")]
    ContentTooLarge,
    #[error("313 No consumers")]
    NoConsumers,
    #[error("403 Access refused")]
    AccessRefused,
    #[error("404 Not found")]
    NotFound,
    #[error("405 Resource locked")]
    ResourceLocked,
    #[error("406 Precondition failed")]
    PreconditionFailed,
    #[error("530 Not allowed")]
    NotAllowed,
    #[error("541 Internal error")]
    InternalError,
}

impl ChannelException {
    pub fn reply_code(&self) -> ReplyCode {
        match self {
            ChannelException::ContentTooLarge => 311,
            ChannelException::NoConsumers => 313,
            ChannelException::AccessRefused => 403,
            ChannelException::NotFound => 404,
            ChannelException::ResourceLocked => 405,
            ChannelException::PreconditionFailed => 406,
            ChannelException::NotAllowed => 530,
            ChannelException::InternalError => 541,
        }
    }

    pub fn reply_text(&self) -> ReplyText {
        match self {
            ChannelException::ContentTooLarge => "content-too-large",
            ChannelException::NoConsumers => "no-consumers",
            ChannelException::AccessRefused => "access-refused",
            ChannelException::NotFound => "not-found",
            ChannelException::ResourceLocked => "resource-locked",
            ChannelException::PreconditionFailed => "precondition-failed",
            ChannelException::NotAllowed => "not-allowed",
            ChannelException::InternalError => "internal-error",
        }
        .to_owned()
    }

    /// The `channel.close` payload announcing this exception to the client.
    pub fn close_method(&self, class_id: ClassId, method_id: MethodId) -> crate::methods::ChannelClose {
        crate::methods::ChannelClose {
            reply_code: self.reply_code(),
            reply_text: self.reply_text(),
            class_id,
            method_id,
        }
    }
}
