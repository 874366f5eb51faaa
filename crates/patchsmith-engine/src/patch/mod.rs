pub mod apply;
pub mod parse;
pub mod validate;

pub use apply::{apply, classify_apply_error, create_rollback, rollback, ApplyError, ApplyFailure};
pub use parse::{detect_context_request, parse_payload, ParseContext, ParseError, ParseErrorKind, ParseMode};
pub use validate::{check_paths, check_quality, AuthorizationError};
