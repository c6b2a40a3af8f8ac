use mnemo_common::{Error, ErrorKind};
use tracing::error;

/// Map an error to the short, kind-specific message shown to the user.
/// Internal identifiers never leak through here.
pub fn user_reply_for(err: &Error) -> String {
    match err {
        Error::RateLimited { retry_after_secs } => format!(
            "You're sending messages too quickly. Please wait {retry_after_secs} seconds before trying again."
        ),
        Error::Unauthorized(_) => {
            "You don't have permission to do that. Please try something else.".to_string()
        }
        other => match other.kind() {
            ErrorKind::Storage => {
                "I'm having trouble accessing my memory right now. Please try again later."
                    .to_string()
            }
            ErrorKind::RemoteApi => {
                "I'm having trouble connecting to my AI brain. Please try again in a moment."
                    .to_string()
            }
            ErrorKind::UserInput => {
                "I couldn't understand that input. Could you try again?".to_string()
            }
            ErrorKind::Config => {
                "There's a configuration issue with my system. Please contact support."
                    .to_string()
            }
            ErrorKind::Feature => {
                "That feature isn't available right now. Please try something else.".to_string()
            }
            ErrorKind::Policy | ErrorKind::Other => {
                "Something went wrong. Please try again later.".to_string()
            }
        },
    }
}

/// Log an error with detail controlled by a single verbosity knob:
/// 0 = nothing, 1 = message, 2 = message with kind, 3 = full debug detail.
pub fn report_error(err: &Error, detail_level: u8) {
    match detail_level {
        0 => {}
        1 => error!("handler error: {err}"),
        2 => error!(kind = ?err.kind(), "handler error: {err}"),
        _ => error!(kind = ?err.kind(), detail = ?err, "handler error: {err}"),
    }
}
