//! W3C-style trace context carried through the `Traceparent` header and the
//! `TRACEPARENT` environment variable. Only used for log correlation.

use std::sync::OnceLock;

pub const TRACEPARENT_ENV: &str = "TRACEPARENT";

static CURRENT: OnceLock<String> = OnceLock::new();

/// Adopts the inherited trace context, or starts a new trace.
pub fn init_from_env() -> &'static str {
    CURRENT.get_or_init(|| {
        std::env::var(TRACEPARENT_ENV)
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(generate)
    })
}

pub fn current() -> Option<&'static str> {
    CURRENT.get().map(String::as_str)
}

pub fn generate() -> String {
    let trace = uuid::Uuid::new_v4().simple().to_string();
    format!("00-{trace}-{}-01", span_id())
}

/// Same trace, fresh span id. Falls back to a new trace for foreign formats.
pub fn child_of(parent: &str) -> String {
    let mut parts = parent.split('-');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(version), Some(trace), Some(_), Some(flags)) if trace.len() == 32 => {
            format!("{version}-{trace}-{}-{flags}", span_id())
        }
        _ => generate(),
    }
}

fn span_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(16);
    id
}
