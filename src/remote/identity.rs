//! Station identifier used as the remote directory name

use crate::config::UserConfig;
use regex::Regex;
use std::sync::OnceLock;

fn unsafe_chars() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^A-Za-z0-9_-]").ok()).as_ref()
}

/// `"{name}-{lat}-{lon}"` made filesystem and URL safe.
///
/// Dots become dashes so coordinates stay readable (`52.2` -> `52-2`);
/// anything else outside `[A-Za-z0-9_-]` becomes `_`.
pub fn user_id(user: &UserConfig) -> String {
    let raw = format!("{}-{}-{}", user.name.trim(), user.latitude, user.longitude).replace('.', "-");
    match unsafe_chars() {
        Some(re) => re.replace_all(&raw, "_").into_owned(),
        None => raw,
    }
}
