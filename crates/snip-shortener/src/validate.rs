use snip_core::ShortenerError;
use url::Url;

/// Longest original URL accepted for shortening.
pub const MAX_URL_LENGTH: usize = 2048;

/// Checks that `raw` is an absolute http(s) URL with a dotted host.
///
/// The raw text is inspected before parsing: URLs are stored as given, so
/// characters the parser would silently escape are rejected outright.
pub fn validate_url(raw: &str) -> Result<(), ShortenerError> {
    if raw.is_empty() {
        return Err(ShortenerError::InvalidUrl("url cannot be empty".to_string()));
    }

    if raw.chars().count() > MAX_URL_LENGTH {
        return Err(ShortenerError::InvalidUrl(format!(
            "url is longer than {MAX_URL_LENGTH} characters"
        )));
    }

    if let Some(c) = raw
        .chars()
        .find(|c| matches!(c, ' ' | '#' | '%') || c.is_control())
    {
        return Err(ShortenerError::InvalidUrl(format!(
            "url contains forbidden character {c:?}"
        )));
    }

    let url = Url::parse(raw).map_err(|e| ShortenerError::InvalidUrl(format!("{raw}: {e}")))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(ShortenerError::InvalidUrl(format!(
            "url scheme must be http or https: {}",
            url.scheme()
        )));
    }

    match url.host_str() {
        Some(host) if host.contains('.') => Ok(()),
        _ => Err(ShortenerError::InvalidUrl(format!(
            "url must have a dotted host: {raw}"
        ))),
    }
}
