//! Minimal `data:` URL handling shared by the adapters.

/// Split a `data:{mime};base64,{data}` URL into its MIME type and payload.
/// Returns `None` for anything that is not a base64 data URL.
pub fn parse_data_url(url: &str) -> Option<(String, String)> {
    let rest = url.strip_prefix("data:")?;
    let (meta, data) = rest.split_once(',')?;
    let (mime, encoding) = meta.split_once(';')?;
    if encoding != "base64" || mime.is_empty() {
        return None;
    }
    Some((mime.to_string(), data.to_string()))
}

/// Placeholder text used when an image cannot be represented natively.
pub(crate) fn image_placeholder(url: &str) -> String {
    let prefix: String = url.chars().take(50).collect();
    format!("[image: {prefix}...]")
}
