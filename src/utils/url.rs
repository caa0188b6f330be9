//! Endpoint construction for the local model server.

use reqwest::Url;

/// Trims trailing slashes so endpoints can be appended with a single `/`.
///
/// ```
/// use localchat::utils::url::normalize_base_url;
///
/// assert_eq!(normalize_base_url("http://127.0.0.1:8000/"), "http://127.0.0.1:8000");
/// assert_eq!(normalize_base_url("http://localhost:8000/api//"), "http://localhost:8000/api");
/// ```
pub fn normalize_base_url(base_url: &str) -> String {
    base_url.trim_end_matches('/').to_string()
}

/// Joins `endpoint` onto `base_url` without doubling slashes.
///
/// ```
/// use localchat::utils::url::construct_api_url;
///
/// assert_eq!(
///     construct_api_url("http://127.0.0.1:8000/", "/chat"),
///     "http://127.0.0.1:8000/chat"
/// );
/// ```
pub fn construct_api_url(base_url: &str, endpoint: &str) -> String {
    let endpoint = endpoint.trim_start_matches('/');
    format!("{}/{}", normalize_base_url(base_url), endpoint)
}

/// Builds `<base>/<collection>/<id>/<tail...>` with `id` escaped as a single
/// path segment, so ids containing `/` or spaces cannot change the route.
pub fn resource_url(
    base_url: &str,
    collection: &str,
    id: &str,
    tail: &[&str],
) -> Result<Url, String> {
    let root = construct_api_url(base_url, collection);
    let mut url = Url::parse(&root).map_err(|err| format!("{root}: {err}"))?;
    url.path_segments_mut()
        .map_err(|_| format!("{root}: not a base URL"))?
        .pop_if_empty()
        .push(id)
        .extend(tail);
    Ok(url)
}
