//! Connect URL construction.

use url::Url;

use crate::application::ports::BearerToken;

/// Errors building a connect URL.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectUrlError {
    /// Base URL cannot carry path segments (e.g. `mailto:`).
    #[error("streaming base URL cannot be a base: {0}")]
    NotABase(String),
}

/// Build `{base}/connect?contextId=..[&authorization=BEARER ..][&messageid=..]`.
///
/// `last_message_id` is only passed on reconnect so the server can replay
/// anything sent after it.
///
/// # Errors
///
/// Returns an error when `base` cannot carry path segments.
pub fn connect_url(
    base: &Url,
    context_id: &str,
    token: Option<&BearerToken>,
    last_message_id: Option<u64>,
) -> Result<Url, ConnectUrlError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|()| ConnectUrlError::NotABase(base.to_string()))?
        .pop_if_empty()
        .push("connect");

    {
        let mut query = url.query_pairs_mut();
        query.clear();
        query.append_pair("contextId", context_id);
        if let Some(token) = token {
            query.append_pair("authorization", &format!("BEARER {}", token.expose()));
        }
        if let Some(message_id) = last_message_id {
            query.append_pair("messageid", &message_id.to_string());
        }
    }

    Ok(url)
}
