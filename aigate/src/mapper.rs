/// Split a full model ID (`provider/model`) into (provider, short_id).
///
/// The short ID may itself contain slashes (e.g. versioned Google model
/// names), so only the first separator is significant.
pub fn split_model_id(full_id: &str) -> Option<(&str, &str)> {
    let slash = full_id.find('/')?;
    if slash == 0 || slash == full_id.len() - 1 {
        return None;
    }
    Some((&full_id[..slash], &full_id[slash + 1..]))
}

/// Add the provider prefix to a short model ID.
pub fn join_model_id(provider: &str, short_id: &str) -> String {
    format!("{}/{}", provider, short_id)
}
