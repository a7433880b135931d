/// Get environment variable with BILLFLOW_ prefix, falling back to unprefixed version
///
/// Checks `BILLFLOW_{key}` first, then `{key}`, so deployments can use either
/// namespaced variables or the vendor-conventional names (`STRIPE_WEBHOOK_SECRET`).
///
/// # Examples
///
/// ```rust,ignore
/// use billflow::utils::get_env_with_prefix;
///
/// // Checks BILLFLOW_PORT first, then PORT
/// let port = get_env_with_prefix("PORT");
/// ```
pub fn get_env_with_prefix(key: &str) -> Option<String> {
    std::env::var(format!("BILLFLOW_{}", key))
        .or_else(|_| std::env::var(key))
        .ok()
}

/// Parse a prefixed environment variable, ignoring values that fail to parse.
pub fn parse_env_with_prefix<T: std::str::FromStr>(key: &str) -> Option<T> {
    get_env_with_prefix(key).and_then(|v| v.trim().parse().ok())
}
