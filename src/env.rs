//! Typed accessors for the orchestrator's environment variables: one
//! named function per variable instead of scattered `std::env::var`
//! calls scattered through the codebase.

use std::env;

/// Base URL of the content-source service (battery/criteria provider).
pub const CONTENT_SOURCE_URL: &str = "STORYBENCH_CONTENT_SOURCE_URL";

/// Bearer token for the content-source service.
pub const CONTENT_SOURCE_TOKEN: &str = "STORYBENCH_CONTENT_SOURCE_TOKEN";

/// Connection URI for the artifact store (e.g. a SQLite file path).
pub const ARTIFACT_STORE_URI: &str = "STORYBENCH_STORE_URI";

/// Returns the named environment variable, or `None` if unset or not
/// valid UTF-8.
#[must_use]
pub fn string(name: &str) -> Option<String> {
    env::var(name).ok()
}

/// Returns the API key environment variable conventionally named for a
/// provider tag, e.g. `provider_api_key("openai")` reads
/// `STORYBENCH_OPENAI_API_KEY`.
#[must_use]
pub fn provider_api_key(provider_tag: &str) -> Option<String> {
    let var_name = format!("STORYBENCH_{}_API_KEY", provider_tag.to_uppercase());
    string(&var_name)
}
