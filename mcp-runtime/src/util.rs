use serde::Deserialize;

/// Credentials stored at `<config_dir>/zephyr-mcp/config.json`. Written by
/// hand or by provisioning tooling; this runtime only reads it.
#[derive(Debug, Deserialize)]
pub struct StoredCredentials {
    pub api_token: String,
}

pub fn client() -> reqwest::Client {
    reqwest::Client::new()
}

pub fn config_path() -> std::path::PathBuf {
    let config_dir = dirs::config_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join("zephyr-mcp");
    config_dir.join("config.json")
}

pub fn load_credentials() -> Option<StoredCredentials> {
    let path = config_path();
    let data = std::fs::read_to_string(&path).ok()?;
    serde_json::from_str(&data).ok()
}

/// Resolves the API bearer token: `ZEPHYR_API_TOKEN`, then the stored
/// credentials file. Zephyr tokens are static, so there is no refresh flow.
pub fn resolve_token() -> Result<String, Box<dyn std::error::Error>> {
    if let Ok(token) = std::env::var("ZEPHYR_API_TOKEN") {
        return Ok(token);
    }

    if let Some(creds) = load_credentials() {
        return Ok(creds.api_token);
    }

    Err(format!(
        "No credentials found. Set ZEPHYR_API_TOKEN, pass --token, or store a token at {}.",
        config_path().display()
    )
    .into())
}
