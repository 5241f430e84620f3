//! Operator credentials file
//!
//! An optional JSON file loaded once at startup. It must be private (mode
//! 0600); a world- or group-readable file is refused. Providers with
//! `autoload_models` set are probed via the OpenAI-compatible `/v1/models`
//! listing and every returned id is registered disabled-by-default unless
//! explicitly listed.

use std::path::Path;

use serde::Deserialize;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum CredentialsError {
    #[error("cannot read credentials file: {0}")]
    Io(#[from] std::io::Error),

    #[error("credentials file must be mode 0600 (found {0:o})")]
    Permissions(u32),

    #[error("malformed credentials file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("unknown provider type {0:?}")]
    UnknownKind(String),

    #[error("model autoload failed: {0}")]
    Autoload(String),
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderEntry {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub autoload_models: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelEntry {
    pub id: String,
    pub provider_id: String,
    #[serde(default)]
    pub weight: i64,
    pub max_context_tokens: u32,
    pub input_per_1k: f64,
    pub output_per_1k: f64,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CredentialsFile {
    #[serde(default)]
    pub providers: Vec<ProviderEntry>,
    #[serde(default)]
    pub models: Vec<ModelEntry>,
}

impl CredentialsFile {
    /// Parse the file at `path`, refusing permissive modes.
    pub fn load(path: &Path) -> Result<Self, CredentialsError> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(path)?.permissions().mode() & 0o777;
            if mode & 0o077 != 0 {
                return Err(CredentialsError::Permissions(mode));
            }
        }
        let content = std::fs::read_to_string(path)?;
        let parsed: CredentialsFile = serde_json::from_str(&content)?;
        info!(
            providers = parsed.providers.len(),
            models = parsed.models.len(),
            path = %path.display(),
            "credentials file loaded"
        );
        Ok(parsed)
    }
}

/// Probe an OpenAI-compatible `/models` listing and return the model ids it
/// advertises.
pub async fn autoload_model_ids(
    client: &reqwest::Client,
    base_url: &str,
    api_key: Option<&str>,
) -> Result<Vec<String>, CredentialsError> {
    #[derive(Deserialize)]
    struct Listing {
        #[serde(default)]
        data: Vec<ListedModel>,
    }
    #[derive(Deserialize)]
    struct ListedModel {
        id: String,
    }

    let url = format!("{}/models", base_url.trim_end_matches('/'));
    let mut request = client.get(&url);
    if let Some(key) = api_key {
        request = request.bearer_auth(key);
    }
    let response = request
        .send()
        .await
        .map_err(|e| CredentialsError::Autoload(e.to_string()))?;
    if !response.status().is_success() {
        return Err(CredentialsError::Autoload(format!(
            "{url} returned HTTP {}",
            response.status()
        )));
    }
    let listing: Listing = response
        .json()
        .await
        .map_err(|e| CredentialsError::Autoload(e.to_string()))?;
    Ok(listing.data.into_iter().map(|m| m.id).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &tempfile::TempDir, content: &str, mode: u32) -> std::path::PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.path().join("credentials.json");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).unwrap();
        path
    }

    const SAMPLE: &str = r#"{
        "providers": [
            {"id": "openai", "type": "openai", "base_url": "https://api.openai.com/v1",
             "api_key": "sk-test", "autoload_models": true}
        ],
        "models": [
            {"id": "gpt-4o", "provider_id": "openai", "weight": 5,
             "max_context_tokens": 128000, "input_per_1k": 0.0025, "output_per_1k": 0.01}
        ]
    }"#;

    #[test]
    fn loads_private_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, SAMPLE, 0o600);
        let parsed = CredentialsFile::load(&path).unwrap();
        assert_eq!(parsed.providers.len(), 1);
        assert!(parsed.providers[0].autoload_models);
        assert_eq!(parsed.models[0].id, "gpt-4o");
        assert!(parsed.models[0].enabled);
    }

    #[test]
    fn rejects_world_readable_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, SAMPLE, 0o644);
        let err = CredentialsFile::load(&path).unwrap_err();
        assert!(matches!(err, CredentialsError::Permissions(_)));
    }
}
