use anyhow::{Context, Result};
use llmux_core::config::mask_secret;
use llmux_core::{LlmuxConfig, ProviderKind};
use std::path::{Path, PathBuf};
use tracing::warn;

pub const DEFAULT_CONFIG: &str = include_str!("../../../config/default.toml");

pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".llmux")
}

pub fn config_path(custom_path: &Option<PathBuf>) -> PathBuf {
    custom_path
        .clone()
        .unwrap_or_else(|| config_dir().join("config.toml"))
}

pub fn load(custom_path: &Option<PathBuf>) -> Result<LlmuxConfig> {
    load_from(&config_path(custom_path))
}

pub fn load_from(path: &Path) -> Result<LlmuxConfig> {
    // Config may hold literal API keys
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(metadata) = std::fs::metadata(path) {
            let mode = metadata.permissions().mode();
            if mode & 0o077 != 0 {
                return Err(anyhow::anyhow!(
                    "Config file {:?} has overly permissive permissions ({:o}). \
                     It may contain secrets. Fix with: chmod 600 {:?}",
                    path,
                    mode & 0o777,
                    path
                ));
            }
        }
    }

    let content = std::fs::read_to_string(path).with_context(|| {
        format!(
            "Failed to read config at {}. Run `llmux init` first.",
            path.display()
        )
    })?;

    let config = LlmuxConfig::from_toml_str(&content)
        .with_context(|| format!("Failed to parse config at {}", path.display()))?;

    for (id, provider) in &config.providers {
        let Some(key) = &provider.api_key else {
            continue;
        };
        if !key.is_empty() && !key.contains("${") {
            let var = match provider.kind {
                ProviderKind::Anthropic => "ANTHROPIC_API_KEY",
                ProviderKind::OpenAi => "OPENAI_API_KEY",
                _ => "YOUR_API_KEY",
            };
            warn!(
                "API key for '{}' is hardcoded in config file. \
                 For security, use environment variables: api_key = \"${{{}}}\"",
                id,
                var
            );
        }
    }

    Ok(config)
}

/// Write the default config unless one exists; returns whether it was created
pub fn write_default(path: &Path) -> Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create config dir: {}", parent.display()))?;
    }
    std::fs::write(path, DEFAULT_CONFIG)
        .with_context(|| format!("Failed to write config at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(true)
}

/// Render the config with every credential masked
pub fn render_masked(config: &LlmuxConfig) -> Result<String> {
    let mut shown = config.clone();
    for provider in shown.providers.values_mut() {
        if let Some(key) = provider.api_key.as_mut() {
            *key = mask_secret(key);
        }
    }
    shown
        .to_toml_string()
        .context("Failed to render config")
}
