//! API profile resolution.
//!
//! Profiles live in `~/.sevenbridges/credentials`, an INI file with one
//! section per profile:
//!
//! ```text
//! [default]
//! api_endpoint = https://api.sbgenomics.com/v2
//! auth_token = <TOKEN>
//! ```
//!
//! `SB_API_ENDPOINT` and `SB_AUTH_TOKEN` override whatever the file says.

use anyhow::{Context, Result, anyhow};
use std::{env, fs, path::Path};

pub const DEFAULT_ENDPOINT: &str = "https://api.sbgenomics.com/v2";
const ENDPOINT_ENV: &str = "SB_API_ENDPOINT";
const TOKEN_ENV: &str = "SB_AUTH_TOKEN";

#[derive(Clone, PartialEq, Eq)]
pub struct ApiProfile {
    pub name: String,
    pub endpoint: String,
    pub auth_token: String,
}

impl std::fmt::Debug for ApiProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiProfile")
            .field("name", &self.name)
            .field("endpoint", &self.endpoint)
            .field("auth_token", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct ProfileEntry {
    endpoint: Option<String>,
    auth_token: Option<String>,
}

impl ApiProfile {
    /// Resolve `profile` from the environment and the user's credentials file.
    pub fn load(profile: &str) -> Result<Self> {
        let from_file = match dirs_next::home_dir() {
            Some(home) => read_credentials(&home.join(".sevenbridges").join("credentials"), profile)?,
            None => ProfileEntry::default(),
        };
        Self::resolve(
            profile,
            from_file,
            env::var(ENDPOINT_ENV).ok(),
            env::var(TOKEN_ENV).ok(),
        )
    }

    /// Parse `profile` out of credentials text, without consulting the environment.
    pub fn from_credentials_text(text: &str, profile: &str) -> Result<Self> {
        Self::resolve(profile, parse_credentials(text, profile), None, None)
    }

    fn resolve(
        profile: &str,
        entry: ProfileEntry,
        endpoint_override: Option<String>,
        token_override: Option<String>,
    ) -> Result<Self> {
        let endpoint = endpoint_override
            .filter(|v| !v.trim().is_empty())
            .or(entry.endpoint)
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());
        let auth_token = token_override
            .filter(|v| !v.trim().is_empty())
            .or(entry.auth_token)
            .ok_or_else(|| {
                anyhow!(
                    "no auth token for API profile '{profile}'; set {TOKEN_ENV} or add auth_token to ~/.sevenbridges/credentials"
                )
            })?;
        Ok(ApiProfile {
            name: profile.to_string(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            auth_token,
        })
    }
}

fn read_credentials(path: &Path, profile: &str) -> Result<ProfileEntry> {
    if !path.exists() {
        return Ok(ProfileEntry::default());
    }
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    Ok(parse_credentials(&text, profile))
}

fn parse_credentials(text: &str, profile: &str) -> ProfileEntry {
    let mut entry = ProfileEntry::default();
    let mut in_profile = false;
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(section) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            in_profile = section.trim() == profile;
            continue;
        }
        if !in_profile {
            continue;
        }
        let Some((key, value)) = line.split_once('=').or_else(|| line.split_once(':')) else {
            continue;
        };
        let value = value.trim().to_string();
        match key.trim() {
            "api_endpoint" | "api_url" => entry.endpoint = Some(value),
            "auth_token" => entry.auth_token = Some(value),
            _ => {}
        }
    }
    entry
}

#[cfg(test)]
mod tests {
    use super::*;

    const CREDENTIALS: &str = "\
[default]
api_endpoint = https://api.sbgenomics.com/v2/
auth_token = aaaa

# cancer genomics cloud
[cgc]
api_endpoint = https://cgc-api.sbgenomics.com/v2
auth_token = bbbb
";

    #[test]
    fn picks_requested_section() {
        let profile = ApiProfile::from_credentials_text(CREDENTIALS, "cgc").unwrap();
        assert_eq!(profile.endpoint, "https://cgc-api.sbgenomics.com/v2");
        assert_eq!(profile.auth_token, "bbbb");
    }

    #[test]
    fn trailing_slash_is_trimmed() {
        let profile = ApiProfile::from_credentials_text(CREDENTIALS, "default").unwrap();
        assert_eq!(profile.endpoint, "https://api.sbgenomics.com/v2");
    }

    #[test]
    fn missing_profile_has_no_token() {
        let err = ApiProfile::from_credentials_text(CREDENTIALS, "nope").unwrap_err();
        assert!(err.to_string().contains("no auth token"));
    }

    #[test]
    fn environment_overrides_file() {
        let entry = parse_credentials(CREDENTIALS, "default");
        let profile = ApiProfile::resolve(
            "default",
            entry,
            Some("http://localhost:8080/v2".to_string()),
            Some("cccc".to_string()),
        )
        .unwrap();
        assert_eq!(profile.endpoint, "http://localhost:8080/v2");
        assert_eq!(profile.auth_token, "cccc");
    }

    #[test]
    fn debug_redacts_token() {
        let profile = ApiProfile::from_credentials_text(CREDENTIALS, "default").unwrap();
        assert!(!format!("{profile:?}").contains("aaaa"));
    }
}
