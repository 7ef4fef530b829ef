//! Provider credential resolution.
//!
//! An API key may be given inline, as a file (the Docker secrets layout),
//! or as the name of an environment variable. The first non-empty source
//! wins, in that order.

use std::path::PathBuf;

use secrecy::SecretString;

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("No secret source configured (set one of: inline value, file, env var)")]
    NoSourceProvided,

    #[error("Failed to read secret from file '{path}': {source}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Secret file '{path}' is empty")]
    EmptyFile { path: PathBuf },

    #[error("Environment variable '{name}' not set")]
    EnvVarNotSet { name: String },

    #[error("Environment variable '{name}' contains invalid UTF-8")]
    EnvVarNotUnicode { name: String },
}

pub type Result<T> = std::result::Result<T, SecretError>;

/// Resolves a secret from the first configured source.
pub fn resolve_secret(
    direct: Option<&str>,
    file_path: Option<&str>,
    env_var: Option<&str>,
) -> Result<SecretString> {
    if let Some(value) = non_empty(direct) {
        return Ok(SecretString::from(value.to_string()));
    }

    if let Some(path) = non_empty(file_path) {
        let path = expand_home(path);
        let content = std::fs::read_to_string(&path).map_err(|source| SecretError::FileRead {
            path: path.clone(),
            source,
        })?;
        let trimmed = content.trim();
        if trimmed.is_empty() {
            return Err(SecretError::EmptyFile { path });
        }
        return Ok(SecretString::from(trimmed.to_string()));
    }

    if let Some(name) = non_empty(env_var) {
        return match std::env::var(name) {
            Ok(value) => Ok(SecretString::from(value.trim().to_string())),
            Err(std::env::VarError::NotPresent) => Err(SecretError::EnvVarNotSet {
                name: name.to_string(),
            }),
            Err(std::env::VarError::NotUnicode(_)) => Err(SecretError::EnvVarNotUnicode {
                name: name.to_string(),
            }),
        };
    }

    Err(SecretError::NoSourceProvided)
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

/// Expands a leading `~` or `~/` to the home directory. `~user` is left alone.
pub fn expand_home(path: &str) -> PathBuf {
    let rest = if path == "~" {
        Some("")
    } else {
        path.strip_prefix("~/")
    };
    match (rest, dirs::home_dir()) {
        (Some(rest), Some(home)) if rest.is_empty() => home,
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const TEST_VAR: &str = "CITYWEATHER_TEST_API_KEY";

    #[test]
    #[serial]
    fn test_inline_value_wins() {
        std::env::set_var(TEST_VAR, "from-env");
        let secret = resolve_secret(Some("inline"), Some("/nonexistent"), Some(TEST_VAR)).unwrap();
        assert_eq!(secret.expose_secret(), "inline");
        std::env::remove_var(TEST_VAR);
    }

    #[test]
    #[serial]
    fn test_file_wins_over_env() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "  from-file  ").unwrap();
        std::env::set_var(TEST_VAR, "from-env");

        let path = file.path().to_string_lossy().to_string();
        let secret = resolve_secret(None, Some(&path), Some(TEST_VAR)).unwrap();
        assert_eq!(secret.expose_secret(), "from-file");
        std::env::remove_var(TEST_VAR);
    }

    #[test]
    #[serial]
    fn test_env_fallback() {
        std::env::set_var(TEST_VAR, "from-env\n");
        let secret = resolve_secret(Some(""), None, Some(TEST_VAR)).unwrap();
        assert_eq!(secret.expose_secret(), "from-env");
        std::env::remove_var(TEST_VAR);
    }

    #[test]
    #[serial]
    fn test_env_not_set() {
        std::env::remove_var(TEST_VAR);
        assert!(matches!(
            resolve_secret(None, None, Some(TEST_VAR)),
            Err(SecretError::EnvVarNotSet { .. })
        ));
    }

    #[test]
    fn test_no_source() {
        assert!(matches!(
            resolve_secret(None, Some("  "), None),
            Err(SecretError::NoSourceProvided)
        ));
    }

    #[test]
    fn test_missing_and_empty_files() {
        assert!(matches!(
            resolve_secret(None, Some("/nonexistent/cityweather/key"), None),
            Err(SecretError::FileRead { .. })
        ));

        let file = NamedTempFile::new().unwrap();
        let path = file.path().to_string_lossy().to_string();
        assert!(matches!(
            resolve_secret(None, Some(&path), None),
            Err(SecretError::EmptyFile { .. })
        ));
    }

    #[test]
    fn test_expand_home() {
        let home = dirs::home_dir().unwrap();
        assert_eq!(expand_home("~"), home);
        assert_eq!(expand_home("~/keys/owm"), home.join("keys/owm"));
        assert_eq!(expand_home("/etc/owm"), PathBuf::from("/etc/owm"));
        assert_eq!(expand_home("~alice/x"), PathBuf::from("~alice/x"));
    }
}
