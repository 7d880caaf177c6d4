#![forbid(unsafe_code)]

use anyhow::{Context, Result, anyhow};
use std::{
    collections::HashMap,
    env, fmt, fs,
    path::{Path, PathBuf},
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_QUIZGEN_PORT: u16 = 8090;
pub const DEFAULT_QUIZGEN_HOST: &str = "127.0.0.1";
pub const DEFAULT_WWW_ROOT: &str = "www";
pub const DEFAULT_DATA_DIR: &str = "data";
pub const DEFAULT_QUIZ_BASE_URL: &str = "https://quizizz.com";
pub const LOCAL_DB_FILE: &str = "quiztube.db";

/// A credential that must never end up in logs or error messages.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

/// Where persisted playlists and resources live.
#[derive(Debug, Clone, PartialEq)]
pub enum DatabaseTarget {
    Local(PathBuf),
    Remote { url: String, auth_token: Secret },
}

#[derive(Debug, Clone)]
pub struct QuizCredentials {
    pub base_url: String,
    pub cookie: Secret,
    pub csrf_token: Secret,
}

#[derive(Debug, Clone)]
pub struct SheetsCredentials {
    pub access_token: Secret,
    pub share_public: bool,
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub www_root: PathBuf,
    pub data_dir: PathBuf,
    pub host: String,
    pub port: u16,
    pub database: DatabaseTarget,
    pub youtube_api_key: Option<Secret>,
    pub quiz_base_url: String,
    pub quiz: Option<QuizCredentials>,
    pub sheets: Option<SheetsCredentials>,
}

impl RuntimeConfig {
    pub fn require_youtube_key(&self) -> Result<&Secret> {
        self.youtube_api_key
            .as_ref()
            .ok_or_else(|| anyhow!("YOUTUBE_API_KEY not set"))
    }

    pub fn require_quiz(&self) -> Result<&QuizCredentials> {
        self.quiz
            .as_ref()
            .ok_or_else(|| anyhow!("QUIZ_SESSION_COOKIE and QUIZ_CSRF_TOKEN must both be set"))
    }
}

pub fn load_runtime_config() -> Result<RuntimeConfig> {
    resolve_runtime_config(RuntimeOverrides::default())
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub www_root: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub port: Option<u16>,
    pub host: Option<String>,
    pub database_url: Option<String>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_runtime_config(overrides: RuntimeOverrides) -> Result<RuntimeConfig> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    build_runtime_config_with_overrides(&file_vars, env_var_string, overrides)
}

#[cfg(test)]
fn build_runtime_config(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> Result<RuntimeConfig> {
    build_runtime_config_with_overrides(file_vars, env_lookup, RuntimeOverrides::default())
}

fn build_runtime_config_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> Result<RuntimeConfig> {
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);

    let www_root = overrides
        .www_root
        .or_else(|| lookup("WWW_ROOT").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_WWW_ROOT));
    let data_dir = overrides
        .data_dir
        .or_else(|| lookup("DATA_DIR").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
    let port = overrides
        .port
        .or_else(|| lookup("QUIZGEN_PORT").and_then(|value| value.parse::<u16>().ok()))
        .unwrap_or(DEFAULT_QUIZGEN_PORT);
    let host = non_blank(overrides.host)
        .or_else(|| lookup("QUIZGEN_HOST"))
        .unwrap_or_else(|| DEFAULT_QUIZGEN_HOST.to_string());

    let database = match non_blank(overrides.database_url).or_else(|| lookup("DATABASE_URL")) {
        Some(url) => {
            if !is_remote_database_url(&url) {
                return Err(anyhow!(
                    "DATABASE_URL must start with libsql://, https:// or http:// (got {url})"
                ));
            }
            DatabaseTarget::Remote {
                url,
                auth_token: Secret::new(lookup("DATABASE_AUTH_TOKEN").unwrap_or_default()),
            }
        }
        None => DatabaseTarget::Local(data_dir.join(LOCAL_DB_FILE)),
    };

    let quiz_base_url = lookup("QUIZ_BASE_URL")
        .map(|value| value.trim_end_matches('/').to_string())
        .unwrap_or_else(|| DEFAULT_QUIZ_BASE_URL.to_string());
    let quiz = match (lookup("QUIZ_SESSION_COOKIE"), lookup("QUIZ_CSRF_TOKEN")) {
        (Some(cookie), Some(csrf)) => Some(QuizCredentials {
            base_url: quiz_base_url.clone(),
            cookie: Secret::new(cookie),
            csrf_token: Secret::new(csrf),
        }),
        _ => None,
    };

    let sheets = lookup("SHEETS_ACCESS_TOKEN").map(|token| SheetsCredentials {
        access_token: Secret::new(token),
        share_public: lookup("SHEETS_SHARE_PUBLIC")
            .and_then(|value| parse_bool(&value))
            .unwrap_or(true),
    });

    Ok(RuntimeConfig {
        www_root,
        data_dir,
        host,
        port,
        database,
        youtube_api_key: lookup("YOUTUBE_API_KEY").map(Secret::new),
        quiz_base_url,
        quiz,
        sheets,
    })
}

fn is_remote_database_url(url: &str) -> bool {
    ["libsql://", "https://", "http://"]
        .iter()
        .any(|scheme| url.starts_with(scheme))
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn env_var_string(key: &str) -> Option<String> {
    non_blank(env::var(key).ok())
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| non_blank(file_vars.get(key).cloned()))
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .map(|value| value.replace("\\\"", "\"").replace("\\\\", "\\"))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
                    .map(str::to_string)
            })
            .unwrap_or_else(|| value.to_string());
        vars.insert(key.to_string(), value);
    }
    Ok(vars)
}

/// Updates or appends a single env var inside the target file while preserving
/// unrelated lines and comments. Used by `quizgen login` to rotate the quiz
/// session without hand-editing the file.
pub fn upsert_env_value(path: &Path, key: &str, value: &str) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).with_context(|| format!("Creating {}", parent.display()))?;
    }

    let raw = fs::read_to_string(path).unwrap_or_default();
    let mut lines = Vec::new();
    let mut updated = false;
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");

    for line in raw.lines() {
        let trimmed = line.trim_start();
        let indent = &line[..line.len() - trimmed.len()];
        let (prefix, rest) = match trimmed.strip_prefix("export ") {
            Some(stripped) => ("export ", stripped),
            None => ("", trimmed),
        };
        let Some((candidate, _)) = rest.split_once('=') else {
            lines.push(line.to_string());
            continue;
        };
        if candidate.trim() == key {
            lines.push(format!("{indent}{prefix}{key}=\"{escaped}\""));
            updated = true;
        } else {
            lines.push(line.to_string());
        }
    }

    if !updated {
        lines.push(format!("{key}=\"{escaped}\""));
    }

    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, lines.join("\n") + "\n")
        .with_context(|| format!("Writing {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("Replacing {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn make_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", contents).unwrap();
        file
    }

    fn runtime_from(contents: &str) -> RuntimeConfig {
        let cfg = make_config(contents);
        let vars = read_env_file(cfg.path()).unwrap();
        build_runtime_config(&vars, |_| None).unwrap()
    }

    #[test]
    fn defaults_apply_to_empty_file() {
        let runtime = runtime_from("");
        assert_eq!(runtime.port, DEFAULT_QUIZGEN_PORT);
        assert_eq!(runtime.host, DEFAULT_QUIZGEN_HOST);
        assert_eq!(runtime.www_root, PathBuf::from(DEFAULT_WWW_ROOT));
        assert_eq!(
            runtime.database,
            DatabaseTarget::Local(PathBuf::from(DEFAULT_DATA_DIR).join(LOCAL_DB_FILE))
        );
        assert_eq!(runtime.quiz_base_url, DEFAULT_QUIZ_BASE_URL);
        assert!(runtime.youtube_api_key.is_none());
        assert!(runtime.quiz.is_none());
        assert!(runtime.sheets.is_none());
    }

    #[test]
    fn reads_port_host_and_roots() {
        let runtime = runtime_from(
            "QUIZGEN_PORT=\"4242\"\nQUIZGEN_HOST=\"0.0.0.0\"\nWWW_ROOT=\"/srv/www\"\nDATA_DIR=\"/var/q\"\n",
        );
        assert_eq!(runtime.port, 4242);
        assert_eq!(runtime.host, "0.0.0.0");
        assert_eq!(runtime.www_root, PathBuf::from("/srv/www"));
        assert_eq!(
            runtime.database,
            DatabaseTarget::Local(PathBuf::from("/var/q").join(LOCAL_DB_FILE))
        );
    }

    #[test]
    fn invalid_port_defaults() {
        let runtime = runtime_from("QUIZGEN_PORT=\"nope\"\n");
        assert_eq!(runtime.port, DEFAULT_QUIZGEN_PORT);
    }

    #[test]
    fn remote_database_uses_auth_token() {
        let runtime = runtime_from(
            "DATABASE_URL=\"libsql://quiz.example.turso.io\"\nDATABASE_AUTH_TOKEN=\"tok\"\n",
        );
        match runtime.database {
            DatabaseTarget::Remote { url, auth_token } => {
                assert_eq!(url, "libsql://quiz.example.turso.io");
                assert_eq!(auth_token.expose(), "tok");
            }
            other => panic!("expected remote database, got {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_database_scheme() {
        let cfg = make_config("DATABASE_URL=\"postgres://db\"\n");
        let vars = read_env_file(cfg.path()).unwrap();
        let err = build_runtime_config(&vars, |_| None).unwrap_err();
        assert!(err.to_string().contains("DATABASE_URL"));
    }

    #[test]
    fn quiz_credentials_need_cookie_and_csrf() {
        let partial = runtime_from("QUIZ_SESSION_COOKIE=\"a=b\"\n");
        assert!(partial.quiz.is_none());
        assert!(partial.require_quiz().is_err());

        let full = runtime_from(
            "QUIZ_SESSION_COOKIE=\"a=b\"\nQUIZ_CSRF_TOKEN=\"csrf\"\nQUIZ_BASE_URL=\"https://quiz.test/\"\n",
        );
        let quiz = full.require_quiz().unwrap();
        assert_eq!(quiz.base_url, "https://quiz.test");
        assert_eq!(quiz.cookie.expose(), "a=b");
        assert_eq!(quiz.csrf_token.expose(), "csrf");
    }

    #[test]
    fn sheets_share_flag_parses() {
        let runtime = runtime_from("SHEETS_ACCESS_TOKEN=\"ya29\"\nSHEETS_SHARE_PUBLIC=\"no\"\n");
        let sheets = runtime.sheets.unwrap();
        assert_eq!(sheets.access_token.expose(), "ya29");
        assert!(!sheets.share_public);

        let default_share = runtime_from("SHEETS_ACCESS_TOKEN=\"ya29\"\n");
        assert!(default_share.sheets.unwrap().share_public);
    }

    #[test]
    fn secrets_are_redacted_in_debug_output() {
        let runtime = runtime_from(
            "YOUTUBE_API_KEY=\"AIzaSecret\"\nQUIZ_SESSION_COOKIE=\"sid=hidden\"\nQUIZ_CSRF_TOKEN=\"csrf-hidden\"\n",
        );
        let rendered = format!("{runtime:?}");
        assert!(!rendered.contains("AIzaSecret"));
        assert!(!rendered.contains("hidden"));
        assert!(rendered.contains("***"));
    }

    #[test]
    fn env_wins_over_file() {
        let vars = read_env_file(make_config("YOUTUBE_API_KEY=\"file\"\n").path()).unwrap();
        let runtime = build_runtime_config(&vars, |key| {
            if key == "YOUTUBE_API_KEY" {
                Some("env".to_string())
            } else {
                None
            }
        })
        .unwrap();
        assert_eq!(runtime.require_youtube_key().unwrap().expose(), "env");
    }

    #[test]
    fn override_precedence() {
        let mut vars = HashMap::new();
        vars.insert("WWW_ROOT".to_string(), "/file-www".to_string());
        vars.insert("QUIZGEN_HOST".to_string(), "file-host".to_string());
        vars.insert("QUIZGEN_PORT".to_string(), "7000".to_string());
        vars.insert("DATABASE_URL".to_string(), "libsql://file".to_string());

        let overrides = RuntimeOverrides {
            www_root: Some(PathBuf::from("/override-www")),
            port: Some(9000),
            host: Some("   ".into()),
            database_url: Some("https://override".into()),
            ..RuntimeOverrides::default()
        };

        let runtime = build_runtime_config_with_overrides(
            &vars,
            |key| {
                if key == "QUIZGEN_PORT" {
                    Some("8000".to_string())
                } else {
                    None
                }
            },
            overrides,
        )
        .unwrap();

        assert_eq!(runtime.www_root, PathBuf::from("/override-www"));
        assert_eq!(runtime.port, 9000);
        assert_eq!(runtime.host, "file-host");
        assert!(matches!(
            runtime.database,
            DatabaseTarget::Remote { ref url, .. } if url == "https://override"
        ));
    }

    #[test]
    fn read_env_file_handles_export_and_quotes() {
        let cfg = make_config(
            r#"
            export YOUTUBE_API_KEY="key"
            WWW_ROOT='/www'
            QUIZGEN_HOST =  "0.0.0.0"
            QUIZGEN_PORT=9090
            # comment
            INVALID_LINE
            "#,
        );
        let vars = read_env_file(cfg.path()).unwrap();
        assert_eq!(vars.get("YOUTUBE_API_KEY").unwrap(), "key");
        assert_eq!(vars.get("WWW_ROOT").unwrap(), "/www");
        assert_eq!(vars.get("QUIZGEN_HOST").unwrap(), "0.0.0.0");
        assert_eq!(vars.get("QUIZGEN_PORT").unwrap(), "9090");
        assert!(!vars.contains_key("INVALID_LINE"));
    }

    #[test]
    fn read_env_file_missing_file_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let vars = read_env_file(&dir.path().join("missing.env")).unwrap();
        assert!(vars.is_empty());
    }

    #[test]
    fn upsert_env_value_replaces_and_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        fs::write(&path, "# quiz session\nexport QUIZ_CSRF_TOKEN=\"old\"\nOTHER=1\n").unwrap();

        upsert_env_value(&path, "QUIZ_CSRF_TOKEN", "new").unwrap();
        upsert_env_value(&path, "QUIZ_SESSION_COOKIE", "sid=\"x\"").unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.starts_with("# quiz session\n"));
        assert!(raw.contains("export QUIZ_CSRF_TOKEN=\"new\""));
        assert!(raw.contains("OTHER=1"));

        let vars = read_env_file(&path).unwrap();
        assert_eq!(vars.get("QUIZ_CSRF_TOKEN").unwrap(), "new");
        assert_eq!(vars.get("QUIZ_SESSION_COOKIE").unwrap(), "sid=\"x\"");
    }
}
