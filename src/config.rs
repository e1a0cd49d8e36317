use std::collections::HashMap;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::AppError;

/// Prefix shared by every environment variable the service reads
pub const ENV_PREFIX: &str = "GOKAPI_";

const DEFAULT_PORT: u16 = 53842;
const DEFAULT_REDIRECT_URL: &str = "https://github.com/Forceu/Gokapi/";
const MIN_LENGTH_ID: i64 = 5;
const MIN_MAX_MEMORY_MB: i64 = 5;
const MAX_LENGTH_ID: i64 = 128;
const REDACTED: &str = "********";

/// Source of raw environment values. Absence is a normal state for every key.
pub trait EnvSource {
    fn lookup(&self, key: &str) -> Option<String>;
}

/// Reads from the real process environment
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn lookup(&self, key: &str) -> Option<String> {
        std::env::var_os(key).map(|v| v.to_string_lossy().into_owned())
    }
}

impl EnvSource for HashMap<String, String> {
    fn lookup(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}

/// A setting that can be switched on, off, or left unconfigured
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum TriState {
    #[serde(rename = "yes")]
    Yes,
    #[serde(rename = "no")]
    No,
    #[default]
    #[serde(rename = "")]
    Unset,
}

impl TriState {
    /// Case-insensitive parse; anything unrecognised is `Unset`
    pub fn parse(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "true" | "yes" => TriState::Yes,
            "false" | "no" => TriState::No,
            _ => TriState::Unset,
        }
    }
}

/// Built-in fallback values, keyed by the variable name without prefix
#[derive(Clone, Debug)]
pub struct Defaults {
    strings: HashMap<&'static str, &'static str>,
    ints: HashMap<&'static str, i64>,
}

impl Defaults {
    pub fn builtin() -> Self {
        let strings = HashMap::from([
            ("CONFIG_DIR", "config"),
            ("CONFIG_FILE", "config.json"),
            ("DATA_DIR", "data"),
        ]);
        let ints = HashMap::from([("LENGTH_ID", 15), ("MAX_MEMORY_UPLOAD_MB", 20)]);
        Self { strings, ints }
    }

    pub fn get_string(&self, name: &str) -> String {
        self.strings.get(name).map(|s| s.to_string()).unwrap_or_default()
    }

    pub fn get_int(&self, name: &str) -> i64 {
        self.ints.get(name).copied().unwrap_or(-1)
    }
}

/// Settings resolved once at startup from `GOKAPI_*` variables
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Environment {
    pub config_dir: String,
    pub config_file: String,
    pub config_path: String,
    pub data_dir: String,
    pub admin_name: String,
    pub admin_password: String,
    pub webserver_port: String,
    pub webserver_localhost: TriState,
    pub external_url: String,
    pub redirect_url: String,
    pub salt_admin: String,
    pub salt_files: String,
    pub length_id: i64,
    pub max_memory: i64,
    pub use_ssl: TriState,
    pub aws_bucket: String,
    pub aws_region: String,
    pub aws_key_id: String,
    pub aws_key_secret: String,
    pub aws_endpoint: String,
}

impl Environment {
    /// Resolve against the process environment and the built-in defaults
    pub fn new() -> Self {
        Self::from_source(&ProcessEnv)
    }

    pub fn from_source(source: &impl EnvSource) -> Self {
        Self::resolve(source, &Defaults::builtin())
    }

    pub fn resolve(source: &impl EnvSource, defaults: &Defaults) -> Self {
        let r = Resolver { source, defaults };

        let config_dir = r.string("CONFIG_DIR");
        let config_file = r.string("CONFIG_FILE");
        let config_path = format!("{}/{}", config_dir, config_file);

        Self {
            config_dir,
            config_file,
            config_path,
            data_dir: r.string("DATA_DIR"),
            admin_name: r.string("USERNAME"),
            admin_password: r.string("PASSWORD"),
            webserver_port: r.string("PORT"),
            webserver_localhost: r.tri_state("LOCALHOST"),
            external_url: r.string("EXTERNAL_URL"),
            redirect_url: r.string("REDIRECT_URL"),
            salt_admin: r.string("SALT_ADMIN"),
            salt_files: r.string("SALT_FILES"),
            length_id: r.int("LENGTH_ID", MIN_LENGTH_ID),
            max_memory: r.int("MAX_MEMORY_UPLOAD_MB", MIN_MAX_MEMORY_MB),
            use_ssl: r.tri_state("USE_SSL"),
            aws_bucket: r.string("AWS_BUCKET"),
            aws_region: r.string("AWS_REGION"),
            aws_key_id: r.string("AWS_KEY"),
            aws_key_secret: r.string("AWS_KEY_SECRET"),
            aws_endpoint: r.string("AWS_ENDPOINT"),
        }
    }

    /// True if every credential needed for S3-compatible storage is present.
    /// The endpoint is optional.
    pub fn is_aws_provided(&self) -> bool {
        !self.aws_bucket.is_empty()
            && !self.aws_region.is_empty()
            && !self.aws_key_id.is_empty()
            && !self.aws_key_secret.is_empty()
    }

    /// Copy with secrets masked, for printing
    pub fn redacted(&self) -> Self {
        fn mask(value: &str) -> String {
            if value.is_empty() {
                String::new()
            } else {
                REDACTED.to_string()
            }
        }

        Self {
            admin_password: mask(&self.admin_password),
            salt_admin: mask(&self.salt_admin),
            salt_files: mask(&self.salt_files),
            aws_key_secret: mask(&self.aws_key_secret),
            ..self.clone()
        }
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}

struct Resolver<'a, S: EnvSource> {
    source: &'a S,
    defaults: &'a Defaults,
}

impl<S: EnvSource> Resolver<'_, S> {
    fn lookup(&self, name: &str) -> Option<String> {
        self.source.lookup(&format!("{}{}", ENV_PREFIX, name))
    }

    fn string(&self, name: &str) -> String {
        self.lookup(name)
            .unwrap_or_else(|| self.defaults.get_string(name))
    }

    fn tri_state(&self, name: &str) -> TriState {
        let Some(value) = self.lookup(name) else {
            return TriState::Unset;
        };
        let parsed = TriState::parse(&value);
        if parsed == TriState::Unset {
            tracing::debug!(
                "{}{} has unrecognised value {:?}, treating as unset",
                ENV_PREFIX,
                name,
                value
            );
        }
        parsed
    }

    fn int(&self, name: &str, min_value: i64) -> i64 {
        let Some(value) = self.lookup(name) else {
            return self.defaults.get_int(name);
        };
        match value.parse::<i64>() {
            Ok(n) if n < min_value => min_value,
            Ok(n) => n,
            Err(_) => {
                tracing::warn!("{}{} is not a valid integer: {:?}", ENV_PREFIX, name, value);
                -1
            }
        }
    }
}

/// Startup policy applied on top of a resolved [`Environment`]
#[derive(Clone, Debug)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub server_url: String,
    pub redirect_url: String,
    pub data_dir: String,
    pub length_id: usize,
    /// Bytes of an upload held in memory before it is flushed to disk
    pub upload_buffer_size: usize,
    pub admin_name: String,
    /// hex(sha256(salt_admin + password)), empty when no admin password is configured
    pub admin_password_hash: String,
    pub salt_admin: String,
    pub salt_files: String,
    pub remote_storage: bool,
}

impl ServerSettings {
    pub fn from_environment(env: &Environment) -> Result<Self, AppError> {
        if env.length_id < 0 {
            return Err(invalid("LENGTH_ID", "must be an integer"));
        }
        if env.length_id > MAX_LENGTH_ID {
            return Err(invalid("LENGTH_ID", &format!("must not exceed {}", MAX_LENGTH_ID)));
        }
        if env.max_memory < 0 {
            return Err(invalid("MAX_MEMORY_UPLOAD_MB", "must be an integer"));
        }
        let upload_buffer_size = usize::try_from(env.max_memory)
            .ok()
            .and_then(|mb| mb.checked_mul(1024 * 1024))
            .ok_or_else(|| invalid("MAX_MEMORY_UPLOAD_MB", "is too large"))?;

        let port = if env.webserver_port.is_empty() {
            DEFAULT_PORT
        } else {
            env.webserver_port.parse().map_err(|_| {
                invalid("PORT", &format!("'{}' is not a valid port", env.webserver_port))
            })?
        };

        let host = match env.webserver_localhost {
            TriState::No => "0.0.0.0",
            TriState::Yes | TriState::Unset => "127.0.0.1",
        }
        .to_string();

        let server_url = if env.external_url.is_empty() {
            let scheme = if env.use_ssl == TriState::Yes { "https" } else { "http" };
            format!("{}://127.0.0.1:{}/", scheme, port)
        } else {
            with_trailing_slash(&env.external_url)
        };

        let redirect_url = if env.redirect_url.is_empty() {
            DEFAULT_REDIRECT_URL.to_string()
        } else {
            env.redirect_url.clone()
        };

        let admin_password_hash = if env.admin_password.is_empty() {
            String::new()
        } else {
            hash_password(&env.salt_admin, &env.admin_password)
        };

        Ok(Self {
            host,
            port,
            server_url,
            redirect_url,
            data_dir: env.data_dir.clone(),
            length_id: env.length_id as usize,
            upload_buffer_size,
            admin_name: env.admin_name.clone(),
            admin_password_hash,
            salt_admin: env.salt_admin.clone(),
            salt_files: env.salt_files.clone(),
            remote_storage: env.is_aws_provided(),
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Checks admin credentials. Always false when no admin account is configured.
    pub fn verify_admin(&self, name: &str, password: &str) -> bool {
        if self.admin_name.is_empty() || self.admin_password_hash.is_empty() {
            return false;
        }
        name == self.admin_name
            && hash_password(&self.salt_admin, password) == self.admin_password_hash
    }
}

fn invalid(name: &str, reason: &str) -> AppError {
    AppError::InvalidSetting {
        name: format!("{}{}", ENV_PREFIX, name),
        reason: reason.to_string(),
    }
}

/// Salted SHA-256, hex encoded
pub fn hash_password(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

fn with_trailing_slash(url: &str) -> String {
    if url.ends_with('/') {
        url.to_string()
    } else {
        format!("{}/", url)
    }
}
