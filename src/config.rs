use kernel_protocol::content::LanguageInfo;
use std::{env, path::Path};
use tracing::{debug, info};

pub const CAPTURE_STDOUT_KEY: &str = "KERNEL_CAPTURE_STDOUT";
pub const CAPTURE_STDERR_KEY: &str = "KERNEL_CAPTURE_STDERR";
pub const SESSION_KEY: &str = "KERNEL_SESSION";
pub const USERNAME_KEY: &str = "KERNEL_USERNAME";

/// Read-only key/value settings the kernel boots from.
pub trait ConfigSource: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
}

/// Process environment, optionally seeded from a `.env` file.
#[derive(Clone, Copy, Debug)]
pub struct EnvConfigManager;

impl EnvConfigManager {
    pub fn new(env_file: &Path) -> Self {
        if env_file.exists() {
            dotenvy::from_path(env_file).ok();
            info!("Loaded .env from {}", env_file.display());
        } else {
            debug!("no .env at {}, using process environment", env_file.display())
        }

        Self
    }
}

impl ConfigSource for EnvConfigManager {
    fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }
}

/// What the kernel reports about itself in `kernel_info_reply`.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelInfo {
    pub implementation: String,
    pub implementation_version: String,
    pub language_info: LanguageInfo,
    pub banner: String,
}

impl Default for KernelInfo {
    fn default() -> Self {
        Self {
            implementation: env!("CARGO_PKG_NAME").to_string(),
            implementation_version: env!("CARGO_PKG_VERSION").to_string(),
            language_info: LanguageInfo {
                name: "rhai".to_string(),
                version: "1".to_string(),
                mimetype: "text/x-rhai".to_string(),
                file_extension: ".rhai".to_string(),
            },
            banner: "kernel_relay: Rhai over the Jupyter messaging protocol".to_string(),
        }
    }
}

/// Boot-time settings. The capture flags are fixed for the kernel's lifetime.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelConfig {
    pub capture_stdout: bool,
    pub capture_stderr: bool,
    pub session: String,
    pub username: String,
    pub kernel_info: KernelInfo,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            capture_stdout: true,
            capture_stderr: true,
            session: uuid::Uuid::new_v4().to_string(),
            username: "kernel".to_string(),
            kernel_info: KernelInfo::default(),
        }
    }
}

impl KernelConfig {
    /// Read the kernel settings from a config source; absent keys keep defaults.
    pub fn load(config: &dyn ConfigSource) -> Result<Self, String> {
        let mut out = Self::default();
        if let Some(raw) = config.get(CAPTURE_STDOUT_KEY) {
            out.capture_stdout = parse_flag(CAPTURE_STDOUT_KEY, &raw)?;
        }
        if let Some(raw) = config.get(CAPTURE_STDERR_KEY) {
            out.capture_stderr = parse_flag(CAPTURE_STDERR_KEY, &raw)?;
        }
        if let Some(session) = config.get(SESSION_KEY) {
            out.session = session;
        }
        if let Some(username) = config.get(USERNAME_KEY) {
            out.username = username;
        }
        Ok(out)
    }
}

fn parse_flag(key: &str, raw: &str) -> Result<bool, String> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(format!("{key}: expected a boolean, got `{other}`")),
    }
}
