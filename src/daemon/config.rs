use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use std::{env, fmt, fs, io};

use log::{error, info, LevelFilter};
use serde::de;
use serde::{Deserialize, Deserializer};
#[cfg(unix)]
use syslog::Facility;

use crate::commons::crypto::{KeyAlgorithm, SignMechanism};
use crate::commons::util::ext_serde;
use crate::constants::*;


//------------ ConfigDefaults ------------------------------------------------

pub struct ConfigDefaults;

impl ConfigDefaults {
    fn data_dir() -> PathBuf {
        PathBuf::from("./data")
    }

    fn listen() -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 5558))
    }

    fn log_level() -> LevelFilter {
        match env::var(TOKENSIGNER_ENV_LOG_LEVEL) {
            Ok(level) => match LevelFilter::from_str(&level) {
                Ok(level) => level,
                Err(_) => {
                    eprintln!(
                        "Unrecognized value for log level in env var {}",
                        TOKENSIGNER_ENV_LOG_LEVEL
                    );
                    ::std::process::exit(1);
                }
            },
            _ => LevelFilter::Info,
        }
    }

    fn log_type() -> LogType {
        LogType::File
    }

    fn log_file() -> PathBuf {
        PathBuf::from("./tokensigner.log")
    }

    fn syslog_facility() -> String {
        "daemon".to_string()
    }

    fn refresh_interval_seconds() -> u64 {
        60
    }

    fn software_token_enabled() -> bool {
        true
    }

    fn ocsp_freshness_seconds() -> u64 {
        3600
    }

    fn verify_ocsp_next_update() -> bool {
        true
    }

    fn pool_size() -> u32 {
        10
    }

    fn acquire_timeout_millis() -> u64 {
        5000
    }

    fn token_id_format() -> String {
        DEFAULT_TOKEN_ID_FORMAT.to_string()
    }

    fn batch_signing_enabled() -> bool {
        true
    }

    fn module_enabled() -> bool {
        true
    }
}


//------------ Config --------------------------------------------------------

/// Global configuration for the signer.
///
/// This will parse a default config file ('./defaults/tokensigner.conf')
/// unless another file is explicitly specified.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(default = "ConfigDefaults::data_dir")]
    pub data_dir: PathBuf,

    #[serde(default = "ConfigDefaults::listen")]
    pub listen: SocketAddr,

    #[serde(
        default = "ConfigDefaults::log_level",
        deserialize_with = "ext_serde::de_level_filter"
    )]
    pub log_level: LevelFilter,

    #[serde(default = "ConfigDefaults::log_type")]
    pub log_type: LogType,

    #[serde(default = "ConfigDefaults::log_file")]
    pub log_file: PathBuf,

    #[serde(default = "ConfigDefaults::syslog_facility")]
    pub syslog_facility: String,

    #[serde(default = "ConfigDefaults::refresh_interval_seconds")]
    pub refresh_interval_seconds: u64,

    #[serde(default)]
    pub enforce_token_pin_policy: bool,

    #[serde(default = "ConfigDefaults::software_token_enabled")]
    pub software_token_enabled: bool,

    #[serde(default)]
    pub software_token_key_algorithm: KeyAlgorithm,

    #[serde(default = "ConfigDefaults::ocsp_freshness_seconds")]
    pub ocsp_freshness_seconds: u64,

    #[serde(default = "ConfigDefaults::verify_ocsp_next_update")]
    pub verify_ocsp_next_update: bool,

    #[serde(default)]
    pub session_pool: SessionPoolConfig,

    #[serde(default)]
    pub globalconf: GlobalConfConfig,

    #[serde(default)]
    pub pkcs11_modules: Vec<Pkcs11ModuleConfig>,
}

/// # Accessors
impl Config {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_seconds)
    }

    pub fn ocsp_freshness(&self) -> Duration {
        Duration::from_secs(self.ocsp_freshness_seconds)
    }

    pub fn ocsp_dir(&self) -> PathBuf {
        self.data_dir.join(OCSP_DIR)
    }

    pub fn lock_file(&self) -> PathBuf {
        self.data_dir.join(LOCK_FILE)
    }

    /// Returns the enabled PKCS#11 modules.
    pub fn enabled_modules(&self) -> impl Iterator<Item = &Pkcs11ModuleConfig> {
        self.pkcs11_modules.iter().filter(|module| module.enabled)
    }
}

/// # Create
impl Config {
    /// Returns a configuration for tests using `data_dir`.
    #[cfg(test)]
    pub fn test(data_dir: &Path) -> Self {
        let mut config: Config = toml::from_str("").unwrap();
        config.data_dir = data_dir.to_path_buf();
        config.log_type = LogType::Stderr;
        config
    }

    /// Creates the config from a file and sets up logging.
    pub fn create(config_file: &str) -> Result<Self, ConfigError> {
        let config = match Self::read_config(config_file) {
            Err(e) => {
                if config_file == TOKENSIGNER_DEFAULT_CONFIG_FILE {
                    Err(ConfigError::other(
                        "Cannot find config file. Please use --config to \
                         specify its location.",
                    ))
                }
                else {
                    Err(ConfigError::Other(format!(
                        "Error parsing config file: {config_file}, error: {e}"
                    )))
                }
            }
            Ok(config) => {
                config.init_logging()?;
                info!(
                    "{} uses configuration file: {}",
                    TOKENSIGNER_APP, config_file
                );
                Ok(config)
            }
        }?;
        config.verify().map_err(|e| {
            ConfigError::Other(format!(
                "Error parsing config file: {config_file}, error: {e}"
            ))
        })?;
        Ok(config)
    }

    pub fn read_config(file: &str) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(file)?;
        Ok(toml::from_str(&content)?)
    }

    pub fn verify(&self) -> Result<(), ConfigError> {
        if self.refresh_interval_seconds == 0 {
            return Err(ConfigError::other(
                "refresh_interval_seconds must be at least 1"
            ))
        }
        if self.session_pool.size == 0 {
            return Err(ConfigError::other(
                "session_pool.size must be at least 1"
            ))
        }
        if self.session_pool.acquire_timeout_millis == 0 {
            return Err(ConfigError::other(
                "session_pool.acquire_timeout_millis must be at least 1"
            ))
        }

        let mut uids = HashSet::new();
        for module in &self.pkcs11_modules {
            if module.uid.trim().is_empty() {
                return Err(ConfigError::other(
                    "pkcs11_modules entries need a uid"
                ))
            }
            if !uids.insert(module.uid.as_str()) {
                return Err(ConfigError::Other(format!(
                    "duplicate PKCS#11 module uid '{}'", module.uid
                )))
            }
            if module.library.as_os_str().is_empty() {
                return Err(ConfigError::Other(format!(
                    "PKCS#11 module '{}' needs a library path", module.uid
                )))
            }
            if module.sign_mechanism == SignMechanism::Ecdsa {
                return Err(ConfigError::Other(format!(
                    "PKCS#11 module '{}': sign_mechanism must be \
                     CKM_RSA_PKCS or CKM_RSA_PKCS_PSS",
                    module.uid
                )))
            }
        }
        Ok(())
    }
}

/// # Logging
impl Config {
    pub fn init_logging(&self) -> Result<(), ConfigError> {
        match self.log_type {
            LogType::File => self.file_logger(&self.log_file),
            LogType::Stderr => self.stderr_logger(),
            #[cfg(unix)]
            LogType::Syslog => {
                let facility = Facility::from_str(&self.syslog_facility)
                    .map_err(|_| ConfigError::other("Invalid syslog_facility"))?;
                self.syslog_logger(facility)
            }
            #[cfg(not(unix))]
            LogType::Syslog => {
                Err(ConfigError::other("syslog is only supported on unix"))
            }
        }
    }

    /// Creates a stderr logger.
    fn stderr_logger(&self) -> Result<(), ConfigError> {
        self.fern_logger()
            .chain(io::stderr())
            .apply()
            .map_err(|e| {
                ConfigError::Other(format!(
                    "Failed to init stderr logging: {e}"
                ))
            })
    }

    /// Creates a file logger using the file provided by `path`.
    fn file_logger(&self, path: &Path) -> Result<(), ConfigError> {
        let file = match fern::log_file(path) {
            Ok(file) => file,
            Err(err) => {
                let error_string = format!(
                    "Failed to open log file '{}': {}", path.display(), err
                );
                error!("{}", error_string.as_str());
                return Err(ConfigError::Other(error_string));
            }
        };
        self.fern_logger()
            .chain(file)
            .apply()
            .map_err(|e| {
                ConfigError::Other(format!("Failed to init file logging: {e}"))
            })
    }

    /// Creates a syslog logger and configures correctly.
    #[cfg(unix)]
    fn syslog_logger(&self, facility: Facility) -> Result<(), ConfigError> {
        let process = env::current_exe()
            .ok()
            .and_then(|path| {
                path.file_name()
                    .and_then(std::ffi::OsStr::to_str)
                    .map(ToString::to_string)
            })
            .unwrap_or_else(|| String::from("tokensigner"));
        let formatter = syslog::Formatter3164 {
            facility,
            hostname: None,
            process,
            pid: std::process::id(),
        };
        let logger = syslog::unix(formatter.clone())
            .or_else(|_| syslog::tcp(formatter.clone(), ("127.0.0.1", 601)))
            .or_else(|_| {
                syslog::udp(formatter, ("127.0.0.1", 0), ("127.0.0.1", 514))
            });
        match logger {
            Ok(logger) => self.fern_logger()
                .chain(logger)
                .apply()
                .map_err(|e| {
                    ConfigError::Other(format!("Failed to init syslog: {e}"))
                }),
            Err(err) => {
                let msg = format!("Cannot connect to syslog: {err}");
                Err(ConfigError::Other(msg))
            }
        }
    }

    /// Creates and returns a fern logger with log level tweaks
    fn fern_logger(&self) -> fern::Dispatch {
        // suppress overly noisy logging
        let framework_level = self.log_level.min(LevelFilter::Warn);
        let signer_framework_level = self.log_level.min(LevelFilter::Debug);

        let show_target = self.log_level == LevelFilter::Trace
            || self.log_level == LevelFilter::Debug;
        fern::Dispatch::new()
            .format(move |out, message, record| {
                if show_target {
                    out.finish(format_args!(
                        "{} [{}] [{}] {}",
                        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                        record.level(),
                        record.target(),
                        message
                    ))
                }
                else {
                    out.finish(format_args!(
                        "{} [{}] {}",
                        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                        record.level(),
                        message
                    ))
                }
            })
            .level(self.log_level)
            .level_for("r2d2", framework_level)
            .level_for("mio", framework_level)
            .level_for("tokio", framework_level)
            .level_for("tokensigner::commons::util::file", signer_framework_level)
    }
}


//------------ SessionPoolConfig ---------------------------------------------

/// Settings for the pools of signing sessions of hardware tokens.
#[derive(Clone, Debug, Deserialize)]
pub struct SessionPoolConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "ConfigDefaults::pool_size")]
    pub size: u32,

    #[serde(default = "ConfigDefaults::acquire_timeout_millis")]
    pub acquire_timeout_millis: u64,
}

impl SessionPoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_millis)
    }
}

impl Default for SessionPoolConfig {
    fn default() -> Self {
        SessionPoolConfig {
            enabled: false,
            size: ConfigDefaults::pool_size(),
            acquire_timeout_millis: ConfigDefaults::acquire_timeout_millis(),
        }
    }
}


//------------ GlobalConfConfig ----------------------------------------------

/// Where to find the trust settings used to verify certificates.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct GlobalConfConfig {
    #[serde(default)]
    pub instance_identifier: String,

    #[serde(default)]
    pub trust_anchors: Vec<PathBuf>,

    #[serde(default)]
    pub intermediate_cas: Vec<PathBuf>,
}


//------------ Pkcs11ModuleConfig --------------------------------------------

/// A PKCS#11 library and how to treat the tokens found through it.
#[derive(Clone, Debug, Deserialize)]
pub struct Pkcs11ModuleConfig {
    pub uid: String,

    pub library: PathBuf,

    /// The slots to use, all slots with a token if empty.
    #[serde(default)]
    pub slot_ids: Vec<u64>,

    #[serde(default = "ConfigDefaults::token_id_format")]
    pub token_id_format: String,

    /// Log in before and log out after every signature.
    #[serde(default)]
    pub sign_verify_pin: bool,

    #[serde(default = "ConfigDefaults::batch_signing_enabled")]
    pub batch_signing_enabled: bool,

    #[serde(default)]
    pub read_only: bool,

    /// The mechanism used for RSA keys.
    #[serde(default)]
    pub sign_mechanism: SignMechanism,

    #[serde(default = "ConfigDefaults::module_enabled")]
    pub enabled: bool,
}


//------------ ConfigError ---------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    IoError(io::Error),
    TomlError(toml::de::Error),
    Other(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::IoError(e) => e.fmt(f),
            ConfigError::TomlError(e) => e.fmt(f),
            ConfigError::Other(s) => s.fmt(f),
        }
    }
}

impl ConfigError {
    pub fn other(s: &str) -> ConfigError {
        ConfigError::Other(s.to_string())
    }
}

impl From<io::Error> for ConfigError {
    fn from(e: io::Error) -> Self {
        ConfigError::IoError(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::TomlError(e)
    }
}


//------------ LogType -------------------------------------------------------

/// The target to log to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LogType {
    Stderr,
    File,
    Syslog,
}

impl<'de> Deserialize<'de> for LogType {
    fn deserialize<D>(d: D) -> Result<LogType, D::Error>
    where
        D: Deserializer<'de>,
    {
        let string = String::deserialize(d)?;
        match string.as_str() {
            "stderr" => Ok(LogType::Stderr),
            "file" => Ok(LogType::File),
            "syslog" => Ok(LogType::Syslog),
            _ => Err(de::Error::custom(format!(
                "expected \"stderr\", \"file\" or \"syslog\", found: \"{}\"",
                string
            ))),
        }
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_parse_default_config_file() {
        let c = Config::read_config(TOKENSIGNER_DEFAULT_CONFIG_FILE).unwrap();
        c.verify().unwrap();
        let expected: SocketAddr = ([127, 0, 0, 1], 5558).into();
        assert_eq!(c.listen, expected);
        assert_eq!(c.log_type, LogType::File);
        assert!(!c.session_pool.enabled);
        assert_eq!(c.session_pool.acquire_timeout(), Duration::from_secs(5));
        assert_eq!(c.software_token_key_algorithm, KeyAlgorithm::Rsa);
        assert_eq!(c.enabled_modules().count(), 0);
    }

    #[test]
    fn should_parse_modules() {
        let c: Config = toml::from_str(r#"
            [session_pool]
            enabled = true
            size = 4

            [[pkcs11_modules]]
            uid = "softhsm"
            library = "/usr/lib/softhsm/libsofthsm2.so"
            slot_ids = [ 1 ]
            sign_mechanism = "CKM_RSA_PKCS_PSS"

            [[pkcs11_modules]]
            uid = "card"
            library = "/usr/lib/opensc-pkcs11.so"
            enabled = false
        "#).unwrap();
        c.verify().unwrap();

        assert_eq!(c.session_pool.size, 4);
        let modules: Vec<_> = c.enabled_modules().collect();
        assert_eq!(modules.len(), 1);
        assert_eq!(modules[0].sign_mechanism, SignMechanism::RsaPkcsPss);
        assert_eq!(modules[0].token_id_format, DEFAULT_TOKEN_ID_FORMAT);
        assert!(modules[0].batch_signing_enabled);
        assert!(!modules[0].sign_verify_pin);
    }

    #[test]
    fn should_reject_bad_settings() {
        fn rejects(toml: &str) -> bool {
            let c: Config = toml::from_str(toml).unwrap();
            c.verify().is_err()
        }

        assert!(rejects("[session_pool]\nsize = 0"));
        assert!(rejects("[session_pool]\nacquire_timeout_millis = 0"));
        assert!(rejects("refresh_interval_seconds = 0"));
        assert!(rejects(r#"
            [[pkcs11_modules]]
            uid = "a"
            library = "/lib/a.so"
            [[pkcs11_modules]]
            uid = "a"
            library = "/lib/b.so"
        "#));
        assert!(rejects(r#"
            [[pkcs11_modules]]
            uid = "a"
            library = ""
        "#));
        assert!(rejects(r#"
            [[pkcs11_modules]]
            uid = "a"
            library = "/lib/a.so"
            sign_mechanism = "CKM_ECDSA"
        "#));
        assert!(toml::from_str::<Config>(r#"
            [[pkcs11_modules]]
            uid = "a"
            library = "/lib/a.so"
            sign_mechanism = "CKM_DSA"
        "#).is_err());
    }

    #[test]
    fn should_set_correct_log_levels() {
        use log::Level as LL;

        fn void_logger(config: &str) -> Box<dyn log::Log> {
            let c: Config = toml::from_str(config).unwrap();
            let void_output = fern::Output::writer(Box::new(io::sink()), "");
            let (_, void_logger) = c.fern_logger().chain(void_output).into_log();
            void_logger
        }

        fn enabled(log: &dyn log::Log, target: &str, level: LL) -> bool {
            log.enabled(
                &log::Metadata::builder().target(target).level(level).build()
            )
        }

        let log = void_logger(r#"log_level = "trace""#);
        assert!(enabled(&*log, "tokensigner::signer", LL::Trace));
        assert!(!enabled(&*log, "tokensigner::commons::util::file", LL::Trace));
        assert!(enabled(&*log, "tokensigner::commons::util::file", LL::Debug));
        assert!(!enabled(&*log, "r2d2", LL::Info));
        assert!(enabled(&*log, "r2d2", LL::Warn));

        let log = void_logger(r#"log_level = "warn""#);
        assert!(!enabled(&*log, "tokensigner::signer", LL::Info));
        assert!(enabled(&*log, "tokensigner::signer", LL::Warn));
        assert!(enabled(&*log, "tokio", LL::Error));
    }
}
