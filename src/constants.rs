//! Various signer-wide constants.

use std::time::Duration;


//------------ Binary Names -------------------------------------------------

/// The friendly name of the `tokensigner` binary.
pub const TOKENSIGNER_APP: &str = "Token Signer";

/// The version of the crate.
pub const TOKENSIGNER_VERSION: &str = env!("CARGO_PKG_VERSION");


//------------ Config Files Paths -------------------------------------------

/// The default path to the config file.
pub const TOKENSIGNER_DEFAULT_CONFIG_FILE: &str = "./defaults/tokensigner.conf";


//------------ Environment Variables ----------------------------------------

/// The environment variable holding an alternative config file path.
pub const TOKENSIGNER_ENV_CONFIG: &str = "TOKENSIGNER_CONFIG";

/// The environment variable overriding the default log level.
pub const TOKENSIGNER_ENV_LOG_LEVEL: &str = "TOKENSIGNER_LOG_LEVEL";

/// The environment variable that may carry a token PIN for offline
/// commands.
pub const TOKENSIGNER_ENV_PIN: &str = "TOKENSIGNER_PIN";


//------------ Data Directory Layout ----------------------------------------

/// The key configuration file under the data directory.
pub const KEY_CONF_FILE: &str = "keyconf.json";

/// The directory under the data directory holding the software keystore.
pub const SOFT_TOKEN_DIR: &str = "softtoken";

/// The directory under the data directory caching OCSP responses.
pub const OCSP_DIR: &str = "ocsp";

/// The process lock file under the data directory.
pub const LOCK_FILE: &str = ".lock";


//------------ Software Token ------------------------------------------------

/// The identifier of the one and only software token.
pub const SOFT_TOKEN_ID: &str = "0";

/// The file inside the key directory used to verify the token PIN.
pub const SOFT_TOKEN_PIN_FILE: &str = ".softtoken.p12";

/// The backup copy of the key directory during PIN rotation.
pub const SOFT_TOKEN_BACKUP_DIR: &str = ".softtoken.bak";

/// The prefix of staging directories used during PIN rotation.
pub const SOFT_TOKEN_TMP_PREFIX: &str = ".softtoken.tmp-";

/// The file extension of per-key keystore files.
pub const SOFT_TOKEN_KEY_EXT: &str = "p12";

/// The friendly name stored inside every software keystore.
pub const SOFT_TOKEN_KEY_ALIAS: &str = "key";

/// The size of newly generated software RSA keys.
pub const SOFT_TOKEN_RSA_BITS: u32 = 2048;


//------------ Hardware Tokens ----------------------------------------------

/// The default token id format for PKCS#11 tokens.
pub const DEFAULT_TOKEN_ID_FORMAT: &str =
    "{moduleType}{slotIndex}{serialNumber}{label}";

/// The size of RSA keys generated on devices.
pub const DEVICE_RSA_BITS: u64 = 2048;

/// The initial interval before retrying a failed PKCS#11 operation.
pub const RETRY_REQ_AFTER: Duration = Duration::from_secs(2);

/// The multiplier applied to the retry interval after each failure.
pub const RETRY_REQ_AFTER_MULTIPLIER: f64 = 1.5;

/// The maximum amount of time to keep retrying a failed operation.
pub const RETRY_REQ_UNTIL_MAX: Duration = Duration::from_secs(30);


/// The maximum length in bytes of a single request line.
pub const MAX_REQUEST_LINE: usize = 1024 * 1024;
