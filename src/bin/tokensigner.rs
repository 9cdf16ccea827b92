use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use secrecy::SecretString;

use tokensigner::commons::error::Error;
use tokensigner::commons::util::file::FileLock;
use tokensigner::constants::{
    TOKENSIGNER_APP, TOKENSIGNER_DEFAULT_CONFIG_FILE, TOKENSIGNER_ENV_CONFIG,
    TOKENSIGNER_ENV_PIN,
};
use tokensigner::daemon::config::Config;
use tokensigner::daemon::server::start_signer_daemon;
use tokensigner::signer::manager::TokenManager;


//------------ Options -------------------------------------------------------

#[derive(Parser)]
#[command(version, about = "Keeps the signing keys of a security server")]
struct Options {
    /// Override the path to the config file
    #[arg(
        short, long,
        env = TOKENSIGNER_ENV_CONFIG,
        default_value = TOKENSIGNER_DEFAULT_CONFIG_FILE,
    )]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the signer daemon
    Run,

    /// Set the PIN of the uninitialized software token
    InitSoftwareToken {
        /// The new token PIN
        #[arg(long, env = TOKENSIGNER_ENV_PIN, hide_env_values = true)]
        pin: String,
    },

    /// Print all tokens with their keys and certificates as JSON
    ListTokens,

    /// Print the checksum of the key configuration
    Checksum,
}


//------------ main ----------------------------------------------------------

#[tokio::main]
async fn main() {
    let options = Options::parse();
    let config = match Config::create(&options.config) {
        Ok(config) => Arc::new(config),
        Err(err) => {
            eprintln!("{err}");
            process::exit(1);
        }
    };

    let res = match options.command {
        Command::Run => start_signer_daemon(config, None).await,
        Command::InitSoftwareToken { pin } => {
            offline(&config, |manager| {
                manager.init_software_token(&SecretString::new(pin))?;
                println!("Software token initialized");
                Ok(())
            })
        }
        Command::ListTokens => {
            offline(&config, |manager| {
                let json = serde_json::to_string_pretty(&manager.tokens())?;
                println!("{json}");
                Ok(())
            })
        }
        Command::Checksum => {
            offline(&config, |manager| {
                println!("{}", manager.checksum());
                Ok(())
            })
        }
    };

    if let Err(err) = res {
        eprintln!("{TOKENSIGNER_APP} failed: {err}");
        process::exit(1);
    }
}

/// Runs an operation on the tokens while the daemon is not running.
fn offline<F>(config: &Config, op: F) -> Result<(), Error>
where
    F: FnOnce(&TokenManager) -> Result<(), Error>,
{
    let mut lock = FileLock::create(config.lock_file())?;
    let _guard = lock.try_write()?;
    let manager = TokenManager::build(config)?;
    op(&manager)
}
