use clap::Parser;
use std::path::PathBuf;

/// Add a temporary JWK provisioner to the step CA, wait, then remove it.
///
/// Every flag can also be set in the `--config` file or through a
/// `TEMPJWK_<FLAG>` environment variable; flags win.
#[derive(Parser, Debug, Default, Clone)]
#[command(name = "tempjwk")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Admin provisioner used to authorize add and remove [default: KumiDC]
    #[arg(long)]
    pub admin_provisioner: Option<String>,

    /// Admin subject used to authorize add and remove [default: admin]
    #[arg(long)]
    pub admin_subject: Option<String>,

    /// Name of the temporary JWK provisioner [default: tempjwk]
    #[arg(long)]
    pub provisioner_name: Option<String>,

    /// Public key of the provisioner, relative to the tool's directory [default: key.pub]
    #[arg(long)]
    pub public_key: Option<PathBuf>,

    /// GPG-encrypted private key, relative to the tool's directory [default: key.priv.gpg]
    #[arg(long)]
    pub private_key: Option<PathBuf>,

    /// Seconds to wait for a key press before removing the provisioner [default: 300]
    #[arg(long, value_name = "SECONDS")]
    pub timeout: Option<u64>,

    /// How often to check for a key press, at most 500 [default: 500]
    #[arg(long, value_name = "MILLIS")]
    pub poll_interval_ms: Option<u64>,

    /// Directory relative key paths resolve against [default: the tool's directory]
    #[arg(long, value_name = "DIR")]
    pub key_dir: Option<PathBuf>,

    /// Where the decrypted private key is staged [default: system temp dir]
    #[arg(long, value_name = "DIR")]
    pub scratch_dir: Option<PathBuf>,

    /// step CLI executable [default: step-cli]
    #[arg(long, value_name = "PATH")]
    pub step_bin: Option<PathBuf>,

    /// gpg executable [default: gpg]
    #[arg(long, value_name = "PATH")]
    pub gpg_bin: Option<PathBuf>,

    /// TOML settings file
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,
}
