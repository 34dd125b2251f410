//! Parses from either the CLI or environment, mirroring the teacher's
//! `dora_core::config::cli::Config` -- every field doubles as an env var
//! via `#[clap(long, env)]`.
use std::path::PathBuf;

use clap::Parser;

/// default path to the redb database file
pub static DEFAULT_DB_PATH: &str = "/var/lib/ignite/ignite.redb";
/// default pxelinux-family filename offered to BIOS clients
pub static DEFAULT_BIOS_FILE: &str = "pxelinux.0";
/// default filename offered to UEFI/iPXE clients
pub static DEFAULT_EFI_FILE: &str = "ipxe.efi";
/// default log level; overridable with `IGNITE_LOG`
pub static DEFAULT_LOG_LEVEL: &str = "info";
/// default seconds between offline sweep passes
pub const DEFAULT_SWEEP_PERIOD_SECS: u64 = 30;
/// default seconds of silence before an active lease is marked offline
pub const DEFAULT_OFFLINE_THRESHOLD_SECS: i64 = 300;

#[derive(Parser, Debug, Clone)]
#[clap(author, name = "ignite", bin_name = "ignite", about, long_about = None)]
pub struct Config {
    /// directory holding the redb database file
    #[clap(long, env, default_value = "/var/lib/ignite")]
    pub db_path: PathBuf,
    /// filename of the redb database within `db_path`
    #[clap(long, env, default_value = "ignite.redb")]
    pub db_file: String,
    /// informational only -- redb table names are fixed, but operators can
    /// still set this for familiarity with the bucket-per-type layout
    #[clap(long, env, default_value = "leases")]
    pub db_bucket: String,

    /// boot filename offered to BIOS (non-iPXE) clients, sent as DHCP
    /// option 67
    #[clap(long, env, default_value = DEFAULT_BIOS_FILE)]
    pub dhcp_bios_file: String,
    /// boot filename offered to iPXE/gPXE clients
    #[clap(long, env, default_value = DEFAULT_EFI_FILE)]
    pub dhcp_efi_file: String,

    /// passed through for the external TFTP static server; unused by the
    /// DHCP core itself
    #[clap(long, env, default_value = "/var/lib/ignite/tftp")]
    pub tftp_dir: PathBuf,
    /// passed through for the external HTTP static/admin server
    #[clap(long, env, default_value = "/var/lib/ignite/http")]
    pub http_dir: PathBuf,
    #[clap(long, env, default_value_t = 8080)]
    pub http_port: u16,
    /// passed through for the external imaging pipeline
    #[clap(long, env, default_value = "/var/lib/ignite/provision")]
    pub provision_dir: PathBuf,

    /// seconds between offline sweep passes
    #[clap(long, env, default_value_t = DEFAULT_SWEEP_PERIOD_SECS)]
    pub sweep_period_secs: u64,
    /// seconds of silence before an active lease is marked offline
    #[clap(long, env, default_value_t = DEFAULT_OFFLINE_THRESHOLD_SECS)]
    pub offline_threshold_secs: i64,

    /// log level; all valid `EnvFilter` directives are accepted
    #[clap(long, env = "IGNITE_LOG", default_value = DEFAULT_LOG_LEVEL)]
    pub ignite_log: String,
    /// "standard", "json", or "pretty"
    #[clap(long, env = "LOG_FORMAT", default_value = "standard")]
    pub log_format: String,
}

impl Config {
    pub fn db_file_path(&self) -> PathBuf {
        self.db_path.join(&self.db_file)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DEFAULT_DB_PATH).parent().unwrap().to_path_buf(),
            db_file: "ignite.redb".into(),
            db_bucket: "leases".into(),
            dhcp_bios_file: DEFAULT_BIOS_FILE.into(),
            dhcp_efi_file: DEFAULT_EFI_FILE.into(),
            tftp_dir: "/var/lib/ignite/tftp".into(),
            http_dir: "/var/lib/ignite/http".into(),
            http_port: 8080,
            provision_dir: "/var/lib/ignite/provision".into(),
            sweep_period_secs: DEFAULT_SWEEP_PERIOD_SECS,
            offline_threshold_secs: DEFAULT_OFFLINE_THRESHOLD_SECS,
            ignite_log: DEFAULT_LOG_LEVEL.into(),
            log_format: "standard".into(),
        }
    }
}
