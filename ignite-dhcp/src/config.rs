//! Per-handler configuration: the boot filenames and listen settings a
//! `ProtocolHandler` needs that aren't stored on the `Server` record
//! itself (those come from `ignite_core::Server`).
use std::time::Duration;

/// Shared across every running handler; set once at process start from
/// `ignite::config::Config`.
#[derive(Debug, Clone)]
pub struct HandlerConfig {
    pub bios_filename: String,
    pub efi_filename: String,
    /// How long `Stop` waits for the receive loop to exit before giving up.
    pub stop_timeout: Duration,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            bios_filename: "pxelinux.0".into(),
            efi_filename: "ipxe.efi".into(),
            stop_timeout: Duration::from_secs(5),
        }
    }
}
