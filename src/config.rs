//! Process-level configuration: where the daemon lives, how long to wait
//! for it, and how big a TLV buffer to allocate.

use std::path::PathBuf;
use std::time::Duration;

/// Default daemon socket path, matching the original client's compiled-in
/// default (overridable by `MUACC_SOCKET`, same as the original).
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/mam/mam.sock";

/// Maximum size of a single TLV buffer, matching the original's
/// `MUACC_TLV_MAXLEN`.
pub const DEFAULT_TLV_MAXLEN: usize = 2048;

#[derive(Debug, Clone)]
pub struct Config {
    pub socket_path: PathBuf,
    pub connect_timeout: Duration,
    pub tlv_maxlen: usize,
}

impl Config {
    /// Build a `Config` from the environment, mirroring the original
    /// client's `MUACC_SOCKET` override with the same compiled-in default.
    pub fn from_env() -> Config {
        let socket_path = std::env::var_os("MUACC_SOCKET")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET_PATH));
        Config { socket_path, connect_timeout: Duration::from_millis(200), tlv_maxlen: DEFAULT_TLV_MAXLEN }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_socket_path_is_the_compiled_in_constant() {
        std::env::remove_var("MUACC_SOCKET");
        let cfg = Config::from_env();
        assert_eq!(cfg.socket_path, PathBuf::from(DEFAULT_SOCKET_PATH));
    }

    #[test]
    fn env_override_wins() {
        std::env::set_var("MUACC_SOCKET", "/tmp/test-mam.sock");
        let cfg = Config::from_env();
        assert_eq!(cfg.socket_path, PathBuf::from("/tmp/test-mam.sock"));
        std::env::remove_var("MUACC_SOCKET");
    }
}
