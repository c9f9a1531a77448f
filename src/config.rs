//! Configuration: environment variables, consistency mode and the small
//! persisted files that let processes find their server.
//!
//! Two directories drive everything: the PFS-backed persist dir (the durable
//! namespace this system fronts) and the node-local buffer dir holding
//! scratch files. The server writes its address into a config file under one
//! of them; clients read it back at init.

use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::addr::ClientAddr;
use crate::error::TfsError;

/// PFS path; also holds the global server config file.
pub const PERSIST_DIR_ENV: &str = "TANGRAM_PERSIST_DIR";
/// Node-local scratch root.
pub const BUFFER_DIR_ENV: &str = "TANGRAM_BUFFER_DIR";
/// Transport device + provider for RPC.
pub const RPC_DEV_ENV: &str = "TANGRAM_UCX_RPC_DEV";
pub const RPC_TL_ENV: &str = "TANGRAM_UCX_RPC_TL";
/// Transport device + provider for RMA.
pub const RMA_DEV_ENV: &str = "TANGRAM_UCX_RMA_DEV";
pub const RMA_TL_ENV: &str = "TANGRAM_UCX_RMA_TL";
/// `0` = STRONG, `1` = COMMIT, `2` = RELAXED.
pub const SEMANTICS_ENV: &str = "TANGRAM_SEMANTICS";
/// Per-node servers instead of one global server.
pub const USE_LOCAL_SERVER_ENV: &str = "TANGRAM_USE_LOCAL_SERVER";
pub const DEBUG_ENV: &str = "TANGRAM_DEBUG";

/// Process-wide consistency mode, selected at init.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Semantics {
    /// Every write/read takes the matching lock; commit is a no-op and close
    /// does not post.
    Strong,
    /// No per-op locking; commit and close broadcast the extent set.
    Commit,
    /// No locks, no commit effect; close still posts. The permissive default.
    #[default]
    Relaxed,
}

impl Semantics {
    fn from_env_value(raw: &str) -> Option<Semantics> {
        match raw.trim() {
            "0" => Some(Semantics::Strong),
            "1" => Some(Semantics::Commit),
            "2" => Some(Semantics::Relaxed),
            _ => None,
        }
    }
}

/// Everything a process needs to join (or serve) the job.
#[derive(Debug, Clone)]
pub struct Config {
    /// Canonicalized PFS directory; paths under it are managed.
    pub persist_dir: PathBuf,
    /// Canonicalized node-local scratch root.
    pub buffer_dir: PathBuf,
    /// Fabric selection for an out-of-tree RPC transport.
    pub rpc_dev: Option<String>,
    pub rpc_tl: Option<String>,
    /// Fabric selection for an out-of-tree RMA transport.
    pub rma_dev: Option<String>,
    pub rma_tl: Option<String>,
    pub semantics: Semantics,
    /// Per-node servers instead of one global server.
    pub use_local_server: bool,
    pub debug: bool,
}

impl Config {
    /// Build a configuration from explicit directories (tests, embedders).
    pub fn new(
        persist_dir: impl Into<PathBuf>,
        buffer_dir: impl Into<PathBuf>,
    ) -> Result<Config, TfsError> {
        let persist_dir = canonical(persist_dir.into(), PERSIST_DIR_ENV)?;
        let buffer_dir = canonical(buffer_dir.into(), BUFFER_DIR_ENV)?;
        Ok(Config {
            persist_dir,
            buffer_dir,
            rpc_dev: None,
            rpc_tl: None,
            rma_dev: None,
            rma_tl: None,
            semantics: Semantics::default(),
            use_local_server: false,
            debug: false,
        })
    }

    /// Read the `TANGRAM_*` environment. Missing or unresolvable directories
    /// are fatal; the remaining variables have defaults.
    pub fn from_env() -> Result<Config, TfsError> {
        let persist_dir = require_env(PERSIST_DIR_ENV)?;
        let buffer_dir = require_env(BUFFER_DIR_ENV)?;
        let mut config = Config::new(persist_dir, buffer_dir)?;

        config.rpc_dev = env::var(RPC_DEV_ENV).ok();
        config.rpc_tl = env::var(RPC_TL_ENV).ok();
        config.rma_dev = env::var(RMA_DEV_ENV).ok();
        config.rma_tl = env::var(RMA_TL_ENV).ok();
        if let Ok(raw) = env::var(SEMANTICS_ENV) {
            config.semantics = Semantics::from_env_value(&raw)
                .ok_or_else(|| TfsError::Config(format!("bad {SEMANTICS_ENV} value: {raw}")))?;
        }
        config.use_local_server = env_flag(USE_LOCAL_SERVER_ENV);
        config.debug = env_flag(DEBUG_ENV);
        Ok(config)
    }

    /// Path of the server address file this configuration implies:
    /// `<persist_dir>/tfs.cfg` for the global server,
    /// `<buffer_dir>/tfs-<hostname>.cfg` for a per-node server.
    pub fn addr_file_path(&self) -> PathBuf {
        if self.use_local_server {
            self.buffer_dir.join(format!("tfs-{}.cfg", hostname()))
        } else {
            self.persist_dir.join("tfs.cfg")
        }
    }
}

/// Persist the server's address for clients to find.
pub fn write_server_addr(config: &Config, addr: &ClientAddr) -> io::Result<()> {
    fs::write(config.addr_file_path(), addr.to_bytes())
}

/// Read the server address written by [`write_server_addr`].
pub fn read_server_addr(config: &Config) -> Result<ClientAddr, TfsError> {
    let path = config.addr_file_path();
    let bytes = fs::read(&path)
        .map_err(|err| TfsError::Config(format!("cannot read {}: {err}", path.display())))?;
    ClientAddr::from_bytes(&bytes)
        .map_err(|err| TfsError::Config(format!("corrupt {}: {err}", path.display())))
}

/// Write the participant hostnames, comma-separated in rank order.
pub fn write_nodelist(persist_dir: &Path, hosts: &[String]) -> io::Result<()> {
    fs::write(persist_dir.join("nodelist.txt"), hosts.join(","))
}

/// Read back the nodelist written by rank 0.
pub fn read_nodelist(persist_dir: &Path) -> io::Result<Vec<String>> {
    let raw = fs::read_to_string(persist_dir.join("nodelist.txt"))?;
    Ok(raw
        .split(',')
        .filter(|host| !host.is_empty())
        .map(str::to_owned)
        .collect())
}

/// This node's hostname, `localhost` when the lookup fails.
pub fn hostname() -> String {
    nix::unistd::gethostname()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_owned())
}

fn require_env(name: &str) -> Result<String, TfsError> {
    env::var(name).map_err(|_| TfsError::Config(format!("{name} is not set")))
}

fn env_flag(name: &str) -> bool {
    env::var(name).is_ok_and(|raw| raw.trim() != "0" && !raw.trim().is_empty())
}

fn canonical(path: PathBuf, what: &str) -> Result<PathBuf, TfsError> {
    fs::canonicalize(&path)
        .map_err(|err| TfsError::Config(format!("{what} ({}): {err}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn semantics_values() {
        assert_eq!(Semantics::from_env_value("0"), Some(Semantics::Strong));
        assert_eq!(Semantics::from_env_value("1"), Some(Semantics::Commit));
        assert_eq!(Semantics::from_env_value("2"), Some(Semantics::Relaxed));
        assert_eq!(Semantics::from_env_value("9"), None);
        assert_eq!(Semantics::default(), Semantics::Relaxed);
    }

    #[test]
    fn addr_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(dir.path(), dir.path()).unwrap();
        let addr = ClientAddr::new(b"dev".to_vec(), b"iface".to_vec());
        write_server_addr(&config, &addr).unwrap();
        assert_eq!(read_server_addr(&config).unwrap(), addr);
    }

    #[test]
    fn missing_addr_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(dir.path(), dir.path()).unwrap();
        assert!(matches!(read_server_addr(&config), Err(TfsError::Config(_))));
    }

    #[test]
    fn nodelist_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let hosts = vec!["node0".to_owned(), "node1".to_owned(), "node2".to_owned()];
        write_nodelist(dir.path(), &hosts).unwrap();
        assert_eq!(read_nodelist(dir.path()).unwrap(), hosts);
    }

    #[test]
    fn missing_dir_is_config_error() {
        assert!(matches!(
            Config::new("/nonexistent/tangram-dir", "/tmp"),
            Err(TfsError::Config(_))
        ));
    }
}
