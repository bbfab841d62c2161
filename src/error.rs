//! Error kinds named in the runtime's propagation policy.
//!
//! These are not meant to replace `anyhow::Error` at call sites — most of the
//! runtime still propagates with `anyhow` and `.with_context(...)`, matching
//! the teacher's style. `KiwiError` exists for the handful of places that
//! need to recognize *which* kind of failure happened (CLI exit codes, HTTP
//! status mapping, crash capture) rather than just reporting it.

use std::fmt;

#[derive(Debug)]
pub enum KiwiError {
    NetworkUnreachable(String),
    ManifestMalformed(String),
    ModuleUnknown(String),
    ModuleInvalid(String),
    DependencyUnresolved(Vec<String>),
    IoFailed(String),
    ConfigMalformed(String),
    RpcTransport(String),
    RpcApplication(u16),
    DaemonAlreadyRunning(u32),
    ScheduleMalformed(String),
    ModuleCrash(String),
}

impl fmt::Display for KiwiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NetworkUnreachable(msg) => write!(f, "could not reach remote: {}", msg),
            Self::ManifestMalformed(msg) => write!(f, "remote manifest is malformed: {}", msg),
            Self::ModuleUnknown(name) => write!(f, "I don't have a module called '{}' :(", name),
            Self::ModuleInvalid(name) => write!(f, "'{}' is not my module", name),
            Self::DependencyUnresolved(names) => {
                write!(f, "could not resolve dependencies: {}", names.join(", "))
            }
            Self::IoFailed(msg) => write!(f, "io error: {}", msg),
            Self::ConfigMalformed(msg) => write!(f, "configuration is malformed: {}", msg),
            Self::RpcTransport(msg) => write!(f, "rpc transport error: {}", msg),
            Self::RpcApplication(status) => write!(f, "server returned {}", status),
            Self::DaemonAlreadyRunning(pid) => write!(f, "daemon already running (pid {})", pid),
            Self::ScheduleMalformed(msg) => write!(f, "cyclops schedule is malformed: {}", msg),
            Self::ModuleCrash(name) => write!(f, "module '{}' crashed", name),
        }
    }
}

impl std::error::Error for KiwiError {}

/// Exit codes per spec: 0 success, 1 generic error, 2 bad invocation.
pub const EXIT_OK: i32 = 0;
pub const EXIT_ERROR: i32 = 1;
pub const EXIT_BAD_INVOCATION: i32 = 2;

impl KiwiError {
    pub fn exit_code(&self) -> i32 {
        match self {
            KiwiError::ModuleUnknown(_) | KiwiError::ModuleInvalid(_) => EXIT_BAD_INVOCATION,
            _ => EXIT_ERROR,
        }
    }
}
