//! Multiplexer availability check and installation

use crate::config::{MultiplexerConfig, PollingConfig};
use crate::multiplexer::shell_quote;
use crate::sandbox::{RunOptions, Sandbox};
use std::sync::Arc;
use std::time::Duration;

/// A package manager that may be able to install the multiplexer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackageManager {
    pub name: &'static str,
    /// Install command template; `{pkg}` is replaced with the package name
    pub install: &'static str,
}

/// Candidates in the order they are tried
pub const PACKAGE_MANAGERS: &[PackageManager] = &[
    PackageManager {
        name: "apt-get",
        install: "DEBIAN_FRONTEND=noninteractive apt-get update -qq && DEBIAN_FRONTEND=noninteractive apt-get install -y -qq {pkg}",
    },
    PackageManager {
        name: "apk",
        install: "apk add --no-cache {pkg}",
    },
    PackageManager {
        name: "dnf",
        install: "dnf install -y -q {pkg}",
    },
    PackageManager {
        name: "yum",
        install: "yum install -y -q {pkg}",
    },
    PackageManager {
        name: "pacman",
        install: "pacman -Sy --noconfirm {pkg}",
    },
    PackageManager {
        name: "zypper",
        install: "zypper --non-interactive install {pkg}",
    },
    PackageManager {
        name: "brew",
        install: "brew install {pkg}",
    },
];

impl PackageManager {
    pub fn install_command(&self, package: &str) -> String {
        self.install.replace("{pkg}", &shell_quote(package))
    }
}

/// Verifies (and if needed installs) the multiplexer inside a sandbox
pub struct BackendChecker {
    sandbox: Arc<dyn Sandbox>,
    binary: String,
    fallback_path: String,
    probe_timeout: Duration,
    install_timeout: Duration,
}

impl BackendChecker {
    pub fn new(sandbox: Arc<dyn Sandbox>, multiplexer: &MultiplexerConfig, polling: &PollingConfig) -> Self {
        Self {
            sandbox,
            binary: multiplexer.binary.clone(),
            fallback_path: multiplexer.fallback_path.clone(),
            probe_timeout: polling.probe_timeout(),
            install_timeout: polling.install_timeout(),
        }
    }

    fn probes(&self) -> Vec<String> {
        let binary = shell_quote(&self.binary);
        let fallback = shell_quote(&self.fallback_path);
        vec![
            format!("command -v {}", binary),
            format!("test -x {} && echo {}", fallback, fallback),
            format!("which {}", binary),
        ]
    }

    /// First probe that prints a path, or None
    async fn probe_once(&self) -> crate::Result<Option<String>> {
        for probe in self.probes() {
            let output = self
                .sandbox
                .run(&probe, RunOptions::with_timeout(self.probe_timeout))
                .await?;
            let path = output
                .stdout
                .lines()
                .map(str::trim)
                .find(|line| !line.is_empty())
                .map(str::to_string);
            if output.success() {
                if let Some(path) = path {
                    tracing::debug!("Probe `{}` found {}", probe, path);
                    return Ok(Some(path));
                }
            }
        }
        Ok(None)
    }

    /// Probe with one retry; a freshly resumed sandbox can answer its first
    /// commands with empty output
    pub async fn locate(&self) -> crate::Result<Option<String>> {
        if let Some(path) = self.probe_once().await? {
            return Ok(Some(path));
        }
        tracing::debug!("No {} found on first probe round, retrying", self.binary);
        self.probe_once().await
    }

    async fn has_package_manager(&self, manager: &PackageManager) -> crate::Result<bool> {
        let output = self
            .sandbox
            .run(
                &format!("command -v {} >/dev/null 2>&1", manager.name),
                RunOptions::with_timeout(self.probe_timeout),
            )
            .await?;
        Ok(output.success())
    }

    async fn try_install(&self) -> crate::Result<Option<String>> {
        for manager in PACKAGE_MANAGERS {
            if !self.has_package_manager(manager).await? {
                continue;
            }

            tracing::info!("Installing {} with {}", self.binary, manager.name);
            let output = self
                .sandbox
                .run(
                    &manager.install_command(&self.binary),
                    RunOptions::with_timeout(self.install_timeout).user("root"),
                )
                .await?;
            if !output.success() {
                tracing::warn!(
                    "{} failed to install {} (exit {}): {}",
                    manager.name,
                    self.binary,
                    output.exit_code,
                    output.combined()
                );
                continue;
            }

            if let Some(path) = self.probe_once().await? {
                tracing::info!("Installed {} at {}", self.binary, path);
                return Ok(Some(path));
            }
            tracing::warn!(
                "{} reported success but {} is still not executable",
                manager.name,
                self.binary
            );
        }
        Ok(None)
    }

    /// Resolve the multiplexer binary path, installing it if necessary
    pub async fn ensure_available(&self) -> crate::Result<String> {
        if let Some(path) = self.locate().await? {
            return Ok(path);
        }

        tracing::info!("{} not found in sandbox, attempting installation", self.binary);
        match self.try_install().await? {
            Some(path) => Ok(path),
            None => {
                tracing::warn!("{} unavailable and could not be installed", self.binary);
                Err(crate::TerminalError::backend_unavailable())
            }
        }
    }
}
