//! Credentials obtained over SSH with `git-lfs-authenticate`.

use std::process::{Command, Stdio};

use log::debug;

use super::{AuthProvider, CachedAuthProvider, CredentialSource};
use crate::{Credential, Error, Operation, Result};

/// Runs an external program and returns its standard output.
pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &str, args: &[String]) -> Result<Vec<u8>>;
}

/// [`CommandRunner`] spawning a real child process.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

impl CommandRunner for ProcessRunner {
    fn run(&self, program: &str, args: &[String]) -> Result<Vec<u8>> {
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| Error::AuthFetch(format!("failed to run {}: {}", program, e)))?;

        if !output.status.success() {
            return Err(Error::AuthFetch(format!(
                "{} exited with {}: {}",
                program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output.stdout)
    }
}

/// Credential source calling `ssh <host> git-lfs-authenticate <path> <op>`.
#[derive(Debug, Clone)]
pub struct SshAuthenticate<R = ProcessRunner> {
    authority: String,
    path: String,
    port: Option<u16>,
    runner: R,
}

impl<R> SshAuthenticate<R> {
    /// Arguments passed to `ssh`.
    pub fn command(&self, operation: Operation) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(port) = self.port {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
        args.push(self.authority.clone());
        args.push("-oBatchMode=yes".to_string());
        args.push("-C".to_string());
        args.push("git-lfs-authenticate".to_string());
        args.push(self.path.clone());
        args.push(operation.as_str().to_string());
        args
    }
}

impl<R: CommandRunner> CredentialSource for SshAuthenticate<R> {
    fn fetch(&self, operation: Operation) -> Result<Credential> {
        let args = self.command(operation);
        debug!("ssh {}", args.join(" "));
        let stdout = self.runner.run("ssh", &args)?;
        serde_json::from_slice(&stdout)
            .map_err(|e| Error::AuthFetch(format!("invalid git-lfs-authenticate output: {}", e)))
    }
}

/// Auth provider backed by `git-lfs-authenticate` over SSH, with caching.
pub struct ExternalAuthProvider<R = ProcessRunner> {
    inner: CachedAuthProvider<SshAuthenticate<R>>,
}

impl ExternalAuthProvider {
    /// `authority` is `[user@]host`, `path` the repository path on the server.
    pub fn new(authority: &str, path: &str) -> Self {
        Self::with_runner(authority, path, ProcessRunner)
    }

    /// Parse an scp-like remote: `git@github.com:owner/repo.git`.
    pub fn from_scp_url(url: &str) -> Result<Self> {
        match url.split_once(':') {
            Some((authority, path)) if !authority.is_empty() => Ok(Self::new(authority, path)),
            _ => Err(Error::InvalidUrl(format!(
                "can't find ':' separator in ssh url: {}",
                url
            ))),
        }
    }
}

impl<R: CommandRunner> ExternalAuthProvider<R> {
    pub fn with_runner(authority: &str, path: &str, runner: R) -> Self {
        ExternalAuthProvider {
            inner: CachedAuthProvider::new(SshAuthenticate {
                authority: authority.to_string(),
                path: path.to_string(),
                port: None,
                runner,
            }),
        }
    }

    pub fn with_port(self, port: Option<u16>) -> Self {
        let mut ssh = self.inner.into_source();
        ssh.port = port;
        ExternalAuthProvider {
            inner: CachedAuthProvider::new(ssh),
        }
    }

    pub fn source(&self) -> &SshAuthenticate<R> {
        self.inner.source()
    }
}

impl<R: CommandRunner> AuthProvider for ExternalAuthProvider<R> {
    fn get_auth(&self, operation: Operation) -> Result<Credential> {
        self.inner.get_auth(operation)
    }

    fn invalidate_auth(&self, operation: Operation, auth: &Credential) {
        self.inner.invalidate_auth(operation, auth)
    }
}
