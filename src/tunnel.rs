//! Externally reachable tunnel endpoints for the relay.
//!
//! Each provider is a helper program that, once started, prints the public
//! URL it was assigned. [`TunnelProvider`] captures the three things the
//! selector needs from any of them: start it, find the URL in its output, and
//! probe that URL.

use std::{
    env,
    ffi::OsString,
    future::Future,
    path::{Path, PathBuf},
    process::Stdio,
    sync::LazyLock,
    time::Duration,
};

use clap::ValueEnum;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::{Child, Command},
    sync::mpsc,
};

#[cfg(unix)]
use nix::{
    sys::signal::{kill, Signal},
    unistd::Pid,
};

const OUTPUT_BUFFER_LINES: usize = 256;
const DEFAULT_URL_TIMEOUT: Duration = Duration::from_secs(20);
const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("`{0}` is not available on this host")]
    Unavailable(String),

    #[error("failed to launch `{program}`: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("tunnel process exited before printing a URL")]
    Exited,

    #[error("no tunnel URL printed within {0:?}")]
    NoUrl(Duration),

    #[error("health probe failed: {0}")]
    Probe(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Capability implemented by every kind of tunnel the selector can bind.
pub trait TunnelProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Lower values are tried first.
    fn priority(&self) -> u32;

    /// How long to wait for the launched process to print its URL.
    fn url_timeout(&self) -> Duration;

    /// Launch precondition, e.g. the helper program is installed.
    fn is_available(&self) -> bool;

    fn launch(&self) -> impl Future<Output = Result<LaunchedTunnel, TunnelError>> + Send;

    fn extract_url(&self, output: &str) -> Option<String>;

    fn health_check(&self, url: &str) -> impl Future<Output = Result<(), TunnelError>> + Send;
}

/// A started tunnel: its output lines and, for real providers, the child
/// process backing it. Dropping it kills the child.
#[derive(Debug)]
pub struct LaunchedTunnel {
    output: mpsc::Receiver<String>,
    child: Option<Child>,
}

impl LaunchedTunnel {
    /// A tunnel with no process behind it, fed only by `output`.
    pub fn from_output(output: mpsc::Receiver<String>) -> Self {
        Self {
            output,
            child: None,
        }
    }

    fn with_child(child: Child, output: mpsc::Receiver<String>) -> Self {
        Self {
            output,
            child: Some(child),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    /// Scan output lines until `extract` finds a URL, the output ends, or
    /// `timeout` passes.
    pub async fn wait_for_url<F>(&mut self, extract: F, timeout: Duration) -> Result<String, TunnelError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, self.output.recv()).await {
                Ok(Some(line)) => {
                    if let Some(url) = extract(&line) {
                        return Ok(url);
                    }
                }
                Ok(None) => return Err(TunnelError::Exited),
                Err(_) => return Err(TunnelError::NoUrl(timeout)),
            }
        }
    }

    /// SIGTERM the child, then SIGKILL if it has not exited within `grace`.
    pub async fn terminate(mut self, grace: Duration) {
        let Some(mut child) = self.child.take() else {
            return;
        };

        #[cfg(unix)]
        {
            if let Some(pid) = child.id() {
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            }
        }

        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }

        if tokio::time::timeout(grace, child.wait()).await.is_err() {
            let _ = child.kill().await;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum TunnelKind {
    Cloudflared,
    Localtunnel,
    Ngrok,
    Serveo,
}

static CLOUDFLARED_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"https://[a-z0-9-]+\.trycloudflare\.com").expect("valid regex")
});
static LOCALTUNNEL_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https://[a-z0-9-]+\.loca\.lt").expect("valid regex"));
static NGROK_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"https://[a-z0-9-]+\.ngrok(?:-free)?\.(?:app|dev|io)").expect("valid regex")
});
static SERVEO_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"https://[a-z0-9-]+\.serveo(?:usercontent)?\.(?:net|com)").expect("valid regex")
});

impl TunnelKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TunnelKind::Cloudflared => "cloudflared",
            TunnelKind::Localtunnel => "localtunnel",
            TunnelKind::Ngrok => "ngrok",
            TunnelKind::Serveo => "serveo",
        }
    }

    pub fn program(self) -> &'static str {
        match self {
            TunnelKind::Cloudflared => "cloudflared",
            TunnelKind::Localtunnel => "lt",
            TunnelKind::Ngrok => "ngrok",
            TunnelKind::Serveo => "ssh",
        }
    }

    pub fn args(self, local_port: u16) -> Vec<String> {
        let port = local_port.to_string();
        match self {
            TunnelKind::Cloudflared => vec![
                "tunnel".into(),
                "--url".into(),
                format!("http://localhost:{port}"),
            ],
            TunnelKind::Localtunnel => vec!["--port".into(), port],
            TunnelKind::Ngrok => vec!["http".into(), port, "--log".into(), "stdout".into()],
            TunnelKind::Serveo => vec![
                "-o".into(),
                "StrictHostKeyChecking=no".into(),
                "-o".into(),
                "ServerAliveInterval=30".into(),
                "-R".into(),
                format!("80:localhost:{port}"),
                "serveo.net".into(),
            ],
        }
    }

    pub fn url_pattern(self) -> &'static Regex {
        match self {
            TunnelKind::Cloudflared => &CLOUDFLARED_URL,
            TunnelKind::Localtunnel => &LOCALTUNNEL_URL,
            TunnelKind::Ngrok => &NGROK_URL,
            TunnelKind::Serveo => &SERVEO_URL,
        }
    }
}

/// A tunnel backed by one of the known helper programs.
#[derive(Debug, Clone)]
pub struct TunnelEndpoint {
    kind: TunnelKind,
    priority: u32,
    local_port: u16,
    url_timeout: Duration,
    probe_timeout: Duration,
    command: Option<(String, Vec<String>)>,
    client: reqwest::Client,
}

impl TunnelEndpoint {
    pub fn new(kind: TunnelKind, priority: u32, local_port: u16) -> Self {
        Self {
            kind,
            priority,
            local_port,
            url_timeout: DEFAULT_URL_TIMEOUT,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            command: None,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_url_timeout(mut self, timeout: Duration) -> Self {
        self.url_timeout = timeout;
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Replace the helper program and its arguments, e.g. to pin a path.
    pub fn with_command(mut self, program: impl Into<String>, args: Vec<String>) -> Self {
        self.command = Some((program.into(), args));
        self
    }

    pub fn kind(&self) -> TunnelKind {
        self.kind
    }

    fn program(&self) -> &str {
        self.command
            .as_ref()
            .map(|(program, _)| program.as_str())
            .unwrap_or_else(|| self.kind.program())
    }

    fn args(&self) -> Vec<String> {
        match &self.command {
            Some((_, args)) => args.clone(),
            None => self.kind.args(self.local_port),
        }
    }
}

impl TunnelProvider for TunnelEndpoint {
    fn name(&self) -> &str {
        self.kind.as_str()
    }

    fn priority(&self) -> u32 {
        self.priority
    }

    fn url_timeout(&self) -> Duration {
        self.url_timeout
    }

    fn is_available(&self) -> bool {
        find_program(self.program()).is_some()
    }

    async fn launch(&self) -> Result<LaunchedTunnel, TunnelError> {
        let program = self.program().to_string();
        let resolved =
            find_program(&program).ok_or_else(|| TunnelError::Unavailable(program.clone()))?;

        let mut cmd = Command::new(&resolved);
        cmd.args(self.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|source| TunnelError::Launch { program, source })?;

        let (tx, rx) = mpsc::channel(OUTPUT_BUFFER_LINES);
        if let Some(stdout) = child.stdout.take() {
            spawn_output_reader(stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_output_reader(stderr, tx);
        }

        tracing::debug!(
            target = "command_relay::tunnel",
            endpoint = self.name(),
            pid = ?child.id(),
            "launched tunnel helper"
        );
        Ok(LaunchedTunnel::with_child(child, rx))
    }

    fn extract_url(&self, output: &str) -> Option<String> {
        self.kind
            .url_pattern()
            .find(output)
            .map(|m| m.as_str().to_string())
    }

    async fn health_check(&self, url: &str) -> Result<(), TunnelError> {
        let probe_url = format!("{}/health", url.trim_end_matches('/'));
        let response = self
            .client
            .get(&probe_url)
            .timeout(self.probe_timeout)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TunnelError::Probe(format!("{probe_url} returned {status}")));
        }
        Ok(())
    }
}

/// Forward output lines to `tx`. Lines are dropped rather than blocking the
/// child once nobody is reading.
fn spawn_output_reader<R>(reader: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Err(mpsc::error::TrySendError::Closed(_)) = tx.try_send(line) {
                break;
            }
        }
    });
}

/// Locate `program` the way a shell would: paths are taken as-is, bare
/// names are looked up on `PATH`.
pub fn find_program(program: &str) -> Option<PathBuf> {
    if program.contains('/') || program.contains('\\') {
        let path = Path::new(program);
        return path.is_file().then(|| path.to_path_buf());
    }

    let path_env = env::var_os("PATH")
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| {
            #[cfg(unix)]
            {
                OsString::from("/usr/local/bin:/usr/bin:/bin:/opt/homebrew/bin")
            }
            #[cfg(windows)]
            {
                OsString::from(r"C:\Windows\System32;C:\Windows")
            }
        });

    env::split_paths(&path_env)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}
