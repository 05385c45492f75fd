//! Talking to the service supervisor.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

mod client;

pub use client::ZinitClient;

pub const DEFAULT_ZINIT_SOCKET: &str = "/var/run/zinit.sock";

#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown service {0}")]
    UnknownService(String),

    #[error("service {0} is already monitored")]
    AlreadyMonitored(String),

    #[error("zinit: {0}")]
    Zinit(String),

    #[error("zinit connection: {0}")]
    Connection(#[from] std::io::Error),

    #[error("invalid zinit response: {0}")]
    Protocol(String),

    #[error("service {name}: expected target {expected:?}, somebody else changed it")]
    TargetChanged { name: String, expected: Target },

    #[error("service {0} did not start in time")]
    StartTimeout(String),
}

/// What the supervisor is asked to do with a service.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
pub enum Target {
    Up,
    Down,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum State {
    Unknown,
    Running,
    Blocked,
    Spawned,
    Success,
    Error,
    Failure,
    Other(String),
}

/// State of a service, as in `Running` or `Error(exit status 1)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceState {
    pub state: State,
    pub reason: Option<String>,
}

impl ServiceState {
    /// True if the service is not running anymore.
    pub fn exited(&self) -> bool {
        matches!(
            self.state,
            State::Success | State::Error | State::Failure | State::Blocked
        )
    }
}

impl FromStr for ServiceState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (state, reason) = match s.split_once('(') {
            Some((state, rest)) => {
                let reason = rest
                    .strip_suffix(')')
                    .ok_or_else(|| Error::Protocol(format!("invalid service state {}", s)))?;
                (state, Some(reason.to_lowercase()))
            }
            None => (s, None),
        };

        if state.is_empty() || !state.chars().all(|c| c.is_alphanumeric() || c == '_') {
            return Err(Error::Protocol(format!("invalid service state {}", s)));
        }

        let state = match state.to_lowercase().as_str() {
            "unknown" => State::Unknown,
            "running" => State::Running,
            "blocked" => State::Blocked,
            "spawned" => State::Spawned,
            "success" => State::Success,
            "error" => State::Error,
            "failure" => State::Failure,
            other => State::Other(other.to_string()),
        };

        Ok(ServiceState { state, reason })
    }
}

impl<'de> Deserialize<'de> for ServiceState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct ServiceStatus {
    pub name: String,
    #[serde(default)]
    pub pid: i64,
    pub state: ServiceState,
    pub target: Target,
    #[serde(default)]
    pub after: HashMap<String, String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Signal {
    Term,
    Kill,
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Signal::Term => "SIGTERM",
            Signal::Kill => "SIGKILL",
        })
    }
}

/// Operations on the service supervisor.
///
/// The waiting helpers poll [ServiceManager::status] every
/// [ServiceManager::poll_interval].
#[async_trait::async_trait]
pub trait ServiceManager: Send + Sync {
    async fn list(&self) -> Result<HashMap<String, ServiceState>, Error>;
    async fn status(&self, name: &str) -> Result<ServiceStatus, Error>;
    async fn start(&self, name: &str) -> Result<(), Error>;
    async fn stop(&self, name: &str) -> Result<(), Error>;
    /// Loads the service declaration and starts watching it.
    async fn monitor(&self, name: &str) -> Result<(), Error>;
    /// Drops a stopped service, so its declaration is read again on the
    /// next [ServiceManager::monitor].
    async fn forget(&self, name: &str) -> Result<(), Error>;
    async fn kill(&self, name: &str, signal: Signal) -> Result<(), Error>;

    fn poll_interval(&self) -> Duration {
        Duration::from_secs(1)
    }

    /// Stops a service and waits for it to exit. Once `timeout` passed it
    /// is killed.
    async fn stop_wait(&self, timeout: Duration, name: &str) -> Result<(), Error> {
        self.stop(name).await?;
        if timeout.is_zero() {
            return Ok(());
        }

        let deadline = Instant::now() + timeout;
        loop {
            if Instant::now() >= deadline {
                warn!(service = name, "service did not stop in time, killing");
                return self.kill(name, Signal::Kill).await;
            }

            let status = self.status(name).await?;
            if status.target != Target::Down {
                return Err(Error::TargetChanged {
                    name: name.to_string(),
                    expected: Target::Down,
                });
            }
            if status.state.exited() {
                return Ok(());
            }

            tokio::time::sleep(self.poll_interval()).await;
        }
    }

    /// Stops all `names` at once, killing whatever did not exit within
    /// `timeout`. Unknown services are ignored, the first other error is
    /// returned after all services were handled.
    async fn stop_multiple(&self, timeout: Duration, names: &[String]) -> Result<(), Error> {
        let mut first_err = None;
        let mut pending = Vec::new();

        for name in names {
            match self.stop(name).await {
                Ok(()) => pending.push(name.as_str()),
                Err(Error::UnknownService(_)) => debug!(service = %name, "not running"),
                Err(e) => {
                    warn!(service = %name, err = %e, "failed to stop service");
                    first_err.get_or_insert(e);
                }
            }
        }

        let deadline = Instant::now() + timeout;
        while !pending.is_empty() {
            let mut still_running = Vec::new();
            for name in pending {
                match self.status(name).await {
                    Ok(status) if status.state.exited() => {}
                    Ok(_) => still_running.push(name),
                    Err(Error::UnknownService(_)) => {}
                    Err(e) => {
                        // can't tell, so it is killed at the deadline
                        warn!(service = name, err = %e, "failed to get service status");
                        still_running.push(name);
                    }
                }
            }
            pending = still_running;

            if pending.is_empty() {
                break;
            }

            if Instant::now() >= deadline {
                for name in pending.drain(..) {
                    warn!(service = name, "service did not stop in time, killing");
                    if let Err(e) = self.kill(name, Signal::Kill).await {
                        first_err.get_or_insert(e);
                    }
                }
                break;
            }

            tokio::time::sleep(self.poll_interval()).await;
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Starts a service and waits for it to be running.
    async fn start_wait(&self, timeout: Duration, name: &str) -> Result<(), Error> {
        self.start(name).await?;
        if timeout.is_zero() {
            return Ok(());
        }

        let deadline = Instant::now() + timeout;
        loop {
            let status = self.status(name).await?;
            if Instant::now() >= deadline {
                if status.state.exited() {
                    return Err(Error::StartTimeout(name.to_string()));
                }
                return Ok(());
            }

            if status.target != Target::Up {
                return Err(Error::TargetChanged {
                    name: name.to_string(),
                    expected: Target::Up,
                });
            }
            if matches!(status.state.state, State::Running | State::Success) {
                return Ok(());
            }

            tokio::time::sleep(self.poll_interval()).await;
        }
    }
}
