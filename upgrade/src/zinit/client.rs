use std::collections::HashMap;
use std::path::PathBuf;

use serde::de::{DeserializeOwned, IgnoredAny};
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::{instrument, trace};

use super::{Error, ServiceManager, ServiceState, ServiceStatus, Signal};

#[derive(Deserialize)]
#[serde(rename_all = "lowercase")]
enum ResponseState {
    Ok,
    Error,
}

#[derive(Deserialize)]
struct Response {
    state: ResponseState,
    #[serde(default)]
    body: serde_json::Value,
}

/// Client for zinit's unix socket.
///
/// Every command uses its own connection: the command line is written,
/// then zinit answers with a single JSON document and closes.
#[derive(Clone, Debug)]
pub struct ZinitClient {
    socket: PathBuf,
}

impl ZinitClient {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
        }
    }

    async fn cmd<T: DeserializeOwned>(&self, args: &[&str]) -> Result<T, Error> {
        let line = args.join(" ");
        trace!(cmd = %line, "zinit command");

        let mut stream = UnixStream::connect(&self.socket).await?;
        stream.write_all(format!("{}\n", line).as_bytes()).await?;

        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await?;

        let resp: Response =
            serde_json::from_slice(&buf).map_err(|e| Error::Protocol(e.to_string()))?;

        match resp.state {
            ResponseState::Ok => {
                serde_json::from_value(resp.body).map_err(|e| Error::Protocol(e.to_string()))
            }
            ResponseState::Error => {
                let msg = match resp.body {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                let service = args.get(1).copied().unwrap_or_default().to_string();
                Err(if msg.contains("already monitored") {
                    Error::AlreadyMonitored(service)
                } else if msg.contains("unknown") {
                    Error::UnknownService(service)
                } else {
                    Error::Zinit(msg)
                })
            }
        }
    }
}

#[async_trait::async_trait]
impl ServiceManager for ZinitClient {
    async fn list(&self) -> Result<HashMap<String, ServiceState>, Error> {
        self.cmd(&["list"]).await
    }

    #[instrument(skip(self), err)]
    async fn status(&self, name: &str) -> Result<ServiceStatus, Error> {
        self.cmd(&["status", name]).await
    }

    #[instrument(skip(self), err)]
    async fn start(&self, name: &str) -> Result<(), Error> {
        self.cmd::<IgnoredAny>(&["start", name]).await.map(|_| ())
    }

    #[instrument(skip(self), err)]
    async fn stop(&self, name: &str) -> Result<(), Error> {
        self.cmd::<IgnoredAny>(&["stop", name]).await.map(|_| ())
    }

    #[instrument(skip(self), err)]
    async fn monitor(&self, name: &str) -> Result<(), Error> {
        self.cmd::<IgnoredAny>(&["monitor", name]).await.map(|_| ())
    }

    #[instrument(skip(self), err)]
    async fn forget(&self, name: &str) -> Result<(), Error> {
        self.cmd::<IgnoredAny>(&["forget", name]).await.map(|_| ())
    }

    #[instrument(skip(self), err)]
    async fn kill(&self, name: &str, signal: Signal) -> Result<(), Error> {
        self.cmd::<IgnoredAny>(&["kill", name, &signal.to_string()])
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zinit::{State, Target};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::UnixListener;

    type Handler = Arc<dyn Fn(&str) -> String + Send + Sync>;

    /// Answers every command line with whatever `handler` returns.
    fn fake_zinit(dir: &tempfile::TempDir, handler: Handler) -> PathBuf {
        let path = dir.path().join("zinit.sock");
        let listener = UnixListener::bind(&path).unwrap();

        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                let handler = handler.clone();
                tokio::spawn(async move {
                    let mut stream = BufReader::new(stream);
                    let mut line = String::new();
                    stream.read_line(&mut line).await.unwrap();
                    let reply = handler(line.trim_end());
                    stream.get_mut().write_all(reply.as_bytes()).await.unwrap();
                });
            }
        });

        path
    }

    #[tokio::test]
    async fn status_and_errors() {
        let dir = tempfile::tempdir().unwrap();
        let socket = fake_zinit(
            &dir,
            Arc::new(|cmd| match cmd {
                "status redis" => r#"{"state":"ok","body":{"name":"redis","pid":12,"state":"Running","target":"Up"}}"#.into(),
                "status nope" => r#"{"state":"error","body":"service name \"nope\" unknown"}"#.into(),
                "monitor redis" => r#"{"state":"error","body":"service \"redis\" already monitored"}"#.into(),
                "start redis" | "kill redis SIGKILL" => r#"{"state":"ok","body":null}"#.into(),
                "list" => r#"{"state":"ok","body":{"redis":"Running","flistd":"Error(exit status 1)"}}"#.into(),
                _ => r#"{"state":"error","body":"boom"}"#.into(),
            }),
        );
        let client = ZinitClient::new(socket);

        let status = client.status("redis").await.unwrap();
        assert_eq!(Target::Up, status.target);
        assert_eq!(12, status.pid);

        assert!(matches!(
            client.status("nope").await,
            Err(Error::UnknownService(s)) if s == "nope"
        ));
        assert!(matches!(
            client.monitor("redis").await,
            Err(Error::AlreadyMonitored(_))
        ));
        client.start("redis").await.unwrap();
        client.kill("redis", Signal::Kill).await.unwrap();
        assert!(matches!(client.stop("redis").await, Err(Error::Zinit(m)) if m == "boom"));

        let list = client.list().await.unwrap();
        assert_eq!(State::Error, list["flistd"].state);
    }

    #[tokio::test]
    async fn stop_wait_polls_until_exited() {
        let dir = tempfile::tempdir().unwrap();
        let polls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let socket = fake_zinit(&dir, {
            let polls = polls.clone();
            Arc::new(move |cmd| match cmd {
                "stop flistd" => r#"{"state":"ok","body":null}"#.into(),
                "status flistd" => {
                    let n = polls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    let state = if n < 2 { "Running" } else { "Success" };
                    format!(
                        r#"{{"state":"ok","body":{{"name":"flistd","pid":0,"state":"{}","target":"Down"}}}}"#,
                        state
                    )
                }
                _ => r#"{"state":"error","body":"unexpected"}"#.into(),
            })
        });

        struct Fast(ZinitClient);

        #[async_trait::async_trait]
        impl ServiceManager for Fast {
            async fn list(&self) -> Result<HashMap<String, ServiceState>, Error> {
                self.0.list().await
            }
            async fn status(&self, name: &str) -> Result<ServiceStatus, Error> {
                self.0.status(name).await
            }
            async fn start(&self, name: &str) -> Result<(), Error> {
                self.0.start(name).await
            }
            async fn stop(&self, name: &str) -> Result<(), Error> {
                self.0.stop(name).await
            }
            async fn monitor(&self, name: &str) -> Result<(), Error> {
                self.0.monitor(name).await
            }
            async fn forget(&self, name: &str) -> Result<(), Error> {
                self.0.forget(name).await
            }
            async fn kill(&self, name: &str, signal: Signal) -> Result<(), Error> {
                self.0.kill(name, signal).await
            }
            fn poll_interval(&self) -> Duration {
                Duration::from_millis(5)
            }
        }

        Fast(ZinitClient::new(socket))
            .stop_wait(Duration::from_secs(5), "flistd")
            .await
            .unwrap();
        assert_eq!(3, polls.load(std::sync::atomic::Ordering::SeqCst));
    }
}
