use std::time::Duration;

use bytes::Bytes;
use data_encoding::HEXLOWER;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tracing::{debug, instrument, warn};
use url::Url;

use super::BlockStore;
use crate::Error;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_IDLE: usize = 8;

/// Largest value accepted from the server. Stored blocks are compressed
/// chunks of a few MiB at most.
const MAX_BULK_LEN: usize = 32 * 1024 * 1024;

/// Block store backed by a 0-db namespace, spoken to over the redis
/// protocol.
///
/// The URL has the form `zdb://host:port[/namespace]`, a password for the
/// namespace can be passed as the URL password.
pub struct ZdbBlockStore {
    address: String,
    namespace: Option<String>,
    password: Option<String>,
    idle: Mutex<Vec<Connection>>,
}

impl ZdbBlockStore {
    pub fn from_url(url: &Url) -> Result<Self, Error> {
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::InvalidRequest("zdb url needs a host".into()))?;
        let port = url.port().unwrap_or(9900);

        let namespace = url.path().trim_matches('/');
        if namespace.contains('/') {
            return Err(Error::InvalidRequest(format!(
                "invalid namespace {}",
                namespace
            )));
        }

        Ok(Self {
            address: format!("{}:{}", host, port),
            namespace: (!namespace.is_empty()).then(|| namespace.to_string()),
            password: url.password().map(str::to_string),
            idle: Mutex::new(Vec::new()),
        })
    }

    async fn connect(&self) -> Result<Connection, Error> {
        debug!(address = %self.address, "dialing zdb");
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&self.address))
            .await
            .map_err(|_| Error::Connection(format!("timeout connecting to {}", self.address)))?
            .map_err(|e| Error::Connection(format!("{}: {}", self.address, e)))?;

        let mut conn = Connection {
            stream: BufStream::new(stream),
        };

        if let Some(namespace) = &self.namespace {
            let mut args: Vec<&[u8]> = vec![b"SELECT", namespace.as_bytes()];
            if let Some(password) = &self.password {
                args.push(password.as_bytes());
            }
            match conn.call(&args).await? {
                Reply::Status(_) => {}
                other => {
                    return Err(Error::Connection(format!(
                        "failed to select namespace {}: {:?}",
                        namespace, other
                    )))
                }
            }
        }

        Ok(conn)
    }

    /// GET over a new connection. A broken connection is dropped, not
    /// returned to the pool.
    async fn get_fresh(&self, key: &[u8]) -> Result<Reply, Error> {
        let mut conn = self.connect().await?;
        let reply = conn.call(&[b"GET", key]).await?;
        self.release(conn);
        Ok(reply)
    }

    fn release(&self, conn: Connection) {
        let mut idle = self.idle.lock();
        if idle.len() < MAX_IDLE {
            idle.push(conn);
        }
    }
}

#[async_trait::async_trait]
impl BlockStore for ZdbBlockStore {
    #[instrument(skip_all, fields(block.key = %HEXLOWER.encode(key)), err)]
    async fn get(&self, key: &[u8]) -> Result<Bytes, Error> {
        let pooled = self.idle.lock().pop();
        let reply = match pooled {
            Some(mut conn) => match conn.call(&[b"GET", key]).await {
                Ok(reply) => {
                    self.release(conn);
                    reply
                }
                Err(e) => {
                    // the server may have closed it while it was idle
                    debug!(err = %e, "pooled connection failed, reconnecting");
                    self.get_fresh(key).await?
                }
            },
            None => self.get_fresh(key).await?,
        };

        match reply {
            Reply::Bulk(Some(data)) => Ok(data),
            Reply::Bulk(None) => Err(Error::NotFound(HEXLOWER.encode(key))),
            Reply::Error(msg) => {
                warn!(msg = %msg, "zdb returned an error");
                Err(Error::Connection(msg))
            }
            other => Err(Error::Connection(format!("unexpected reply {:?}", other))),
        }
    }
}

#[derive(Debug, PartialEq)]
enum Reply {
    Status(String),
    Error(String),
    Integer(i64),
    Bulk(Option<Bytes>),
}

struct Connection {
    stream: BufStream<TcpStream>,
}

impl Connection {
    async fn call(&mut self, args: &[&[u8]]) -> Result<Reply, Error> {
        let mut req = format!("*{}\r\n", args.len()).into_bytes();
        for arg in args {
            req.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
            req.extend_from_slice(arg);
            req.extend_from_slice(b"\r\n");
        }

        self.stream.write_all(&req).await.map_err(conn_err)?;
        self.stream.flush().await.map_err(conn_err)?;

        self.read_reply().await
    }

    async fn read_line(&mut self) -> Result<String, Error> {
        let mut line = String::new();
        if self.stream.read_line(&mut line).await.map_err(conn_err)? == 0 {
            return Err(Error::Connection("connection closed".into()));
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    async fn read_reply(&mut self) -> Result<Reply, Error> {
        let line = self.read_line().await?;
        let (kind, rest) = line.split_at(line.len().min(1));

        match kind {
            "+" => Ok(Reply::Status(rest.to_string())),
            "-" => Ok(Reply::Error(rest.to_string())),
            ":" => rest
                .parse()
                .map(Reply::Integer)
                .map_err(|_| Error::Connection(format!("invalid integer reply {}", rest))),
            "$" => {
                let len: i64 = rest
                    .parse()
                    .map_err(|_| Error::Connection(format!("invalid bulk length {}", rest)))?;
                if len < 0 {
                    return Ok(Reply::Bulk(None));
                }
                let len = usize::try_from(len)
                    .ok()
                    .filter(|len| *len <= MAX_BULK_LEN)
                    .ok_or_else(|| Error::Connection(format!("bulk reply of {} bytes is too large", len)))?;

                let mut buf = vec![0; len + 2];
                self.stream.read_exact(&mut buf).await.map_err(conn_err)?;
                buf.truncate(len);
                Ok(Reply::Bulk(Some(buf.into())))
            }
            _ => Err(Error::Connection(format!("unexpected reply line {}", line))),
        }
    }
}

fn conn_err(e: std::io::Error) -> Error {
    Error::Connection(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokio::net::TcpListener;

    /// Serves a tiny subset of the 0-db protocol: SELECT and GET. With
    /// `close_after_get`, connections are closed after answering a GET.
    async fn fake_zdb(data: HashMap<Vec<u8>, Vec<u8>>, close_after_get: bool) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                let data = data.clone();
                tokio::spawn(async move {
                    let mut stream = BufStream::new(stream);
                    loop {
                        let mut line = String::new();
                        if stream.read_line(&mut line).await.unwrap() == 0 {
                            return;
                        }
                        let argc: usize = line.trim()[1..].parse().unwrap();
                        let mut args = Vec::new();
                        for _ in 0..argc {
                            let mut len = String::new();
                            stream.read_line(&mut len).await.unwrap();
                            let len: usize = len.trim()[1..].parse().unwrap();
                            let mut buf = vec![0; len + 2];
                            stream.read_exact(&mut buf).await.unwrap();
                            buf.truncate(len);
                            args.push(buf);
                        }

                        let is_get = args[0] == b"GET";
                        let reply = match args[0].as_slice() {
                            b"SELECT" if args[1] == b"hub" => b"+OK\r\n".to_vec(),
                            b"SELECT" => b"-Namespace not found\r\n".to_vec(),
                            b"GET" => match data.get(&args[1]) {
                                Some(v) => {
                                    let mut r = format!("${}\r\n", v.len()).into_bytes();
                                    r.extend_from_slice(v);
                                    r.extend_from_slice(b"\r\n");
                                    r
                                }
                                None => b"$-1\r\n".to_vec(),
                            },
                            _ => b"-unknown command\r\n".to_vec(),
                        };
                        stream.write_all(&reply).await.unwrap();
                        stream.flush().await.unwrap();
                        if close_after_get && is_get {
                            return;
                        }
                    }
                });
            }
        });

        addr.to_string()
    }

    #[tokio::test]
    async fn get_existing_and_missing() {
        let addr = fake_zdb(HashMap::from([(b"key1".to_vec(), b"va\r\nlue".to_vec())]), false).await;
        let store =
            ZdbBlockStore::from_url(&Url::parse(&format!("zdb://{}/hub", addr)).unwrap()).unwrap();

        assert_eq!(&b"va\r\nlue"[..], &store.get(b"key1").await.unwrap()[..]);
        // second call goes over the pooled connection
        assert!(matches!(store.get(b"nope").await, Err(Error::NotFound(_))));
        assert_eq!(1, store.idle.lock().len());
    }

    #[tokio::test]
    async fn select_failure() {
        let addr = fake_zdb(HashMap::new(), false).await;
        let store =
            ZdbBlockStore::from_url(&Url::parse(&format!("zdb://{}/other", addr)).unwrap())
                .unwrap();

        assert!(matches!(store.get(b"key1").await, Err(Error::Connection(_))));
    }

    #[tokio::test]
    async fn reconnects_when_pooled_connection_died() {
        let addr = fake_zdb(HashMap::from([(b"key1".to_vec(), b"value".to_vec())]), true).await;
        let store =
            ZdbBlockStore::from_url(&Url::parse(&format!("zdb://{}/hub", addr)).unwrap()).unwrap();

        assert_eq!(&b"value"[..], &store.get(b"key1").await.unwrap()[..]);
        assert_eq!(1, store.idle.lock().len());

        // the server closed the pooled connection in the meantime
        assert_eq!(&b"value"[..], &store.get(b"key1").await.unwrap()[..]);
    }

    #[tokio::test]
    async fn oversized_bulk_reply_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let _ = stream.read(&mut buf).await.unwrap();
            stream.write_all(b"$4294967296\r\n").await.unwrap();
            // keep the connection open until the client gives up
            let _ = stream.read(&mut buf).await;
        });

        let store =
            ZdbBlockStore::from_url(&Url::parse(&format!("zdb://{}", addr)).unwrap()).unwrap();
        match store.get(b"key1").await {
            Err(Error::Connection(msg)) => assert!(msg.contains("too large"), "{}", msg),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[tokio::test]
    async fn connection_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let store =
            ZdbBlockStore::from_url(&Url::parse(&format!("zdb://{}", addr)).unwrap()).unwrap();
        assert!(matches!(store.get(b"key1").await, Err(Error::Connection(_))));
    }
}
