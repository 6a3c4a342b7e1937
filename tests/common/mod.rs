//! In-process SOCKS5 intermediary, scripted upstream and client helpers
//! shared by the integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tunnel_relay::config::{FileConfig, ProxyConfig};
use tunnel_relay::http::chunked::{ChunkedDecoder, Decoded};
use tunnel_relay::http::parser::{parse_http_request, parse_response_head, ResponseHead};
use tunnel_relay::http::request::Request;
use tunnel_relay::proxy::Relay;
use tunnel_relay::server::listener::serve;

pub struct SocksServer {
    pub addr: SocketAddr,
    pub connections: Arc<AtomicUsize>,
}

impl SocksServer {
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

/// Minimal SOCKS5 server: CONNECT only, optional username/password.
pub async fn spawn_socks5(auth: Option<(&'static str, &'static str)>) -> SocksServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&connections);
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let _ = socks_session(stream, auth).await;
            });
        }
    });

    SocksServer { addr, connections }
}

async fn socks_session(
    mut client: TcpStream,
    auth: Option<(&'static str, &'static str)>,
) -> std::io::Result<()> {
    let mut head = [0u8; 2];
    client.read_exact(&mut head).await?;
    let mut methods = vec![0u8; head[1] as usize];
    client.read_exact(&mut methods).await?;

    match auth {
        Some((user, pass)) => {
            if !methods.contains(&0x02) {
                client.write_all(&[0x05, 0xFF]).await?;
                return Ok(());
            }
            client.write_all(&[0x05, 0x02]).await?;

            let mut ver_ulen = [0u8; 2];
            client.read_exact(&mut ver_ulen).await?;
            let mut username = vec![0u8; ver_ulen[1] as usize];
            client.read_exact(&mut username).await?;
            let plen = client.read_u8().await?;
            let mut password = vec![0u8; plen as usize];
            client.read_exact(&mut password).await?;

            if username != user.as_bytes() || password != pass.as_bytes() {
                client.write_all(&[0x01, 0x01]).await?;
                return Ok(());
            }
            client.write_all(&[0x01, 0x00]).await?;
        }
        None => client.write_all(&[0x05, 0x00]).await?,
    }

    let mut request = [0u8; 4];
    client.read_exact(&mut request).await?;
    let host = match request[3] {
        0x01 => {
            let mut ip = [0u8; 4];
            client.read_exact(&mut ip).await?;
            std::net::Ipv4Addr::from(ip).to_string()
        }
        0x03 => {
            let len = client.read_u8().await?;
            let mut name = vec![0u8; len as usize];
            client.read_exact(&mut name).await?;
            String::from_utf8_lossy(&name).into_owned()
        }
        _ => {
            let mut ip = [0u8; 16];
            client.read_exact(&mut ip).await?;
            std::net::Ipv6Addr::from(ip).to_string()
        }
    };
    let port = client.read_u16().await?;

    let mut upstream = match TcpStream::connect((host.as_str(), port)).await {
        Ok(stream) => stream,
        Err(_) => {
            // Connection refused
            client.write_all(&[0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0]).await?;
            return Ok(());
        }
    };
    client.write_all(&[0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0, 0]).await?;

    tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
    Ok(())
}

/// One action of a scripted upstream answer.
pub enum Step {
    Send(Vec<u8>),
    Pause(Duration),
}

pub fn send(bytes: impl AsRef<[u8]>) -> Step {
    Step::Send(bytes.as_ref().to_vec())
}

/// Frames `data` as one transfer chunk.
pub fn chunk(data: &str) -> Step {
    Step::Send(format!("{:x}\r\n{}\r\n", data.len(), data).into_bytes())
}

pub struct Upstream {
    pub addr: SocketAddr,
    pub requests: Arc<Mutex<Vec<Request>>>,
    /// Answers cut short because the peer went away.
    pub broken: Arc<AtomicUsize>,
}

impl Upstream {
    pub fn received(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }

    pub fn broken_count(&self) -> usize {
        self.broken.load(Ordering::SeqCst)
    }
}

/// Upstream HTTP server answering each request with the steps `script`
/// returns, then closing the connection.
pub async fn spawn_upstream<F>(script: F) -> Upstream
where
    F: Fn(&Request) -> Vec<Step> + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let requests = Arc::new(Mutex::new(Vec::new()));
    let script = Arc::new(script);
    let broken = Arc::new(AtomicUsize::new(0));

    let recorded = Arc::clone(&requests);
    let broken_answers = Arc::clone(&broken);
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let script = Arc::clone(&script);
            let recorded = Arc::clone(&recorded);
            let broken_answers = Arc::clone(&broken_answers);
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let request = loop {
                    if let Ok((request, _)) = parse_http_request(&buf) {
                        break request;
                    }
                    let mut tmp = [0u8; 4096];
                    match stream.read(&mut tmp).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => buf.extend_from_slice(&tmp[..n]),
                    }
                };

                let steps = script(&request);
                recorded.lock().unwrap().push(request);

                for step in steps {
                    match step {
                        Step::Send(bytes) => {
                            if stream.write_all(&bytes).await.is_err() || stream.flush().await.is_err() {
                                broken_answers.fetch_add(1, Ordering::SeqCst);
                                return;
                            }
                        }
                        Step::Pause(d) => tokio::time::sleep(d).await,
                    }
                }
                let _ = stream.shutdown().await;
            });
        }
    });

    Upstream {
        addr,
        requests,
        broken,
    }
}

pub struct RelayOptions {
    pub read_timeout_secs: u64,
    pub credentials: Option<(&'static str, &'static str)>,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            read_timeout_secs: 5,
            credentials: None,
        }
    }
}

pub fn relay_config(upstream: SocketAddr, socks: SocketAddr, options: &RelayOptions) -> ProxyConfig {
    let mut vars = vec![
        ("UPSTREAM_BASE_URL".to_string(), format!("http://{upstream}")),
        ("SOCKS5_PROXY_HOST".to_string(), socks.ip().to_string()),
        ("SOCKS5_PROXY_PORT".to_string(), socks.port().to_string()),
        ("LISTEN_HOST".to_string(), "127.0.0.1".to_string()),
        ("CONNECT_TIMEOUT_SECS".to_string(), "2".to_string()),
        ("READ_TIMEOUT_SECS".to_string(), options.read_timeout_secs.to_string()),
        ("REQUEST_TIMEOUT_SECS".to_string(), "20".to_string()),
    ];
    if let Some((user, pass)) = options.credentials {
        vars.push(("SOCKS5_PROXY_USERNAME".to_string(), user.to_string()));
        vars.push(("SOCKS5_PROXY_PASSWORD".to_string(), pass.to_string()));
    }

    ProxyConfig::resolve(FileConfig::default(), move |key| {
        vars.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone())
    })
    .unwrap()
}

/// Starts the relay on an ephemeral port and returns its address.
pub async fn spawn_relay(upstream: SocketAddr, socks: SocketAddr, options: RelayOptions) -> SocketAddr {
    let config = Arc::new(relay_config(upstream, socks, &options));
    let relay = Arc::new(Relay::from_config(config).unwrap());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = serve(listener, relay).await;
    });
    addr
}

/// An address nothing listens on.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

/// What a client saw on the wire.
pub struct ClientResponse {
    pub head: ResponseHead,
    pub body: Vec<u8>,
    /// Transfer chunks as received, for chunked responses.
    pub chunks: Vec<Bytes>,
    /// Whether a chunked body ended with its terminating chunk.
    pub terminated: bool,
}

impl ClientResponse {
    pub fn status(&self) -> u16 {
        self.head.status
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.head.headers.get(name)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Sends `raw` and reads until the relay closes the connection.
pub async fn exchange(relay: SocketAddr, raw: &[u8]) -> ClientResponse {
    let mut stream = TcpStream::connect(relay).await.unwrap();
    stream.write_all(raw).await.unwrap();

    let mut wire = Vec::new();
    tokio::time::timeout(Duration::from_secs(15), stream.read_to_end(&mut wire))
        .await
        .expect("relay did not close the connection")
        .unwrap();

    decode_response(&wire)
}

pub fn decode_response(wire: &[u8]) -> ClientResponse {
    let (head, consumed) = parse_response_head(wire).expect("response head");
    let rest = &wire[consumed..];

    if head.headers.has_token("Transfer-Encoding", "chunked") {
        let mut buf = BytesMut::from(rest);
        let mut decoder = ChunkedDecoder::new();
        let mut chunks = Vec::new();
        let mut terminated = false;
        loop {
            match decoder.decode(&mut buf).expect("valid chunked body") {
                Decoded::Chunk(c) => chunks.push(c),
                Decoded::Done => {
                    terminated = true;
                    break;
                }
                Decoded::NeedMore => break,
            }
        }
        let body = chunks.iter().flat_map(|c| c.iter().copied()).collect();
        return ClientResponse {
            head,
            body,
            chunks,
            terminated,
        };
    }

    ClientResponse {
        head,
        body: rest.to_vec(),
        chunks: Vec::new(),
        terminated: true,
    }
}

pub fn post(path: &str, headers: &[(&str, &str)], body: &str) -> Vec<u8> {
    let mut raw = format!("POST {path} HTTP/1.1\r\nHost: relay.local\r\nConnection: close\r\n");
    for (k, v) in headers {
        raw.push_str(&format!("{k}: {v}\r\n"));
    }
    raw.push_str(&format!("Content-Length: {}\r\n\r\n{}", body.len(), body));
    raw.into_bytes()
}

pub fn get(path: &str) -> Vec<u8> {
    format!("GET {path} HTTP/1.1\r\nHost: relay.local\r\nConnection: close\r\n\r\n").into_bytes()
}
