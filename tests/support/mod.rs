//! Test fixtures: a scriptable HTTP origin, a raw TCP echo server, a proxy
//! harness running the threaded engine on a background thread, and a small
//! blocking HTTP client that understands chunked and close-delimited bodies.

#![allow(dead_code)]

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use weir::Proxy;
use weir::engine::EngineKind;
use weir::proxy::StopHandle;
use weir::settings::Settings;

const IO_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct OriginRequest {
    /// Request line plus header lines, CRLF-joined.
    pub head: String,
    pub body: Vec<u8>,
}

impl OriginRequest {
    pub fn header(&self, name: &str) -> Option<String> {
        let prefix = format!("{}:", name.to_ascii_lowercase());
        self.head.lines().find_map(|line| {
            line.to_ascii_lowercase()
                .starts_with(&prefix)
                .then(|| line.split_once(':').map(|(_, v)| v.trim().to_string()))
                .flatten()
        })
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.header(name).is_some()
    }
}

pub struct OriginResponse {
    pub raw: Vec<u8>,
    pub close: bool,
}

impl OriginResponse {
    pub fn of(raw: impl Into<Vec<u8>>) -> Self {
        Self {
            raw: raw.into(),
            close: false,
        }
    }

    pub fn closing(raw: impl Into<Vec<u8>>) -> Self {
        Self {
            raw: raw.into(),
            close: true,
        }
    }
}

/// Scriptable HTTP/1.1 origin serving keep-alive connections on a
/// background thread; records every request it parses.
pub struct Origin {
    pub addr: SocketAddr,
    connections: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<OriginRequest>>>,
}

impl Origin {
    pub fn spawn<F>(handler: F) -> Self
    where
        F: Fn(&OriginRequest) -> OriginResponse + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind origin");
        let addr = listener.local_addr().expect("origin addr");
        let connections = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(Mutex::new(Vec::new()));
        let handler = Arc::new(handler);

        let accepted = connections.clone();
        let recorded = requests.clone();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { continue };
                accepted.fetch_add(1, Ordering::SeqCst);
                let handler = handler.clone();
                let recorded = recorded.clone();
                thread::spawn(move || serve_origin_connection(stream, handler, recorded));
            }
        });

        Self {
            addr,
            connections,
            requests,
        }
    }

    /// A plain-text 200 origin with a fixed body.
    pub fn with_text_body(body: &'static str) -> Self {
        Self::spawn(move |_| {
            OriginResponse::of(format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{body}",
                body.len()
            ))
        })
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<OriginRequest> {
        self.requests.lock().expect("origin requests").clone()
    }

    pub fn last_request(&self) -> OriginRequest {
        self.requests()
            .last()
            .cloned()
            .expect("origin saw no request")
    }
}

fn serve_origin_connection(
    stream: TcpStream,
    handler: Arc<dyn Fn(&OriginRequest) -> OriginResponse + Send + Sync>,
    recorded: Arc<Mutex<Vec<OriginRequest>>>,
) {
    stream.set_read_timeout(Some(IO_TIMEOUT)).ok();
    stream.set_write_timeout(Some(IO_TIMEOUT)).ok();
    let mut writer = match stream.try_clone() {
        Ok(writer) => writer,
        Err(_) => return,
    };
    let mut reader = BufReader::new(stream);

    loop {
        let mut head_lines = Vec::new();
        loop {
            let mut line = String::new();
            match reader.read_line(&mut line) {
                Ok(0) => return,
                Ok(_) => {}
                Err(_) => return,
            }
            let trimmed = line.trim_end_matches(['\r', '\n']);
            if trimmed.is_empty() {
                break;
            }
            head_lines.push(trimmed.to_string());
        }
        if head_lines.is_empty() {
            return;
        }

        let head = head_lines.join("\r\n");
        let content_length = head_lines
            .iter()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.eq_ignore_ascii_case("content-length")
                    .then(|| value.trim().parse::<usize>().ok())
                    .flatten()
            })
            .unwrap_or(0);
        let mut body = vec![0u8; content_length];
        if content_length > 0 && reader.read_exact(&mut body).is_err() {
            return;
        }

        let request = OriginRequest { head, body };
        recorded.lock().expect("origin requests").push(request.clone());
        let response = handler(&request);
        if writer.write_all(&response.raw).is_err() || writer.flush().is_err() {
            return;
        }
        if response.close {
            return;
        }
    }
}

/// Raw TCP echo server for CONNECT tunnel tests.
pub struct EchoServer {
    pub addr: SocketAddr,
}

impl EchoServer {
    pub fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind echo server");
        let addr = listener.local_addr().expect("echo addr");
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { continue };
                thread::spawn(move || {
                    stream.set_read_timeout(Some(IO_TIMEOUT)).ok();
                    let mut buffer = [0u8; 4096];
                    loop {
                        match stream.read(&mut buffer) {
                            Ok(0) | Err(_) => break,
                            Ok(read) => {
                                if stream.write_all(&buffer[..read]).is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });
        Self { addr }
    }
}

pub fn test_settings() -> Settings {
    Settings {
        host: "127.0.0.1".to_string(),
        port: 0,
        engine: EngineKind::Threaded,
        keep_alive_timeout: 2,
        timeout: 10,
        max_clients: 8,
        ..Settings::default()
    }
}

/// A proxy on the threaded engine, serving from a background thread until
/// dropped.
pub struct ProxyHarness {
    pub addr: SocketAddr,
    stop: StopHandle,
    handle: Option<thread::JoinHandle<()>>,
}

impl ProxyHarness {
    pub fn spawn(configure: impl FnOnce(&mut Proxy)) -> Self {
        Self::spawn_with(test_settings(), configure)
    }

    pub fn spawn_with(settings: Settings, configure: impl FnOnce(&mut Proxy)) -> Self {
        let mut proxy = Proxy::new(settings).expect("proxy settings");
        configure(&mut proxy);
        let addr = proxy.bind().expect("bind proxy");
        let stop = proxy.stop_handle();
        let handle = thread::spawn(move || {
            if let Err(err) = proxy.run() {
                eprintln!("proxy run failed: {err:#}");
            }
        });
        Self {
            addr,
            stop,
            handle: Some(handle),
        }
    }

    pub fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(self.addr).expect("connect to proxy");
        stream.set_read_timeout(Some(IO_TIMEOUT)).ok();
        stream.set_write_timeout(Some(IO_TIMEOUT)).ok();
        stream
    }

    /// Send one raw request on a fresh connection and parse the response.
    pub fn roundtrip(&self, raw: &str) -> ClientResponse {
        let mut stream = self.connect();
        stream.write_all(raw.as_bytes()).expect("write request");
        stream.flush().expect("flush request");
        let mut reader = BufReader::new(stream);
        read_response(&mut reader)
    }
}

impl Drop for ProxyHarness {
    fn drop(&mut self) {
        self.stop.stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[derive(Debug)]
pub struct ClientResponse {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl ClientResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(candidate, _)| candidate.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.header(name).is_some()
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Parse one HTTP response: status line, headers, then a body framed by
/// `Transfer-Encoding: chunked`, `Content-Length`, or connection close.
pub fn read_response(reader: &mut BufReader<TcpStream>) -> ClientResponse {
    let mut status_line = String::new();
    reader.read_line(&mut status_line).expect("read status line");
    let status_line = status_line.trim_end_matches(['\r', '\n']);
    let mut parts = status_line.splitn(3, ' ');
    let _version = parts.next().expect("status line version");
    let status: u16 = parts
        .next()
        .expect("status code")
        .parse()
        .expect("numeric status code");
    let reason = parts.next().unwrap_or("").to_string();

    let mut headers = Vec::new();
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).expect("read header line");
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }
        let (name, value) = trimmed.split_once(':').expect("header separator");
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    let chunked = headers.iter().any(|(name, value)| {
        name.eq_ignore_ascii_case("transfer-encoding")
            && value.to_ascii_lowercase().contains("chunked")
    });
    let content_length = headers.iter().find_map(|(name, value)| {
        name.eq_ignore_ascii_case("content-length")
            .then(|| value.parse::<usize>().ok())
            .flatten()
    });

    let mut body = Vec::new();
    if chunked {
        loop {
            let mut size_line = String::new();
            reader.read_line(&mut size_line).expect("read chunk size");
            let size_line = size_line.trim_end_matches(['\r', '\n']);
            let size = usize::from_str_radix(size_line.split(';').next().unwrap_or(""), 16)
                .expect("hex chunk size");
            if size == 0 {
                // trailers
                loop {
                    let mut trailer = String::new();
                    reader.read_line(&mut trailer).expect("read trailer");
                    if trailer.trim_end_matches(['\r', '\n']).is_empty() {
                        break;
                    }
                }
                break;
            }
            let mut chunk = vec![0u8; size];
            reader.read_exact(&mut chunk).expect("read chunk data");
            body.extend_from_slice(&chunk);
            let mut crlf = [0u8; 2];
            reader.read_exact(&mut crlf).expect("read chunk crlf");
            assert_eq!(&crlf, b"\r\n", "chunk terminator");
        }
    } else if let Some(length) = content_length {
        body = vec![0u8; length];
        reader.read_exact(&mut body).expect("read fixed body");
    } else {
        reader.read_to_end(&mut body).expect("read body to end");
    }

    ClientResponse {
        status,
        reason,
        headers,
        body,
    }
}
