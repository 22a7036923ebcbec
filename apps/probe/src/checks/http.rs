//! HTTP and HTTPS check executor.
//!
//! Both variants run the same phased measurement over a hand-driven
//! connection: resolve, dial, (handshake,) send, wait for headers, drain
//! the body. A ready-made client would collapse those phases into one
//! opaque duration, so the request is written to the socket directly.

use std::io::Read;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use flate2::read::GzDecoder;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{Instant, timeout_at};
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::client::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use tokio_rustls::rustls::{
    self, Certificate, ClientConfig, DigitallySignedStruct, OwnedTrustAnchor, RootCertStore,
    ServerName,
};
use x509_parser::prelude::{FromDer, X509Certificate};

use super::settings::{
    self, DEFAULT_DOWNLOAD_LIMIT, IpVersion, SettingsError, resolve_host,
};
use crate::models::Settings;

const MAX_HEADER_BYTES: usize = 64 * 1024;
const READ_CHUNK: usize = 4096;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct HttpResult {
    pub dns: Option<f64>,
    pub connect: Option<f64>,
    pub send: Option<f64>,
    pub wait: Option<f64>,
    pub recv: Option<f64>,
    pub total: Option<f64>,
    pub data_length: Option<f64>,
    pub throughput: Option<f64>,
    pub status_code: Option<f64>,
    /// Seconds until the peer certificate expires (https only).
    pub expiry: Option<f64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
struct TlsMode {
    validate_cert: bool,
}

#[derive(Debug)]
pub struct HttpCheck {
    host: String,
    path: String,
    port: u16,
    method: String,
    headers: String,
    body: Option<String>,
    expect_regex: Option<Regex>,
    timeout: std::time::Duration,
    download_limit: usize,
    ipversion: IpVersion,
    tls: Option<TlsMode>,
}

impl HttpCheck {
    pub fn new_http(settings: &Settings) -> Result<Self, SettingsError> {
        Self::new(settings, 80, false)
    }

    pub fn new_https(settings: &Settings) -> Result<Self, SettingsError> {
        Self::new(settings, 443, true)
    }

    fn new(config: &Settings, default_port: u16, tls: bool) -> Result<Self, SettingsError> {
        let host = settings::req_string(config, "host")?;
        let path = settings::opt_string(config, "path")?
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| "/".to_string());
        if !path.starts_with('/') {
            return Err(SettingsError::Invalid("path"));
        }
        let method = settings::opt_string(config, "method")?
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| "GET".to_string());
        let expect_regex = match settings::opt_string(config, "expectRegex")? {
            Some(pattern) if !pattern.is_empty() => {
                Some(Regex::new(&pattern).map_err(|_| SettingsError::Invalid("expectRegex"))?)
            }
            _ => None,
        };
        let tls = tls.then(|| {
            Ok::<_, SettingsError>(TlsMode {
                validate_cert: settings::opt_bool(config, "validateCert")?.unwrap_or(true),
            })
        });
        Ok(Self {
            host,
            path,
            port: settings::port(config, "port", default_port)?,
            method,
            headers: settings::opt_string(config, "headers")?.unwrap_or_default(),
            body: settings::opt_string(config, "body")?.filter(|b| !b.is_empty()),
            expect_regex,
            timeout: settings::timeout(config, 5.0)?,
            download_limit: settings::download_limit(
                config,
                "downloadLimit",
                DEFAULT_DOWNLOAD_LIMIT,
            )?,
            ipversion: IpVersion::from_settings(config)?,
            tls: tls.transpose()?,
        })
    }

    /// Run one measurement. Failures are reported inside the result;
    /// whatever phases completed keep their measurements.
    pub async fn run(&self) -> HttpResult {
        let mut result = HttpResult::default();
        if let Err(message) = self.measure(&mut result).await {
            result.error = Some(message);
        }
        result
    }

    async fn measure(&self, result: &mut HttpResult) -> Result<(), String> {
        let deadline = Instant::now() + self.timeout;
        let request = self.build_request()?;

        // dns
        let step = Instant::now();
        let ip = timeout_at(deadline, resolve_host(&self.host, self.ipversion))
            .await
            .map_err(|_| "timeout while connecting".to_string())??;
        result.dns = Some(ms_since(step));

        // connect; total runs from dial start
        let start = Instant::now();
        let tcp = timeout_at(deadline, TcpStream::connect((ip, self.port)))
            .await
            .map_err(|_| "timeout while connecting".to_string())?
            .map_err(|err| format!("connect error. {err}"))?;

        let mut stream = match &self.tls {
            None => Stream::Plain(tcp),
            Some(mode) => {
                let connector = tls_connector(mode.validate_cert);
                let server_name = ServerName::try_from(self.host.as_str())
                    .map_err(|_| format!("connect error. invalid server name {:?}", self.host))?;
                let tls_stream = timeout_at(deadline, connector.connect(server_name, tcp))
                    .await
                    .map_err(|_| "timeout while connecting".to_string())?
                    .map_err(|err| format!("connect error. {err}"))?;
                // capture the chain now so expiry survives later failures
                result.expiry = peer_cert_expiry(&tls_stream);
                Stream::Tls(Box::new(tls_stream))
            }
        };
        result.connect = Some(ms_since(start));

        // send
        let step = Instant::now();
        timeout_at(deadline, stream.write_all(&request))
            .await
            .map_err(|_| "timeout while sending".to_string())?
            .map_err(|err| format!("send error. {err}"))?;
        result.send = Some(ms_since(step));

        // wait: read and parse response headers
        let step = Instant::now();
        let mut head = Vec::with_capacity(READ_CHUNK);
        let mut chunk = [0u8; READ_CHUNK];
        let header_len = loop {
            if let Some(end) = find_header_end(&head) {
                break end;
            }
            if head.len() > MAX_HEADER_BYTES {
                return Err("response headers too large".to_string());
            }
            let n = timeout_at(deadline, stream.read(&mut chunk))
                .await
                .map_err(|_| "timeout while waiting".to_string())?
                .map_err(|err| format!("wait error. {err}"))?;
            if n == 0 {
                return Err("connection closed before response headers".to_string());
            }
            head.extend_from_slice(&chunk[..n]);
        };
        result.wait = Some(ms_since(step));
        let response = parse_response_head(&head[..header_len])?;

        // recv: drain the body up to the download limit
        let step = Instant::now();
        let mut body = head[header_len..].to_vec();
        while body.len() < self.download_limit {
            let n = timeout_at(deadline, stream.read(&mut chunk))
                .await
                .map_err(|_| "timeout while receiving".to_string())?
                .map_err(|err| format!("recv error. {err}"))?;
            if n == 0 {
                break;
            }
            body.extend_from_slice(&chunk[..n]);
        }
        // dropping the stream closes the connection when the limit cut
        // the read short
        drop(stream);

        let recv = ms_since(step);
        result.recv = Some(recv);
        result.total = Some(ms_since(start));
        result.data_length = Some((header_len + body.len()) as f64);
        if recv > 0.0 && !body.is_empty() {
            result.throughput = Some(body.len() as f64 / (recv / 1000.0));
        }

        result.status_code = Some(f64::from(response.status));
        if response.status >= 400 {
            return Err(format!("Invalid status code {}", response.status));
        }

        if let Some(regex) = &self.expect_regex {
            let text = match response.get("content-encoding") {
                Some(enc) if enc.eq_ignore_ascii_case("gzip") => {
                    let mut decoded = Vec::new();
                    GzDecoder::new(body.as_slice())
                        .read_to_end(&mut decoded)
                        .map_err(|err| format!("gzip error. {err}"))?;
                    decoded
                }
                None => body,
                Some(enc) if enc.is_empty() || enc.eq_ignore_ascii_case("identity") => body,
                Some(enc) => return Err(format!("unsupported content-encoding {enc:?}")),
            };
            if !regex.is_match(&String::from_utf8_lossy(&text)) {
                return Err("expectRegex did not match".to_string());
            }
        }
        Ok(())
    }

    /// Serialize the request line, headers, and optional body. The
    /// user-supplied header blob may fold continuation lines and may
    /// override Host; Connection is always `close` and Accept-Encoding
    /// defaults to gzip.
    fn build_request(&self) -> Result<Vec<u8>, String> {
        let user_headers = parse_header_blob(&self.headers)?;

        let mut host = self.host.clone();
        let mut headers: Vec<(String, String)> = Vec::with_capacity(user_headers.len() + 3);
        let mut has_accept_encoding = false;
        for (name, value) in user_headers {
            if name.eq_ignore_ascii_case("host") {
                host = value;
                continue;
            }
            if name.eq_ignore_ascii_case("connection") {
                continue;
            }
            if name.eq_ignore_ascii_case("accept-encoding") {
                has_accept_encoding = true;
            }
            headers.push((name, value));
        }

        let mut out = format!("{} {} HTTP/1.1\r\n", self.method, self.path).into_bytes();
        out.extend_from_slice(format!("Host: {host}\r\n").as_bytes());
        for (name, value) in &headers {
            out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        if !has_accept_encoding {
            out.extend_from_slice(b"Accept-Encoding: gzip\r\n");
        }
        out.extend_from_slice(b"Connection: close\r\n");
        if let Some(body) = &self.body {
            out.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        if let Some(body) = &self.body {
            out.extend_from_slice(body.as_bytes());
        }
        Ok(out)
    }
}

enum Stream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Stream {
    async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Stream::Plain(s) => s.read(buf).await,
            Stream::Tls(s) => s.read(buf).await,
        }
    }

    async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            Stream::Plain(s) => s.write_all(buf).await,
            Stream::Tls(s) => s.write_all(buf).await,
        }
    }
}

/// Parse the user header blob: one `Name: value` per line, continuation
/// lines starting with whitespace fold into the previous value.
fn parse_header_blob(blob: &str) -> Result<Vec<(String, String)>, String> {
    let mut headers: Vec<(String, String)> = Vec::new();
    for line in blob.lines() {
        if line.trim().is_empty() {
            continue;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            match headers.last_mut() {
                Some((_, value)) => {
                    value.push(' ');
                    value.push_str(line.trim());
                    continue;
                }
                None => return Err(format!("invalid header line {line:?}")),
            }
        }
        let (name, value) =
            line.split_once(':').ok_or_else(|| format!("invalid header line {line:?}"))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }
    Ok(headers)
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|pos| pos + 4)
}

struct ResponseHead {
    status: u16,
    headers: Vec<(String, String)>,
}

impl ResponseHead {
    fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

fn parse_response_head(head: &[u8]) -> Result<ResponseHead, String> {
    let text = String::from_utf8_lossy(head);
    let mut lines = text.lines();
    let status_line = lines.next().ok_or_else(|| "empty response".to_string())?;
    let mut parts = status_line.split_whitespace();
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/") {
        return Err(format!("malformed status line {status_line:?}"));
    }
    let status = parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| format!("malformed status line {status_line:?}"))?;

    let mut headers: Vec<(String, String)> = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some((_, value)) = headers.last_mut() {
                value.push(' ');
                value.push_str(line.trim());
            }
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }
    Ok(ResponseHead { status, headers })
}

fn ms_since(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

fn peer_cert_expiry(stream: &TlsStream<TcpStream>) -> Option<f64> {
    let (_, connection) = stream.get_ref();
    let der = connection.peer_certificates()?.first()?;
    let (_, cert) = X509Certificate::from_der(der.as_ref()).ok()?;
    let not_after = cert.validity().not_after.timestamp();
    let now = SystemTime::now().duration_since(UNIX_EPOCH).ok()?.as_secs() as i64;
    Some((not_after - now) as f64)
}

static SECURE_TLS: Lazy<Arc<ClientConfig>> = Lazy::new(|| {
    let mut roots = RootCertStore::empty();
    roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
        OwnedTrustAnchor::from_subject_spki_name_constraints(
            ta.subject,
            ta.spki,
            ta.name_constraints,
        )
    }));
    Arc::new(
        ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
});

static INSECURE_TLS: Lazy<Arc<ClientConfig>> = Lazy::new(|| {
    Arc::new(
        ClientConfig::builder()
            .with_safe_defaults()
            .with_custom_certificate_verifier(Arc::new(SkipCertVerification))
            .with_no_client_auth(),
    )
});

fn tls_connector(validate_cert: bool) -> TlsConnector {
    let config = if validate_cert { &SECURE_TLS } else { &INSECURE_TLS };
    TlsConnector::from(Arc::clone(config))
}

/// Accepts any certificate chain; the expiry measurement still works
/// because the peer chain is surfaced either way.
struct SkipCertVerification;

impl ServerCertVerifier for SkipCertVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &Certificate,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &Certificate,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use serde_json::json;
    use std::io::Write;
    use tokio::net::TcpListener;

    fn check_settings(port: u16, extra: &[(&str, serde_json::Value)]) -> Settings {
        let mut settings: Settings = [
            ("host".to_string(), json!("127.0.0.1")),
            ("port".to_string(), json!(port)),
            ("path".to_string(), json!("/")),
            ("timeout".to_string(), json!(2)),
        ]
        .into_iter()
        .collect();
        for (k, v) in extra {
            settings.insert(k.to_string(), v.clone());
        }
        settings
    }

    /// Serve one canned response on a loopback listener, returning the
    /// port and the bytes of the request that was received.
    async fn serve_once(response: Vec<u8>) -> (u16, tokio::task::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut request = vec![0u8; 4096];
            let n = conn.read(&mut request).await.unwrap();
            request.truncate(n);
            conn.write_all(&response).await.unwrap();
            conn.shutdown().await.ok();
            request
        });
        (port, handle)
    }

    fn response_with_body(status: &str, extra_headers: &str, body: &[u8]) -> Vec<u8> {
        let mut out = format!(
            "HTTP/1.1 {status}\r\nContent-Length: {}\r\n{extra_headers}\r\n",
            body.len()
        )
        .into_bytes();
        out.extend_from_slice(body);
        out
    }

    #[test]
    fn settings_validation_rejects_bad_input() {
        let mut s = check_settings(80, &[]);
        s.remove("host");
        assert!(matches!(HttpCheck::new_http(&s), Err(SettingsError::Missing("host"))));

        let s = check_settings(80, &[("path", json!("no-slash"))]);
        assert!(matches!(HttpCheck::new_http(&s), Err(SettingsError::Invalid("path"))));

        let s = check_settings(80, &[("expectRegex", json!("[unclosed"))]);
        assert!(matches!(HttpCheck::new_http(&s), Err(SettingsError::Invalid("expectRegex"))));

        let s = check_settings(80, &[("timeout", json!(30))]);
        assert!(matches!(HttpCheck::new_http(&s), Err(SettingsError::Invalid("timeout"))));
    }

    #[test]
    fn header_blob_folds_and_overrides() {
        let blob = "X-Test: one\r\nX-Folded: a\r\n\tb\r\nHost: override.example\r\nConnection: keep-alive";
        let headers = parse_header_blob(blob).unwrap();
        assert!(headers.contains(&("X-Test".to_string(), "one".to_string())));
        assert!(headers.contains(&("X-Folded".to_string(), "a b".to_string())));

        let s = check_settings(80, &[("headers", json!(blob))]);
        let check = HttpCheck::new_http(&s).unwrap();
        let request = String::from_utf8(check.build_request().unwrap()).unwrap();
        assert!(request.starts_with("GET / HTTP/1.1\r\n"));
        assert!(request.contains("Host: override.example\r\n"));
        // user Connection is discarded, close always wins
        assert!(request.contains("Connection: close\r\n"));
        assert!(!request.contains("keep-alive"));
        assert!(request.contains("Accept-Encoding: gzip\r\n"));
    }

    #[test]
    fn request_carries_body_and_content_length() {
        let s = check_settings(80, &[("method", json!("POST")), ("body", json!("ping=1"))]);
        let check = HttpCheck::new_http(&s).unwrap();
        let request = String::from_utf8(check.build_request().unwrap()).unwrap();
        assert!(request.starts_with("POST / HTTP/1.1\r\n"));
        assert!(request.contains("Content-Length: 6\r\n"));
        assert!(request.ends_with("\r\n\r\nping=1"));
    }

    #[test]
    fn response_head_parses_status_and_headers() {
        let head = b"HTTP/1.1 301 Moved Permanently\r\nLocation: /next\r\nContent-Encoding: GZIP\r\n\r\n";
        let parsed = parse_response_head(head).unwrap();
        assert_eq!(parsed.status, 301);
        assert_eq!(parsed.get("location"), Some("/next"));
        assert_eq!(parsed.get("CONTENT-ENCODING"), Some("GZIP"));
        assert!(parse_response_head(b"junk\r\n\r\n").is_err());
    }

    #[tokio::test]
    async fn measures_every_phase_on_success() {
        let body = vec![b'x'; 42];
        let response = response_with_body("200 OK", "", &body);
        let header_len = response.len() - 42;
        let (port, server) = serve_once(response).await;

        let check = HttpCheck::new_http(&check_settings(port, &[])).unwrap();
        let result = check.run().await;

        assert_eq!(result.error, None);
        assert_eq!(result.status_code, Some(200.0));
        assert_eq!(result.data_length, Some((header_len + 42) as f64));
        for (name, value) in [
            ("dns", result.dns),
            ("connect", result.connect),
            ("send", result.send),
            ("wait", result.wait),
            ("recv", result.recv),
            ("total", result.total),
        ] {
            assert!(value.is_some(), "{name} should be measured");
        }
        assert!(result.throughput.unwrap() > 0.0);
        assert!(result.expiry.is_none());

        let request = server.await.unwrap();
        let request = String::from_utf8(request).unwrap();
        assert!(request.starts_with("GET / HTTP/1.1\r\n"));
        assert!(request.contains("Connection: close\r\n"));
    }

    #[tokio::test]
    async fn bad_status_still_reports_measurements() {
        let (port, _server) = serve_once(response_with_body("503 Service Unavailable", "", b"nope")).await;
        let check = HttpCheck::new_http(&check_settings(port, &[])).unwrap();
        let result = check.run().await;
        assert_eq!(result.error.as_deref(), Some("Invalid status code 503"));
        assert_eq!(result.status_code, Some(503.0));
        assert!(result.total.is_some());
    }

    #[tokio::test]
    async fn expect_regex_mismatch_sets_error() {
        let (port, _server) = serve_once(response_with_body("200 OK", "", b"hello world")).await;
        let s = check_settings(port, &[("expectRegex", json!("goodbye"))]);
        let result = HttpCheck::new_http(&s).unwrap().run().await;
        assert_eq!(result.error.as_deref(), Some("expectRegex did not match"));
    }

    #[tokio::test]
    async fn expect_regex_reads_through_gzip() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"compressed needle here").unwrap();
        let gz = encoder.finish().unwrap();
        let response = response_with_body("200 OK", "Content-Encoding: gzip\r\n", &gz);
        let (port, _server) = serve_once(response).await;

        let s = check_settings(port, &[("expectRegex", json!("needle"))]);
        let result = HttpCheck::new_http(&s).unwrap().run().await;
        assert_eq!(result.error, None);
    }

    #[tokio::test]
    async fn unknown_content_encoding_is_an_error() {
        let response = response_with_body("200 OK", "Content-Encoding: br\r\n", b"data");
        let (port, _server) = serve_once(response).await;
        let s = check_settings(port, &[("expectRegex", json!("data"))]);
        let result = HttpCheck::new_http(&s).unwrap().run().await;
        assert_eq!(result.error.as_deref(), Some("unsupported content-encoding \"br\""));
    }

    #[tokio::test]
    async fn download_limit_ends_the_read_early() {
        let body = vec![b'z'; 64 * 1024];
        let response = response_with_body("200 OK", "", &body);
        let (port, _server) = serve_once(response).await;

        let s = check_settings(port, &[("downloadLimit", json!("4kb"))]);
        let result = HttpCheck::new_http(&s).unwrap().run().await;
        assert_eq!(result.error, None);
        // the read stops once the limit is crossed; well below the full body
        assert!(result.data_length.unwrap() < 32.0 * 1024.0);
    }

    #[tokio::test]
    async fn silent_server_times_out_in_the_wait_phase() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (conn, _) = listener.accept().await.unwrap();
            // hold the connection open without answering
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            drop(conn);
        });

        let s = check_settings(port, &[("timeout", json!(0.3))]);
        let result = HttpCheck::new_http(&s).unwrap().run().await;
        assert_eq!(result.error.as_deref(), Some("timeout while waiting"));
        assert!(result.connect.is_some());
        assert!(result.send.is_some());
        assert!(result.wait.is_none());
        server.abort();
    }

    // Live-network HTTPS coverage, kept out of the default run.
    #[tokio::test]
    #[ignore]
    async fn https_reports_certificate_expiry() {
        let settings: Settings = [
            ("host".to_string(), json!("example.org")),
            ("port".to_string(), json!(443)),
            ("timeout".to_string(), json!(10)),
        ]
        .into_iter()
        .collect();
        let result = HttpCheck::new_https(&settings).unwrap().run().await;
        assert_eq!(result.error, None);
        // a healthy cert expires in the future
        assert!(result.expiry.unwrap() > 0.0);
    }
}
