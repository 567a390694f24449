// RouterOS API transport
//
// Blocking client for the RouterOS API (TCP 8728, TLS 8729). The protocol exchanges
// "sentences": sequences of length-prefixed words terminated by an empty
// word. Replies start with `!re` (one data row), `!done` (end of reply),
// `!trap` (command error) or `!fatal` (connection is being closed).
//
// Attribute words have the form `=key=value`.

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{self, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, ClientConnection, DigitallySignedStruct, RootCertStore, SignatureScheme, StreamOwned};
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{DeviceApi, DeviceError, DeviceSession, RawCounterRecord};
use crate::inventory::DeviceConfig;

/// Largest word accepted from a device
pub const MAX_WORD_LEN: usize = 16 * 1024 * 1024;

/// TLS over the API-SSL port
pub type TlsStream = StreamOwned<ClientConnection, TcpStream>;

/// Byte stream a session runs over
pub trait Transport: Read + Write + Send + 'static {
    /// Ends the connection; errors are ignored
    fn disconnect(&mut self);
}

impl Transport for TcpStream {
    fn disconnect(&mut self) {
        let _ = TcpStream::shutdown(self, Shutdown::Both);
    }
}

impl Transport for TlsStream {
    fn disconnect(&mut self) {
        self.conn.send_close_notify();
        let _ = self.flush();
        let _ = self.sock.shutdown(Shutdown::Both);
    }
}

/// Opens RouterOS API sessions with the plaintext login method
///
/// Devices with `use_ssl` are reached over TLS. Their certificate is checked
/// against the web PKI roots only when `ssl_verify` is set, since routers
/// usually present self-signed certificates.
#[derive(Debug, Clone)]
pub struct RouterOsApi {
    /// Applied to connect, read and write
    timeout: Duration,
}

impl RouterOsApi {
    pub fn new(timeout: Duration) -> Self {
        RouterOsApi { timeout }
    }

    fn dial(&self, config: &DeviceConfig) -> Result<TcpStream, DeviceError> {
        let port = config.effective_port();
        let connect_error = |reason: String| DeviceError::Connect {
            host: config.host.clone(),
            port,
            reason,
        };

        let addrs = (config.host.as_str(), port)
            .to_socket_addrs()
            .map_err(|e| connect_error(e.to_string()))?;

        let mut last_error = "host resolved to no addresses".to_string();
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.timeout) {
                Ok(stream) => {
                    stream.set_read_timeout(Some(self.timeout))?;
                    stream.set_write_timeout(Some(self.timeout))?;
                    stream.set_nodelay(true)?;
                    return Ok(stream);
                }
                Err(e) => last_error = e.to_string(),
            }
        }

        Err(connect_error(last_error))
    }

    fn wrap_tls(&self, config: &DeviceConfig, stream: TcpStream) -> Result<TlsStream, DeviceError> {
        let server_name = ServerName::try_from(config.host.clone()).map_err(|e| DeviceError::Connect {
            host: config.host.clone(),
            port: config.effective_port(),
            reason: format!("invalid TLS server name: {}", e),
        })?;

        let connection = ClientConnection::new(tls_config(config.ssl_verify)?, server_name)
            .map_err(|e| DeviceError::Tls(e.to_string()))?;

        Ok(StreamOwned::new(connection, stream))
    }

    fn open<S: Transport>(&self, config: &DeviceConfig, stream: S) -> Result<Box<dyn DeviceSession>, DeviceError> {
        let mut session = RouterOsSession {
            stream: Some(stream),
        };

        if let Err(e) = session.login(&config.username, &config.password) {
            session.close();
            return Err(e);
        }

        debug!(
            "Logged in to {} ({}{})",
            config.alias,
            config.host,
            if config.use_ssl { ", TLS" } else { "" }
        );
        Ok(Box::new(session))
    }
}

impl DeviceApi for RouterOsApi {
    fn connect(&self, config: &DeviceConfig) -> Result<Box<dyn DeviceSession>, DeviceError> {
        let stream = self.dial(config)?;

        if config.use_ssl {
            let stream = self.wrap_tls(config, stream)?;
            self.open(config, stream)
        } else {
            self.open(config, stream)
        }
    }
}

fn tls_config(verify: bool) -> Result<Arc<ClientConfig>, DeviceError> {
    let provider = Arc::new(crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| DeviceError::Tls(e.to_string()))?;

    let config = if verify {
        let roots = RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        builder.with_root_certificates(roots).with_no_client_auth()
    } else {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate(provider)))
            .with_no_client_auth()
    };

    Ok(Arc::new(config))
}

/// Skips certificate validation while still checking handshake signatures
#[derive(Debug)]
struct AcceptAnyCertificate(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        crypto::verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        crypto::verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// One authenticated RouterOS API connection
pub struct RouterOsSession<S: Transport> {
    stream: Option<S>,
}

impl<S: Transport> RouterOsSession<S> {
    fn login(&mut self, username: &str, password: &str) -> Result<(), DeviceError> {
        let name = format!("=name={}", username);
        let password = format!("=password={}", password);

        match self.command(&["/login", &name, &password]) {
            Ok(_) => Ok(()),
            Err(DeviceError::Trap(message)) => Err(DeviceError::Login(message)),
            Err(e) => Err(e),
        }
    }

    /// Sends one command and collects its `!re` rows until `!done`
    fn command(&mut self, words: &[&str]) -> Result<Vec<RawCounterRecord>, DeviceError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| DeviceError::Protocol("session already closed".into()))?;

        write_sentence(stream, words)?;
        collect_reply(stream)
    }
}

impl<S: Transport> DeviceSession for RouterOsSession<S> {
    fn list_resource(&mut self, path: &str) -> Result<Vec<RawCounterRecord>, DeviceError> {
        let print = format!("{}/print", path.trim_end_matches('/'));
        self.command(&[&print])
    }

    fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.disconnect();
        }
    }
}

impl<S: Transport> Drop for RouterOsSession<S> {
    fn drop(&mut self) {
        self.close();
    }
}

/// A decoded reply sentence
#[derive(Debug, PartialEq)]
pub enum Reply {
    Re(RawCounterRecord),
    Done,
    Trap(String),
    Fatal(String),
}

/// Appends the variable-length prefix for a word of `len` bytes
pub fn encode_length(len: usize, out: &mut Vec<u8>) {
    let len = len as u32;
    if len < 0x80 {
        out.push(len as u8);
    } else if len < 0x4000 {
        out.extend_from_slice(&(len | 0x8000).to_be_bytes()[2..]);
    } else if len < 0x20_0000 {
        out.extend_from_slice(&(len | 0xC0_0000).to_be_bytes()[1..]);
    } else if len < 0x1000_0000 {
        out.extend_from_slice(&(len | 0xE000_0000).to_be_bytes());
    } else {
        out.push(0xF0);
        out.extend_from_slice(&len.to_be_bytes());
    }
}

fn read_byte<R: Read>(reader: &mut R) -> Result<u8, DeviceError> {
    let mut byte = [0u8; 1];
    reader.read_exact(&mut byte)?;
    Ok(byte[0])
}

/// Reads a length prefix written by `encode_length`
pub fn read_length<R: Read>(reader: &mut R) -> Result<usize, DeviceError> {
    let first = read_byte(reader)? as usize;

    let (mut len, extra) = if first & 0x80 == 0 {
        (first, 0)
    } else if first & 0xC0 == 0x80 {
        (first & 0x3F, 1)
    } else if first & 0xE0 == 0xC0 {
        (first & 0x1F, 2)
    } else if first & 0xF0 == 0xE0 {
        (first & 0x0F, 3)
    } else if first == 0xF0 {
        (0, 4)
    } else {
        return Err(DeviceError::Protocol(format!(
            "unexpected control byte 0x{:02X}",
            first
        )));
    };

    for _ in 0..extra {
        len = (len << 8) | read_byte(reader)? as usize;
    }

    Ok(len)
}

pub fn write_sentence<W: Write>(writer: &mut W, words: &[&str]) -> Result<(), DeviceError> {
    let mut buf = Vec::new();
    for word in words {
        encode_length(word.len(), &mut buf);
        buf.extend_from_slice(word.as_bytes());
    }
    buf.push(0);

    writer.write_all(&buf)?;
    writer.flush()?;
    Ok(())
}

/// Reads words until the terminating empty word
pub fn read_sentence<R: Read>(reader: &mut R) -> Result<Vec<String>, DeviceError> {
    let mut words = Vec::new();
    loop {
        let len = read_length(reader)?;
        if len == 0 {
            return Ok(words);
        }
        if len > MAX_WORD_LEN {
            return Err(DeviceError::Protocol(format!(
                "word of {} bytes exceeds the {} byte limit",
                len, MAX_WORD_LEN
            )));
        }
        let mut word = vec![0u8; len];
        reader.read_exact(&mut word)?;
        words.push(String::from_utf8_lossy(&word).into_owned());
    }
}

pub fn parse_reply(words: &[String]) -> Result<Reply, DeviceError> {
    let Some((kind, rest)) = words.split_first() else {
        return Err(DeviceError::Protocol("empty reply sentence".into()));
    };

    let attributes: RawCounterRecord = rest
        .iter()
        .filter_map(|word| word.strip_prefix('='))
        .filter_map(|pair| pair.split_once('='))
        .collect();

    match kind.as_str() {
        "!re" => Ok(Reply::Re(attributes)),
        "!done" => Ok(Reply::Done),
        "!trap" => Ok(Reply::Trap(
            attributes.get("message").unwrap_or("unknown error").to_string(),
        )),
        "!fatal" => Ok(Reply::Fatal(
            rest.first().cloned().unwrap_or_else(|| "connection closed".into()),
        )),
        other => Err(DeviceError::Protocol(format!("unknown reply type '{}'", other))),
    }
}

/// Reads reply sentences up to `!done`
///
/// A `!trap` is remembered and reported once the matching `!done` arrives so
/// the stream stays in sync.
pub fn collect_reply<R: Read>(reader: &mut R) -> Result<Vec<RawCounterRecord>, DeviceError> {
    let mut rows = Vec::new();
    let mut trap = None;

    loop {
        let sentence = read_sentence(reader)?;
        if sentence.is_empty() {
            continue;
        }

        match parse_reply(&sentence)? {
            Reply::Re(row) => rows.push(row),
            Reply::Trap(message) => trap = Some(message),
            Reply::Fatal(message) => return Err(DeviceError::Trap(message)),
            Reply::Done => break,
        }
    }

    match trap {
        Some(message) => Err(DeviceError::Trap(message)),
        None => Ok(rows),
    }
}
