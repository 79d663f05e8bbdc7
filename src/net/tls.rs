//! TLS session engine layered on a raw connection.
//!
//! # Responsibilities
//! - Build rustls client/server configurations from PEM credentials
//! - Pump ciphertext from received segments through the engine
//! - Encrypt application bytes and transmit them within the send window
//! - Translate engine failures into the transport error space
//!
//! # Data Flow
//! ```text
//! DataReceived segment
//!     → TlsSession::feed_ciphertext (staging buffer + consumed cursor)
//!     → TlsEngine::read_tls / read_plaintext
//!     → TlsOutput::{HandshakeComplete, Plaintext, PeerClosed, Failed}
//!
//! Connection::add
//!     → TlsSession::encrypt_and_send
//!     → TlsEngine::write_plaintext / write_tls
//!     → Transmit::write + output (≤ send window, ≤ 2 × MSS per chunk)
//! ```
//!
//! # Design Decisions
//! - Without a root CA, any server certificate is accepted
//! - The pump yields the thread between iterations; this is a scheduling
//!   hint for the rest of the process, not a timing dependency
//! - Ciphertext that does not fit the send window waits in `outgoing` and
//!   goes out on the next `flush`
//! - Pre-shared-key credentials are validated but the engine has no PSK
//!   suites, so activation fails with `If`

use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, ClientConnection, DigitallySignedStruct, RootCertStore, ServerConfig, ServerConnection, SignatureScheme};
use thiserror::Error;

use crate::error::ErrorCode;
use crate::observability::metrics;

/// Handshake must finish within this many milliseconds of the last received packet.
pub const TLS_HANDSHAKE_TIMEOUT_MS: u64 = 5000;

/// Longest pre-shared key, in bytes.
pub const PSK_MAX_LEN: usize = 32;

/// Longest pre-shared-key identity, in bytes.
pub const PSK_IDENTITY_MAX_LEN: usize = 64;

const READ_CHUNK: usize = 4096;

/// Credential or configuration problem detected before any bytes move.
#[derive(Debug, Error)]
pub enum TlsSetupError {
    #[error("invalid PEM in {what}: {source}")]
    Pem {
        what: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("no certificate found in {0}")]
    NoCertificate(&'static str),

    #[error("no private key found")]
    NoPrivateKey,

    #[error("client certificate and key must be supplied together")]
    IncompleteClientAuth,

    #[error("PSK identity exceeds {} bytes", PSK_IDENTITY_MAX_LEN)]
    PskIdentityTooLong,

    #[error("PSK must be an even number of hex digits, at most {}", PSK_MAX_LEN * 2)]
    PskLength,

    #[error("PSK is not valid hex: {0}")]
    PskHex(#[from] hex::FromHexError),

    #[error("pre-shared-key suites are not available in this TLS engine")]
    PskUnsupported,

    #[error("invalid server name: {0}")]
    ServerName(String),

    #[error("TLS configuration rejected: {0}")]
    Rustls(#[from] rustls::Error),
}

impl TlsSetupError {
    /// Code reported to `on_error` (before the TLS offset is applied).
    pub fn transport_code(&self) -> ErrorCode {
        match self {
            TlsSetupError::PskUnsupported => ErrorCode::If,
            _ => ErrorCode::Arg,
        }
    }
}

/// Map an engine failure into the transport space.
pub fn map_rustls_error(err: &rustls::Error) -> ErrorCode {
    use rustls::Error as E;
    match err {
        E::InvalidCertificate(_) | E::NoCertificatesPresented => ErrorCode::Val,
        E::AlertReceived(_) => ErrorCode::Rst,
        E::DecryptError
        | E::EncryptError
        | E::InvalidMessage(_)
        | E::PeerMisbehaved(_)
        | E::InappropriateMessage { .. }
        | E::InappropriateHandshakeMessage { .. } => ErrorCode::Buf,
        E::PeerIncompatible(_) => ErrorCode::Abrt,
        _ => ErrorCode::Conn,
    }
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn parse_certs(pem: &[u8], what: &'static str) -> Result<Vec<CertificateDer<'static>>, TlsSetupError> {
    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsSetupError::Pem { what, source })?;
    if certs.is_empty() {
        return Err(TlsSetupError::NoCertificate(what));
    }
    Ok(certs)
}

fn parse_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>, TlsSetupError> {
    rustls_pemfile::private_key(&mut &pem[..])
        .map_err(|source| TlsSetupError::Pem { what: "private key", source })?
        .ok_or(TlsSetupError::NoPrivateKey)
}

/// Validated pre-shared-key identity and secret.
#[derive(Clone)]
pub struct PskCredentials {
    identity: String,
    secret: Vec<u8>,
}

impl PskCredentials {
    /// Validate an identity and a hex-encoded secret.
    pub fn new(identity: &str, hex_secret: &str) -> Result<Self, TlsSetupError> {
        if identity.len() > PSK_IDENTITY_MAX_LEN {
            return Err(TlsSetupError::PskIdentityTooLong);
        }
        if hex_secret.len() > PSK_MAX_LEN * 2 || hex_secret.len() % 2 != 0 {
            return Err(TlsSetupError::PskLength);
        }
        let secret = hex::decode(hex_secret)?;
        Ok(Self {
            identity: identity.to_string(),
            secret,
        })
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn secret_len(&self) -> usize {
        self.secret.len()
    }
}

impl std::fmt::Debug for PskCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PskCredentials")
            .field("identity", &self.identity)
            .field("secret_len", &self.secret.len())
            .finish()
    }
}

/// Activation mode of a secure client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsMode {
    Certificate,
    Psk,
}

/// Material a secure client brings to the handshake.
#[derive(Debug, Clone, Default)]
pub struct ClientCredentials {
    pub root_ca: Option<Vec<u8>>,
    pub client_cert: Option<Vec<u8>>,
    pub client_key: Option<Vec<u8>>,
    pub psk: Option<PskCredentials>,
}

impl ClientCredentials {
    /// PSK wins when both identity and secret are set.
    pub fn mode(&self) -> TlsMode {
        if self.psk.is_some() {
            TlsMode::Psk
        } else {
            TlsMode::Certificate
        }
    }

    /// Build a client configuration.
    pub fn client_config(&self) -> Result<Arc<ClientConfig>, TlsSetupError> {
        if self.mode() == TlsMode::Psk {
            return Err(TlsSetupError::PskUnsupported);
        }

        let provider = provider();
        let builder = ClientConfig::builder_with_provider(provider.clone()).with_safe_default_protocol_versions()?;

        let builder = match &self.root_ca {
            Some(pem) => {
                let mut roots = RootCertStore::empty();
                for cert in parse_certs(pem, "root CA")? {
                    roots.add(cert)?;
                }
                builder.with_root_certificates(roots)
            }
            None => builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(PermissiveVerifier {
                    algorithms: provider.signature_verification_algorithms,
                })),
        };

        let config = match (&self.client_cert, &self.client_key) {
            (Some(cert), Some(key)) => {
                builder.with_client_auth_cert(parse_certs(cert, "client certificate")?, parse_key(key)?)?
            }
            (None, None) => builder.with_no_client_auth(),
            _ => return Err(TlsSetupError::IncompleteClientAuth),
        };

        Ok(Arc::new(config))
    }
}

/// Certificate chain and key presented by a secure listener.
#[derive(Debug, Clone)]
pub struct ServerCredentials {
    pub cert_chain: Vec<u8>,
    pub private_key: Vec<u8>,
}

impl ServerCredentials {
    pub fn new(cert_chain: impl Into<Vec<u8>>, private_key: impl Into<Vec<u8>>) -> Self {
        Self {
            cert_chain: cert_chain.into(),
            private_key: private_key.into(),
        }
    }

    pub fn server_config(&self) -> Result<Arc<ServerConfig>, TlsSetupError> {
        let config = ServerConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(parse_certs(&self.cert_chain, "certificate chain")?, parse_key(&self.private_key)?)?;
        Ok(Arc::new(config))
    }
}

/// SNI for a connection: the hostname when one was used, else the address.
pub fn server_name_for(host: Option<&str>, ip: Ipv4Addr) -> Result<ServerName<'static>, TlsSetupError> {
    match host {
        Some(host) => ServerName::try_from(host.to_string()).map_err(|_| TlsSetupError::ServerName(host.to_string())),
        None => Ok(ServerName::IpAddress(IpAddr::V4(ip).into())),
    }
}

/// Accepts every server certificate. Signatures are still checked.
#[derive(Debug)]
struct PermissiveVerifier {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for PermissiveVerifier {
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
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Result of pulling plaintext out of an engine.
#[derive(Debug)]
pub enum PlainRead {
    Data(Bytes),
    /// Nothing buffered right now.
    WouldBlock,
    /// The peer sent a clean close notification.
    Closed,
}

/// Opaque record-protocol engine.
pub trait TlsEngine: Send {
    /// Absorb ciphertext and process it. Returns bytes consumed.
    fn read_tls(&mut self, ciphertext: &[u8]) -> Result<usize, ErrorCode>;
    fn is_handshaking(&self) -> bool;
    fn read_plaintext(&mut self) -> Result<PlainRead, ErrorCode>;
    /// Queue plaintext for encryption. Returns bytes accepted.
    fn write_plaintext(&mut self, plaintext: &[u8]) -> Result<usize, ErrorCode>;
    /// Drain ciphertext waiting to go out.
    fn write_tls(&mut self, out: &mut Vec<u8>) -> Result<usize, ErrorCode>;
    fn wants_write(&self) -> bool;
    fn send_close_notify(&mut self);
}

/// `TlsEngine` over a rustls connection (client or server side).
pub struct RustlsEngine {
    conn: rustls::Connection,
}

impl RustlsEngine {
    pub fn client(config: Arc<ClientConfig>, server_name: ServerName<'static>) -> Result<Self, TlsSetupError> {
        Ok(Self {
            conn: ClientConnection::new(config, server_name)?.into(),
        })
    }

    pub fn server(config: Arc<ServerConfig>) -> Result<Self, TlsSetupError> {
        Ok(Self {
            conn: ServerConnection::new(config)?.into(),
        })
    }
}

impl TlsEngine for RustlsEngine {
    fn read_tls(&mut self, ciphertext: &[u8]) -> Result<usize, ErrorCode> {
        let mut reader = ciphertext;
        let consumed = self.conn.read_tls(&mut reader).map_err(|e| {
            tracing::debug!(error = %e, "TLS read_tls failed");
            ErrorCode::Mem
        })?;
        self.conn.process_new_packets().map_err(|e| {
            tracing::debug!(error = %e, "TLS record processing failed");
            map_rustls_error(&e)
        })?;
        Ok(consumed)
    }

    fn is_handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }

    fn read_plaintext(&mut self) -> Result<PlainRead, ErrorCode> {
        let mut buf = [0u8; READ_CHUNK];
        match self.conn.reader().read(&mut buf) {
            Ok(0) => Ok(PlainRead::Closed),
            Ok(n) => Ok(PlainRead::Data(Bytes::copy_from_slice(&buf[..n]))),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(PlainRead::WouldBlock),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(PlainRead::Closed),
            Err(_) => Err(ErrorCode::Buf),
        }
    }

    fn write_plaintext(&mut self, plaintext: &[u8]) -> Result<usize, ErrorCode> {
        self.conn.writer().write(plaintext).map_err(|_| ErrorCode::Mem)
    }

    fn write_tls(&mut self, out: &mut Vec<u8>) -> Result<usize, ErrorCode> {
        self.conn.write_tls(out).map_err(|_| ErrorCode::Buf)
    }

    fn wants_write(&self) -> bool {
        self.conn.wants_write()
    }

    fn send_close_notify(&mut self) {
        self.conn.send_close_notify();
    }
}

/// Raw-connection primitives a session writes through.
pub trait Transmit {
    /// Bytes the stack will accept right now.
    fn sndbuf(&mut self) -> usize;
    fn mss(&mut self) -> u16;
    fn write(&mut self, data: &[u8]) -> Result<(), ErrorCode>;
    fn output(&mut self) -> Result<(), ErrorCode>;
}

/// Handshake progress of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    HandshakeInProgress,
    HandshakeComplete,
    Closed,
}

/// What one `feed_ciphertext` call produced, in order.
#[derive(Debug, PartialEq, Eq)]
pub enum TlsOutput {
    HandshakeComplete,
    Plaintext(Bytes),
    /// Clean close notification from the peer. Not an error.
    PeerClosed,
    Failed(ErrorCode),
}

/// One TLS session bound to one raw connection.
pub struct TlsSession {
    engine: Box<dyn TlsEngine>,
    state: SessionState,
    staging: BytesMut,
    consumed: usize,
    outgoing: BytesMut,
    last_write: usize,
    peer_closed: bool,
}

impl TlsSession {
    pub fn new(engine: Box<dyn TlsEngine>) -> Self {
        Self {
            engine,
            state: SessionState::Uninitialized,
            staging: BytesMut::new(),
            consumed: 0,
            outgoing: BytesMut::new(),
            last_write: 0,
            peer_closed: false,
        }
    }

    /// Create a client session and send the opening flight.
    pub fn begin_client(
        credentials: &ClientCredentials,
        server_name: ServerName<'static>,
        transmit: &mut dyn Transmit,
    ) -> Result<Self, ErrorCode> {
        let engine = credentials
            .client_config()
            .and_then(|config| RustlsEngine::client(config, server_name))
            .map_err(|e| {
                tracing::warn!(error = %e, "TLS client setup failed");
                e.transport_code()
            })?;

        let mut session = Self::new(Box::new(engine));
        session.start(transmit)?;
        Ok(session)
    }

    /// Create a server session. It waits for the peer's opening flight.
    pub fn begin_server(config: Arc<ServerConfig>) -> Result<Self, ErrorCode> {
        let engine = RustlsEngine::server(config).map_err(|e| {
            tracing::warn!(error = %e, "TLS server setup failed");
            e.transport_code()
        })?;
        let mut session = Self::new(Box::new(engine));
        session.state = SessionState::HandshakeInProgress;
        Ok(session)
    }

    /// Start the handshake. Needing more data from the peer is success.
    pub fn start(&mut self, transmit: &mut dyn Transmit) -> Result<(), ErrorCode> {
        self.state = SessionState::HandshakeInProgress;
        if let Err(code) = self.flush(transmit) {
            self.state = SessionState::Closed;
            return Err(code);
        }
        if !self.engine.is_handshaking() {
            self.state = SessionState::HandshakeComplete;
        }
        Ok(())
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_handshake_complete(&self) -> bool {
        self.state == SessionState::HandshakeComplete
    }

    /// Size of the most recent chunk handed to the stack.
    pub fn last_write(&self) -> usize {
        self.last_write
    }

    /// Ciphertext still waiting for send window.
    pub fn pending_outgoing(&self) -> usize {
        self.outgoing.len()
    }

    /// Stage received wire bytes and drive the engine until nothing moves.
    pub fn feed_ciphertext(&mut self, data: &[u8], transmit: &mut dyn Transmit) -> Vec<TlsOutput> {
        let mut out = Vec::new();
        if matches!(self.state, SessionState::Uninitialized | SessionState::Closed) {
            return out;
        }

        self.staging.extend_from_slice(data);

        loop {
            let mut progressed = false;

            if self.consumed < self.staging.len() {
                match self.engine.read_tls(&self.staging[self.consumed..]) {
                    Ok(n) => {
                        self.consumed += n;
                        progressed |= n > 0;
                    }
                    Err(code) => {
                        self.fail(code, transmit, &mut out);
                        break;
                    }
                }
            }

            if self.state == SessionState::HandshakeInProgress && !self.engine.is_handshaking() {
                self.state = SessionState::HandshakeComplete;
                metrics::record_handshake("complete");
                out.push(TlsOutput::HandshakeComplete);
                progressed = true;
            }

            if self.state == SessionState::HandshakeComplete {
                if let Err(code) = self.drain_plaintext(&mut out, &mut progressed) {
                    self.fail(code, transmit, &mut out);
                    break;
                }
            }

            if let Err(code) = self.flush(transmit) {
                self.fail(code, transmit, &mut out);
                break;
            }

            if !progressed {
                break;
            }
            std::thread::yield_now();
        }

        self.compact();
        out
    }

    fn drain_plaintext(&mut self, out: &mut Vec<TlsOutput>, progressed: &mut bool) -> Result<(), ErrorCode> {
        loop {
            match self.engine.read_plaintext()? {
                PlainRead::Data(bytes) => {
                    out.push(TlsOutput::Plaintext(bytes));
                    *progressed = true;
                }
                PlainRead::WouldBlock => return Ok(()),
                PlainRead::Closed => {
                    if !self.peer_closed {
                        self.peer_closed = true;
                        out.push(TlsOutput::PeerClosed);
                    }
                    return Ok(());
                }
            }
        }
    }

    fn fail(&mut self, code: ErrorCode, transmit: &mut dyn Transmit, out: &mut Vec<TlsOutput>) {
        if self.state == SessionState::HandshakeInProgress {
            metrics::record_handshake("failed");
        }
        // Best effort: a queued alert tells the peer why.
        let _ = self.flush(transmit);
        self.state = SessionState::Closed;
        out.push(TlsOutput::Failed(code));
    }

    fn compact(&mut self) {
        if self.consumed == 0 {
            return;
        }
        self.staging.advance(self.consumed);
        self.consumed = 0;
    }

    /// Encrypt `plaintext` and send what the window allows.
    ///
    /// Returns the plaintext length accepted by the engine.
    pub fn encrypt_and_send(&mut self, plaintext: &[u8], transmit: &mut dyn Transmit) -> Result<usize, ErrorCode> {
        if self.state == SessionState::Closed {
            return Err(ErrorCode::Clsd);
        }
        if transmit.sndbuf() == 0 {
            return Err(ErrorCode::Mem);
        }
        let accepted = self.engine.write_plaintext(plaintext)?;
        self.flush(transmit)?;
        Ok(accepted)
    }

    /// Move engine ciphertext to the wire, bounded by the send window.
    pub fn flush(&mut self, transmit: &mut dyn Transmit) -> Result<(), ErrorCode> {
        while self.engine.wants_write() {
            let mut buf = Vec::new();
            if self.engine.write_tls(&mut buf)? == 0 {
                break;
            }
            self.outgoing.extend_from_slice(&buf);
        }

        while !self.outgoing.is_empty() {
            let window = transmit.sndbuf();
            if window == 0 {
                break;
            }
            let max_chunk = 2 * transmit.mss() as usize;
            let chunk = self.outgoing.len().min(window).min(max_chunk.max(1));
            transmit.write(&self.outgoing[..chunk])?;
            self.outgoing.advance(chunk);
            self.last_write = chunk;
            transmit.output()?;
        }
        Ok(())
    }

    /// Release the session. Sends close-notify when the transport is still usable.
    pub fn teardown(&mut self, transmit: Option<&mut dyn Transmit>) {
        if self.state == SessionState::HandshakeComplete {
            if let Some(transmit) = transmit {
                self.engine.send_close_notify();
                let _ = self.flush(transmit);
            }
        }
        self.state = SessionState::Closed;
        self.staging.clear();
        self.outgoing.clear();
        self.consumed = 0;
    }
}
