use std::{net::SocketAddr, sync::Arc};

use base64::{Engine, engine::general_purpose::STANDARD};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use tokio_rustls::{
    TlsConnector,
    rustls::{
        ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
        client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
        pki_types::{CertificateDer, ServerName, UnixTime},
    },
};

use courier_common::tracing;

use super::{
    error::{ClientError, Result},
    reply::Reply,
};

const READ_CHUNK: usize = 4096;

/// Replies larger than this are treated as a protocol violation.
const MAX_REPLY_SIZE: usize = 64 * 1024;

enum Connection {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl Connection {
    async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Self::Plain(stream) => stream.write_all(data).await?,
            Self::Tls(stream) => stream.write_all(data).await?,
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        match self {
            Self::Plain(stream) => stream.flush().await?,
            Self::Tls(stream) => stream.flush().await?,
        }
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let read = match self {
            Self::Plain(stream) => stream.read(buf).await?,
            Self::Tls(stream) => stream.read(buf).await?,
        };

        if read == 0 {
            return Err(ClientError::ConnectionClosed);
        }

        Ok(read)
    }

    async fn into_tls(self, server_name: &str, accept_invalid_certs: bool) -> Result<Self> {
        let Self::Plain(stream) = self else {
            return Err(ClientError::Tls("Connection is already encrypted".to_string()));
        };

        let mut roots = RootCertStore::empty();
        let native = rustls_native_certs::load_native_certs();
        for cert in native.certs {
            if let Err(err) = roots.add(cert) {
                tracing::debug!(%err, "Skipping unusable native certificate");
            }
        }
        if !native.errors.is_empty() {
            tracing::warn!(errors = ?native.errors, "Some native certificates could not be loaded");
        }

        let mut config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        if accept_invalid_certs {
            config
                .dangerous()
                .set_certificate_verifier(Arc::new(AcceptAnyCertificate));
        }

        let name = ServerName::try_from(server_name.to_string())
            .map_err(|err| ClientError::Tls(format!("Invalid server name {server_name}: {err}")))?;

        let stream = TlsConnector::from(Arc::new(config))
            .connect(name, stream)
            .await
            .map_err(|err| ClientError::Tls(err.to_string()))?;

        Ok(Self::Tls(Box::new(stream)))
    }
}

/// Certificate verifier used when `accept_invalid_certs` is configured.
#[derive(Debug)]
struct AcceptAnyCertificate;

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, tokio_rustls::rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ED25519,
        ]
    }
}

/// One SMTP session with a remote mail exchanger.
///
/// Every command method sends the command and waits for the complete reply;
/// a negative reply is returned as a [`Reply`], not as an error. Errors are
/// reserved for the transport and for unparseable replies.
pub struct SmtpClient {
    connection: Option<Connection>,
    buffer: Vec<u8>,
    server_name: String,
    accept_invalid_certs: bool,
}

impl SmtpClient {
    /// Opens a TCP connection to `address`. `server_name` is used for TLS
    /// verification after STARTTLS.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Io`] when the connection cannot be established.
    pub async fn connect(address: SocketAddr, server_name: impl Into<String>) -> Result<Self> {
        let stream = TcpStream::connect(address).await?;

        Ok(Self {
            connection: Some(Connection::Plain(stream)),
            buffer: Vec::with_capacity(READ_CHUNK),
            server_name: server_name.into(),
            accept_invalid_certs: false,
        })
    }

    #[must_use]
    pub const fn accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }

    #[must_use]
    pub const fn is_encrypted(&self) -> bool {
        matches!(self.connection, Some(Connection::Tls(_)))
    }

    /// # Errors
    ///
    /// Transport failures and malformed replies.
    pub async fn read_greeting(&mut self) -> Result<Reply> {
        self.read_reply().await
    }

    /// # Errors
    ///
    /// Transport failures and malformed replies.
    pub async fn command(&mut self, command: &str) -> Result<Reply> {
        tracing::trace!(command, "C:");
        let connection = self.connection_mut()?;
        connection.write_all(command.as_bytes()).await?;
        connection.write_all(b"\r\n").await?;
        connection.flush().await?;

        let reply = self.read_reply().await?;
        tracing::trace!(code = reply.code, message = %reply.message(), "S:");
        Ok(reply)
    }

    /// # Errors
    ///
    /// Transport failures and malformed replies.
    pub async fn ehlo(&mut self, helo_name: &str) -> Result<Reply> {
        self.command(&format!("EHLO {helo_name}")).await
    }

    /// # Errors
    ///
    /// Transport failures and malformed replies.
    pub async fn helo(&mut self, helo_name: &str) -> Result<Reply> {
        self.command(&format!("HELO {helo_name}")).await
    }

    /// `AUTH PLAIN` with the initial response inline (RFC 4616: an empty
    /// authorization identity, then `username` and `password`).
    ///
    /// # Errors
    ///
    /// Transport failures and malformed replies.
    pub async fn auth_plain(&mut self, username: &str, password: &str) -> Result<Reply> {
        let payload = STANDARD.encode(format!("\0{username}\0{password}"));
        self.command(&format!("AUTH PLAIN {payload}")).await
    }

    /// Sends `MAIL FROM`; `None` is the null reverse-path `<>`.
    ///
    /// # Errors
    ///
    /// Transport failures and malformed replies.
    pub async fn mail_from(&mut self, sender: Option<&str>) -> Result<Reply> {
        self.command(&format!("MAIL FROM:<{}>", sender.unwrap_or_default()))
            .await
    }

    /// # Errors
    ///
    /// Transport failures and malformed replies.
    pub async fn rcpt_to(&mut self, recipient: &str) -> Result<Reply> {
        self.command(&format!("RCPT TO:<{recipient}>")).await
    }

    /// # Errors
    ///
    /// Transport failures and malformed replies.
    pub async fn data(&mut self) -> Result<Reply> {
        self.command("DATA").await
    }

    /// Transmits the message content after a positive `DATA` reply.
    ///
    /// Line endings are normalised to CRLF, lines starting with `.` are
    /// dot-stuffed, and the terminating `.` line is appended.
    ///
    /// # Errors
    ///
    /// Transport failures and malformed replies.
    pub async fn send_content(&mut self, content: &[u8]) -> Result<Reply> {
        let mut encoded = Vec::with_capacity(content.len() + 64);
        if !content.is_empty() {
            let content = content.strip_suffix(b"\n").unwrap_or(content);
            for line in content.split(|&b| b == b'\n') {
                let line = line.strip_suffix(b"\r").unwrap_or(line);
                if line.first() == Some(&b'.') {
                    encoded.push(b'.');
                }
                encoded.extend_from_slice(line);
                encoded.extend_from_slice(b"\r\n");
            }
        }
        encoded.extend_from_slice(b".\r\n");

        let connection = self.connection_mut()?;
        connection.write_all(&encoded).await?;
        connection.flush().await?;

        self.read_reply().await
    }

    /// Sends `STARTTLS` and, when the server accepts, upgrades the connection.
    ///
    /// # Errors
    ///
    /// Transport failures, malformed replies and TLS handshake failures.
    pub async fn starttls(&mut self) -> Result<Reply> {
        let reply = self.command("STARTTLS").await?;

        if reply.is_positive() {
            let plain = self.connection.take().ok_or(ClientError::ConnectionClosed)?;
            self.buffer.clear();
            self.connection = Some(
                plain
                    .into_tls(&self.server_name, self.accept_invalid_certs)
                    .await?,
            );
        }

        Ok(reply)
    }

    /// # Errors
    ///
    /// Transport failures and malformed replies.
    pub async fn quit(&mut self) -> Result<Reply> {
        self.command("QUIT").await
    }

    fn connection_mut(&mut self) -> Result<&mut Connection> {
        self.connection.as_mut().ok_or(ClientError::ConnectionClosed)
    }

    async fn read_reply(&mut self) -> Result<Reply> {
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            if let Some((reply, consumed)) = Reply::parse(&self.buffer)? {
                self.buffer.drain(..consumed);
                return Ok(reply);
            }

            if self.buffer.len() > MAX_REPLY_SIZE {
                return Err(ClientError::Parse(format!(
                    "Reply exceeds {MAX_REPLY_SIZE} bytes"
                )));
            }

            let read = self.connection_mut()?.read(&mut chunk).await?;
            self.buffer.extend_from_slice(&chunk[..read]);
        }
    }
}
