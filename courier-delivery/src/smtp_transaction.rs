//! One SMTP session against one candidate host.
//!
//! The session is greeting, EHLO (HELO as fallback), optional STARTTLS,
//! AUTH when gateway credentials are configured, MAIL FROM, one RCPT TO per
//! recipient, DATA and QUIT. Every failure is
//! translated into a [`SendFailure`] here so that nothing above this module
//! looks at transport errors directly.

use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use courier_common::{Mail, MailAddress, outgoing};
use courier_smtp::{ClientError, Reply, SmtpClient};

use crate::{
    classify::{ProtocolError, SendFailure, SmtpCommand},
    config::DeliveryConfiguration,
    dns_helper::HostAddress,
};

/// Sends a mail to a single host.
#[async_trait]
pub trait HostDelivery: Send + Sync {
    /// Delivers `mail` to `recipients` through `host`.
    ///
    /// # Errors
    ///
    /// Any failure, including partial ones where only some recipients were
    /// accepted.
    async fn try_delivery_to_host(
        &self,
        mail: &Mail,
        recipients: &[MailAddress],
        host: &HostAddress,
    ) -> Result<(), SendFailure>;
}

/// [`HostDelivery`] over a real SMTP connection.
pub struct SmtpHostDelivery {
    config: Arc<DeliveryConfiguration>,
}

impl SmtpHostDelivery {
    #[must_use]
    pub const fn new(config: Arc<DeliveryConfiguration>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl HostDelivery for SmtpHostDelivery {
    async fn try_delivery_to_host(
        &self,
        mail: &Mail,
        recipients: &[MailAddress],
        host: &HostAddress,
    ) -> Result<(), SendFailure> {
        SmtpTransaction {
            mail,
            recipients,
            host,
            config: &self.config,
        }
        .execute()
        .await
    }
}

#[derive(Debug)]
enum TlsNegotiation {
    /// Carries the EHLO reply of the encrypted session.
    Encrypted(Reply),
    Skipped,
    /// Opportunistic STARTTLS failed; the session must be restarted in plain text.
    RetryWithoutTls,
}

/// Recipients sorted by how the server answered their RCPT TO.
#[derive(Default)]
struct RecipientReplies {
    accepted: Vec<MailAddress>,
    unsent: Vec<MailAddress>,
    invalid: Vec<MailAddress>,
    failures: Vec<ProtocolError>,
}

impl RecipientReplies {
    fn into_partial(self) -> SendFailure {
        SendFailure::Partial {
            valid_sent: self.accepted,
            valid_unsent: self.unsent,
            invalid: self.invalid,
            error: ProtocolError::new("Invalid Addresses").with_chain(self.failures),
        }
    }
}

struct SmtpTransaction<'a> {
    mail: &'a Mail,
    recipients: &'a [MailAddress],
    host: &'a HostAddress,
    config: &'a DeliveryConfiguration,
}

impl SmtpTransaction<'_> {
    async fn execute(self) -> Result<(), SendFailure> {
        if self.config.accept_invalid_certs {
            outgoing!(
                level = WARN,
                host = %self.host,
                "TLS certificate validation is disabled for this connection"
            );
        }

        let mut client = self.connect_and_greet().await?;
        let mut extensions = self.hello(&mut client).await?;

        match self.negotiate_tls(&mut client, extensions.as_ref()).await? {
            TlsNegotiation::Encrypted(ehlo) => extensions = Some(ehlo),
            TlsNegotiation::Skipped => {}
            TlsNegotiation::RetryWithoutTls => {
                outgoing!(
                    level = INFO,
                    host = %self.host,
                    "Reconnecting without STARTTLS"
                );
                drop(client);
                client = self.connect_and_greet().await?;
                extensions = self.hello(&mut client).await?;
            }
        }

        self.authenticate(&mut client, extensions.as_ref()).await?;

        self.send_mail_from(&mut client).await?;
        let replies = self.send_rcpt_to(&mut client).await?;

        if replies.accepted.is_empty() {
            self.quit(&mut client).await;
            return Err(replies.into_partial());
        }

        self.send_message_data(&mut client).await?;
        self.quit(&mut client).await;

        outgoing!(
            level = INFO,
            mail = %self.mail.name(),
            host = %self.host,
            accepted = replies.accepted.len(),
            "Mail delivered"
        );

        if replies.failures.is_empty() {
            Ok(())
        } else {
            Err(replies.into_partial())
        }
    }

    /// Runs one protocol step under `limit`, translating transport problems.
    async fn step<F>(&self, command: SmtpCommand, limit: Duration, step: F) -> Result<Reply, SendFailure>
    where
        F: Future<Output = Result<Reply, ClientError>> + Send,
    {
        match tokio::time::timeout(limit, step).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(err)) => Err(self.client_failure(command, &err)),
            Err(_) => Err(SendFailure::Connection(ProtocolError {
                command: Some(command),
                ..ProtocolError::new(format!(
                    "{command} to {} timed out after {limit:?}",
                    self.host
                ))
            })),
        }
    }

    fn client_failure(&self, command: SmtpCommand, err: &ClientError) -> SendFailure {
        let error = ProtocolError {
            command: Some(command),
            ..ProtocolError::new(format!("{command} to {} failed: {err}", self.host))
        };

        if err.is_io() {
            SendFailure::Connection(error)
        } else {
            SendFailure::Protocol(error)
        }
    }

    async fn connect_and_greet(&self) -> Result<SmtpClient, SendFailure> {
        let timeouts = &self.config.smtp_timeouts;
        let connect = SmtpClient::connect(self.host.address(), self.host.hostname());

        let client = match tokio::time::timeout(timeouts.connect(), connect).await {
            Ok(Ok(client)) => client,
            Ok(Err(err)) => return Err(self.client_failure(SmtpCommand::Connect, &err)),
            Err(_) => {
                return Err(SendFailure::Connection(ProtocolError {
                    command: Some(SmtpCommand::Connect),
                    ..ProtocolError::new(format!(
                        "Connection to {} timed out after {:?}",
                        self.host,
                        timeouts.connect()
                    ))
                }));
            }
        };

        let mut client = client.accept_invalid_certs(self.config.accept_invalid_certs);

        let greeting = self
            .step(SmtpCommand::Connect, timeouts.connect(), client.read_greeting())
            .await?;

        if !greeting.is_positive() {
            return Err(SendFailure::Connection(ProtocolError::reply(
                SmtpCommand::Connect,
                greeting.code,
                greeting.message(),
            )));
        }

        outgoing!(host = %self.host, greeting = %greeting, "Connected");
        Ok(client)
    }

    /// EHLO, or HELO when the server refuses EHLO outright. Returns the EHLO
    /// reply when there is one.
    async fn hello(&self, client: &mut SmtpClient) -> Result<Option<Reply>, SendFailure> {
        let limit = Duration::from_secs(self.config.smtp_timeouts.ehlo_secs);
        let helo_name = self.config.helo_name.as_str();

        let ehlo = self.step(SmtpCommand::Ehlo, limit, client.ehlo(helo_name)).await?;
        if ehlo.is_positive() {
            return Ok(Some(ehlo));
        }

        if !ehlo.is_permanent() {
            return Err(SendFailure::Connection(ProtocolError::reply(
                SmtpCommand::Ehlo,
                ehlo.code,
                ehlo.message(),
            )));
        }

        let helo = self.step(SmtpCommand::Helo, limit, client.helo(helo_name)).await?;
        if helo.is_positive() {
            return Ok(None);
        }

        Err(SendFailure::Protocol(ProtocolError::reply(
            SmtpCommand::Helo,
            helo.code,
            helo.message(),
        )))
    }

    async fn negotiate_tls(
        &self,
        client: &mut SmtpClient,
        extensions: Option<&Reply>,
    ) -> Result<TlsNegotiation, SendFailure> {
        let require = self.config.require_tls;
        let advertised = extensions.is_some_and(|reply| reply.has_extension("STARTTLS"));

        if !advertised {
            if require {
                return Err(SendFailure::Connection(ProtocolError {
                    command: Some(SmtpCommand::StartTls),
                    ..ProtocolError::new(format!(
                        "{} does not offer STARTTLS and encryption is required",
                        self.host
                    ))
                }));
            }
            return Ok(TlsNegotiation::Skipped);
        }

        if !require && !self.config.start_tls {
            return Ok(TlsNegotiation::Skipped);
        }

        let limit = Duration::from_secs(self.config.smtp_timeouts.starttls_secs);
        let failure = match self.step(SmtpCommand::StartTls, limit, client.starttls()).await {
            Ok(reply) if reply.is_positive() => None,
            Ok(reply) => Some(SendFailure::Connection(ProtocolError::reply(
                SmtpCommand::StartTls,
                reply.code,
                reply.message(),
            ))),
            Err(failure) => Some(failure),
        };

        if let Some(failure) = failure {
            if require {
                return Err(failure);
            }

            outgoing!(
                level = INFO,
                host = %self.host,
                error = %failure,
                "Opportunistic STARTTLS failed"
            );
            return Ok(TlsNegotiation::RetryWithoutTls);
        }

        let ehlo_limit = Duration::from_secs(self.config.smtp_timeouts.ehlo_secs);
        let ehlo = self
            .step(SmtpCommand::Ehlo, ehlo_limit, client.ehlo(&self.config.helo_name))
            .await?;
        if !ehlo.is_positive() {
            return Err(SendFailure::Connection(ProtocolError::reply(
                SmtpCommand::Ehlo,
                ehlo.code,
                ehlo.message(),
            )));
        }

        outgoing!(level = DEBUG, host = %self.host, "Session encrypted with STARTTLS");
        Ok(TlsNegotiation::Encrypted(ehlo))
    }

    /// `AUTH PLAIN` with the gateway credentials. A server that does not
    /// offer PLAIN gets the mail unauthenticated; a refused login fails the
    /// session.
    async fn authenticate(
        &self,
        client: &mut SmtpClient,
        extensions: Option<&Reply>,
    ) -> Result<(), SendFailure> {
        let Some(credentials) = &self.config.gateway_credentials else {
            return Ok(());
        };

        if !extensions.is_some_and(|reply| reply.has_auth_mechanism("PLAIN")) {
            outgoing!(
                level = WARN,
                host = %self.host,
                "Gateway does not offer AUTH PLAIN, sending without authenticating"
            );
            return Ok(());
        }

        let limit = Duration::from_secs(self.config.smtp_timeouts.auth_secs);
        let reply = self
            .step(
                SmtpCommand::Auth,
                limit,
                client.auth_plain(credentials.username(), credentials.password()),
            )
            .await?;

        if reply.code != 235 {
            return Err(SendFailure::Protocol(ProtocolError::reply(
                SmtpCommand::Auth,
                reply.code,
                reply.message(),
            )));
        }

        outgoing!(
            level = DEBUG,
            host = %self.host,
            username = credentials.username(),
            "Authenticated to gateway"
        );
        Ok(())
    }

    async fn send_mail_from(&self, client: &mut SmtpClient) -> Result<(), SendFailure> {
        let limit = Duration::from_secs(self.config.smtp_timeouts.mail_from_secs);
        let sender = self.mail.sender().map(ToString::to_string);

        let reply = self
            .step(SmtpCommand::MailFrom, limit, client.mail_from(sender.as_deref()))
            .await?;

        if reply.is_positive() {
            Ok(())
        } else {
            Err(SendFailure::Protocol(ProtocolError::reply(
                SmtpCommand::MailFrom,
                reply.code,
                reply.message(),
            )))
        }
    }

    async fn send_rcpt_to(&self, client: &mut SmtpClient) -> Result<RecipientReplies, SendFailure> {
        let limit = Duration::from_secs(self.config.smtp_timeouts.rcpt_to_secs);
        let mut replies = RecipientReplies::default();

        for recipient in self.recipients {
            let address = recipient.to_string();
            let reply = self
                .step(SmtpCommand::RcptTo, limit, client.rcpt_to(&address))
                .await?;

            if reply.is_positive() {
                replies.accepted.push(recipient.clone());
                continue;
            }

            outgoing!(
                level = DEBUG,
                host = %self.host,
                recipient = %recipient,
                reply = %reply,
                "Recipient refused"
            );

            if reply.is_permanent() {
                replies.invalid.push(recipient.clone());
            } else {
                replies.unsent.push(recipient.clone());
            }

            replies.failures.push(
                ProtocolError::reply(SmtpCommand::RcptTo, reply.code, reply.message())
                    .with_address(recipient.clone()),
            );
        }

        Ok(replies)
    }

    async fn send_message_data(&self, client: &mut SmtpClient) -> Result<(), SendFailure> {
        let limit = Duration::from_secs(self.config.smtp_timeouts.data_secs);

        let reply = self.step(SmtpCommand::Data, limit, client.data()).await?;
        if reply.code != 354 {
            return Err(SendFailure::Protocol(ProtocolError::reply(
                SmtpCommand::Data,
                reply.code,
                reply.message(),
            )));
        }

        let reply = self
            .step(SmtpCommand::Data, limit, client.send_content(self.mail.data()))
            .await?;
        if reply.is_positive() {
            Ok(())
        } else {
            Err(SendFailure::Protocol(ProtocolError::reply(
                SmtpCommand::Data,
                reply.code,
                reply.message(),
            )))
        }
    }

    /// The mail is already accepted or abandoned at this point, so problems
    /// with QUIT are only logged.
    async fn quit(&self, client: &mut SmtpClient) {
        let limit = Duration::from_secs(self.config.smtp_timeouts.quit_secs);
        if let Err(failure) = self.step(SmtpCommand::Quit, limit, client.quit()).await {
            outgoing!(
                level = DEBUG,
                host = %self.host,
                error = %failure,
                "QUIT failed"
            );
        }
    }
}
