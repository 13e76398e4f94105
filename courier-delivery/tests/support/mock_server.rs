//! Scripted SMTP server for end-to-end delivery tests
//!
//! Every connection is answered from the same [`Script`]; the server records
//! each command line and each message body it receives so that tests can
//! assert on the conversation afterwards.
//!
//! ```rust,ignore
//! let server = MockSmtpServer::start(
//!     Script::default().rcpt("gone@example.com", 550, "No such user"),
//! )
//! .await;
//! ```
#![allow(dead_code)]

use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use parking_lot::Mutex;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    task::JoinHandle,
};

#[derive(Debug, Clone)]
pub struct Response {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Response {
    pub fn new(code: u16, text: impl Into<String>) -> Self {
        Self {
            code,
            lines: vec![text.into()],
        }
    }

    fn encode(&self) -> Vec<u8> {
        let last = self.lines.len().saturating_sub(1);
        self.lines
            .iter()
            .enumerate()
            .map(|(index, line)| {
                let separator = if index == last { ' ' } else { '-' };
                format!("{}{separator}{line}\r\n", self.code)
            })
            .collect::<String>()
            .into_bytes()
    }
}

/// How the server answers each command.
#[derive(Debug, Clone)]
pub struct Script {
    pub greeting: Response,
    pub ehlo: Response,
    pub helo: Response,
    pub starttls: Response,
    pub auth: Response,
    pub mail_from: Response,
    pub rcpt: Response,
    /// RCPT TO answers for specific recipients, keyed by bare address.
    pub rcpt_overrides: HashMap<String, Response>,
    pub data: Response,
    pub data_end: Response,
    pub quit: Response,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            greeting: Response::new(220, "mock.example.com ESMTP ready"),
            ehlo: Response {
                code: 250,
                lines: vec!["mock.example.com".to_string(), "8BITMIME".to_string()],
            },
            helo: Response::new(250, "mock.example.com"),
            starttls: Response::new(502, "Command not implemented"),
            auth: Response::new(502, "Command not implemented"),
            mail_from: Response::new(250, "Sender OK"),
            rcpt: Response::new(250, "Recipient OK"),
            rcpt_overrides: HashMap::new(),
            data: Response::new(354, "Start mail input; end with <CRLF>.<CRLF>"),
            data_end: Response::new(250, "Queued as 42"),
            quit: Response::new(221, "Bye"),
        }
    }
}

impl Script {
    #[must_use]
    pub fn greeting(mut self, code: u16, text: &str) -> Self {
        self.greeting = Response::new(code, text);
        self
    }

    #[must_use]
    pub fn ehlo(mut self, code: u16, text: &str) -> Self {
        self.ehlo = Response::new(code, text);
        self
    }

    /// Advertise STARTTLS and answer it with `code`.
    #[must_use]
    pub fn starttls(mut self, code: u16, text: &str) -> Self {
        self.ehlo.lines.push("STARTTLS".to_string());
        self.starttls = Response::new(code, text);
        self
    }

    /// Advertise `AUTH PLAIN LOGIN` and answer AUTH with `code`.
    #[must_use]
    pub fn auth(mut self, code: u16, text: &str) -> Self {
        self.ehlo.lines.push("AUTH PLAIN LOGIN".to_string());
        self.auth = Response::new(code, text);
        self
    }

    #[must_use]
    pub fn mail_from(mut self, code: u16, text: &str) -> Self {
        self.mail_from = Response::new(code, text);
        self
    }

    #[must_use]
    pub fn rcpt(mut self, address: &str, code: u16, text: &str) -> Self {
        self.rcpt_overrides
            .insert(address.to_string(), Response::new(code, text));
        self
    }

    #[must_use]
    pub fn data_end(mut self, code: u16, text: &str) -> Self {
        self.data_end = Response::new(code, text);
        self
    }
}

#[derive(Debug, Default)]
struct Transcript {
    connections: usize,
    commands: Vec<String>,
    messages: Vec<Vec<u8>>,
}

pub struct MockSmtpServer {
    addr: SocketAddr,
    transcript: Arc<Mutex<Transcript>>,
    task: JoinHandle<()>,
}

impl MockSmtpServer {
    pub async fn start(script: Script) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock SMTP server");
        let addr = listener.local_addr().expect("mock server address");

        let script = Arc::new(script);
        let transcript = Arc::new(Mutex::new(Transcript::default()));

        let task = {
            let transcript = Arc::clone(&transcript);
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    transcript.lock().connections += 1;
                    let script = Arc::clone(&script);
                    let transcript = Arc::clone(&transcript);
                    tokio::spawn(async move {
                        if let Err(err) = serve(stream, &script, &transcript).await {
                            tracing::debug!("Mock server connection error: {err}");
                        }
                    });
                }
            })
        };

        Self {
            addr,
            transcript,
            task,
        }
    }

    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn connections(&self) -> usize {
        self.transcript.lock().connections
    }

    /// Command lines in the order they arrived, across all connections.
    pub fn commands(&self) -> Vec<String> {
        self.transcript.lock().commands.clone()
    }

    pub fn messages(&self) -> Vec<Vec<u8>> {
        self.transcript.lock().messages.clone()
    }
}

impl Drop for MockSmtpServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(
    mut stream: TcpStream,
    script: &Script,
    transcript: &Mutex<Transcript>,
) -> std::io::Result<()> {
    let (reader, mut writer) = stream.split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    let unknown = Response::new(500, "Unknown command");

    writer.write_all(&script.greeting.encode()).await?;
    if script.greeting.code >= 400 {
        return Ok(());
    }

    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }

        let command = line.trim_end().to_string();
        transcript.lock().commands.push(command.clone());

        let verb = command
            .split([' ', ':'])
            .next()
            .unwrap_or_default()
            .to_ascii_uppercase();

        let response = match verb.as_str() {
            "EHLO" => &script.ehlo,
            "HELO" => &script.helo,
            "STARTTLS" => &script.starttls,
            "AUTH" => &script.auth,
            "MAIL" => &script.mail_from,
            "RCPT" => {
                let address = command
                    .split_once('<')
                    .and_then(|(_, rest)| rest.split_once('>'))
                    .map(|(address, _)| address)
                    .unwrap_or_default();
                script.rcpt_overrides.get(address).unwrap_or(&script.rcpt)
            }
            "DATA" => {
                writer.write_all(&script.data.encode()).await?;
                if script.data.code != 354 {
                    continue;
                }

                let message = read_message(&mut reader).await?;
                transcript.lock().messages.push(message);
                &script.data_end
            }
            "QUIT" => {
                writer.write_all(&script.quit.encode()).await?;
                return Ok(());
            }
            _ => &unknown,
        };

        writer.write_all(&response.encode()).await?;
    }
}

/// Reads DATA content up to the terminating `.` line, undoing dot-stuffing.
async fn read_message<R>(reader: &mut R) -> std::io::Result<Vec<u8>>
where
    R: AsyncBufReadExt + Unpin,
{
    let mut message = Vec::new();
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 || line == ".\r\n" {
            return Ok(message);
        }

        let unstuffed = line.strip_prefix('.').unwrap_or(&line);
        message.extend_from_slice(unstuffed.as_bytes());
    }
}
