use crate::tls::insecure_connector;
use std::collections::HashMap;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::rustls::pki_types::ServerName;

const MAX_LINE_LEN: usize = 4096;

pub trait AsyncReadAndWrite: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncReadAndWrite for T {}

type BoxedStream = Box<dyn AsyncReadAndWrite>;

#[derive(Error, Debug, Clone)]
pub enum ClientError {
    #[error("response is not UTF8")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("malformed response: {0}")]
    MalformedResponseLine(String),
    #[error("response line is too long")]
    ResponseTooLong,
    #[error("not connected")]
    NotConnected,
    #[error("timed out waiting {duration:?} for response to {command:?}")]
    TimeOutResponse {
        command: Option<String>,
        duration: Duration,
    },
    #[error("timed out writing {command}")]
    TimeOutRequest { command: String },
    #[error("error {error} reading response to {command:?}")]
    ReadError {
        command: Option<String>,
        error: String,
    },
    #[error("error {error} writing {command}")]
    WriteError { command: String, error: String },
    #[error("{0} is not a valid TLS server name")]
    InvalidDnsName(String),
    #[error("TLS: {0}")]
    Tls(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SmtpTimeouts {
    pub connect_timeout: Duration,
    pub banner_timeout: Duration,
    pub ehlo_timeout: Duration,
    pub starttls_timeout: Duration,
    pub mail_from_timeout: Duration,
    pub rcpt_to_timeout: Duration,
    pub quit_timeout: Duration,
}

impl Default for SmtpTimeouts {
    fn default() -> Self {
        Self::uniform(Duration::from_secs(10))
    }
}

impl SmtpTimeouts {
    /// All phases share the same deadline; the probing daemon
    /// configures a single SMTP timeout.
    pub fn uniform(d: Duration) -> Self {
        Self {
            connect_timeout: d,
            banner_timeout: d,
            ehlo_timeout: d,
            starttls_timeout: d,
            mail_from_timeout: d,
            rcpt_to_timeout: d,
            quit_timeout: d.min(Duration::from_secs(2)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Ehlo(String),
    StartTls,
    MailFrom(String),
    RcptTo(String),
    Quit,
}

impl Command {
    pub fn encode(&self) -> String {
        match self {
            Self::Ehlo(domain) => format!("EHLO {domain}\r\n"),
            Self::StartTls => "STARTTLS\r\n".to_string(),
            Self::MailFrom(addr) => format!("MAIL FROM:<{addr}>\r\n"),
            Self::RcptTo(addr) => format!("RCPT TO:<{addr}>\r\n"),
            Self::Quit => "QUIT\r\n".to_string(),
        }
    }

    fn timeout(&self, timeouts: &SmtpTimeouts) -> Duration {
        match self {
            Self::Ehlo(_) => timeouts.ehlo_timeout,
            Self::StartTls => timeouts.starttls_timeout,
            Self::MailFrom(_) => timeouts.mail_from_timeout,
            Self::RcptTo(_) => timeouts.rcpt_to_timeout,
            Self::Quit => timeouts.quit_timeout,
        }
    }
}

/// A parsed SMTP reply, with multi-line continuations collapsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub code: u16,
    pub content: String,
}

impl Response {
    pub fn is_success(&self) -> bool {
        self.code >= 200 && self.code < 300
    }

    pub fn is_transient(&self) -> bool {
        self.code >= 400 && self.code < 500
    }

    pub fn is_permanent(&self) -> bool {
        self.code >= 500 && self.code < 600
    }
}

#[derive(Debug, PartialEq, Eq)]
struct ResponseLine<'a> {
    code: u16,
    is_final: bool,
    content: &'a str,
}

fn parse_response_line(line: &str) -> Result<ResponseLine, ClientError> {
    if line.len() < 4 {
        // Bare "250" style replies are legal; tolerate them
        if let Ok(code) = line.parse::<u16>() {
            return Ok(ResponseLine {
                code,
                is_final: true,
                content: "",
            });
        }
        return Err(ClientError::MalformedResponseLine(line.to_string()));
    }

    match line.as_bytes()[3] {
        b' ' | b'-' => match line[0..3].parse::<u16>() {
            Ok(code) => Ok(ResponseLine {
                code,
                is_final: line.as_bytes()[3] == b' ',
                content: &line[4..],
            }),
            Err(_) => Err(ClientError::MalformedResponseLine(line.to_string())),
        },
        _ => Err(ClientError::MalformedResponseLine(line.to_string())),
    }
}

/// Minimal SMTP client for mailbox probing: connect, EHLO, optional
/// STARTTLS upgrade, MAIL/RCPT, QUIT. Reads are line buffered with
/// multi-line reply handling.
pub struct SmtpClient {
    socket: Option<BoxedStream>,
    hostname: String,
    read_buffer: Vec<u8>,
    capabilities: HashMap<String, Option<String>>,
    timeouts: SmtpTimeouts,
}

impl SmtpClient {
    pub async fn connect(
        host: &str,
        port: u16,
        timeouts: SmtpTimeouts,
    ) -> Result<Self, ClientError> {
        let addr = format!("{host}:{port}");
        let stream = match timeout(timeouts.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                return Err(ClientError::ReadError {
                    command: None,
                    error: format!("connecting to {addr}: {err}"),
                })
            }
            Err(_) => {
                return Err(ClientError::TimeOutResponse {
                    command: None,
                    duration: timeouts.connect_timeout,
                })
            }
        };
        // Request/response protocol; Nagle just adds latency
        stream.set_nodelay(true).ok();

        Ok(Self {
            socket: Some(Box::new(stream)),
            hostname: host.to_string(),
            read_buffer: Vec::with_capacity(1024),
            capabilities: HashMap::new(),
            timeouts,
        })
    }

    pub fn timeouts(&self) -> &SmtpTimeouts {
        &self.timeouts
    }

    pub fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities.contains_key(&name.to_ascii_uppercase())
    }

    async fn read_line(
        &mut self,
        timeout_duration: Duration,
        cmd: Option<&Command>,
    ) -> Result<String, ClientError> {
        let mut too_long = false;
        loop {
            let mut iter = self.read_buffer.iter().enumerate();
            while let Some((i, &b)) = iter.next() {
                if b != b'\r' {
                    continue;
                }
                if let Some((_, b'\n')) = iter.next() {
                    if too_long {
                        self.read_buffer.drain(0..i + 2);
                        return Err(ClientError::ResponseTooLong);
                    }
                    let line = String::from_utf8(self.read_buffer[0..i].to_vec());
                    self.read_buffer.drain(0..i + 2);
                    return Ok(line?);
                }
            }
            if self.read_buffer.len() > MAX_LINE_LEN {
                self.read_buffer.clear();
                too_long = true;
            }

            let mut data = [0u8; MAX_LINE_LEN];
            let size = match self.socket.as_mut() {
                Some(s) => match timeout(timeout_duration, s.read(&mut data)).await {
                    Ok(Ok(size)) => size,
                    Ok(Err(err)) => {
                        self.socket.take();
                        return Err(ClientError::ReadError {
                            command: cmd.map(|c| c.encode()),
                            error: format!("{err:#}"),
                        });
                    }
                    Err(_) => {
                        self.socket.take();
                        return Err(ClientError::TimeOutResponse {
                            command: cmd.map(|c| c.encode()),
                            duration: timeout_duration,
                        });
                    }
                },
                None => return Err(ClientError::NotConnected),
            };
            if size == 0 {
                self.socket.take();
                return Err(ClientError::ReadError {
                    command: cmd.map(|c| c.encode()),
                    error: "connection closed by peer".to_string(),
                });
            }
            self.read_buffer.extend_from_slice(&data[0..size]);
        }
    }

    pub async fn read_response(
        &mut self,
        command: Option<&Command>,
        timeout_duration: Duration,
    ) -> Result<Response, ClientError> {
        let mut line = self.read_line(timeout_duration, command).await?;
        tracing::trace!("recv<-{}: {line}", self.hostname);
        let mut parsed = parse_response_line(&line)?;
        let code = parsed.code;
        let mut content = parsed.content.to_string();

        // Continuation lines must repeat the reply code until the
        // final "NNN " line arrives.
        let continuation_timeout = Duration::from_secs(60).min(timeout_duration);
        while !parsed.is_final {
            line = self.read_line(continuation_timeout, command).await?;
            parsed = parse_response_line(&line)?;
            if parsed.code != code {
                return Err(ClientError::MalformedResponseLine(line.clone()));
            }
            content.push('\n');
            content.push_str(parsed.content);
        }

        Ok(Response { code, content })
    }

    async fn write_command(&mut self, command: &Command) -> Result<(), ClientError> {
        let line = command.encode();
        tracing::trace!("send->{}: {line}", self.hostname);
        let timeout_duration = command.timeout(&self.timeouts);
        match self.socket.as_mut() {
            Some(socket) => {
                match timeout(timeout_duration, async {
                    socket.write_all(line.as_bytes()).await?;
                    socket.flush().await
                })
                .await
                {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(err)) => {
                        self.socket.take();
                        Err(ClientError::WriteError {
                            command: line,
                            error: format!("{err:#}"),
                        })
                    }
                    Err(_) => {
                        self.socket.take();
                        Err(ClientError::TimeOutRequest { command: line })
                    }
                }
            }
            None => Err(ClientError::NotConnected),
        }
    }

    pub async fn send_command(&mut self, command: &Command) -> Result<Response, ClientError> {
        self.write_command(command).await?;
        self.read_response(Some(command), command.timeout(&self.timeouts))
            .await
    }

    /// EHLO and capture the advertised capability set.
    pub async fn ehlo(&mut self, ehlo_domain: &str) -> Result<Response, ClientError> {
        let response = self
            .send_command(&Command::Ehlo(ehlo_domain.to_string()))
            .await?;

        if response.code == 250 {
            let mut capabilities = HashMap::new();
            for line in response.content.lines().skip(1) {
                let mut fields = line.splitn(2, ' ');
                if let Some(name) = fields.next() {
                    capabilities
                        .insert(name.to_ascii_uppercase(), fields.next().map(String::from));
                }
            }
            self.capabilities = capabilities;
        }

        Ok(response)
    }

    /// Issue STARTTLS and upgrade the transport when the peer agrees.
    ///
    /// Certificate validation is intentionally disabled: the session
    /// only probes recipient acceptance and never carries message
    /// content. Returns false when the peer refuses the upgrade, in
    /// which case the plaintext session remains usable.
    pub async fn starttls(&mut self) -> Result<bool, ClientError> {
        let response = self.send_command(&Command::StartTls).await?;
        if response.code != 220 {
            return Ok(false);
        }

        let stream = match self.socket.take() {
            Some(s) => s,
            None => return Err(ClientError::NotConnected),
        };

        let connector = insecure_connector()?;
        let server_name = match IpAddr::from_str(&self.hostname) {
            Ok(ip) => ServerName::IpAddress(ip.into()),
            Err(_) => ServerName::try_from(self.hostname.clone())
                .map_err(|_| ClientError::InvalidDnsName(self.hostname.clone()))?,
        };

        match timeout(
            self.timeouts.starttls_timeout,
            connector.connect(server_name, stream),
        )
        .await
        {
            Ok(Ok(tls_stream)) => {
                // The line framer re-attaches to the upgraded socket;
                // anything buffered belongs to the plaintext session.
                self.read_buffer.clear();
                self.socket.replace(Box::new(tls_stream));
                Ok(true)
            }
            Ok(Err(err)) => Err(ClientError::Tls(format!("{err:#}"))),
            Err(_) => Err(ClientError::TimeOutResponse {
                command: Some(Command::StartTls.encode()),
                duration: self.timeouts.starttls_timeout,
            }),
        }
    }

    /// Best-effort QUIT; the peer may have already hung up.
    pub async fn quit(&mut self) {
        if self.socket.is_some() {
            self.send_command(&Command::Quit).await.ok();
            self.socket.take();
        }
    }
}
