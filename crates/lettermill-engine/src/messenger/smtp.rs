//! Async SMTP client with a bounded per-server connection pool.
//!
//! Speaks RFC 5321 directly over tokio: EHLO, AUTH (PLAIN, LOGIN,
//! CRAM-MD5), STARTTLS/implicit TLS via rustls, MAIL FROM / RCPT TO / DATA
//! with dot-stuffing. Connections are pooled up to `max_conns`; a send waits
//! for a free slot up to `wait_timeout` and idle connections are discarded
//! after `idle_timeout`.

use crate::tls::{build_tls_connector, tls_wrap, MaybeTlsStream};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use lettermill_common::{Error, Result};
use md5::Md5;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Semaphore};
use tokio_rustls::TlsConnector;
use tracing::debug;

/// TLS behavior for a server connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsMode {
    /// No TLS at all
    None,
    /// Implicit TLS on connect (port 465)
    Implicit,
    /// Plaintext connect, STARTTLS upgrade (port 587)
    StartTls,
}

impl TlsMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(TlsMode::None),
            "tls" | "TLS" => Some(TlsMode::Implicit),
            "starttls" | "STARTTLS" => Some(TlsMode::StartTls),
            _ => None,
        }
    }
}

/// SMTP authentication handle.
#[derive(Debug, Clone)]
pub enum SmtpAuth {
    None,
    Plain { username: String, password: String },
    Login { username: String, password: String },
    CramMd5 { username: String, password: String },
}

impl SmtpAuth {
    /// Build an auth handle from an `auth_protocol` config value. The
    /// password has its spaces stripped by the caller.
    pub fn from_protocol(protocol: &str, username: &str, password: &str) -> Result<Self> {
        let username = username.to_string();
        let password = password.to_string();
        match protocol {
            "plain" => Ok(SmtpAuth::Plain { username, password }),
            "login" => Ok(SmtpAuth::Login { username, password }),
            "cram" => Ok(SmtpAuth::CramMd5 { username, password }),
            "" | "none" => Ok(SmtpAuth::None),
            other => Err(Error::Config(format!(
                "unknown SMTP auth type '{}'",
                other
            ))),
        }
    }
}

/// One authenticated SMTP session.
struct SmtpConnection {
    conn: BufReader<MaybeTlsStream>,
}

impl SmtpConnection {
    /// Dial, negotiate TLS per mode, EHLO and authenticate.
    async fn connect(opt: &ConnectOpt) -> Result<Self> {
        let tcp = TcpStream::connect((opt.host.as_str(), opt.port))
            .await
            .map_err(|e| Error::Smtp(format!("connect {}:{}: {}", opt.host, opt.port, e)))?;

        let stream = if opt.tls == TlsMode::Implicit {
            tls_upgrade(tcp, opt).await?
        } else {
            MaybeTlsStream::Plain(tcp)
        };

        let mut session = Self {
            conn: BufReader::new(stream),
        };

        session.expect(&[220]).await?;
        session.ehlo(&opt.hello_hostname).await?;

        if opt.tls == TlsMode::StartTls {
            session.command("STARTTLS", &[220]).await?;
            let stream = match session.conn.into_inner() {
                MaybeTlsStream::Plain(tcp) => tls_upgrade(tcp, opt).await?,
                tls => tls,
            };
            session = Self {
                conn: BufReader::new(stream),
            };
            session.ehlo(&opt.hello_hostname).await?;
        }

        session.authenticate(&opt.auth).await?;
        Ok(session)
    }

    async fn ehlo(&mut self, hostname: &str) -> Result<()> {
        self.command(&format!("EHLO {}", hostname), &[250]).await?;
        Ok(())
    }

    async fn authenticate(&mut self, auth: &SmtpAuth) -> Result<()> {
        match auth {
            SmtpAuth::None => Ok(()),
            SmtpAuth::Plain { username, password } => {
                let token = BASE64.encode(format!("\0{}\0{}", username, password));
                self.command(&format!("AUTH PLAIN {}", token), &[235]).await?;
                Ok(())
            }
            SmtpAuth::Login { username, password } => {
                self.command("AUTH LOGIN", &[334]).await?;
                self.command(&BASE64.encode(username), &[334]).await?;
                self.command(&BASE64.encode(password), &[235]).await?;
                Ok(())
            }
            SmtpAuth::CramMd5 { username, password } => {
                let (_, challenge) = self.command("AUTH CRAM-MD5", &[334]).await?;
                let challenge = BASE64
                    .decode(challenge.trim())
                    .map_err(|e| Error::Smtp(format!("bad CRAM-MD5 challenge: {}", e)))?;

                let digest = cram_md5_response(password, &challenge);
                let token = BASE64.encode(format!("{} {}", username, digest));
                self.command(&token, &[235]).await?;
                Ok(())
            }
        }
    }

    /// Run one MAIL FROM / RCPT TO / DATA transaction.
    async fn send_mail(&mut self, envelope_from: &str, rcpts: &[String], data: &[u8]) -> Result<()> {
        self.command(&format!("MAIL FROM:<{}>", envelope_from), &[250])
            .await?;

        for rcpt in rcpts {
            self.command(&format!("RCPT TO:<{}>", rcpt), &[250, 251])
                .await?;
        }

        self.command("DATA", &[354]).await?;

        let stuffed = dot_stuff(data);
        let w = self.conn.get_mut();
        w.write_all(&stuffed)
            .await
            .map_err(|e| Error::Smtp(format!("write DATA: {}", e)))?;
        w.write_all(b"\r\n.\r\n")
            .await
            .map_err(|e| Error::Smtp(format!("write DATA terminator: {}", e)))?;
        w.flush()
            .await
            .map_err(|e| Error::Smtp(format!("flush DATA: {}", e)))?;

        self.expect(&[250]).await?;
        Ok(())
    }

    /// Reset session state between pooled transactions.
    async fn reset(&mut self) -> Result<()> {
        self.command("RSET", &[250]).await?;
        Ok(())
    }

    /// Terminate the session.
    async fn quit(mut self) {
        let _ = self.write_line("QUIT").await;
        let _ = self.expect(&[221]).await;
    }

    async fn command(&mut self, line: &str, accept: &[u16]) -> Result<(u16, String)> {
        self.write_line(line).await?;
        self.expect(accept).await
    }

    async fn write_line(&mut self, line: &str) -> Result<()> {
        let w = self.conn.get_mut();
        w.write_all(line.as_bytes())
            .await
            .map_err(|e| Error::Smtp(format!("write: {}", e)))?;
        w.write_all(b"\r\n")
            .await
            .map_err(|e| Error::Smtp(format!("write: {}", e)))?;
        w.flush().await.map_err(|e| Error::Smtp(format!("flush: {}", e)))?;
        Ok(())
    }

    /// Read one (possibly multi-line) reply and check its code.
    async fn expect(&mut self, accept: &[u16]) -> Result<(u16, String)> {
        let (code, text) = self.read_reply().await?;
        if accept.contains(&code) {
            Ok((code, text))
        } else {
            Err(Error::Smtp(format!("unexpected reply {} {}", code, text)))
        }
    }

    async fn read_reply(&mut self) -> Result<(u16, String)> {
        let mut text = Vec::new();
        loop {
            let mut line = String::new();
            let n = self
                .conn
                .read_line(&mut line)
                .await
                .map_err(|e| Error::Smtp(format!("read: {}", e)))?;
            if n == 0 {
                return Err(Error::Smtp("connection closed by server".to_string()));
            }

            let line = line.trim_end();
            if line.len() < 3 {
                return Err(Error::Smtp(format!("malformed reply '{}'", line)));
            }

            let code: u16 = line
                .get(..3)
                .and_then(|c| c.parse().ok())
                .ok_or_else(|| Error::Smtp(format!("malformed reply '{}'", line)))?;

            if let Some(rest) = line.get(4..) {
                text.push(rest.to_string());
            }

            // "250-..." continues the reply, "250 ..." ends it.
            if line.as_bytes().get(3) != Some(&b'-') {
                return Ok((code, text.join(" ")));
            }
        }
    }
}

/// Connection parameters shared by all sessions in a pool.
struct ConnectOpt {
    host: String,
    port: u16,
    hello_hostname: String,
    tls: TlsMode,
    tls_connector: Option<TlsConnector>,
    auth: SmtpAuth,
}

async fn tls_upgrade(tcp: TcpStream, opt: &ConnectOpt) -> Result<MaybeTlsStream> {
    let connector = opt
        .tls_connector
        .as_ref()
        .ok_or_else(|| Error::Smtp("TLS requested without a connector".to_string()))?;

    tls_wrap(tcp, &opt.host, connector).await
}

/// Compute the hex HMAC-MD5 digest for a CRAM-MD5 challenge.
fn cram_md5_response(password: &str, challenge: &[u8]) -> String {
    let mut mac = Hmac::<Md5>::new_from_slice(password.as_bytes())
        .expect("HMAC accepts any key length");
    mac.update(challenge);
    hex::encode(mac.finalize().into_bytes())
}

/// Prefix a dot to any line starting with one (RFC 5321 §4.5.2) and
/// normalize bare LF line endings to CRLF.
fn dot_stuff(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 16);
    let mut at_line_start = true;

    let mut i = 0;
    while i < data.len() {
        let b = data[i];
        if at_line_start && b == b'.' {
            out.push(b'.');
        }

        if b == b'\n' && !out.ends_with(b"\r") {
            out.push(b'\r');
        }
        out.push(b);

        at_line_start = b == b'\n';
        i += 1;
    }
    out
}

struct IdleConn {
    session: SmtpConnection,
    since: Instant,
}

/// Bounded connection pool for one SMTP server.
pub struct SmtpPool {
    opt: ConnectOpt,
    slots: Arc<Semaphore>,
    idle: Mutex<Vec<IdleConn>>,
    idle_timeout: Duration,
    wait_timeout: Duration,
    closed: AtomicBool,
}

impl SmtpPool {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        host: String,
        port: u16,
        hello_hostname: String,
        tls: TlsMode,
        tls_skip_verify: bool,
        auth: SmtpAuth,
        max_conns: usize,
        idle_timeout: Duration,
        wait_timeout: Duration,
    ) -> Result<Self> {
        let tls_connector = match tls {
            TlsMode::None => None,
            TlsMode::Implicit | TlsMode::StartTls => {
                Some(build_tls_connector(tls_skip_verify)?)
            }
        };

        Ok(Self {
            opt: ConnectOpt {
                host,
                port,
                hello_hostname,
                tls,
                tls_connector,
                auth,
            },
            slots: Arc::new(Semaphore::new(max_conns.max(1))),
            idle: Mutex::new(Vec::new()),
            idle_timeout,
            wait_timeout,
            closed: AtomicBool::new(false),
        })
    }

    pub fn host(&self) -> &str {
        &self.opt.host
    }

    /// Send one message, blocking on the pool until a connection slot is
    /// free or `wait_timeout` elapses.
    pub async fn send(&self, envelope_from: &str, rcpts: &[String], data: &[u8]) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Smtp("pool is closed".to_string()));
        }

        let _permit = tokio::time::timeout(self.wait_timeout, self.slots.acquire())
            .await
            .map_err(|_| {
                Error::Timeout(format!(
                    "no free SMTP connection to {} within {:?}",
                    self.opt.host, self.wait_timeout
                ))
            })?
            .map_err(|_| Error::Smtp("pool is closed".to_string()))?;

        let mut session = match self.checkout().await {
            Some(s) => s,
            None => SmtpConnection::connect(&self.opt).await?,
        };

        match session.send_mail(envelope_from, rcpts, data).await {
            Ok(()) => {
                self.checkin(session).await;
                Ok(())
            }
            Err(e) => {
                // The failed connection is dropped; the freed slot lets the
                // next send dial a fresh one.
                debug!(host = %self.opt.host, error = %e, "dropping SMTP connection after error");
                Err(e)
            }
        }
    }

    /// Pop the freshest non-stale idle connection.
    async fn checkout(&self) -> Option<SmtpConnection> {
        let mut idle = self.idle.lock().await;
        while let Some(conn) = idle.pop() {
            if conn.since.elapsed() < self.idle_timeout {
                return Some(conn.session);
            }
            // Stale: closed implicitly by drop.
        }
        None
    }

    async fn checkin(&self, mut session: SmtpConnection) {
        if self.closed.load(Ordering::Acquire) {
            session.quit().await;
            return;
        }

        // A connection that can't RSET is not worth pooling.
        if session.reset().await.is_ok() {
            let mut idle = self.idle.lock().await;
            idle.push(IdleConn {
                session,
                since: Instant::now(),
            });
        }
    }

    /// Quit all idle sessions and refuse further sends.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let mut idle = self.idle.lock().await;
        for conn in idle.drain(..) {
            conn.session.quit().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[test]
    fn test_tls_mode_parse() {
        assert_eq!(TlsMode::parse("none"), Some(TlsMode::None));
        assert_eq!(TlsMode::parse("TLS"), Some(TlsMode::Implicit));
        assert_eq!(TlsMode::parse("starttls"), Some(TlsMode::StartTls));
        assert_eq!(TlsMode::parse("ssl"), None);
    }

    #[test]
    fn test_auth_from_protocol() {
        assert!(matches!(
            SmtpAuth::from_protocol("plain", "u", "p").unwrap(),
            SmtpAuth::Plain { .. }
        ));
        assert!(matches!(
            SmtpAuth::from_protocol("cram", "u", "p").unwrap(),
            SmtpAuth::CramMd5 { .. }
        ));
        assert!(matches!(
            SmtpAuth::from_protocol("", "u", "p").unwrap(),
            SmtpAuth::None
        ));
        assert!(SmtpAuth::from_protocol("xoauth2", "u", "p").is_err());
    }

    #[test]
    fn test_dot_stuffing() {
        assert_eq!(dot_stuff(b"hello\r\n.world"), b"hello\r\n..world");
        assert_eq!(dot_stuff(b".start"), b"..start");
        assert_eq!(dot_stuff(b"no dots"), b"no dots");
    }

    #[test]
    fn test_dot_stuffing_normalizes_bare_lf() {
        assert_eq!(dot_stuff(b"a\nb"), b"a\r\nb");
        assert_eq!(dot_stuff(b"a\r\nb"), b"a\r\nb");
    }

    #[test]
    fn test_cram_md5_response() {
        // RFC 2195 example: user "tim", password "tanstaaftanstaaf".
        let digest = cram_md5_response(
            "tanstaaftanstaaf",
            b"<1896.697170952@postoffice.reston.mci.net>",
        );
        assert_eq!(digest, "b913a602c7eda7a495b4e6e7334d3890");
    }

    /// Minimal loopback SMTP server that records the client's commands.
    async fn fake_smtp(listener: TcpListener) -> Vec<String> {
        let (stream, _) = listener.accept().await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut reader = tokio::io::BufReader::new(read);
        let mut commands = Vec::new();

        write.write_all(b"220 fake ESMTP\r\n").await.unwrap();

        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line).await.unwrap() == 0 {
                break;
            }
            let cmd = line.trim_end().to_string();
            commands.push(cmd.clone());

            let upper = cmd.to_ascii_uppercase();
            if upper.starts_with("EHLO") {
                write
                    .write_all(b"250-fake greets you\r\n250 OK\r\n")
                    .await
                    .unwrap();
            } else if upper.starts_with("DATA") {
                write.write_all(b"354 go ahead\r\n").await.unwrap();
                // Swallow the body up to the terminating dot.
                loop {
                    line.clear();
                    if reader.read_line(&mut line).await.unwrap() == 0 {
                        break;
                    }
                    if line == ".\r\n" {
                        break;
                    }
                }
                write.write_all(b"250 queued\r\n").await.unwrap();
            } else if upper.starts_with("QUIT") {
                write.write_all(b"221 bye\r\n").await.unwrap();
                break;
            } else {
                write.write_all(b"250 OK\r\n").await.unwrap();
            }
        }

        commands
    }

    #[tokio::test]
    async fn test_pool_send_issues_expected_commands() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(fake_smtp(listener));

        let pool = SmtpPool::new(
            "127.0.0.1".to_string(),
            addr.port(),
            "tester.local".to_string(),
            TlsMode::None,
            false,
            SmtpAuth::None,
            1,
            Duration::from_secs(5),
            Duration::from_secs(5),
        )
        .unwrap();

        pool.send(
            "sender@example.org",
            &["rcpt@example.com".to_string()],
            b"Subject: hi\r\n\r\nbody",
        )
        .await
        .unwrap();
        pool.close().await;

        let commands = server.await.unwrap();
        assert!(commands.iter().any(|c| c == "MAIL FROM:<sender@example.org>"));
        assert!(commands.iter().any(|c| c == "RCPT TO:<rcpt@example.com>"));
        assert!(commands.iter().any(|c| c == "DATA"));
        assert!(commands.iter().any(|c| c.starts_with("EHLO tester.local")));
    }

    #[tokio::test]
    async fn test_pool_wait_timeout_surfaces_error() {
        // A listener that accepts but never greets keeps the single slot's
        // connection attempt hanging; a second send must time out waiting.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1];
            let _ = stream.read(&mut buf).await;
        });

        let pool = Arc::new(
            SmtpPool::new(
                "127.0.0.1".to_string(),
                addr.port(),
                "tester.local".to_string(),
                TlsMode::None,
                false,
                SmtpAuth::None,
                1,
                Duration::from_secs(5),
                Duration::from_millis(200),
            )
            .unwrap(),
        );

        let hung = {
            let pool = pool.clone();
            tokio::spawn(async move {
                let _ = pool
                    .send("a@example.org", &["b@example.com".to_string()], b"x")
                    .await;
            })
        };

        // Give the first send time to grab the only slot.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = pool
            .send("a@example.org", &["b@example.com".to_string()], b"x")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));

        hung.abort();
    }
}
