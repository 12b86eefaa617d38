//! Async POP3 client used to drain bounce mailboxes.
//!
//! Speaks RFC 1939 over tokio: USER/PASS authentication, STAT, RETR with
//! dot-unstuffing, DELE and QUIT. TLS (POP3S) goes through rustls.

use crate::tls::{build_tls_connector, tls_wrap, MaybeTlsStream};
use lettermill_common::config::BounceMailboxConfig;
use lettermill_common::{Error, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

/// One POP3 session against a bounce mailbox.
pub struct Pop3Client {
    conn: BufReader<MaybeTlsStream>,
}

impl Pop3Client {
    /// Dial the mailbox and read the greeting.
    pub async fn connect(cfg: &BounceMailboxConfig) -> Result<Self> {
        let tcp = TcpStream::connect((cfg.host.as_str(), cfg.port))
            .await
            .map_err(|e| Error::Pop3(format!("connect {}:{}: {}", cfg.host, cfg.port, e)))?;

        let stream = if cfg.tls_enabled {
            let connector = build_tls_connector(cfg.tls_skip_verify)?;
            tls_wrap(tcp, &cfg.host, &connector).await?
        } else {
            MaybeTlsStream::Plain(tcp)
        };

        let mut client = Self {
            conn: BufReader::new(stream),
        };

        client.read_ok().await?;
        Ok(client)
    }

    /// USER/PASS authentication.
    pub async fn auth(&mut self, username: &str, password: &str) -> Result<()> {
        self.command(&format!("USER {}", username)).await?;
        self.command(&format!("PASS {}", password)).await?;
        Ok(())
    }

    /// Message count and total size on the server.
    pub async fn stat(&mut self) -> Result<(usize, usize)> {
        let reply = self.command("STAT").await?;

        let mut parts = reply.split_whitespace();
        let count = parts
            .next()
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| Error::Pop3(format!("malformed STAT reply '{}'", reply)))?;
        let size = parts.next().and_then(|v| v.parse().ok()).unwrap_or(0);

        Ok((count, size))
    }

    /// Retrieve one raw message by 1-based id.
    pub async fn retr(&mut self, id: usize) -> Result<Vec<u8>> {
        self.command(&format!("RETR {}", id)).await?;

        // Multiline response: lines up to a lone ".", with leading dots
        // unstuffed.
        let mut data = Vec::new();
        loop {
            let mut line = String::new();
            let n = self
                .conn
                .read_line(&mut line)
                .await
                .map_err(|e| Error::Pop3(format!("read: {}", e)))?;
            if n == 0 {
                return Err(Error::Pop3("connection closed mid-message".to_string()));
            }

            let trimmed = line.trim_end_matches(['\r', '\n']);
            if trimmed == "." {
                break;
            }

            let content = if trimmed.starts_with("..") {
                &trimmed[1..]
            } else {
                trimmed
            };

            data.extend_from_slice(content.as_bytes());
            data.extend_from_slice(b"\r\n");
        }

        Ok(data)
    }

    /// Mark a message for deletion.
    pub async fn dele(&mut self, id: usize) -> Result<()> {
        self.command(&format!("DELE {}", id)).await?;
        Ok(())
    }

    /// End the session, committing deletions.
    pub async fn quit(mut self) -> Result<()> {
        self.command("QUIT").await?;
        Ok(())
    }

    async fn command(&mut self, line: &str) -> Result<String> {
        let w = self.conn.get_mut();
        w.write_all(line.as_bytes())
            .await
            .map_err(|e| Error::Pop3(format!("write: {}", e)))?;
        w.write_all(b"\r\n")
            .await
            .map_err(|e| Error::Pop3(format!("write: {}", e)))?;
        w.flush()
            .await
            .map_err(|e| Error::Pop3(format!("flush: {}", e)))?;

        self.read_ok().await
    }

    /// Read a status line, erroring on -ERR.
    async fn read_ok(&mut self) -> Result<String> {
        let mut line = String::new();
        let n = self
            .conn
            .read_line(&mut line)
            .await
            .map_err(|e| Error::Pop3(format!("read: {}", e)))?;
        if n == 0 {
            return Err(Error::Pop3("connection closed by server".to_string()));
        }

        let line = line.trim_end();
        if let Some(rest) = line.strip_prefix("+OK") {
            Ok(rest.trim().to_string())
        } else {
            Err(Error::Pop3(format!("server error: {}", line)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn mailbox_config(port: u16) -> BounceMailboxConfig {
        BounceMailboxConfig {
            host: "127.0.0.1".to_string(),
            port,
            auth_protocol: "userpass".to_string(),
            username: "bounces@example.net".to_string(),
            password: "secret".to_string(),
            tls_enabled: false,
            tls_skip_verify: false,
            scan_interval_minutes: 15,
            fetch_limit: 100,
        }
    }

    /// Loopback POP3 server with one canned message.
    async fn fake_pop3(listener: TcpListener, message: &'static str) -> Vec<String> {
        let (stream, _) = listener.accept().await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut reader = tokio::io::BufReader::new(read);
        let mut commands = Vec::new();

        write.write_all(b"+OK fake POP3 ready\r\n").await.unwrap();

        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line).await.unwrap() == 0 {
                break;
            }
            let cmd = line.trim_end().to_string();
            commands.push(cmd.clone());

            let upper = cmd.to_ascii_uppercase();
            if upper == "STAT" {
                write.write_all(b"+OK 1 512\r\n").await.unwrap();
            } else if upper.starts_with("RETR") {
                write.write_all(b"+OK 512 octets\r\n").await.unwrap();
                write.write_all(message.as_bytes()).await.unwrap();
                write.write_all(b"\r\n.\r\n").await.unwrap();
            } else if upper == "QUIT" {
                write.write_all(b"+OK bye\r\n").await.unwrap();
                break;
            } else {
                write.write_all(b"+OK\r\n").await.unwrap();
            }
        }

        commands
    }

    #[tokio::test]
    async fn test_retr_and_dele_flow() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(fake_pop3(
            listener,
            "Subject: bounce\r\n\r\nStatus: 5.1.1\r\n..leading dot line",
        ));

        let cfg = mailbox_config(port);
        let mut client = Pop3Client::connect(&cfg).await.unwrap();
        client.auth(&cfg.username, &cfg.password).await.unwrap();

        let (count, _) = client.stat().await.unwrap();
        assert_eq!(count, 1);

        let raw = client.retr(1).await.unwrap();
        let body = String::from_utf8(raw).unwrap();
        assert!(body.contains("Status: 5.1.1"));
        // Dot-unstuffed.
        assert!(body.contains("\r\n.leading dot line"));

        client.dele(1).await.unwrap();
        client.quit().await.unwrap();

        let commands = server.await.unwrap();
        assert!(commands.contains(&"USER bounces@example.net".to_string()));
        assert!(commands.contains(&"PASS secret".to_string()));
        assert!(commands.contains(&"DELE 1".to_string()));
        assert!(commands.contains(&"QUIT".to_string()));
    }
}
