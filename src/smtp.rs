//! Minimal SMTP client used by the hostname prober.
//!
//! Speaks just enough of the protocol to audit a server: greeting, EHLO,
//! extension discovery, and the STARTTLS upgrade. No mail is ever sent.

use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use rand::RngCore;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::ClientConfig;
use tokio_rustls::TlsConnector;

use crate::config::{SMTP_COMMAND_TIMEOUT, SMTP_DIAL_TIMEOUT};

/// A single SMTP reply, possibly spanning multiple lines.
#[derive(Debug)]
pub(crate) struct Reply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Reply {
    pub fn is_positive(&self) -> bool {
        (200..400).contains(&self.code)
    }
}

/// One SMTP conversation with a mail exchanger.
pub(crate) struct SmtpSession {
    reader: BufReader<TcpStream>,
    extensions: Vec<String>,
}

impl SmtpSession {
    /// Dials `hostname:25`, reads the greeting, and introduces ourselves
    /// with EHLO. The dial is bounded by [`SMTP_DIAL_TIMEOUT`].
    pub async fn connect(hostname: &str, ehlo_identity: &str) -> Result<Self> {
        let addr = if hostname.contains(':') {
            hostname.to_string()
        } else {
            format!("{hostname}:25")
        };
        let stream = timeout(SMTP_DIAL_TIMEOUT, TcpStream::connect(&addr))
            .await
            .map_err(|_| anyhow!("connection to {addr} timed out"))?
            .with_context(|| format!("could not connect to {addr}"))?;

        let mut session = SmtpSession {
            reader: BufReader::new(stream),
            extensions: Vec::new(),
        };
        let greeting = session.read_reply().await.context("no SMTP greeting")?;
        if greeting.code != 220 {
            bail!("unexpected SMTP greeting: {}", greeting.code);
        }
        session.ehlo(ehlo_identity).await?;
        Ok(session)
    }

    async fn ehlo(&mut self, identity: &str) -> Result<()> {
        self.send_command(&format!("EHLO {identity}")).await?;
        let reply = self.read_reply().await.context("no reply to EHLO")?;
        if !reply.is_positive() {
            bail!("EHLO rejected: {}", reply.code);
        }
        // The first line is the server identity; the rest advertise extensions.
        self.extensions = reply
            .lines
            .iter()
            .skip(1)
            .filter_map(|line| line.split_whitespace().next())
            .map(|keyword| keyword.to_ascii_uppercase())
            .collect();
        Ok(())
    }

    /// Whether the server advertised `name` in its EHLO response.
    pub fn has_extension(&self, name: &str) -> bool {
        let name = name.to_ascii_uppercase();
        self.extensions.iter().any(|e| *e == name)
    }

    async fn send_command(&mut self, command: &str) -> Result<()> {
        let line = format!("{command}\r\n");
        timeout(
            SMTP_COMMAND_TIMEOUT,
            self.reader.get_mut().write_all(line.as_bytes()),
        )
        .await
        .map_err(|_| anyhow!("SMTP write timed out"))??;
        Ok(())
    }

    async fn read_reply(&mut self) -> Result<Reply> {
        let mut lines = Vec::new();
        loop {
            let mut line = String::new();
            let n = timeout(SMTP_COMMAND_TIMEOUT, self.reader.read_line(&mut line))
                .await
                .map_err(|_| anyhow!("SMTP read timed out"))??;
            if n == 0 {
                bail!("connection closed mid-reply");
            }
            let line = line.trim_end().to_string();
            if line.len() < 3 {
                bail!("malformed SMTP reply: {line:?}");
            }
            let code: u16 = line[..3].parse().context("malformed SMTP reply code")?;
            let done = line.as_bytes().get(3) != Some(&b'-');
            lines.push(line.get(4..).unwrap_or("").to_string());
            if done {
                return Ok(Reply { code, lines });
            }
        }
    }

    /// Issues STARTTLS and completes the handshake with the supplied TLS
    /// configuration, consuming the session.
    pub async fn starttls(
        mut self,
        config: Arc<ClientConfig>,
        server_name: &str,
    ) -> Result<TlsStream<TcpStream>> {
        self.upgrade_to_tls().await?;
        let name = ServerName::try_from(server_name.trim_end_matches('.').to_string())
            .map_err(|e| anyhow!("invalid server name: {e}"))?;
        let connector = TlsConnector::from(config);
        let stream = self.reader.into_inner();
        let tls = timeout(SMTP_COMMAND_TIMEOUT, connector.connect(name, stream))
            .await
            .map_err(|_| anyhow!("TLS handshake timed out"))??;
        Ok(tls)
    }

    /// Issues STARTTLS, then offers the peer a bare SSLv3 ClientHello.
    ///
    /// rustls cannot speak SSLv3 at all, so the probe happens on the wire: a
    /// server that answers the hello with a handshake record still accepts
    /// SSLv3. Returns `Ok(true)` in that case.
    pub async fn probe_sslv3(mut self) -> Result<bool> {
        self.upgrade_to_tls().await?;
        let mut stream = self.reader.into_inner();
        timeout(SMTP_COMMAND_TIMEOUT, stream.write_all(&sslv3_client_hello()))
            .await
            .map_err(|_| anyhow!("SSLv3 probe write timed out"))??;
        let mut header = [0u8; 5];
        match timeout(SMTP_COMMAND_TIMEOUT, stream.read_exact(&mut header)).await {
            // 0x16 is a handshake record: the server sent a ServerHello back.
            Ok(Ok(_)) => Ok(header[0] == 0x16),
            // An alert, a reset, or silence all mean the offer was refused.
            Ok(Err(_)) | Err(_) => Ok(false),
        }
    }

    async fn upgrade_to_tls(&mut self) -> Result<()> {
        self.send_command("STARTTLS").await?;
        let reply = self.read_reply().await.context("no reply to STARTTLS")?;
        if reply.code != 220 {
            bail!("STARTTLS rejected: {}", reply.code);
        }
        Ok(())
    }
}

/// A minimal SSLv3 ClientHello offering a handful of period cipher suites.
fn sslv3_client_hello() -> Vec<u8> {
    const SUITES: [u16; 3] = [
        0x0035, // TLS_RSA_WITH_AES_256_CBC_SHA
        0x002f, // TLS_RSA_WITH_AES_128_CBC_SHA
        0x000a, // TLS_RSA_WITH_3DES_EDE_CBC_SHA
    ];
    let mut random = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut random);

    let mut hello = Vec::new();
    hello.extend_from_slice(&[0x03, 0x00]); // client_version = SSL 3.0
    hello.extend_from_slice(&random);
    hello.push(0x00); // empty session id
    hello.extend_from_slice(&((SUITES.len() * 2) as u16).to_be_bytes());
    for suite in SUITES {
        hello.extend_from_slice(&suite.to_be_bytes());
    }
    hello.extend_from_slice(&[0x01, 0x00]); // null compression only

    let mut handshake = vec![0x01]; // ClientHello
    handshake.extend_from_slice(&(hello.len() as u32).to_be_bytes()[1..]);
    handshake.extend_from_slice(&hello);

    let mut record = vec![0x16, 0x03, 0x00]; // handshake record, SSL 3.0
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake);
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    /// Spawns a scripted SMTP server on loopback. Each entry is an expected
    /// command prefix and the response to send for it.
    async fn spawn_mock_server(script: Vec<(&'static str, &'static str)>) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock server");
        let port = listener.local_addr().expect("addr").port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = BufReader::new(read_half);
            write_half
                .write_all(b"220 mock.smtp.test ESMTP\r\n")
                .await
                .expect("greeting");
            for (expected, response) in script {
                let mut line = String::new();
                reader.read_line(&mut line).await.expect("command");
                assert!(
                    line.starts_with(expected),
                    "expected command starting with {expected:?}, got {line:?}"
                );
                write_half
                    .write_all(response.as_bytes())
                    .await
                    .expect("response");
            }
        });
        port
    }

    #[tokio::test]
    async fn ehlo_parses_extensions() {
        let port = spawn_mock_server(vec![(
            "EHLO",
            "250-mock.example\r\n250-SIZE 52428800\r\n250 STARTTLS\r\n",
        )])
        .await;
        let session = SmtpSession::connect(&format!("127.0.0.1:{port}"), "scanner.test")
            .await
            .expect("session");
        assert!(session.has_extension("STARTTLS"));
        assert!(session.has_extension("starttls"));
        assert!(session.has_extension("SIZE"));
        assert!(!session.has_extension("8BITMIME"));
    }

    #[tokio::test]
    async fn rejected_ehlo_is_an_error() {
        let port = spawn_mock_server(vec![("EHLO", "550 go away\r\n")]).await;
        let result = SmtpSession::connect(&format!("127.0.0.1:{port}"), "scanner.test").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn starttls_refusal_surfaces_code() {
        let port = spawn_mock_server(vec![
            ("EHLO", "250-mock.example\r\n250 STARTTLS\r\n"),
            ("STARTTLS", "454 TLS not available\r\n"),
        ])
        .await;
        let session = SmtpSession::connect(&format!("127.0.0.1:{port}"), "scanner.test")
            .await
            .expect("session");
        let err = session.probe_sslv3().await.expect_err("refusal");
        assert!(err.to_string().contains("454"));
    }

    #[tokio::test]
    async fn connect_fails_fast_on_closed_port() {
        // Bind then drop to get a port nothing listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);
        let result = SmtpSession::connect(&format!("127.0.0.1:{port}"), "scanner.test").await;
        assert!(result.is_err());
    }

    #[test]
    fn sslv3_hello_is_well_formed() {
        let hello = sslv3_client_hello();
        assert_eq!(hello[0], 0x16);
        assert_eq!(&hello[1..3], &[0x03, 0x00]);
        let record_len = u16::from_be_bytes([hello[3], hello[4]]) as usize;
        assert_eq!(record_len, hello.len() - 5);
        // Handshake header: ClientHello with a 24-bit length.
        assert_eq!(hello[5], 0x01);
        let hs_len = u32::from_be_bytes([0, hello[6], hello[7], hello[8]]) as usize;
        assert_eq!(hs_len, record_len - 4);
    }
}
