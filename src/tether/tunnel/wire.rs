use std::time::Duration;

use bytes::{Buf, BytesMut};
use rand::{RngExt, rng};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const DEFAULT_AUTH_TOKEN: &str = "AUTH_CONTROL";
pub const TUNNEL_FOR_PREFIX: &[u8] = b"TUNNEL_FOR:";
pub const CREATE_TUNNEL_PREFIX: &[u8] = b"CREATE_TUNNEL:";

/// Connection ids have a fixed length so commands can be cut out of the
/// undelimited control stream.
pub const CONNECTION_ID_LEN: usize = 32;

const ID_ALPHABET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

#[derive(Debug, Error)]
pub enum WireError {
    #[error("unrecognized hello")]
    BadHello,
    #[error("hello timed out")]
    Timeout,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Role announced by the first bytes on the control port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Hello {
    Control,
    Tunnel(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HelloProgress {
    NeedMore,
    Done(Hello),
    Invalid,
}

/// A fresh id from the thread-local CSPRNG (~190 bits).
pub fn new_connection_id() -> String {
    let mut r = rng();
    (0..CONNECTION_ID_LEN)
        .map(|_| ID_ALPHABET[r.random_range(0..ID_ALPHABET.len())] as char)
        .collect()
}

fn is_id_chars(b: &[u8]) -> bool {
    b.iter().all(u8::is_ascii_alphanumeric)
}

pub fn classify_hello(buf: &[u8], token: &[u8]) -> HelloProgress {
    if buf == token {
        return HelloProgress::Done(Hello::Control);
    }

    if let Some(id) = buf.strip_prefix(TUNNEL_FOR_PREFIX) {
        if !is_id_chars(id) || id.len() > CONNECTION_ID_LEN {
            return HelloProgress::Invalid;
        }
        if id.len() == CONNECTION_ID_LEN {
            return HelloProgress::Done(Hello::Tunnel(
                String::from_utf8_lossy(id).into_owned(),
            ));
        }
        return HelloProgress::NeedMore;
    }

    if token.starts_with(buf) || TUNNEL_FOR_PREFIX.starts_with(buf) {
        HelloProgress::NeedMore
    } else {
        HelloProgress::Invalid
    }
}

/// Read the role announcement without consuming anything past it.
pub async fn read_hello<R: AsyncRead + Unpin>(
    r: &mut R,
    token: &str,
    timeout: Duration,
) -> Result<Hello, WireError> {
    let fut = async {
        let mut buf = Vec::with_capacity(TUNNEL_FOR_PREFIX.len() + CONNECTION_ID_LEN);
        loop {
            buf.push(r.read_u8().await?);
            match classify_hello(&buf, token.as_bytes()) {
                HelloProgress::NeedMore => continue,
                HelloProgress::Done(h) => return Ok(h),
                HelloProgress::Invalid => return Err(WireError::BadHello),
            }
        }
    };

    if timeout > Duration::from_millis(0) {
        tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| WireError::Timeout)?
    } else {
        fut.await
    }
}

pub async fn write_control_hello<W: AsyncWrite + Unpin>(
    w: &mut W,
    token: &str,
) -> Result<(), WireError> {
    w.write_all(token.as_bytes()).await?;
    w.flush().await?;
    Ok(())
}

pub async fn write_tunnel_hello<W: AsyncWrite + Unpin>(
    w: &mut W,
    id: &str,
) -> Result<(), WireError> {
    let mut msg = Vec::with_capacity(TUNNEL_FOR_PREFIX.len() + id.len());
    msg.extend_from_slice(TUNNEL_FOR_PREFIX);
    msg.extend_from_slice(id.as_bytes());
    w.write_all(&msg).await?;
    w.flush().await?;
    Ok(())
}

pub fn create_tunnel_command(id: &str) -> Vec<u8> {
    let mut msg = Vec::with_capacity(CREATE_TUNNEL_PREFIX.len() + id.len());
    msg.extend_from_slice(CREATE_TUNNEL_PREFIX);
    msg.extend_from_slice(id.as_bytes());
    msg
}

/// Cuts `CREATE_TUNNEL:<id>` commands out of the raw control stream.
///
/// Bytes that do not belong to a command are skipped up to the next marker.
#[derive(Debug, Default)]
pub struct CommandDecoder {
    buf: BytesMut,
}

impl CommandDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);

        let mut out = Vec::new();
        let full = CREATE_TUNNEL_PREFIX.len() + CONNECTION_ID_LEN;
        loop {
            match find(&self.buf, CREATE_TUNNEL_PREFIX) {
                Some(0) => {}
                Some(pos) => {
                    tracing::debug!(skipped = pos, "tunnel: junk on control stream");
                    self.buf.advance(pos);
                }
                None => {
                    let keep = partial_marker_suffix(&self.buf, CREATE_TUNNEL_PREFIX);
                    let skip = self.buf.len() - keep;
                    if skip > 0 {
                        tracing::debug!(skipped = skip, "tunnel: junk on control stream");
                        self.buf.advance(skip);
                    }
                    break;
                }
            }

            let avail = self.buf.len().min(full);
            let id = &self.buf[CREATE_TUNNEL_PREFIX.len()..avail];
            if !is_id_chars(id) {
                self.buf.advance(CREATE_TUNNEL_PREFIX.len());
                continue;
            }
            if avail < full {
                break;
            }

            out.push(String::from_utf8_lossy(id).into_owned());
            self.buf.advance(full);
        }
        out
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Length of the longest tail of `buf` that could still grow into `marker`.
fn partial_marker_suffix(buf: &[u8], marker: &[u8]) -> usize {
    let max = buf.len().min(marker.len().saturating_sub(1));
    (1..=max)
        .rev()
        .find(|&k| marker.starts_with(&buf[buf.len() - k..]))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOKEN: &[u8] = b"AUTH_CONTROL";

    fn id(c: char) -> String {
        std::iter::repeat_n(c, CONNECTION_ID_LEN).collect()
    }

    #[test]
    fn connection_ids_are_fixed_length_alphanumeric_and_distinct() {
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            let id = new_connection_id();
            assert_eq!(id.len(), CONNECTION_ID_LEN);
            assert!(is_id_chars(id.as_bytes()));
            assert!(seen.insert(id));
        }
    }

    #[test]
    fn classify_control_and_tunnel() {
        assert_eq!(
            classify_hello(b"AUTH_CONTROL", TOKEN),
            HelloProgress::Done(Hello::Control)
        );
        assert_eq!(classify_hello(b"AUTH_", TOKEN), HelloProgress::NeedMore);
        assert_eq!(classify_hello(b"TUNNEL_F", TOKEN), HelloProgress::NeedMore);

        let mut hello = TUNNEL_FOR_PREFIX.to_vec();
        hello.extend_from_slice(id('a').as_bytes());
        assert_eq!(
            classify_hello(&hello, TOKEN),
            HelloProgress::Done(Hello::Tunnel(id('a')))
        );
        assert_eq!(
            classify_hello(&hello[..hello.len() - 1], TOKEN),
            HelloProgress::NeedMore
        );
    }

    #[test]
    fn classify_rejects_garbage() {
        assert_eq!(classify_hello(b"GET / HTTP/1.1", TOKEN), HelloProgress::Invalid);
        assert_eq!(classify_hello(b"AUTH_CONTROLX", TOKEN), HelloProgress::Invalid);
        assert_eq!(classify_hello(b"TUNNEL_FOR:ab-", TOKEN), HelloProgress::Invalid);
        assert_eq!(classify_hello(b"\x16\x03\x01", TOKEN), HelloProgress::Invalid);
    }

    #[tokio::test]
    async fn read_hello_leaves_trailing_bytes_unread() {
        let (mut a, mut b) = tokio::io::duplex(256);
        let tid = new_connection_id();

        write_tunnel_hello(&mut a, &tid).await.unwrap();
        a.write_all(b"payload").await.unwrap();

        let got = read_hello(&mut b, "AUTH_CONTROL", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(got, Hello::Tunnel(tid));

        let mut rest = [0u8; 7];
        b.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"payload");
    }

    #[tokio::test]
    async fn read_hello_custom_token() {
        let (mut a, mut b) = tokio::io::duplex(64);
        write_control_hello(&mut a, "s3cret").await.unwrap();
        let got = read_hello(&mut b, "s3cret", Duration::from_secs(1)).await.unwrap();
        assert_eq!(got, Hello::Control);
    }

    #[tokio::test]
    async fn read_hello_times_out_on_silence() {
        let (_a, mut b) = tokio::io::duplex(64);
        let err = read_hello(&mut b, "AUTH_CONTROL", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, WireError::Timeout));
    }

    #[tokio::test]
    async fn read_hello_eof_is_io_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(b"AUTH").await.unwrap();
        drop(a);
        let err = read_hello(&mut b, "AUTH_CONTROL", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, WireError::Io(_)));
    }

    #[test]
    fn decoder_handles_split_and_concatenated_commands() {
        let mut d = CommandDecoder::new();
        let mut stream = create_tunnel_command(&id('a'));
        stream.extend(create_tunnel_command(&id('b')));
        stream.extend(create_tunnel_command(&id('c')));

        let mut got = Vec::new();
        for chunk in stream.chunks(7) {
            got.extend(d.push(chunk));
        }
        assert_eq!(got, vec![id('a'), id('b'), id('c')]);
    }

    #[test]
    fn decoder_resyncs_after_junk() {
        let mut d = CommandDecoder::new();
        let mut stream = b"\r\nnoise CREATE_TUNNEL:bad!".to_vec();
        stream.extend(create_tunnel_command(&id('z')));
        assert_eq!(d.push(&stream), vec![id('z')]);
        assert!(d.push(b"CREATE_").is_empty());
        assert_eq!(d.push(&create_tunnel_command(&id('y'))[7..]), vec![id('y')]);
    }
}
