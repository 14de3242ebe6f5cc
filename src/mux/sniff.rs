//! Prefix classification.
//!
//! Reads just enough of a connection to let the matchers decide. The bytes
//! read are returned to the caller so they can be replayed.

use bytes::{BufMut, BytesMut};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::matcher::{MatchResult, Matcher};

const READ_CHUNK: usize = 512;

/// Evaluate matchers in registration order against `buf`.
///
/// Returns `None` when a matcher ahead of any decisive answer still needs
/// bytes. `Some(None)` means nothing can match.
pub fn decide(matchers: &[&dyn Matcher], buf: &[u8], eof: bool) -> Option<Option<usize>> {
    for (index, matcher) in matchers.iter().enumerate() {
        match matcher.probe(buf) {
            MatchResult::Matched => return Some(Some(index)),
            MatchResult::NoMatch => continue,
            MatchResult::Incomplete if eof => continue,
            MatchResult::Incomplete => return None,
        }
    }
    Some(None)
}

/// Read from `stream` until the matchers reach a decision.
///
/// Reaching `max_peek` bytes is treated like end of stream: matchers still
/// waiting for input count as non-matching.
pub async fn classify<S>(
    stream: &mut S,
    matchers: &[&dyn Matcher],
    max_peek: usize,
) -> io::Result<(Option<usize>, BytesMut)>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(READ_CHUNK.min(max_peek.max(1)));
    let mut eof = false;

    loop {
        let exhausted = eof || buf.len() >= max_peek;
        if let Some(decision) = decide(matchers, &buf, exhausted) {
            return Ok((decision, buf));
        }

        let remaining = max_peek - buf.len();
        buf.reserve(remaining.min(READ_CHUNK));
        let n = stream.read_buf(&mut (&mut buf).limit(remaining)).await?;
        if n == 0 {
            eof = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::matcher::{Any, Http1Fast, Http2Preface, TlsHandshake};
    use tokio::io::AsyncWriteExt;

    #[test]
    fn first_registered_match_wins() {
        let http = Http1Fast::new();
        let any = Any;
        let matchers: [&dyn Matcher; 2] = [&http, &any];
        assert_eq!(decide(&matchers, b"GET / HTTP/1.1", false), Some(Some(0)));

        let reversed: [&dyn Matcher; 2] = [&any, &http];
        assert_eq!(decide(&reversed, b"GET / HTTP/1.1", false), Some(Some(0)));
    }

    #[test]
    fn incomplete_blocks_lower_priority() {
        let tls = TlsHandshake;
        let any = Any;
        let matchers: [&dyn Matcher; 2] = [&tls, &any];
        assert_eq!(decide(&matchers, &[0x16, 0x03], false), None);
        assert_eq!(decide(&matchers, &[0x16, 0x03], true), Some(Some(1)));
    }

    #[test]
    fn nothing_matches() {
        let tls = TlsHandshake;
        let http = Http1Fast::new();
        let matchers: [&dyn Matcher; 2] = [&tls, &http];
        assert_eq!(decide(&matchers, b"\x00\x00\x00\x05hello", false), Some(None));
    }

    #[tokio::test]
    async fn classify_reads_across_segments() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let writer = tokio::spawn(async move {
            client.write_all(b"PRI * HT").await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            client.write_all(b"TP/2.0\r\n\r\nSM\r\n\r\nrest").await.unwrap();
            client
        });

        let h2 = Http2Preface;
        let any = Any;
        let matchers: [&dyn Matcher; 2] = [&h2, &any];
        let (decision, buf) = classify(&mut server, &matchers, 4096).await.unwrap();
        assert_eq!(decision, Some(0));
        assert!(buf.starts_with(b"PRI * HTTP/2.0"));
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn classify_stops_at_peek_limit() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(b"PRI * HTTP/2.0").await.unwrap();

        let h2 = Http2Preface;
        let matchers: [&dyn Matcher; 1] = [&h2];
        let (decision, buf) = classify(&mut server, &matchers, 4).await.unwrap();
        assert_eq!(decision, None);
        assert_eq!(&buf[..], b"PRI ");
    }
}
