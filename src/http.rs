use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::buffer_pool::{get_buffer, return_buffer};

/// Upper bound on bytes consumed while scanning for the end of the header
/// block. Requests with a larger header area are refused outright.
pub const MAX_HEADER_AREA: usize = 81_920;

/// A parsed request head plus any bytes read past the blank line.
///
/// `Proxy-*` headers never appear in `headers`; the `Proxy-Authorization`
/// value, if present, is captured separately so proxy-layer credentials are
/// not forwarded upstream.
#[derive(Debug)]
pub struct ParsedRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub proxy_authorization: Option<String>,
    pub remaining: Bytes,
}

/// Error type for request-head parsing
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("connection closed before the header block ended")]
    NetworkClosed,

    #[error("malformed request: {0}")]
    Malformed(&'static str),

    #[error("header block too large")]
    HeaderTooLarge,
}

/// Read one request head from `source`.
///
/// Reads are buffered through the shared pool: a 4 KiB buffer first, upgraded
/// once to 16 KiB when a line does not fit. Bytes already read past the blank
/// line are handed back in [`ParsedRequest::remaining`].
pub async fn read_request<R>(source: &mut R) -> Result<ParsedRequest, ParseError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = get_buffer(false).await;
    let mut large = false;
    let result = parse_from(source, &mut buf, &mut large).await;
    return_buffer(buf, large).await;
    result
}

async fn parse_from<R>(
    source: &mut R,
    buf: &mut Vec<u8>,
    large: &mut bool,
) -> Result<ParsedRequest, ParseError>
where
    R: AsyncRead + Unpin,
{
    let mut head = HeadBuilder::default();
    let mut filled = 0usize;
    let mut area = 0usize;

    loop {
        let mut start = 0usize;
        while let Some(nl) = buf[start..filled].iter().position(|&b| b == b'\n') {
            let line_end = start + nl;
            area += nl + 1;
            if area >= MAX_HEADER_AREA {
                return Err(ParseError::HeaderTooLarge);
            }

            let line = strip_cr(&buf[start..line_end]);
            if !head.have_request_line {
                head.take_request_line(line)?;
            } else if line.is_empty() {
                let remaining = Bytes::copy_from_slice(&buf[line_end + 1..filled]);
                return Ok(head.finish(remaining));
            } else {
                head.take_header_line(line)?;
            }
            start = line_end + 1;
        }

        // Shift the unconsumed tail to the front of the buffer
        if start > 0 {
            buf.copy_within(start..filled, 0);
            filled -= start;
        }

        if filled == buf.len() {
            if *large {
                return Err(ParseError::HeaderTooLarge);
            }
            let mut upgraded = get_buffer(true).await;
            upgraded[..filled].copy_from_slice(&buf[..filled]);
            let primary = std::mem::replace(buf, upgraded);
            return_buffer(primary, false).await;
            *large = true;
        }

        let n = source
            .read(&mut buf[filled..])
            .await
            .map_err(|_| ParseError::NetworkClosed)?;
        if n == 0 {
            return Err(ParseError::NetworkClosed);
        }
        filled += n;
    }
}

#[derive(Default)]
struct HeadBuilder {
    method: String,
    url: String,
    headers: Vec<(String, String)>,
    proxy_authorization: Option<String>,
    have_request_line: bool,
}

impl HeadBuilder {
    fn take_request_line(&mut self, line: &[u8]) -> Result<(), ParseError> {
        let line = std::str::from_utf8(line)
            .map_err(|_| ParseError::Malformed("request line is not valid text"))?;
        let (method, rest) = line
            .split_once(' ')
            .ok_or(ParseError::Malformed("request line missing URL"))?;
        let (url, version) = rest
            .split_once(' ')
            .ok_or(ParseError::Malformed("request line missing version"))?;

        if method.is_empty() || url.is_empty() {
            return Err(ParseError::Malformed("empty method or URL"));
        }
        if version != "HTTP/1.1" {
            return Err(ParseError::Malformed("unsupported protocol version"));
        }

        self.method = method.to_string();
        self.url = url.to_string();
        self.have_request_line = true;
        Ok(())
    }

    fn take_header_line(&mut self, line: &[u8]) -> Result<(), ParseError> {
        let line = std::str::from_utf8(line)
            .map_err(|_| ParseError::Malformed("header line is not valid text"))?;
        let (name, value) = line
            .split_once(':')
            .ok_or(ParseError::Malformed("header line missing colon"))?;

        let name = name.trim_matches(|c| c == ' ' || c == '\t');
        let value = value.trim_matches(|c| c == ' ' || c == '\t');
        if name.is_empty() {
            return Err(ParseError::Malformed("empty header name"));
        }
        if name.contains('\r') {
            return Err(ParseError::Malformed("header name contains CR"));
        }

        if is_proxy_header(name) {
            if name.eq_ignore_ascii_case("proxy-authorization") {
                self.proxy_authorization = Some(value.to_string());
            }
            return Ok(());
        }

        self.headers.push((name.to_string(), value.to_string()));
        Ok(())
    }

    fn finish(self, remaining: Bytes) -> ParsedRequest {
        ParsedRequest {
            method: self.method,
            url: self.url,
            headers: self.headers,
            proxy_authorization: self.proxy_authorization,
            remaining,
        }
    }
}

fn strip_cr(line: &[u8]) -> &[u8] {
    match line.last() {
        Some(b'\r') => &line[..line.len() - 1],
        _ => line,
    }
}

fn is_proxy_header(name: &str) -> bool {
    name.get(..6)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("proxy-"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    async fn parse(input: &[u8]) -> Result<ParsedRequest, ParseError> {
        let mut source = input;
        read_request(&mut source).await
    }

    #[tokio::test]
    async fn parses_connect_head_and_keeps_payload() {
        let parsed = parse(b"CONNECT example.com:443 HTTP/1.1\nHost: example.com:443\n\nHELLO")
            .await
            .unwrap();

        assert_eq!(parsed.method, "CONNECT");
        assert_eq!(parsed.url, "example.com:443");
        assert_eq!(
            parsed.headers,
            vec![("Host".to_string(), "example.com:443".to_string())]
        );
        assert_eq!(parsed.proxy_authorization, None);
        assert_eq!(&parsed.remaining[..], b"HELLO");
    }

    #[tokio::test]
    async fn tolerates_crlf_line_endings() {
        let parsed = parse(b"GET http://e/ HTTP/1.1\r\nHost: e\r\nX: y\r\n\r\nrest")
            .await
            .unwrap();

        assert_eq!(parsed.method, "GET");
        assert_eq!(
            parsed.headers,
            vec![
                ("Host".to_string(), "e".to_string()),
                ("X".to_string(), "y".to_string()),
            ]
        );
        assert_eq!(&parsed.remaining[..], b"rest");
    }

    #[tokio::test]
    async fn strips_proxy_headers_and_captures_authorization() {
        let parsed = parse(
            b"GET http://e/ HTTP/1.1\n\
              Host: e\n\
              Proxy-Connection: keep-alive\n\
              proxy-authorization:  Basic dTpw \n\
              User-Agent: t\n\n",
        )
        .await
        .unwrap();

        assert_eq!(
            parsed.headers,
            vec![
                ("Host".to_string(), "e".to_string()),
                ("User-Agent".to_string(), "t".to_string()),
            ]
        );
        assert_eq!(parsed.proxy_authorization.as_deref(), Some("Basic dTpw"));
        assert!(!parsed
            .headers
            .iter()
            .any(|(name, _)| name.to_ascii_lowercase().starts_with("proxy-")));
    }

    #[tokio::test]
    async fn preserves_header_order_and_case() {
        let parsed = parse(b"GET http://e/ HTTP/1.1\nZZ: 1\nAa: 2\nzz: 3\n\n")
            .await
            .unwrap();
        assert_eq!(
            parsed.headers,
            vec![
                ("ZZ".to_string(), "1".to_string()),
                ("Aa".to_string(), "2".to_string()),
                ("zz".to_string(), "3".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn rejects_wrong_version() {
        assert_eq!(
            parse(b"GET / HTTP/1.0\n\n").await.unwrap_err(),
            ParseError::Malformed("unsupported protocol version")
        );
    }

    #[tokio::test]
    async fn rejects_url_with_embedded_space() {
        // The second split lands inside the URL, so version validation fails
        assert!(matches!(
            parse(b"GET /a b HTTP/1.1\n\n").await.unwrap_err(),
            ParseError::Malformed(_)
        ));
    }

    #[tokio::test]
    async fn rejects_header_without_colon() {
        assert!(matches!(
            parse(b"GET / HTTP/1.1\nbogus line\n\n").await.unwrap_err(),
            ParseError::Malformed(_)
        ));
    }

    #[tokio::test]
    async fn rejects_whitespace_only_header_line() {
        assert!(matches!(
            parse(b"GET / HTTP/1.1\nHost: e\n   \n\n").await.unwrap_err(),
            ParseError::Malformed(_)
        ));
    }

    #[tokio::test]
    async fn rejects_header_name_containing_cr() {
        assert!(matches!(
            parse(b"GET / HTTP/1.1\nBad\rName: v\n\n").await.unwrap_err(),
            ParseError::Malformed(_)
        ));
    }

    #[tokio::test]
    async fn reports_closed_source_mid_header() {
        assert_eq!(
            parse(b"GET / HTTP/1.1\nHost: e\n").await.unwrap_err(),
            ParseError::NetworkClosed
        );
    }

    fn head_of_exact_size(total: usize) -> Vec<u8> {
        let request_line = b"GET http://e/ HTTP/1.1\n".to_vec();
        // request line + "P: ...\n" + "\n"
        let padding = total - request_line.len() - 4 - 1;
        let mut input = request_line;
        input.extend_from_slice(b"P: ");
        input.extend(std::iter::repeat(b'x').take(padding));
        input.extend_from_slice(b"\n\n");
        assert_eq!(input.len(), total);
        input
    }

    #[tokio::test]
    async fn accepts_header_block_of_exactly_primary_size() {
        let input = head_of_exact_size(4_096);
        let parsed = parse(&input).await.unwrap();
        assert_eq!(parsed.headers.len(), 1);
        assert!(parsed.remaining.is_empty());
    }

    #[tokio::test]
    async fn accepts_header_block_needing_secondary_buffer() {
        for total in [4_097, 10_000, 16_384] {
            let input = head_of_exact_size(total);
            let parsed = parse(&input).await.unwrap();
            assert_eq!(parsed.headers.len(), 1, "total {total}");
        }
    }

    #[tokio::test]
    async fn rejects_single_line_exceeding_secondary_buffer() {
        let input = head_of_exact_size(20_000);
        assert_eq!(parse(&input).await.unwrap_err(), ParseError::HeaderTooLarge);
    }

    #[tokio::test]
    async fn rejects_header_area_at_maximum() {
        // Many small lines so no single line overflows the buffers
        let mut input = b"GET http://e/ HTTP/1.1\n".to_vec();
        while input.len() < MAX_HEADER_AREA {
            input.extend_from_slice(b"Key: valuevaluevaluevaluevaluevaluevalue\n");
        }
        input.extend_from_slice(b"\n");
        assert_eq!(parse(&input).await.unwrap_err(), ParseError::HeaderTooLarge);
    }

    #[tokio::test]
    async fn accepts_large_header_area_below_maximum() {
        let line = b"Key: valuevaluevaluevaluevaluevaluevalue\n";
        let mut input = b"GET http://e/ HTTP/1.1\n".to_vec();
        while input.len() + line.len() + 1 < MAX_HEADER_AREA - 1 {
            input.extend_from_slice(line);
        }
        input.extend_from_slice(b"\n");
        assert!(input.len() < MAX_HEADER_AREA);
        let parsed = parse(&input).await.unwrap();
        assert!(parsed.headers.len() > 1_000);
    }

    #[tokio::test]
    async fn consumed_plus_remaining_equals_input() {
        let input: &[u8] = b"CONNECT h:1 HTTP/1.1\nA: 1\nB: 2\n\ntrailing-bytes";
        let head_len = input.len() - b"trailing-bytes".len();
        let parsed = parse(input).await.unwrap();
        assert_eq!(&parsed.remaining[..], &input[head_len..]);
    }

    #[tokio::test]
    async fn handles_input_split_at_every_byte_boundary() {
        let input = b"GET http://example.com/p HTTP/1.1\nHost: example.com\nUser-Agent: t\n\nBODY";

        for split in 1..input.len() {
            let (first, second) = input.split_at(split);
            let (mut tx, mut rx) = tokio::io::duplex(256);
            let first = first.to_vec();
            let second = second.to_vec();

            let writer = tokio::spawn(async move {
                tx.write_all(&first).await.unwrap();
                tx.flush().await.unwrap();
                tokio::task::yield_now().await;
                tx.write_all(&second).await.unwrap();
                tx.flush().await.unwrap();
                // Keep the channel open until the parser is done reading
                tx
            });

            let parsed = read_request(&mut rx).await.unwrap();
            assert_eq!(parsed.method, "GET", "split {split}");
            assert_eq!(parsed.url, "http://example.com/p");
            assert_eq!(parsed.headers.len(), 2);
            drop(writer.await.unwrap());
        }
    }
}
