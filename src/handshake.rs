use crate::{
    config::Config,
    connection::{Connection, ResponseHandle, UpgradedExchange},
    error::{H2Error, LocalError},
    request::Request,
    response::Response,
    settings,
    types::Headers,
};
use base64::Engine as _;
use bytes::BytesMut;
use log::{debug, trace};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::oneshot,
};

/// How a transport ended up speaking (or not speaking) HTTP/2. The three
/// establishment paths are mutually exclusive and decided before any HTTP/2
/// byte flows: ALPN picks this module's caller-side branch, cleartext goes
/// through [`upgrade`] or [`prior_knowledge`].
pub enum UpgradeResult {
    /// 101 Switching Protocols: the session is installed and the upgraded
    /// request lives on as implicit stream 1 in half-closed (local).
    Http2 {
        connection: Connection,
        response: ResponseHandle,
    },
    /// The server answered the request directly over HTTP/1.1. The
    /// connection must be considered never-HTTP/2 from here on.
    Http1 { response: Response },
}

/// Prior-knowledge establishment: the preface goes out immediately after
/// connect, no upgrade dance.
pub async fn prior_knowledge<T>(io: T, config: Config) -> Result<Connection, H2Error>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    Connection::handshake(io, config).await
}

/// HTTP/1.1 Upgrade establishment: send `request` as HTTP/1.1 with the
/// `Upgrade: h2c` headers injected, then commit to whichever protocol the
/// server picked. Callers must not issue a second request on the transport
/// until the result resolves.
pub async fn upgrade<T>(
    mut io: T,
    config: Config,
    request: Request,
) -> Result<UpgradeResult, H2Error>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    config.validate()?;
    // a request that manages its own Connection headers opted out of the dance
    if request.has_connection_headers() || config.never_force_upgrade {
        let response = http1_exchange(&mut io, &request, None).await?;
        return Ok(UpgradeResult::Http1 { response });
    }

    let token = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .encode(settings::encode_params(&config.local_settings()));
    write_request(&mut io, &request, Some(&token)).await?;

    let mut buf = BytesMut::with_capacity(4096);
    let head_len = read_head(&mut io, &mut buf).await?;
    let head = parse_head(&buf.split_to(head_len))?;

    if head.status == 101 && upgrades_to_h2c(&head.headers) {
        debug!("server switched protocols; adopting HTTP/2");
        let (tx, rx) = oneshot::channel();
        let exchange = UpgradedExchange {
            request_headers: request.headers.clone(),
            response_tx: tx,
        };
        // bytes past the 101 head are already HTTP/2 (the server preface)
        let residual = buf.split().freeze();
        let connection = Connection::install(io, config, residual, Some(exchange)).await?;
        return Ok(UpgradeResult::Http2 {
            connection,
            response: ResponseHandle::new(1, rx),
        });
    }

    debug!(
        "server answered {} without switching; connection stays HTTP/1.1",
        head.status
    );
    let response = finish_http1_response(&mut io, head, buf).await?;
    Ok(UpgradeResult::Http1 { response })
}

/// One plain HTTP/1.1 exchange, used when the upgrade dance is disabled or
/// already declined. `token` injects the upgrade headers when present.
pub async fn http1_exchange<T>(
    io: &mut T,
    request: &Request,
    token: Option<&str>,
) -> Result<Response, H2Error>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    write_request(io, request, token).await?;
    let mut buf = BytesMut::with_capacity(4096);
    let head_len = read_head(io, &mut buf).await?;
    let head = parse_head(&buf.split_to(head_len))?;
    finish_http1_response(io, head, buf).await
}

struct ResponseHead {
    status: u16,
    headers: Headers,
}

async fn write_request<T>(
    io: &mut T,
    request: &Request,
    token: Option<&str>,
) -> Result<(), H2Error>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let method = request.pseudo(":method").unwrap_or("GET");
    let path = request.pseudo(":path").unwrap_or("/");
    let authority = request.pseudo(":authority").unwrap_or_default();

    let mut head = format!("{method} {path} HTTP/1.1\r\nHost: {authority}\r\n");
    for (name, value) in &request.headers {
        if !name.starts_with(':') {
            head.push_str(&format!("{name}: {value}\r\n"));
        }
    }
    if let Some(token) = token {
        head.push_str("Upgrade: h2c\r\n");
        head.push_str("Connection: Upgrade, HTTP2-Settings\r\n");
        head.push_str(&format!("HTTP2-Settings: {token}\r\n"));
    }
    if !request.body.is_empty() {
        head.push_str(&format!("Content-Length: {}\r\n", request.body.len()));
    }
    head.push_str("\r\n");
    trace!("h1 request head:\n{head}");

    io.write_all(head.as_bytes())
        .await
        .map_err(|err| http1_error(format!("request write failed: {err}")))?;
    if !request.body.is_empty() {
        io.write_all(&request.body)
            .await
            .map_err(|err| http1_error(format!("body write failed: {err}")))?;
    }
    io.flush()
        .await
        .map_err(|err| http1_error(format!("flush failed: {err}")))?;
    Ok(())
}

/// Read until the response head (terminated by a blank line) is buffered;
/// returns its length including the terminator.
async fn read_head<T>(io: &mut T, buf: &mut BytesMut) -> Result<usize, H2Error>
where
    T: AsyncRead + Unpin,
{
    loop {
        if let Some(end) = buf.windows(4).position(|window| window == b"\r\n\r\n") {
            return Ok(end + 4);
        }
        let n = io
            .read_buf(buf)
            .await
            .map_err(|err| http1_error(format!("response read failed: {err}")))?;
        if n == 0 {
            return Err(LocalError::ConnectionClosed.into());
        }
    }
}

fn parse_head(bytes: &[u8]) -> Result<ResponseHead, H2Error> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| http1_error("response head is not UTF-8".to_owned()))?;
    let mut lines = text.split("\r\n");
    let status_line = lines
        .next()
        .ok_or_else(|| http1_error("empty response head".to_owned()))?;
    let mut parts = status_line.splitn(3, ' ');
    let version = parts
        .next()
        .ok_or_else(|| http1_error("missing HTTP version".to_owned()))?;
    if !version.starts_with("HTTP/1.") {
        return Err(http1_error(format!("unexpected version {version:?}")));
    }
    let status: u16 = parts
        .next()
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| http1_error(format!("bad status line {status_line:?}")))?;

    let mut headers = vec![(":status".to_owned(), status.to_string())];
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| http1_error(format!("bad header line {line:?}")))?;
        headers.push((name.trim().to_ascii_lowercase(), value.trim().to_owned()));
    }
    Ok(ResponseHead { status, headers })
}

fn upgrades_to_h2c(headers: &Headers) -> bool {
    let field = |name: &str| {
        headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
            .unwrap_or_default()
    };
    field("upgrade").eq_ignore_ascii_case("h2c")
        && field("connection")
            .split(',')
            .any(|part| part.trim().eq_ignore_ascii_case("upgrade"))
}

/// Read the body of a non-switching response. Content-Length is honored;
/// without one, the body runs to connection close.
async fn finish_http1_response<T>(
    io: &mut T,
    head: ResponseHead,
    mut buf: BytesMut,
) -> Result<Response, H2Error>
where
    T: AsyncRead + Unpin,
{
    let content_length: Option<usize> = head
        .headers
        .iter()
        .find(|(name, _)| name == "content-length")
        .and_then(|(_, value)| value.parse().ok());

    match content_length {
        Some(length) => {
            while buf.len() < length {
                let n = io
                    .read_buf(&mut buf)
                    .await
                    .map_err(|err| http1_error(format!("body read failed: {err}")))?;
                if n == 0 {
                    return Err(http1_error("body shorter than Content-Length".to_owned()));
                }
            }
            buf.truncate(length);
        }
        None => {
            while io
                .read_buf(&mut buf)
                .await
                .map_err(|err| http1_error(format!("body read failed: {err}")))?
                > 0
            {}
        }
    }
    Ok(Response {
        headers: head.headers,
        body: buf.freeze(),
        trailers: Headers::new(),
    })
}

fn http1_error(reason: String) -> H2Error {
    LocalError::Http1(reason).into()
}
