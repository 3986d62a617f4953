use std::{net::SocketAddr, time::Duration};

use base64::{Engine, engine::general_purpose::STANDARD};
use n0_error::{Result, StackResultExt, StdResultExt, anyerr};
use n0_future::task::AbortOnDropHandle;
use rand::RngCore;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use tokio_util::{sync::CancellationToken, time::FutureExt};
use tracing::debug;
use tracing_test::traced_test;

use crate::{Config, Relay, info::subscription_uri};

const TIMEOUT: Duration = Duration::from_secs(5);
const SWITCHING: &[u8] = b"HTTP/1.1 101 Switching Protocols\r\n\r\n";
const ID: &str = "0dff8b4c-f778-4648-8817-3a434f7fa443";

// -- Test helpers --

struct TestRelay {
    addr: SocketAddr,
    relay: Relay,
    shutdown: CancellationToken,
    task: AbortOnDropHandle<Result<()>>,
}

/// Spawns a relay on a free loopback port that splices to `backend_port`.
async fn spawn_relay(backend_port: u16) -> Result<TestRelay> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let relay = Relay::new(Config {
        external_port: addr.port(),
        internal_port: backend_port,
        ..Default::default()
    });
    let shutdown = CancellationToken::new();
    let task = AbortOnDropHandle::new(tokio::spawn({
        let relay = relay.clone();
        let shutdown = shutdown.clone();
        async move { relay.serve(listener, shutdown).await }
    }));
    debug!(%addr, backend_port, "spawned relay");
    Ok(TestRelay {
        addr,
        relay,
        shutdown,
        task,
    })
}

/// A port nothing listens on.
async fn closed_port() -> Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    Ok(listener.local_addr()?.port())
}

/// Spawns a fake WebSocket backend.
///
/// For each connection it reports the header section it received, answers
/// `101` and then echoes everything after the headers, including bytes that
/// arrived in the same segment. With `close_after_handshake` it closes right
/// after the `101` instead.
async fn spawn_ws_backend(
    close_after_handshake: bool,
) -> Result<(SocketAddr, mpsc::Receiver<Vec<u8>>, AbortOnDropHandle<()>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let (headers_tx, headers_rx) = mpsc::channel(8);
    let task = tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let headers_tx = headers_tx.clone();
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 4096];
                let header_end = loop {
                    let Ok(n) = stream.read(&mut chunk).await else {
                        return;
                    };
                    if n == 0 {
                        return;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                    if let Some(pos) = find(&buf, b"\r\n\r\n") {
                        break pos + 4;
                    }
                };
                headers_tx.send(buf[..header_end].to_vec()).await.ok();
                if stream.write_all(SWITCHING).await.is_err() || close_after_handshake {
                    return;
                }
                if stream.write_all(&buf[header_end..]).await.is_err() {
                    return;
                }
                let (mut read, mut write) = stream.split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
            });
        }
    });
    Ok((addr, headers_rx, AbortOnDropHandle::new(task)))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn upgrade_request(path: &str) -> String {
    format!(
        "GET {path} HTTP/1.1\r\nHost: relay.example\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Version: 13\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n"
    )
}

/// Reads a response header section byte by byte.
async fn read_head(stream: &mut (impl AsyncRead + Unpin)) -> Result<Vec<u8>> {
    let mut head = Vec::new();
    while !head.ends_with(b"\r\n\r\n") {
        head.push(stream.read_u8().await?);
    }
    Ok(head)
}

/// Reads until the peer closes; a reset counts as a close.
async fn read_until_closed(stream: &mut (impl AsyncRead + Unpin)) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    match stream.read_to_end(&mut buf).timeout(TIMEOUT).await.anyerr()? {
        Ok(_) => Ok(buf),
        Err(err) if err.kind() == std::io::ErrorKind::ConnectionReset => Ok(buf),
        Err(err) => Err(err.into()),
    }
}

struct Reply {
    status: u16,
    content_type: Option<String>,
    body: Vec<u8>,
}

/// Parses one response with a `Content-Length` body, returning the rest.
fn parse_reply(buf: &[u8]) -> Result<(Reply, &[u8])> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut res = httparse::Response::new(&mut headers);
    let httparse::Status::Complete(header_len) = res.parse(buf).anyerr()? else {
        return Err(anyerr!("incomplete response"));
    };
    let header = |name: &str| {
        res.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| String::from_utf8_lossy(h.value).into_owned())
    };
    let len = header("content-length")
        .context("missing content-length")?
        .parse::<usize>()
        .anyerr()?;
    let body_end = header_len + len;
    if buf.len() < body_end {
        return Err(anyerr!("truncated body"));
    }
    let reply = Reply {
        status: res.code.context("missing status")?,
        content_type: header("content-type"),
        body: buf[header_len..body_end].to_vec(),
    };
    Ok((reply, &buf[body_end..]))
}

/// Sends `raw` on a fresh connection and reads until the relay closes it.
async fn exchange(addr: SocketAddr, raw: &str) -> Result<Vec<u8>> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(raw.as_bytes()).await?;
    read_until_closed(&mut stream).await
}

// -- Info endpoints --

#[tokio::test]
#[traced_test]
async fn landing_page_shows_uri() -> Result {
    let relay = spawn_relay(closed_port().await?).await?;
    let buf = exchange(
        relay.addr,
        "GET / HTTP/1.1\r\nHost: example.test\r\nConnection: close\r\n\r\n",
    )
    .await?;
    let (reply, rest) = parse_reply(&buf)?;
    assert!(rest.is_empty());
    assert_eq!(reply.status, 200);
    assert!(reply.content_type.context("content-type")?.starts_with("text/html"));
    let body = String::from_utf8(reply.body).anyerr()?;
    assert!(body.contains(&subscription_uri(ID, "example.test", "/vless")));
    assert!(body.contains("example.test:443"));
    assert!(body.contains("#SAP-Direct-example"));
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn subscription_decodes_to_landing_uri() -> Result {
    let relay = spawn_relay(closed_port().await?).await?;
    let landing = exchange(
        relay.addr,
        "GET / HTTP/1.1\r\nHost: h.example\r\nConnection: close\r\n\r\n",
    )
    .await?;
    let sub = exchange(
        relay.addr,
        "GET /sub HTTP/1.1\r\nHost: h.example\r\nConnection: close\r\n\r\n",
    )
    .await?;
    let (landing, _) = parse_reply(&landing)?;
    let (sub, _) = parse_reply(&sub)?;
    assert_eq!(sub.status, 200);
    assert!(sub.content_type.context("content-type")?.starts_with("text/plain"));
    let uri = String::from_utf8(STANDARD.decode(&sub.body).anyerr()?).anyerr()?;
    assert!(uri.starts_with(&format!("vless://{ID}@h.example:443?")));
    assert!(uri.ends_with("#SAP-Direct-h"));
    let landing = String::from_utf8(landing.body).anyerr()?;
    assert!(landing.contains(&uri));
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn health_answers_ok() -> Result {
    let relay = spawn_relay(closed_port().await?).await?;
    for raw in [
        "GET /health HTTP/1.1\r\nConnection: close\r\n\r\n",
        "GET /vless HTTP/1.1\r\nConnection: close\r\n\r\n",
        "GET /sub/ HTTP/1.0\r\n\r\n",
    ] {
        let buf = exchange(relay.addr, raw).await?;
        let (reply, _) = parse_reply(&buf)?;
        assert_eq!(reply.status, 200);
        assert_eq!(reply.body, b"OK");
    }
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn head_omits_body() -> Result {
    let relay = spawn_relay(closed_port().await?).await?;
    let buf = exchange(
        relay.addr,
        "HEAD /sub HTTP/1.1\r\nHost: h.example\r\nConnection: close\r\n\r\n",
    )
    .await?;
    let text = String::from_utf8(buf).anyerr()?.to_ascii_lowercase();
    assert!(text.starts_with("http/1.1 200"));
    assert!(text.contains("content-length:"));
    assert!(text.ends_with("\r\n\r\n"));
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn keep_alive_serves_pipelined_requests() -> Result {
    let relay = spawn_relay(closed_port().await?).await?;
    let buf = exchange(
        relay.addr,
        "POST /x HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello\
         GET /sub HTTP/1.1\r\nHost: h.example\r\n\r\n\
         GET /health HTTP/1.1\r\nConnection: close\r\n\r\n",
    )
    .await?;
    let (first, rest) = parse_reply(&buf)?;
    let (second, rest) = parse_reply(rest)?;
    let (third, rest) = parse_reply(rest)?;
    assert!(rest.is_empty());
    assert_eq!(first.body, b"OK");
    assert_eq!(second.status, 200);
    assert!(!second.body.is_empty());
    assert_eq!(third.body, b"OK");
    assert_eq!(relay.relay.metrics().snapshot().info_requests, 3);
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn http10_keep_alive_is_acknowledged() -> Result {
    let relay = spawn_relay(closed_port().await?).await?;
    let mut stream = TcpStream::connect(relay.addr).await?;
    stream
        .write_all(b"GET /health HTTP/1.0\r\nConnection: keep-alive\r\n\r\n")
        .await?;
    let head = read_head(&mut stream).timeout(TIMEOUT).await.anyerr()??;
    let head = String::from_utf8(head).anyerr()?.to_ascii_lowercase();
    assert!(head.contains("connection: keep-alive\r\n"));
    let mut body = [0u8; 2];
    stream.read_exact(&mut body).timeout(TIMEOUT).await.anyerr()??;
    assert_eq!(&body, b"OK");

    // Without the token the second response ends the connection.
    stream.write_all(b"GET /health HTTP/1.0\r\n\r\n").await?;
    let buf = read_until_closed(&mut stream).await?;
    let (reply, rest) = parse_reply(&buf)?;
    assert!(rest.is_empty());
    assert_eq!(reply.body, b"OK");
    assert!(String::from_utf8_lossy(&buf).to_ascii_lowercase().contains("connection: close\r\n"));
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn truncated_body_is_not_counted_as_rejected() -> Result {
    let relay = spawn_relay(closed_port().await?).await?;
    let mut stream = TcpStream::connect(relay.addr).await?;
    stream
        .write_all(b"POST /x HTTP/1.1\r\nContent-Length: 100\r\n\r\nabc")
        .await?;
    stream.shutdown().await?;
    let buf = read_until_closed(&mut stream).await?;
    assert!(buf.is_empty());
    let stats = relay.relay.metrics().snapshot();
    assert_eq!(stats.rejected_requests, 0);
    assert_eq!(stats.info_requests, 0);
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn oversized_header_closes_without_response() -> Result {
    let relay = spawn_relay(closed_port().await?).await?;
    let mut stream = TcpStream::connect(relay.addr).await?;
    let raw = format!("GET / HTTP/1.1\r\nX-Pad: {}", "a".repeat(9000));
    // The relay may reset before the whole request is written.
    let _ = stream.write_all(raw.as_bytes()).await;
    let buf = read_until_closed(&mut stream).await?;
    assert!(buf.is_empty());
    Ok(())
}

// -- Splicing --

#[tokio::test]
#[traced_test]
async fn websocket_echo_round_trips() -> Result {
    let (backend_addr, mut headers, _backend) = spawn_ws_backend(false).await?;
    let relay = spawn_relay(backend_addr.port()).await?;

    let request = upgrade_request("/vless");
    let mut stream = TcpStream::connect(relay.addr).await?;
    stream.write_all(request.as_bytes()).await?;
    let (mut recv, mut send) = stream.into_split();
    let head = read_head(&mut recv).timeout(TIMEOUT).await.anyerr()??;
    assert_eq!(head, SWITCHING);

    let forwarded = headers.recv().timeout(TIMEOUT).await.anyerr()?.context("no headers")?;
    assert_eq!(forwarded, request.as_bytes());

    let mut blob = vec![0u8; 1 << 20];
    rand::rng().fill_bytes(&mut blob);
    let writer = tokio::spawn({
        let blob = blob.clone();
        async move { send.write_all(&blob).await.map(|()| send) }
    });
    let mut echoed = vec![0u8; blob.len()];
    recv.read_exact(&mut echoed).timeout(TIMEOUT).await.anyerr()??;
    assert!(echoed == blob, "echo differs from what was sent");

    let mut send = writer.await.anyerr()??;
    send.shutdown().await?;
    let rest = read_until_closed(&mut recv).await?;
    assert!(rest.is_empty());

    let stats = relay.relay.metrics().snapshot();
    assert_eq!(stats.splices, 1);
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn bytes_after_headers_reach_backend_first() -> Result {
    let (backend_addr, mut headers, _backend) = spawn_ws_backend(false).await?;
    let relay = spawn_relay(backend_addr.port()).await?;

    let request = upgrade_request("/vless");
    let mut stream = TcpStream::connect(relay.addr).await?;
    stream
        .write_all(format!("{request}hello-after-headers").as_bytes())
        .await?;

    let head = read_head(&mut stream).timeout(TIMEOUT).await.anyerr()??;
    assert_eq!(head, SWITCHING);
    let mut tail = [0u8; 19];
    stream.read_exact(&mut tail).timeout(TIMEOUT).await.anyerr()??;
    assert_eq!(&tail, b"hello-after-headers");

    let forwarded = headers.recv().timeout(TIMEOUT).await.anyerr()?.context("no headers")?;
    assert_eq!(forwarded, request.as_bytes());
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn backend_close_closes_client() -> Result {
    let (backend_addr, _headers, _backend) = spawn_ws_backend(true).await?;
    let relay = spawn_relay(backend_addr.port()).await?;

    let mut stream = TcpStream::connect(relay.addr).await?;
    stream
        .write_all(upgrade_request("/vless").as_bytes())
        .await?;
    let buf = read_until_closed(&mut stream).await?;
    assert_eq!(buf, SWITCHING);
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn upgrade_on_other_path_is_closed() -> Result {
    let (backend_addr, mut headers, _backend) = spawn_ws_backend(false).await?;
    let relay = spawn_relay(backend_addr.port()).await?;

    for path in ["/", "/sub", "/vless/", "/vless?ed=2048"] {
        let buf = exchange(relay.addr, &upgrade_request(path)).await?;
        assert!(buf.is_empty(), "{path} got a response");
    }
    assert!(headers.try_recv().is_err());
    let stats = relay.relay.metrics().snapshot();
    assert_eq!(stats.splices, 0);
    assert_eq!(stats.rejected_requests, 4);
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn upgrade_header_without_connection_token_is_served() -> Result {
    let (backend_addr, mut headers, _backend) = spawn_ws_backend(false).await?;
    let relay = spawn_relay(backend_addr.port()).await?;

    let buf = exchange(
        relay.addr,
        "GET / HTTP/1.1\r\nHost: example.test\r\nUpgrade: h2c\r\nConnection: close\r\n\r\n",
    )
    .await?;
    let (reply, _) = parse_reply(&buf)?;
    assert_eq!(reply.status, 200);
    let body = String::from_utf8(reply.body).anyerr()?;
    assert!(body.contains(&subscription_uri(ID, "example.test", "/vless")));

    let buf = exchange(
        relay.addr,
        "GET /anything HTTP/1.1\r\nUpgrade: websocket\r\nConnection: close\r\n\r\n",
    )
    .await?;
    let (reply, _) = parse_reply(&buf)?;
    assert_eq!(reply.status, 200);
    assert_eq!(reply.body, b"OK");

    assert!(headers.try_recv().is_err());
    assert_eq!(relay.relay.metrics().snapshot().rejected_requests, 0);
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn dial_failure_closes_client() -> Result {
    let relay = spawn_relay(closed_port().await?).await?;
    let buf = exchange(relay.addr, &upgrade_request("/vless")).await?;
    assert!(buf.is_empty());

    // The counter is bumped after the client socket is dropped.
    let mut failed = 0;
    for _ in 0..50 {
        failed = relay.relay.metrics().snapshot().failed_dials;
        if failed == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(failed, 1);
    Ok(())
}

// -- Lifecycle --

#[tokio::test]
#[traced_test]
async fn shutdown_stops_accepting_and_aborts_idle_connections() -> Result {
    let TestRelay {
        addr,
        shutdown,
        task,
        ..
    } = spawn_relay(closed_port().await?).await?;
    let mut idle = TcpStream::connect(addr).await?;
    // Make sure the idle connection was accepted before shutting down.
    idle.write_all(b"GET /health HTTP/1.1\r\n\r\n").await?;
    let head = read_head(&mut idle).timeout(TIMEOUT).await.anyerr()??;
    assert!(head.starts_with(b"HTTP/1.1 200"));

    shutdown.cancel();
    task.timeout(TIMEOUT).await.anyerr()?.anyerr()??;

    let rest = read_until_closed(&mut idle).await?;
    assert_eq!(rest, b"OK");
    assert!(TcpStream::connect(addr).await.is_err());
    Ok(())
}
