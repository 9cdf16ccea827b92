//! The request loop of the signer daemon.
//!
//! Clients connect over TCP and send one JSON request per line. Each
//! request is answered with one JSON response line on the same
//! connection. Requests are processed on the blocking thread pool, since
//! both PKCS#11 calls and keystore access block. A line longer than
//! `MAX_REQUEST_LINE` is answered with an error and ends the connection.

use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::oneshot;
use tokio::task::spawn_blocking;

use crate::commons::error::Error;
use crate::commons::util::file::FileLock;
use crate::commons::SignerEmptyResult;
use crate::constants::{
    MAX_REQUEST_LINE, TOKENSIGNER_APP, TOKENSIGNER_VERSION
};
use crate::signer::dispatch::{Response, SignerService};
use crate::signer::manager::TokenManager;

use super::config::Config;


//------------ Daemon --------------------------------------------------------

/// Runs the signer until it is interrupted.
///
/// The address the loop is listening on is sent through
/// `signal_running` once requests are accepted.
pub async fn start_signer_daemon(
    config: Arc<Config>,
    signal_running: Option<oneshot::Sender<SocketAddr>>,
) -> SignerEmptyResult {
    let mut lock = FileLock::create(config.lock_file())?;
    let _guard = lock.try_write()?;

    let manager = {
        let config = config.clone();
        blocking(move || {
            let manager = TokenManager::build(&config)?;
            manager.refresh();
            Ok(manager)
        }).await?
    };
    let service = SignerService::new(Arc::new(manager));

    let listener = TcpListener::bind(config.listen).await.map_err(|err| {
        Error::io(format!("cannot bind to {}", config.listen), err)
    })?;
    let addr = listener.local_addr()?;
    info!(
        "{TOKENSIGNER_APP} {TOKENSIGNER_VERSION} listening on {addr}"
    );
    if let Some(tx) = signal_running {
        let _ = tx.send(addr);
    }

    select!(
        _ = serve(listener, service.clone()) => {
            error!("request loop stopped unexpectedly");
        }
        _ = refresh_periodically(service, config.clone()) => {
            error!("token refresh stopped unexpectedly");
        }
        res = tokio::signal::ctrl_c() => {
            if let Err(err) = res {
                error!("cannot listen for shutdown signal: {err}");
            }
            info!("Shutting down {TOKENSIGNER_APP}");
            return Ok(())
        }
    );
    Err(Error::other("stopping signer process"))
}

/// Refreshes all tokens at the configured interval.
async fn refresh_periodically(service: SignerService, config: Arc<Config>) {
    let mut interval = tokio::time::interval(config.refresh_interval());
    // The first tick completes at once and the daemon refreshed already.
    interval.tick().await;
    loop {
        interval.tick().await;
        let service = service.clone();
        let res = blocking(move || {
            service.manager().refresh();
            Ok(())
        }).await;
        if let Err(err) = res {
            warn!("Token refresh failed: {err}");
        }
    }
}


//------------ Request Loop --------------------------------------------------

/// Accepts connections until accepting fails.
pub async fn serve(listener: TcpListener, service: SignerService) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                error!("Fatal error in request loop: {err}");
                return
            }
        };
        debug!("Accepted connection from {peer}");
        let service = service.clone();
        tokio::spawn(async move {
            if let Err(err) = connection(stream, service).await {
                debug!("Connection from {peer} closed: {err}");
            }
        });
    }
}

/// Answers the requests of a single connection.
async fn connection(
    stream: TcpStream, service: SignerService
) -> Result<(), std::io::Error> {
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let limit = (MAX_REQUEST_LINE + 1) as u64;
        let mut bounded = (&mut reader).take(limit);
        if bounded.read_until(b'\n', &mut buf).await? == 0 {
            return Ok(())
        }
        if buf.last() == Some(&b'\n') {
            buf.pop();
        }
        else if buf.len() > MAX_REQUEST_LINE {
            warn!("Dropping connection after overlong request line");
            let err = Error::other(format!(
                "request exceeds {MAX_REQUEST_LINE} bytes"
            ));
            return respond(&mut write, &error_response(err)).await
        }

        let line = match String::from_utf8(std::mem::take(&mut buf)) {
            Ok(line) => line,
            Err(_) => {
                let err = Error::other("request is not valid UTF-8");
                respond(&mut write, &error_response(err)).await?;
                continue
            }
        };
        if line.trim().is_empty() {
            continue
        }
        let service = service.clone();
        let response = spawn_blocking(move || {
            service.handle_json(&line)
        }).await.unwrap_or_else(|err| {
            error_response(Error::other(format!("request failed: {err}")))
        });
        respond(&mut write, &response).await?;
    }
}

fn error_response(err: Error) -> Response {
    Response::Error(err.to_error_response())
}

/// Writes a response as a single line.
async fn respond(
    write: &mut OwnedWriteHalf, response: &Response
) -> Result<(), std::io::Error> {
    let mut json = serde_json::to_vec(response)?;
    json.push(b'\n');
    write.write_all(&json).await
}

/// Runs a blocking operation on the blocking thread pool.
async fn blocking<T, F>(op: F) -> Result<T, Error>
where
    F: FnOnce() -> Result<T, Error> + Send + 'static,
    T: Send + 'static,
{
    spawn_blocking(op).await.map_err(|err| {
        Error::other(format!("blocking task failed: {err}"))
    })?
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commons::test::{ocsp_cache, TestCa};
    use crate::constants::SOFT_TOKEN_ID;
    use crate::signer::dispatch::Payload;

    async fn request(
        lines: &mut tokio::io::Lines<BufReader<tokio::net::tcp::OwnedReadHalf>>,
        write: &mut tokio::net::tcp::OwnedWriteHalf,
        req: &str,
    ) -> Response {
        write.write_all(req.as_bytes()).await.unwrap();
        write.write_all(b"\n").await.unwrap();
        let line = lines.next_line().await.unwrap().unwrap();
        serde_json::from_str(&line).unwrap()
    }

    #[tokio::test]
    async fn answers_one_line_per_request() {
        let dir = tempfile::tempdir().unwrap();
        let ca = TestCa::new("CN=Test CA");
        let manager = TokenManager::with_collaborators(
            &Config::test(dir.path()), ca.global_conf(), ocsp_cache()
        ).unwrap();
        let service = SignerService::new(Arc::new(manager));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, service));

        let stream = TcpStream::connect(addr).await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();

        match request(&mut lines, &mut write, r#"{"type":"list_tokens"}"#)
            .await
        {
            Response::Ok(Payload::Tokens(tokens)) => {
                assert_eq!(tokens.len(), 1);
                assert_eq!(tokens[0].id, SOFT_TOKEN_ID);
            }
            other => panic!("unexpected {other:?}"),
        }

        let res = request(
            &mut lines, &mut write,
            r#"{"type":"get_token_info","token_id":"missing"}"#
        ).await;
        assert!(matches!(res, Response::Error(_)));

        let res = request(&mut lines, &mut write, "not json").await;
        assert!(matches!(res, Response::Error(_)));
    }

    #[tokio::test]
    async fn overlong_request_line_ends_connection() {
        let dir = tempfile::tempdir().unwrap();
        let ca = TestCa::new("CN=Test CA");
        let manager = TokenManager::with_collaborators(
            &Config::test(dir.path()), ca.global_conf(), ocsp_cache()
        ).unwrap();
        let service = SignerService::new(Arc::new(manager));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, service));

        let stream = TcpStream::connect(addr).await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();

        // A short line still gets through before the long one.
        let res = request(&mut lines, &mut write, r#"{"type":"list_tokens"}"#)
            .await;
        assert!(matches!(res, Response::Ok(_)));

        write.write_all(&vec![b'a'; MAX_REQUEST_LINE + 1]).await.unwrap();
        let line = lines.next_line().await.unwrap().unwrap();
        match serde_json::from_str::<Response>(&line).unwrap() {
            Response::Error(err) => assert!(err.msg.contains("exceeds")),
            other => panic!("unexpected {other:?}"),
        }
        assert!(lines.next_line().await.unwrap().is_none());
    }
}
