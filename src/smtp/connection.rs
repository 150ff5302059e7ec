use std::net::SocketAddr;
use std::time::Duration;

use smtp_proto::Request;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::time::timeout;
use tracing::{debug, info, trace};

use crate::smtp::session::{DataReply, SessionDeps, SessionReply, SmtpSession};

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("failed to write tcp stream: {0}")]
    Write(std::io::Error),
    #[error("failed to read tcp stream: {0}")]
    Read(std::io::Error),
    #[error("connection dropped unexpectedly")]
    Dropped,
    #[error("connection timed out waiting on the peer")]
    Timeout,
}

const BUFFER_SIZE: usize = 1024;
const CODE_READY: u16 = 220;

pub async fn handle(
    stream: &mut (impl AsyncReadExt + AsyncWriteExt + Unpin),
    server_name: &str,
    peer_addr: SocketAddr,
    deps: SessionDeps,
) -> Result<(), ConnectionError> {
    let readtimeout = deps.config.readtimeout;
    let writetimeout = deps.config.writetimeout;

    let (source, mut sink) = tokio::io::split(stream);

    let mut buffer = Vec::with_capacity(BUFFER_SIZE);
    let mut session = SmtpSession::new(deps, peer_addr.ip());

    let mut reader = BufReader::new(source);

    trace!(session_id = session.session_id(), %peer_addr, "handling connection");

    write_reply(CODE_READY, server_name, &mut sink, writetimeout).await?;

    'session: loop {
        read_line(&mut reader, &mut buffer, readtimeout).await?;

        let request = Request::parse(&mut buffer.iter());

        trace!("received request: {:?}", request);

        match session.handle(request).await {
            SessionReply::ReplyAndContinue(code, message) => {
                write_reply(code, &message, &mut sink, writetimeout).await?;
                continue;
            }
            SessionReply::ReplyAndStop(code, message) => {
                write_reply(code, &message, &mut sink, writetimeout).await?;
                break;
            }
            SessionReply::RawReply(buf) => {
                timeout(writetimeout, sink.write(&buf))
                    .await
                    .map_err(|_| ConnectionError::Timeout)?
                    .map_err(ConnectionError::Write)?;
                continue;
            }
            SessionReply::IngestData(code, message) => {
                write_reply(code, &message, &mut sink, writetimeout).await?;

                'data: loop {
                    read_buf(&mut reader, &mut buffer, readtimeout).await?;

                    match session.handle_data(&buffer).await {
                        DataReply::ContinueIngest => continue 'data,
                        DataReply::ReplyAndContinue(code, message) => {
                            write_reply(code, &message, &mut sink, writetimeout).await?;
                            continue 'session;
                        }
                    }
                }
            }
        }
    }

    info!("connection handled");

    Ok(())
}

async fn read_buf(
    reader: impl AsyncBufReadExt + Unpin,
    buffer: &mut Vec<u8>,
    readtimeout: Duration,
) -> Result<usize, ConnectionError> {
    buffer.clear();

    timeout(readtimeout, reader.take(BUFFER_SIZE as u64).read_buf(buffer))
        .await
        .map_err(|_| ConnectionError::Timeout)?
        .map_err(ConnectionError::Read)
        .and_then(|size| {
            if size > 0 {
                Ok(size)
            } else {
                Err(ConnectionError::Dropped)
            }
        })
}

async fn read_line(
    reader: impl AsyncBufReadExt + Unpin,
    buffer: &mut Vec<u8>,
    readtimeout: Duration,
) -> Result<usize, ConnectionError> {
    buffer.clear();

    timeout(readtimeout, reader.take(BUFFER_SIZE as u64).read_until(b'\n', buffer))
        .await
        .map_err(|_| ConnectionError::Timeout)?
        .map_err(ConnectionError::Read)
        .and_then(|size| {
            if size > 0 {
                Ok(size)
            } else {
                Err(ConnectionError::Dropped)
            }
        })
}

async fn write_reply(
    code: u16,
    message: &str,
    mut sink: impl AsyncWriteExt + Unpin,
    writetimeout: Duration,
) -> Result<(), ConnectionError> {
    let n = timeout(
        writetimeout,
        sink.write(format!("{code} {message}\r\n").as_bytes()),
    )
    .await
    .map_err(|_| ConnectionError::Timeout)?
    .map_err(ConnectionError::Write)?;

    if n < 256 {
        debug!("sent: {} {}", code, message);
    } else {
        trace!("sent {} bytes", n);
    }

    Ok(())
}
