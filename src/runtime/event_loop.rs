//! io_uring proactor event loop: one per worker thread. Submits
//! accept/recv/send operations and dispatches completions back into the
//! connection state machine.

use crate::http::{self, ParseOutcome};
use crate::router::{ParamArray, Router};
use crate::runtime::connection::{ConnState, Connection, ConnectionRegistry};
use crate::runtime::token::{OpType, TokenAllocator};
use crate::script::{InvokeOutcome, ScriptEngine};
use io_uring::{opcode, types, IoUring};
use mlua::RegistryKey;
use std::io;
use std::os::unix::io::RawFd;
use tracing::{debug, trace, warn};

pub struct EventLoopConfig {
    pub ring_size: u32,
    pub read_buffer_size: usize,
    pub max_connections: usize,
    pub batch_size: usize,
}

/// Runs one worker's event loop until the process exits. `listener_fd`
/// must already be bound, BPF-attached (if applicable), and listening.
pub fn run(
    worker_id: usize,
    listener_fd: RawFd,
    cfg: &EventLoopConfig,
    router: &Router<RegistryKey>,
    engine: &ScriptEngine,
) -> io::Result<()> {
    let mut ring: IoUring = IoUring::new(cfg.ring_size)?;
    let mut connections = ConnectionRegistry::new(cfg.max_connections);
    let mut tokens = TokenAllocator::new(cfg.max_connections * 2);

    submit_accept(&mut ring, &mut tokens, listener_fd)?;

    debug!(worker = worker_id, "event loop started");

    loop {
        ring.submit_and_wait(1)?;

        let mut processed = 0;
        while processed < cfg.batch_size {
            let cqe = match ring.completion().next() {
                Some(cqe) => cqe,
                None => break,
            };
            processed += 1;

            let token = cqe.user_data();
            let result = cqe.result();

            let op = match tokens.free(token) {
                Some(op) => op,
                None => {
                    warn!(worker = worker_id, token, "completion for unknown token");
                    continue;
                }
            };

            match op {
                OpType::Accept => {
                    handle_accept(
                        result,
                        &mut ring,
                        &mut tokens,
                        &mut connections,
                        listener_fd,
                        cfg,
                        worker_id,
                    )?;
                }
                OpType::Read { conn_id } => {
                    handle_read(
                        result, conn_id, &mut ring, &mut tokens, &mut connections, router, engine,
                    )?;
                }
                OpType::Write { conn_id } => {
                    handle_write(result, conn_id, &mut ring, &mut tokens, &mut connections)?;
                }
            }
        }
    }
}

fn handle_accept(
    result: i32,
    ring: &mut IoUring,
    tokens: &mut TokenAllocator,
    connections: &mut ConnectionRegistry,
    listener_fd: RawFd,
    cfg: &EventLoopConfig,
    worker_id: usize,
) -> io::Result<()> {
    submit_accept(ring, tokens, listener_fd)?;

    if result < 0 {
        let err = io::Error::from_raw_os_error(-result);
        warn!(worker = worker_id, error = %err, "accept failed");
        return Ok(());
    }

    let client_fd = result;
    set_tcp_nodelay(client_fd);

    let conn = Connection::new(client_fd, cfg.read_buffer_size);
    let conn_id = match connections.insert(conn) {
        Some(id) => id,
        None => {
            warn!(worker = worker_id, "connection limit reached, closing");
            unsafe { libc::close(client_fd) };
            return Ok(());
        }
    };

    trace!(worker = worker_id, conn_id, fd = client_fd, "accepted connection");

    submit_read(ring, tokens, connections, conn_id)?;
    Ok(())
}

fn handle_read(
    result: i32,
    conn_id: usize,
    ring: &mut IoUring,
    tokens: &mut TokenAllocator,
    connections: &mut ConnectionRegistry,
    router: &Router<RegistryKey>,
    engine: &ScriptEngine,
) -> io::Result<()> {
    if result <= 0 {
        if result < 0 {
            let err = io::Error::from_raw_os_error(-result);
            debug!(conn_id, error = %err, "recv failed");
        } else {
            trace!(conn_id, "peer closed (EOF)");
        }
        close_connection(connections, conn_id);
        return Ok(());
    }

    let n = result as usize;
    let conn = match connections.get_mut(conn_id) {
        Some(c) => c,
        None => return Ok(()),
    };
    conn.read_buf.commit_write(n);

    match process_buffered_requests(conn, router, engine) {
        RequestOutcome::NeedMoreData => {
            submit_read(ring, tokens, connections, conn_id)?;
        }
        RequestOutcome::RespondThenKeepAlive => {
            let conn = connections.get_mut(conn_id).unwrap();
            let total = conn.write_buf.len();
            conn.start_writing(total);
            submit_write(ring, tokens, connections, conn_id)?;
        }
        RequestOutcome::RespondThenClose => {
            let conn = connections.get_mut(conn_id).unwrap();
            let total = conn.write_buf.len();
            conn.start_writing(total);
            conn.close_after_write = true;
            submit_write(ring, tokens, connections, conn_id)?;
        }
    }

    Ok(())
}

fn handle_write(
    result: i32,
    conn_id: usize,
    ring: &mut IoUring,
    tokens: &mut TokenAllocator,
    connections: &mut ConnectionRegistry,
) -> io::Result<()> {
    if result <= 0 {
        if result < 0 {
            let err = io::Error::from_raw_os_error(-result);
            debug!(conn_id, error = %err, "send failed");
        }
        close_connection(connections, conn_id);
        return Ok(());
    }

    let n = result as usize;
    let conn = match connections.get_mut(conn_id) {
        Some(c) => c,
        None => return Ok(()),
    };

    let should_close = conn.close_after_write;

    if let ConnState::Writing { written, total } = &mut conn.state {
        *written += n;

        if *written >= *total {
            if should_close {
                close_connection(connections, conn_id);
            } else {
                let conn = connections.get_mut(conn_id).unwrap();
                conn.reset_for_next_request();
                submit_read(ring, tokens, connections, conn_id)?;
            }
        } else {
            submit_write(ring, tokens, connections, conn_id)?;
        }
    }

    Ok(())
}

enum RequestOutcome {
    NeedMoreData,
    RespondThenKeepAlive,
    RespondThenClose,
}

/// Parses and serves every complete request currently sitting in the
/// connection's read buffer (handles pipelined requests arriving in one
/// recv), appending each serialized response to `write_buf` in order.
///
/// `response_body`/`response_headers` are the connection's own fields,
/// cleared (capacity retained) before each request rather than allocated
/// fresh, so a steady-state keep-alive connection does no heap allocation
/// here once its capacity covers the handler's usual response.
fn process_buffered_requests(
    conn: &mut Connection,
    router: &Router<RegistryKey>,
    engine: &ScriptEngine,
) -> RequestOutcome {
    let mut processed_any = false;

    loop {
        let Connection {
            read_buf,
            write_buf,
            response_headers,
            response_body,
            ..
        } = &mut *conn;

        match http::parse(read_buf.readable()) {
            ParseOutcome::Complete { request, consumed } => {
                processed_any = true;
                response_headers.clear();
                response_body.clear();
                let mut params = ParamArray::new();

                let method = request.method;
                let path = request.path;
                let handler = router.match_route(method, path, &mut params);

                let (status, close_after) = match handler {
                    Some(handler_ref) => match engine.invoke(
                        handler_ref,
                        method,
                        path,
                        request.body,
                        request.headers(),
                        params,
                        response_body,
                        response_headers,
                    ) {
                        InvokeOutcome::Ok(status) => {
                            http::response::serialize(
                                write_buf,
                                status,
                                &*response_headers,
                                &*response_body,
                            );
                            (status, false)
                        }
                        InvokeOutcome::ScriptError => {
                            http::response::serialize_status_body(write_buf, 500);
                            (500, false)
                        }
                        InvokeOutcome::NotCallable => {
                            http::response::serialize_status_body(write_buf, 500);
                            (500, true)
                        }
                    },
                    None => {
                        http::response::serialize_status_body(write_buf, 404);
                        (404, false)
                    }
                };

                trace!(method, path, status, "request served");

                read_buf.consume(consumed);

                if close_after {
                    return RequestOutcome::RespondThenClose;
                }
            }
            ParseOutcome::Incomplete => {
                if read_buf.is_full() {
                    http::response::serialize_status_body(write_buf, 400);
                    return RequestOutcome::RespondThenClose;
                }
                return if processed_any {
                    RequestOutcome::RespondThenKeepAlive
                } else {
                    RequestOutcome::NeedMoreData
                };
            }
            ParseOutcome::Invalid => {
                http::response::serialize_status_body(write_buf, 400);
                return RequestOutcome::RespondThenClose;
            }
        }
    }
}

fn submit_accept(
    ring: &mut IoUring,
    tokens: &mut TokenAllocator,
    listener_fd: RawFd,
) -> io::Result<()> {
    let token = tokens.alloc(OpType::Accept);
    let accept = opcode::Accept::new(types::Fd(listener_fd), std::ptr::null_mut(), std::ptr::null_mut())
        .build()
        .user_data(token);

    unsafe {
        ring.submission().push(&accept).map_err(|_| {
            tokens.free(token);
            io::Error::new(io::ErrorKind::Other, "submission queue full")
        })?;
    }
    Ok(())
}

fn submit_read(
    ring: &mut IoUring,
    tokens: &mut TokenAllocator,
    connections: &mut ConnectionRegistry,
    conn_id: usize,
) -> io::Result<()> {
    let conn = connections
        .get_mut(conn_id)
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "connection not found"))?;

    let fd = conn.fd;
    let buf = conn.read_buf.writable();
    let buf_ptr = buf.as_mut_ptr();
    let buf_len = buf.len() as u32;

    let token = tokens.alloc(OpType::Read { conn_id });
    let read = opcode::Read::new(types::Fd(fd), buf_ptr, buf_len)
        .build()
        .user_data(token);

    unsafe {
        ring.submission().push(&read).map_err(|_| {
            tokens.free(token);
            io::Error::new(io::ErrorKind::Other, "submission queue full")
        })?;
    }
    Ok(())
}

fn submit_write(
    ring: &mut IoUring,
    tokens: &mut TokenAllocator,
    connections: &mut ConnectionRegistry,
    conn_id: usize,
) -> io::Result<()> {
    let conn = connections
        .get_mut(conn_id)
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "connection not found"))?;

    let fd = conn.fd;
    let written = match conn.state {
        ConnState::Writing { written, .. } => written,
        _ => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "not in writing state",
            ))
        }
    };

    let remaining = &mut conn.write_buf[written..];
    let buf_ptr = remaining.as_mut_ptr();
    let buf_len = remaining.len() as u32;

    let token = tokens.alloc(OpType::Write { conn_id });
    let write = opcode::Write::new(types::Fd(fd), buf_ptr, buf_len)
        .build()
        .user_data(token);

    unsafe {
        ring.submission().push(&write).map_err(|_| {
            tokens.free(token);
            io::Error::new(io::ErrorKind::Other, "submission queue full")
        })?;
    }
    Ok(())
}

fn close_connection(connections: &mut ConnectionRegistry, conn_id: usize) {
    if let Some(conn) = connections.remove(conn_id) {
        unsafe { libc::close(conn.fd) };
        trace!(conn_id, "connection closed");
    }
}

fn set_tcp_nodelay(fd: RawFd) {
    let enable: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            &enable as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(conn: &mut Connection, bytes: &[u8]) {
        let buf = conn.read_buf.writable();
        buf[..bytes.len()].copy_from_slice(bytes);
        conn.read_buf.commit_write(bytes.len());
    }

    #[test]
    fn single_request_produces_exact_response() {
        let (engine, router) = ScriptEngine::load(
            r#"
                keystone.add_route("GET", "/ping", function(ctx)
                    ctx.status = 200
                    ctx.body = "pong"
                end)
            "#,
        )
        .unwrap();

        let mut conn = Connection::new(1, 256);
        feed(&mut conn, b"GET /ping HTTP/1.1\r\nHost: x\r\n\r\n");

        let outcome = process_buffered_requests(&mut conn, &router, &engine);

        assert!(matches!(outcome, RequestOutcome::RespondThenKeepAlive));
        assert_eq!(
            conn.write_buf,
            b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\npong"
        );
        assert!(conn.read_buf.readable().is_empty());
    }

    #[test]
    fn unmatched_route_returns_404_and_keeps_connection_alive() {
        let (engine, router) = ScriptEngine::load("").unwrap();

        let mut conn = Connection::new(1, 256);
        feed(&mut conn, b"GET /missing HTTP/1.1\r\nHost: x\r\n\r\n");

        let outcome = process_buffered_requests(&mut conn, &router, &engine);

        assert!(matches!(outcome, RequestOutcome::RespondThenKeepAlive));
        assert_eq!(
            conn.write_buf,
            b"HTTP/1.1 404 Not Found\r\nContent-Length: 9\r\n\r\nNot Found"
        );
    }

    #[test]
    fn two_pipelined_requests_produce_independent_responses_without_bleeding() {
        let (engine, router) = ScriptEngine::load(
            r#"
                local n = 0
                keystone.add_route("GET", "/ping", function(ctx)
                    n = n + 1
                    ctx.status = 200
                    ctx.body = "pong"
                end)
            "#,
        )
        .unwrap();

        let mut conn = Connection::new(1, 512);
        let one_request = b"GET /ping HTTP/1.1\r\nHost: x\r\n\r\n";
        feed(&mut conn, &[one_request.as_slice(), one_request.as_slice()].concat());

        let outcome = process_buffered_requests(&mut conn, &router, &engine);

        assert!(matches!(outcome, RequestOutcome::RespondThenKeepAlive));
        let single_response = b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\npong".to_vec();
        let expected = [single_response.clone(), single_response].concat();
        assert_eq!(conn.write_buf, expected);
        assert!(conn.read_buf.readable().is_empty());
    }

    #[test]
    fn malformed_request_returns_400_and_closes() {
        let (engine, router) = ScriptEngine::load("").unwrap();

        let mut conn = Connection::new(1, 256);
        feed(&mut conn, b"NOT A REQUEST\r\n\r\n");

        let outcome = process_buffered_requests(&mut conn, &router, &engine);

        assert!(matches!(outcome, RequestOutcome::RespondThenClose));
        assert_eq!(
            conn.write_buf,
            b"HTTP/1.1 400 Bad Request\r\nContent-Length: 11\r\n\r\nBad Request"
        );
    }

    #[test]
    fn raising_handler_returns_500_and_keeps_connection_alive() {
        let (engine, router) = ScriptEngine::load(
            r#"
                keystone.add_route("GET", "/boom", function(ctx)
                    error("boom")
                end)
            "#,
        )
        .unwrap();

        let mut conn = Connection::new(1, 256);
        feed(&mut conn, b"GET /boom HTTP/1.1\r\nHost: x\r\n\r\n");

        let outcome = process_buffered_requests(&mut conn, &router, &engine);

        assert!(matches!(outcome, RequestOutcome::RespondThenKeepAlive));
        assert_eq!(
            conn.write_buf,
            b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 21\r\n\r\nInternal Server Error"
        );
    }
}
