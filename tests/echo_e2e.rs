//! End-to-end scenarios: echo round-trips, dispatch errors, partial-frame
//! reassembly, out-of-order completions, and peer shutdown.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use girder::codec::{decode_all, encode_into};
use girder::{
    error_code, Config, EventLoop, MethodError, ReplyClosure, RingBuffer, RpcController,
    RpcMessage, RpcService, ShutdownHandle, TcpClient, TcpServer,
};

struct EchoService;

impl RpcService for EchoService {
    fn full_name(&self) -> &str {
        "Echo"
    }

    fn call_method(
        &self,
        method: &str,
        _controller: RpcController,
        request: &[u8],
        done: ReplyClosure,
    ) -> Result<(), MethodError> {
        match method {
            "say" => {
                done(Ok(request.to_vec()));
                Ok(())
            }
            _ => Err(MethodError::UnknownMethod),
        }
    }
}

/// `slow` defers its reply closure to another thread for 50 ms; `fast`
/// completes inline.
struct SleepyService;

impl RpcService for SleepyService {
    fn full_name(&self) -> &str {
        "Sleepy"
    }

    fn call_method(
        &self,
        method: &str,
        _controller: RpcController,
        request: &[u8],
        done: ReplyClosure,
    ) -> Result<(), MethodError> {
        match method {
            "slow" => {
                let payload = request.to_vec();
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(50));
                    done(Ok(payload));
                });
                Ok(())
            }
            "fast" => {
                done(Ok(request.to_vec()));
                Ok(())
            }
            _ => Err(MethodError::UnknownMethod),
        }
    }
}

fn start_server(io_threads: usize) -> (SocketAddr, ShutdownHandle, thread::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        let config = Config {
            io_threads,
            ..Config::default()
        };
        let server = TcpServer::new("127.0.0.1:0", &config).expect("server setup");
        server.register_service(Arc::new(EchoService));
        server.register_service(Arc::new(SleepyService));
        tx.send((server.local_addr(), server.shutdown_handle()))
            .expect("report server address");
        server.start().expect("server run");
    });
    let (addr, shutdown) = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("server did not come up");
    assert!(
        wait_for_server(addr, Duration::from_secs(5)),
        "server not reachable"
    );
    (addr, shutdown, handle)
}

fn wait_for_server(addr: SocketAddr, timeout: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if TcpStream::connect_timeout(&addr, Duration::from_millis(50)).is_ok() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    false
}

fn frame_bytes(msg: &RpcMessage) -> Vec<u8> {
    let mut buf = RingBuffer::new(256);
    encode_into(msg, &mut buf);
    buf.read_up_to(usize::MAX)
}

/// Read from `stream` until one complete frame decodes.
fn read_one_reply(stream: &mut TcpStream, timeout: Duration) -> RpcMessage {
    stream
        .set_read_timeout(Some(Duration::from_millis(100)))
        .expect("set read timeout");
    let mut buf = RingBuffer::new(256);
    let mut scratch = [0u8; 4096];
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        match stream.read(&mut scratch) {
            Ok(0) => panic!("server closed before replying"),
            Ok(n) => {
                buf.write_all(&scratch[..n]);
                let mut msgs = decode_all(&mut buf);
                if !msgs.is_empty() {
                    return msgs.remove(0);
                }
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => panic!("read failed: {e}"),
        }
    }
    panic!("no reply within {timeout:?}");
}

/// Run one request/reply round-trip over a client on its own loop thread.
fn client_call(addr: SocketAddr, request: RpcMessage) -> RpcMessage {
    let (tx, rx) = mpsc::channel();
    let msg_id = request.msg_id.clone();
    let client_thread = thread::spawn(move || {
        let client = TcpClient::new(&addr.to_string()).expect("client setup");
        let c = client.clone();
        client.connect(Box::new(move |result| {
            result.expect("connect");
            let on_reply = {
                let c = c.clone();
                Box::new(move |reply: RpcMessage| {
                    tx.send(reply).expect("deliver reply");
                    c.stop();
                })
            };
            c.read_message(&msg_id, on_reply);
            c.write_message(request, None);
        }));
        EventLoop::current().expect("client loop").run();
    });
    let reply = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("no reply within 5s");
    client_thread.join().expect("client thread");
    reply
}

#[test]
fn s1_echo_round_trip() {
    let (addr, shutdown, server) = start_server(2);

    let reply = client_call(addr, RpcMessage::request("1", "Echo.say", b"hi".to_vec()));
    assert_eq!(reply.msg_id, "1");
    assert_eq!(reply.err_code, 0);
    assert_eq!(reply.payload, b"hi");

    shutdown.shutdown();
    server.join().expect("server thread");
}

#[test]
fn s2_unknown_service() {
    let (addr, shutdown, server) = start_server(1);

    let reply = client_call(addr, RpcMessage::request("2", "Ghost.none", vec![]));
    assert_eq!(reply.msg_id, "2");
    assert_eq!(reply.err_code, error_code::SERVICE_NOT_FOUND);
    assert_eq!(reply.err_info, "service not found");

    shutdown.shutdown();
    server.join().expect("server thread");
}

#[test]
fn s2b_unknown_method() {
    let (addr, shutdown, server) = start_server(1);

    let reply = client_call(addr, RpcMessage::request("8", "Echo.shout", vec![]));
    assert_eq!(reply.err_code, error_code::SERVICE_NOT_FOUND);
    assert_eq!(reply.err_info, "method not found");

    shutdown.shutdown();
    server.join().expect("server thread");
}

#[test]
fn s3_malformed_method_name() {
    let (addr, shutdown, server) = start_server(1);

    let reply = client_call(addr, RpcMessage::request("3", "", vec![]));
    assert_eq!(reply.msg_id, "3");
    assert_eq!(reply.err_code, error_code::PARSE_SERVICE_NAME);

    shutdown.shutdown();
    server.join().expect("server thread");
}

#[test]
fn s4_partial_frame_reassembly() {
    let (addr, shutdown, server) = start_server(1);

    // 26 fixed + 2 msg-id + 8 method + 164 payload = exactly 200 bytes
    let request = RpcMessage::request("s4", "Echo.say", vec![7u8; 164]);
    let bytes = frame_bytes(&request);
    assert_eq!(bytes.len(), 200);

    let mut stream = TcpStream::connect(addr).expect("connect");
    let mut offset = 0;
    for chunk in [1usize, 17, 53, 129] {
        stream
            .write_all(&bytes[offset..offset + chunk])
            .expect("write chunk");
        stream.flush().expect("flush");
        offset += chunk;
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(offset, bytes.len());

    let reply = read_one_reply(&mut stream, Duration::from_secs(5));
    assert_eq!(reply.msg_id, "s4");
    assert_eq!(reply.err_code, 0);
    assert_eq!(reply.payload, request.payload);

    shutdown.shutdown();
    server.join().expect("server thread");
}

#[test]
fn s5_out_of_order_completion() {
    let (addr, shutdown, server) = start_server(2);

    let arrivals: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let (tx, rx) = mpsc::channel();

    let arrivals_in_client = arrivals.clone();
    let client_thread = thread::spawn(move || {
        let client = TcpClient::new(&addr.to_string()).expect("client setup");
        let c = client.clone();
        client.connect(Box::new(move |result| {
            result.expect("connect");
            for msg_id in ["1", "2"] {
                let arrivals = arrivals_in_client.clone();
                let tx = tx.clone();
                let c2 = c.clone();
                c.read_message(
                    msg_id,
                    Box::new(move |reply| {
                        let mut arrivals = arrivals.lock().unwrap();
                        arrivals.push(reply.msg_id.clone());
                        tx.send(reply).expect("deliver reply");
                        if arrivals.len() == 2 {
                            c2.stop();
                        }
                    }),
                );
            }
            c.write_message(RpcMessage::request("1", "Sleepy.slow", b"a".to_vec()), None);
            c.write_message(RpcMessage::request("2", "Sleepy.fast", b"b".to_vec()), None);
        }));
        EventLoop::current().expect("client loop").run();
    });

    let first = rx.recv_timeout(Duration::from_secs(5)).expect("first reply");
    let second = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("second reply");
    client_thread.join().expect("client thread");

    // fast completes before the deferred slow reply
    assert_eq!(first.msg_id, "2");
    assert_eq!(second.msg_id, "1");
    assert_eq!(*arrivals.lock().unwrap(), vec!["2", "1"]);
    // both callbacks fired exactly once
    assert!(rx.try_recv().is_err());

    shutdown.shutdown();
    server.join().expect("server thread");
}

#[test]
fn s6_peer_shutdown_before_reply() {
    let (addr, shutdown, server) = start_server(1);

    // send a full request, then close before the server can reply
    {
        let mut stream = TcpStream::connect(addr).expect("connect");
        let request = RpcMessage::request("gone", "Sleepy.slow", b"x".to_vec());
        stream.write_all(&frame_bytes(&request)).expect("write");
        stream.flush().expect("flush");
    }
    thread::sleep(Duration::from_millis(150));

    // the worker observed read-returns-zero and closed the connection;
    // the server keeps serving new clients
    let reply = client_call(addr, RpcMessage::request("9", "Echo.say", b"alive".to_vec()));
    assert_eq!(reply.err_code, 0);
    assert_eq!(reply.payload, b"alive");

    shutdown.shutdown();
    server.join().expect("server thread");
}

#[test]
fn client_connect_refused() {
    // learn a free port, then drop the listener so the connect is refused
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .expect("probe bind")
        .local_addr()
        .expect("probe addr")
        .port();

    let (tx, rx) = mpsc::channel();
    let client_thread = thread::spawn(move || {
        let client = TcpClient::new(&format!("127.0.0.1:{port}")).expect("client setup");
        let c = client.clone();
        client.connect(Box::new(move |result| {
            tx.send(result).expect("deliver connect result");
            c.stop();
        }));
        EventLoop::current().expect("client loop").run();
    });

    let result = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("connect never resolved");
    client_thread.join().expect("client thread");
    let err = result.expect_err("connect to a closed port should fail");
    assert_eq!(err.code, error_code::PEER_CLOSED);
}

#[test]
fn pipelined_requests_reply_in_order() {
    let (addr, shutdown, server) = start_server(1);

    let mut stream = TcpStream::connect(addr).expect("connect");
    let mut bytes = Vec::new();
    for i in 0..3 {
        let request = RpcMessage::request(format!("p{i}"), "Echo.say", vec![i as u8; 10]);
        bytes.extend(frame_bytes(&request));
    }
    stream.write_all(&bytes).expect("write batch");
    stream.flush().expect("flush");

    for i in 0..3 {
        let reply = read_one_reply(&mut stream, Duration::from_secs(5));
        assert_eq!(reply.msg_id, format!("p{i}"));
        assert_eq!(reply.payload, vec![i as u8; 10]);
    }

    shutdown.shutdown();
    server.join().expect("server thread");
}
