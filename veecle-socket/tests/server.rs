#![expect(missing_docs, reason = "tests")]

mod common;

use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use test_case::test_case;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use veecle_socket::{
    ConnState, Error, FuncInfoServer, FuncUpdateConn, MultiSocketAddress, Network, Operation,
    Server, ServerConfig, ServerConnection, SockRef,
};

use crate::common::{PATIENCE, echo, eventually, record_errors, record_states, wait_for_all};

#[tokio::test]
async fn tcp_echo_on_ephemeral_port() {
    let fixture = common::start(Network::Tcp, echo).await;
    let MultiSocketAddress::Inet(address) = fixture.server.local_address() else {
        panic!("tcp server bound to a non-inet address");
    };
    assert_ne!(address.port(), 0);

    let client = fixture.client();
    client.connect(&CancellationToken::new()).await.unwrap();
    client.write_all(b"ping").await.unwrap();

    let mut buffer = [0; 4];
    let mut filled = 0;
    while filled < 4 {
        filled += client.read(&mut buffer[filled..]).await.unwrap();
    }
    assert_eq!(&buffer, b"ping");

    client.close().unwrap();
    fixture.stop().await;
}

#[test_case(Network::Tcp)]
#[test_case(Network::Udp)]
#[test_case(Network::Unix)]
#[test_case(Network::UnixGram)]
#[tokio::test]
async fn shutdown_before_serve_exits_without_dispatch(network: Network) {
    let calls = Arc::new(AtomicUsize::new(0));
    let (address, _directory) = common::local_address(network);
    let server = Server::new(ServerConfig::new(network, address), {
        let calls = calls.clone();
        move |_: ServerConnection| {
            calls.fetch_add(1, Ordering::SeqCst);
            async {}
        }
    })
    .await
    .unwrap();

    server.shutdown();
    assert!(server.is_gone());

    tokio::time::timeout(PATIENCE, server.serve())
        .await
        .unwrap()
        .unwrap();
    tokio::time::timeout(PATIENCE, server.done()).await.unwrap();
    assert!(!server.is_running());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn serve_runs_once() {
    let fixture = common::start(Network::Udp, echo).await;
    eventually(|| fixture.server.is_running()).await;

    assert!(matches!(
        fixture.server.serve().await,
        Err(Error::InvalidInstance(_))
    ));

    fixture.stop().await;
}

#[test_case(Network::Tcp)]
#[test_case(Network::Unix)]
#[tokio::test]
async fn shutdown_and_wait_drains_blocked_readers(network: Network) {
    let (address, directory) = common::local_address(network);
    let mut config = ServerConfig::new(network, address);
    config.read_timeout = None;
    let (sender, mut results) = mpsc::unbounded_channel();
    let fixture = common::start_with(
        config,
        move |connection: ServerConnection| {
            let sender = sender.clone();
            async move {
                let mut buffer = [0; 16];
                let _ = sender.send(connection.read(&mut buffer).await);
            }
        },
        directory,
    )
    .await;

    let client = fixture.client();
    client.connect(&CancellationToken::new()).await.unwrap();
    eventually(|| fixture.server.open_connections() == 1).await;

    fixture.server.shutdown_and_wait(PATIENCE).await.unwrap();
    assert_eq!(fixture.server.open_connections(), 0);
    assert!(!fixture.server.is_running());

    let result = results.recv().await.unwrap();
    assert!(matches!(result, Err(Error::ServerShutdown)));

    fixture.serving.await.unwrap().unwrap();
}

#[tokio::test]
async fn shutdown_and_wait_times_out_on_stuck_handler() {
    let fixture = common::start(Network::Tcp, |_connection: ServerConnection| async {
        tokio::time::sleep(Duration::from_secs(60)).await;
    })
    .await;

    let client = fixture.client();
    client.connect(&CancellationToken::new()).await.unwrap();
    eventually(|| fixture.server.open_connections() == 1).await;

    assert!(matches!(
        fixture
            .server
            .shutdown_and_wait(Duration::from_millis(100))
            .await,
        Err(Error::ShutdownTimeout(1))
    ));
}

#[tokio::test]
async fn read_timeout_applies_to_dispatch() {
    let (address, directory) = common::local_address(Network::Tcp);
    let mut config = ServerConfig::new(Network::Tcp, address);
    config.read_timeout = Some(Duration::from_millis(50));
    let (sender, mut results) = mpsc::unbounded_channel();
    let fixture = common::start_with(
        config,
        move |connection: ServerConnection| {
            let sender = sender.clone();
            async move {
                let mut buffer = [0; 16];
                let _ = sender.send(connection.read(&mut buffer).await);
            }
        },
        directory,
    )
    .await;
    let (errors, mut reported) = record_errors();
    fixture.server.register_func_error(Some(errors));

    let client = fixture.client();
    client.connect(&CancellationToken::new()).await.unwrap();

    let result = tokio::time::timeout(PATIENCE, results.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(Error::TimedOut(_))));
    let error = tokio::time::timeout(PATIENCE, reported.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(error, Error::TimedOut(_)));

    client.close().unwrap();
    fixture.stop().await;
}

#[tokio::test]
async fn set_handler_applies_to_new_dispatches() {
    let fixture = common::start(Network::Udp, echo).await;
    fixture
        .server
        .set_handler(|connection: ServerConnection| async move {
            let _ = connection.write_all(b"replaced").await;
        });

    let client = fixture.client();
    client.set_read_timeout(Some(PATIENCE));
    client.connect(&CancellationToken::new()).await.unwrap();
    client.write(b"anything").await.unwrap();

    let mut buffer = [0; 64];
    let read = client.read(&mut buffer).await.unwrap();
    assert_eq!(&buffer[..read], b"replaced");

    client.close().unwrap();
    fixture.stop().await;
}

#[tokio::test]
async fn udp_replies_reach_sender() {
    let fixture = common::start(Network::Udp, |connection: ServerConnection| async move {
        assert!(connection.is_datagram());
        let mut buffer = [0; 4];
        let read = connection.read(&mut buffer).await.unwrap();
        // A datagram is read exactly once.
        assert_eq!(connection.read(&mut buffer).await.unwrap(), 0);
        let mut reply = buffer[..read].to_vec();
        reply.reverse();
        connection.write_all(&reply).await.unwrap();
    })
    .await;

    let client = fixture.client();
    client.set_read_timeout(Some(PATIENCE));
    client.connect(&CancellationToken::new()).await.unwrap();
    client.write(b"abcd").await.unwrap();

    let mut buffer = [0; 4];
    assert_eq!(client.read(&mut buffer).await.unwrap(), 4);
    assert_eq!(&buffer, b"dcba");

    client.close().unwrap();
    fixture.stop().await;
}

#[tokio::test]
async fn unixgram_handler_sees_each_datagram() {
    let (sender, mut received) = mpsc::unbounded_channel();
    let fixture = common::start(Network::UnixGram, move |connection: ServerConnection| {
        let sender = sender.clone();
        async move {
            let mut buffer = [0; 32];
            let read = connection.read(&mut buffer).await.unwrap();
            let _ = sender.send(buffer[..read].to_vec());
            // Unbound senders cannot be answered.
            assert!(connection.write(b"reply").await.is_err());
        }
    })
    .await;

    let client = fixture.client();
    client.connect(&CancellationToken::new()).await.unwrap();
    client.write(b"first").await.unwrap();
    client.write(b"second").await.unwrap();

    for expected in [&b"first"[..], &b"second"[..]] {
        let datagram = tokio::time::timeout(PATIENCE, received.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(datagram, expected);
    }

    client.close().unwrap();
    fixture.stop().await;
}

#[tokio::test]
async fn stream_dispatch_reports_states() {
    let fixture = common::start(Network::Unix, echo).await;
    let (info, mut states) = record_states();
    fixture.server.register_func_info(Some(info));

    let client = fixture.client();
    client.connect(&CancellationToken::new()).await.unwrap();
    client.close().unwrap();

    wait_for_all(
        &mut states,
        &[
            ConnState::Established,
            ConnState::HandlerStarted,
            ConnState::Closed,
        ],
    )
    .await;

    fixture.stop().await;
}

#[tokio::test]
async fn server_info_reports_lifecycle() {
    let (address, _directory) = common::local_address(Network::Tcp);
    let server = Server::new(ServerConfig::new(Network::Tcp, address), echo)
        .await
        .unwrap();
    let (sender, mut messages) = mpsc::unbounded_channel();
    let function: FuncInfoServer = Arc::new(move |message: String| {
        let _ = sender.send(message);
    });
    server.register_func_info_server(Some(function));

    let serving = tokio::spawn({
        let server = server.clone();
        async move { server.serve().await }
    });
    eventually(|| server.is_running()).await;
    server.shutdown();
    serving.await.unwrap().unwrap();

    let mut seen: Vec<String> = Vec::new();
    let complete = |seen: &[String]| {
        ["listening on tcp", "shutdown requested", "stopped serving"]
            .iter()
            .all(|prefix| seen.iter().any(|message| message.starts_with(prefix)))
    };
    while !complete(&seen) {
        let message = tokio::time::timeout(PATIENCE, messages.recv())
            .await
            .unwrap_or_else(|_| panic!("saw only {seen:?}"))
            .unwrap();
        seen.push(message);
    }
}

#[tokio::test]
async fn unix_socket_file_follows_server() {
    let (address, directory) = common::local_address(Network::Unix);
    let mut config = ServerConfig::new(Network::Unix, address.clone());
    config.file_mode = Some(0o660);
    let server = Server::new(config, echo).await.unwrap();

    let mode = std::fs::metadata(&address).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o660);

    server.shutdown();
    server.serve().await.unwrap();
    assert!(!std::path::Path::new(&address).exists());
    drop(directory);
}

#[tokio::test]
async fn tls_is_tcp_only() {
    let fixture = common::start(Network::Unix, echo).await;
    fixture.server.set_tls(true, None).unwrap();
    assert!(!fixture.server.is_tls());
    fixture.stop().await;

    let fixture = common::start(Network::Tcp, echo).await;
    assert!(matches!(
        fixture.server.set_tls(true, None),
        Err(Error::InvalidTlsConfig(_))
    ));
    fixture.stop().await;
}

#[tokio::test]
async fn loads_server_config_from_toml() {
    let directory = tempfile::tempdir().unwrap();
    let path = directory.path().join("configured.sock");
    let config: ServerConfig = toml::from_str(&format!(
        r#"
            network = "unix"
            address = "{}"
            read_timeout = 0.25
            read_buffer_size = 65536
        "#,
        path.display()
    ))
    .unwrap();
    assert_eq!(config.read_timeout, Some(Duration::from_millis(250)));

    let fixture = common::start_with(config, echo, Some(directory)).await;
    let client = fixture.client();
    client.connect(&CancellationToken::new()).await.unwrap();
    assert!(client.is_connected());
    client.close().unwrap();
    fixture.stop().await;
}

#[test_case(Network::Udp ; "udp")]
#[test_case(Network::Tcp ; "tcp")]
#[tokio::test]
async fn handler_panic_is_reported_and_serving_continues(network: Network) {
    let fixture = common::start(network, |connection: ServerConnection| async move {
        let mut buffer = [0; 16];
        let read = connection.read(&mut buffer).await.unwrap_or(0);
        if &buffer[..read] == b"panic" {
            panic!("asked to panic");
        }
        let _ = connection.write_all(&buffer[..read]).await;
    })
    .await;
    let (errors, mut reported) = record_errors();
    fixture.server.register_func_error(Some(errors));

    let failing = fixture.client();
    failing.connect(&CancellationToken::new()).await.unwrap();
    failing.write_all(b"panic").await.unwrap();
    let error = tokio::time::timeout(PATIENCE, reported.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(
        matches!(&error, Error::HandlerPanicked(message) if message == "asked to panic"),
        "{error}"
    );
    failing.close().unwrap();
    assert!(fixture.server.is_running());

    let client = fixture.client();
    client.set_read_timeout(Some(PATIENCE));
    client.connect(&CancellationToken::new()).await.unwrap();
    client.write_all(b"ping").await.unwrap();
    let mut buffer = [0; 4];
    let read = client.read(&mut buffer).await.unwrap();
    assert_eq!(&buffer[..read], b"ping");
    client.close().unwrap();

    fixture.server.shutdown_and_wait(PATIENCE).await.unwrap();
    assert!(!fixture.server.is_running());
    assert_eq!(fixture.server.open_connections(), 0);
    fixture.stop().await;
}

fn counting_hook() -> (FuncUpdateConn, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let function: FuncUpdateConn = Arc::new({
        let calls = calls.clone();
        move |socket: SockRef<'_>| {
            assert!(socket.local_addr().is_ok());
            calls.fetch_add(1, Ordering::SeqCst);
        }
    });
    (function, calls)
}

#[tokio::test]
async fn update_conn_runs_per_accepted_stream() {
    let fixture = common::start(Network::Tcp, echo).await;
    let (hook, calls) = counting_hook();
    fixture.server.set_update_conn(Some(hook));

    for expected in 1..=2 {
        let client = fixture.client();
        client.connect(&CancellationToken::new()).await.unwrap();
        eventually(|| calls.load(Ordering::SeqCst) == expected).await;
        client.close().unwrap();
    }

    fixture.server.set_update_conn(None);
    let client = fixture.client();
    client.connect(&CancellationToken::new()).await.unwrap();
    eventually(|| fixture.server.open_connections() == 1).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    client.close().unwrap();

    fixture.stop().await;
}

#[tokio::test]
async fn update_conn_runs_once_for_datagram_socket() {
    let server = Server::new(ServerConfig::new(Network::Udp, "127.0.0.1:0"), echo)
        .await
        .unwrap();
    let (hook, calls) = counting_hook();
    server.set_update_conn(Some(hook));
    let serving = tokio::spawn({
        let server = server.clone();
        async move { server.serve().await }
    });
    eventually(|| calls.load(Ordering::SeqCst) == 1).await;

    let address = server.local_address().as_inet().unwrap();
    let client = veecle_socket::Client::new(veecle_socket::ClientConfig::new(
        Network::Udp,
        address.to_string(),
    ))
    .unwrap();
    client.set_read_timeout(Some(PATIENCE));
    client.connect(&CancellationToken::new()).await.unwrap();
    for _ in 0..2 {
        client.write(b"ping").await.unwrap();
        let mut buffer = [0; 4];
        client.read(&mut buffer).await.unwrap();
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    client.close().unwrap();
    server.shutdown();
    serving.await.unwrap().unwrap();
}

#[tokio::test]
async fn idle_connections_are_closed() {
    let (address, directory) = common::local_address(Network::Tcp);
    let mut config = ServerConfig::new(Network::Tcp, address);
    config.idle_timeout = Some(Duration::from_millis(100));
    let fixture = common::start_with(config, echo, directory).await;
    let (errors, mut reported) = record_errors();
    fixture.server.register_func_error(Some(errors));

    let client = fixture.client();
    client.set_read_timeout(Some(PATIENCE));
    client.connect(&CancellationToken::new()).await.unwrap();
    client.write_all(b"ping").await.unwrap();
    let mut buffer = [0; 4];
    let read = client.read(&mut buffer).await.unwrap();
    assert_eq!(&buffer[..read], b"ping");

    let error = tokio::time::timeout(PATIENCE, reported.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(error, Error::TimedOut(Operation::Idle)), "{error}");
    eventually(|| fixture.server.open_connections() == 0).await;
    assert_eq!(client.read(&mut buffer).await.unwrap(), 0);

    client.close().unwrap();
    fixture.stop().await;
}

#[tokio::test]
async fn stream_half_close() {
    let (sender, mut results) = mpsc::unbounded_channel();
    let fixture = common::start(Network::Tcp, move |connection: ServerConnection| {
        let sender = sender.clone();
        async move {
            connection.write_all(b"bye").await.unwrap();
            connection.close_write().unwrap();
            connection.close_read().unwrap();
            let mut buffer = [0; 8];
            let _ = sender.send(connection.read(&mut buffer).await);
        }
    })
    .await;
    let (info, mut states) = record_states();
    fixture.server.register_func_info(Some(info));

    let client = fixture.client();
    client.set_read_timeout(Some(PATIENCE));
    client.connect(&CancellationToken::new()).await.unwrap();

    let mut received = Vec::new();
    let mut buffer = [0; 8];
    loop {
        match client.read(&mut buffer).await.unwrap() {
            0 => break,
            read => received.extend_from_slice(&buffer[..read]),
        }
    }
    assert_eq!(received, b"bye");

    let result = tokio::time::timeout(PATIENCE, results.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.unwrap(), 0);
    wait_for_all(&mut states, &[ConnState::CloseWrite, ConnState::CloseRead]).await;

    client.close().unwrap();
    fixture.stop().await;
}

#[tokio::test]
async fn datagram_close_read_discards_pending() {
    let fixture = common::start(Network::Udp, |connection: ServerConnection| async move {
        connection.close_read().unwrap();
        // Nothing to shut down on a datagram reply path.
        connection.close_write().unwrap();
        let mut buffer = [0; 16];
        let read = connection.read(&mut buffer).await.unwrap();
        connection.write_all(read.to_string().as_bytes()).await.unwrap();
    })
    .await;

    let client = fixture.client();
    client.set_read_timeout(Some(PATIENCE));
    client.connect(&CancellationToken::new()).await.unwrap();
    client.write(b"ignored").await.unwrap();
    let mut buffer = [0; 16];
    let read = client.read(&mut buffer).await.unwrap();
    assert_eq!(&buffer[..read], b"0");

    client.close().unwrap();
    fixture.stop().await;
}

#[tokio::test]
async fn closed_connection_rejects_half_close() {
    let (sender, mut results) = mpsc::unbounded_channel();
    let fixture = common::start(Network::Unix, move |connection: ServerConnection| {
        let sender = sender.clone();
        async move {
            let _ = connection.close();
            let _ = sender.send((connection.close_read(), connection.close_write()));
        }
    })
    .await;

    let client = fixture.client();
    client.connect(&CancellationToken::new()).await.unwrap();
    let (read, write) = tokio::time::timeout(PATIENCE, results.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(read, Err(Error::NotConnected)));
    assert!(matches!(write, Err(Error::NotConnected)));

    client.close().unwrap();
    fixture.stop().await;
}

#[tokio::test]
async fn datagrams_larger_than_the_socket_buffer_setting_arrive_whole() {
    let (address, directory) = common::local_address(Network::Udp);
    let mut config = ServerConfig::new(Network::Udp, address);
    config.read_buffer_size = 1024;
    let fixture = common::start_with(
        config,
        |connection: ServerConnection| async move {
            let mut buffer = vec![0; veecle_socket::MAX_DATAGRAM_SIZE];
            let read = connection.read(&mut buffer).await.unwrap();
            let intact = buffer[..read].iter().all(|byte| *byte == 7);
            let reply = format!("{read} {intact}");
            connection.write_all(reply.as_bytes()).await.unwrap();
        },
        directory,
    )
    .await;

    let client = fixture.client();
    client.set_read_timeout(Some(PATIENCE));
    client.connect(&CancellationToken::new()).await.unwrap();
    client.write(&[7; 3000]).await.unwrap();

    let mut buffer = [0; 32];
    let read = client.read(&mut buffer).await.unwrap();
    assert_eq!(&buffer[..read], b"3000 true");

    client.close().unwrap();
    fixture.stop().await;
}

#[tokio::test]
async fn shutdown_without_serve_releases_unix_socket_file() {
    let (address, directory) = common::local_address(Network::Unix);
    let server = Server::new(ServerConfig::new(Network::Unix, address.clone()), echo)
        .await
        .unwrap();
    assert!(std::path::Path::new(&address).exists());

    server.shutdown();
    assert!(!std::path::Path::new(&address).exists());
    assert!(server.is_gone());
    server.serve().await.unwrap();

    drop(server);
    drop(directory);
}

#[tokio::test]
async fn shutdown_without_serve_releases_tcp_port() {
    let server = Server::new(ServerConfig::new(Network::Tcp, "127.0.0.1:0"), echo)
        .await
        .unwrap();
    let address = server.local_address().as_inet().unwrap();

    server.shutdown();
    let rebound = std::net::TcpListener::bind(address).unwrap();
    drop(rebound);
    server.serve().await.unwrap();
}

#[tokio::test]
async fn unregistered_error_callback_stays_silent() {
    let fixture = common::start(Network::Tcp, echo).await;
    let (errors, mut reported) = record_errors();
    fixture.server.register_func_error(Some(errors));

    assert!(fixture.server.set_tls(true, None).is_err());
    let error = tokio::time::timeout(PATIENCE, reported.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(error, Error::InvalidTlsConfig(_)), "{error}");

    fixture.server.register_func_error(None);
    assert!(fixture.server.set_tls(true, None).is_err());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(reported.try_recv().is_err());

    fixture.stop().await;
}
