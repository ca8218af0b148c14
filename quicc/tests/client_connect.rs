//! End-to-end client scenarios over loopback UDP, public API only.

mod common;

use std::time::Duration;

use common::{serve_full_handshake, bind_server, Recorder, RecorderCallback, ScriptedMachine};
use quicc::{ClientTransport, TransportSettings};

fn transport_with(
    recorder: &Recorder,
    peer: std::net::SocketAddr,
    settings: TransportSettings,
) -> ClientTransport {
    let mut transport = ClientTransport::new(
        settings,
        Box::new(|| Box::new(ScriptedMachine::full_handshake())),
        Box::new(RecorderCallback(recorder.clone())),
    );
    transport.set_hostname("host.example");
    transport.add_peer_address(peer).unwrap();
    transport
}

async fn wait_for(recorder: &Recorder, event: &str) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if recorder.count(event) > 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {event}, saw {:?}", recorder.events()));
}

#[tokio::test]
async fn handshake_completes_over_loopback() {
    let (server_socket, server_addr) = bind_server("127.0.0.1:0").await;
    let server = tokio::spawn(serve_full_handshake(server_socket));

    let recorder = Recorder::default();
    let transport = transport_with(&recorder, server_addr, TransportSettings::default());
    let handle = transport.spawn();

    wait_for(&recorder, "handshake_finished").await;
    wait_for(&recorder, "replay_safe").await;
    server.await.unwrap();

    assert_eq!(recorder.count("handshake_finished"), 1);
    assert_eq!(recorder.count("replay_safe"), 1);

    // Graceful application close ends the transport task.
    handle.close(0, &b"done"[..]);
    wait_for(&recorder, "end").await;
}

#[tokio::test]
async fn dual_stack_race_promotes_answering_family() {
    // v6 candidate points at a silent port (blackhole); the v4 server
    // answers once the delay lets the secondary write.
    let Ok(blackhole) = tokio::net::UdpSocket::bind("[::1]:0").await else {
        return; // host without IPv6
    };
    let v6_peer = blackhole.local_addr().unwrap();

    let (server_socket, v4_peer) = bind_server("127.0.0.1:0").await;
    let server = tokio::spawn(serve_full_handshake(server_socket));

    let recorder = Recorder::default();
    let settings = TransportSettings {
        conn_attempt_delay: Duration::from_millis(25),
        ..Default::default()
    };
    let mut transport = transport_with(&recorder, v4_peer, settings);
    transport.add_peer_address(v6_peer).unwrap();
    // Cached hint says v6, which is the blackholed family this time.
    transport.set_cached_family(quicc::AddressFamily::V6);
    transport.add_second_socket(quicc::netio::create_socket(&v4_peer).unwrap());

    let _handle = transport.spawn();

    // The handshake can only complete if the v4 secondary was promoted.
    wait_for(&recorder, "handshake_finished").await;
    server.await.unwrap();
    assert_eq!(recorder.count("handshake_finished"), 1);
}

#[tokio::test]
async fn idle_timeout_command_surfaces_error() {
    let (server_socket, server_addr) = bind_server("127.0.0.1:0").await;
    // Server never answers; the embedding state gives up.
    let _keep = server_socket;

    let recorder = Recorder::default();
    let transport = transport_with(&recorder, server_addr, TransportSettings::default());
    let handle = transport.spawn();

    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.idle_timeout();
    wait_for(&recorder, "error:idle timeout").await;
}
