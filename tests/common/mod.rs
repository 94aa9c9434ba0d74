#![allow(dead_code)]

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use keyhole::{AllowAllPolicy, ProxyServer, StaticRouter, TargetConfig};
use russh::{
    Channel, ChannelId, ChannelMsg, CryptoVec,
    client,
    keys::{Algorithm, PrivateKey, signature::rand_core::OsRng},
    server::{self, Auth, Msg, Server as _, Session},
};
use tokio::{
    io::copy_bidirectional,
    net::{TcpListener, TcpStream},
    sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
    time::timeout,
};
use tokio_util::sync::CancellationToken;

pub const ORIGIN_USER: &str = "origin-user";
pub const ORIGIN_PASSWORD: &str = "origin-pass";
pub const TARGET_USER: &str = "target-user";
pub const TARGET_PASSWORD: &str = "target-pass";
/// Hostnames the mock target refuses to open channels or forwardings for.
pub const DENIED_HOST: &str = "denied.invalid";

pub struct TaskGuard<T>(pub tokio::task::JoinHandle<T>);

impl<T> Drop for TaskGuard<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn generate_key() -> PrivateKey {
    PrivateKey::random(&mut OsRng, Algorithm::Ed25519).expect("key generation failed")
}

fn server_config() -> Arc<server::Config> {
    Arc::new(server::Config {
        auth_rejection_time: Duration::from_secs(3),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        keys: vec![generate_key()],
        ..Default::default()
    })
}

// ---------------------------------------------------------------------------
// Mock target sshd: authenticates a fixed user and interprets the handful of
// commands the scenarios need, without running a real shell.

pub struct MockSshd {
    pub addr: String,
    /// Every (user, password) pair presented to the target.
    pub auth_attempts: Arc<Mutex<Vec<(String, String)>>>,
    pub x11_requests: Arc<AtomicUsize>,
    _task: TaskGuard<()>,
}

pub async fn start_mock_sshd() -> MockSshd {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind mock sshd");
    let addr = listener.local_addr().unwrap().to_string();
    let auth_attempts = Arc::new(Mutex::new(Vec::new()));
    let x11_requests = Arc::new(AtomicUsize::new(0));
    let mut sshd = MockServer {
        auth_attempts: Arc::clone(&auth_attempts),
        x11_requests: Arc::clone(&x11_requests),
    };
    let config = server_config();
    let task = TaskGuard(tokio::spawn(async move {
        let _ = sshd.run_on_socket(config, &listener).await;
    }));
    MockSshd {
        addr,
        auth_attempts,
        x11_requests,
        _task: task,
    }
}

struct MockServer {
    auth_attempts: Arc<Mutex<Vec<(String, String)>>>,
    x11_requests: Arc<AtomicUsize>,
}

impl server::Server for MockServer {
    type Handler = MockHandler;

    fn new_client(&mut self, _peer_addr: Option<std::net::SocketAddr>) -> MockHandler {
        MockHandler {
            auth_attempts: Arc::clone(&self.auth_attempts),
            x11_requests: Arc::clone(&self.x11_requests),
            envs: HashMap::new(),
            cat_channels: HashSet::new(),
        }
    }
}

struct MockHandler {
    auth_attempts: Arc<Mutex<Vec<(String, String)>>>,
    x11_requests: Arc<AtomicUsize>,
    envs: HashMap<ChannelId, Vec<(String, String)>>,
    cat_channels: HashSet<ChannelId>,
}

// Emit command output and terminate the channel the way sshd does: exit
// status first, then EOF, then close.
fn finish_command(
    handle: server::Handle,
    id: ChannelId,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    exit_status: u32,
) {
    tokio::spawn(async move {
        if !stdout.is_empty() {
            let _ = handle.data(id, CryptoVec::from_slice(&stdout)).await;
        }
        if !stderr.is_empty() {
            let _ = handle.extended_data(id, 1, CryptoVec::from_slice(&stderr)).await;
        }
        let _ = handle.exit_status_request(id, exit_status).await;
        let _ = handle.eof(id).await;
        let _ = handle.close(id).await;
    });
}

impl server::Handler for MockHandler {
    type Error = russh::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        self.auth_attempts
            .lock()
            .unwrap()
            .push((user.into(), password.into()));
        if user == TARGET_USER && password == TARGET_PASSWORD {
            Ok(Auth::Accept)
        } else {
            Ok(Auth::reject())
        }
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let command = String::from_utf8_lossy(data).to_string();
        let handle = session.handle();
        match command.as_str() {
            "echo 123" => {
                session.channel_success(channel)?;
                finish_command(handle, channel, b"123\n".to_vec(), Vec::new(), 0);
            }
            ">&2 echo error" => {
                session.channel_success(channel)?;
                finish_command(handle, channel, Vec::new(), b"error\n".to_vec(), 0);
            }
            "cat" => {
                // Echo data back until the client half-closes.
                self.cat_channels.insert(channel);
                session.channel_success(channel)?;
            }
            "exit 123" => {
                session.channel_success(channel)?;
                finish_command(handle, channel, Vec::new(), Vec::new(), 123);
            }
            "env" => {
                session.channel_success(channel)?;
                let mut output = Vec::new();
                for (name, value) in self.envs.get(&channel).cloned().unwrap_or_default() {
                    output.extend_from_slice(format!("{name}={value}\n").as_bytes());
                }
                finish_command(handle, channel, output, Vec::new(), 0);
            }
            _ => {
                session.channel_failure(channel)?;
                finish_command(handle, channel, Vec::new(), Vec::new(), 127);
            }
        }
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if self.cat_channels.contains(&channel) {
            let _ = session.data(channel, CryptoVec::from_slice(data));
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if self.cat_channels.remove(&channel) {
            finish_command(session.handle(), channel, Vec::new(), Vec::new(), 0);
        }
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.envs
            .entry(channel)
            .or_default()
            .push((variable_name.into(), variable_value.into()));
        session.channel_success(channel)
    }

    async fn x11_request(
        &mut self,
        channel: ChannelId,
        _single_connection: bool,
        _x11_auth_protocol: &str,
        _x11_auth_cookie: &str,
        _x11_screen_number: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.x11_requests.fetch_add(1, Ordering::AcqRel);
        session.channel_success(channel)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_success(channel)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if host_to_connect == DENIED_HOST {
            return Ok(false);
        }
        match TcpStream::connect((host_to_connect, port_to_connect as u16)).await {
            Ok(mut stream) => {
                tokio::spawn(async move {
                    let mut channel_stream = channel.into_stream();
                    let _ = copy_bidirectional(&mut stream, &mut channel_stream).await;
                });
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if address == DENIED_HOST {
            return Ok(false);
        }
        let Ok(listener) = TcpListener::bind(("127.0.0.1", *port as u16)).await else {
            return Ok(false);
        };
        let handle = session.handle();
        let address = address.to_string();
        let port = *port;
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, peer)) = listener.accept().await else {
                    break;
                };
                let Ok(channel) = handle
                    .channel_open_forwarded_tcpip(
                        address.clone(),
                        port,
                        peer.ip().to_string(),
                        peer.port().into(),
                    )
                    .await
                else {
                    break;
                };
                tokio::spawn(async move {
                    let mut channel_stream = channel.into_stream();
                    let _ = copy_bidirectional(&mut stream, &mut channel_stream).await;
                });
            }
        });
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Proxy fixture.

pub struct TestProxy {
    pub addr: String,
    pub cancellation_token: CancellationToken,
    _task: TaskGuard<()>,
}

pub fn target_config() -> TargetConfig {
    TargetConfig::new(TARGET_USER).with_password(TARGET_PASSWORD)
}

pub async fn start_proxy(target_addr: &str, target: TargetConfig) -> TestProxy {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind proxy");
    let addr = listener.local_addr().unwrap().to_string();
    let router = Arc::new(StaticRouter::new(target_addr, target));
    let server = ProxyServer::new(server_config(), Arc::new(AllowAllPolicy), router);
    let cancellation_token = CancellationToken::new();
    let task = TaskGuard(tokio::spawn({
        let cancellation_token = cancellation_token.clone();
        async move {
            let _ = server.listen(listener, cancellation_token).await;
        }
    }));
    TestProxy {
        addr,
        cancellation_token,
        _task: task,
    }
}

// ---------------------------------------------------------------------------
// Origin-side test client.

#[derive(Default)]
pub struct TestClient {
    pub forwarded: Option<UnboundedSender<Channel<client::Msg>>>,
}

impl client::Handler for TestClient {
    type Error = color_eyre::eyre::Error;

    async fn check_server_key(
        &mut self,
        _key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<client::Msg>,
        _connected_address: &str,
        _connected_port: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        if let Some(ref forwarded) = self.forwarded {
            let _ = forwarded.send(channel);
        }
        Ok(())
    }
}

pub async fn connect_origin(addr: &str) -> client::Handle<TestClient> {
    connect_origin_with(addr, TestClient::default()).await
}

pub async fn connect_origin_with_forwarding(
    addr: &str,
) -> (client::Handle<TestClient>, UnboundedReceiver<Channel<client::Msg>>) {
    let (tx, rx) = unbounded_channel();
    let session = connect_origin_with(
        addr,
        TestClient {
            forwarded: Some(tx),
        },
    )
    .await;
    (session, rx)
}

async fn connect_origin_with(addr: &str, handler: TestClient) -> client::Handle<TestClient> {
    let mut session = client::connect(Default::default(), addr, handler)
        .await
        .expect("Failed to connect to proxy");
    assert!(
        session
            .authenticate_password(ORIGIN_USER, ORIGIN_PASSWORD)
            .await
            .expect("origin authentication errored")
            .success(),
        "origin authentication didn't succeed"
    );
    session
}

// ---------------------------------------------------------------------------
// Session output collection.

#[derive(Debug, Default)]
pub struct SessionOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_status: Option<u32>,
    pub replies: Vec<bool>,
}

/// Drains a session channel until it closes, recording output streams,
/// request replies, and the exit status.
pub async fn collect_output(channel: &mut Channel<client::Msg>) -> SessionOutput {
    let mut output = SessionOutput::default();
    loop {
        let msg = timeout(Duration::from_secs(5), channel.wait())
            .await
            .expect("Timeout waiting for session output");
        match msg {
            Some(ChannelMsg::Data { data }) => output.stdout.extend_from_slice(&data.to_vec()),
            Some(ChannelMsg::ExtendedData { data, ext }) => {
                assert_eq!(ext, 1, "unexpected extended data stream");
                output.stderr.extend_from_slice(&data.to_vec());
            }
            Some(ChannelMsg::ExitStatus { exit_status }) => {
                output.exit_status = Some(exit_status)
            }
            Some(ChannelMsg::Success) => output.replies.push(true),
            Some(ChannelMsg::Failure) => output.replies.push(false),
            Some(ChannelMsg::Close) | None => break,
            Some(_) => {}
        }
    }
    output
}
