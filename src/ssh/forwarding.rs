use std::sync::Arc;

use dashmap::DashMap;
use russh::{Channel, ChannelId, ChannelMsg, client, server};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Events queued per channel between the origin-side session loop and the
/// channel's pump. Bounded so that a stalled target throttles the origin
/// instead of buffering in the proxy.
const CHANNEL_QUEUE_SIZE: usize = 64;

/// Origin channel id to pump-queue sender, shared between the origin-side
/// handler and the target-side handler of one connection.
pub(crate) type ChannelRegistry = Arc<DashMap<ChannelId, mpsc::Sender<ChannelMsg>>>;

/// Wires one origin channel to its mirror on the target and keeps the pair
/// flowing until either side is done.
///
/// The origin side is driven through the session handle because its events
/// arrive through the server handler; the target side is a channel object
/// and is awaited directly.
pub(crate) struct ChannelPump {
    origin: server::Handle,
    origin_id: ChannelId,
    target: Channel<client::Msg>,
    queue: mpsc::Receiver<ChannelMsg>,
    cancellation_token: CancellationToken,
}

/// Registers the channel pair in `registry` and runs its pump to completion
/// in a new task. The entry is removed when the pump stops, so late events
/// for a finished channel are dropped at the handler.
pub(crate) fn spawn_pump(
    origin: server::Handle,
    origin_id: ChannelId,
    target: Channel<client::Msg>,
    registry: ChannelRegistry,
    cancellation_token: CancellationToken,
) {
    let (tx, queue) = mpsc::channel(CHANNEL_QUEUE_SIZE);
    registry.insert(origin_id, tx);
    let pump = ChannelPump {
        origin,
        origin_id,
        target,
        queue,
        cancellation_token,
    };
    tokio::spawn(async move {
        let origin_id = pump.origin_id;
        pump.run().await;
        registry.remove(&origin_id);
    });
}

impl ChannelPump {
    async fn run(mut self) {
        loop {
            tokio::select! {
                msg = self.queue.recv() => match msg {
                    // The origin closed the channel, or its connection went
                    // away entirely. russh reciprocates the close on the
                    // origin side; mirror it to the target.
                    Some(ChannelMsg::Close) | None => {
                        let _ = self.target.close().await;
                        break;
                    }
                    Some(msg) => {
                        if let Err(error) = relay_to_target(msg, &self.target).await {
                            debug!(channel = %self.origin_id, %error, "Target channel write failed.");
                            let _ = self.origin.close(self.origin_id).await;
                            break;
                        }
                    }
                },
                msg = self.target.wait() => match msg {
                    Some(ChannelMsg::Close) | None => {
                        let _ = self.origin.close(self.origin_id).await;
                        break;
                    }
                    Some(msg) => {
                        if relay_to_origin(msg, &self.origin, self.origin_id).await.is_err() {
                            let _ = self.target.close().await;
                            break;
                        }
                    }
                },
                _ = self.cancellation_token.cancelled() => break,
            }
        }
    }
}

/// Replays one origin-side event onto the mirrored channel.
///
/// Requests whose origin `want_reply` flag is not surfaced by the handler
/// callbacks are forwarded wanting a reply; the relayed answer is dropped
/// on the origin side if the origin never asked for one.
pub(crate) async fn relay_to_target<S>(
    msg: ChannelMsg,
    target: &Channel<S>,
) -> Result<(), russh::Error>
where
    S: From<(ChannelId, ChannelMsg)> + Send + Sync + 'static,
{
    match msg {
        ChannelMsg::Data { data } => target.data(data.iter().as_slice()).await?,
        ChannelMsg::ExtendedData { data, ext } => {
            target.extended_data(ext, data.iter().as_slice()).await?
        }
        ChannelMsg::Eof => target.eof().await?,
        ChannelMsg::Close => target.close().await?,
        ChannelMsg::RequestPty {
            want_reply,
            term,
            col_width,
            row_height,
            pix_width,
            pix_height,
            terminal_modes,
        } => {
            target
                .request_pty(
                    want_reply,
                    &term,
                    col_width,
                    row_height,
                    pix_width,
                    pix_height,
                    &terminal_modes,
                )
                .await?
        }
        ChannelMsg::RequestShell { want_reply } => target.request_shell(want_reply).await?,
        ChannelMsg::Exec {
            want_reply,
            command,
        } => target.exec(want_reply, command).await?,
        ChannelMsg::SetEnv {
            want_reply,
            variable_name,
            variable_value,
        } => {
            target
                .set_env(want_reply, variable_name, variable_value)
                .await?
        }
        ChannelMsg::RequestSubsystem { want_reply, name } => {
            target.request_subsystem(want_reply, name).await?
        }
        ChannelMsg::RequestX11 {
            want_reply,
            single_connection,
            x11_authentication_protocol,
            x11_authentication_cookie,
            x11_screen_number,
        } => {
            target
                .request_x11(
                    want_reply,
                    single_connection,
                    x11_authentication_protocol,
                    x11_authentication_cookie,
                    x11_screen_number,
                )
                .await?
        }
        ChannelMsg::WindowChange {
            col_width,
            row_height,
            pix_width,
            pix_height,
        } => {
            target
                .window_change(col_width, row_height, pix_width, pix_height)
                .await?
        }
        ChannelMsg::Signal { signal } => target.signal(signal).await?,
        ChannelMsg::AgentForward { want_reply } => target.agent_forward(want_reply).await?,
        msg => debug!(?msg, "Ignoring unsupported channel message."),
    }
    Ok(())
}

/// Replays one target-side event back to the origin through the session
/// handle. Errors mean the origin session is gone.
pub(crate) async fn relay_to_origin(
    msg: ChannelMsg,
    origin: &server::Handle,
    id: ChannelId,
) -> Result<(), ()> {
    match msg {
        ChannelMsg::Data { data } => origin.data(id, data).await.map_err(|_| ())?,
        ChannelMsg::ExtendedData { data, ext } => {
            origin.extended_data(id, ext, data).await.map_err(|_| ())?
        }
        ChannelMsg::Eof => origin.eof(id).await?,
        ChannelMsg::Success => origin.channel_success(id).await?,
        ChannelMsg::Failure => origin.channel_failure(id).await?,
        ChannelMsg::ExitStatus { exit_status } => {
            origin.exit_status_request(id, exit_status).await?
        }
        ChannelMsg::ExitSignal {
            signal_name,
            core_dumped,
            error_message,
            lang_tag,
        } => {
            origin
                .exit_signal_request(id, signal_name, core_dumped, error_message, lang_tag)
                .await?
        }
        ChannelMsg::XonXoff { client_can_do } => {
            origin.xon_xoff_request(id, client_can_do).await?
        }
        // Window bookkeeping is per hop; each side runs its own.
        ChannelMsg::WindowAdjusted { .. } => {}
        msg => debug!(?msg, "Ignoring unsupported channel message."),
    }
    Ok(())
}
