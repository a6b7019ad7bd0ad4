//! Accept loop and per-connection tasks.
//!
//! Each accepted socket gets its own task. The task reads packets off the
//! socket and feeds them to the command engine; outbound bytes staged by any
//! handler land on the connection's queue and are drained here. Keepalive
//! enforcement and transport teardown also live at this level, so the engine
//! itself never blocks.

use std::future::Future;

use bytes::Bytes;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{broadcast, mpsc},
    time::{self, Duration, Instant},
};
use tracing::{debug, error, info, warn};

use iris_packets::ControlPacket;

use crate::{
    broker::{Broker, BrokerConfig, ConnectOutcome, HandlerOutcome},
    connection::Connection,
    error::ServerError,
    shutdown::Shutdown,
};

/// Deadline used when the client asked for keepalive 0 (disabled).
const KEEPALIVE_DISABLED: Duration = Duration::from_secs(60 * 60 * 24 * 365);

/// Run the MQTT broker on the given listener until `shutdown` completes.
pub async fn run(listener: TcpListener, config: BrokerConfig, shutdown: impl Future) {
    let (notify_shutdown, _) = broadcast::channel(1);

    let mut server = Listener {
        listener,
        broker: Broker::new(config),
        notify_shutdown,
    };

    tokio::select! {
        result = server.run() => {
            if let Err(err) = result {
                error!(cause = %err, "failed to accept new connections");
            }
        }
        _ = shutdown => {
            info!("shutting down");
        }
    }
}

struct Listener {
    listener: TcpListener,
    broker: Broker,
    notify_shutdown: broadcast::Sender<()>,
}

struct Handler {
    broker: Broker,
    connection: Connection,
    shutdown: Shutdown,
}

impl Listener {
    async fn run(&mut self) -> Result<(), ServerError> {
        loop {
            let socket = self.accept().await?;
            let peer_addr = socket.peer_addr().ok();

            debug!("accepted connection from {:?}", peer_addr);

            let mut handler = Handler {
                broker: self.broker.clone(),
                connection: Connection::new(socket),
                shutdown: Shutdown::new(self.notify_shutdown.subscribe()),
            };

            tokio::spawn(async move {
                if let Err(err) = handler.run().await {
                    error!(cause = %err, "connection error");
                }
            });
        }
    }

    async fn accept(&mut self) -> Result<TcpStream, ServerError> {
        let mut backoff = 1;

        loop {
            match self.listener.accept().await {
                Ok((socket, _)) => return Ok(socket),
                Err(err) => {
                    if backoff > 64 {
                        return Err(err.into());
                    }
                }
            }

            time::sleep(Duration::from_secs(backoff)).await;

            backoff *= 2;
        }
    }
}

impl Handler {
    async fn run(&mut self) -> Result<(), ServerError> {
        // [MQTT-3.1.0-1]
        // After a network connection is established, the first packet sent
        // from the client to the server must be a CONNECT packet.
        let connect = match self.connection.read_packet().await? {
            Some(ControlPacket::Connect(packet)) => packet,
            Some(_) => {
                warn!("first packet was not CONNECT");
                return Ok(());
            }
            None => return Ok(()),
        };

        let keepalive = connect.keepalive;
        let (tx, mut rx) = mpsc::unbounded_channel();

        match self.broker.connect(connect, tx) {
            ConnectOutcome::Accepted { client_id } => {
                let clean = self.serve(&client_id, keepalive, &mut rx).await;
                self.broker.connection_closed(&client_id, clean);
            }
            ConnectOutcome::Rejected(code) => {
                info!(%code, "connection rejected");
                // Flush the staged CONNACK so the peer sees the reason
                // before the socket closes.
                while let Ok(bytes) = rx.try_recv() {
                    self.connection.write_bytes(&bytes).await?;
                }
            }
            ConnectOutcome::Violation => {}
        }

        Ok(())
    }

    /// Serve the bound session until the connection ends.
    ///
    /// Returns true only when the peer ended the session with a DISCONNECT
    /// packet; every other exit counts as abnormal and triggers will
    /// publication in the teardown path.
    async fn serve(
        &mut self,
        client_id: &str,
        keepalive: u16,
        rx: &mut mpsc::UnboundedReceiver<Bytes>,
    ) -> bool {
        // 1.5x the keepalive interval, per the protocol.
        let timeout_duration = if keepalive == 0 {
            KEEPALIVE_DISABLED
        } else {
            Duration::from_secs(keepalive as u64 * 3 / 2)
        };

        let deadline = time::sleep(timeout_duration);
        tokio::pin!(deadline);

        while !self.shutdown.is_shutdown() {
            tokio::select! {
                maybe_packet = self.connection.read_packet() => {
                    let packet = match maybe_packet {
                        Ok(Some(packet)) => packet,
                        Ok(None) => return false,
                        Err(err) => {
                            warn!(client_id = %client_id, cause = %err, "read error");
                            return false;
                        }
                    };

                    // Any inbound packet resets the keepalive deadline.
                    deadline.as_mut().reset(Instant::now() + timeout_duration);

                    let clean = matches!(packet, ControlPacket::Disconnect(_));
                    match self.broker.dispatch(client_id, packet) {
                        HandlerOutcome::Reply | HandlerOutcome::NoReply => {}
                        HandlerOutcome::Disconnect => return clean,
                    }
                }

                Some(bytes) = rx.recv() => {
                    if let Err(err) = self.connection.write_bytes(&bytes).await {
                        warn!(client_id = %client_id, cause = %err, "write error");
                        return false;
                    }
                }

                _ = &mut deadline => {
                    warn!(
                        client_id = %client_id,
                        "keepalive timeout ({}s with no packets)",
                        timeout_duration.as_secs()
                    );
                    return false;
                }

                _ = self.shutdown.recv() => {
                    return false;
                }
            }
        }

        false
    }
}
