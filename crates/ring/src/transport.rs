//! Link establishment and transport threads
//!
//! Each node keeps an egress pair to `(rank+1) % N` and an ingress pair
//! from `(rank-1) % N`. Listeners accept while the egress dials with
//! retries, so bring-up order does not matter. Transport failures are
//! fatal: the reader/writer threads close their queues and the node shuts
//! down through the `STOP` path.

use std::io::Write;
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use ringlm_protocol::DataFrame;

use crate::config::RingConfig;
use crate::error::{Result, RingError};
use crate::queue::SharedQueue;

/// How long the egress dials before bring-up fails
const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);
const CONNECT_RETRY: Duration = Duration::from_millis(200);

/// The four streams tying a node into the ring
pub struct RingTransport {
    /// Activations from the previous node
    pub data_in: TcpStream,
    /// Activations to the next node
    pub data_out: TcpStream,
    /// Control frames from the previous node
    pub signal_in: TcpStream,
    /// Control frames to the next node
    pub signal_out: TcpStream,
}

impl RingTransport {
    /// Wrap already-established streams (loopback rings in tests)
    pub fn new(
        data_in: TcpStream,
        data_out: TcpStream,
        signal_in: TcpStream,
        signal_out: TcpStream,
    ) -> Self {
        Self {
            data_in,
            data_out,
            signal_in,
            signal_out,
        }
    }

    /// Establish this node's links per the ring config.
    ///
    /// Listens for the previous node on the bind ports while dialling the
    /// next node; both sides retry until the ring closes or the timeout
    /// expires.
    pub fn connect(config: &RingConfig) -> Result<Self> {
        if !config.is_distributed() {
            return Err(RingError::BringUp(
                "single-node ring needs no transport".into(),
            ));
        }

        let data_listener = TcpListener::bind(config.data_bind_addr())?;
        let signal_listener = TcpListener::bind(config.signal_bind_addr())?;

        let accept = thread::spawn(move || -> Result<(TcpStream, TcpStream)> {
            let (data_in, _) = data_listener.accept()?;
            let (signal_in, _) = signal_listener.accept()?;
            Ok((data_in, signal_in))
        });

        let data_out = dial(&config.next_data_addr())?;
        let signal_out = dial(&config.next_signal_addr())?;

        let (data_in, signal_in) = accept
            .join()
            .map_err(|_| RingError::BringUp("accept thread panicked".into()))??;

        data_out.set_nodelay(true)?;
        signal_out.set_nodelay(true)?;

        tracing::info!(
            rank = config.rank,
            next = %config.next_node_ip,
            "ring links established"
        );

        Ok(Self::new(data_in, data_out, signal_in, signal_out))
    }
}

fn dial(addr: &str) -> Result<TcpStream> {
    let deadline = Instant::now() + CONNECT_TIMEOUT;
    loop {
        match TcpStream::connect(addr) {
            Ok(stream) => return Ok(stream),
            Err(e) if Instant::now() < deadline => {
                tracing::debug!(addr, error = %e, "dial failed, retrying");
                thread::sleep(CONNECT_RETRY);
            }
            Err(e) => {
                return Err(RingError::BringUp(format!(
                    "could not reach {addr} within {CONNECT_TIMEOUT:?}: {e}"
                )))
            }
        }
    }
}

/// Spawn the ingress reader: frames from the previous node into `queue`.
/// Closes the queue on transport failure or EOF.
pub fn spawn_data_reader(
    mut stream: TcpStream,
    queue: Arc<SharedQueue<DataFrame>>,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name("ring-data-in".into())
        .spawn(move || {
            loop {
                match DataFrame::read_from(&mut stream) {
                    Ok(frame) => {
                        if !queue.push(frame) {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "data ingress closed");
                        queue.close();
                        break;
                    }
                }
            }
        })
        .expect("spawn ring-data-in")
}

/// Spawn the egress writer: frames from `queue` to the next node, flushed
/// per frame so a dependent signal flush ordering holds. Closes the queue
/// on transport failure.
pub fn spawn_data_writer(
    mut stream: TcpStream,
    queue: Arc<SharedQueue<DataFrame>>,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name("ring-data-out".into())
        .spawn(move || {
            while let Some(frame) = queue.pop() {
                if let Err(e) = frame.write_to(&mut stream).and_then(|_| {
                    stream.flush()?;
                    Ok(())
                }) {
                    tracing::debug!(error = %e, "data egress closed");
                    queue.close();
                    break;
                }
            }
        })
        .expect("spawn ring-data-out")
}
