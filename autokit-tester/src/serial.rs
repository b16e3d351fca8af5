use std::path::Path;

use autokit_helper::retry::{RetryPolicy, with_retry};
use bytes::Bytes;
use futures::StreamExt;
use tokio::{io::AsyncRead, sync::broadcast, task::JoinHandle};
use tokio_serial::SerialPortBuilderExt;
use tokio_util::codec::{BytesCodec, FramedRead};

use crate::{Error, Result};

const CHANNEL_CAPACITY: usize = 256;

/// Output of the DUT serial console. Every handle sees the same data from the moment it was
/// created.
#[derive(Debug)]
pub struct DutSerial {
    rx: broadcast::Receiver<Bytes>,
}

impl DutSerial {
    /// Next chunk of output. `None` once the port has been closed.
    pub async fn recv(&mut self) -> Option<Bytes> {
        loop {
            match self.rx.recv().await {
                Ok(x) => return Some(x),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("DUT serial reader lagging, dropped {n} chunks");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Pumps a reader into a broadcast channel.
pub(crate) struct SerialBridge {
    tx: broadcast::Sender<Bytes>,
    task: JoinHandle<()>,
}

impl SerialBridge {
    pub(crate) fn new<R>(reader: R) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        let sender = tx.clone();

        let task = tokio::spawn(async move {
            let mut frames = FramedRead::new(reader, BytesCodec::new());
            while let Some(chunk) = frames.next().await {
                match chunk {
                    Ok(x) => {
                        let _ = sender.send(x.freeze());
                    }
                    Err(e) => {
                        tracing::warn!("DUT serial read failed: {e}");
                        break;
                    }
                }
            }
        });

        Self { tx, task }
    }

    pub(crate) fn subscribe(&self) -> DutSerial {
        DutSerial {
            rx: self.tx.subscribe(),
        }
    }
}

impl Drop for SerialBridge {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Open the DUT serial port. `None` if the device node never shows up.
pub(crate) async fn open(
    path: &Path,
    baud_rate: u32,
    policy: RetryPolicy,
) -> Result<Option<SerialBridge>> {
    let path = match with_retry(policy, || tokio::fs::canonicalize(path)).await {
        Ok(x) => x,
        Err(e) => {
            tracing::warn!("DUT serial {} is not available: {e}", path.display());
            return Ok(None);
        }
    };
    tracing::info!("DUT serial is enabled");

    let port = tokio_serial::new(path.to_string_lossy(), baud_rate)
        .open_native_async()
        .map_err(|e| Error::Transport(format!("{}: {e}", path.display())))?;
    tracing::info!("DUT serial is opened");

    Ok(Some(SerialBridge::new(port)))
}
