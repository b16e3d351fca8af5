//! Firmata transport to the HAT coprocessor.

mod codec;

pub use codec::{Command, FirmataCodec, Message, PinMode};

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{Mutex, mpsc, oneshot, watch},
    task::JoinHandle,
};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::{
    Error, Result,
    board::{Board, FirmwareVersion, Level},
};

/// Default baud rate of StandardFirmata.
pub const BAUD_RATE: u32 = 57600;

const PENDING_WRITE_MAX_CHECKS: usize = 5;
const PENDING_WRITE_CHECK_DELAY: Duration = Duration::from_millis(20);
const I2C_READ_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
enum LinkState {
    Connecting,
    Ready(FirmwareVersion),
    Failed(String),
}

type Replies = Arc<Mutex<HashMap<u8, VecDeque<oneshot::Sender<Vec<u8>>>>>>;

/// Outcome of writing one command, reported back by the writer task.
type WriteAck = oneshot::Receiver<std::result::Result<(), String>>;

struct Queued {
    cmd: Command,
    done: oneshot::Sender<std::result::Result<(), String>>,
}

/// [`Board`] speaking Firmata over any byte stream, usually the HAT serial port.
///
/// Two tasks own the stream: one writes queued commands, the other dispatches incoming
/// messages. Both are aborted on [`Board::close`] or drop.
pub struct Firmata {
    tx: mpsc::UnboundedSender<Queued>,
    pending: Arc<AtomicUsize>,
    state: watch::Receiver<LinkState>,
    replies: Replies,
    ports: [u8; 16],
    tasks: Vec<JoinHandle<()>>,
}

impl Firmata {
    /// Must be called from within a tokio runtime.
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(LinkState::Connecting);
        let pending = Arc::new(AtomicUsize::new(0));
        let replies = Replies::default();

        let tasks = vec![
            tokio::spawn(write_loop(
                FramedWrite::new(writer, FirmataCodec),
                rx,
                pending.clone(),
                state_tx.clone(),
            )),
            tokio::spawn(read_loop(
                FramedRead::new(reader, FirmataCodec),
                state_tx,
                replies.clone(),
            )),
        ];

        let firmata = Self {
            tx,
            pending,
            state,
            replies,
            ports: [0; 16],
            tasks,
        };

        // Boards that already booted will not report their version on their own.
        if let Err(e) = firmata.send(Command::QueryVersion) {
            tracing::warn!("Failed to query the Firmata version: {e}");
        }

        firmata
    }

    fn check_link(&self) -> Result<()> {
        match &*self.state.borrow() {
            LinkState::Failed(e) => Err(Error::Transport(e.clone())),
            _ => Ok(()),
        }
    }

    fn send(&self, cmd: Command) -> Result<WriteAck> {
        self.check_link()?;

        let (done, ack) = oneshot::channel();
        self.pending.fetch_add(1, Ordering::SeqCst);
        self.tx.send(Queued { cmd, done }).map_err(|_| {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            Error::Transport("Firmata link closed".to_string())
        })?;

        Ok(ack)
    }

    async fn flush_writes(&self) {
        for _ in 0..PENDING_WRITE_MAX_CHECKS {
            if self.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            tokio::time::sleep(PENDING_WRITE_CHECK_DELAY).await;
        }

        tracing::debug!(
            "{} Firmata writes still pending",
            self.pending.load(Ordering::SeqCst)
        );
    }

    /// Queue `cmd` and wait for the writer to report it written, for up to
    /// `PENDING_WRITE_MAX_CHECKS` checks. A write still queued after that is not an error, a
    /// failed one always is.
    async fn send_flushed(&self, cmd: Command) -> Result<()> {
        let mut ack = self.send(cmd)?;

        for _ in 0..PENDING_WRITE_MAX_CHECKS {
            match tokio::time::timeout(PENDING_WRITE_CHECK_DELAY, &mut ack).await {
                Ok(Ok(Ok(()))) => return Ok(()),
                Ok(Ok(Err(e))) => return Err(Error::Transport(e)),
                Ok(Err(_)) => return Err(Error::Transport("Firmata link closed".to_string())),
                Err(_) => {}
            }
        }

        tracing::debug!("Firmata write still pending");
        self.check_link()
    }
}

impl Drop for Firmata {
    fn drop(&mut self) {
        self.tasks.iter().for_each(JoinHandle::abort);
    }
}

impl Board for Firmata {
    async fn wait_ready(&mut self, timeout: Duration) -> Result<FirmwareVersion> {
        let mut state = self.state.clone();

        let res = tokio::time::timeout(
            timeout,
            state.wait_for(|s| !matches!(s, LinkState::Connecting)),
        )
        .await;

        let state = match res {
            Err(_) => return Err(Error::Timeout("Firmata connection")),
            Ok(Err(_)) => return Err(Error::Transport("Firmata link closed".to_string())),
            Ok(Ok(s)) => s.clone(),
        };

        match state {
            LinkState::Ready(v) => Ok(v),
            LinkState::Failed(e) => Err(Error::Transport(e)),
            LinkState::Connecting => Err(Error::Timeout("Firmata connection")),
        }
    }

    async fn pin_mode(&mut self, pin: u8, mode: PinMode) -> Result<()> {
        self.send_flushed(Command::PinMode { pin, mode }).await
    }

    async fn digital_write(&mut self, pin: u8, level: Level) -> Result<()> {
        let port = usize::from(pin / 8);
        let mask = 1 << (pin % 8);
        let value = self
            .ports
            .get_mut(port)
            .ok_or_else(|| Error::Transport(format!("Invalid pin {pin}")))?;

        match level {
            Level::High => *value |= mask,
            Level::Low => *value &= !mask,
        }
        let value = *value;

        tracing::debug!("write to pin {pin} = {level:?} -> started");
        self.send_flushed(Command::DigitalPort {
            port: port as u8,
            value,
        })
        .await?;
        tracing::debug!("write to pin {pin} = {level:?} -> done");

        Ok(())
    }

    async fn i2c_config(&mut self, delay_us: u16) -> Result<()> {
        self.send_flushed(Command::I2cConfig { delay_us }).await
    }

    async fn i2c_write(&mut self, addr: u8, data: &[u8]) -> Result<()> {
        tracing::debug!(
            "i2c write to address {addr:#04x}, {} bytes -> started",
            data.len()
        );
        self.send_flushed(Command::I2cWrite {
            addr,
            data: data.to_vec(),
        })
        .await?;
        tracing::debug!("i2c write to address {addr:#04x} -> done");

        Ok(())
    }

    async fn i2c_read_once(&mut self, addr: u8, register: u8, len: usize) -> Result<Vec<u8>> {
        let len = u16::try_from(len)
            .map_err(|_| Error::Transport(format!("I2C read of {len} bytes is too long")))?;
        let (tx, rx) = oneshot::channel();
        self.replies
            .lock()
            .await
            .entry(addr)
            .or_default()
            .push_back(tx);

        // The reply doubles as the write confirmation.
        let _ = self.send(Command::I2cReadOnce {
            addr,
            register,
            len,
        })?;

        match tokio::time::timeout(I2C_READ_TIMEOUT, rx).await {
            Err(_) => Err(Error::Timeout("I2C read")),
            Ok(Err(_)) => Err(Error::Transport("Firmata link closed".to_string())),
            Ok(Ok(data)) => Ok(data),
        }
    }

    async fn close(&mut self) -> Result<()> {
        tracing::info!("Closing the firmata transport...");
        self.flush_writes().await;
        self.tasks.drain(..).for_each(|t| t.abort());
        Ok(())
    }
}

async fn write_loop<W>(
    mut sink: FramedWrite<W, FirmataCodec>,
    mut rx: mpsc::UnboundedReceiver<Queued>,
    pending: Arc<AtomicUsize>,
    state: watch::Sender<LinkState>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(Queued { cmd, done }) = rx.recv().await {
        let res = sink.send(cmd).await;
        pending.fetch_sub(1, Ordering::SeqCst);

        match res {
            Ok(()) => {
                let _ = done.send(Ok(()));
            }
            Err(e) => {
                tracing::error!("Firmata write failed: {e}");
                state.send_replace(LinkState::Failed(e.to_string()));
                let _ = done.send(Err(e.to_string()));
                // Dropping `rx` fails every command still queued.
                return;
            }
        }
    }
}

async fn read_loop<R>(
    mut stream: FramedRead<R, FirmataCodec>,
    state: watch::Sender<LinkState>,
    replies: Replies,
) where
    R: AsyncRead + Unpin,
{
    let reason = loop {
        match stream.next().await {
            Some(Ok(Message::Version { major, minor })) => {
                tracing::debug!("Firmata version {major}.{minor}");
                state.send_replace(LinkState::Ready(FirmwareVersion { major, minor }));
            }
            Some(Ok(Message::I2cReply { addr, data, .. })) => {
                let mut replies = replies.lock().await;
                let queue = replies.entry(addr).or_default();
                // Waiters that timed out are skipped.
                while let Some(waiter) = queue.pop_front() {
                    if !waiter.is_closed() {
                        let _ = waiter.send(data);
                        break;
                    }
                }
            }
            Some(Ok(Message::String(msg))) => tracing::info!("coprocessor: {msg}"),
            Some(Err(e)) => break e.to_string(),
            None => break "Firmata transport closed".to_string(),
        }
    };

    tracing::warn!("Firmata link lost: {reason}");
    state.send_replace(LinkState::Failed(reason));
    replies.lock().await.clear();
}

#[cfg(test)]
mod tests {
    use std::{
        io,
        pin::Pin,
        task::{Context, Poll},
        time::Duration,
    };

    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};

    use super::Firmata;
    use crate::{
        Error,
        board::{Board, FirmwareVersion, Level},
    };

    async fn read_exact<const N: usize>(fw: &mut DuplexStream) -> [u8; N] {
        let mut buf = [0u8; N];
        fw.read_exact(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn handshake_and_writes() {
        let (host, mut fw) = tokio::io::duplex(256);
        let mut board = Firmata::new(host);

        // Version query
        assert_eq!(read_exact::<1>(&mut fw).await, [0xF9]);
        fw.write_all(&[0xF9, 2, 5]).await.unwrap();

        assert_eq!(
            board.wait_ready(Duration::from_secs(5)).await.unwrap(),
            FirmwareVersion { major: 2, minor: 5 }
        );

        board.digital_write(14, Level::High).await.unwrap();
        assert_eq!(read_exact::<3>(&mut fw).await, [0x91, 0x40, 0x00]);

        board.digital_write(13, Level::High).await.unwrap();
        assert_eq!(read_exact::<3>(&mut fw).await, [0x91, 0x60, 0x00]);

        board.digital_write(14, Level::Low).await.unwrap();
        assert_eq!(read_exact::<3>(&mut fw).await, [0x91, 0x20, 0x00]);
    }

    #[tokio::test]
    async fn i2c_read_reply() {
        let (host, mut fw) = tokio::io::duplex(256);
        let mut board = Firmata::new(host);
        let _ = read_exact::<1>(&mut fw).await;

        let firmware = tokio::spawn(async move {
            let req = read_exact::<9>(&mut fw).await;
            assert_eq!(req, [0xF0, 0x76, 0x40, 0x08, 0x02, 0x00, 0x02, 0x00, 0xF7]);
            fw.write_all(&[0xF0, 0x77, 0x40, 0x00, 0x02, 0x00, 0x10, 0x00, 0x00, 0x00, 0xF7])
                .await
                .unwrap();
            fw
        });

        let data = board.i2c_read_once(0x40, 0x02, 2).await.unwrap();
        assert_eq!(data, [0x10, 0x00]);
        firmware.await.unwrap();
    }

    #[tokio::test]
    async fn ready_timeout() {
        let (host, _fw) = tokio::io::duplex(256);
        let mut board = Firmata::new(host);

        let res = board.wait_ready(Duration::from_millis(20)).await;
        assert!(matches!(res, Err(Error::Timeout(_))));
    }

    #[tokio::test]
    async fn closed_transport() {
        let (host, fw) = tokio::io::duplex(256);
        let mut board = Firmata::new(host);
        drop(fw);

        let res = board.wait_ready(Duration::from_secs(5)).await;
        assert!(matches!(res, Err(Error::Transport(_))));
        assert!(board.digital_write(0, Level::Low).await.is_err());
    }

    /// Silent on the read side, accepts `ok_writes` writes and fails every one after that.
    struct BreakingLink {
        ok_writes: usize,
    }

    impl AsyncRead for BreakingLink {
        fn poll_read(
            self: Pin<&mut Self>,
            _: &mut Context<'_>,
            _: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Pending
        }
    }

    impl AsyncWrite for BreakingLink {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            if self.ok_writes == 0 {
                return Poll::Ready(Err(io::Error::from(io::ErrorKind::BrokenPipe)));
            }
            self.ok_writes -= 1;
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn failed_write_is_reported() {
        // The version query goes through, the first pin write does not.
        let mut board = Firmata::new(BreakingLink { ok_writes: 1 });

        let res = board.digital_write(14, Level::High).await;
        assert!(matches!(res, Err(Error::Transport(_))), "{res:?}");

        let res = board.digital_write(13, Level::High).await;
        assert!(matches!(res, Err(Error::Transport(_))), "{res:?}");
    }
}
