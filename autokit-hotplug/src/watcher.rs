use std::{sync::Arc, time::Duration};

use autokit_helper::retry::with_timeout;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{Adapter, Node, ScanError};

const EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Attach(Node),
    Detach(Node),
    Error(ScanError),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WaitError {
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error("Cancelled while waiting for device")]
    Cancelled,
    #[error("Device watcher stopped")]
    Closed,
}

/// Consumer side of a device scanner.
///
/// Each watcher is meant to be owned by a single wait sequence. Events that arrive while nobody
/// is waiting stay queued and are seen by the next wait.
pub struct Watcher {
    rx: mpsc::Receiver<Event>,
    stop: CancellationToken,
}

impl Watcher {
    /// Start polling `adapters` every `interval`. Must be called from within a tokio runtime.
    pub fn start(adapters: Vec<Box<dyn Adapter>>, interval: Duration) -> Self {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let stop = CancellationToken::new();

        tokio::spawn(scan_loop(adapters.into(), interval, tx, stop.clone()));

        Self { rx, stop }
    }

    /// Watcher fed by some other producer. Mostly useful to script events.
    pub fn from_channel(rx: mpsc::Receiver<Event>) -> Self {
        Self {
            rx,
            stop: CancellationToken::new(),
        }
    }

    /// Wait for the first attached node satisfying `pred`. `None` waits forever.
    pub async fn wait_for_attach<P>(
        &mut self,
        pred: P,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<Node, WaitError>
    where
        P: Fn(&Node) -> bool,
    {
        self.wait(timeout, cancel, |ev| match ev {
            Event::Attach(n) if pred(&n) => Some(n),
            _ => None,
        })
        .await
    }

    /// Wait for `node` to go away. `None` waits forever.
    pub async fn wait_for_detach(
        &mut self,
        node: &Node,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<(), WaitError> {
        self.wait(timeout, cancel, |ev| match ev {
            Event::Detach(n) if &n == node => Some(()),
            _ => None,
        })
        .await
    }

    async fn wait<T>(
        &mut self,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
        mut f: impl FnMut(Event) -> Option<T>,
    ) -> Result<T, WaitError> {
        let rx = &mut self.rx;
        let next = async move {
            loop {
                match rx.recv().await {
                    None => return Err(WaitError::Closed),
                    Some(Event::Error(e)) => return Err(WaitError::Scan(e)),
                    Some(ev) => {
                        if let Some(x) = f(ev) {
                            return Ok(x);
                        }
                    }
                }
            }
        };

        let bounded = async move {
            match timeout {
                Some(t) => match with_timeout(t, |_| next).await {
                    Ok(res) => res,
                    Err(e) => Err(WaitError::Timeout(e.0)),
                },
                None => next.await,
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(WaitError::Cancelled),
            res = bounded => res,
        }
    }

    /// Stop the scanner. Later waits drain what is already queued, then fail with
    /// [`WaitError::Closed`].
    pub fn stop(&mut self) {
        self.stop.cancel();
        self.rx.close();
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

async fn scan_loop(
    adapters: Arc<[Box<dyn Adapter>]>,
    interval: Duration,
    tx: mpsc::Sender<Event>,
    stop: CancellationToken,
) {
    let mut known: Vec<Node> = Vec::new();

    loop {
        let a = adapters.clone();
        let scan = tokio::task::spawn_blocking(move || scan_all(&a));

        let res = tokio::select! {
            _ = stop.cancelled() => return,
            res = scan => res,
        };

        let events = match res {
            Ok(Ok(current)) => {
                let events = diff(&known, &current);
                known = current;
                events
            }
            Ok(Err(e)) => vec![Event::Error(e)],
            Err(e) => vec![Event::Error(ScanError(format!("scan task failed: {e}")))],
        };

        for ev in events {
            tracing::debug!("Hotplug: {ev:?}");
            tokio::select! {
                _ = stop.cancelled() => return,
                res = tx.send(ev) => {
                    if res.is_err() {
                        return;
                    }
                }
            }
        }

        tokio::select! {
            _ = stop.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

fn scan_all(adapters: &[Box<dyn Adapter>]) -> Result<Vec<Node>, ScanError> {
    let mut res = Vec::new();
    for a in adapters {
        res.extend(a.scan()?);
    }
    Ok(res)
}

fn diff(known: &[Node], current: &[Node]) -> Vec<Event> {
    known
        .iter()
        .filter(|x| !current.contains(x))
        .cloned()
        .map(Event::Detach)
        .chain(
            current
                .iter()
                .filter(|x| !known.contains(x))
                .cloned()
                .map(Event::Attach),
        )
        .collect()
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        path::PathBuf,
        sync::{Arc, Mutex},
        time::Duration,
    };

    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use super::{Event, WaitError, Watcher, diff};
    use crate::{Adapter, BlockDevice, COMPUTE_MODULE, Node, ScanError, UsbBootDrive};

    const TICK: Duration = Duration::from_millis(5);

    fn raw() -> Node {
        Node::UsbBoot(UsbBootDrive {
            bus: 1,
            port: 3,
            vendor_id: 0x0a5c,
            product_id: 0x2711,
        })
    }

    fn cm() -> Node {
        Node::Block(BlockDevice {
            path: PathBuf::from("/dev/sdb"),
            description: COMPUTE_MODULE.to_string(),
            size: 8 * 1024 * 1024 * 1024,
        })
    }

    fn is_cm(n: &Node) -> bool {
        n.as_block().is_some_and(|x| x.description == COMPUTE_MODULE)
    }

    /// Returns the scripted snapshots in order, then keeps repeating the last one.
    struct Scripted {
        snapshots: Mutex<VecDeque<Result<Vec<Node>, ScanError>>>,
        last: Mutex<Vec<Node>>,
        scans: Arc<Mutex<usize>>,
    }

    impl Scripted {
        fn new(snapshots: Vec<Result<Vec<Node>, ScanError>>) -> Self {
            Self {
                snapshots: Mutex::new(snapshots.into()),
                last: Mutex::new(Vec::new()),
                scans: Arc::new(Mutex::new(0)),
            }
        }
    }

    impl Adapter for Scripted {
        fn scan(&self) -> Result<Vec<Node>, ScanError> {
            *self.scans.lock().unwrap() += 1;
            match self.snapshots.lock().unwrap().pop_front() {
                Some(Ok(x)) => {
                    *self.last.lock().unwrap() = x.clone();
                    Ok(x)
                }
                Some(Err(e)) => Err(e),
                None => Ok(self.last.lock().unwrap().clone()),
            }
        }
    }

    #[test]
    fn snapshot_diff() {
        let events = diff(&[raw()], &[cm()]);
        assert_eq!(events, [Event::Detach(raw()), Event::Attach(cm())]);
        assert!(diff(&[cm()], &[cm()]).is_empty());
    }

    #[tokio::test]
    async fn boot_mode_sequence() {
        let adapter = Scripted::new(vec![
            Ok(vec![]),
            Ok(vec![raw()]),
            Ok(vec![]),
            Ok(vec![]),
            Ok(vec![cm()]),
        ]);
        let mut watcher = Watcher::start(vec![Box::new(adapter)], TICK);
        let cancel = CancellationToken::new();

        let node = watcher
            .wait_for_attach(Node::is_usb_boot, None, &cancel)
            .await
            .unwrap();
        assert_eq!(node, raw());

        watcher.wait_for_detach(&node, None, &cancel).await.unwrap();

        let node = watcher
            .wait_for_attach(is_cm, Some(Duration::from_secs(5)), &cancel)
            .await
            .unwrap();
        assert_eq!(node, cm());

        watcher.stop();
    }

    #[tokio::test]
    async fn present_devices_attach_on_first_scan() {
        let adapter = Scripted::new(vec![Ok(vec![cm()])]);
        let mut watcher = Watcher::start(vec![Box::new(adapter)], TICK);

        let node = watcher
            .wait_for_attach(is_cm, Some(Duration::from_secs(5)), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(node, cm());
    }

    #[tokio::test]
    async fn attach_timeout() {
        let (tx, rx) = mpsc::channel(4);
        let mut watcher = Watcher::from_channel(rx);

        tx.send(Event::Attach(raw())).await.unwrap();

        let res = watcher
            .wait_for_attach(is_cm, Some(Duration::from_millis(20)), &CancellationToken::new())
            .await;
        assert_eq!(res, Err(WaitError::Timeout(Duration::from_millis(20))));
    }

    #[tokio::test]
    async fn scan_error_ends_wait() {
        let adapter = Scripted::new(vec![Ok(vec![]), Err(ScanError("boom".to_string()))]);
        let mut watcher = Watcher::start(vec![Box::new(adapter)], TICK);

        let res = watcher
            .wait_for_attach(is_cm, Some(Duration::from_secs(5)), &CancellationToken::new())
            .await;
        assert_eq!(res, Err(WaitError::Scan(ScanError("boom".to_string()))));
    }

    #[tokio::test]
    async fn cancelled_wait() {
        let (_tx, rx) = mpsc::channel(4);
        let mut watcher = Watcher::from_channel(rx);
        let cancel = CancellationToken::new();

        let c = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            c.cancel();
        });

        let res = watcher.wait_for_detach(&raw(), None, &cancel).await;
        assert_eq!(res, Err(WaitError::Cancelled));
    }

    #[tokio::test]
    async fn stopped_watcher_is_closed() {
        let adapter = Scripted::new(vec![Ok(vec![])]);
        let scans = adapter.scans.clone();
        let mut watcher = Watcher::start(vec![Box::new(adapter)], TICK);

        watcher.stop();
        let res = watcher
            .wait_for_attach(is_cm, None, &CancellationToken::new())
            .await;
        assert_eq!(res, Err(WaitError::Closed));

        let count = *scans.lock().unwrap();
        tokio::time::sleep(TICK * 10).await;
        assert!(*scans.lock().unwrap() <= count + 1);
    }
}
