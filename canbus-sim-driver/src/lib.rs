//! A software-only `Adapter` implementation. It has no connection to
//! real hardware: `transmit` loops a frame back to the receive queue
//! only when the installed mode is `NoAck` (loopback), and frames
//! that arrive "from the bus" are injected by a test harness via
//! [`SimAdapter::inject_frame`]. This mirrors the reference control
//! system's pattern of backing a hardware-facing trait with a
//! software-only implementation for development (see
//! `drmem-db-simple`, the in-memory stand-in for the Redis backend).

use async_trait::async_trait;
use canbus_api::{
    Adapter, AdapterConfig, AlertBits, BusMode, DriverHandle, Error, Frame,
    ReceiveOutcome, Result,
};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

struct Inner {
    next_handle: u64,
    current: Option<(DriverHandle, BusMode)>,
    running: bool,
    bus_off: bool,
    rx_queue: VecDeque<Frame>,
    alert_queue: VecDeque<AlertBits>,
    fail_next_transmit: Option<Error>,
}

impl Default for Inner {
    fn default() -> Self {
        Inner {
            next_handle: 1,
            current: None,
            running: false,
            bus_off: false,
            rx_queue: VecDeque::new(),
            alert_queue: VecDeque::new(),
            fail_next_transmit: None,
        }
    }
}

/// An in-memory stand-in for the vendor CAN/TWAI driver.
pub struct SimAdapter {
    inner: Mutex<Inner>,
    rx_notify: Notify,
    alert_notify: Notify,
}

impl Default for SimAdapter {
    fn default() -> Self {
        SimAdapter {
            inner: Mutex::new(Inner::default()),
            rx_notify: Notify::new(),
            alert_notify: Notify::new(),
        }
    }
}

impl SimAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test/demo hook: simulate a frame arriving from another node on
    /// the bus. Ignored if the adapter isn't currently running.
    pub fn inject_frame(&self, frame: Frame) {
        let mut inner = self.inner.lock().unwrap();
        if inner.running {
            inner.rx_queue.push_back(frame);
            self.rx_notify.notify_waiters();
        }
    }

    /// Test/demo hook: force the next `transmit` call to fail with
    /// `err`, one time only.
    pub fn fail_next_transmit(&self, err: Error) {
        self.inner.lock().unwrap().fail_next_transmit = Some(err);
    }

    /// Test/demo hook: simulate the controller entering BUS_OFF (as
    /// would happen after excessive transmit errors on real
    /// hardware). Subsequent `transmit` calls return `Error::BusOff`
    /// until `initiate_recovery` is called.
    pub fn induce_bus_off(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.bus_off = true;
        inner.alert_queue.push_back(AlertBits(AlertBits::BUS_OFF));
        self.alert_notify.notify_waiters();
    }
}

#[async_trait]
impl Adapter for SimAdapter {
    async fn install(&self, cfg: AdapterConfig) -> Result<DriverHandle> {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_handle;
        inner.next_handle += 1;
        let handle = DriverHandle(id);
        inner.current = Some((handle, cfg.mode));
        debug!(?handle, mode = ?cfg.mode, "sim adapter installed");
        Ok(handle)
    }

    async fn start(&self, handle: DriverHandle) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner.current {
            Some((h, _)) if h == handle => {
                inner.running = true;
                Ok(())
            }
            _ => Err(Error::BusNotRunning),
        }
    }

    async fn stop(&self, handle: DriverHandle) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner.current {
            Some((h, _)) if h == handle => {
                inner.running = false;
                self.rx_notify.notify_waiters();
                Ok(())
            }
            _ => Err(Error::BusNotRunning),
        }
    }

    async fn uninstall(&self, handle: DriverHandle) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner.current {
            Some((h, _)) if h == handle => {
                inner.current = None;
                inner.running = false;
                inner.rx_queue.clear();
                drop(inner);
                self.rx_notify.notify_waiters();
                self.alert_notify.notify_waiters();
                Ok(())
            }
            _ => Err(Error::BusNotRunning),
        }
    }

    async fn transmit(
        &self,
        handle: DriverHandle,
        frame: Frame,
        _timeout: Duration,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let (h, mode) = inner.current.ok_or(Error::BusNotRunning)?;
        if h != handle || !inner.running {
            return Err(Error::BusNotRunning);
        }
        if let Some(err) = inner.fail_next_transmit.take() {
            return Err(err);
        }
        if inner.bus_off {
            return Err(Error::BusOff);
        }
        if mode == BusMode::NoAck {
            let mut looped = frame;
            looped.self_reception = true;
            inner.rx_queue.push_back(looped);
            self.rx_notify.notify_waiters();
        }
        inner.alert_queue.push_back(AlertBits(AlertBits::TX_SUCCESS));
        self.alert_notify.notify_waiters();
        Ok(())
    }

    async fn receive(
        &self,
        handle: DriverHandle,
        timeout: Duration,
    ) -> Result<ReceiveOutcome> {
        loop {
            {
                let mut inner = self.inner.lock().unwrap();
                match inner.current {
                    Some((h, _)) if h == handle => {}
                    _ => return Ok(ReceiveOutcome::InvalidState),
                }
                if !inner.running {
                    return Ok(ReceiveOutcome::InvalidState);
                }
                if let Some(frame) = inner.rx_queue.pop_front() {
                    return Ok(ReceiveOutcome::Frame(frame));
                }
            }

            let notified = self.rx_notify.notified();
            if tokio::time::timeout(timeout, notified).await.is_err() {
                return Ok(ReceiveOutcome::Timeout);
            }
        }
    }

    async fn read_alerts(
        &self,
        handle: DriverHandle,
        timeout: Duration,
    ) -> Result<AlertBits> {
        loop {
            {
                let mut inner = self.inner.lock().unwrap();
                match inner.current {
                    Some((h, _)) if h == handle => {}
                    _ => return Ok(AlertBits::default()),
                }
                if let Some(bits) = inner.alert_queue.pop_front() {
                    return Ok(bits);
                }
            }

            let notified = self.alert_notify.notified();
            if timeout == Duration::MAX {
                notified.await;
            } else if tokio::time::timeout(timeout, notified).await.is_err() {
                return Ok(AlertBits::default());
            }
        }
    }

    async fn initiate_recovery(&self, _handle: DriverHandle) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.bus_off = false;
        inner
            .alert_queue
            .push_back(AlertBits(AlertBits::BUS_RECOVERED));
        self.alert_notify.notify_waiters();
        Ok(())
    }
}
