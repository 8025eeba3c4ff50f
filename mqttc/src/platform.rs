//! Platform services used by the protocol engine.
//!
//! The engine never touches sockets, tasks or timers directly. It goes
//! through [`Platform`], whose default methods run on tokio. Implementors
//! usually only provide [`Platform::connect`].

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::{Error, Result};

/// Byte stream to the broker.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Boxed transport returned by [`Platform::connect`].
pub type BoxStream = Box<dyn Transport>;

/// Periodic timer callback.
pub type TimerCallback = Box<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// I/O, concurrency and timer services.
#[async_trait]
pub trait Platform: Send + Sync {
    /// Resolves a hostname to a socket address.
    async fn resolve_host(&self, host: &str, port: u16) -> Result<SocketAddr> {
        let mut addrs = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| Error::HostNotFound(format!("{}: {}", host, e)))?;
        addrs
            .next()
            .ok_or_else(|| Error::HostNotFound(host.to_string()))
    }

    /// Opens a byte stream to the broker.
    async fn connect(&self, host: &str, port: u16) -> Result<BoxStream>;

    /// Runs `task` in the background.
    fn run_task(&self, task: BoxFuture<'static, ()>) -> TaskHandle {
        TaskHandle(tokio::spawn(task))
    }

    /// Calls `callback` every `interval`, first after one interval.
    fn create_timer(&self, interval: Duration, callback: TimerCallback) -> TimerHandle {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                callback().await;
            }
        });
        TimerHandle(handle)
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Handle to a background task.
#[derive(Debug)]
pub struct TaskHandle(JoinHandle<()>);

impl TaskHandle {
    /// Requests cancellation at the task's next suspension point.
    pub fn abort(&self) {
        self.0.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.0.is_finished()
    }

    /// Waits for the task to end. A cancelled task joins cleanly.
    pub async fn join(self) -> Result<()> {
        match self.0.await {
            Ok(()) => Ok(()),
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => Err(Error::Io(e.into())),
        }
    }
}

/// Handle to a periodic timer. The timer stops when the handle is dropped.
#[derive(Debug)]
pub struct TimerHandle(JoinHandle<()>);

impl TimerHandle {
    pub fn destroy(self) {}
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Platform backed by tokio TCP.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioPlatform;

#[async_trait]
impl Platform for TokioPlatform {
    async fn connect(&self, host: &str, port: u16) -> Result<BoxStream> {
        let addr = self.resolve_host(host, port).await?;
        let stream = TcpStream::connect(addr).await.map_err(Error::transport)?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}
