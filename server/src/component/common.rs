//! Component plumbing: input ports, close reasons, start/run lifecycle.

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

use arena_core::error::Error;

use crate::frame::EventFrame;

/// Why a component stopped.
#[derive(Debug, Clone)]
pub enum CloseReason {
    Complete,
    Fault(Error),
}

#[derive(Debug, Clone, Default)]
pub struct ComponentEnv {
    pub log_prefix: String,
}

impl ComponentEnv {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            log_prefix: prefix.into(),
        }
    }
}

/// The receiving end owned by a running component.
pub struct ConsumerPorts {
    rx: mpsc::Receiver<EventFrame>,
}

impl ConsumerPorts {
    pub async fn recv(&mut self) -> Option<EventFrame> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<EventFrame> {
        self.rx.try_recv().ok()
    }
}

/// The sending half kept by whoever started the component.
pub struct PortsHandle {
    input_tx: mpsc::Sender<EventFrame>,
    close_rx: Option<oneshot::Receiver<CloseReason>>,
}

impl PortsHandle {
    pub async fn send(&self, frame: EventFrame) {
        if let Err(e) = self.input_tx.send(frame).await {
            warn!("Failed to send frame to component: {}", e);
        }
    }

    pub fn try_send(&self, frame: EventFrame) -> bool {
        self.input_tx.try_send(frame).is_ok()
    }

    pub fn sender(&self) -> mpsc::Sender<EventFrame> {
        self.input_tx.clone()
    }

    /// Wait for the component to stop.  Panics when waited twice.
    pub async fn wait(&mut self) -> CloseReason {
        let rx = self
            .close_rx
            .take()
            .expect("component already waited on");
        rx.await.unwrap_or(CloseReason::Complete)
    }
}

#[async_trait]
pub trait Component<C>
where
    C: Send + 'static,
{
    fn name() -> &'static str;

    fn start(ctx: C, env: ComponentEnv) -> PortsHandle
    where
        Self: Sized,
    {
        info!("{} Starting component: {}", env.log_prefix, Self::name());
        let (input_tx, input_rx) = mpsc::channel(32);
        let (close_tx, close_rx) = oneshot::channel();
        let ports = ConsumerPorts { rx: input_rx };
        tokio::spawn(async move {
            let reason = Self::run(ports, ctx, env).await;
            if let CloseReason::Fault(ref e) = reason {
                error!("Component {} faulted: {}", Self::name(), e);
            }
            let _ = close_tx.send(reason);
        });
        PortsHandle {
            input_tx,
            close_rx: Some(close_rx),
        }
    }

    async fn run(ports: ConsumerPorts, ctx: C, env: ComponentEnv) -> CloseReason;
}
