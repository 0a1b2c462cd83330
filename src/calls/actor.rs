//! Single task that owns the [`CallEngine`] and feeds it events in order.

use super::engine::{CallEngine, Command, Completion};
use crate::media::MediaEvent;
use callcore::net::TransportEvent;
use log::{info, warn};
use tokio::sync::mpsc;
use tokio::time::Instant;

pub(crate) struct CallActor {
    pub(crate) engine: CallEngine,
    pub(crate) commands: mpsc::Receiver<Command>,
    pub(crate) transport_events: Option<mpsc::Receiver<TransportEvent>>,
    pub(crate) completions: mpsc::UnboundedReceiver<Completion>,
    pub(crate) media_events: mpsc::UnboundedReceiver<(u64, MediaEvent)>,
}

impl CallActor {
    pub(crate) async fn run(mut self) {
        info!("Call engine started");
        loop {
            let deadline = self.engine.deadline();
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.engine.shutdown().await;
                        let _ = reply.send(Ok(()));
                        break;
                    }
                    Some(command) => self.engine.handle_command(command).await,
                    None => break,
                },
                event = recv_or_pending(&mut self.transport_events) => match event {
                    Some(event) => self.engine.handle_transport_event(event).await,
                    None => {
                        warn!("Signaling event stream closed");
                        self.transport_events = None;
                        self.engine.on_transport_closed().await;
                    }
                },
                Some(completion) = self.completions.recv() => {
                    self.engine.handle_completion(completion).await;
                }
                Some((generation, event)) = self.media_events.recv() => {
                    self.engine.handle_media_event(generation, event).await;
                }
                _ = sleep_until_deadline(deadline) => self.engine.on_deadline().await,
            }
        }
        self.engine.shutdown().await;
        info!("Call engine stopped");
    }
}

async fn recv_or_pending<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
