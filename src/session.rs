use crate::config::CallConfig;
use crate::controller::{Backends, CallEvent, CallSessionController};
use crate::error::{CallError, Result};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

enum Command {
    Join {
        room: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Leave {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a call running on its own event loop task.
///
/// Dropping the handle is the "unmount" path: the loop stops taking
/// commands, tears the call down and exits.
pub struct CallSession {
    commands: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

impl CallSession {
    pub fn spawn(config: CallConfig, backends: Backends) -> (Self, mpsc::UnboundedReceiver<CallEvent>) {
        let (controller, events) = CallSessionController::new(config, backends);
        let (commands, rx) = mpsc::channel(8);
        let task = tokio::spawn(run(controller, rx));
        (Self { commands, task }, events)
    }

    pub async fn join(&self, room: &str) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Join {
                room: room.to_owned(),
                reply,
            })
            .await
            .map_err(|_| stopped())?;
        response.await.map_err(|_| stopped())?
    }

    pub async fn leave(&self) {
        let (reply, response) = oneshot::channel();
        if self.commands.send(Command::Leave { reply }).await.is_ok() {
            let _ = response.await;
        }
    }

    /// Tears the call down and waits for the loop to finish.
    pub async fn shutdown(self) {
        let Self { commands, task } = self;
        drop(commands);
        if let Err(e) = task.await {
            log::error!("Session loop ended abnormally: {}", e);
        }
    }
}

fn stopped() -> CallError {
    CallError::SignalingDisconnected("session loop has stopped".to_owned())
}

async fn run(mut controller: CallSessionController, mut commands: mpsc::Receiver<Command>) {
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Join { room, reply }) => {
                    let result = controller.join(&room).await;
                    let _ = reply.send(result);
                }
                Some(Command::Leave { reply }) => {
                    controller.leave().await;
                    let _ = reply.send(());
                }
                None => break,
            },
            Some(event) = controller.next_event() => controller.handle(event).await,
        }
    }
    controller.leave().await;
    log::debug!("Session loop stopped");
}
