use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy)]
pub enum ShutdownEvent {
    /// First interrupt: ask the user, stop between tasks if confirmed.
    Graceful,
    /// Second interrupt: stop without waiting for confirmation.
    Immediate,
}

pub fn spawn_ctrl_c_handler(tx: mpsc::UnboundedSender<ShutdownEvent>) {
    tokio::spawn(async move {
        let mut interrupts = 0u32;
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            interrupts += 1;
            let event = if interrupts == 1 {
                ShutdownEvent::Graceful
            } else {
                ShutdownEvent::Immediate
            };
            if tx.send(event).is_err() || interrupts > 1 {
                return;
            }
        }
    });
}
