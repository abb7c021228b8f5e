//! Engine-to-listener notifications.
//!
//! Listeners subscribe with an opaque target token and receive every
//! posted tag on their own channel, so the engine never calls back into
//! presentation code from its worker threads.

use crate::mmc::MmcCommand;
use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use log::warn;
use std::sync::{Mutex, PoisonError};

const LISTENER_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum NotifyTag {
    /// Inbound MMC command on the control bus
    Mmc(MmcCommand),
    /// A configured connection could not be established
    ConnectFailed { bus: String, endpoint: String },
    /// The transport position jumped (loop, locate)
    Relocated { frame: u64 },
    /// Queue position re-synchronised against the audio clock
    DriftCorrected { frames: i64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub target: u64,
    pub tag: NotifyTag,
}

#[derive(Debug, Default)]
pub struct Notifier {
    listeners: Mutex<Vec<(u64, Sender<Notification>)>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, target: u64) -> Receiver<Notification> {
        let (tx, rx) = bounded(LISTENER_CAPACITY);
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((target, tx));
        rx
    }

    /// Delivers `tag` to every listener; gone listeners are forgotten and
    /// full ones miss this notification.
    pub fn post(&self, tag: NotifyTag) {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        listeners.retain(|(target, tx)| {
            match tx.try_send(Notification {
                target: *target,
                tag: tag.clone(),
            }) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    warn!("Notification listener {} is full, dropping {:?}", target, tag);
                    true
                }
                Err(TrySendError::Disconnected(_)) => false,
            }
        });
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
