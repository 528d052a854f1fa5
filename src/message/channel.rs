use std::sync::{Arc, Mutex};

use crossbeam_channel::{select, Receiver, Sender};
use log::{error, info};

use super::comm::Communicator;
use crate::error::{Error, Result};




/// A signal shared by every member of a group. Triggering it wakes every
/// receiver blocked on a channel of the group, which then fails with
/// `Error::Aborted`. The signal is a channel nobody ever sends on: dropping
/// its only sender disconnects it.
///
#[derive(Clone)]
pub struct Teardown {
    sender: Arc<Mutex<Option<Sender<()>>>>,
    receiver: Receiver<()>,
}

impl Default for Teardown {
    fn default() -> Self {
        let (sender, receiver) = crossbeam_channel::bounded(0);
        Self {
            sender: Arc::new(Mutex::new(Some(sender))),
            receiver,
        }
    }
}

impl Teardown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tear down the group. Triggering more than once is harmless.
    pub fn trigger(&self) {
        match self.sender.lock() {
            Ok(mut sender) => {
                if sender.take().is_some() {
                    info!("tearing down the partition group");
                }
            }
            Err(_) => error!("teardown signal lock poisoned"),
        }
    }

    pub fn is_triggered(&self) -> bool {
        matches!(self.receiver.try_recv(), Err(crossbeam_channel::TryRecvError::Disconnected))
    }
}




/// Creates in-process communicators. Every call to [`ChannelHost::plane`]
/// makes an independent set of mailboxes, one per rank; all planes of a host
/// share its teardown signal.
///
#[derive(Clone, Default)]
pub struct ChannelHost {
    teardown: Teardown,
}

impl ChannelHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn teardown(&self) -> &Teardown {
        &self.teardown
    }

    /// Return one connected communicator per rank.
    pub fn plane(&self, size: usize) -> Vec<ChannelComm> {
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..size).map(|_| crossbeam_channel::unbounded()).unzip();

        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, receiver)| ChannelComm {
                rank,
                senders: senders.clone(),
                receiver,
                teardown: self.teardown.clone(),
            })
            .collect()
    }
}




/// One rank's end of a channel plane. Messages between a pair of ranks are
/// delivered in the order they were sent.
///
pub struct ChannelComm {
    rank: usize,
    senders: Vec<Sender<Vec<u8>>>,
    receiver: Receiver<Vec<u8>>,
    teardown: Teardown,
}

impl Communicator for ChannelComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.senders.len()
    }

    fn send(&self, rank: usize, message: Vec<u8>) -> Result<()> {
        if self.teardown.is_triggered() {
            return Err(Error::Aborted { rank: self.rank });
        }
        self.senders
            .get(rank)
            .ok_or_else(|| Error::Channel(format!("[rank {}] no rank {} in the group", self.rank, rank)))?
            .send(message)
            .map_err(|_| Error::Channel(format!("[rank {}] mailbox of rank {} is gone", self.rank, rank)))
    }

    fn recv(&self) -> Result<Vec<u8>> {
        select! {
            recv(self.receiver) -> message => {
                message.map_err(|_| Error::Channel(format!("[rank {}] mailbox closed", self.rank)))
            }
            recv(self.teardown.receiver) -> _ => Err(Error::Aborted { rank: self.rank }),
        }
    }
}
