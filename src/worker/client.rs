//! Foreground side of the worker channel.

use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;

use anyhow::{Result, bail};
use log::debug;

use super::{ControllerSlot, WorkerEvent, controller_events, controller_version};
use crate::net::{Fetcher, Request, Response};
use crate::protocol::{Command, WorkerMessage, decode_command};

/// One foreground context (a reader window).
///
/// Worker messages addressed to this client arrive in its own inbox; other
/// clients never see them.
pub struct Client {
    id: u64,
    fetcher: ClientFetcher,
    inbox_tx: mpsc::Sender<WorkerMessage>,
    inbox: mpsc::Receiver<WorkerMessage>,
}

impl Client {
    pub(super) fn new(id: u64, controller: ControllerSlot, network: Arc<dyn Fetcher>) -> Self {
        let (inbox_tx, inbox) = mpsc::channel();
        Self {
            id,
            fetcher: ClientFetcher {
                controller,
                network,
            },
            inbox_tx,
            inbox,
        }
    }

    pub fn is_controlled(&self) -> bool {
        self.controller_version().is_some()
    }

    pub fn controller_version(&self) -> Option<String> {
        controller_version(&self.fetcher.controller)
    }

    /// Fetch through the controlling worker (or the network if none).
    pub fn fetch(&self, request: &Request) -> Result<Response> {
        self.fetcher.fetch(request)
    }

    /// A cloneable, thread-safe fetcher bound to this client's controller.
    pub fn fetcher(&self) -> ClientFetcher {
        self.fetcher.clone()
    }

    /// Post a command to the controlling worker.
    pub fn post(&self, command: Command) -> Result<()> {
        let Some(events) = controller_events(&self.fetcher.controller) else {
            bail!("no active worker to receive {command:?}");
        };
        debug!("client {}: posting {command:?}", self.id);
        events
            .send(WorkerEvent::Message {
                command,
                source: self.inbox_tx.clone(),
            })
            .map_err(|_| anyhow::anyhow!("worker stopped before receiving the command"))
    }

    /// Post a JSON-encoded command. Returns `Ok(false)` if the message is
    /// not a known command and was ignored.
    pub fn post_json(&self, text: &str) -> Result<bool> {
        match decode_command(text) {
            Some(command) => self.post(command).map(|()| true),
            None => {
                debug!("client {}: ignoring unknown message {text}", self.id);
                Ok(false)
            }
        }
    }

    pub fn try_recv(&self) -> Option<WorkerMessage> {
        self.inbox.try_recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<WorkerMessage> {
        self.inbox.recv_timeout(timeout).ok()
    }
}

/// Fetcher that routes through whichever worker controls the client at the
/// moment of each request.
#[derive(Clone)]
pub struct ClientFetcher {
    controller: ControllerSlot,
    network: Arc<dyn Fetcher>,
}

impl Fetcher for ClientFetcher {
    fn fetch(&self, request: &Request) -> Result<Response> {
        let Some(events) = controller_events(&self.controller) else {
            return self.network.fetch(request);
        };
        let (reply, response) = mpsc::channel();
        let event = WorkerEvent::Fetch {
            request: request.clone(),
            reply,
        };
        if events.send(event).is_err() {
            debug!("client: worker gone, fetching {} directly", request.url);
            return self.network.fetch(request);
        }
        response
            .recv()
            .map_err(|_| anyhow::anyhow!("worker dropped the request for {}", request.url))?
    }
}
