//! In-memory transport used by the unit tests.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    domain::ClientId,
    errors::Error,
    ports::{Notification, QueryParams, QueryRecord, QueryResponse, QueryTransport},
    Result,
};

pub(crate) struct FakeTransport {
    requests: Mutex<Vec<(String, QueryParams)>>,
    responses: Mutex<HashMap<String, QueryRecord>>,
    failures: Mutex<HashMap<String, String>>,
    groups: Mutex<HashMap<ClientId, String>>,
    sender: Mutex<Option<mpsc::UnboundedSender<Notification>>>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Notification>>>,
    closed: AtomicBool,
}

impl FakeTransport {
    /// A transport whose `whoami` answers with `own_id`.
    pub(crate) fn new(own_id: u32) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let fake = Self {
            requests: Mutex::new(Vec::new()),
            responses: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            groups: Mutex::new(HashMap::new()),
            sender: Mutex::new(Some(tx)),
            receiver: Mutex::new(Some(rx)),
            closed: AtomicBool::new(false),
        };
        fake.respond("whoami", &[("client_id", own_id.to_string().as_str())]);
        fake
    }

    pub(crate) fn respond(&self, command: &str, record: &[(&str, &str)]) {
        let record = record
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.responses
            .lock()
            .unwrap()
            .insert(command.to_string(), record);
    }

    pub(crate) fn fail(&self, command: &str, message: &str) {
        self.failures
            .lock()
            .unwrap()
            .insert(command.to_string(), message.to_string());
    }

    /// Server groups reported by `clientinfo` for `client`.
    pub(crate) fn set_groups(&self, client: u32, groups: &str) {
        self.groups
            .lock()
            .unwrap()
            .insert(ClientId(client), groups.to_string());
    }

    pub(crate) fn emit(&self, notification: Notification) {
        if let Some(tx) = self.sender.lock().unwrap().as_ref() {
            tx.send(notification).unwrap();
        }
    }

    /// Drop the sender so the notification stream ends.
    pub(crate) fn end_notifications(&self) {
        self.sender.lock().unwrap().take();
    }

    pub(crate) fn commands(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|(c, _)| c.clone())
            .collect()
    }

    pub(crate) fn requests_for(&self, command: &str) -> Vec<QueryParams> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| c == command)
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QueryTransport for FakeTransport {
    async fn request(
        &self,
        command: &str,
        params: QueryParams,
        _fields: &[&str],
    ) -> Result<QueryResponse> {
        self.requests
            .lock()
            .unwrap()
            .push((command.to_string(), params.clone()));

        if let Some(msg) = self.failures.lock().unwrap().get(command) {
            return Err(Error::Transport(msg.clone()));
        }

        if command == "clientinfo" {
            let client: ClientId = params
                .get("clid")
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| Error::Transport("missing clid".to_string()))?;
            let groups = self.groups.lock().unwrap().get(&client).cloned();
            return match groups {
                Some(g) => {
                    let mut record = QueryRecord::new();
                    record.insert("client_servergroups".to_string(), g);
                    Ok(QueryResponse::single(record))
                }
                None => Err(Error::Transport("invalid clientID".to_string())),
            };
        }

        Ok(self
            .responses
            .lock()
            .unwrap()
            .get(command)
            .cloned()
            .map(QueryResponse::single)
            .unwrap_or_default())
    }

    fn take_notifications(&self) -> Option<mpsc::UnboundedReceiver<Notification>> {
        self.receiver.lock().unwrap().take()
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
