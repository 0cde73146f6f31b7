//! Query session: the startup handshake and the operations actions can use.
//!
//! `start()` walks the handshake one request at a time:
//! login, `use`, nickname, `whoami`, join channel, register notifications.
//! Any failure aborts startup. Afterwards the guard worker and the keep-alive
//! run as background tasks owned by the returned [`BotHandle`].

use std::{
    collections::BTreeSet,
    sync::{Arc, Mutex, OnceLock, PoisonError},
};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::BotConfig,
    domain::{ChannelId, ClientId, ServerGroupId},
    errors::Error,
    guard, keepalive,
    ports::{QueryParams, QueryResponse, QueryTransport},
    Result,
};

/// Reason id for "kicked from channel".
pub const KICK_REASON_CHANNEL: u32 = 4;
/// Target mode for private text messages.
pub const TEXT_TARGET_CLIENT: u32 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    LoggedIn,
    ServerSelected,
    NameSet,
    IdentityKnown,
    ChannelJoined,
    EventsRegistered,
    Running,
    Stopped,
}

pub struct Session {
    cfg: BotConfig,
    transport: Arc<dyn QueryTransport>,
    state: Mutex<SessionState>,
    own_id: OnceLock<ClientId>,
}

impl Session {
    pub fn new(cfg: BotConfig, transport: Arc<dyn QueryTransport>) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            transport,
            state: Mutex::new(SessionState::Disconnected),
            own_id: OnceLock::new(),
        })
    }

    pub fn config(&self) -> &BotConfig {
        &self.cfg
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The bot's own client id, known once the handshake passed `whoami`.
    pub fn own_client_id(&self) -> Option<ClientId> {
        self.own_id.get().copied()
    }

    fn set_state(&self, next: SessionState) {
        let mut st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        debug!(from = ?*st, to = ?next, "session state");
        *st = next;
    }

    /// Run the handshake and start the guard and keep-alive tasks.
    pub async fn start(self: &Arc<Self>) -> Result<BotHandle> {
        {
            let st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *st != SessionState::Disconnected {
                return Err(Error::InvalidState(format!(
                    "start() called in state {:?}",
                    *st
                )));
            }
        }
        let notifications = self.transport.take_notifications().ok_or_else(|| {
            Error::InvalidState("notification stream already taken".to_string())
        })?;

        let creds = self.cfg.credentials();
        let conn = self.cfg.connection();
        info!(
            address = %conn.address,
            query_port = conn.query_port,
            server_port = conn.server_port,
            "starting query session"
        );

        self.call(
            "login",
            QueryParams::new()
                .with("client_login_name", &creds.username)
                .with("client_login_password", &creds.password),
            &[],
        )
        .await
        .map_err(|e| Error::Auth(e.to_string()))?;
        self.set_state(SessionState::LoggedIn);

        self.call("use", QueryParams::new().with("port", conn.server_port), &[])
            .await
            .map_err(|e| Error::ServerSelect(e.to_string()))?;
        self.set_state(SessionState::ServerSelected);

        self.call(
            "clientupdate",
            QueryParams::new().with("client_nickname", &creds.bot_name),
            &[],
        )
        .await
        .map_err(|e| Error::Name(e.to_string()))?;
        self.set_state(SessionState::NameSet);

        let me = self.whoami().await?;
        // start() only runs from Disconnected, so the cell is still empty.
        let _ = self.own_id.set(me);
        self.set_state(SessionState::IdentityKnown);
        info!(client = %me, "identity known");

        self.join_channel(self.cfg.channel(), None, self.cfg.channel_password())
            .await?;
        self.set_state(SessionState::ChannelJoined);

        self.call(
            "servernotifyregister",
            QueryParams::new()
                .with("event", "channel")
                .with("id", self.cfg.channel()),
            &[],
        )
        .await?;
        self.set_state(SessionState::EventsRegistered);

        let cancel = CancellationToken::new();
        let keepalive = keepalive::spawn(
            self.transport.clone(),
            self.cfg.keepalive_interval(),
            cancel.child_token(),
        );
        let worker = guard::spawn(self.clone(), notifications, cancel.child_token());
        self.set_state(SessionState::Running);
        info!(channel = %self.cfg.channel(), "guarding channel");

        Ok(BotHandle {
            session: self.clone(),
            cancel,
            worker,
            keepalive,
        })
    }

    async fn call(
        &self,
        command: &str,
        params: QueryParams,
        fields: &[&str],
    ) -> Result<QueryResponse> {
        debug!(command, "query request");
        self.transport.request(command, params, fields).await
    }

    async fn whoami(&self) -> Result<ClientId> {
        let resp = self.call("whoami", QueryParams::new(), &["client_id"]).await?;
        let raw = resp
            .field("client_id")
            .ok_or_else(|| Error::Protocol("whoami response has no client_id".to_string()))?;
        raw.parse()
            .map_err(|_| Error::Protocol(format!("whoami returned invalid client_id `{raw}`")))
    }

    pub async fn send_poke(&self, client: ClientId, message: &str) -> Result<()> {
        self.call(
            "clientpoke",
            QueryParams::new().with("clid", client).with("msg", message),
            &[],
        )
        .await?;
        Ok(())
    }

    pub async fn send_message(&self, client: ClientId, message: &str) -> Result<()> {
        self.call(
            "sendtextmessage",
            QueryParams::new()
                .with("targetmode", TEXT_TARGET_CLIENT)
                .with("target", client)
                .with("msg", message),
            &[],
        )
        .await?;
        Ok(())
    }

    pub async fn kick_client(&self, client: ClientId, reason: &str) -> Result<()> {
        self.call(
            "clientkick",
            QueryParams::new()
                .with("clid", client)
                .with("reasonid", KICK_REASON_CHANNEL)
                .with("reasonmsg", reason),
            &[],
        )
        .await?;
        Ok(())
    }

    /// Move `client` (default: the bot itself) into `channel`.
    ///
    /// `None` sends no password field at all; `Some("")` sends an empty one.
    pub async fn join_channel(
        &self,
        channel: ChannelId,
        client: Option<ClientId>,
        password: Option<&str>,
    ) -> Result<()> {
        let client = match client {
            Some(c) => c,
            None => self.own_client_id().ok_or_else(|| {
                Error::InvalidState("own client id not known yet".to_string())
            })?,
        };
        self.call(
            "clientmove",
            QueryParams::new()
                .with("clid", client)
                .with("cid", channel)
                .with_opt("cpw", password),
            &[],
        )
        .await?;
        Ok(())
    }

    /// Server groups of `client` as reported by `clientinfo`.
    pub async fn client_server_groups(
        &self,
        client: ClientId,
    ) -> Result<BTreeSet<ServerGroupId>> {
        let resp = self
            .call(
                "clientinfo",
                QueryParams::new().with("clid", client),
                &["client_servergroups"],
            )
            .await?;
        let raw = resp.field("client_servergroups").ok_or_else(|| {
            Error::Protocol("clientinfo response has no client_servergroups".to_string())
        })?;
        parse_server_groups(raw)
    }

    pub async fn has_permission(&self, client: ClientId) -> Result<bool> {
        let allowed = self.cfg.allowed_groups();
        let groups = self
            .client_server_groups(client)
            .await
            .map_err(|e| Error::PermissionCheck {
                client,
                reason: e.to_string(),
            })?;
        Ok(allowed.permits(&groups))
    }
}

/// Parse a `client_servergroups` value: a single id or a comma-separated list.
pub fn parse_server_groups(raw: &str) -> Result<BTreeSet<ServerGroupId>> {
    raw.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<ServerGroupId>()
                .map_err(|_| Error::Protocol(format!("invalid server group id `{s}`")))
        })
        .collect()
}

/// Owns the background tasks of a running session.
pub struct BotHandle {
    session: Arc<Session>,
    cancel: CancellationToken,
    worker: JoinHandle<()>,
    keepalive: JoinHandle<()>,
}

impl BotHandle {
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Run until the transport stops delivering notifications, then shut down.
    pub async fn wait(mut self) -> Result<()> {
        if let Err(e) = (&mut self.worker).await {
            warn!(error = %e, "guard worker ended abnormally");
        }
        self.shutdown().await
    }

    /// Stop the guard and keep-alive, wait for in-flight actions, close the connection.
    pub async fn shutdown(self) -> Result<()> {
        self.cancel.cancel();
        if let Err(e) = self.keepalive.await {
            warn!(error = %e, "keep-alive task ended abnormally");
        }
        if !self.worker.is_finished() {
            if let Err(e) = self.worker.await {
                warn!(error = %e, "guard worker ended abnormally");
            }
        }
        self.session.set_state(SessionState::Stopped);
        info!("query session stopped");
        self.session.transport.close().await
    }
}
