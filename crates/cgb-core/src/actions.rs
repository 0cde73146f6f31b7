//! Actions run by the channel guard once a client's permission is known.
//!
//! Anything implementing [`ClientAction`] can be configured, including plain
//! async closures of the shape `|session, client| async move { ... }`.
//! [`ActionPlan`] covers the common poke / message / kick / move cases and
//! can be parsed from a config string.

use std::{fmt, future::Future, sync::Arc};

use async_trait::async_trait;

use crate::{
    domain::{ChannelId, ClientId},
    errors::Error,
    session::Session,
    Result,
};

/// A handler invoked with the session and the client that triggered it.
///
/// Errors are logged by the guard and never stop event processing.
#[async_trait]
pub trait ClientAction: Send + Sync {
    async fn run(&self, session: Arc<Session>, client: ClientId) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> ClientAction for F
where
    F: Fn(Arc<Session>, ClientId) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn run(&self, session: Arc<Session>, client: ClientId) -> anyhow::Result<()> {
        (self)(session, client).await
    }
}

/// The success/denied handler pair. Exactly one runs per qualifying event.
#[derive(Clone)]
pub struct ActionPair {
    pub on_success: Arc<dyn ClientAction>,
    pub on_denied: Arc<dyn ClientAction>,
}

impl ActionPair {
    pub fn new(
        on_success: impl ClientAction + 'static,
        on_denied: impl ClientAction + 'static,
    ) -> Self {
        Self {
            on_success: Arc::new(on_success),
            on_denied: Arc::new(on_denied),
        }
    }

    pub fn select(&self, allowed: bool) -> Arc<dyn ClientAction> {
        if allowed {
            self.on_success.clone()
        } else {
            self.on_denied.clone()
        }
    }
}

impl fmt::Debug for ActionPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionPair").finish_non_exhaustive()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ActionStep {
    Poke(String),
    Message(String),
    Kick(String),
    Move(ChannelId),
}

impl ActionStep {
    async fn apply(&self, session: &Session, client: ClientId) -> Result<()> {
        match self {
            ActionStep::Poke(text) => session.send_poke(client, text).await,
            ActionStep::Message(text) => session.send_message(client, text).await,
            ActionStep::Kick(reason) => session.kick_client(client, reason).await,
            ActionStep::Move(channel) => {
                session.join_channel(*channel, Some(client), None).await
            }
        }
    }
}

/// Ordered list of built-in steps, e.g. `poke:Hi;message:Welcome;kick:Bye`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ActionPlan {
    pub steps: Vec<ActionStep>,
}

impl ActionPlan {
    pub fn new(steps: Vec<ActionStep>) -> Self {
        Self { steps }
    }

    pub fn parse(input: &str) -> Result<Self> {
        let mut steps = Vec::new();
        for raw in input.split(';') {
            let part = raw.trim();
            if part.is_empty() {
                continue;
            }

            let Some((kind, arg)) = part.split_once(':') else {
                return Err(Error::InvalidConfig(format!(
                    "action step `{part}` must look like `kind:argument`"
                )));
            };
            let arg = arg.trim();
            if arg.is_empty() {
                return Err(Error::InvalidConfig(format!(
                    "action step `{part}` has an empty argument"
                )));
            }

            let step = match kind.trim().to_lowercase().as_str() {
                "poke" => ActionStep::Poke(arg.to_string()),
                "message" | "msg" => ActionStep::Message(arg.to_string()),
                "kick" => ActionStep::Kick(arg.to_string()),
                "move" => {
                    let channel: ChannelId = arg.parse().map_err(|_| {
                        Error::InvalidConfig(format!("move target `{arg}` is not a channel id"))
                    })?;
                    if channel.0 == 0 {
                        return Err(Error::InvalidConfig(
                            "move target must be a positive channel id".to_string(),
                        ));
                    }
                    ActionStep::Move(channel)
                }
                other => {
                    return Err(Error::InvalidConfig(format!(
                        "unknown action `{other}` (expected poke, message, kick or move)"
                    )))
                }
            };
            steps.push(step);
        }
        Ok(Self::new(steps))
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[async_trait]
impl ClientAction for ActionPlan {
    /// Runs every step even if an earlier one failed; reports the first failure.
    async fn run(&self, session: Arc<Session>, client: ClientId) -> anyhow::Result<()> {
        let mut first_err: Option<Error> = None;
        for step in &self.steps {
            if let Err(e) = step.apply(&session, client).await {
                tracing::warn!(%client, ?step, error = %e, "action step failed");
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}
