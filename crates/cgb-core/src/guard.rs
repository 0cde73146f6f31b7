//! Channel guard: reacts to clients arriving in the monitored channel.
//!
//! A single worker drains the notification queue. Each qualifying event gets
//! its own task, so two events for the same client may overlap and both run
//! an action; nothing de-duplicates them.

use std::sync::Arc;

use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, warn};

use crate::{
    domain::{ChannelId, ClientId},
    errors::Error,
    ports::Notification,
    session::Session,
    Result,
};

pub const EVENT_CLIENT_MOVED: &str = "clientmoved";
pub const EVENT_CLIENT_ENTERED_VIEW: &str = "cliententerview";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GuardEvent {
    ClientMoved {
        from: Option<ChannelId>,
        to: ChannelId,
        client: ClientId,
    },
    ClientEnteredView {
        into: ChannelId,
        client: ClientId,
    },
}

impl GuardEvent {
    /// `Ok(None)` for notifications the guard does not handle.
    pub fn from_notification(n: &Notification) -> Result<Option<Self>> {
        let event = match n.name.as_str() {
            EVENT_CLIENT_MOVED => GuardEvent::ClientMoved {
                from: optional_id(n, "cfid")?,
                to: required_id(n, "ctid")?,
                client: required_id(n, "clid")?,
            },
            EVENT_CLIENT_ENTERED_VIEW => GuardEvent::ClientEnteredView {
                into: required_id(n, "ctid")?,
                client: required_id(n, "clid")?,
            },
            _ => return Ok(None),
        };
        Ok(Some(event))
    }
}

/// What the guard does with an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reaction {
    Ignore,
    CheckPermission(ClientId),
    Kick(ClientId),
}

/// Moves into `channel` by anyone but the bot get a permission check;
/// enter-view arrivals in `channel` are always kicked.
pub fn decide(event: GuardEvent, channel: ChannelId, own_id: Option<ClientId>) -> Reaction {
    match event {
        GuardEvent::ClientMoved { to, client, .. } => {
            if to != channel || Some(client) == own_id {
                Reaction::Ignore
            } else {
                Reaction::CheckPermission(client)
            }
        }
        GuardEvent::ClientEnteredView { into, client } => {
            if into == channel {
                Reaction::Kick(client)
            } else {
                Reaction::Ignore
            }
        }
    }
}

pub(crate) fn spawn(
    session: Arc<Session>,
    mut notifications: mpsc::UnboundedReceiver<Notification>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let tracker = TaskTracker::new();
        loop {
            tokio::select! {
              _ = cancel.cancelled() => break,
              maybe = notifications.recv() => {
                let Some(n) = maybe else {
                  info!("notification stream closed");
                  break;
                };
                handle_notification(&session, &tracker, &n);
              }
            }
        }
        tracker.close();
        tracker.wait().await;
        debug!("guard worker stopped");
    })
}

fn handle_notification(session: &Arc<Session>, tracker: &TaskTracker, n: &Notification) {
    let event = match GuardEvent::from_notification(n) {
        Ok(Some(ev)) => ev,
        Ok(None) => {
            debug!(name = %n.name, "ignoring notification");
            return;
        }
        Err(e) => {
            warn!(name = %n.name, error = %e, "dropping malformed notification");
            return;
        }
    };

    match decide(event, session.config().channel(), session.own_client_id()) {
        Reaction::Ignore => {}
        Reaction::CheckPermission(client) => {
            tracker.spawn(check_and_dispatch(session.clone(), client));
        }
        Reaction::Kick(client) => {
            tracker.spawn(kick_arrival(session.clone(), client));
        }
    }
}

async fn check_and_dispatch(session: Arc<Session>, client: ClientId) {
    let allowed = match session.has_permission(client).await {
        Ok(v) => v,
        Err(e) => {
            warn!(%client, error = %e, "permission check failed, no action taken");
            return;
        }
    };

    let outcome = if allowed { "success" } else { "denied" };
    info!(%client, outcome, "client arrived");
    let action = session.config().actions().select(allowed);
    // Own task so a panicking action surfaces as a JoinError.
    let run = tokio::spawn(async move { action.run(session, client).await });
    match run.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(%client, outcome, error = %Error::Action(e), "action failed"),
        Err(e) if e.is_panic() => warn!(%client, outcome, error = %e, "action panicked"),
        Err(e) => warn!(%client, outcome, error = %e, "action task cancelled"),
    }
}

async fn kick_arrival(session: Arc<Session>, client: ClientId) {
    let reason = session.config().kick_reason();
    info!(%client, "client entered view in guarded channel, kicking");
    if let Err(e) = session.kick_client(client, reason).await {
        warn!(%client, error = %e, "kick failed");
    }
}

fn required_id<T: std::str::FromStr>(n: &Notification, key: &str) -> Result<T> {
    optional_id(n, key)?
        .ok_or_else(|| Error::Protocol(format!("{} notification without {key}", n.name)))
}

fn optional_id<T: std::str::FromStr>(n: &Notification, key: &str) -> Result<Option<T>> {
    let Some(raw) = n.get(key) else {
        return Ok(None);
    };
    raw.parse::<T>().map(Some).map_err(|_| {
        Error::Protocol(format!("{} notification has invalid {key} `{raw}`", n.name))
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::{
        actions::ActionPlan, config::BotConfig, domain::ServerGroupId, fake::FakeTransport,
    };

    const CHANNEL: u32 = 1173;
    const OWN: u32 = 7;

    fn moved(to: u32, client: u32) -> Notification {
        Notification::new(
            EVENT_CLIENT_MOVED,
            &[
                ("ctid", to.to_string().as_str()),
                ("clid", client.to_string().as_str()),
            ],
        )
    }

    fn entered(into: u32, client: u32) -> Notification {
        Notification::new(
            EVENT_CLIENT_ENTERED_VIEW,
            &[
                ("ctid", into.to_string().as_str()),
                ("clid", client.to_string().as_str()),
            ],
        )
    }

    fn success_denied() -> (ActionPlan, ActionPlan) {
        (
            ActionPlan::parse("poke:test success poke;message:success;kick:success").unwrap(),
            ActionPlan::parse("poke:test denied poke;message:no perms;kick:no perms").unwrap(),
        )
    }

    fn guarded(fake: &Arc<FakeTransport>, groups: &[u32]) -> Arc<Session> {
        let (ok, denied) = success_denied();
        BotConfig::builder()
            .with_credentials("serveradmin", "secret", "Guard")
            .unwrap()
            .with_connection_info("127.0.0.1", 10011, 9987)
            .unwrap()
            .in_channel(ChannelId(CHANNEL))
            .unwrap()
            .with_allowed_groups(groups.iter().map(|g| ServerGroupId(*g)))
            .unwrap()
            .with_actions(ok, denied)
            .build()
            .unwrap()
            .into_session(fake.clone())
    }

    /// Start the session, feed notifications, wait for all reactions to finish.
    async fn run_events(
        fake: &Arc<FakeTransport>,
        session: &Arc<Session>,
        events: Vec<Notification>,
    ) {
        let handle = session.start().await.unwrap();
        for ev in events {
            fake.emit(ev);
        }
        fake.end_notifications();
        handle.wait().await.unwrap();
    }

    #[test]
    fn decide_filters_channel_and_self() {
        let ch = ChannelId(CHANNEL);
        let me = Some(ClientId(OWN));
        let mv = |to: u32, client: u32| GuardEvent::ClientMoved {
            from: None,
            to: ChannelId(to),
            client: ClientId(client),
        };

        assert_eq!(decide(mv(1, 42), ch, me), Reaction::Ignore);
        assert_eq!(decide(mv(CHANNEL, OWN), ch, me), Reaction::Ignore);
        assert_eq!(
            decide(mv(CHANNEL, 42), ch, me),
            Reaction::CheckPermission(ClientId(42))
        );

        let ev = GuardEvent::ClientEnteredView {
            into: ch,
            client: ClientId(42),
        };
        assert_eq!(decide(ev, ch, me), Reaction::Kick(ClientId(42)));
        let ev = GuardEvent::ClientEnteredView {
            into: ChannelId(1),
            client: ClientId(42),
        };
        assert_eq!(decide(ev, ch, me), Reaction::Ignore);
    }

    #[test]
    fn parses_notifications() {
        let n = Notification::new(
            EVENT_CLIENT_MOVED,
            &[("cfid", "1"), ("ctid", "1173"), ("clid", "42"), ("reasonid", "0")],
        );
        assert_eq!(
            GuardEvent::from_notification(&n).unwrap(),
            Some(GuardEvent::ClientMoved {
                from: Some(ChannelId(1)),
                to: ChannelId(1173),
                client: ClientId(42),
            })
        );

        let other = Notification::new("textmessage", &[("msg", "hi")]);
        assert_eq!(GuardEvent::from_notification(&other).unwrap(), None);

        let bad = Notification::new(EVENT_CLIENT_ENTERED_VIEW, &[("ctid", "x"), ("clid", "1")]);
        assert!(matches!(
            GuardEvent::from_notification(&bad),
            Err(Error::Protocol(_))
        ));
        let missing = Notification::new(EVENT_CLIENT_MOVED, &[("ctid", "1")]);
        assert!(GuardEvent::from_notification(&missing).is_err());
    }

    #[tokio::test]
    async fn move_into_channel_runs_success_actions() {
        let fake = Arc::new(FakeTransport::new(OWN));
        fake.set_groups(42, "8");
        let s = guarded(&fake, &[]);

        run_events(&fake, &s, vec![moved(CHANNEL, 42)]).await;

        assert_eq!(fake.requests_for("clientinfo").len(), 1);
        let poke = &fake.requests_for("clientpoke")[0];
        assert_eq!(poke.get("clid"), Some("42"));
        assert_eq!(poke.get("msg"), Some("test success poke"));
        assert_eq!(
            fake.requests_for("sendtextmessage")[0].get("msg"),
            Some("success")
        );
        assert_eq!(
            fake.requests_for("clientkick")[0].get("reasonmsg"),
            Some("success")
        );
    }

    #[tokio::test]
    async fn unauthorized_client_runs_denied_actions() {
        let fake = Arc::new(FakeTransport::new(OWN));
        fake.set_groups(42, "3,9");
        fake.set_groups(43, "3,7");
        let s = guarded(&fake, &[5, 7]);

        run_events(&fake, &s, vec![moved(CHANNEL, 42), moved(CHANNEL, 43)]).await;

        let mut pokes: Vec<(String, String)> = fake
            .requests_for("clientpoke")
            .iter()
            .map(|p| {
                (
                    p.get("clid").unwrap().to_string(),
                    p.get("msg").unwrap().to_string(),
                )
            })
            .collect();
        pokes.sort();
        assert_eq!(
            pokes,
            vec![
                ("42".to_string(), "test denied poke".to_string()),
                ("43".to_string(), "test success poke".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn moves_elsewhere_and_self_moves_are_ignored() {
        let fake = Arc::new(FakeTransport::new(OWN));
        fake.set_groups(42, "8");
        fake.set_groups(OWN, "8");
        let s = guarded(&fake, &[]);

        run_events(&fake, &s, vec![moved(1, 42), moved(CHANNEL, OWN)]).await;

        assert!(fake.requests_for("clientinfo").is_empty());
        assert!(fake.requests_for("clientpoke").is_empty());
        assert!(fake.requests_for("clientkick").is_empty());
    }

    #[tokio::test]
    async fn enter_view_always_kicks() {
        let fake = Arc::new(FakeTransport::new(OWN));
        fake.set_groups(42, "5");
        let s = guarded(&fake, &[5]);

        run_events(&fake, &s, vec![entered(CHANNEL, 42), entered(1, 43)]).await;

        assert!(fake.requests_for("clientinfo").is_empty());
        let kicks = fake.requests_for("clientkick");
        assert_eq!(kicks.len(), 1);
        assert_eq!(kicks[0].get("clid"), Some("42"));
        assert_eq!(kicks[0].get("reasonid"), Some("4"));
        assert_eq!(kicks[0].get("reasonmsg"), Some("Channel not allowed"));
    }

    #[tokio::test]
    async fn failed_permission_check_runs_no_action() {
        let fake = Arc::new(FakeTransport::new(OWN));
        // No groups registered for 42: clientinfo fails.
        let s = guarded(&fake, &[]);

        run_events(&fake, &s, vec![moved(CHANNEL, 42)]).await;

        assert_eq!(fake.requests_for("clientinfo").len(), 1);
        assert!(fake.requests_for("clientpoke").is_empty());
        assert!(fake.requests_for("clientkick").is_empty());
    }

    #[tokio::test]
    async fn failing_handler_does_not_stop_later_events() {
        let fake = Arc::new(FakeTransport::new(OWN));
        fake.set_groups(42, "1");
        fake.set_groups(43, "1");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in_action = seen.clone();

        let on_success = move |_s: Arc<Session>, client: ClientId| {
            let seen = seen_in_action.clone();
            async move {
                seen.lock().unwrap().push(client);
                Err::<(), anyhow::Error>(anyhow::anyhow!("handler blew up for {client}"))
            }
        };
        let s = BotConfig::builder()
            .with_credentials("u", "p", "n")
            .unwrap()
            .with_connection_info("h", 1, 2)
            .unwrap()
            .in_channel(ChannelId(CHANNEL))
            .unwrap()
            .with_allowed_groups(Vec::new())
            .unwrap()
            .with_actions(on_success, ActionPlan::default())
            .build()
            .unwrap()
            .into_session(fake.clone());

        run_events(&fake, &s, vec![moved(CHANNEL, 42), moved(CHANNEL, 43)]).await;

        let mut seen = seen.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, vec![ClientId(42), ClientId(43)]);
    }

    #[tokio::test]
    async fn panicking_handler_does_not_stop_later_events() {
        let fake = Arc::new(FakeTransport::new(OWN));
        fake.set_groups(42, "1");
        fake.set_groups(43, "1");

        let on_success = |s: Arc<Session>, client: ClientId| async move {
            if client == ClientId(42) {
                panic!("handler panicked for {client}");
            }
            s.send_poke(client, "welcome").await?;
            Ok::<(), anyhow::Error>(())
        };
        let s = BotConfig::builder()
            .with_credentials("u", "p", "n")
            .unwrap()
            .with_connection_info("h", 1, 2)
            .unwrap()
            .in_channel(ChannelId(CHANNEL))
            .unwrap()
            .with_allowed_groups(Vec::new())
            .unwrap()
            .with_actions(on_success, ActionPlan::default())
            .build()
            .unwrap()
            .into_session(fake.clone());

        run_events(&fake, &s, vec![moved(CHANNEL, 42), moved(CHANNEL, 43)]).await;

        let pokes = fake.requests_for("clientpoke");
        assert_eq!(pokes.len(), 1);
        assert_eq!(pokes[0].get("clid"), Some("43"));
        assert!(fake.is_closed());
    }

    #[tokio::test]
    async fn failing_step_does_not_skip_remaining_steps() {
        let fake = Arc::new(FakeTransport::new(OWN));
        fake.set_groups(42, "1");
        fake.fail("clientpoke", "invalid clientID");
        let s = guarded(&fake, &[]);

        run_events(&fake, &s, vec![moved(CHANNEL, 42)]).await;

        assert_eq!(fake.requests_for("clientpoke").len(), 1);
        assert_eq!(fake.requests_for("sendtextmessage").len(), 1);
        assert_eq!(fake.requests_for("clientkick").len(), 1);
    }

    #[tokio::test]
    async fn duplicate_moves_may_both_dispatch() {
        let fake = Arc::new(FakeTransport::new(OWN));
        fake.set_groups(42, "1");
        let s = guarded(&fake, &[]);

        run_events(&fake, &s, vec![moved(CHANNEL, 42), moved(CHANNEL, 42)]).await;

        assert_eq!(fake.requests_for("clientinfo").len(), 2);
        assert_eq!(fake.requests_for("clientpoke").len(), 2);
    }

    #[tokio::test]
    async fn malformed_notifications_are_dropped() {
        let fake = Arc::new(FakeTransport::new(OWN));
        fake.set_groups(42, "1");
        let s = guarded(&fake, &[]);

        run_events(
            &fake,
            &s,
            vec![
                Notification::new(EVENT_CLIENT_MOVED, &[("ctid", "oops")]),
                Notification::new("serveredited", &[]),
                moved(CHANNEL, 42),
            ],
        )
        .await;

        assert_eq!(fake.requests_for("clientpoke").len(), 1);
    }
}
