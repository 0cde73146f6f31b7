use std::{collections::BTreeSet, env, fmt, sync::Arc, time::Duration};

use crate::{
    actions::{ActionPair, ActionPlan, ClientAction},
    domain::{ChannelId, ServerGroupId},
    errors::Error,
    ports::QueryTransport,
    session::Session,
    Result,
};

pub const DEFAULT_QUERY_PORT: u16 = 10011;
pub const DEFAULT_SERVER_PORT: u16 = 9987;
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(240);
pub const DEFAULT_KICK_REASON: &str = "Channel not allowed";

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub bot_name: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("bot_name", &self.bot_name)
            .finish()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub address: String,
    pub query_port: u16,
    pub server_port: u16,
}

/// Server groups allowed into the channel. Empty means everyone is allowed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AllowedGroups(BTreeSet<ServerGroupId>);

impl AllowedGroups {
    pub fn allow_all() -> Self {
        Self::default()
    }

    pub fn is_allow_all(&self) -> bool {
        self.0.is_empty()
    }

    pub fn groups(&self) -> &BTreeSet<ServerGroupId> {
        &self.0
    }

    /// True if the list is empty or shares at least one group with `client_groups`.
    pub fn permits(&self, client_groups: &BTreeSet<ServerGroupId>) -> bool {
        self.is_allow_all() || !self.0.is_disjoint(client_groups)
    }
}

/// Immutable bot configuration produced by [`BotConfigBuilder::build`].
#[derive(Clone, Debug)]
pub struct BotConfig {
    credentials: Credentials,
    connection: ConnectionInfo,
    channel: ChannelId,
    allowed_groups: AllowedGroups,
    actions: ActionPair,
    channel_password: Option<String>,
    keepalive_interval: Duration,
    kick_reason: String,
}

impl BotConfig {
    pub fn builder() -> BotConfigBuilder {
        BotConfigBuilder::new()
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn connection(&self) -> &ConnectionInfo {
        &self.connection
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn allowed_groups(&self) -> &AllowedGroups {
        &self.allowed_groups
    }

    pub fn actions(&self) -> &ActionPair {
        &self.actions
    }

    pub fn channel_password(&self) -> Option<&str> {
        self.channel_password.as_deref()
    }

    pub fn keepalive_interval(&self) -> Duration {
        self.keepalive_interval
    }

    pub fn kick_reason(&self) -> &str {
        &self.kick_reason
    }

    /// Hand the config to a new session bound to `transport`.
    pub fn into_session(self, transport: Arc<dyn QueryTransport>) -> Arc<Session> {
        Session::new(self, transport)
    }
}

/// Collects the five required slices, validating each as it is set.
///
/// ```ignore
/// let cfg = BotConfig::builder()
///     .with_credentials("serveradmin", "secret", "Guard")?
///     .with_connection_info("127.0.0.1", 10011, 9987)?
///     .in_channel(ChannelId(1173))?
///     .with_allowed_groups([ServerGroupId(6)])?
///     .with_actions(ActionPlan::parse("poke:Welcome")?, ActionPlan::parse("kick:No access")?)
///     .build()?;
/// ```
pub struct BotConfigBuilder {
    credentials: Option<Credentials>,
    connection: Option<ConnectionInfo>,
    channel: Option<ChannelId>,
    allowed_groups: Option<AllowedGroups>,
    actions: Option<ActionPair>,
    channel_password: Option<String>,
    keepalive_interval: Duration,
    kick_reason: String,
}

impl Default for BotConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl BotConfigBuilder {
    pub fn new() -> Self {
        Self {
            credentials: None,
            connection: None,
            channel: None,
            allowed_groups: None,
            actions: None,
            channel_password: None,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            kick_reason: DEFAULT_KICK_REASON.to_string(),
        }
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
        bot_name: impl Into<String>,
    ) -> Result<Self> {
        self.credentials = Some(validate_credentials(
            username.into(),
            password.into(),
            bot_name.into(),
        )?);
        Ok(self)
    }

    pub fn with_connection_info(
        mut self,
        address: impl Into<String>,
        query_port: u16,
        server_port: u16,
    ) -> Result<Self> {
        self.connection = Some(validate_connection(address.into(), query_port, server_port)?);
        Ok(self)
    }

    pub fn in_channel(mut self, channel: ChannelId) -> Result<Self> {
        self.channel = Some(validate_channel(channel)?);
        Ok(self)
    }

    /// An empty list allows every client.
    pub fn with_allowed_groups(
        mut self,
        groups: impl IntoIterator<Item = ServerGroupId>,
    ) -> Result<Self> {
        self.allowed_groups = Some(validate_groups(groups)?);
        Ok(self)
    }

    pub fn with_actions(
        mut self,
        on_success: impl ClientAction + 'static,
        on_denied: impl ClientAction + 'static,
    ) -> Self {
        self.with_action_pair(ActionPair::new(on_success, on_denied))
    }

    /// Shares an existing pair, e.g. between several bots.
    pub fn with_action_pair(mut self, actions: ActionPair) -> Self {
        self.actions = Some(actions);
        self
    }

    /// Password for the bot's own join. Left unset, no password field is sent.
    pub fn with_channel_password(mut self, password: impl Into<String>) -> Self {
        self.channel_password = Some(password.into());
        self
    }

    pub fn with_keepalive_interval(mut self, interval: Duration) -> Result<Self> {
        if interval.is_zero() {
            return Err(Error::InvalidConfig(
                "keep-alive interval must be greater than zero".to_string(),
            ));
        }
        self.keepalive_interval = interval;
        Ok(self)
    }

    pub fn with_kick_reason(mut self, reason: impl Into<String>) -> Result<Self> {
        self.kick_reason = require_non_empty("kick reason", reason.into())?;
        Ok(self)
    }

    pub fn build(self) -> Result<BotConfig> {
        Ok(BotConfig {
            credentials: self.credentials.ok_or_else(|| missing("credentials"))?,
            connection: self.connection.ok_or_else(|| missing("connection info"))?,
            channel: self.channel.ok_or_else(|| missing("channel"))?,
            allowed_groups: self
                .allowed_groups
                .ok_or_else(|| missing("allowed groups"))?,
            actions: self.actions.ok_or_else(|| missing("actions"))?,
            channel_password: self.channel_password,
            keepalive_interval: self.keepalive_interval,
            kick_reason: self.kick_reason,
        })
    }

    /// Fill the builder from `CGB_*` environment variables, reading `.env` first.
    pub fn from_env() -> Result<Self> {
        // Existing variables win over `.env` entries.
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable lookup.
    ///
    /// Slices whose variables are absent stay unset so `build()` reports them.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).and_then(non_empty);
        let mut builder = Self::new();

        // Credentials keep surrounding whitespace; only an empty value counts as unset.
        let raw = |key: &str| lookup(key).filter(|s| !s.is_empty());
        match (raw(ENV_USERNAME), raw(ENV_PASSWORD), raw(ENV_BOT_NAME)) {
            (Some(user), Some(pass), Some(name)) => {
                builder = builder.with_credentials(user, pass, name)?;
            }
            (None, None, None) => {}
            (user, pass, name) => {
                let unset: Vec<&str> = [
                    (ENV_USERNAME, user.is_none()),
                    (ENV_PASSWORD, pass.is_none()),
                    (ENV_BOT_NAME, name.is_none()),
                ]
                .into_iter()
                .filter_map(|(key, unset)| unset.then_some(key))
                .collect();
                return Err(Error::InvalidConfig(format!(
                    "incomplete credentials: {} not set",
                    unset.join(", ")
                )));
            }
        }

        let query_port = parse_var::<u16>(ENV_QUERY_PORT, var(ENV_QUERY_PORT))?;
        let server_port = parse_var::<u16>(ENV_SERVER_PORT, var(ENV_SERVER_PORT))?;
        if let Some(address) = var(ENV_ADDRESS) {
            builder = builder.with_connection_info(
                address,
                query_port.unwrap_or(DEFAULT_QUERY_PORT),
                server_port.unwrap_or(DEFAULT_SERVER_PORT),
            )?;
        }

        if let Some(channel) = parse_var::<ChannelId>(ENV_CHANNEL_ID, var(ENV_CHANNEL_ID))? {
            builder = builder.in_channel(channel)?;
        }
        if let Some(password) = var(ENV_CHANNEL_PASSWORD) {
            builder = builder.with_channel_password(password);
        }

        // Unset means "allow all".
        let groups = parse_csv_groups(var(ENV_ALLOWED_GROUPS))?;
        builder = builder.with_allowed_groups(groups)?;

        let on_success = var(ENV_ON_SUCCESS);
        let on_denied = var(ENV_ON_DENIED);
        if on_success.is_some() || on_denied.is_some() {
            let on_success = ActionPlan::parse(on_success.as_deref().unwrap_or_default())?;
            let on_denied = ActionPlan::parse(on_denied.as_deref().unwrap_or_default())?;
            builder = builder.with_actions(on_success, on_denied);
        }

        if let Some(secs) = parse_var::<u64>(ENV_KEEPALIVE_SECS, var(ENV_KEEPALIVE_SECS))? {
            builder = builder.with_keepalive_interval(Duration::from_secs(secs))?;
        }
        if let Some(reason) = var(ENV_KICK_REASON) {
            builder = builder.with_kick_reason(reason)?;
        }

        Ok(builder)
    }
}

const ENV_USERNAME: &str = "CGB_USERNAME";
const ENV_PASSWORD: &str = "CGB_PASSWORD";
const ENV_BOT_NAME: &str = "CGB_BOT_NAME";
const ENV_ADDRESS: &str = "CGB_ADDRESS";
const ENV_QUERY_PORT: &str = "CGB_QUERY_PORT";
const ENV_SERVER_PORT: &str = "CGB_SERVER_PORT";
const ENV_CHANNEL_ID: &str = "CGB_CHANNEL_ID";
const ENV_CHANNEL_PASSWORD: &str = "CGB_CHANNEL_PASSWORD";
const ENV_ALLOWED_GROUPS: &str = "CGB_ALLOWED_GROUPS";
const ENV_ON_SUCCESS: &str = "CGB_ON_SUCCESS";
const ENV_ON_DENIED: &str = "CGB_ON_DENIED";
const ENV_KEEPALIVE_SECS: &str = "CGB_KEEPALIVE_SECS";
const ENV_KICK_REASON: &str = "CGB_KICK_REASON";

fn validate_credentials(
    username: String,
    password: String,
    bot_name: String,
) -> Result<Credentials> {
    Ok(Credentials {
        username: require_non_empty("username", username)?,
        password: require_non_empty("password", password)?,
        bot_name: require_non_empty("bot name", bot_name)?,
    })
}

fn validate_connection(
    address: String,
    query_port: u16,
    server_port: u16,
) -> Result<ConnectionInfo> {
    let address = require_non_empty("address", address)?;
    if query_port == 0 {
        return Err(Error::InvalidConfig("query port must be positive".to_string()));
    }
    if server_port == 0 {
        return Err(Error::InvalidConfig("server port must be positive".to_string()));
    }
    Ok(ConnectionInfo {
        address,
        query_port,
        server_port,
    })
}

fn validate_channel(channel: ChannelId) -> Result<ChannelId> {
    if channel.0 == 0 {
        return Err(Error::InvalidConfig(
            "channel id must be positive".to_string(),
        ));
    }
    Ok(channel)
}

fn validate_groups(groups: impl IntoIterator<Item = ServerGroupId>) -> Result<AllowedGroups> {
    let mut set = BTreeSet::new();
    for group in groups {
        if group.0 == 0 {
            return Err(Error::InvalidConfig(
                "allowed group ids must be positive".to_string(),
            ));
        }
        set.insert(group);
    }
    Ok(AllowedGroups(set))
}

fn require_non_empty(field: &str, value: String) -> Result<String> {
    if value.is_empty() {
        return Err(Error::InvalidConfig(format!("{field} must not be empty")));
    }
    Ok(value)
}

fn missing(slice: &str) -> Error {
    Error::InvalidConfig(format!("{slice} not configured"))
}

fn parse_var<T: std::str::FromStr>(key: &str, value: Option<String>) -> Result<Option<T>> {
    let Some(raw) = value else {
        return Ok(None);
    };
    raw.trim()
        .parse::<T>()
        .map(Some)
        .map_err(|_| Error::InvalidConfig(format!("{key}: `{raw}` is not a valid number")))
}

fn parse_csv_groups(value: Option<String>) -> Result<Vec<ServerGroupId>> {
    value
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<ServerGroupId>().map_err(|_| {
                Error::InvalidConfig(format!("{ENV_ALLOWED_GROUPS}: `{s}` is not a group id"))
            })
        })
        .collect()
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
