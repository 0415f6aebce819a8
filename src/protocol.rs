use async_trait::async_trait;
use serde::Deserialize;

use crate::error::Result;

pub type ServerId = u64;
pub type ChannelId = u64;
pub type UserId = u64;

/// Voice state event forwarded from the main gateway.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct VoiceStateUpdate {
    pub session_id: String,
    #[serde(default, deserialize_with = "snowflake::option")]
    pub channel_id: Option<ChannelId>,
}

/// Voice server event forwarded from the main gateway.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct VoiceServerUpdate {
    #[serde(default)]
    pub token: String,
    #[serde(rename = "guild_id", deserialize_with = "snowflake::required")]
    pub server_id: ServerId,
    #[serde(default)]
    pub endpoint: Option<String>,
}

/// What the owning client provides to a voice connection.
#[async_trait]
pub trait VoiceGateway: Send + Sync {
    /// Our own user id, sent when identifying on the voice session.
    fn user_id(&self) -> UserId;

    /// Ask the main gateway to join `channel_id`, or leave voice with `None`.
    async fn change_voice_state(&self, server_id: ServerId, channel_id: Option<ChannelId>) -> Result<()>;

    /// Forget the voice connection registered for `server_id`.
    fn remove_voice_client(&self, server_id: ServerId);
}

/// Lifecycle hooks every voice transport implements.
///
/// After construction the owner calls [`connect`](VoiceProtocol::connect);
/// the two gateway events are forwarded as they arrive, in no particular
/// order. If `connect` fails, the owner calls `disconnect`.
#[async_trait]
pub trait VoiceProtocol: Send + Sync {
    async fn on_voice_state_update(&self, data: VoiceStateUpdate) -> Result<()>;

    async fn on_voice_server_update(&self, data: VoiceServerUpdate) -> Result<()>;

    async fn connect(&self, timeout: std::time::Duration, reconnect: bool) -> Result<()>;

    async fn disconnect(&self, force: bool) -> Result<()>;

    /// Removes the connection from the owner's registry. Must run on every
    /// disconnect path.
    fn cleanup(&self);
}

/// Ids arrive as decimal strings; accept plain integers too.
mod snowflake {
    use serde::{Deserialize, Deserializer, de::Error};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(u64),
        Str(String),
    }

    fn parse<E: Error>(raw: Raw) -> Result<u64, E> {
        match raw {
            Raw::Int(v) => Ok(v),
            Raw::Str(s) => s.parse().map_err(E::custom),
        }
    }

    pub fn required<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
        parse(Raw::deserialize(d)?)
    }

    pub fn option<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u64>, D::Error> {
        Option::<Raw>::deserialize(d)?.map(parse::<D::Error>).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_update_with_null_channel() {
        let update: VoiceStateUpdate =
            serde_json::from_str(r#"{"session_id":"abc","channel_id":null,"user_id":"1"}"#).unwrap();
        assert_eq!(update.session_id, "abc");
        assert_eq!(update.channel_id, None);
    }

    #[test]
    fn state_update_with_string_channel() {
        let update: VoiceStateUpdate =
            serde_json::from_str(r#"{"session_id":"abc","channel_id":"81384788765712384"}"#).unwrap();
        assert_eq!(update.channel_id, Some(81384788765712384));
    }

    #[test]
    fn server_update_without_endpoint() {
        let update: VoiceServerUpdate =
            serde_json::from_str(r#"{"token":"t","guild_id":"41771983423143937","endpoint":null}"#).unwrap();
        assert_eq!(update.server_id, 41771983423143937);
        assert_eq!(update.endpoint, None);
    }
}
