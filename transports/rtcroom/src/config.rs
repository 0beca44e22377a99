//! Configuration types for room sessions

use crate::peer::StackKind;
use crate::signaling::ReconnectionPolicy;
use crate::{Error, Result};
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Main configuration for a Room
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RoomConfig {
    /// Base64-encoded room token issued by the provisioning service
    pub token: String,

    /// Force single-connection (bundled) mode on or off; `None` follows the server
    #[serde(rename = "singlePC")]
    pub single_pc: Option<bool>,

    /// Force peer-to-peer mode on or off; `None` follows the server
    pub p2p: Option<bool>,

    /// Do not restart ICE on connections that were previously connected
    pub disable_ice_restart: bool,

    /// Only gather relay candidates
    pub force_turn: bool,

    /// Maximum audio bandwidth in kbps (optional)
    #[serde(rename = "maxAudioBW")]
    pub max_audio_bw: Option<u32>,

    /// Maximum video bandwidth in kbps; the server value wins when lower
    #[serde(rename = "maxVideoBW")]
    pub max_video_bw: Option<u32>,

    /// Default video bandwidth in kbps; the server value wins when present
    #[serde(rename = "defaultVideoBW")]
    pub default_video_bw: Option<u32>,

    /// Media stack used for new connections (default: fake)
    pub stack: StackKind,

    /// Extra query parameters sent with the signaling handshake
    pub query: BTreeMap<String, String>,

    /// Signaling reconnection policy
    pub reconnection: ReconnectionPolicy,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            single_pc: None,
            p2p: None,
            disable_ice_restart: false,
            force_turn: false,
            max_audio_bw: None,
            max_video_bw: None,
            default_video_bw: None,
            stack: StackKind::default(),
            query: BTreeMap::new(),
            reconnection: ReconnectionPolicy::default(),
        }
    }
}

impl RoomConfig {
    /// Create a configuration for a token with defaults for everything else
    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            ..Default::default()
        }
    }

    /// Parse a configuration from TOML
    ///
    /// # Example
    ///
    /// ```
    /// use rtcroom::RoomConfig;
    ///
    /// let config = RoomConfig::from_toml_str(r#"
    ///     token = "e30="
    ///     disableIceRestart = true
    ///
    ///     [reconnection]
    ///     max_attempts = 5
    /// "#).unwrap();
    /// assert!(config.disable_ice_restart);
    /// assert_eq!(config.reconnection.max_attempts, 5);
    /// ```
    pub fn from_toml_str(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| Error::InvalidConfig(format!("Failed to parse TOML: {}", e)))
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> Result<()> {
        if self.token.is_empty() {
            return Err(Error::InvalidConfig("token must not be empty".to_string()));
        }

        Token::decode(&self.token)?;

        if let (Some(default_bw), Some(max_bw)) = (self.default_video_bw, self.max_video_bw) {
            if default_bw > max_bw {
                return Err(Error::InvalidConfig(format!(
                    "defaultVideoBW ({}) must not exceed maxVideoBW ({})",
                    default_bw, max_bw
                )));
            }
        }

        if matches!(self.max_audio_bw, Some(0)) || matches!(self.max_video_bw, Some(0)) {
            return Err(Error::InvalidConfig(
                "bandwidth limits must be greater than 0".to_string(),
            ));
        }

        self.reconnection.validate()
    }
}

/// Decoded room token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Token {
    /// Token identifier
    #[serde(deserialize_with = "crate::signaling::protocol::string_or_number")]
    pub token_id: String,

    /// Signaling host (`host:port`)
    pub host: String,

    /// Use TLS for the signaling channel
    #[serde(default)]
    pub secure: bool,

    /// Token signature
    #[serde(default)]
    pub signature: String,
}

impl Token {
    /// Decode a base64-encoded JSON token
    pub fn decode(encoded: &str) -> Result<Self> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| Error::InvalidToken(format!("token is not valid base64: {}", e)))?;

        let token: Token = serde_json::from_slice(&bytes)
            .map_err(|e| Error::InvalidToken(format!("token is not valid JSON: {}", e)))?;

        if token.host.is_empty() {
            return Err(Error::InvalidToken("token has no host".to_string()));
        }

        Ok(token)
    }

    /// Encode this token the way the provisioning service does
    pub fn encode(&self) -> Result<String> {
        let json = serde_json::to_vec(self)?;
        Ok(base64::engine::general_purpose::STANDARD.encode(json))
    }

    /// Signaling URL derived from host and `secure`
    pub fn signaling_url(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        format!("{}://{}", scheme, self.host)
    }

    /// Handshake query parameters carried by this token
    pub fn query(&self) -> BTreeMap<String, String> {
        let mut query = BTreeMap::new();
        query.insert("tokenId".to_string(), self.token_id.clone());
        query.insert("host".to_string(), self.host.clone());
        query.insert("secure".to_string(), self.secure.to_string());
        query.insert("signature".to_string(), self.signature.clone());
        query
    }
}
