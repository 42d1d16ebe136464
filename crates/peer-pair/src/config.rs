use serde::{Deserialize, Serialize};

use crate::endpoint::{ChannelConstraints, IceConnectionState};

const ICE_SERVERS_ENV: &str = "PEER_PAIR_ICE_SERVERS";
const ACCEPT_COMPLETED_ENV: &str = "PEER_PAIR_ACCEPT_COMPLETED";
const EAGER_CANDIDATES_ENV: &str = "PEER_PAIR_EAGER_CANDIDATES";
const DEFAULT_EVENT_CAPACITY: usize = 64;

/// STUN/TURN server entry handed to endpoint construction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

/// Which ICE connection states count as "connected" for the session signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectedPolicy {
    /// Only the exact `connected` state qualifies.
    #[default]
    ConnectedOnly,
    /// `connected` or `completed` qualifies.
    ConnectedOrCompleted,
}

impl ConnectedPolicy {
    pub fn accepts(self, state: IceConnectionState) -> bool {
        match self {
            ConnectedPolicy::ConnectedOnly => state == IceConnectionState::Connected,
            ConnectedPolicy::ConnectedOrCompleted => matches!(
                state,
                IceConnectionState::Connected | IceConnectionState::Completed
            ),
        }
    }
}

/// When a relay may release queued candidates to its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateFlushPolicy {
    /// Flush as soon as the source finishes gathering.
    OnLocalGatheringComplete,
    /// Flush once the source finished gathering and the target holds a
    /// remote description.
    #[default]
    AfterRemoteDescription,
}

/// Configuration for a peer pair session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PairConfig {
    /// ICE servers for both endpoints; empty keeps the pair on host candidates
    pub ice_servers: Vec<IceServer>,
    /// Options for channels created by the pairing protocol
    pub constraints: ChannelConstraints,
    pub connected_policy: ConnectedPolicy,
    pub candidate_flush: CandidateFlushPolicy,
    /// Capacity of the session event broadcast channel
    pub event_capacity: usize,
}

impl Default for PairConfig {
    fn default() -> Self {
        Self {
            ice_servers: Vec::new(),
            constraints: ChannelConstraints::default(),
            connected_policy: ConnectedPolicy::default(),
            candidate_flush: CandidateFlushPolicy::default(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl PairConfig {
    /// Defaults overridden by `PEER_PAIR_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Parses a JSON document, filling anything missing from the defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(urls) = lookup(ICE_SERVERS_ENV) {
            config.ice_servers = urls
                .split(',')
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(|url| IceServer {
                    urls: vec![url.to_string()],
                    ..Default::default()
                })
                .collect();
        }
        if truthy(lookup(ACCEPT_COMPLETED_ENV)) {
            config.connected_policy = ConnectedPolicy::ConnectedOrCompleted;
        }
        if truthy(lookup(EAGER_CANDIDATES_ENV)) {
            config.candidate_flush = CandidateFlushPolicy::OnLocalGatheringComplete;
        }
        config
    }

    pub fn builder() -> PairConfigBuilder {
        PairConfigBuilder::new()
    }
}

fn truthy(value: Option<String>) -> bool {
    value.is_some_and(|v| !v.is_empty() && v != "0")
}

#[derive(Debug, Default)]
pub struct PairConfigBuilder {
    ice_servers: Vec<IceServer>,
    ordered: Option<bool>,
    max_retransmits: Option<u16>,
    connected_policy: Option<ConnectedPolicy>,
    candidate_flush: Option<CandidateFlushPolicy>,
    event_capacity: Option<usize>,
}

impl PairConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_ice_server(mut self, urls: Vec<String>) -> Self {
        self.ice_servers.push(IceServer {
            urls,
            ..Default::default()
        });
        self
    }

    pub fn add_ice_server_with_credentials(
        mut self,
        urls: Vec<String>,
        username: String,
        credential: String,
    ) -> Self {
        self.ice_servers.push(IceServer {
            urls,
            username,
            credential,
        });
        self
    }

    pub fn ordered(mut self, ordered: bool) -> Self {
        self.ordered = Some(ordered);
        self
    }

    pub fn max_retransmits(mut self, max_retransmits: u16) -> Self {
        self.max_retransmits = Some(max_retransmits);
        self
    }

    pub fn connected_policy(mut self, policy: ConnectedPolicy) -> Self {
        self.connected_policy = Some(policy);
        self
    }

    pub fn candidate_flush(mut self, policy: CandidateFlushPolicy) -> Self {
        self.candidate_flush = Some(policy);
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = Some(capacity);
        self
    }

    pub fn build(self) -> Result<PairConfig, String> {
        let mut config = PairConfig {
            ice_servers: self.ice_servers,
            ..Default::default()
        };
        config.constraints = ChannelConstraints {
            ordered: self.ordered,
            max_retransmits: self.max_retransmits,
        };
        if let Some(policy) = self.connected_policy {
            config.connected_policy = policy;
        }
        if let Some(policy) = self.candidate_flush {
            config.candidate_flush = policy;
        }
        if let Some(capacity) = self.event_capacity {
            if capacity == 0 {
                return Err("event capacity must be greater than zero".into());
            }
            config.event_capacity = capacity;
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_has_no_ice_servers() {
        let config = PairConfig::default();
        assert!(config.ice_servers.is_empty());
        assert_eq!(config.connected_policy, ConnectedPolicy::ConnectedOnly);
        assert_eq!(
            config.candidate_flush,
            CandidateFlushPolicy::AfterRemoteDescription
        );
    }

    #[test]
    fn lookup_overrides_defaults() {
        let vars: HashMap<&str, &str> = HashMap::from([
            (ICE_SERVERS_ENV, "stun:a.example:3478, stun:b.example:3478,"),
            (ACCEPT_COMPLETED_ENV, "1"),
            (EAGER_CANDIDATES_ENV, "0"),
        ]);
        let config = PairConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(config.ice_servers.len(), 2);
        assert_eq!(config.ice_servers[1].urls, vec!["stun:b.example:3478"]);
        assert_eq!(
            config.connected_policy,
            ConnectedPolicy::ConnectedOrCompleted
        );
        assert_eq!(
            config.candidate_flush,
            CandidateFlushPolicy::AfterRemoteDescription
        );
    }

    #[test]
    fn json_merges_over_defaults() {
        let config = PairConfig::from_json(
            r#"{"ice_servers":[{"urls":["turn:t.example"],"username":"u","credential":"c"}],
                "candidate_flush":"on_local_gathering_complete"}"#,
        )
        .expect("parse config");
        assert_eq!(config.ice_servers[0].username, "u");
        assert_eq!(
            config.candidate_flush,
            CandidateFlushPolicy::OnLocalGatheringComplete
        );
        assert_eq!(config.event_capacity, DEFAULT_EVENT_CAPACITY);
    }

    #[test]
    fn builder_rejects_zero_capacity() {
        assert!(PairConfig::builder().event_capacity(0).build().is_err());
        let config = PairConfig::builder()
            .ordered(false)
            .max_retransmits(3)
            .build()
            .expect("build config");
        assert_eq!(config.constraints.ordered, Some(false));
        assert_eq!(config.constraints.max_retransmits, Some(3));
    }

    #[test]
    fn completed_only_counts_under_relaxed_policy() {
        assert!(!ConnectedPolicy::ConnectedOnly.accepts(IceConnectionState::Completed));
        assert!(ConnectedPolicy::ConnectedOrCompleted.accepts(IceConnectionState::Completed));
        assert!(ConnectedPolicy::ConnectedOnly.accepts(IceConnectionState::Connected));
        assert!(!ConnectedPolicy::ConnectedOrCompleted.accepts(IceConnectionState::Checking));
    }
}
