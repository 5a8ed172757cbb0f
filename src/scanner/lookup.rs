use anyhow::Result;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use super::collaborators::CardLookup;
use crate::metrics;
use crate::models::CardIdentity;

/// Fuzzy card-name lookup against the Scryfall `cards/named` endpoint.
pub struct ScryfallClient {
    agent: ureq::Agent,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct NamedCard {
    name: Option<String>,
    id: Option<String>,
    scryfall_uri: Option<String>,
    set: Option<String>,
}

impl ScryfallClient {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(timeout)
            .user_agent(concat!("arenascan/", env!("CARGO_PKG_VERSION")))
            .build();
        Self {
            agent,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn fetch(&self, text: &str) -> Result<Option<CardIdentity>> {
        let url = format!("{}/cards/named", self.base_url);
        let response = match self
            .agent
            .get(&url)
            .set("Accept", "application/json")
            .query("fuzzy", text)
            .call()
        {
            Ok(response) => response,
            Err(ureq::Error::Status(code, _)) => {
                debug!("Lookup for {:?} returned status {}", text, code);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let body = response.into_string()?;
        Ok(parse_named_card(&body))
    }
}

impl CardLookup for ScryfallClient {
    fn lookup(&self, text: &str) -> Option<CardIdentity> {
        let identity = match self.fetch(text) {
            Ok(identity) => identity,
            Err(e) => {
                warn!("Card lookup for {:?} failed: {}", text, e);
                None
            }
        };
        metrics::record_lookup(identity.is_some());
        identity
    }
}

/// A card without a name, id or URI is treated as no match.
pub fn parse_named_card(body: &str) -> Option<CardIdentity> {
    let card: NamedCard = match serde_json::from_str(body) {
        Ok(card) => card,
        Err(e) => {
            debug!("Unparseable lookup response: {}", e);
            return None;
        }
    };

    Some(CardIdentity {
        name: card.name?,
        external_id: card.id?,
        external_uri: card.scryfall_uri?,
        set_code: card.set,
    })
}
