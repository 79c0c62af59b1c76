//! Declarative connection configuration.
//!
//! A `Blueprint` describes which market-data channels and/or authenticated
//! account a venue connection should bring up. Construction flags that tune
//! behaviour rather than scope live in `ExchangeOptions`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Trade,
    Book,
    Quote,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarketdataPlan {
    #[serde(default)]
    pub trade: Vec<String>,
    #[serde(default)]
    pub book: Vec<String>,
    #[serde(default)]
    pub quote: Vec<String>,
}

impl MarketdataPlan {
    pub fn pairs(&self, channel: Channel) -> &[String] {
        match channel {
            Channel::Trade => &self.trade,
            Channel::Book => &self.book,
            Channel::Quote => &self.quote,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.trade.is_empty() && self.book.is_empty() && self.quote.is_empty()
    }

    /// All pairs named on any channel, deduplicated.
    pub fn all_pairs(&self) -> Vec<String> {
        let mut pairs: Vec<String> = Vec::new();
        for pair in self.trade.iter().chain(&self.book).chain(&self.quote) {
            if !pairs.contains(pair) {
                pairs.push(pair.clone());
            }
        }
        pairs
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountPlan {
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default)]
    pub secrets: Vec<String>,
    #[serde(default)]
    pub pairs: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Blueprint {
    #[serde(default)]
    pub marketdata: Option<MarketdataPlan>,
    #[serde(default)]
    pub account: Option<AccountPlan>,
}

impl Blueprint {
    /// Loads a blueprint from a TOML/JSON/YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .build()
            .with_context(|| format!("failed to read blueprint {}", path.display()))?;
        settings
            .try_deserialize()
            .with_context(|| format!("invalid blueprint {}", path.display()))
    }

    pub fn has_account(&self) -> bool {
        self.account
            .as_ref()
            .map(|a| !a.keys.is_empty() && !a.secrets.is_empty())
            .unwrap_or(false)
    }

    pub fn has_marketdata_channel(&self, channel: Channel, pair: Option<&str>) -> bool {
        match &self.marketdata {
            Some(plan) => {
                let pairs = plan.pairs(channel);
                match pair {
                    Some(p) => pairs.iter().any(|x| x == p),
                    None => !pairs.is_empty(),
                }
            }
            None => false,
        }
    }
}

/// Construction flags controlling how a connection behaves.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ExchangeOptions {
    /// Skip the startup barrier.
    pub quick: bool,
    /// Race several market-data connections instead of keeping one.
    pub hot: bool,
    /// Disable all pollers.
    pub no_poll: bool,
    /// Always emit full depth on a book touch, not just top-of-book changes.
    pub book_depth: bool,
    /// Relative move below which a repeated last-trade price is not
    /// re-notified.
    pub tolerance: f64,
}

impl Default for ExchangeOptions {
    fn default() -> Self {
        Self {
            quick: true,
            hot: false,
            no_poll: false,
            book_depth: false,
            tolerance: 0.005 / 100.0,
        }
    }
}
