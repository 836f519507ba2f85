use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::debug;

use dishwasher_common::{
    config::PriceFeedConfig, schedule::cheapest_slots, PriceFeed, PriceFeedError, PriceSlot,
};

#[derive(Debug, Deserialize)]
struct MarketData {
    data: Vec<MarketEntry>,
}

#[derive(Debug, Deserialize)]
struct MarketEntry {
    start_timestamp: i64,
    end_timestamp: i64,
    marketprice: f64,
}

/// Day-ahead market prices from an aWATTar-style `marketdata` endpoint.
pub struct MarketPriceFeed {
    client: reqwest::blocking::Client,
    url: String,
    slots: Vec<PriceSlot>,
}

impl MarketPriceFeed {
    pub fn new(config: &PriceFeedConfig) -> Result<Self, PriceFeedError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|err| PriceFeedError::Request(err.to_string()))?;

        Ok(Self {
            client,
            url: config.url.clone(),
            slots: Vec::new(),
        })
    }
}

impl PriceFeed for MarketPriceFeed {
    fn request(&mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<(), PriceFeedError> {
        self.slots.clear();

        let response = self
            .client
            .get(&self.url)
            .query(&[
                ("start", start.timestamp_millis()),
                ("end", end.timestamp_millis()),
            ])
            .send()
            .and_then(reqwest::blocking::Response::error_for_status)
            .map_err(|err| PriceFeedError::Request(err.to_string()))?;

        let body = response
            .bytes()
            .map_err(|err| PriceFeedError::Request(err.to_string()))?;
        self.slots = parse_market_data(&body)?
            .into_iter()
            .filter(|slot| slot.start < end && slot.end > start)
            .collect();

        debug!(slots = self.slots.len(), "price forecast received");
        Ok(())
    }

    fn best_slots(&self, count: usize) -> Vec<PriceSlot> {
        cheapest_slots(&self.slots, count)
    }
}

fn parse_market_data(raw: &[u8]) -> Result<Vec<PriceSlot>, PriceFeedError> {
    let market: MarketData =
        serde_json::from_slice(raw).map_err(|err| PriceFeedError::Decode(err.to_string()))?;

    market
        .data
        .into_iter()
        .map(|entry| {
            let start = DateTime::from_timestamp_millis(entry.start_timestamp);
            let end = DateTime::from_timestamp_millis(entry.end_timestamp);
            match (start, end) {
                (Some(start), Some(end)) if start < end => Ok(PriceSlot {
                    start,
                    end,
                    price: entry.marketprice,
                }),
                _ => Err(PriceFeedError::Decode(format!(
                    "invalid slot {}..{}",
                    entry.start_timestamp, entry.end_timestamp
                ))),
            }
        })
        .collect()
}
