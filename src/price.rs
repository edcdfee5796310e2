//! Price-source fan-out.
//!
//! All configured sources are queried concurrently; the first response that
//! is fresh and non-empty wins and the rest are dropped mid-flight. Source
//! order is the tie-break between simultaneously ready responses.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future;
use serde::Deserialize;
use tracing::debug;
use url::Url;

/// A source response older than this is discarded as stale.
pub const MAX_PRICE_AGE: Duration = Duration::from_secs(30);

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PriceObservation {
    /// Short lowercase currency code, e.g. `krw`.
    pub currency: String,
    /// Decimal exchange rate, kept as the source's string verbatim.
    pub price: String,
}

#[derive(Debug, Deserialize)]
struct SourceResponse {
    created_at: DateTime<Utc>,
    prices: Vec<PriceObservation>,
}

#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("no price source returned a fresh response")]
    NoFreshSource,
    #[error("response is {age_secs}s old")]
    Stale { age_secs: i64 },
    #[error("response contains no prices")]
    Empty,
    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),
}

#[async_trait]
pub trait PriceFeed: Send + Sync {
    async fn sample(&self) -> Result<Vec<PriceObservation>, FeedError>;
}

pub struct HttpPriceFeed {
    http: reqwest::Client,
    sources: Vec<Url>,
}

impl HttpPriceFeed {
    pub fn new(sources: Vec<Url>) -> Result<Self, FeedError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(HttpPriceFeed { http, sources })
    }

    async fn fetch_one(&self, source: &Url) -> Result<Vec<PriceObservation>, FeedError> {
        let response: SourceResponse = self
            .http
            .get(source.clone())
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        validate(response, Utc::now()).map_err(|err| {
            debug!(%source, %err, "price source discarded");
            err
        })
    }
}

#[async_trait]
impl PriceFeed for HttpPriceFeed {
    async fn sample(&self) -> Result<Vec<PriceObservation>, FeedError> {
        let requests = self
            .sources
            .iter()
            .map(|source| Box::pin(self.fetch_one(source)));
        // select_ok polls in source order and drops the losers on first
        // success, cancelling their in-flight requests.
        match future::select_ok(requests).await {
            Ok((prices, _losers)) => Ok(prices),
            Err(_) => Err(FeedError::NoFreshSource),
        }
    }
}

fn validate(
    response: SourceResponse,
    now: DateTime<Utc>,
) -> Result<Vec<PriceObservation>, FeedError> {
    let age = now.signed_duration_since(response.created_at);
    if age > chrono::Duration::from_std(MAX_PRICE_AGE).expect("constant fits") {
        return Err(FeedError::Stale {
            age_secs: age.num_seconds(),
        });
    }
    if response.prices.is_empty() {
        return Err(FeedError::Empty);
    }
    Ok(response.prices)
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::{validate, FeedError, PriceObservation, SourceResponse};

    fn response(age_secs: i64, prices: Vec<PriceObservation>) -> (SourceResponse, chrono::DateTime<Utc>) {
        let now = Utc::now();
        (
            SourceResponse {
                created_at: now - Duration::seconds(age_secs),
                prices,
            },
            now,
        )
    }

    fn krw() -> PriceObservation {
        PriceObservation {
            currency: "krw".to_owned(),
            price: "2273.225".to_owned(),
        }
    }

    #[test]
    fn fresh_response_accepted() {
        let (response, now) = response(5, vec![krw()]);
        assert_eq!(validate(response, now).unwrap(), vec![krw()]);
    }

    #[test]
    fn boundary_age_accepted() {
        let (response, now) = response(30, vec![krw()]);
        assert!(validate(response, now).is_ok());
    }

    #[test]
    fn stale_response_rejected() {
        let (response, now) = response(45, vec![krw()]);
        assert!(matches!(
            validate(response, now),
            Err(FeedError::Stale { age_secs: 45 })
        ));
    }

    #[test]
    fn future_timestamp_tolerated() {
        // Clock skew in the feeder's favor is not staleness.
        let (response, now) = response(-3, vec![krw()]);
        assert!(validate(response, now).is_ok());
    }

    #[test]
    fn empty_price_list_rejected() {
        let (response, now) = response(1, vec![]);
        assert!(matches!(validate(response, now), Err(FeedError::Empty)));
    }

    #[test]
    fn source_payload_shape() {
        let parsed: SourceResponse = serde_json::from_str(
            r#"{"created_at":"2026-08-02T11:00:00Z","prices":[{"currency":"krw","price":"2273.225"}]}"#,
        )
        .unwrap();
        assert_eq!(parsed.prices.len(), 1);
        assert_eq!(parsed.prices[0].currency, "krw");
    }

    mod fan_out {
        //! `sample()` against real sockets: one listener per fake source,
        //! answering every connection with a canned JSON body.

        use chrono::{Duration, Utc};
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;
        use url::Url;

        use super::super::{FeedError, HttpPriceFeed, PriceFeed};

        fn source_body(age_secs: i64, price: &str) -> String {
            let created_at = (Utc::now() - Duration::seconds(age_secs)).to_rfc3339();
            format!(
                r#"{{"created_at":"{created_at}","prices":[{{"currency":"krw","price":"{price}"}}]}}"#
            )
        }

        async fn spawn_source(body: String, delay_ms: u64) -> Url {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(async move {
                while let Ok((mut socket, _)) = listener.accept().await {
                    let body = body.clone();
                    tokio::spawn(async move {
                        let mut request = [0u8; 1024];
                        let _ = socket.read(&mut request).await;
                        tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                        let response = format!(
                            "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\n\
                             content-length: {}\r\nconnection: close\r\n\r\n{body}",
                            body.len()
                        );
                        let _ = socket.write_all(response.as_bytes()).await;
                    });
                }
            });
            Url::parse(&format!("http://{addr}/latest")).unwrap()
        }

        #[tokio::test]
        async fn first_fresh_source_wins() {
            // The second source is fresh too, but slower; its request is
            // dropped once the first one answers.
            let fast = spawn_source(source_body(1, "2273.225"), 0).await;
            let slow = spawn_source(source_body(1, "9999.9"), 300).await;

            let feed = HttpPriceFeed::new(vec![fast, slow]).unwrap();
            let prices = feed.sample().await.unwrap();
            assert_eq!(prices.len(), 1);
            assert_eq!(prices[0].price, "2273.225");
        }

        #[tokio::test]
        async fn stale_source_loses_to_fresh_one() {
            // First in source order but 45s old: the aggregator must fall
            // through to the valid source behind it.
            let stale = spawn_source(source_body(45, "1111.1"), 0).await;
            let fresh = spawn_source(source_body(1, "2273.225"), 50).await;

            let feed = HttpPriceFeed::new(vec![stale, fresh]).unwrap();
            let prices = feed.sample().await.unwrap();
            assert_eq!(prices[0].price, "2273.225");
        }

        #[tokio::test]
        async fn only_stale_sources_error_out() {
            let stale = spawn_source(source_body(45, "1111.1"), 0).await;

            let feed = HttpPriceFeed::new(vec![stale]).unwrap();
            assert!(matches!(
                feed.sample().await,
                Err(FeedError::NoFreshSource)
            ));
        }

        #[tokio::test]
        async fn unreachable_source_is_skipped() {
            // Nothing listens on the first URL; the port is grabbed and
            // released so a connection there is refused outright.
            let dead = {
                let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
                let addr = listener.local_addr().unwrap();
                Url::parse(&format!("http://{addr}/latest")).unwrap()
            };
            let fresh = spawn_source(source_body(1, "2273.225"), 0).await;

            let feed = HttpPriceFeed::new(vec![dead, fresh]).unwrap();
            let prices = feed.sample().await.unwrap();
            assert_eq!(prices[0].price, "2273.225");
        }
    }
}
