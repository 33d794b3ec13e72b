//! Load balancer (C8).
//!
//! Picks an upstream URL for a requested channel. Sources are probed in
//! descending priority order (most free concurrency slots first); within a
//! source, sub-URLs follow the original playlist ordering. Failed probes are
//! remembered for the remainder of the lap; when a full lap yields nothing
//! the tested set is cleared and the balancer backs off exponentially before
//! sweeping again.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::Config;
use crate::errors::BalancerError;
use crate::models::StreamInfo;
use crate::proxy::concurrency::{ConcurrencyManager, ReleaseGuard};
use crate::utils::redact_url;

/// Outcome of a successful balance: a connected upstream response plus the
/// identity of the slot it occupies. Dropping the guard releases the slot.
#[derive(Debug)]
pub struct BalanceResult {
    pub response: reqwest::Response,
    pub url: String,
    pub source_id: String,
    pub sub_index: u64,
    pub guard: ReleaseGuard,
}

enum ProbeFailure {
    Failed,
    Cancelled,
}

pub struct LoadBalancer {
    client: reqwest::Client,
    concurrency: Arc<ConcurrencyManager>,
    max_retries: u32,
    retry_wait: Duration,
    backoff_cap: Duration,
    safe_logs: bool,
}

impl LoadBalancer {
    pub fn new(config: &Config, concurrency: Arc<ConcurrencyManager>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()?;
        // The backoff between laps never exceeds the per-chunk stream
        // timeout minus one second, so a waiting client is not starved
        // longer than a stalled upstream would be allowed to.
        let backoff_cap =
            Duration::from_secs(config.streaming.stream_timeout_secs.saturating_sub(1).max(1));
        Ok(Self {
            client,
            concurrency,
            max_retries: config.streaming.max_retries,
            retry_wait: Duration::from_secs(config.streaming.retry_wait_secs.max(1)),
            backoff_cap,
            safe_logs: config.safe_logs,
        })
    }

    /// Select and connect an upstream for `info`.
    pub async fn balance(
        &self,
        method: reqwest::Method,
        info: &StreamInfo,
        cancel: &CancellationToken,
    ) -> Result<BalanceResult, BalancerError> {
        if !info.has_urls() {
            return Err(BalancerError::NoUrls {
                title: info.title.clone(),
            });
        }

        let mut tested: HashSet<(String, u64)> = HashSet::new();
        let mut lap: u32 = 0;

        loop {
            lap += 1;

            // Sources with the most free slots first; id order breaks ties
            // so equal-priority sweeps stay deterministic.
            let mut source_ids: Vec<&String> = info
                .urls
                .iter()
                .filter(|(_, inner)| !inner.is_empty())
                .map(|(id, _)| id)
                .collect();
            source_ids.sort_by(|a, b| {
                self.concurrency
                    .priority(b)
                    .cmp(&self.concurrency.priority(a))
                    .then_with(|| a.cmp(b))
            });

            for source_id in source_ids {
                for (sub_index, url) in info.sub_urls(source_id) {
                    if tested.contains(&(source_id.clone(), sub_index)) {
                        continue;
                    }
                    if self.concurrency.saturated(source_id) {
                        debug!(
                            "Skipping saturated source '{}' for channel '{}'",
                            source_id, info.title
                        );
                        continue;
                    }
                    match self.probe(&method, &url, source_id, sub_index, cancel).await {
                        Ok(result) => return Ok(result),
                        Err(ProbeFailure::Cancelled) => return Err(BalancerError::Cancelled),
                        Err(ProbeFailure::Failed) => {
                            tested.insert((source_id.clone(), sub_index));
                        }
                    }
                }
            }

            if self.max_retries != 0 && lap >= self.max_retries {
                return Err(BalancerError::AllExhausted {
                    title: info.title.clone(),
                    laps: lap,
                });
            }

            tested.clear();
            self.backoff(lap, cancel).await?;
        }
    }

    /// Balance restricted to one (source, subIndex) tuple. Used for segment
    /// requests where the manifest already pinned the upstream.
    pub async fn balance_pinned(
        &self,
        method: reqwest::Method,
        url: &str,
        source_id: &str,
        sub_index: u64,
        cancel: &CancellationToken,
    ) -> Result<BalanceResult, BalancerError> {
        let mut lap: u32 = 0;
        loop {
            lap += 1;
            if !self.concurrency.saturated(source_id) {
                match self.probe(&method, url, source_id, sub_index, cancel).await {
                    Ok(result) => return Ok(result),
                    Err(ProbeFailure::Cancelled) => return Err(BalancerError::Cancelled),
                    Err(ProbeFailure::Failed) => {}
                }
            }
            if self.max_retries != 0 && lap >= self.max_retries {
                return Err(BalancerError::AllExhausted {
                    title: url.to_string(),
                    laps: lap,
                });
            }
            self.backoff(lap, cancel).await?;
        }
    }

    async fn probe(
        &self,
        method: &reqwest::Method,
        url: &str,
        source_id: &str,
        sub_index: u64,
        cancel: &CancellationToken,
    ) -> Result<BalanceResult, ProbeFailure> {
        debug!(
            "Probing source '{}' sub {} for {}",
            source_id,
            sub_index,
            redact_url(url, self.safe_logs)
        );

        let request = self.client.request(method.clone(), url);
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(ProbeFailure::Cancelled),
            result = request.send() => match result {
                Ok(response) => response,
                Err(e) => {
                    warn!(
                        "Probe failed for source '{}' sub {}: {}",
                        source_id, sub_index, e
                    );
                    return Err(ProbeFailure::Failed);
                }
            },
        };

        if response.status() != reqwest::StatusCode::OK {
            warn!(
                "Upstream '{}' sub {} answered HTTP {}",
                source_id,
                sub_index,
                response.status()
            );
            return Err(ProbeFailure::Failed);
        }

        let guard = self.concurrency.acquire(source_id);
        Ok(BalanceResult {
            response,
            url: url.to_string(),
            source_id: source_id.to_string(),
            sub_index,
            guard,
        })
    }

    /// Exponential backoff between laps with a little jitter, capped just
    /// under the stream timeout.
    async fn backoff(&self, lap: u32, cancel: &CancellationToken) -> Result<(), BalancerError> {
        let factor = 1u64 << (lap - 1).min(16);
        let base = self.retry_wait.saturating_mul(factor as u32);
        let wait = base.min(self.backoff_cap) + Duration::from_millis(fastrand::u64(0..250));
        debug!("Balancer lap {} exhausted, backing off {:?}", lap, wait);
        tokio::select! {
            _ = cancel.cancelled() => Err(BalancerError::Cancelled),
            _ = tokio::time::sleep(wait) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use axum::Router;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    /// Spawn a tiny upstream that records hits and answers with `status`.
    async fn spawn_upstream(
        status: axum::http::StatusCode,
        hits: Arc<Mutex<Vec<String>>>,
        label: &'static str,
    ) -> String {
        let app = Router::new().route(
            "/live/ch",
            get(move || {
                let hits = hits.clone();
                async move {
                    hits.lock().unwrap().push(label.to_string());
                    (status, "data")
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/live/ch", addr)
    }

    fn balancer(caps: &[(&str, i32)], max_retries: u32) -> LoadBalancer {
        let mut vars: Vec<(String, String)> = caps
            .iter()
            .map(|(id, _)| (format!("M3U_URL_{}", id), format!("http://{}", id)))
            .collect();
        vars.extend(
            caps.iter()
                .map(|(id, max)| (format!("M3U_MAX_CONCURRENCY_{}", id), max.to_string())),
        );
        vars.push(("MAX_RETRIES".to_string(), max_retries.to_string()));
        vars.push(("RETRY_WAIT".to_string(), "1".to_string()));
        let config = Config::from_vars(vars).unwrap();
        let concurrency = Arc::new(ConcurrencyManager::new(&config));
        LoadBalancer::new(&config, concurrency).unwrap()
    }

    fn channel(urls: &[(&str, u64, &str)]) -> StreamInfo {
        let mut map: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        for (source, line, url) in urls {
            map.entry(source.to_string()).or_default().insert(
                crate::ingestor::m3u_parser::hash_url(url),
                crate::models::format_url_record(*line, url),
            );
        }
        StreamInfo {
            title: "Channel".to_string(),
            tvg_id: String::new(),
            tvg_chno: String::new(),
            tvg_type: String::new(),
            logo_url: String::new(),
            group: String::new(),
            urls: map,
            source_m3u: "1".to_string(),
            source_index: 0,
        }
    }

    #[tokio::test]
    async fn probes_sources_by_priority_and_exhausts() {
        let hits = Arc::new(Mutex::new(Vec::new()));
        let url_a = spawn_upstream(axum::http::StatusCode::INTERNAL_SERVER_ERROR, hits.clone(), "cap3").await;
        let url_b = spawn_upstream(axum::http::StatusCode::INTERNAL_SERVER_ERROR, hits.clone(), "cap2").await;
        let url_c = spawn_upstream(axum::http::StatusCode::INTERNAL_SERVER_ERROR, hits.clone(), "cap1").await;

        let lb = balancer(&[("1", 3), ("2", 2), ("3", 1)], 1);
        let info = channel(&[("1", 0, &url_a), ("2", 0, &url_b), ("3", 0, &url_c)]);
        let cancel = CancellationToken::new();

        let err = lb
            .balance(reqwest::Method::GET, &info, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, BalancerError::AllExhausted { laps: 1, .. }));
        assert_eq!(
            hits.lock().unwrap().clone(),
            vec!["cap3", "cap2", "cap1"],
            "probe order must follow descending priority"
        );
    }

    #[tokio::test]
    async fn fails_over_to_healthy_source() {
        let hits = Arc::new(Mutex::new(Vec::new()));
        let bad = spawn_upstream(axum::http::StatusCode::BAD_GATEWAY, hits.clone(), "bad").await;
        let good = spawn_upstream(axum::http::StatusCode::OK, hits.clone(), "good").await;

        let lb = balancer(&[("1", 2), ("2", 1)], 2);
        let info = channel(&[("1", 0, &bad), ("2", 0, &good)]);
        let cancel = CancellationToken::new();

        let result = lb
            .balance(reqwest::Method::GET, &info, &cancel)
            .await
            .unwrap();
        assert_eq!(result.source_id, "2");
        assert_eq!(result.sub_index, 0);
        assert_eq!(lb.concurrency.current("2"), 1);
        drop(result);
        assert_eq!(lb.concurrency.current("2"), 0);
    }

    #[tokio::test]
    async fn empty_channel_is_no_urls() {
        let lb = balancer(&[("1", 1)], 1);
        let info = channel(&[]);
        let cancel = CancellationToken::new();
        let err = lb
            .balance(reqwest::Method::GET, &info, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, BalancerError::NoUrls { .. }));
    }

    #[tokio::test]
    async fn cancellation_stops_unbounded_retries() {
        let lb = balancer(&[("1", 1)], 0);
        let info = channel(&[("1", 0, "http://127.0.0.1:1/never")]);
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });
        let err = lb
            .balance(reqwest::Method::GET, &info, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, BalancerError::Cancelled));
    }

    #[tokio::test]
    async fn saturated_source_is_skipped() {
        let hits = Arc::new(Mutex::new(Vec::new()));
        let good = spawn_upstream(axum::http::StatusCode::OK, hits.clone(), "good").await;

        let lb = balancer(&[("1", 1)], 1);
        let info = channel(&[("1", 0, &good)]);
        let cancel = CancellationToken::new();

        let held = lb
            .balance(reqwest::Method::GET, &info, &cancel)
            .await
            .unwrap();
        // Slot taken; a second request finds the source saturated.
        let err = lb
            .balance(reqwest::Method::GET, &info, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, BalancerError::AllExhausted { .. }));
        drop(held);
    }
}
