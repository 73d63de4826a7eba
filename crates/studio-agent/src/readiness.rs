use std::time::Duration;

use anyhow::Context;
use reqwest::Url;
use tokio::sync::watch;

use crate::services::ReadinessCheck;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Ready { attempts: u32 },
    Exhausted { attempts: u32, last_error: String },
    /// The process left `Starting` while we were probing.
    Cancelled { attempts: u32 },
}

/// `localhost` resolves to `::1` first on some platforms while the services
/// bind IPv4 only. Always probe the IPv4 loopback.
pub fn pin_loopback(raw: &str) -> anyhow::Result<Url> {
    let mut url = Url::parse(raw).with_context(|| format!("invalid readiness url: {raw}"))?;
    if url.host_str() == Some("localhost") {
        url.set_host(Some("127.0.0.1"))
            .map_err(|e| anyhow::anyhow!("rewrite host for {raw}: {e}"))?;
    }
    Ok(url)
}

async fn cancelled(rx: &mut watch::Receiver<bool>) {
    // A dropped sender also means the attempt is over.
    let _ = rx.wait_for(|c| *c).await;
}

#[derive(Debug, Clone)]
pub struct ReadinessProber {
    client: reqwest::Client,
}

impl ReadinessProber {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("studio-agent/", env!("CARGO_PKG_VERSION")))
            .no_proxy()
            .pool_max_idle_per_host(0)
            .build()
            .context("build readiness http client")?;
        Ok(Self { client })
    }

    async fn attempt(&self, url: &Url, timeout: Duration) -> Result<(), String> {
        let fut = self.client.get(url.clone()).timeout(timeout).send();
        match tokio::time::timeout(timeout, fut).await {
            Err(_) => Err(format!("timed out after {}ms", timeout.as_millis())),
            Ok(Err(e)) => Err(e.to_string()),
            Ok(Ok(resp)) if resp.status().is_success() => Ok(()),
            Ok(Ok(resp)) => Err(format!("status {}", resp.status())),
        }
    }

    /// Polls `check.url` until it answers 2xx, the budget runs out, or `cancel` flips.
    pub async fn wait_ready(
        &self,
        check: &ReadinessCheck,
        cancel: &mut watch::Receiver<bool>,
    ) -> ProbeOutcome {
        let max_attempts = check.max_attempts.max(1);
        let url = match pin_loopback(&check.url) {
            Ok(u) => u,
            Err(e) => {
                return ProbeOutcome::Exhausted {
                    attempts: 0,
                    last_error: e.to_string(),
                };
            }
        };

        let mut last_error = String::new();
        for attempt in 1..=max_attempts {
            if *cancel.borrow() {
                return ProbeOutcome::Cancelled {
                    attempts: attempt - 1,
                };
            }

            let result = tokio::select! {
                biased;
                _ = cancelled(cancel) => {
                    return ProbeOutcome::Cancelled { attempts: attempt };
                }
                r = self.attempt(&url, check.timeout) => r,
            };

            match result {
                Ok(()) => {
                    tracing::debug!(%url, attempt, "readiness check passed");
                    return ProbeOutcome::Ready { attempts: attempt };
                }
                Err(e) => {
                    tracing::trace!(%url, attempt, error = %e, "readiness attempt failed");
                    last_error = e;
                }
            }

            if attempt == max_attempts {
                break;
            }

            tokio::select! {
                biased;
                _ = cancelled(cancel) => {
                    return ProbeOutcome::Cancelled { attempts: attempt };
                }
                _ = tokio::time::sleep(check.interval) => {}
            }
        }

        ProbeOutcome::Exhausted {
            attempts: max_attempts,
            last_error,
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    };

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Loopback HTTP responder. `status_for(n)` picks the status of the n-th
    /// request (1-based).
    pub(crate) struct TestServer {
        pub(crate) port: u16,
        pub(crate) hits: Arc<AtomicU32>,
        task: tokio::task::JoinHandle<()>,
    }

    impl TestServer {
        pub(crate) async fn start(status_for: impl Fn(u32) -> u16 + Send + Sync + 'static) -> Self {
            let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
            let port = listener.local_addr().unwrap().port();
            let hits = Arc::new(AtomicU32::new(0));
            let counter = hits.clone();
            let status_for = Arc::new(status_for);
            let task = tokio::spawn(async move {
                loop {
                    let Ok((mut sock, _)) = listener.accept().await else {
                        break;
                    };
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    let code = status_for(n);
                    tokio::spawn(async move {
                        let mut buf = vec![0u8; 4096];
                        let mut seen = Vec::new();
                        while !seen.windows(4).any(|w| w == b"\r\n\r\n") {
                            match sock.read(&mut buf).await {
                                Ok(0) | Err(_) => return,
                                Ok(n) => seen.extend_from_slice(&buf[..n]),
                            }
                        }
                        let resp = format!(
                            "HTTP/1.1 {code} X\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok"
                        );
                        let _ = sock.write_all(resp.as_bytes()).await;
                        let _ = sock.shutdown().await;
                    });
                }
            });
            Self { port, hits, task }
        }

        pub(crate) fn hits(&self) -> u32 {
            self.hits.load(Ordering::SeqCst)
        }

        pub(crate) fn url(&self) -> String {
            format!("http://localhost:{}/", self.port)
        }
    }

    impl Drop for TestServer {
        fn drop(&mut self) {
            self.task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::TestServer;
    use super::*;

    fn check(url: String, interval_ms: u64, max_attempts: u32) -> ReadinessCheck {
        ReadinessCheck {
            url,
            timeout: Duration::from_millis(500),
            interval: Duration::from_millis(interval_ms),
            max_attempts,
        }
    }

    #[test]
    fn localhost_is_pinned_to_ipv4() {
        let url = pin_loopback("http://localhost:18888/health").unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:18888/health");
        let other = pin_loopback("http://10.0.0.2:80/").unwrap();
        assert_eq!(other.host_str(), Some("10.0.0.2"));
        assert!(pin_loopback("not a url").is_err());
    }

    #[tokio::test]
    async fn resolves_on_first_success_and_stops_probing() {
        let server = TestServer::start(|n| if n < 3 { 503 } else { 200 }).await;
        let prober = ReadinessProber::new().unwrap();
        let (_tx, mut rx) = watch::channel(false);

        let out = prober.wait_ready(&check(server.url(), 20, 10), &mut rx).await;
        assert_eq!(out, ProbeOutcome::Ready { attempts: 3 });

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(server.hits(), 3);
    }

    #[tokio::test]
    async fn exhausts_after_exact_attempt_budget() {
        let server = TestServer::start(|_| 500).await;
        let prober = ReadinessProber::new().unwrap();
        let (_tx, mut rx) = watch::channel(false);

        let started = tokio::time::Instant::now();
        let out = prober.wait_ready(&check(server.url(), 60, 4), &mut rx).await;
        let elapsed = started.elapsed();

        match out {
            ProbeOutcome::Exhausted {
                attempts,
                last_error,
            } => {
                assert_eq!(attempts, 4);
                assert!(last_error.contains("500"), "{last_error}");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(server.hits(), 4);
        // Three intervals separate four attempts.
        assert!(elapsed >= Duration::from_millis(180), "{elapsed:?}");
    }

    #[tokio::test]
    async fn connection_refused_counts_as_failed_attempt() {
        let port = {
            let l = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
            l.local_addr().unwrap().port()
        };
        let prober = ReadinessProber::new().unwrap();
        let (_tx, mut rx) = watch::channel(false);
        let out = prober
            .wait_ready(&check(format!("http://localhost:{port}/"), 10, 2), &mut rx)
            .await;
        assert!(matches!(out, ProbeOutcome::Exhausted { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn cancel_stops_probing_immediately() {
        let server = TestServer::start(|_| 503).await;
        let prober = ReadinessProber::new().unwrap();
        let (tx, mut rx) = watch::channel(false);

        let c = check(server.url(), 1_000, 100);
        let handle = tokio::spawn(async move { prober.wait_ready(&c, &mut rx).await });
        tokio::time::sleep(Duration::from_millis(150)).await;
        tx.send(true).unwrap();

        let out = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("probe did not stop")
            .unwrap();
        assert!(matches!(out, ProbeOutcome::Cancelled { .. }));
        let hits = server.hits();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(server.hits(), hits);
    }

    #[tokio::test]
    async fn already_cancelled_issues_no_request() {
        let server = TestServer::start(|_| 200).await;
        let prober = ReadinessProber::new().unwrap();
        let (tx, mut rx) = watch::channel(false);
        tx.send(true).unwrap();
        let out = prober.wait_ready(&check(server.url(), 10, 5), &mut rx).await;
        assert_eq!(out, ProbeOutcome::Cancelled { attempts: 0 });
        assert_eq!(server.hits(), 0);
    }
}
