use std::{fmt, net::SocketAddr, time::Duration};

/// How tandem decides a freshly spawned child can be depended upon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// Ready as soon as it is spawned.
    Immediate,
    /// Fixed settle time; the fallback when no liveness signal exists.
    Delay(Duration),
    /// Any 2xx answer from this URL.
    Http(String),
    /// A TCP connect succeeds.
    Tcp(SocketAddr),
}

impl fmt::Display for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Readiness::Immediate => f.write_str("immediate"),
            Readiness::Delay(d) => write!(f, "delay {}ms", d.as_millis()),
            Readiness::Http(url) => write!(f, "GET {url}"),
            Readiness::Tcp(addr) => write!(f, "tcp {addr}"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ProbeBudget {
    pub timeout: Duration,
    pub interval: Duration,
}

impl Default for ProbeBudget {
    fn default() -> Self {
        Self {
            timeout: crate::config::readiness_timeout(),
            interval: crate::config::readiness_interval(),
        }
    }
}

/// Polls until the readiness condition holds. Returns `false` once the budget
/// is spent.
pub async fn wait_ready(readiness: &Readiness, budget: ProbeBudget) -> bool {
    match readiness {
        Readiness::Immediate => true,
        Readiness::Delay(d) => {
            tokio::time::sleep(*d).await;
            true
        }
        Readiness::Http(url) => wait_for_http(url, budget).await,
        Readiness::Tcp(addr) => wait_for_tcp(*addr, budget).await,
    }
}

async fn wait_for_tcp(addr: SocketAddr, budget: ProbeBudget) -> bool {
    let deadline = tokio::time::Instant::now() + budget.timeout;
    loop {
        if let Ok(s) = tokio::net::TcpStream::connect(addr).await {
            drop(s);
            return true;
        }

        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(budget.interval).await;
    }
}

/// HTTP client for the local health endpoints. Every target is on this
/// machine, so `HTTP_PROXY` and friends are ignored.
pub(crate) fn local_http_client(timeout: Duration) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder().no_proxy().timeout(timeout).build()
}

async fn wait_for_http(url: &str, budget: ProbeBudget) -> bool {
    let client = match local_http_client(budget.interval.max(Duration::from_secs(2))) {
        Ok(c) => c,
        Err(err) => {
            tracing::warn!(%err, "failed to build readiness http client");
            return false;
        }
    };

    let deadline = tokio::time::Instant::now() + budget.timeout;
    let mut attempts: u32 = 0;
    loop {
        attempts = attempts.saturating_add(1);
        match client.get(url).send().await {
            Ok(resp) if resp.status().is_success() => {
                tracing::debug!(%url, attempts, "readiness probe passed");
                return true;
            }
            Ok(resp) => {
                tracing::trace!(%url, status = %resp.status(), "readiness probe not yet ok");
            }
            Err(err) => {
                tracing::trace!(%url, %err, "readiness probe failed");
            }
        }

        if tokio::time::Instant::now() >= deadline {
            tracing::debug!(%url, attempts, "readiness budget exhausted");
            return false;
        }
        tokio::time::sleep(budget.interval).await;
    }
}
