//! Caller-side route selection between a direct connection to a host and
//! its relay circuit.
//!
//! Both routes are pinged over `/ping/1.0.0` when the gateway starts and then
//! on a fixed interval. A direct route answering within the RTT threshold is
//! always preferred; a slower one only loses to a relay that answers faster.
//! A request sent over the direct route that fails is retried once over the
//! relay.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use hyper::{Method, Response};
use libp2p::{Multiaddr, PeerId};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::client::PeerClient;
use crate::error::HostError;
use crate::node;

pub const DEFAULT_RTT_THRESHOLD: Duration = Duration::from_millis(200);
pub const DEFAULT_RTT_CHECK_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteKind {
    Direct,
    Relay,
}

impl fmt::Display for RouteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteKind::Direct => f.write_str("direct"),
            RouteKind::Relay => f.write_str("relay"),
        }
    }
}

/// Outcome of the latest check of one route. A route that was never checked
/// is unavailable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouteStatus {
    pub available: bool,
    pub rtt: Option<Duration>,
    pub last_check: Option<Instant>,
}

impl RouteStatus {
    fn observed(rtt: Option<Duration>) -> Self {
        Self {
            available: rtt.is_some(),
            rtt,
            last_check: Some(Instant::now()),
        }
    }

    fn rtt_or_max(&self) -> Duration {
        self.rtt.unwrap_or(Duration::MAX)
    }
}

#[derive(Debug, Clone)]
pub struct RouteSelector {
    threshold: Duration,
    direct: RouteStatus,
    relay: RouteStatus,
}

impl RouteSelector {
    pub fn new(threshold: Duration) -> Self {
        Self {
            threshold,
            direct: RouteStatus::default(),
            relay: RouteStatus::default(),
        }
    }

    /// Record a check result; `None` marks the route unavailable.
    pub fn update(&mut self, route: RouteKind, rtt: Option<Duration>) {
        let status = RouteStatus::observed(rtt);
        match route {
            RouteKind::Direct => self.direct = status,
            RouteKind::Relay => self.relay = status,
        }
    }

    pub fn status(&self, route: RouteKind) -> RouteStatus {
        match route {
            RouteKind::Direct => self.direct,
            RouteKind::Relay => self.relay,
        }
    }

    pub fn select(&self) -> RouteKind {
        if !self.direct.available {
            return RouteKind::Relay;
        }
        if !self.relay.available {
            return RouteKind::Direct;
        }

        let direct = self.direct.rtt_or_max();
        if direct <= self.threshold {
            RouteKind::Direct
        } else if self.relay.rtt_or_max() < direct {
            RouteKind::Relay
        } else {
            RouteKind::Direct
        }
    }
}

/// One way of reaching the host.
#[async_trait]
pub trait Route: Send + Sync {
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Bytes,
    ) -> Result<Response<Bytes>, HostError>;

    async fn ping(&self) -> Result<Duration, HostError>;
}

#[async_trait]
impl Route for PeerClient {
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Bytes,
    ) -> Result<Response<Bytes>, HostError> {
        self.fetch(method, path, body).await
    }

    async fn ping(&self) -> Result<Duration, HostError> {
        self.rtt().await
    }
}

/// A route that dials the host's own listen addresses on first use and
/// redials after a failure.
pub struct DirectRoute {
    target: PeerId,
    addrs: Vec<Multiaddr>,
    timeout: Duration,
    client: tokio::sync::Mutex<Option<Arc<PeerClient>>>,
}

impl DirectRoute {
    pub fn new(target: PeerId, addrs: Vec<Multiaddr>, timeout: Duration) -> Self {
        let addrs = addrs
            .into_iter()
            .filter(|addr| !node::is_relayed(addr))
            .collect();
        Self {
            target,
            addrs,
            timeout,
            client: tokio::sync::Mutex::new(None),
        }
    }

    async fn client(&self) -> Result<Arc<PeerClient>, HostError> {
        let mut slot = self.client.lock().await;
        if let Some(client) = slot.as_ref() {
            return Ok(client.clone());
        }
        let client =
            Arc::new(PeerClient::connect_direct(self.target, &self.addrs, self.timeout).await?);
        *slot = Some(client.clone());
        Ok(client)
    }

    async fn forget<T>(&self, result: Result<T, HostError>) -> Result<T, HostError> {
        if result.is_err() {
            self.client.lock().await.take();
        }
        result
    }
}

#[async_trait]
impl Route for DirectRoute {
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Bytes,
    ) -> Result<Response<Bytes>, HostError> {
        let client = self.client().await?;
        let result = client.fetch(method, path, body).await;
        self.forget(result).await
    }

    async fn ping(&self) -> Result<Duration, HostError> {
        let client = self.client().await?;
        let result = client.rtt().await;
        self.forget(result).await
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub rtt_threshold: Duration,
    pub check_interval: Duration,
    /// Bound for every connect step of either route.
    pub timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            rtt_threshold: DEFAULT_RTT_THRESHOLD,
            check_interval: DEFAULT_RTT_CHECK_INTERVAL,
            timeout: Duration::from_secs(30),
        }
    }
}

pub struct Gateway<D, R> {
    direct: Arc<D>,
    relay: Arc<R>,
    selector: Arc<Mutex<RouteSelector>>,
    monitor: Option<JoinHandle<()>>,
}

impl Gateway<DirectRoute, PeerClient> {
    /// Connect through the circuit address of a host and keep `direct_addrs`
    /// as the direct route. Both routes are checked once before returning.
    pub async fn connect(
        target_addr: &Multiaddr,
        direct_addrs: Vec<Multiaddr>,
        config: GatewayConfig,
    ) -> Result<Self, HostError> {
        let relay = PeerClient::connect(target_addr, config.timeout).await?;
        let direct = DirectRoute::new(relay.target(), direct_addrs, config.timeout);

        let mut gateway = Self::new(direct, relay, config.rtt_threshold);
        gateway.check().await;
        gateway.start_monitor(config.check_interval);
        Ok(gateway)
    }
}

impl<D, R> Gateway<D, R>
where
    D: Route + 'static,
    R: Route + 'static,
{
    /// A gateway with both routes unchecked, so everything goes over the
    /// relay until the first check.
    pub fn new(direct: D, relay: R, threshold: Duration) -> Self {
        Self {
            direct: Arc::new(direct),
            relay: Arc::new(relay),
            selector: Arc::new(Mutex::new(RouteSelector::new(threshold))),
            monitor: None,
        }
    }

    /// Ping both routes now and return the route selected afterwards.
    pub async fn check(&self) -> RouteKind {
        check_routes(self.direct.as_ref(), self.relay.as_ref(), &self.selector).await
    }

    /// Re-check both routes every `interval`. Replaces a monitor started
    /// earlier.
    pub fn start_monitor(&mut self, interval: Duration) {
        self.stop_monitor();

        let direct = self.direct.clone();
        let relay = self.relay.clone();
        let selector = self.selector.clone();
        self.monitor = Some(tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                check_routes(direct.as_ref(), relay.as_ref(), &selector).await;
            }
        }));
    }

    pub fn stop_monitor(&mut self) {
        if let Some(monitor) = self.monitor.take() {
            monitor.abort();
        }
    }

    pub fn selected(&self) -> RouteKind {
        lock(&self.selector).select()
    }

    pub fn status(&self, route: RouteKind) -> RouteStatus {
        lock(&self.selector).status(route)
    }

    /// Send one request over the selected route. A failed direct attempt
    /// marks the direct route unavailable and is retried over the relay;
    /// relay failures are returned as is.
    pub async fn fetch(
        &self,
        method: Method,
        path: &str,
        body: Bytes,
    ) -> Result<Response<Bytes>, HostError> {
        if self.selected() == RouteKind::Direct {
            match self.direct.send(method.clone(), path, body.clone()).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    warn!("direct route failed, falling back to relay: {}", e);
                    lock(&self.selector).update(RouteKind::Direct, None);
                }
            }
        }
        self.relay.send(method, path, body).await
    }
}

impl<D, R> Drop for Gateway<D, R> {
    fn drop(&mut self) {
        if let Some(monitor) = self.monitor.take() {
            monitor.abort();
        }
    }
}

fn lock(selector: &Mutex<RouteSelector>) -> MutexGuard<'_, RouteSelector> {
    selector
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn check_routes<D, R>(direct: &D, relay: &R, selector: &Mutex<RouteSelector>) -> RouteKind
where
    D: Route + ?Sized,
    R: Route + ?Sized,
{
    let (direct_rtt, relay_rtt) = tokio::join!(direct.ping(), relay.ping());
    let direct_rtt = direct_rtt
        .map_err(|e| debug!("direct route unavailable: {}", e))
        .ok();
    let relay_rtt = relay_rtt
        .map_err(|e| debug!("relay route unavailable: {}", e))
        .ok();

    let mut selector = lock(selector);
    let before = selector.select();
    selector.update(RouteKind::Direct, direct_rtt);
    selector.update(RouteKind::Relay, relay_rtt);
    let after = selector.select();
    if after != before {
        info!(
            "switching to {} route (direct {:?}, relay {:?})",
            after, direct_rtt, relay_rtt
        );
    }
    after
}
