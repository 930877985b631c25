use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use subtle::ConstantTimeEq;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::store::NodeStore;
use crate::tokens::TokenRegistry;

/// Why an inbound stream was refused.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GuardError {
    #[error("rate limit exceeded")]
    RateLimited,
    #[error("peer is banned")]
    Banned,
    #[error("peer not whitelisted")]
    NotWhitelisted,
    #[error("missing or invalid token")]
    InvalidToken,
    #[error("shared secret mismatch")]
    BadSecret,
}

#[derive(Clone, Debug)]
pub struct GuardConfig {
    /// Requests allowed per peer per sliding window.
    pub max_requests_per_window: u32,
    pub window: Duration,
    /// Ban applied on rate-limit breach or repeated auth failures.
    pub ban_duration: Duration,
    /// Auth failures within a window before the peer is banned.
    pub max_auth_failures: u32,
    pub whitelist_enabled: bool,
    pub whitelist: HashSet<String>,
    /// When set, every stream must present a registered token.
    pub require_token: bool,
    pub sweep_interval: Duration,
    /// Peer-stat entries idle longer than this are swept.
    pub stats_idle_expiry: Duration,
}

impl Default for GuardConfig {
    fn default() -> Self {
        GuardConfig {
            max_requests_per_window: 120,
            window: Duration::from_secs(60),
            ban_duration: Duration::from_secs(300),
            max_auth_failures: 5,
            whitelist_enabled: false,
            whitelist: HashSet::new(),
            require_token: false,
            sweep_interval: Duration::from_secs(300),
            stats_idle_expiry: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug)]
struct PeerStats {
    request_count_in_window: u32,
    window_start: Instant,
    last_request_at: Instant,
    failed_auth_count: u32,
    banned_until: Option<Instant>,
}

impl PeerStats {
    fn fresh(now: Instant) -> Self {
        PeerStats {
            request_count_in_window: 0,
            window_start: now,
            last_request_at: now,
            failed_auth_count: 0,
            banned_until: None,
        }
    }
}

/// Authentication and rate-limiting gate for inbound streams.
///
/// Checks run in order: rate limit, whitelist, token, shared secret. Any
/// failure counts against the peer; repeated failures ban it. A background
/// sweeper purges expired tokens and stale stats every `sweep_interval`.
pub struct Guard {
    config: GuardConfig,
    tokens: Mutex<TokenRegistry>,
    stats: RwLock<HashMap<String, Arc<Mutex<PeerStats>>>>,
    secrets: RwLock<HashMap<String, [u8; 32]>>,
    stop: Mutex<Option<oneshot::Sender<()>>>,
    sweeper: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Guard {
    /// Builds the guard and starts its sweeper. Must be called from within a
    /// tokio runtime.
    pub fn new(config: GuardConfig, store: Arc<NodeStore>) -> Arc<Self> {
        let guard = Arc::new(Guard {
            config,
            tokens: Mutex::new(TokenRegistry::new()),
            stats: RwLock::new(HashMap::new()),
            secrets: RwLock::new(HashMap::new()),
            stop: Mutex::new(None),
            sweeper: Mutex::new(None),
        });

        let (stop_tx, mut stop_rx) = oneshot::channel();
        let sweeper_guard = Arc::clone(&guard);
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(sweeper_guard.config.sweep_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it so a fresh guard
            // does not sweep an empty state.
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = tick.tick() => sweeper_guard.sweep(&store),
                }
            }
            debug!("guard sweeper stopped");
        });

        *guard.stop.lock().expect("guard stop poisoned") = Some(stop_tx);
        *guard.sweeper.lock().expect("guard sweeper poisoned") = Some(handle);
        guard
    }

    /// Signals the sweeper and waits for it to exit. Idempotent.
    pub async fn close(&self) {
        let stop = self.stop.lock().expect("guard stop poisoned").take();
        if let Some(tx) = stop {
            let _ = tx.send(());
        }
        let handle = self.sweeper.lock().expect("guard sweeper poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Registers a token valid for `ttl`.
    pub fn issue_token(&self, token: &str, ttl: Duration) {
        self.tokens.lock().expect("tokens poisoned").issue(token, ttl);
    }

    pub fn revoke_token(&self, token: &str) {
        self.tokens.lock().expect("tokens poisoned").revoke(token);
    }

    /// Records the shared secret negotiated with `peer` (e.g. by the session
    /// handshake); subsequent streams from the peer must present it.
    pub fn set_shared_secret(&self, peer: &str, secret: [u8; 32]) {
        self.secrets
            .write()
            .expect("secrets poisoned")
            .insert(peer.to_string(), secret);
    }

    /// Runs the full admission sequence for one inbound stream.
    pub fn authenticate_stream(
        &self,
        peer: &str,
        token: Option<&str>,
        shared_secret: Option<&[u8]>,
    ) -> Result<(), GuardError> {
        self.check_rate(peer)?;

        if self.config.whitelist_enabled && !self.config.whitelist.contains(peer) {
            return Err(self.fail_auth(peer, GuardError::NotWhitelisted));
        }

        if self.config.require_token {
            let ok = token
                .map(|t| self.tokens.lock().expect("tokens poisoned").verify(t))
                .unwrap_or(false);
            if !ok {
                return Err(self.fail_auth(peer, GuardError::InvalidToken));
            }
        }

        if let Some(expected) = self.secrets.read().expect("secrets poisoned").get(peer) {
            let ok = shared_secret
                .map(|presented| bool::from(presented.ct_eq(expected)))
                .unwrap_or(false);
            if !ok {
                return Err(self.fail_auth(peer, GuardError::BadSecret));
            }
        }

        Ok(())
    }

    /// Counts a protocol violation (malformed frame, broken handshake)
    /// against the peer's auth-failure budget.
    pub fn note_protocol_violation(&self, peer: &str) {
        let _ = self.fail_auth(peer, GuardError::InvalidToken);
    }

    pub fn is_banned(&self, peer: &str) -> bool {
        let stats = self.stats.read().expect("stats poisoned");
        let Some(entry) = stats.get(peer) else {
            return false;
        };
        let entry = entry.lock().expect("stats entry poisoned");
        entry.banned_until.is_some_and(|until| until > Instant::now())
    }

    /// Sliding-window rate limit plus ban check. Counts the request.
    fn check_rate(&self, peer: &str) -> Result<(), GuardError> {
        let entry = self.stats_entry(peer);
        let mut stats = entry.lock().expect("stats entry poisoned");
        let now = Instant::now();

        if let Some(until) = stats.banned_until {
            if until > now {
                return Err(GuardError::Banned);
            }
            stats.banned_until = None;
            stats.failed_auth_count = 0;
            stats.request_count_in_window = 0;
            stats.window_start = now;
        }

        if now.duration_since(stats.window_start) > self.config.window {
            stats.window_start = now;
            stats.request_count_in_window = 0;
            stats.failed_auth_count = 0;
        }

        stats.request_count_in_window += 1;
        stats.last_request_at = now;

        if stats.request_count_in_window > self.config.max_requests_per_window {
            stats.banned_until = Some(now + self.config.ban_duration);
            info!(peer = %short(peer), "rate limit exceeded, peer banned");
            return Err(GuardError::RateLimited);
        }

        Ok(())
    }

    fn fail_auth(&self, peer: &str, err: GuardError) -> GuardError {
        let entry = self.stats_entry(peer);
        let mut stats = entry.lock().expect("stats entry poisoned");
        stats.failed_auth_count += 1;
        if stats.failed_auth_count >= self.config.max_auth_failures {
            stats.banned_until = Some(Instant::now() + self.config.ban_duration);
            info!(peer = %short(peer), failures = stats.failed_auth_count, "auth failures, peer banned");
        }
        err
    }

    fn stats_entry(&self, peer: &str) -> Arc<Mutex<PeerStats>> {
        if let Some(entry) = self.stats.read().expect("stats poisoned").get(peer) {
            return Arc::clone(entry);
        }
        let mut stats = self.stats.write().expect("stats poisoned");
        Arc::clone(
            stats
                .entry(peer.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(PeerStats::fresh(Instant::now())))),
        )
    }

    /// One sweep pass: expired tokens, stale stats, idle store records.
    fn sweep(&self, store: &NodeStore) {
        let purged = self.tokens.lock().expect("tokens poisoned").purge_expired();

        let now = Instant::now();
        let idle = self.config.stats_idle_expiry;
        let mut stats = self.stats.write().expect("stats poisoned");
        let before = stats.len();
        stats.retain(|_, entry| {
            let entry = entry.lock().expect("stats entry poisoned");
            let banned = entry.banned_until.is_some_and(|until| until > now);
            banned || now.duration_since(entry.last_request_at) < idle
        });
        let dropped = before - stats.len();
        drop(stats);

        let pruned = store.prune_idle(idle.as_secs(), |peer| self.is_banned(peer));
        debug!(purged, dropped, pruned, "guard sweep");
    }
}

fn short(peer: &str) -> &str {
    &peer[..peer.len().min(8)]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> GuardConfig {
        GuardConfig {
            max_requests_per_window: 5,
            window: Duration::from_secs(60),
            ban_duration: Duration::from_millis(50),
            ..Default::default()
        }
    }

    fn new_guard(config: GuardConfig) -> Arc<Guard> {
        Guard::new(config, Arc::new(NodeStore::new()))
    }

    #[tokio::test]
    async fn rate_limit_bans_and_recovers() {
        let guard = new_guard(test_config());

        for _ in 0..5 {
            assert_eq!(guard.authenticate_stream("peer-a", None, None), Ok(()));
        }
        assert_eq!(
            guard.authenticate_stream("peer-a", None, None),
            Err(GuardError::RateLimited)
        );
        // Still inside the cooldown.
        assert_eq!(
            guard.authenticate_stream("peer-a", None, None),
            Err(GuardError::Banned)
        );

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(guard.authenticate_stream("peer-a", None, None), Ok(()));
        guard.close().await;
    }

    #[tokio::test]
    async fn other_peers_unaffected_by_ban() {
        let guard = new_guard(test_config());
        for _ in 0..6 {
            let _ = guard.authenticate_stream("noisy", None, None);
        }
        assert!(guard.is_banned("noisy"));
        assert_eq!(guard.authenticate_stream("quiet", None, None), Ok(()));
        guard.close().await;
    }

    #[tokio::test]
    async fn token_required_and_expiry_checked() {
        let config = GuardConfig {
            require_token: true,
            ..test_config()
        };
        let guard = new_guard(config);
        guard.issue_token("tok", Duration::from_millis(1));

        assert_eq!(guard.authenticate_stream("peer-a", Some("tok"), None), Ok(()));
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(
            guard.authenticate_stream("peer-a", Some("tok"), None),
            Err(GuardError::InvalidToken)
        );
        assert_eq!(
            guard.authenticate_stream("peer-a", None, None),
            Err(GuardError::InvalidToken)
        );
        guard.close().await;
    }

    #[tokio::test]
    async fn five_auth_failures_ban_the_peer() {
        let config = GuardConfig {
            require_token: true,
            max_requests_per_window: 100,
            ..test_config()
        };
        let guard = new_guard(config);

        for _ in 0..5 {
            assert_eq!(
                guard.authenticate_stream("peer-a", Some("wrong"), None),
                Err(GuardError::InvalidToken)
            );
        }
        assert_eq!(
            guard.authenticate_stream("peer-a", Some("wrong"), None),
            Err(GuardError::Banned)
        );
        guard.close().await;
    }

    #[tokio::test]
    async fn shared_secret_is_verified_constant_time() {
        let guard = new_guard(test_config());
        guard.set_shared_secret("peer-a", [0x55; 32]);

        assert_eq!(
            guard.authenticate_stream("peer-a", None, Some(&[0x55; 32])),
            Ok(())
        );
        assert_eq!(
            guard.authenticate_stream("peer-a", None, Some(&[0x66; 32])),
            Err(GuardError::BadSecret)
        );
        assert_eq!(
            guard.authenticate_stream("peer-a", None, None),
            Err(GuardError::BadSecret)
        );
        guard.close().await;
    }

    #[tokio::test]
    async fn whitelist_gates_when_enabled() {
        let mut config = test_config();
        config.whitelist_enabled = true;
        config.whitelist.insert("trusted".to_string());
        let guard = new_guard(config);

        assert_eq!(guard.authenticate_stream("trusted", None, None), Ok(()));
        assert_eq!(
            guard.authenticate_stream("stranger", None, None),
            Err(GuardError::NotWhitelisted)
        );
        guard.close().await;
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let guard = new_guard(test_config());
        guard.close().await;
        guard.close().await;
    }
}
