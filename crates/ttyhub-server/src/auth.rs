use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

/// Issued tokens outlive the login response by this much.
pub const TOKEN_TTL: Duration = Duration::from_secs(15 * 60);

struct WindowCounter {
    started: Instant,
    count: u32,
}

/// Credential check, short-lived token issuance, and login rate limiting.
///
/// Passed explicitly to whatever needs to validate tokens; there is no
/// process-wide instance.
pub struct AuthService {
    username: String,
    password: String,
    tokens: Mutex<HashMap<String, Instant>>,
    attempts: Mutex<HashMap<IpAddr, WindowCounter>>,
    window: Duration,
    max_attempts: u32,
}

impl AuthService {
    pub fn new(username: String, password: String, window: Duration, max_attempts: u32) -> Self {
        Self {
            username,
            password,
            tokens: Mutex::new(HashMap::new()),
            attempts: Mutex::new(HashMap::new()),
            window,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn check_credentials(&self, username: &str, password: &str) -> bool {
        username == self.username && password == self.password
    }

    /// Mint a short-lived token for a logged-in client.
    pub fn issue_token(&self) -> String {
        let token = uuid::Uuid::new_v4().to_string();
        let mut tokens = self
            .tokens
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        tokens.insert(token.clone(), Instant::now() + TOKEN_TTL);
        token
    }

    pub fn validate_token(&self, token: &str) -> bool {
        let now = Instant::now();
        let mut tokens = self
            .tokens
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        tokens.retain(|_, expiry| *expiry > now);
        tokens.contains_key(token)
    }

    /// Fixed-window rate limit per client address. Returns whether this
    /// attempt may proceed; a denied attempt is not counted twice.
    pub fn allow_attempt(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let mut attempts = self
            .attempts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let counter = attempts.entry(ip).or_insert(WindowCounter {
            started: now,
            count: 0,
        });
        if now.duration_since(counter.started) > self.window {
            counter.started = now;
            counter.count = 0;
        }
        if counter.count >= self.max_attempts {
            warn!(%ip, "login rate limit exceeded");
            return false;
        }
        counter.count += 1;
        debug!(%ip, count = counter.count, "login attempt");
        true
    }
}
