//! Rate limiting and daily quotas over shared atomic counters.
//!
//! Counters live in Redis keyed by identifier, incremented atomically with
//! a TTL set only on first creation — eviction is expiry, never manual
//! pruning. When the counter store is unreachable both checks fail OPEN:
//! availability of the product outranks strict enforcement while the
//! dependency is degraded.

use chrono::Utc;
use redis::aio::ConnectionManager;

/// Expiry for daily quota keys: two days tolerates timezone skew around the
/// UTC day boundary.
const QUOTA_EXPIRY_SECS: u64 = 48 * 3600;

pub struct RateLimiter {
    conn: Option<ConnectionManager>,
}

impl RateLimiter {
    /// Connect to the shared counter store. Any connection failure degrades
    /// to allow-all instead of blocking the caller.
    pub async fn connect(redis_url: &str) -> Self {
        let client = match redis::Client::open(redis_url) {
            Ok(client) => client,
            Err(e) => {
                tracing::warn!("Invalid counter store URL, rate limiting disabled: {}", e);
                return Self::disabled();
            }
        };

        match client.get_connection_manager().await {
            Ok(conn) => {
                tracing::info!("Rate limiter connected to counter store");
                Self { conn: Some(conn) }
            }
            Err(e) => {
                tracing::warn!("Counter store unreachable, rate limiting disabled: {}", e);
                Self::disabled()
            }
        }
    }

    /// A limiter with no backing store; every check allows.
    pub fn disabled() -> Self {
        Self { conn: None }
    }

    /// Count one request against `identifier`'s window budget.
    /// Returns true when the request is allowed.
    pub async fn check_rate_limit(
        &self,
        identifier: &str,
        max_requests: u32,
        window_secs: u64,
    ) -> bool {
        self.check(&rate_limit_key(identifier), i64::from(max_requests), window_secs)
            .await
    }

    /// Count one use of `feature` against the user's daily budget.
    pub async fn check_quota(&self, user_id: &str, feature: &str, max_per_day: u32) -> bool {
        let date = Utc::now().format("%Y-%m-%d").to_string();
        self.check(
            &quota_key(feature, user_id, &date),
            i64::from(max_per_day),
            QUOTA_EXPIRY_SECS,
        )
        .await
    }

    /// Atomic increment with first-writer expiry. No read-then-write: the
    /// post-INCR value decides, so concurrent callers cannot race a stale
    /// count.
    async fn check(&self, key: &str, budget: i64, window_secs: u64) -> bool {
        let Some(conn) = &self.conn else { return true };
        let mut conn = conn.clone();

        let count: i64 = match redis::cmd("INCR").arg(key).query_async(&mut conn).await {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!("Counter INCR failed, failing open: {}", e);
                return true;
            }
        };

        if count == 1 {
            // First creation owns the window expiry.
            if let Err(e) = redis::cmd("EXPIRE")
                .arg(key)
                .arg(window_secs)
                .query_async::<i64>(&mut conn)
                .await
            {
                tracing::warn!("Counter EXPIRE failed for {}: {}", key, e);
            }
        }

        if count > budget {
            tracing::info!("Rate limit hit for {} ({} > {})", key, count, budget);
        }
        count <= budget
    }
}

fn rate_limit_key(identifier: &str) -> String {
    format!("ratelimit:{}", identifier)
}

fn quota_key(feature: &str, user_id: &str, date: &str) -> String {
    format!("quota:{}:{}:{}", feature, user_id, date)
}
