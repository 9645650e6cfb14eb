//! 重试策略：指数退避 + 抖动
//!
//! 三个层级各自一份 RetryPolicy：连接建立、单次工具调用、管理层（强制重建连接）。
//! 退避公式 `min(base * 2^attempt, max_backoff) * jitter(1-j ..= 1+j)`。
//! 等待挂在 CancellationToken 上，所属作用域取消时立即返回。

use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

/// 单层重试参数
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// 最多尝试次数（含第一次）
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// 抖动比例，0.2 表示乘数取自 0.8..=1.2
    pub jitter: f64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_backoff,
            max_backoff,
            jitter: 0.2,
        }
    }

    /// 不带抖动的退避时长：min(base * 2^attempt, max_backoff)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    /// 带抖动的退避时长
    pub fn jittered_backoff(&self, attempt: u32) -> Duration {
        let base = self.backoff(attempt);
        if self.jitter <= 0.0 {
            return base;
        }
        let factor = rand::thread_rng().gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        base.mul_f64(factor)
    }

    /// 第 attempt 次（从 0 计）失败后是否还有下一次
    pub fn has_next(&self, attempt: u32) -> bool {
        attempt + 1 < self.max_attempts
    }
}

/// 三个层级的重试策略
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicies {
    pub connect: RetryPolicy,
    pub tool_call: RetryPolicy,
    pub manager: RetryPolicy,
}

impl Default for RetryPolicies {
    fn default() -> Self {
        Self {
            connect: RetryPolicy::new(3, Duration::from_secs(1), Duration::from_secs(10)),
            tool_call: RetryPolicy::new(3, Duration::from_secs(1), Duration::from_secs(10)),
            manager: RetryPolicy::new(2, Duration::from_secs(2), Duration::from_secs(10)),
        }
    }
}

/// 退避等待被取消
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

/// 按策略退避；token 取消时提前返回 Err(Cancelled)
pub async fn backoff_sleep(
    policy: &RetryPolicy,
    attempt: u32,
    cancel: &CancellationToken,
) -> Result<(), Cancelled> {
    let delay = policy.jittered_backoff(attempt);
    tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "Backing off");
    tokio::select! {
        _ = tokio::time::sleep(delay) => Ok(()),
        _ = cancel.cancelled() => Err(Cancelled),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_until_cap() {
        let policy = RetryPolicy::new(10, Duration::from_millis(100), Duration::from_millis(1_000));
        let delays: Vec<_> = (0..7).map(|k| policy.backoff(k)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(800),
                Duration::from_millis(1_000),
                Duration::from_millis(1_000),
                Duration::from_millis(1_000),
            ]
        );
        for pair in delays.windows(2) {
            if pair[0] < policy.max_backoff {
                assert!(pair[1] > pair[0]);
            } else {
                assert_eq!(pair[1], pair[0]);
            }
        }
    }

    #[test]
    fn test_backoff_huge_attempt_does_not_overflow() {
        let policy = RetryPolicy::new(3, Duration::from_secs(1), Duration::from_secs(10));
        assert_eq!(policy.backoff(64), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1_000), Duration::from_millis(10_000));
        for _ in 0..200 {
            let d = policy.jittered_backoff(1);
            assert!(d >= Duration::from_millis(1_600), "{d:?}");
            assert!(d <= Duration::from_millis(2_400), "{d:?}");
        }
    }

    #[test]
    fn test_has_next() {
        let policy = RetryPolicy::new(3, Duration::ZERO, Duration::ZERO);
        assert!(policy.has_next(0));
        assert!(policy.has_next(1));
        assert!(!policy.has_next(2));
    }

    #[tokio::test]
    async fn test_sleep_cancelled() {
        let policy = RetryPolicy::new(3, Duration::from_secs(60), Duration::from_secs(60));
        let token = CancellationToken::new();
        token.cancel();
        let started = std::time::Instant::now();
        assert_eq!(backoff_sleep(&policy, 0, &token).await, Err(Cancelled));
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
