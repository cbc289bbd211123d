use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use crate::errors::{Result, UploadError};

/// 重试策略
#[derive(Debug, Clone, PartialEq)]
pub enum RetryStrategy {
    /// 固定延迟
    Fixed(Duration),
    /// 指数退避
    Exponential {
        initial: Duration,
        multiplier: f64,
        max_delay: Duration,
    },
}

impl Default for RetryStrategy {
    fn default() -> Self {
        RetryStrategy::Exponential {
            initial: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryStrategy {
    /// 计算第 n 次重试的延迟 (n 从 0 开始)
    pub fn get_delay(&self, attempt: u32) -> Duration {
        match self {
            RetryStrategy::Fixed(delay) => *delay,
            RetryStrategy::Exponential { initial, multiplier, max_delay } => {
                let delay = initial.as_secs_f64() * multiplier.powf(attempt as f64);
                if !delay.is_finite() || delay >= max_delay.as_secs_f64() {
                    return *max_delay;
                }
                Duration::from_secs_f64(delay)
            }
        }
    }
}

/// 重试配置
pub struct RetryConfig {
    /// 最大尝试次数
    pub max_attempts: u32,
    pub strategy: RetryStrategy,
    /// 是否重试的判断函数
    pub should_retry: Box<dyn Fn(&UploadError) -> bool + Send + Sync>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            strategy: RetryStrategy::default(),
            should_retry: Box::new(UploadError::is_retryable),
        }
    }
}

impl RetryConfig {
    pub fn with_strategy(max_attempts: u32, strategy: RetryStrategy) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            strategy,
            ..Self::default()
        }
    }
}

/// 执行带重试的操作
pub async fn retry_with_config<F, Fut, T>(config: &RetryConfig, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(error) => {
                attempt += 1;
                if attempt >= config.max_attempts || !(config.should_retry)(&error) {
                    return Err(error);
                }

                let delay = config.strategy.get_delay(attempt - 1);
                tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, error = %error, "retrying");
                sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_delay_is_capped() {
        let strategy = RetryStrategy::default();
        assert_eq!(strategy.get_delay(0), Duration::from_secs(1));
        assert_eq!(strategy.get_delay(3), Duration::from_secs(8));
        assert_eq!(strategy.get_delay(10), Duration::from_secs(60));
        assert_eq!(strategy.get_delay(5000), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_retry_success() {
        let config = RetryConfig::with_strategy(3, RetryStrategy::Fixed(Duration::from_millis(1)));
        let mut count = 0;
        let result = retry_with_config(&config, || {
            count += 1;
            let attempt = count;
            async move {
                if attempt < 3 {
                    Err(UploadError::TransientNetwork("reset".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up() {
        let config = RetryConfig::with_strategy(3, RetryStrategy::Fixed(Duration::from_millis(1)));
        let mut count = 0;
        let result = retry_with_config(&config, || {
            count += 1;
            async { Err::<(), _>(UploadError::TransientNetwork("reset".into())) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn non_retryable_errors_fail_fast() {
        let config = RetryConfig::with_strategy(5, RetryStrategy::Fixed(Duration::from_millis(1)));
        let mut count = 0;
        let result = retry_with_config(&config, || {
            count += 1;
            async { Err::<(), _>(UploadError::SessionNotFound("t".into())) }
        })
        .await;

        assert!(matches!(result, Err(UploadError::SessionNotFound(_))));
        assert_eq!(count, 1);
    }
}
