use std::time::Duration;

/// 指数退避状态，由引擎实例独占持有
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    current: Duration,
    min: Duration,
    max: Duration,
}

impl ExponentialBackoff {
    pub const DEFAULT_MIN: Duration = Duration::from_secs(30);
    pub const DEFAULT_MAX: Duration = Duration::from_secs(300);

    pub fn new(min: Duration, max: Duration) -> Self {
        let max = max.max(min);
        Self {
            current: min,
            min,
            max,
        }
    }

    /// 返回本次应等待的时长，并把下一次的间隔翻倍（不超过上限）
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    /// 一次干净的运行之后回到最小间隔
    pub fn reset(&mut self) {
        self.current = self.min;
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn min(&self) -> Duration {
        self.min
    }

    pub fn max(&self) -> Duration {
        self.max
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MIN, Self::DEFAULT_MAX)
    }
}
