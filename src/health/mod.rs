//! Rebalancing health derived from rolling success and rejection counts.
//! The system is down only when quotes are being rejected and nothing is
//! completing; idle is healthy.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument};

use crate::error::AppResult;
use crate::rebalance::RebalanceStore;
use crate::rejections::RejectionStore;

const DEFAULT_WINDOW_MINUTES: u32 = 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub is_healthy: bool,
    pub success_count: u64,
    pub rejection_count: u64,
    pub last_hour_has_rejections: bool,
    pub last_hour_has_successes: bool,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthMetrics {
    pub window_minutes: u32,
    pub success_count: u64,
    pub rejection_count: u64,
    /// 0-100
    pub success_rate: Decimal,
    pub is_healthy: bool,
    pub reason: String,
}

/// Down iff there were rejections and no successes
pub fn is_healthy(has_rejections: bool, has_successes: bool) -> bool {
    !(has_rejections && !has_successes)
}

fn status_reason(successes: u64, rejections: u64) -> String {
    match (rejections > 0, successes > 0) {
        (true, false) => format!(
            "System DOWN: {} rejections in last hour with no successful rebalances",
            rejections
        ),
        (false, false) => "System IDLE: No rebalancing activity in last hour".to_string(),
        (false, true) => format!(
            "System HEALTHY: {} successful rebalances with no rejections in last hour",
            successes
        ),
        (true, true) => format!(
            "System FUNCTIONAL: {} successes and {} rejections in last hour",
            successes, rejections
        ),
    }
}

fn metrics_reason(successes: u64, rejections: u64, success_rate: Decimal, window: u32) -> String {
    if successes + rejections == 0 {
        return format!(
            "System IDLE: No rebalancing activity in last {} minutes",
            window
        );
    }
    if rejections == 0 {
        return format!(
            "System HEALTHY: {} successful rebalances (100% success rate) in last {} minutes",
            successes, window
        );
    }
    if successes == 0 {
        return format!(
            "System DOWN: {} rejections (0% success rate) in last {} minutes",
            rejections, window
        );
    }
    format!(
        "System FUNCTIONAL: {} successes, {} rejections ({:.1}% success rate) in last {} minutes",
        successes, rejections, success_rate, window
    )
}

fn success_rate(successes: u64, rejections: u64) -> Decimal {
    let total = successes + rejections;
    if total == 0 {
        return Decimal::ZERO;
    }
    (Decimal::from(successes) * Decimal::ONE_HUNDRED / Decimal::from(total)).round_dp(2)
}

/// Per-hour rate of `count` observed over `window_minutes`
fn hourly_rate(count: u64, window_minutes: u32) -> Decimal {
    let hours = Decimal::from(window_minutes.max(1)) / Decimal::from(60u32);
    Decimal::from(count) / hours
}

pub struct HealthMonitor {
    rebalances: Arc<dyn RebalanceStore>,
    rejections: Arc<dyn RejectionStore>,
}

impl HealthMonitor {
    pub fn new(rebalances: Arc<dyn RebalanceStore>, rejections: Arc<dyn RejectionStore>) -> Self {
        Self {
            rebalances,
            rejections,
        }
    }

    async fn counts(&self, window_minutes: u32) -> AppResult<(u64, u64)> {
        let window = window_minutes as i64;
        futures::try_join!(
            self.rebalances.recent_success_count(window),
            self.rejections.recent_rejection_count(window),
        )
    }

    /// Last-hour health. Store failures come back as an unhealthy status,
    /// never as an error.
    #[instrument(skip(self))]
    pub async fn check_health(&self) -> HealthStatus {
        match self.counts(DEFAULT_WINDOW_MINUTES).await {
            Ok((success_count, rejection_count)) => {
                let has_successes = success_count > 0;
                let has_rejections = rejection_count > 0;
                let status = HealthStatus {
                    is_healthy: is_healthy(has_rejections, has_successes),
                    success_count,
                    rejection_count,
                    last_hour_has_rejections: has_rejections,
                    last_hour_has_successes: has_successes,
                    reason: status_reason(success_count, rejection_count),
                };
                info!(
                    "🩺 Rebalancing health: {} ({})",
                    if status.is_healthy { "healthy" } else { "unhealthy" },
                    status.reason
                );
                status
            }
            Err(e) => {
                error!("❌ Failed to check rebalancing health: {:?}", e);
                HealthStatus {
                    is_healthy: false,
                    success_count: 0,
                    rejection_count: 0,
                    last_hour_has_rejections: false,
                    last_hour_has_successes: false,
                    reason: format!("Health check failed: {}", e),
                }
            }
        }
    }

    pub async fn is_healthy(&self) -> bool {
        self.check_health().await.is_healthy
    }

    /// Same rule as [`check_health`](Self::check_health) applied to hourly
    /// rates, so any window length gives comparable answers.
    #[instrument(skip(self))]
    pub async fn metrics(&self, window_minutes: u32) -> HealthMetrics {
        match self.counts(window_minutes).await {
            Ok((success_count, rejection_count)) => {
                let rate = success_rate(success_count, rejection_count);
                let healthy = is_healthy(
                    hourly_rate(rejection_count, window_minutes) > Decimal::ZERO,
                    hourly_rate(success_count, window_minutes) > Decimal::ZERO,
                );
                HealthMetrics {
                    window_minutes,
                    success_count,
                    rejection_count,
                    success_rate: rate,
                    is_healthy: healthy,
                    reason: metrics_reason(success_count, rejection_count, rate, window_minutes),
                }
            }
            Err(e) => {
                error!("❌ Failed to get health metrics for {}m: {:?}", window_minutes, e);
                HealthMetrics {
                    window_minutes,
                    success_count: 0,
                    rejection_count: 0,
                    success_rate: Decimal::ZERO,
                    is_healthy: false,
                    reason: format!("Health metrics calculation failed: {}", e),
                }
            }
        }
    }
}
