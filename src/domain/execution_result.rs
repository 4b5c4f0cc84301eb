//! What a sandboxed run hands back: trades, the equity curve and the
//! benchmark closes, plus the analyzed report built from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::error::ExecutionError;
use crate::domain::metrics::PerformanceMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// +1 for long, -1 for short.
    pub fn sign(self) -> f64 {
        match self {
            Direction::Long => 1.0,
            Direction::Short => -1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    Signal,
    StopLoss,
    TakeProfit,
}

/// A round trip. `exit_time` is `None` for a position still open at the last
/// bar; its `exit_price` is then the final close and `pnl` is marked to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub direction: Direction,
    pub quantity: f64,
    pub entry_time: DateTime<Utc>,
    pub exit_time: Option<DateTime<Utc>>,
    pub entry_price: f64,
    pub exit_price: f64,
    pub pnl: f64,
    pub commission: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_reason: Option<ExitReason>,
}

impl Trade {
    pub fn is_open(&self) -> bool {
        self.exit_time.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub timestamp: DateTime<Utc>,
    pub equity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawExecutionLog {
    pub trades: Vec<Trade>,
    pub equity_curve: Vec<EquityPoint>,
    pub bars_processed: usize,
    pub first_close: f64,
    pub last_close: f64,
}

impl RawExecutionLog {
    pub fn ending_value(&self) -> Option<f64> {
        self.equity_curve.last().map(|p| p.equity)
    }
}

/// A successful execution together with its analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestReport {
    pub log: RawExecutionLog,
    pub metrics: PerformanceMetrics,
}

pub type ExecutionResult = Result<BacktestReport, ExecutionError>;
