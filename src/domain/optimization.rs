//! Optimization analysis of a completed run.
//!
//! A heuristic [`PerformanceAssessment`] scores the metrics in four bands of
//! 25 points (Sharpe, drawdown, return, activity). The assessment, the goal
//! and any user feedback go into one text-generation call that returns the
//! final analysis and a rewritten strategy in the original dialect.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::dialect::SourceDialect;
use crate::domain::error::{GenerationError, OptimizationError};
use crate::domain::metrics::PerformanceMetrics;
use crate::domain::request::StrategyRequest;
use crate::domain::translator::{json_object, truncate};
use crate::ports::text_generation_port::TextGenerator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationGoal {
    ImproveReturns,
    ReduceDrawdown,
    IncreaseSharpe,
}

impl OptimizationGoal {
    pub fn as_str(&self) -> &'static str {
        match self {
            OptimizationGoal::ImproveReturns => "improve_returns",
            OptimizationGoal::ReduceDrawdown => "reduce_drawdown",
            OptimizationGoal::IncreaseSharpe => "increase_sharpe",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            OptimizationGoal::ImproveReturns => "improve overall returns and profitability",
            OptimizationGoal::ReduceDrawdown => {
                "reduce maximum drawdown and improve risk management"
            }
            OptimizationGoal::IncreaseSharpe => "improve risk-adjusted returns (Sharpe ratio)",
        }
    }
}

impl fmt::Display for OptimizationGoal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OptimizationGoal {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "improve_returns" | "returns" => Ok(OptimizationGoal::ImproveReturns),
            "reduce_drawdown" | "drawdown" => Ok(OptimizationGoal::ReduceDrawdown),
            "increase_sharpe" | "sharpe" => Ok(OptimizationGoal::IncreaseSharpe),
            other => Err(format!(
                "unknown optimization goal '{other}' (expected improve_returns, reduce_drawdown or increase_sharpe)"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl FromStr for RiskLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(RiskLevel::Low),
            "medium" => Ok(RiskLevel::Medium),
            "high" => Ok(RiskLevel::High),
            other => Err(format!("unknown risk level '{other}'")),
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceAssessment {
    pub overall_score: u32,
    pub risk_level: RiskLevel,
    pub strengths: Vec<String>,
    pub weaknesses: Vec<String>,
    pub recommendations: Vec<String>,
}

impl PerformanceAssessment {
    pub fn from_metrics(metrics: &PerformanceMetrics) -> Self {
        let sharpe = metrics.sharpe_ratio;
        let drawdown = metrics.max_drawdown_pct();
        let returns = metrics.total_return_pct();
        let trades = metrics.total_trades;

        let mut score = 0;
        let mut strengths = Vec::new();
        let mut weaknesses = Vec::new();

        if sharpe > 1.0 {
            score += 25;
            strengths.push("Excellent risk-adjusted returns (Sharpe > 1.0)".to_string());
        } else if sharpe > 0.5 {
            score += 20;
            strengths.push("Good risk-adjusted returns (Sharpe > 0.5)".to_string());
        } else if sharpe > 0.0 {
            score += 10;
            strengths.push("Positive risk-adjusted returns".to_string());
        } else {
            weaknesses.push(format!("Poor risk-adjusted returns (Sharpe: {sharpe:.2})"));
        }

        if drawdown < 10.0 {
            score += 25;
            strengths.push("Excellent risk management (Max DD < 10%)".to_string());
        } else if drawdown < 20.0 {
            score += 20;
            strengths.push("Good risk management (Max DD < 20%)".to_string());
        } else if drawdown < 30.0 {
            score += 15;
            strengths.push("Acceptable risk management (Max DD < 30%)".to_string());
        } else {
            score += 5;
            weaknesses.push(format!("High risk strategy (Max DD: {drawdown:.1}%)"));
        }

        if returns > 20.0 {
            score += 25;
            strengths.push("Excellent returns (>20%)".to_string());
        } else if returns > 10.0 {
            score += 20;
            strengths.push("Good returns (>10%)".to_string());
        } else if returns > 5.0 {
            score += 15;
            strengths.push("Moderate returns (>5%)".to_string());
        } else if returns > 0.0 {
            score += 10;
            strengths.push("Positive returns".to_string());
        } else {
            weaknesses.push(format!("Negative returns ({returns:.1}%)"));
        }

        if trades > 20 {
            score += 25;
            strengths.push("High trading activity".to_string());
        } else if trades > 10 {
            score += 20;
            strengths.push("Good trading activity".to_string());
        } else if trades > 5 {
            score += 15;
            strengths.push("Moderate trading activity".to_string());
        } else {
            score += 10;
            weaknesses.push("Low trading activity".to_string());
        }

        let risk_level = if drawdown > 40.0 || sharpe < -1.0 {
            RiskLevel::High
        } else if drawdown > 20.0 || sharpe < 0.0 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        };

        let mut recommendations = Vec::new();
        if sharpe < 0.0 {
            recommendations.push(
                "Improve risk-adjusted returns by adding stop-losses or position sizing".to_string(),
            );
        }
        if drawdown > 30.0 {
            recommendations
                .push("Reduce maximum drawdown by implementing better risk management".to_string());
        }
        if returns < 5.0 {
            recommendations.push("Enhance entry/exit signals for better profitability".to_string());
        }
        if trades < 5 {
            recommendations
                .push("Increase trading frequency by relaxing entry conditions".to_string());
        }

        Self {
            overall_score: score,
            risk_level,
            strengths,
            weaknesses,
            recommendations,
        }
    }
}

/// Improvement suggestions by category.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Suggestions {
    pub entry: Vec<String>,
    pub exit: Vec<String>,
    pub risk_management: Vec<String>,
    pub position_sizing: Vec<String>,
    pub indicators: Vec<String>,
    pub timeframe: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationAnalysis {
    pub overall_score: u32,
    pub risk_level: RiskLevel,
    pub strengths: Vec<String>,
    pub weaknesses: Vec<String>,
    pub suggestions: Suggestions,
    pub improved_strategy: String,
    pub goal: OptimizationGoal,
    pub dialect: SourceDialect,
    /// The heuristic assessment the analysis started from.
    pub baseline: PerformanceAssessment,
}

/// Shape the model is asked to return.
#[derive(Deserialize)]
struct AnalysisResponse {
    overall_score: f64,
    risk_level: String,
    #[serde(default)]
    strengths: Vec<String>,
    #[serde(default)]
    weaknesses: Vec<String>,
    #[serde(default)]
    suggestions: Suggestions,
    improved_strategy: String,
}

const RESPONSE_SHAPE: &str = r#"{
  "overall_score": 0-100,
  "risk_level": "low" | "medium" | "high",
  "strengths": ["..."],
  "weaknesses": ["..."],
  "suggestions": {
    "entry": ["..."], "exit": ["..."], "risk_management": ["..."],
    "position_sizing": ["..."], "indicators": ["..."], "timeframe": ["..."]
  },
  "improved_strategy": "the complete rewritten strategy"
}"#;

pub fn optimization_prompt(
    request: &StrategyRequest,
    dialect: SourceDialect,
    metrics: &PerformanceMetrics,
    baseline: &PerformanceAssessment,
    goal: OptimizationGoal,
    feedback: Option<&str>,
) -> String {
    let list = |items: &[String]| {
        if items.is_empty() {
            "none".to_string()
        } else {
            items.join("; ")
        }
    };
    let feedback = feedback
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .unwrap_or("None provided");

    format!(
        "Analyze this trading strategy for {symbol} on the {timeframe} timeframe and suggest \
         specific improvements to {goal}.\n\n\
         Current strategy ({dialect}):\n{text}\n\n\
         Backtest results:\n\
         - Total return: {ret:.2}%\n\
         - Sharpe ratio: {sharpe:.2}\n\
         - Max drawdown: {dd:.2}%\n\
         - Trades: {trades} (win rate {win:.1}%)\n\
         - SQN: {sqn:.2}\n\n\
         Heuristic assessment:\n\
         - Overall score: {score}/100\n\
         - Risk level: {risk}\n\
         - Strengths: {strengths}\n\
         - Weaknesses: {weaknesses}\n\
         - Recommendations: {recs}\n\n\
         User feedback: {feedback}\n\n\
         {rewrite}\n\n\
         Respond with a single JSON object of this shape:\n{shape}\n",
        symbol = request.symbol(),
        timeframe = request.timeframe(),
        goal = goal.description(),
        dialect = dialect.description(),
        text = request.text(),
        ret = metrics.total_return_pct(),
        sharpe = metrics.sharpe_ratio,
        dd = metrics.max_drawdown_pct(),
        trades = metrics.total_trades,
        win = metrics.win_rate * 100.0,
        sqn = metrics.sqn,
        score = baseline.overall_score,
        risk = baseline.risk_level,
        strengths = list(&baseline.strengths),
        weaknesses = list(&baseline.weaknesses),
        recs = list(&baseline.recommendations),
        rewrite = dialect.rewrite_instructions(),
        shape = RESPONSE_SHAPE,
    )
}

pub fn parse_analysis(
    response: &str,
    goal: OptimizationGoal,
    dialect: SourceDialect,
    baseline: PerformanceAssessment,
) -> Result<OptimizationAnalysis, OptimizationError> {
    let json = json_object(response).ok_or_else(|| OptimizationError::Malformed {
        reason: format!("no JSON object in response: {}", truncate(response.trim(), 200)),
    })?;
    let raw: AnalysisResponse =
        serde_json::from_str(json).map_err(|e| OptimizationError::Malformed {
            reason: e.to_string(),
        })?;

    if !raw.overall_score.is_finite() || !(0.0..=100.0).contains(&raw.overall_score) {
        return Err(OptimizationError::OutOfRange {
            field: "overall_score",
            reason: format!("{} is not within 0..=100", raw.overall_score),
        });
    }
    let risk_level = raw
        .risk_level
        .parse::<RiskLevel>()
        .map_err(|reason| OptimizationError::OutOfRange {
            field: "risk_level",
            reason,
        })?;
    if raw.improved_strategy.trim().is_empty() {
        return Err(OptimizationError::Malformed {
            reason: "improved_strategy is empty".into(),
        });
    }

    Ok(OptimizationAnalysis {
        overall_score: raw.overall_score.round() as u32,
        risk_level,
        strengths: raw.strengths,
        weaknesses: raw.weaknesses,
        suggestions: raw.suggestions,
        improved_strategy: raw.improved_strategy.trim().to_string(),
        goal,
        dialect,
        baseline,
    })
}

pub struct Optimizer {
    generator: Arc<dyn TextGenerator>,
    timeout: Duration,
}

impl Optimizer {
    pub fn new(generator: Arc<dyn TextGenerator>, timeout: Duration) -> Self {
        Self { generator, timeout }
    }

    /// One generation call, no retry; a bad response is returned as an error
    /// for the caller to act on.
    pub async fn optimize(
        &self,
        request: &StrategyRequest,
        dialect: SourceDialect,
        metrics: &PerformanceMetrics,
        goal: OptimizationGoal,
        feedback: Option<&str>,
    ) -> Result<OptimizationAnalysis, OptimizationError> {
        let baseline = PerformanceAssessment::from_metrics(metrics);
        tracing::info!(
            goal = goal.as_str(),
            baseline_score = baseline.overall_score,
            risk = %baseline.risk_level,
            "requesting optimization analysis"
        );
        let prompt = optimization_prompt(request, dialect, metrics, &baseline, goal, feedback);

        let response = match tokio::time::timeout(self.timeout, self.generator.generate(&prompt)).await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(GenerationError::Timeout {
                    seconds: self.timeout.as_secs(),
                }
                .into());
            }
        };
        parse_analysis(&response, goal, dialect, baseline)
    }
}
