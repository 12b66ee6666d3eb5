use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub const MAX_GOALS: usize = 5;
pub const SIMULATION_MONTHS: u32 = 240;

/// Annual volatility applied to every trajectory; the input carries no
/// volatility field, so this is an engine constant.
pub const BASE_ANNUAL_VOLATILITY: f64 = 0.15;

/// Annual income growth assumed when the caller does not supply one.
pub const DEFAULT_INCOME_GROWTH: f64 = 0.03;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Horizon {
    SixMonths,
    OneYear,
    FiveYears,
    TenYears,
    TwentyYears,
}

impl Horizon {
    pub const ALL: [Horizon; 5] = [
        Horizon::SixMonths,
        Horizon::OneYear,
        Horizon::FiveYears,
        Horizon::TenYears,
        Horizon::TwentyYears,
    ];

    pub fn months(self) -> u32 {
        match self {
            Horizon::SixMonths => 6,
            Horizon::OneYear => 12,
            Horizon::FiveYears => 60,
            Horizon::TenYears => 120,
            Horizon::TwentyYears => 240,
        }
    }

    pub fn at_month(month: u32) -> Option<Horizon> {
        Horizon::ALL.into_iter().find(|h| h.months() == month)
    }
}

/// One value per reporting horizon, serialized under the short horizon keys.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HorizonValues<T> {
    #[serde(rename = "6mo")]
    pub six_months: T,
    #[serde(rename = "1yr")]
    pub one_year: T,
    #[serde(rename = "5yr")]
    pub five_years: T,
    #[serde(rename = "10yr")]
    pub ten_years: T,
    #[serde(rename = "20yr")]
    pub twenty_years: T,
}

impl<T> HorizonValues<T> {
    pub fn from_fn(mut f: impl FnMut(Horizon) -> T) -> Self {
        Self {
            six_months: f(Horizon::SixMonths),
            one_year: f(Horizon::OneYear),
            five_years: f(Horizon::FiveYears),
            ten_years: f(Horizon::TenYears),
            twenty_years: f(Horizon::TwentyYears),
        }
    }

    pub fn get(&self, horizon: Horizon) -> &T {
        match horizon {
            Horizon::SixMonths => &self.six_months,
            Horizon::OneYear => &self.one_year,
            Horizon::FiveYears => &self.five_years,
            Horizon::TenYears => &self.ten_years,
            Horizon::TwentyYears => &self.twenty_years,
        }
    }

    pub fn get_mut(&mut self, horizon: Horizon) -> &mut T {
        match horizon {
            Horizon::SixMonths => &mut self.six_months,
            Horizon::OneYear => &mut self.one_year,
            Horizon::FiveYears => &mut self.five_years,
            Horizon::TenYears => &mut self.ten_years,
            Horizon::TwentyYears => &mut self.twenty_years,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Goal {
    pub id: String,
    pub name: String,
    pub amount: f64,
    pub deadline: NaiveDate,
    pub priority: i32,
}

#[derive(Debug, Clone)]
pub struct SimulationInput {
    pub savings_rate: f64,
    pub monthly_income: f64,
    pub monthly_expenses: Option<f64>,
    pub net_worth: f64,
    pub goals: Vec<Goal>,
    pub goal_amount: Option<f64>,
    pub goal_deadline: Option<NaiveDate>,
    pub expected_return_rate: f64,
    pub inflation_rate: f64,
    pub income_growth_rate: Option<f64>,
    pub expense_growth_rate: Option<f64>,
    pub tax_rate: Option<f64>,
    pub monthly_withdrawal: Option<f64>,
    pub enable_market_regimes: bool,
    pub seed: Option<u64>,
    pub currency: String,
}

impl SimulationInput {
    pub fn resolved_income_growth(&self) -> f64 {
        self.income_growth_rate.unwrap_or(DEFAULT_INCOME_GROWTH)
    }

    pub fn resolved_expense_growth(&self) -> f64 {
        self.expense_growth_rate.unwrap_or(self.inflation_rate)
    }
}

#[derive(Debug, Clone)]
pub struct NormalizedGoal {
    pub id: String,
    pub name: String,
    pub amount: f64,
    pub months_to_deadline: u32,
}

/// Fully-resolved monthly parameters. Every optional-field fallback is
/// applied here exactly once; the simulation loop never re-derives defaults.
#[derive(Debug, Clone)]
pub struct ResolvedParams {
    pub starting_net_worth: f64,
    pub base_monthly_savings: f64,
    pub base_monthly_expenses: f64,
    pub monthly_return: f64,
    pub monthly_volatility: f64,
    pub monthly_income_growth: f64,
    pub monthly_expense_growth: f64,
    pub monthly_withdrawal: f64,
    pub goals: Vec<NormalizedGoal>,
    pub regimes_enabled: bool,
    pub base_seed: u64,
}

impl ResolvedParams {
    pub fn resolve(input: &SimulationInput, today: NaiveDate, base_seed: u64) -> Self {
        let tax_rate = input.tax_rate.unwrap_or(0.0);
        let annual_real_return =
            input.expected_return_rate * (1.0 - tax_rate) - input.inflation_rate;

        Self {
            starting_net_worth: input.net_worth,
            base_monthly_savings: input.monthly_income * input.savings_rate,
            base_monthly_expenses: input.monthly_expenses.unwrap_or(0.0),
            monthly_return: annual_real_return / 12.0,
            monthly_volatility: BASE_ANNUAL_VOLATILITY / 12.0_f64.sqrt(),
            monthly_income_growth: input.resolved_income_growth() / 12.0,
            monthly_expense_growth: input.resolved_expense_growth() / 12.0,
            monthly_withdrawal: input.monthly_withdrawal.unwrap_or(0.0),
            goals: normalize_goals(input, today),
            regimes_enabled: input.enable_market_regimes,
            base_seed,
        }
    }
}

fn normalize_goals(input: &SimulationInput, today: NaiveDate) -> Vec<NormalizedGoal> {
    let mut goals = if input.goals.is_empty() {
        match (input.goal_amount, input.goal_deadline) {
            (Some(amount), Some(deadline)) => vec![Goal {
                id: "primary".to_string(),
                name: "Primary goal".to_string(),
                amount,
                deadline,
                priority: 0,
            }],
            _ => Vec::new(),
        }
    } else {
        input.goals.clone()
    };

    goals.sort_by_key(|g| g.priority);
    goals.truncate(MAX_GOALS);
    goals
        .into_iter()
        .map(|goal| NormalizedGoal {
            id: goal.id,
            name: goal.name,
            amount: goal.amount,
            months_to_deadline: months_until(today, goal.deadline),
        })
        .collect()
}

/// Whole months from `today` to `deadline` in 30-day steps, rounded up.
/// A deadline at or before `today` yields 0.
pub fn months_until(today: NaiveDate, deadline: NaiveDate) -> u32 {
    if deadline <= today {
        return 0;
    }
    let days = (deadline - today).num_days();
    (days as u64).div_ceil(30) as u32
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceInterval {
    pub low: f64,
    pub high: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoalProjection {
    pub id: String,
    pub name: String,
    pub probability: f64,
    pub achieve_goal_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathResult {
    pub probability: f64,
    pub projected_net_worth: HorizonValues<f64>,
    pub achieve_goal_date: Option<NaiveDate>,
    pub confidence_intervals: HorizonValues<ConfidenceInterval>,
    pub goal_results: Vec<GoalProjection>,
    pub all_goals_probability: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizedPathResult {
    pub required_savings_rate: f64,
    #[serde(flatten)]
    pub path: PathResult,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunMetadata {
    pub iterations: u32,
    pub duration_ms: u64,
    pub simulated_at: chrono::DateTime<chrono::Utc>,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationOutput {
    pub current_path: PathResult,
    pub optimized_path: OptimizedPathResult,
    pub wealth_difference: HorizonValues<f64>,
    pub metadata: RunMetadata,
}
