use std::f64::consts::PI;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use chrono::{Months, NaiveDate, Utc};
use thiserror::Error;
use tracing::{debug, info};

use super::cache::{ResultCache, cache_key};
use super::solver::{ABSOLUTE_RATE_CEILING, SolverConfig, solve_required_savings_rate};
use super::types::{
    ConfidenceInterval, GoalProjection, Horizon, HorizonValues, NormalizedGoal,
    OptimizedPathResult, PathResult, ResolvedParams, RunMetadata, SIMULATION_MONTHS,
    SimulationInput, SimulationOutput,
};

/// Optimized-path assumption adjustments: the platform assumes expense growth
/// can be halved, allocation tuning adds 1% annual return, and career
/// guidance adds 0.5% income growth.
const EXPENSE_GROWTH_OPTIMIZATION: f64 = 0.5;
const RETURN_RATE_BONUS: f64 = 0.01;
const INCOME_GROWTH_BONUS: f64 = 0.005;

/// Share of monthly expenses treated as immediately redirectable to savings
/// when deriving the optimized input.
const EXPENSE_REDUCTION_FRACTION: f64 = 0.10;

#[derive(Debug, Error)]
pub enum SimulationError {
    #[error("{field} must be a finite number")]
    NonFinite { field: &'static str },
    #[error("savings rate must be between 0 and 1, got {0}")]
    SavingsRateOutOfRange(f64),
}

/// Deterministic 32-bit-state generator (Mulberry32) with a Box-Muller
/// normal sampler. Identical seeds produce bit-identical float sequences.
pub struct SeededRng {
    state: u32,
}

impl SeededRng {
    pub fn new(seed: u32) -> Self {
        Self { state: seed }
    }

    pub fn from_entropy() -> Self {
        Self::new(entropy_seed() as u32)
    }

    /// Uniform draw in [0, 1).
    pub fn next_f64(&mut self) -> f64 {
        self.state = self.state.wrapping_add(0x6D2B_79F5);
        let mut t = self.state;
        t = (t ^ (t >> 15)).wrapping_mul(t | 1);
        t ^= t.wrapping_add((t ^ (t >> 7)).wrapping_mul(t | 61));
        f64::from(t ^ (t >> 14)) / 4_294_967_296.0
    }

    /// One normal sample. Always consumes exactly two uniform draws; callers
    /// rely on the fixed draw count for reproducibility.
    pub fn next_normal(&mut self, mean: f64, std_dev: f64) -> f64 {
        let u1 = self.next_f64().max(1e-12);
        let u2 = self.next_f64();
        let z = (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos();
        mean + std_dev * z
    }
}

pub fn entropy_seed() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_nanos() as u64,
        Err(_) => 0x9E37_79B9_7F4A_7C15,
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MarketRegime {
    Bull,
    Bear,
    Normal,
}

#[derive(Copy, Clone)]
struct RegimeProfile {
    return_adjustment: f64,
    volatility_multiplier: f64,
    average_duration_months: f64,
    successors: [(MarketRegime, f64); 2],
}

impl MarketRegime {
    fn profile(self) -> RegimeProfile {
        match self {
            MarketRegime::Bull => RegimeProfile {
                return_adjustment: 0.04,
                volatility_multiplier: 0.85,
                average_duration_months: 18.0,
                successors: [(MarketRegime::Normal, 0.75), (MarketRegime::Bear, 0.25)],
            },
            MarketRegime::Bear => RegimeProfile {
                return_adjustment: -0.12,
                volatility_multiplier: 1.60,
                average_duration_months: 10.0,
                successors: [(MarketRegime::Normal, 0.70), (MarketRegime::Bull, 0.30)],
            },
            MarketRegime::Normal => RegimeProfile {
                return_adjustment: 0.0,
                volatility_multiplier: 1.0,
                average_duration_months: 30.0,
                successors: [(MarketRegime::Bull, 0.55), (MarketRegime::Bear, 0.45)],
            },
        }
    }
}

/// Regime state machine. Exit pressure builds with time in the regime and is
/// capped at a coin flip; successors never include the current regime.
pub struct MarketRegimeModel {
    current: MarketRegime,
    months_in_regime: u32,
}

impl MarketRegimeModel {
    pub fn new() -> Self {
        Self {
            current: MarketRegime::Normal,
            months_in_regime: 0,
        }
    }

    pub fn current(&self) -> MarketRegime {
        self.current
    }

    pub fn advance(&mut self, rng: &mut SeededRng) {
        self.months_in_regime += 1;
        let profile = self.current.profile();
        let exit_probability =
            (f64::from(self.months_in_regime) / profile.average_duration_months * 0.3).min(0.5);
        if rng.next_f64() < exit_probability {
            self.current = weighted_choice(&profile.successors, rng);
            self.months_in_regime = 0;
        }
    }

    pub fn adjust(&self, monthly_return: f64, monthly_volatility: f64) -> (f64, f64) {
        let profile = self.current.profile();
        (
            monthly_return + profile.return_adjustment / 12.0,
            monthly_volatility * profile.volatility_multiplier,
        )
    }
}

impl Default for MarketRegimeModel {
    fn default() -> Self {
        Self::new()
    }
}

fn weighted_choice(successors: &[(MarketRegime, f64)], rng: &mut SeededRng) -> MarketRegime {
    let draw = rng.next_f64();
    let mut cumulative = 0.0;
    for (regime, weight) in successors {
        cumulative += weight;
        if draw < cumulative {
            return *regime;
        }
    }
    successors[successors.len() - 1].0
}

#[derive(Debug, Clone, Copy, Default)]
struct GoalOutcome {
    achieved: bool,
    month: Option<u32>,
}

/// One simulated 20-year trajectory. Created and discarded within a single
/// Monte Carlo run; never persisted.
struct IterationResult {
    horizon_net_worth: HorizonValues<f64>,
    goal_achieved: bool,
    goal_month: Option<u32>,
    goal_outcomes: Vec<GoalOutcome>,
    all_goals_achieved: bool,
}

fn simulate_path(params: &ResolvedParams, rng: &mut SeededRng) -> IterationResult {
    let mut net_worth = params.starting_net_worth;
    let mut monthly_savings = params.base_monthly_savings;
    let mut monthly_expenses = params.base_monthly_expenses;
    let mut regimes = params.regimes_enabled.then(MarketRegimeModel::new);

    let mut goal_achieved = false;
    let mut goal_month = None;
    let mut goal_outcomes = vec![GoalOutcome::default(); params.goals.len()];
    let mut horizon_net_worth = HorizonValues::from_fn(|_| 0.0);

    for month in 1..=SIMULATION_MONTHS {
        let (mean, vol) = match regimes.as_mut() {
            Some(model) => {
                model.advance(rng);
                model.adjust(params.monthly_return, params.monthly_volatility)
            }
            None => (params.monthly_return, params.monthly_volatility),
        };

        if month >= 2 {
            monthly_savings *= 1.0 + params.monthly_income_growth;
        }

        // Expense growth crowds out savings; raw expenses are never
        // subtracted from net worth directly.
        monthly_expenses *= 1.0 + params.monthly_expense_growth;
        let crowd_out = monthly_expenses - params.base_monthly_expenses;
        let mut contribution = (monthly_savings - crowd_out).max(0.0);

        if goal_achieved && params.monthly_withdrawal > 0.0 {
            contribution -= params.monthly_withdrawal;
        }

        net_worth += contribution;
        let monthly_growth = rng.next_normal(mean, vol);
        net_worth *= 1.0 + monthly_growth;
        // A negative starting balance is allowed, but the trajectory cannot
        // go negative once the simulation is running.
        net_worth = net_worth.max(0.0);

        if let Some(primary) = params.goals.first() {
            if !goal_achieved
                && net_worth >= primary.amount
                && month <= primary.months_to_deadline
            {
                goal_achieved = true;
                goal_month = Some(month);
            }
        }
        for (goal, outcome) in params.goals.iter().zip(goal_outcomes.iter_mut()) {
            if !outcome.achieved && net_worth >= goal.amount && month <= goal.months_to_deadline {
                outcome.achieved = true;
                outcome.month = Some(month);
            }
        }

        if let Some(horizon) = Horizon::at_month(month) {
            *horizon_net_worth.get_mut(horizon) = net_worth;
        }
    }

    let all_goals_achieved =
        !goal_outcomes.is_empty() && goal_outcomes.iter().all(|outcome| outcome.achieved);

    IterationResult {
        horizon_net_worth,
        goal_achieved,
        goal_month,
        goal_outcomes,
        all_goals_achieved,
    }
}

/// Runs `iterations` independent trajectories at one fixed savings rate.
/// Iteration `i` seeds its own generator with `base_seed + i`, so outcomes
/// are independent of execution order and iteration count.
fn run_paths(params: &ResolvedParams, iterations: u32) -> Vec<IterationResult> {
    (0..iterations)
        .map(|i| {
            let mut rng = SeededRng::new(params.base_seed.wrapping_add(u64::from(i)) as u32);
            simulate_path(params, &mut rng)
        })
        .collect()
}

struct GoalStats {
    probability: f64,
    median_month: Option<f64>,
}

struct AggregatedResult {
    probability: f64,
    all_goals_probability: f64,
    median_net_worth: HorizonValues<f64>,
    p10_net_worth: HorizonValues<f64>,
    p90_net_worth: HorizonValues<f64>,
    median_goal_month: Option<f64>,
    goal_stats: Vec<GoalStats>,
}

fn aggregate(iterations: &[IterationResult], goal_count: usize) -> AggregatedResult {
    let n = iterations.len();
    if n == 0 {
        return AggregatedResult {
            probability: 0.0,
            all_goals_probability: 0.0,
            median_net_worth: HorizonValues::from_fn(|_| 0.0),
            p10_net_worth: HorizonValues::from_fn(|_| 0.0),
            p90_net_worth: HorizonValues::from_fn(|_| 0.0),
            median_goal_month: None,
            goal_stats: (0..goal_count)
                .map(|_| GoalStats {
                    probability: 0.0,
                    median_month: None,
                })
                .collect(),
        };
    }

    let achieved = iterations.iter().filter(|it| it.goal_achieved).count();
    let all_goals = iterations.iter().filter(|it| it.all_goals_achieved).count();

    let sorted_net_worth: HorizonValues<Vec<f64>> = HorizonValues::from_fn(|horizon| {
        let mut values: Vec<f64> = iterations
            .iter()
            .map(|it| *it.horizon_net_worth.get(horizon))
            .collect();
        values.sort_by(|a, b| a.total_cmp(b));
        values
    });

    let mut achievement_months: Vec<f64> = iterations
        .iter()
        .filter_map(|it| it.goal_month.map(f64::from))
        .collect();
    achievement_months.sort_by(|a, b| a.total_cmp(b));

    let goal_stats = (0..goal_count)
        .map(|idx| {
            let achieved = iterations
                .iter()
                .filter(|it| it.goal_outcomes[idx].achieved)
                .count();
            let mut months: Vec<f64> = iterations
                .iter()
                .filter_map(|it| it.goal_outcomes[idx].month.map(f64::from))
                .collect();
            months.sort_by(|a, b| a.total_cmp(b));
            GoalStats {
                probability: achieved as f64 / n as f64,
                median_month: median_of_sorted(&months),
            }
        })
        .collect();

    AggregatedResult {
        probability: achieved as f64 / n as f64,
        all_goals_probability: all_goals as f64 / n as f64,
        median_net_worth: HorizonValues::from_fn(|h| {
            median_of_sorted(sorted_net_worth.get(h)).unwrap_or(0.0)
        }),
        p10_net_worth: HorizonValues::from_fn(|h| percentile_of_sorted(sorted_net_worth.get(h), 10.0)),
        p90_net_worth: HorizonValues::from_fn(|h| percentile_of_sorted(sorted_net_worth.get(h), 90.0)),
        median_goal_month: median_of_sorted(&achievement_months),
        goal_stats,
    }
}

/// Median of an ascending slice; an even length averages the two middle
/// values.
fn median_of_sorted(values: &[f64]) -> Option<f64> {
    let n = values.len();
    if n == 0 {
        return None;
    }
    if n % 2 == 0 {
        Some((values[n / 2 - 1] + values[n / 2]) / 2.0)
    } else {
        Some(values[n / 2])
    }
}

/// Percentile of an ascending slice at index `ceil(p/100 * n) - 1`, clamped
/// to the valid range.
fn percentile_of_sorted(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let rank = (p / 100.0 * values.len() as f64).ceil() as usize;
    values[rank.saturating_sub(1).min(values.len() - 1)]
}

/// Derives the platform-optimized input from the user's baseline: softer
/// expense growth, small return and income-growth bonuses, and a savings
/// rate raised by the immediately redirectable share of expenses.
///
/// Both the optimizer probes and the final optimized-path run use this one
/// derivation.
pub fn derive_optimized_input(input: &SimulationInput) -> SimulationInput {
    let mut optimized = input.clone();

    let expenses = input.monthly_expenses.unwrap_or(0.0);
    let rate_boost = if input.monthly_income > 0.0 {
        expenses * EXPENSE_REDUCTION_FRACTION / input.monthly_income
    } else {
        0.0
    };
    optimized.savings_rate = (input.savings_rate + rate_boost).min(ABSOLUTE_RATE_CEILING);
    optimized.expected_return_rate = input.expected_return_rate + RETURN_RATE_BONUS;
    optimized.income_growth_rate = Some(input.resolved_income_growth() + INCOME_GROWTH_BONUS);
    optimized.expense_growth_rate =
        Some(input.resolved_expense_growth() * EXPENSE_GROWTH_OPTIMIZATION);
    optimized
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub iterations: u32,
    pub probe_iterations: u32,
    pub target_probability: f64,
    pub rate_tolerance: f64,
    pub max_probe_steps: u32,
    pub max_savings_rate: f64,
    pub cache_ttl: Duration,
    pub cache_sweep_threshold: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            iterations: 10_000,
            probe_iterations: 1_000,
            target_probability: 0.85,
            rate_tolerance: 0.005,
            max_probe_steps: 20,
            max_savings_rate: 0.50,
            cache_ttl: Duration::from_secs(15 * 60),
            cache_sweep_threshold: 64,
        }
    }
}

/// Orchestrates the dual-path pipeline: current path at full fidelity, the
/// savings-rate solver over reduced-fidelity probes, the optimized path at
/// full fidelity, and the result cache.
pub struct SimulationEngine {
    cache: ResultCache,
    config: EngineConfig,
}

impl SimulationEngine {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self {
            cache: ResultCache::new(config.cache_ttl, config.cache_sweep_threshold),
            config,
        }
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    pub fn cached_entries(&self) -> usize {
        self.cache.len()
    }

    pub fn simulate(
        &self,
        user_id: &str,
        input: &SimulationInput,
    ) -> Result<SimulationOutput, SimulationError> {
        validate_input(input)?;

        let key = cache_key(user_id, input);
        if let Some(hit) = self.cache.get(&key) {
            debug!(user_id, "returning cached simulation output");
            return Ok(hit);
        }

        let started = Instant::now();
        let today = Utc::now().date_naive();
        let base_seed = input.seed.unwrap_or_else(entropy_seed);

        let current_params = ResolvedParams::resolve(input, today, base_seed);
        let current_runs = run_paths(&current_params, self.config.iterations);
        let current = aggregate(&current_runs, current_params.goals.len());

        let optimized_input = derive_optimized_input(input);
        let solver_config = SolverConfig {
            target_probability: self.config.target_probability,
            tolerance: self.config.rate_tolerance,
            max_iterations: self.config.max_probe_steps,
            max_savings_rate: self.config.max_savings_rate,
        };
        let probe_iterations = self.config.probe_iterations;
        let required_rate = solve_required_savings_rate(
            input.savings_rate,
            current.probability,
            &solver_config,
            |rate| {
                let mut candidate = optimized_input.clone();
                candidate.savings_rate = rate;
                let params = ResolvedParams::resolve(&candidate, today, base_seed);
                let probability =
                    aggregate(&run_paths(&params, probe_iterations), params.goals.len())
                        .probability;
                debug!(rate, probability, "savings-rate probe");
                probability
            },
        );

        let mut final_input = optimized_input;
        final_input.savings_rate = required_rate.max(final_input.savings_rate);
        let optimized_params = ResolvedParams::resolve(&final_input, today, base_seed);
        let optimized_runs = run_paths(&optimized_params, self.config.iterations);
        let optimized = aggregate(&optimized_runs, optimized_params.goals.len());

        let current_path = build_path_result(&current, &current_params.goals, today);
        let optimized_path = OptimizedPathResult {
            required_savings_rate: required_rate,
            path: build_path_result(&optimized, &optimized_params.goals, today),
        };
        let wealth_difference = HorizonValues::from_fn(|h| {
            (optimized_path.path.projected_net_worth.get(h) - current_path.projected_net_worth.get(h))
                .max(0.0)
        });

        let duration_ms = started.elapsed().as_millis() as u64;
        let output = SimulationOutput {
            current_path,
            optimized_path,
            wealth_difference,
            metadata: RunMetadata {
                iterations: self.config.iterations,
                duration_ms,
                simulated_at: Utc::now(),
                currency: input.currency.clone(),
            },
        };

        self.cache.insert(key, output.clone());
        info!(
            user_id,
            duration_ms,
            probability = output.current_path.probability,
            required_savings_rate = required_rate,
            "simulation complete"
        );
        Ok(output)
    }
}

impl Default for SimulationEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn validate_input(input: &SimulationInput) -> Result<(), SimulationError> {
    let required = [
        ("savingsRate", input.savings_rate),
        ("monthlyIncome", input.monthly_income),
        ("netWorth", input.net_worth),
        ("expectedReturnRate", input.expected_return_rate),
        ("inflationRate", input.inflation_rate),
    ];
    for (field, value) in required {
        if !value.is_finite() {
            return Err(SimulationError::NonFinite { field });
        }
    }

    let optional = [
        ("monthlyExpenses", input.monthly_expenses),
        ("incomeGrowthRate", input.income_growth_rate),
        ("expenseGrowthRate", input.expense_growth_rate),
        ("taxRate", input.tax_rate),
        ("monthlyWithdrawal", input.monthly_withdrawal),
        ("goalAmount", input.goal_amount),
    ];
    for (field, value) in optional {
        if value.is_some_and(|v| !v.is_finite()) {
            return Err(SimulationError::NonFinite { field });
        }
    }

    if input.goals.iter().any(|g| !g.amount.is_finite()) {
        return Err(SimulationError::NonFinite {
            field: "goals.amount",
        });
    }

    if !(0.0..=1.0).contains(&input.savings_rate) {
        return Err(SimulationError::SavingsRateOutOfRange(input.savings_rate));
    }

    Ok(())
}

fn build_path_result(
    aggregated: &AggregatedResult,
    goals: &[NormalizedGoal],
    today: NaiveDate,
) -> PathResult {
    PathResult {
        probability: aggregated.probability,
        projected_net_worth: HorizonValues::from_fn(|h| aggregated.median_net_worth.get(h).round()),
        achieve_goal_date: aggregated
            .median_goal_month
            .and_then(|month| add_months(today, month)),
        confidence_intervals: HorizonValues::from_fn(|h| ConfidenceInterval {
            low: aggregated.p10_net_worth.get(h).round(),
            high: aggregated.p90_net_worth.get(h).round(),
        }),
        goal_results: goals
            .iter()
            .zip(&aggregated.goal_stats)
            .map(|(goal, stats)| GoalProjection {
                id: goal.id.clone(),
                name: goal.name.clone(),
                probability: stats.probability,
                achieve_goal_date: stats.median_month.and_then(|month| add_months(today, month)),
            })
            .collect(),
        all_goals_probability: aggregated.all_goals_probability,
    }
}

fn add_months(today: NaiveDate, months: f64) -> Option<NaiveDate> {
    today.checked_add_months(Months::new(months.round() as u32))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{BASE_ANNUAL_VOLATILITY, Goal};
    use proptest::prelude::{any, prop_assert, proptest};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    fn goal(amount: f64, months_to_deadline: u32) -> NormalizedGoal {
        NormalizedGoal {
            id: "g".to_string(),
            name: "Goal".to_string(),
            amount,
            months_to_deadline,
        }
    }

    fn oracle_params(goals: Vec<NormalizedGoal>, monthly_withdrawal: f64) -> ResolvedParams {
        ResolvedParams {
            starting_net_worth: 0.0,
            base_monthly_savings: 1_000.0,
            base_monthly_expenses: 0.0,
            monthly_return: 0.0,
            monthly_volatility: 0.0,
            monthly_income_growth: 0.0,
            monthly_expense_growth: 0.0,
            monthly_withdrawal,
            goals,
            regimes_enabled: false,
            base_seed: 7,
        }
    }

    fn scenario_input() -> SimulationInput {
        let deadline = Utc::now()
            .date_naive()
            .checked_add_months(Months::new(24))
            .expect("date in range");
        SimulationInput {
            savings_rate: 0.10,
            monthly_income: 400_000.0,
            monthly_expenses: None,
            net_worth: 500_000.0,
            goals: Vec::new(),
            goal_amount: Some(2_000_000.0),
            goal_deadline: Some(deadline),
            expected_return_rate: 0.07,
            inflation_rate: 0.05,
            income_growth_rate: None,
            expense_growth_rate: None,
            tax_rate: None,
            monthly_withdrawal: None,
            enable_market_regimes: false,
            seed: Some(12_345),
            currency: "USD".to_string(),
        }
    }

    fn test_config() -> EngineConfig {
        EngineConfig {
            iterations: 120,
            probe_iterations: 40,
            ..EngineConfig::default()
        }
    }

    #[test]
    fn rng_same_seed_replays_the_same_sequence() {
        let mut a = SeededRng::new(12_345);
        let mut b = SeededRng::new(12_345);
        for _ in 0..64 {
            assert_eq!(a.next_f64(), b.next_f64());
        }
    }

    #[test]
    fn rng_different_seeds_diverge() {
        let mut a = SeededRng::new(1);
        let mut b = SeededRng::new(2);
        let first: Vec<f64> = (0..8).map(|_| a.next_f64()).collect();
        let second: Vec<f64> = (0..8).map(|_| b.next_f64()).collect();
        assert_ne!(first, second);
    }

    #[test]
    fn rng_draws_stay_in_unit_interval() {
        let mut rng = SeededRng::new(99);
        for _ in 0..10_000 {
            let v = rng.next_f64();
            assert!((0.0..1.0).contains(&v), "draw {v} out of range");
        }
    }

    #[test]
    fn normal_sampler_consumes_exactly_two_draws() {
        let mut sampled = SeededRng::new(7);
        sampled.next_normal(0.0, 1.0);
        let after_normal = sampled.next_f64();

        let mut manual = SeededRng::new(7);
        manual.next_f64();
        manual.next_f64();
        assert_eq!(after_normal, manual.next_f64());
    }

    #[test]
    fn normal_sampler_scales_and_shifts() {
        let mut a = SeededRng::new(11);
        let mut b = SeededRng::new(11);
        let standard = a.next_normal(0.0, 1.0);
        let shifted = b.next_normal(5.0, 2.0);
        assert!((shifted - (5.0 + 2.0 * standard)).abs() < 1e-12);
    }

    #[test]
    fn normal_regime_passes_rates_through() {
        let model = MarketRegimeModel::new();
        let (mean, vol) = model.adjust(0.004, 0.04);
        assert_eq!(mean, 0.004);
        assert_eq!(vol, 0.04);
    }

    #[test]
    fn bear_profile_drags_returns_and_raises_volatility() {
        let model = MarketRegimeModel {
            current: MarketRegime::Bear,
            months_in_regime: 0,
        };
        let (mean, vol) = model.adjust(0.004, 0.04);
        assert!((mean - (0.004 - 0.12 / 12.0)).abs() < 1e-12);
        assert!((vol - 0.04 * 1.6).abs() < 1e-12);
    }

    #[test]
    fn regime_model_eventually_transitions_and_resets_the_clock() {
        let mut model = MarketRegimeModel::new();
        let mut rng = SeededRng::new(3);
        let mut saw_transition = false;
        for _ in 0..600 {
            let before = model.current();
            model.advance(&mut rng);
            if model.current() != before {
                saw_transition = true;
                assert_eq!(model.months_in_regime, 0);
                break;
            }
        }
        assert!(saw_transition, "no regime transition in 600 months");
    }

    #[test]
    fn successor_choice_excludes_the_current_regime() {
        let profile = MarketRegime::Normal.profile();
        let mut rng = SeededRng::new(17);
        for _ in 0..200 {
            let next = weighted_choice(&profile.successors, &mut rng);
            assert_ne!(next, MarketRegime::Normal);
        }
    }

    #[test]
    fn flat_path_accumulates_savings_linearly() {
        let params = oracle_params(vec![goal(12_000.0, 240)], 0.0);
        let mut rng = SeededRng::new(1);
        let result = simulate_path(&params, &mut rng);

        assert_eq!(result.horizon_net_worth.six_months, 6_000.0);
        assert_eq!(result.horizon_net_worth.one_year, 12_000.0);
        assert_eq!(result.horizon_net_worth.five_years, 60_000.0);
        assert_eq!(result.horizon_net_worth.ten_years, 120_000.0);
        assert_eq!(result.horizon_net_worth.twenty_years, 240_000.0);
        assert!(result.goal_achieved);
        assert_eq!(result.goal_month, Some(12));
        assert!(result.all_goals_achieved);
    }

    #[test]
    fn withdrawal_starts_only_after_the_primary_goal_is_reached() {
        let params = oracle_params(vec![goal(12_000.0, 240)], 500.0);
        let mut rng = SeededRng::new(1);
        let result = simulate_path(&params, &mut rng);

        assert_eq!(result.goal_month, Some(12));
        assert_eq!(result.horizon_net_worth.one_year, 12_000.0);
        // months 13..=120 contribute 1000 - 500
        assert_eq!(result.horizon_net_worth.ten_years, 12_000.0 + 108.0 * 500.0);
        assert_eq!(result.horizon_net_worth.twenty_years, 12_000.0 + 228.0 * 500.0);
    }

    #[test]
    fn oversized_withdrawal_drains_to_the_zero_floor() {
        let params = oracle_params(vec![goal(12_000.0, 240)], 1_500.0);
        let mut rng = SeededRng::new(1);
        let result = simulate_path(&params, &mut rng);

        // 12k drains at 500/month once the goal is reached; floored at 0.
        assert_eq!(result.horizon_net_worth.five_years, 0.0);
        assert_eq!(result.horizon_net_worth.twenty_years, 0.0);
    }

    #[test]
    fn negative_starting_net_worth_floors_at_zero_once_running() {
        let mut params = oracle_params(vec![goal(1_000.0, 240)], 0.0);
        params.starting_net_worth = -10_000.0;
        params.base_monthly_savings = 0.0;
        let mut rng = SeededRng::new(1);
        let result = simulate_path(&params, &mut rng);

        assert_eq!(result.horizon_net_worth.six_months, 0.0);
        assert_eq!(result.horizon_net_worth.twenty_years, 0.0);
        assert!(!result.goal_achieved);
    }

    #[test]
    fn past_deadline_goal_is_never_achieved() {
        let params = oracle_params(vec![goal(1_000.0, 0)], 0.0);
        let runs = run_paths(&params, 50);
        let aggregated = aggregate(&runs, params.goals.len());

        assert_eq!(aggregated.probability, 0.0);
        assert_eq!(aggregated.goal_stats[0].probability, 0.0);
        assert!(aggregated.median_goal_month.is_none());
    }

    #[test]
    fn goal_deadline_bounds_the_achievement_window() {
        // Reachable at month 12, but the deadline allows only 11 months.
        let params = oracle_params(vec![goal(12_000.0, 11)], 0.0);
        let mut rng = SeededRng::new(1);
        let result = simulate_path(&params, &mut rng);
        assert!(!result.goal_achieved);

        let params = oracle_params(vec![goal(12_000.0, 12)], 0.0);
        let mut rng = SeededRng::new(1);
        let result = simulate_path(&params, &mut rng);
        assert_eq!(result.goal_month, Some(12));
    }

    #[test]
    fn multiple_goals_are_tracked_independently() {
        let params = oracle_params(vec![goal(6_000.0, 240), goal(12_000.0, 240)], 0.0);
        let mut rng = SeededRng::new(1);
        let result = simulate_path(&params, &mut rng);

        assert_eq!(result.goal_outcomes[0].month, Some(6));
        assert_eq!(result.goal_outcomes[1].month, Some(12));
        assert!(result.all_goals_achieved);
    }

    #[test]
    fn zero_expenses_match_a_zero_expense_growth_run() {
        let mut with_growth = oracle_params(vec![goal(50_000.0, 240)], 0.0);
        with_growth.monthly_volatility = BASE_ANNUAL_VOLATILITY / 12.0_f64.sqrt();
        with_growth.monthly_return = 0.004;
        with_growth.monthly_expense_growth = 0.10 / 12.0;

        let mut without_growth = with_growth.clone();
        without_growth.monthly_expense_growth = 0.0;

        let a = run_paths(&with_growth, 60);
        let b = run_paths(&without_growth, 60);
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.horizon_net_worth, y.horizon_net_worth);
            assert_eq!(x.goal_month, y.goal_month);
        }
    }

    #[test]
    fn expense_growth_crowds_out_savings_but_never_drains_net_worth() {
        let mut params = oracle_params(vec![goal(1_000_000.0, 240)], 0.0);
        params.base_monthly_expenses = 5_000.0;
        // Severe growth: contributions hit the zero floor, net worth holds.
        params.monthly_expense_growth = 1.0 / 12.0;
        let mut rng = SeededRng::new(1);
        let result = simulate_path(&params, &mut rng);

        assert!(result.horizon_net_worth.twenty_years >= 0.0);
        assert!(result.horizon_net_worth.twenty_years <= 240.0 * 1_000.0);
        let h = result.horizon_net_worth;
        assert!(h.twenty_years >= h.ten_years);
    }

    #[test]
    fn aggregate_reduces_medians_percentiles_and_months() {
        let values = [4.0, 1.0, 3.0, 2.0];
        let months = [Some(10), None, Some(20), None];
        let iterations: Vec<IterationResult> = values
            .iter()
            .zip(months)
            .map(|(v, month)| IterationResult {
                horizon_net_worth: HorizonValues::from_fn(|_| *v),
                goal_achieved: month.is_some(),
                goal_month: month,
                goal_outcomes: vec![GoalOutcome {
                    achieved: month.is_some(),
                    month,
                }],
                all_goals_achieved: month.is_some(),
            })
            .collect();

        let aggregated = aggregate(&iterations, 1);
        assert_eq!(aggregated.probability, 0.5);
        assert_eq!(aggregated.all_goals_probability, 0.5);
        assert_eq!(aggregated.median_net_worth.twenty_years, 2.5);
        assert_eq!(aggregated.p10_net_worth.twenty_years, 1.0);
        assert_eq!(aggregated.p90_net_worth.twenty_years, 4.0);
        assert_eq!(aggregated.median_goal_month, Some(15.0));
        assert_eq!(aggregated.goal_stats[0].probability, 0.5);
        assert_eq!(aggregated.goal_stats[0].median_month, Some(15.0));
    }

    #[test]
    fn median_of_sorted_averages_even_lengths() {
        assert_eq!(median_of_sorted(&[]), None);
        assert_eq!(median_of_sorted(&[3.0]), Some(3.0));
        assert_eq!(median_of_sorted(&[1.0, 2.0]), Some(1.5));
        assert_eq!(median_of_sorted(&[1.0, 2.0, 3.0]), Some(2.0));
        assert_eq!(median_of_sorted(&[1.0, 2.0, 3.0, 10.0]), Some(2.5));
    }

    #[test]
    fn percentile_uses_ceil_rank_with_clamping() {
        let values = [10.0, 20.0, 30.0, 40.0, 50.0];
        assert_eq!(percentile_of_sorted(&values, 10.0), 10.0);
        assert_eq!(percentile_of_sorted(&values, 50.0), 30.0);
        assert_eq!(percentile_of_sorted(&values, 90.0), 50.0);
        assert_eq!(percentile_of_sorted(&values, 0.0), 10.0);
        assert_eq!(percentile_of_sorted(&values, 100.0), 50.0);
        assert_eq!(percentile_of_sorted(&[], 50.0), 0.0);
    }

    #[test]
    fn derive_optimized_input_adjusts_assumptions() {
        let mut input = scenario_input();
        input.monthly_expenses = Some(80_000.0);
        let optimized = derive_optimized_input(&input);

        // 10% of expenses redirected into the savings rate
        let expected_rate = 0.10 + 80_000.0 * 0.10 / 400_000.0;
        assert!((optimized.savings_rate - expected_rate).abs() < 1e-12);
        assert!((optimized.expected_return_rate - 0.08).abs() < 1e-12);
        assert_eq!(optimized.income_growth_rate, Some(0.03 + 0.005));
        // expense growth defaulted to inflation, then halved
        assert_eq!(optimized.expense_growth_rate, Some(0.05 * 0.5));
    }

    #[test]
    fn derive_optimized_input_caps_the_rate() {
        let mut input = scenario_input();
        input.savings_rate = 0.94;
        input.monthly_expenses = Some(400_000.0);
        let optimized = derive_optimized_input(&input);
        assert_eq!(optimized.savings_rate, ABSOLUTE_RATE_CEILING);
    }

    #[test]
    fn derive_optimized_input_handles_zero_income() {
        let mut input = scenario_input();
        input.monthly_income = 0.0;
        input.monthly_expenses = Some(1_000.0);
        let optimized = derive_optimized_input(&input);
        assert_eq!(optimized.savings_rate, input.savings_rate);
    }

    #[test]
    fn seeded_scenario_is_bit_identical_across_runs() {
        let engine = SimulationEngine::with_config(test_config());
        let input = scenario_input();

        let first = engine.simulate("user-1", &input).expect("first run");
        engine.clear_cache();
        let second = engine.simulate("user-1", &input).expect("second run");

        assert_eq!(first.current_path, second.current_path);
        assert_eq!(
            first.optimized_path.required_savings_rate,
            second.optimized_path.required_savings_rate
        );
        assert_eq!(first.optimized_path.path, second.optimized_path.path);
        assert_eq!(first.wealth_difference, second.wealth_difference);
    }

    #[test]
    fn cache_hit_returns_the_original_timestamp() {
        let engine = SimulationEngine::with_config(test_config());
        let input = scenario_input();

        let first = engine.simulate("user-1", &input).expect("first run");
        let second = engine.simulate("user-1", &input).expect("cached run");
        assert_eq!(first.metadata.simulated_at, second.metadata.simulated_at);
        assert_eq!(first.metadata.duration_ms, second.metadata.duration_ms);
        assert_eq!(engine.cached_entries(), 1);
    }

    #[test]
    fn changing_a_goal_deadline_forces_a_fresh_computation() {
        let engine = SimulationEngine::with_config(test_config());
        let input = scenario_input();
        engine.simulate("user-1", &input).expect("first run");

        let mut changed = input.clone();
        changed.goal_deadline = changed
            .goal_deadline
            .and_then(|d| d.checked_add_months(Months::new(1)));
        engine.simulate("user-1", &changed).expect("second run");
        assert_eq!(engine.cached_entries(), 2);
    }

    #[test]
    fn full_savings_rate_short_circuits_the_optimizer() {
        let engine = SimulationEngine::with_config(test_config());
        let mut input = scenario_input();
        input.savings_rate = 1.0;

        let output = engine.simulate("user-1", &input).expect("simulates");
        assert_eq!(output.optimized_path.required_savings_rate, 1.0);
    }

    #[test]
    fn required_rate_never_undercuts_the_current_rate() {
        let engine = SimulationEngine::with_config(test_config());
        let input = scenario_input();
        let output = engine.simulate("user-1", &input).expect("simulates");
        assert!(output.optimized_path.required_savings_rate >= input.savings_rate);
    }

    #[test]
    fn wealth_difference_is_floored_at_zero() {
        let engine = SimulationEngine::with_config(test_config());
        let output = engine
            .simulate("user-1", &scenario_input())
            .expect("simulates");
        for horizon in Horizon::ALL {
            assert!(*output.wealth_difference.get(horizon) >= 0.0);
        }
    }

    #[test]
    fn higher_savings_rate_never_lowers_the_median_projection() {
        let today = date(2026, 1, 1);
        let mut medians = Vec::new();
        for rate in [0.05, 0.20, 0.50] {
            let mut input = scenario_input();
            input.savings_rate = rate;
            let params = ResolvedParams::resolve(&input, today, 777);
            let aggregated = aggregate(&run_paths(&params, 150), params.goals.len());
            medians.push(aggregated.median_net_worth.twenty_years);
        }
        assert!(medians[0] <= medians[1]);
        assert!(medians[1] <= medians[2]);
    }

    #[test]
    fn all_goals_probability_is_bounded_by_each_goal() {
        let deadline = Utc::now()
            .date_naive()
            .checked_add_months(Months::new(120))
            .expect("date in range");
        let mut input = scenario_input();
        input.goals = vec![
            Goal {
                id: "g1".to_string(),
                name: "First".to_string(),
                amount: 800_000.0,
                deadline,
                priority: 0,
            },
            Goal {
                id: "g2".to_string(),
                name: "Second".to_string(),
                amount: 1_500_000.0,
                deadline,
                priority: 1,
            },
        ];

        let engine = SimulationEngine::with_config(test_config());
        let output = engine.simulate("user-1", &input).expect("simulates");
        let path = &output.current_path;
        assert_eq!(path.goal_results.len(), 2);
        for goal in &path.goal_results {
            assert!(path.all_goals_probability <= goal.probability + 1e-9);
        }
    }

    #[test]
    fn validate_rejects_non_finite_and_out_of_range_inputs() {
        let engine = SimulationEngine::with_config(test_config());

        let mut input = scenario_input();
        input.monthly_income = f64::NAN;
        assert!(matches!(
            engine.simulate("user-1", &input),
            Err(SimulationError::NonFinite { .. })
        ));

        let mut input = scenario_input();
        input.savings_rate = 1.5;
        assert!(matches!(
            engine.simulate("user-1", &input),
            Err(SimulationError::SavingsRateOutOfRange(_))
        ));
    }

    #[test]
    fn regime_flag_changes_the_trajectory_for_the_same_seed() {
        let today = date(2026, 1, 1);
        let base = scenario_input();
        let params_off = ResolvedParams::resolve(&base, today, 42);

        let mut with_regimes = base.clone();
        with_regimes.enable_market_regimes = true;
        let params_on = ResolvedParams::resolve(&with_regimes, today, 42);

        let off = aggregate(&run_paths(&params_off, 80), params_off.goals.len());
        let on = aggregate(&run_paths(&params_on, 80), params_on.goals.len());
        assert_ne!(
            off.median_net_worth.twenty_years,
            on.median_net_worth.twenty_years
        );
    }

    proptest! {
        #![proptest_config(proptest::test_runner::Config::with_cases(12))]

        #[test]
        fn prop_output_invariants_hold(
            seed in any::<u32>(),
            savings_bp in 0u32..=10_000,
            income in 0u32..20_000,
            net_worth in -50_000i32..500_000,
            goal_amount in 1u32..1_000_000,
            months_ahead in 0u32..60,
            expenses in 0u32..10_000,
            withdrawal in 0u32..3_000,
            regimes in any::<bool>()
        ) {
            let deadline = Utc::now()
                .date_naive()
                .checked_add_months(Months::new(months_ahead))
                .expect("date in range");
            let input = SimulationInput {
                savings_rate: f64::from(savings_bp) / 10_000.0,
                monthly_income: f64::from(income),
                monthly_expenses: Some(f64::from(expenses)),
                net_worth: f64::from(net_worth),
                goals: Vec::new(),
                goal_amount: Some(f64::from(goal_amount)),
                goal_deadline: Some(deadline),
                expected_return_rate: 0.07,
                inflation_rate: 0.03,
                income_growth_rate: None,
                expense_growth_rate: None,
                tax_rate: Some(0.15),
                monthly_withdrawal: Some(f64::from(withdrawal)),
                enable_market_regimes: regimes,
                seed: Some(u64::from(seed)),
                currency: "USD".to_string(),
            };

            let engine = SimulationEngine::with_config(EngineConfig {
                iterations: 40,
                probe_iterations: 16,
                ..EngineConfig::default()
            });
            let output = engine.simulate("prop-user", &input).expect("simulates");

            for path in [&output.current_path, &output.optimized_path.path] {
                prop_assert!((0.0..=1.0).contains(&path.probability));
                prop_assert!((0.0..=1.0).contains(&path.all_goals_probability));
                for goal in &path.goal_results {
                    prop_assert!(path.all_goals_probability <= goal.probability + 1e-9);
                }
                for horizon in Horizon::ALL {
                    let interval = path.confidence_intervals.get(horizon);
                    prop_assert!(interval.low <= interval.high);
                    prop_assert!(*path.projected_net_worth.get(horizon) >= 0.0);
                }
            }
            for horizon in Horizon::ALL {
                prop_assert!(*output.wealth_difference.get(horizon) >= 0.0);
            }
            prop_assert!(
                output.optimized_path.required_savings_rate >= input.savings_rate - 1e-12
            );
        }
    }
}
