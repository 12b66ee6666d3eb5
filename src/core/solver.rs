use tracing::debug;

/// No recommendation ever pushes the savings rate past this, regardless of
/// the configured cap.
pub const ABSOLUTE_RATE_CEILING: f64 = 0.95;

#[derive(Debug, Clone, Copy)]
pub struct SolverConfig {
    pub target_probability: f64,
    pub tolerance: f64,
    pub max_iterations: u32,
    pub max_savings_rate: f64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            target_probability: 0.85,
            tolerance: 0.005,
            max_iterations: 20,
            max_savings_rate: 0.50,
        }
    }
}

/// Binary-searches the smallest savings rate at or above `current_rate` whose
/// probed success probability reaches the target.
///
/// `probe` evaluates one candidate rate at reduced fidelity. The search
/// ceiling never forces a rate below what the user already saves and never
/// exceeds the absolute ceiling. Running out of iterations is not an error;
/// the best sufficient rate seen so far is returned.
pub fn solve_required_savings_rate(
    current_rate: f64,
    current_probability: f64,
    config: &SolverConfig,
    mut probe: impl FnMut(f64) -> f64,
) -> f64 {
    let ceiling = config
        .max_savings_rate
        .max(current_rate.min(ABSOLUTE_RATE_CEILING));

    if current_probability >= config.target_probability {
        return current_rate;
    }
    if current_rate >= ceiling {
        return current_rate;
    }

    if probe(ceiling) < config.target_probability {
        debug!(ceiling, "target probability unreachable within rate ceiling");
        return ceiling;
    }

    let mut lo = current_rate;
    let mut hi = ceiling;
    let mut best = ceiling;
    let mut steps = 0;
    while hi - lo > config.tolerance && steps < config.max_iterations {
        let mid = (lo + hi) / 2.0;
        if probe(mid) >= config.target_probability {
            best = mid;
            hi = mid;
        } else {
            lo = mid;
        }
        steps += 1;
    }

    best
}
