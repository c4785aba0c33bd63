use std::env;

/// Constants behind the delay cost function. All configurable, with
/// documented PLN/hour defaults.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CostConfig {
    pub vot_pln_per_hour: f64,
    pub driver_wage_pln_per_hour: f64,
    pub energy_pln_per_hour: f64,
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            vot_pln_per_hour: 22.0,
            driver_wage_pln_per_hour: 80.0,
            energy_pln_per_hour: 5.0,
        }
    }
}

impl CostConfig {
    /// Reads overrides from the environment, falling back to the documented
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            vot_pln_per_hour: env_f64("COST_VOT_PLN_PER_HOUR", default.vot_pln_per_hour),
            driver_wage_pln_per_hour: env_f64(
                "COST_DRIVER_WAGE_PLN_PER_HOUR",
                default.driver_wage_pln_per_hour,
            ),
            energy_pln_per_hour: env_f64(
                "COST_ENERGY_PLN_PER_HOUR",
                default.energy_pln_per_hour,
            ),
        }
    }
}

fn env_f64(name: &str, default: f64) -> f64 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

/// Approximate passenger load for the given hour of day: higher during the
/// morning/evening peaks, moderate through the day, light at night.
pub fn passengers(hour_of_day: u32) -> f64 {
    match hour_of_day {
        7 | 8 | 15 | 16 | 17 => 150.0,
        9..=14 | 18..=21 => 50.0,
        _ => 10.0,
    }
}

/// The economic cost, in PLN, of `duration_seconds` of immobility during
/// `hour_of_day`:
///
/// `cost = (duration / 3600) * (passengers(h) * vot + driver_wage + energy)`
pub fn cost_pln(duration_seconds: i64, hour_of_day: u32, config: &CostConfig) -> f64 {
    let hours = duration_seconds as f64 / 3600.0;
    let hourly_cost = passengers(hour_of_day) * config.vot_pln_per_hour
        + config.driver_wage_pln_per_hour
        + config.energy_pln_per_hour;
    hours * hourly_cost
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peak_hour_cost_matches_worked_example() {
        // 900s of delay during a peak hour (passengers = 150):
        // (900/3600) * (150*22 + 80 + 5) = 0.25 * 3385 = 846.25
        let config = CostConfig::default();
        let cost = cost_pln(900, 8, &config);
        assert!((cost - 846.25).abs() < 1e-6);
    }

    #[test]
    fn night_hours_are_cheapest() {
        let config = CostConfig::default();
        assert!(cost_pln(3600, 3, &config) < cost_pln(3600, 8, &config));
    }
}
