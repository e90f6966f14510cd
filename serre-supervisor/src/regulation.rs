//! Control decisions.
//!
//! Everything here is a pure function of the latest cached readings and the
//! targets; the drivers turn the decisions into coil writes. Unknown readings
//! always resolve to the fail-safe choice (mains water, pump off, no climate
//! action).

use serde::{Deserialize, Serialize};

/// Below this outdoor temperature water handling is considered at risk of freezing.
pub const FROST_THRESHOLD_CELSIUS: f64 = 1.0;

/// Distance from the temperature target that triggers heating or the window.
pub const TEMPERATURE_TRIGGER: f64 = 0.5;
/// Half-width of the temperature band in which both actuators are switched off.
pub const TEMPERATURE_DEAD_BAND: f64 = 0.2;
/// Distance below the humidity target that triggers misting (and above it, stops it).
pub const HUMIDITY_TRIGGER: f64 = 2.0;
/// Half-width of the humidity band in which misting is switched off.
pub const HUMIDITY_DEAD_BAND: f64 = 1.0;

/// Water network feeding the irrigation circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaterSource {
    /// Rain-water tank (valve coil on).
    Rain,
    /// Municipal supply (valve coil off).
    Mains,
}

impl WaterSource {
    /// Coil value driving the rain valve.
    pub fn valve_open(self) -> bool {
        matches!(self, WaterSource::Rain)
    }
}

/// `true` when the outdoor temperature is known and at or above the frost threshold.
pub fn is_frost_free(temperature: Option<f64>) -> bool {
    temperature.is_some_and(|t| t >= FROST_THRESHOLD_CELSIUS)
}

/// Rain water only when the tank is full and there is no frost risk.
pub fn choose_water_source(temperature: Option<f64>, tank_full: Option<bool>) -> WaterSource {
    if tank_full == Some(true) && is_frost_free(temperature) {
        WaterSource::Rain
    } else {
        WaterSource::Mains
    }
}

/// Pump runs only on demand, with a full tank and no frost risk.
pub fn pump_command(demand: bool, temperature: Option<f64>, tank_full: Option<bool>) -> bool {
    demand && tank_full == Some(true) && is_frost_free(temperature)
}

/// Regulation targets. Either may be absent, which disables that loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Setpoint {
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default, alias = "humidite")]
    pub humidity: Option<f64>,
}

impl Setpoint {
    pub fn new(temperature: Option<f64>, humidity: Option<f64>) -> Self {
        Self {
            temperature,
            humidity,
        }
    }
}

/// Position of the measured temperature relative to the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TemperatureBand {
    /// More than 0.5 below target.
    TooCold,
    /// Between 0.2 and 0.5 below target: hold.
    CoolMargin,
    /// Within 0.2 of target.
    Comfort,
    /// Between 0.2 and 0.5 above target: hold.
    WarmMargin,
    /// More than 0.5 above target.
    TooHot,
}

/// Desired state of the heating and window relays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClimateCommand {
    pub heating: bool,
    pub window: bool,
}

impl TemperatureBand {
    pub fn classify(actual: f64, target: f64) -> Self {
        if actual < target - TEMPERATURE_TRIGGER {
            TemperatureBand::TooCold
        } else if actual > target + TEMPERATURE_TRIGGER {
            TemperatureBand::TooHot
        } else if actual >= target - TEMPERATURE_DEAD_BAND
            && actual <= target + TEMPERATURE_DEAD_BAND
        {
            TemperatureBand::Comfort
        } else if actual < target {
            TemperatureBand::CoolMargin
        } else {
            TemperatureBand::WarmMargin
        }
    }

    /// Relay states for this band; `None` keeps the relays as they are.
    pub fn command(self) -> Option<ClimateCommand> {
        match self {
            TemperatureBand::TooCold => Some(ClimateCommand {
                heating: true,
                window: false,
            }),
            TemperatureBand::TooHot => Some(ClimateCommand {
                heating: false,
                window: true,
            }),
            TemperatureBand::Comfort => Some(ClimateCommand {
                heating: false,
                window: false,
            }),
            TemperatureBand::CoolMargin | TemperatureBand::WarmMargin => None,
        }
    }
}

/// Position of the mean soil humidity relative to the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HumidityBand {
    /// More than 2 below target.
    Dry,
    /// Between 1 and 2 below target: hold.
    DryMargin,
    /// Within 1 of target.
    Comfort,
    /// Between 1 and 2 above target: hold.
    WetMargin,
    /// More than 2 above target.
    Wet,
}

impl HumidityBand {
    pub fn classify(mean: f64, target: f64) -> Self {
        if mean < target - HUMIDITY_TRIGGER {
            HumidityBand::Dry
        } else if mean > target + HUMIDITY_TRIGGER {
            HumidityBand::Wet
        } else if mean >= target - HUMIDITY_DEAD_BAND && mean <= target + HUMIDITY_DEAD_BAND {
            HumidityBand::Comfort
        } else if mean < target {
            HumidityBand::DryMargin
        } else {
            HumidityBand::WetMargin
        }
    }

    /// Misting relay state for this band; `None` keeps it as it is.
    pub fn misting(self) -> Option<bool> {
        match self {
            HumidityBand::Dry => Some(true),
            HumidityBand::Wet | HumidityBand::Comfort => Some(false),
            HumidityBand::DryMargin | HumidityBand::WetMargin => None,
        }
    }
}

/// What one regulation pass decided. `None` means the loop was skipped
/// because either the target or the reading is missing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegulationPlan {
    pub temperature: Option<TemperatureBand>,
    pub humidity: Option<HumidityBand>,
}

impl RegulationPlan {
    pub fn new(setpoint: &Setpoint, temperature: Option<f64>, mean_humidity: Option<f64>) -> Self {
        Self {
            temperature: setpoint
                .temperature
                .zip(temperature)
                .map(|(target, actual)| TemperatureBand::classify(actual, target)),
            humidity: setpoint
                .humidity
                .zip(mean_humidity)
                .map(|(target, mean)| HumidityBand::classify(mean, target)),
        }
    }

    pub fn climate(&self) -> Option<ClimateCommand> {
        self.temperature.and_then(TemperatureBand::command)
    }

    pub fn misting(&self) -> Option<bool> {
        self.humidity.and_then(HumidityBand::misting)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_water_source_table() {
        assert_eq!(choose_water_source(Some(0.5), Some(true)), WaterSource::Mains);
        assert_eq!(choose_water_source(Some(2.0), Some(true)), WaterSource::Rain);
        assert_eq!(choose_water_source(Some(2.0), Some(false)), WaterSource::Mains);
        assert_eq!(choose_water_source(Some(5.0), Some(false)), WaterSource::Mains);
    }

    #[test]
    fn test_frost_threshold_is_inclusive() {
        assert!(is_frost_free(Some(1.0)));
        assert!(!is_frost_free(Some(0.99)));
        assert!(!is_frost_free(Some(-4.0)));
    }

    #[test]
    fn test_unknown_readings_are_fail_safe() {
        assert!(!is_frost_free(None));
        assert_eq!(choose_water_source(None, Some(true)), WaterSource::Mains);
        assert_eq!(choose_water_source(Some(10.0), None), WaterSource::Mains);
        assert!(!pump_command(true, None, Some(true)));
        assert!(!pump_command(true, Some(10.0), None));
    }

    #[test]
    fn test_pump_table() {
        assert!(pump_command(true, Some(5.0), Some(true)));
        assert!(!pump_command(true, Some(0.5), Some(true)));
        assert!(!pump_command(true, Some(5.0), Some(false)));
        assert!(!pump_command(false, Some(5.0), Some(true)));
    }

    #[test]
    fn test_temperature_bands() {
        let target = 20.0;
        assert_eq!(TemperatureBand::classify(19.0, target), TemperatureBand::TooCold);
        assert_eq!(TemperatureBand::classify(21.0, target), TemperatureBand::TooHot);
        assert_eq!(TemperatureBand::classify(20.1, target), TemperatureBand::Comfort);
        assert_eq!(TemperatureBand::classify(19.6, target), TemperatureBand::CoolMargin);
        assert_eq!(TemperatureBand::classify(20.4, target), TemperatureBand::WarmMargin);
    }

    #[test]
    fn test_temperature_commands() {
        assert_eq!(
            TemperatureBand::TooCold.command(),
            Some(ClimateCommand {
                heating: true,
                window: false
            })
        );
        assert_eq!(
            TemperatureBand::TooHot.command(),
            Some(ClimateCommand {
                heating: false,
                window: true
            })
        );
        assert_eq!(
            TemperatureBand::Comfort.command(),
            Some(ClimateCommand {
                heating: false,
                window: false
            })
        );
        assert_eq!(TemperatureBand::CoolMargin.command(), None);
        assert_eq!(TemperatureBand::WarmMargin.command(), None);
    }

    #[test]
    fn test_humidity_bands() {
        let target = 60.0;
        assert_eq!(HumidityBand::classify(57.0, target), HumidityBand::Dry);
        assert_eq!(HumidityBand::classify(58.5, target), HumidityBand::DryMargin);
        assert_eq!(HumidityBand::classify(59.0, target), HumidityBand::Comfort);
        assert_eq!(HumidityBand::classify(61.0, target), HumidityBand::Comfort);
        assert_eq!(HumidityBand::classify(61.5, target), HumidityBand::WetMargin);
        assert_eq!(HumidityBand::classify(62.5, target), HumidityBand::Wet);

        assert_eq!(HumidityBand::Dry.misting(), Some(true));
        assert_eq!(HumidityBand::Wet.misting(), Some(false));
        assert_eq!(HumidityBand::Comfort.misting(), Some(false));
        assert_eq!(HumidityBand::DryMargin.misting(), None);
    }

    #[test]
    fn test_plan_skips_missing_dimensions() {
        let plan = RegulationPlan::new(&Setpoint::new(Some(20.0), None), Some(19.0), Some(10.0));
        assert_eq!(plan.temperature, Some(TemperatureBand::TooCold));
        assert_eq!(plan.humidity, None);

        let plan = RegulationPlan::new(&Setpoint::new(Some(20.0), Some(60.0)), None, Some(57.0));
        assert_eq!(plan.climate(), None);
        assert_eq!(plan.misting(), Some(true));
    }

    #[test]
    fn test_setpoint_accepts_french_field_name() {
        let setpoint: Setpoint =
            serde_json::from_str(r#"{"temperature": 21.5, "humidite": 55}"#).unwrap();
        assert_eq!(setpoint, Setpoint::new(Some(21.5), Some(55.0)));

        let setpoint: Setpoint = serde_json::from_str(r#"{"temperature": null}"#).unwrap();
        assert_eq!(setpoint, Setpoint::default());
    }
}
