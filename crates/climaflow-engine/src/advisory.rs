/*!
 * Control advisory.
 *
 * [`AdvisoryRules`] compares a measurement with the active targets and
 * proposes discrete corrections. It performs no I/O. [`AdvisoryEngine`]
 * records the proposals and owns their lifecycle: apply, reject and the
 * pending list.
 *
 * Rules, each yielding at most one advice:
 *
 * | rule        | trigger                                          | priority | auto-apply    |
 * |-------------|--------------------------------------------------|----------|---------------|
 * | temperature | `|t - day target| > threshold`                   | high     | control mode  |
 * | vpd         | `|vpd - optimal(t)| > threshold`                 | medium   | never         |
 * | co2         | lights on and `co2 < ratio * day target`         | medium   | control mode  |
 * | energy      | lights off and `t > night target + margin`       | low      | never         |
 *
 * Only high-priority advice is ever applied without a person.
 */
use std::cmp::Reverse;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use climaflow_core::clock::SharedClock;
use climaflow_core::config::AdvisoryConfig;
use climaflow_core::event::EventBus;
use climaflow_core::types::Id;
use climaflow_devices::measurement::celsius_to_fahrenheit;
use climaflow_devices::normalizer::humidity_for_vpd;
use climaflow_devices::{ClimateComputer, ClimateMeasurement, OperatingMode, ParameterPath, SetpointConfig};

use crate::error::{Error, Result};
use crate::events::EngineEvent;
use crate::setpoint::{ClimateSetpoint, SetpointChange, SetpointSource, SetpointWriter};
use crate::store::ClimateStore;

/// Actor recorded in the audit log for automatic changes
pub const AUTO_ACTOR: &str = "auto-apply";

/// Advice priority, ordered low to high
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdvicePriority {
    /// Optional optimization
    Low,
    /// Should be reviewed
    Medium,
    /// Needs correction now
    High,
}

/// Advice lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdviceStatus {
    /// Waiting for a decision
    Pending,
    /// Claimed by an apply in flight, or approved by another tool
    Accepted,
    /// Dismissed
    Rejected,
    /// Written to the controller
    Applied,
}

impl fmt::Display for AdviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AdviceStatus::Pending => "pending",
            AdviceStatus::Accepted => "accepted",
            AdviceStatus::Rejected => "rejected",
            AdviceStatus::Applied => "applied",
        };
        f.write_str(name)
    }
}

/// A proposed setpoint correction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlAdvice {
    /// Advice ID
    pub id: Id,
    /// Owning computer
    pub computer_id: Id,
    /// Target compartment
    pub compartment_id: Id,
    /// Parameter to change
    pub parameter: ParameterPath,
    /// Value currently observed
    pub current_value: f64,
    /// Value to write
    pub recommended_value: f64,
    /// Human-readable explanation
    pub rationale: String,
    /// Estimated energy change in kWh, negative for savings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub energy_impact_kwh: Option<f64>,
    /// Estimated cost change, negative for savings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_impact: Option<f64>,
    /// Priority
    pub priority: AdvicePriority,
    /// Eligible for application without a person
    pub auto_apply: bool,
    /// Lifecycle status
    pub status: AdviceStatus,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// After this instant the advice must not be applied
    pub expires_at: DateTime<Utc>,
}

impl ControlAdvice {
    /// Whether the advice is past its expiry at `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Whether the scheduler may apply the advice on its own
    pub fn should_auto_apply(&self) -> bool {
        self.auto_apply && self.priority == AdvicePriority::High && self.status == AdviceStatus::Pending
    }
}

/// Order advice by priority, most urgent first, then by creation time
pub fn rank(advice: &mut [ControlAdvice]) {
    advice.sort_by_key(|a| (Reverse(a.priority), a.created_at));
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Pure advisory rules
#[derive(Debug, Clone, Default)]
pub struct AdvisoryRules {
    config: AdvisoryConfig,
}

struct Draft {
    parameter: ParameterPath,
    current: f64,
    recommended: f64,
    rationale: String,
    priority: AdvicePriority,
    auto_apply: bool,
    energy_kwh: Option<f64>,
    cost: Option<f64>,
    lifetime_minutes: i64,
}

impl AdvisoryRules {
    /// Rules with the given thresholds
    pub fn new(config: AdvisoryConfig) -> Self {
        Self { config }
    }

    /// Thresholds in use
    pub fn config(&self) -> &AdvisoryConfig {
        &self.config
    }

    /// Evaluate every rule for one measurement, ranked by priority
    pub fn evaluate(
        &self,
        computer: &ClimateComputer,
        measurement: &ClimateMeasurement,
        targets: &SetpointConfig,
        now: DateTime<Utc>,
    ) -> Vec<ControlAdvice> {
        let control = computer.mode == OperatingMode::Control;
        let caps = &computer.capabilities;

        let drafts = [
            caps.temperature
                .then(|| self.temperature(measurement, targets, control))
                .flatten(),
            caps.humidity.then(|| self.vpd(computer, measurement)).flatten(),
            caps.co2.then(|| self.co2(measurement, targets, control)).flatten(),
            caps.temperature.then(|| self.energy(measurement, targets)).flatten(),
        ];

        let mut advice: Vec<ControlAdvice> = drafts
            .into_iter()
            .flatten()
            .map(|draft| ControlAdvice {
                id: Id::new(),
                computer_id: computer.id.clone(),
                compartment_id: measurement.compartment_id.clone(),
                parameter: draft.parameter,
                current_value: draft.current,
                recommended_value: draft.recommended,
                rationale: draft.rationale,
                energy_impact_kwh: draft.energy_kwh,
                cost_impact: draft.cost,
                priority: draft.priority,
                auto_apply: draft.auto_apply,
                status: AdviceStatus::Pending,
                created_at: now,
                expires_at: now + Duration::minutes(draft.lifetime_minutes),
            })
            .collect();
        rank(&mut advice);
        advice
    }

    fn temperature(&self, m: &ClimateMeasurement, targets: &SetpointConfig, control: bool) -> Option<Draft> {
        let target = targets.temperature.day;
        let deviation = m.temperature - target;
        if deviation.abs() <= self.config.temperature_threshold {
            return None;
        }
        let direction = if deviation > 0.0 { "above" } else { "below" };
        Some(Draft {
            parameter: ParameterPath::TemperatureDay,
            current: m.temperature,
            recommended: target,
            rationale: format!(
                "Temperature {:.1}°C is {:.1}°C {} the {:.1}°C target",
                m.temperature,
                deviation.abs(),
                direction,
                target
            ),
            priority: AdvicePriority::High,
            auto_apply: control,
            energy_kwh: None,
            cost: None,
            lifetime_minutes: self.config.expiry_minutes,
        })
    }

    fn vpd(&self, computer: &ClimateComputer, m: &ClimateMeasurement) -> Option<Draft> {
        let bands = computer.vpd_bands.as_ref().unwrap_or(&self.config.vpd_bands);
        let optimal = bands.optimal_for(celsius_to_fahrenheit(m.temperature));
        let deviation = m.vpd - optimal;
        if deviation.abs() <= self.config.vpd_threshold {
            return None;
        }
        let parameter = if m.lights_active {
            ParameterPath::HumidityDay
        } else {
            ParameterPath::HumidityNight
        };
        let recommended = round1(humidity_for_vpd(m.temperature, optimal));
        let state = if deviation > 0.0 { "too dry" } else { "too humid" };
        Some(Draft {
            parameter,
            current: m.humidity,
            recommended,
            rationale: format!(
                "VPD {:.2} kPa is {}; {:.1}% RH restores the {:.2} kPa optimum at {:.1}°C",
                m.vpd, state, recommended, optimal, m.temperature
            ),
            priority: AdvicePriority::Medium,
            auto_apply: false,
            energy_kwh: None,
            cost: None,
            lifetime_minutes: self.config.expiry_minutes,
        })
    }

    fn co2(&self, m: &ClimateMeasurement, targets: &SetpointConfig, control: bool) -> Option<Draft> {
        if !m.lights_active {
            return None;
        }
        let floor = targets.co2.day * self.config.co2_ratio;
        if m.co2 >= floor {
            return None;
        }
        Some(Draft {
            parameter: ParameterPath::Co2Dosing,
            current: if m.co2_dosing_active { 1.0 } else { 0.0 },
            recommended: 1.0,
            rationale: format!(
                "CO2 {:.0} ppm is below {:.0}% of the {:.0} ppm day target while lights are on",
                m.co2,
                self.config.co2_ratio * 100.0,
                targets.co2.day
            ),
            priority: AdvicePriority::Medium,
            auto_apply: control,
            energy_kwh: None,
            cost: None,
            lifetime_minutes: self.config.expiry_minutes,
        })
    }

    fn energy(&self, m: &ClimateMeasurement, targets: &SetpointConfig) -> Option<Draft> {
        if m.lights_active {
            return None;
        }
        let night = targets.temperature.night;
        let excess = m.temperature - night;
        if excess <= self.config.energy_margin {
            return None;
        }
        let energy = -(excess * self.config.kwh_per_degree);
        let cost = energy * self.config.energy_price_per_kwh;
        Some(Draft {
            parameter: ParameterPath::TemperatureNight,
            current: m.temperature,
            recommended: night,
            rationale: format!(
                "Lights are off and {:.1}°C is {:.1}°C above the {:.1}°C night target; holding the night target saves {:.1} kWh",
                m.temperature,
                excess,
                night,
                -energy
            ),
            priority: AdvicePriority::Low,
            auto_apply: false,
            energy_kwh: Some(energy),
            cost: Some(cost),
            lifetime_minutes: self.config.energy_expiry_minutes,
        })
    }
}

/// Records advice and drives its lifecycle
#[derive(Debug)]
pub struct AdvisoryEngine {
    rules: AdvisoryRules,
    store: Arc<dyn ClimateStore>,
    writer: Arc<SetpointWriter>,
    clock: SharedClock,
    events: EventBus<EngineEvent>,
}

impl AdvisoryEngine {
    /// Create an advisory engine
    pub fn new(
        rules: AdvisoryRules,
        store: Arc<dyn ClimateStore>,
        writer: Arc<SetpointWriter>,
        clock: SharedClock,
        events: EventBus<EngineEvent>,
    ) -> Self {
        Self {
            rules,
            store,
            writer,
            clock,
            events,
        }
    }

    /// The rule set
    pub fn rules(&self) -> &AdvisoryRules {
        &self.rules
    }

    /// Evaluate the rules and store every resulting advice
    pub async fn generate(
        &self,
        computer: &ClimateComputer,
        measurement: &ClimateMeasurement,
        targets: &SetpointConfig,
    ) -> Result<Vec<ControlAdvice>> {
        let advice = self.rules.evaluate(computer, measurement, targets, self.clock.now());
        for item in &advice {
            self.store.save_advice(item).await?;
            debug!(
                advice_id = %item.id,
                compartment_id = %item.compartment_id,
                "Advice created: {} {:?}",
                item.parameter,
                item.priority
            );
            self.events.publish(EngineEvent::AdviceCreated {
                advice_id: item.id.clone(),
                compartment_id: item.compartment_id.clone(),
                parameter: item.parameter,
                priority: item.priority,
            });
        }
        Ok(advice)
    }

    /// Write the advice to the controller.
    ///
    /// Expired or non-pending advice is refused before any controller call.
    /// The advice is claimed (`accepted`) before the write, so a concurrent
    /// reject fails instead of racing the controller. It becomes `applied`
    /// in the same store transaction that records the new setpoint. On a
    /// failed write the claim is released and the advice is pending again.
    pub async fn apply(&self, advice_id: &Id, actor: &str) -> Result<ClimateSetpoint> {
        let advice = self
            .store
            .get_advice(advice_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("advice {}", advice_id)))?;
        if advice.status != AdviceStatus::Pending {
            return Err(Error::InvalidTransition(format!(
                "advice {} is {}",
                advice_id, advice.status
            )));
        }
        if advice.is_expired(self.clock.now()) {
            return Err(Error::StaleAdvice(format!(
                "advice {} expired at {}",
                advice_id, advice.expires_at
            )));
        }

        self.store
            .transition_advice(advice_id, AdviceStatus::Pending, AdviceStatus::Accepted)
            .await?;

        let change = SetpointChange {
            compartment_id: advice.compartment_id.clone(),
            changes: vec![(advice.parameter, advice.recommended_value)],
            source: SetpointSource::Advice,
            actor: actor.to_string(),
            advice_id: Some(advice.id.clone()),
        };
        let setpoint = match self.writer.write(change).await {
            Ok(setpoint) => setpoint,
            Err(e) => {
                warn!(advice_id = %advice_id, "Applying advice failed: {}", e);
                self.release(advice_id).await;
                return Err(e);
            }
        };

        info!(advice_id = %advice_id, setpoint_id = %setpoint.id, actor = %actor, "Advice applied");
        self.events.publish(EngineEvent::AdviceApplied {
            advice_id: advice_id.clone(),
            setpoint_id: setpoint.id.clone(),
        });
        Ok(setpoint)
    }

    async fn release(&self, advice_id: &Id) {
        if let Err(e) = self
            .store
            .transition_advice(advice_id, AdviceStatus::Accepted, AdviceStatus::Pending)
            .await
        {
            warn!(advice_id = %advice_id, "Releasing advice claim failed: {}", e);
        }
    }

    /// Dismiss pending advice; the controller is not touched
    pub async fn reject(&self, advice_id: &Id) -> Result<ControlAdvice> {
        let advice = self
            .store
            .transition_advice(advice_id, AdviceStatus::Pending, AdviceStatus::Rejected)
            .await?;
        info!(advice_id = %advice_id, "Advice rejected");
        self.events.publish(EngineEvent::AdviceRejected {
            advice_id: advice_id.clone(),
        });
        Ok(advice)
    }

    /// Pending, unexpired advice for a compartment, most urgent first
    pub async fn pending_advice(&self, compartment_id: &Id) -> Result<Vec<ControlAdvice>> {
        let now = self.clock.now();
        let mut pending: Vec<_> = self
            .store
            .list_advice(compartment_id)
            .await?
            .into_iter()
            .filter(|a| a.status == AdviceStatus::Pending && !a.is_expired(now))
            .collect();
        rank(&mut pending);
        Ok(pending)
    }
}
