use fail::FailScenario;

use crate::failpoints::stage_worker_fail_point;
use crate::types::StageId;

/// Configures fail points for the duration of a test and switches them off again on drop.
///
/// Holding the scenario serializes the tests using fail points, since the registry is global.
/// Actions use the `fail` crate syntax, e.g. `return(transient)` or `1*return->off`.
pub struct CustomFailScenario<'a> {
    _scenario: FailScenario<'a>,
    configured: Vec<String>,
}

impl<'a> CustomFailScenario<'a> {
    pub fn setup(failpoints: &[(&str, &str)]) -> CustomFailScenario<'a> {
        let mut scenario = Self {
            _scenario: FailScenario::setup(),
            configured: Vec::with_capacity(failpoints.len()),
        };

        for (name, action) in failpoints {
            scenario.configure(name, action);
        }

        scenario
    }

    /// Makes the worker of `stage` evaluate `action` before it runs.
    pub fn fail_stage(stage: StageId, action: &str) -> CustomFailScenario<'a> {
        let name = stage_worker_fail_point(stage);
        Self::setup(&[(name.as_str(), action)])
    }

    /// Changes the action of a fail point while the scenario is held.
    pub fn configure(&mut self, name: &str, action: &str) {
        fail::cfg(name, action).unwrap();
        if !self.configured.iter().any(|configured| configured == name) {
            self.configured.push(name.to_owned());
        }
    }
}

impl Drop for CustomFailScenario<'_> {
    fn drop(&mut self) {
        for name in &self.configured {
            fail::cfg(name, "off").unwrap()
        }
    }
}
