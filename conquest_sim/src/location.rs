//! Scripted location source for simulation.

use crate::context::SimContext;
use async_trait::async_trait;
use conquest_env::{LocationSignal, LocationSource, PathPoint};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// One entry of a location script.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptStep {
    Signal(LocationSignal),

    /// No fix for a while; surfaces as `LocationSignal::Unavailable`
    Silence(Duration),
}

/// Replays a script, moving the virtual clock to each fix's timestamp.
///
/// The feed reports closed (`None`) whenever the script runs dry; more
/// steps can be queued afterwards.
pub struct ScriptedLocationSource {
    context: Arc<SimContext>,
    script: Mutex<VecDeque<ScriptStep>>,
}

impl ScriptedLocationSource {
    pub fn new(context: Arc<SimContext>) -> Self {
        Self {
            context,
            script: Mutex::new(VecDeque::new()),
        }
    }

    fn script(&self) -> MutexGuard<'_, VecDeque<ScriptStep>> {
        self.script
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn push(&self, step: ScriptStep) {
        self.script().push_back(step);
    }

    pub fn push_fixes(&self, fixes: impl IntoIterator<Item = PathPoint>) {
        self.script()
            .extend(fixes.into_iter().map(|f| ScriptStep::Signal(LocationSignal::Fix(f))));
    }

    pub fn remaining(&self) -> usize {
        self.script().len()
    }
}

#[async_trait]
impl LocationSource for ScriptedLocationSource {
    async fn next_signal(&self) -> Option<LocationSignal> {
        let step = self.script().pop_front()?;
        match step {
            ScriptStep::Signal(LocationSignal::Fix(fix)) => {
                self.context.advance_to(fix.timestamp_ms);
                Some(LocationSignal::Fix(fix))
            }
            ScriptStep::Signal(other) => Some(other),
            ScriptStep::Silence(duration) => {
                self.context.advance_time(duration);
                Some(LocationSignal::Unavailable(format!(
                    "no fix for {} s",
                    duration.as_secs()
                )))
            }
        }
    }
}
