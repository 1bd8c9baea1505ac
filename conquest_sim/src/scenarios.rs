//! Conquest scenarios for deterministic simulation.

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioId {
    /// SIM-001: a single noisy 100 m square on empty ground
    SquareClaim,

    /// SIM-002: the same square walked twice by its owner
    RepeatClaim,

    /// SIM-003: a self-crossing walk
    FigureEight,

    /// SIM-004: the walker goes silent until the attempt expires
    Timeout,

    /// SIM-005: a square half covered by a rival's territory
    Contested,

    /// SIM-006: a square drawn around a rival's small territory
    Encircle,

    /// SIM-007: heavy noise and outliers on the way round
    NoisyWalk,

    /// SIM-008: an attempt abandoned half way, then retried
    Cancellation,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::SquareClaim,
            ScenarioId::RepeatClaim,
            ScenarioId::FigureEight,
            ScenarioId::Timeout,
            ScenarioId::Contested,
            ScenarioId::Encircle,
            ScenarioId::NoisyWalk,
            ScenarioId::Cancellation,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::SquareClaim => "square_claim",
            ScenarioId::RepeatClaim => "repeat_claim",
            ScenarioId::FigureEight => "figure_eight",
            ScenarioId::Timeout => "timeout",
            ScenarioId::Contested => "contested",
            ScenarioId::Encircle => "encircle",
            ScenarioId::NoisyWalk => "noisy_walk",
            ScenarioId::Cancellation => "cancellation",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::SquareClaim => "Walk a 100 m square, expect ~10 000 m² claimed",
            ScenarioId::RepeatClaim => "Replay the owner's own square, expect TooSmallOrDegenerate",
            ScenarioId::FigureEight => "Sparse bowtie walk, expect rejection at the simplicity check",
            ScenarioId::Timeout => "Start, walk two edges, go silent for 31 min, expect AttemptTimedOut",
            ScenarioId::Contested => "Rival holds the east half, expect only the west half claimed",
            ScenarioId::Encircle => "Rival's small square fully inside the walk, expect it displaced",
            ScenarioId::NoisyWalk => "20% outliers with 80 m error, expect them filtered and the square claimed",
            ScenarioId::Cancellation => "Cancel half way, then walk the full square, expect one claim",
        }
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "square_claim" | "squareclaim" | "sim-001" => Ok(ScenarioId::SquareClaim),
            "repeat_claim" | "repeatclaim" | "sim-002" => Ok(ScenarioId::RepeatClaim),
            "figure_eight" | "figureeight" | "sim-003" => Ok(ScenarioId::FigureEight),
            "timeout" | "sim-004" => Ok(ScenarioId::Timeout),
            "contested" | "sim-005" => Ok(ScenarioId::Contested),
            "encircle" | "sim-006" => Ok(ScenarioId::Encircle),
            "noisy_walk" | "noisywalk" | "sim-007" => Ok(ScenarioId::NoisyWalk),
            "cancellation" | "sim-008" => Ok(ScenarioId::Cancellation),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}
