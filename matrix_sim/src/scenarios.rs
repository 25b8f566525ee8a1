//! Named simulation scenarios.

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioId {
    /// Agents with energy, souls and foraging; exercises rule order and soul writes
    Ecosystem,

    /// A rule that fails periodically; exercises abort-without-rollback
    FaultyRule,

    /// Event bursts against a stalled subscriber; exercises drop-on-full
    Flood,

    /// WebAssembly agents messaging each other, plus misbehaving guests
    GuestAgents,
}

impl ScenarioId {
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::Ecosystem,
            ScenarioId::FaultyRule,
            ScenarioId::Flood,
            ScenarioId::GuestAgents,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::Ecosystem => "ecosystem",
            ScenarioId::FaultyRule => "faulty_rule",
            ScenarioId::Flood => "flood",
            ScenarioId::GuestAgents => "guest_agents",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::Ecosystem => "Energy decay, foraging and census over a soul-backed population",
            ScenarioId::FaultyRule => "Every third step a mid-priority rule fails; earlier effects persist",
            ScenarioId::Flood => "150-event bursts per step against a 100-slot subscriber that never drains",
            ScenarioId::GuestAgents => "Sandboxed guests send ring messages; a spinner and a trespasser get evicted",
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
            "ecosystem" => Ok(ScenarioId::Ecosystem),
            "faulty_rule" | "faultyrule" => Ok(ScenarioId::FaultyRule),
            "flood" => Ok(ScenarioId::Flood),
            "guest_agents" | "guestagents" | "guests" => Ok(ScenarioId::GuestAgents),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_parse_back() {
        for id in ScenarioId::all() {
            assert_eq!(id.name().parse::<ScenarioId>().unwrap(), id);
            assert!(!id.description().is_empty());
        }
        assert_eq!("GUESTS".parse::<ScenarioId>().unwrap(), ScenarioId::GuestAgents);
        assert!("chaos".parse::<ScenarioId>().is_err());
    }
}
