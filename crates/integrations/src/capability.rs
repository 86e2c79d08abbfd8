use serde::{Deserialize, Serialize};

/// One thing an integration can do for the agent.
///
/// Capability names double as tool-name prefixes: the tool built for
/// `(loki, LogsSearch)` is exposed to the model as `logs.search.loki`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
    LogsSearch,
    LogsErrors,
    MetricsQuery,
    MetricsCpu,
    MetricsMemory,
    MetricsLatency,
    CodeRead,
    CodeSearch,
    CodeListCommits,
    CodeListRepos,
}

/// Adapter family a capability belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityGroup {
    Logs,
    Metrics,
    Code,
}

impl Capability {
    pub const ALL: [Capability; 10] = [
        Capability::LogsSearch,
        Capability::LogsErrors,
        Capability::MetricsQuery,
        Capability::MetricsCpu,
        Capability::MetricsMemory,
        Capability::MetricsLatency,
        Capability::CodeRead,
        Capability::CodeSearch,
        Capability::CodeListCommits,
        Capability::CodeListRepos,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Capability::LogsSearch => "logs.search",
            Capability::LogsErrors => "logs.errors",
            Capability::MetricsQuery => "metrics.query",
            Capability::MetricsCpu => "metrics.cpu",
            Capability::MetricsMemory => "metrics.memory",
            Capability::MetricsLatency => "metrics.latency",
            Capability::CodeRead => "code.read",
            Capability::CodeSearch => "code.search",
            Capability::CodeListCommits => "code.list_commits",
            Capability::CodeListRepos => "code.list_repos",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Capability::ALL.into_iter().find(|c| c.as_str() == s)
    }

    pub fn group(self) -> CapabilityGroup {
        match self {
            Capability::LogsSearch | Capability::LogsErrors => CapabilityGroup::Logs,
            Capability::MetricsQuery
            | Capability::MetricsCpu
            | Capability::MetricsMemory
            | Capability::MetricsLatency => CapabilityGroup::Metrics,
            Capability::CodeRead
            | Capability::CodeSearch
            | Capability::CodeListCommits
            | Capability::CodeListRepos => CapabilityGroup::Code,
        }
    }

    /// Tool name for this capability on a given provider.
    pub fn tool_name(self, provider: &str) -> String {
        format!("{}.{provider}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip() {
        for c in Capability::ALL {
            assert_eq!(Capability::parse(c.as_str()), Some(c));
        }
        assert_eq!(Capability::parse("traces.search"), None);
    }

    #[test]
    fn tool_names_carry_provider() {
        assert_eq!(
            Capability::LogsSearch.tool_name("loki"),
            "logs.search.loki"
        );
        assert_eq!(
            Capability::CodeListCommits.tool_name("github"),
            "code.list_commits.github"
        );
    }
}
