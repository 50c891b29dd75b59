use serde::{Deserialize, Serialize};

/// Whether we are maximizing or minimizing the objective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Goal {
    Minimize,
    Maximize,
}

impl Default for Goal {
    fn default() -> Self {
        Self::Minimize
    }
}

impl Goal {
    /// Strict improvement of `candidate` over `incumbent`. Ties never improve.
    pub fn improves(&self, candidate: f64, incumbent: f64) -> bool {
        match self {
            Goal::Minimize => candidate < incumbent,
            Goal::Maximize => candidate > incumbent,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Goal::Minimize => "minimize",
            Goal::Maximize => "maximize",
        }
    }
}

impl std::fmt::Display for Goal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The named metric a sweep ranks trials by.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Objective {
    pub name: String,
    #[serde(default)]
    pub goal: Goal,
}

impl Objective {
    pub fn new(name: impl Into<String>, goal: Goal) -> Self {
        Self {
            name: name.into(),
            goal,
        }
    }

    pub fn minimize(name: impl Into<String>) -> Self {
        Self::new(name, Goal::Minimize)
    }

    pub fn maximize(name: impl Into<String>) -> Self {
        Self::new(name, Goal::Maximize)
    }
}

/// Search method, fixed for the lifetime of a sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    Grid,
    Random,
    #[serde(alias = "model-guided", alias = "bayesian")]
    Bayes,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Grid => "grid",
            Method::Random => "random",
            Method::Bayes => "bayes",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
