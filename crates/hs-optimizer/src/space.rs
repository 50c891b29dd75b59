//! Discrete parameter spaces.

use hs_types::{ConfigError, ParameterValue};
use indexmap::IndexMap;
use serde::Serialize;

/// One concrete assignment: parameter name to selected value, in declaration order.
pub type Assignment = IndexMap<String, ParameterValue>;

/// A single parameter dimension in the search space.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParameterDef {
    /// Parameter name as it appears in the command template (e.g. "decorr_lr").
    pub name: String,
    /// Candidate values, in the order they were declared.
    pub values: Vec<ParameterValue>,
}

/// The full search space: an ordered list of parameter definitions.
///
/// Only constructible through [`ParameterSpace::add_parameter`], so every
/// instance satisfies: names unique, candidate sets non-empty, candidates
/// within one parameter render distinctly.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ParameterSpace {
    parameters: Vec<ParameterDef>,
}

impl ParameterSpace {
    pub fn new() -> Self {
        Self {
            parameters: Vec::new(),
        }
    }

    pub fn add_parameter(
        &mut self,
        name: impl Into<String>,
        values: Vec<ParameterValue>,
    ) -> Result<(), ConfigError> {
        let name = name.into();
        if self.contains(&name) {
            return Err(ConfigError::DuplicateParameter { name });
        }
        if values.is_empty() {
            return Err(ConfigError::EmptyCandidateSet { name });
        }

        let mut seen = std::collections::HashSet::with_capacity(values.len());
        for value in &values {
            value.validate(&name)?;
            let rendered = value.render();
            if !seen.insert(rendered.clone()) {
                return Err(ConfigError::DuplicateCandidate {
                    name,
                    value: rendered,
                });
            }
        }

        self.parameters.push(ParameterDef { name, values });
        Ok(())
    }

    /// Builder form of [`add_parameter`](Self::add_parameter).
    pub fn with_parameter(
        mut self,
        name: impl Into<String>,
        values: Vec<ParameterValue>,
    ) -> Result<Self, ConfigError> {
        self.add_parameter(name, values)?;
        Ok(self)
    }

    pub fn parameters(&self) -> &[ParameterDef] {
        &self.parameters
    }

    pub fn get(&self, name: &str) -> Option<&ParameterDef> {
        self.parameters.iter().find(|p| p.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    /// Parameters in declaration order.
    pub fn iter(&self) -> std::slice::Iter<'_, ParameterDef> {
        self.parameters.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.parameters.iter().map(|p| p.name.as_str())
    }

    /// Cartesian-product cardinality. `None` if it overflows `usize`.
    pub fn size(&self) -> Option<usize> {
        self.parameters
            .iter()
            .try_fold(1usize, |total, p| total.checked_mul(p.values.len()))
    }

    /// Decode a mixed-radix index into an assignment. The last-declared
    /// parameter is the least significant digit, so it varies fastest as the
    /// index increases.
    pub fn assignment_at(&self, index: usize) -> Option<Assignment> {
        if index >= self.size()? {
            return None;
        }

        let mut digits = vec![0usize; self.parameters.len()];
        let mut rest = index;
        for (slot, param) in digits.iter_mut().zip(&self.parameters).rev() {
            *slot = rest % param.values.len();
            rest /= param.values.len();
        }

        Some(
            self.parameters
                .iter()
                .zip(digits)
                .map(|(param, digit)| (param.name.clone(), param.values[digit].clone()))
                .collect(),
        )
    }

    /// Candidate position of `value` within parameter `name`.
    pub fn candidate_index(&self, name: &str, value: &ParameterValue) -> Option<usize> {
        let rendered = value.render();
        self.get(name)?
            .values
            .iter()
            .position(|v| v.render() == rendered)
    }

    /// Whether `assignment` covers every parameter exactly once with a
    /// declared candidate.
    pub fn is_complete(&self, assignment: &Assignment) -> bool {
        assignment.len() == self.parameters.len()
            && self.parameters.iter().all(|p| {
                assignment
                    .get(&p.name)
                    .is_some_and(|v| self.candidate_index(&p.name, v).is_some())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn floats(values: &[f64]) -> Vec<ParameterValue> {
        values.iter().copied().map(ParameterValue::Float).collect()
    }

    #[test]
    fn rejects_duplicate_parameter() {
        let mut space = ParameterSpace::new();
        space.add_parameter("lr", floats(&[0.1])).unwrap();
        let err = space.add_parameter("lr", floats(&[0.2])).unwrap_err();
        assert_eq!(err, ConfigError::DuplicateParameter { name: "lr".into() });
        assert_eq!(space.len(), 1);
    }

    #[test]
    fn rejects_empty_candidates() {
        let err = ParameterSpace::new()
            .with_parameter("lr", vec![])
            .unwrap_err();
        assert_eq!(err, ConfigError::EmptyCandidateSet { name: "lr".into() });
    }

    #[test]
    fn rejects_indistinct_candidates() {
        let err = ParameterSpace::new()
            .with_parameter("d", vec![ParameterValue::Int(1), ParameterValue::from("1")])
            .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateCandidate { .. }));
    }

    #[test]
    fn size_is_product() {
        let space = ParameterSpace::new()
            .with_parameter("a", floats(&[1.0, 2.0, 3.0]))
            .unwrap()
            .with_parameter("b", vec![true.into(), false.into()])
            .unwrap();
        assert_eq!(space.size(), Some(6));
        assert_eq!(ParameterSpace::new().size(), Some(1));
    }

    #[test]
    fn size_overflow_is_none() {
        let values: Vec<ParameterValue> = (0..1 << 16).map(ParameterValue::Int).collect();
        let mut space = ParameterSpace::new();
        for i in 0..5 {
            space.add_parameter(format!("p{i}"), values.clone()).unwrap();
        }
        assert_eq!(space.size(), None);
        assert!(space.assignment_at(0).is_none());
    }

    #[test]
    fn last_parameter_varies_fastest() {
        let space = ParameterSpace::new()
            .with_parameter("outer", vec![1i64.into(), 2i64.into()])
            .unwrap()
            .with_parameter("inner", vec!["x".into(), "y".into(), "z".into()])
            .unwrap();

        let first = space.assignment_at(0).unwrap();
        let second = space.assignment_at(1).unwrap();
        let fourth = space.assignment_at(3).unwrap();
        assert_eq!(first["outer"], ParameterValue::Int(1));
        assert_eq!(first["inner"], ParameterValue::from("x"));
        assert_eq!(second["outer"], ParameterValue::Int(1));
        assert_eq!(second["inner"], ParameterValue::from("y"));
        assert_eq!(fourth["outer"], ParameterValue::Int(2));
        assert_eq!(fourth["inner"], ParameterValue::from("x"));
        assert!(space.assignment_at(6).is_none());

        let keys: Vec<&String> = first.keys().collect();
        assert_eq!(keys, vec!["outer", "inner"]);
        assert!(space.is_complete(&first));
    }
}
