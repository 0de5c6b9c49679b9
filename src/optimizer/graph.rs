//! Factor graph container.

use crate::error::{OptimError, OptimResult};

use super::factors::Factor;
use super::variables::{Estimate, Variable, VariableId};

/// Index of a factor inside one graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FactorId(pub usize);

/// Variables and the factors that bind them.
///
/// Ids are dense indices handed out in insertion order; nothing is ever
/// removed, outliers are deactivated instead.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    variables: Vec<Variable>,
    factors: Vec<Factor>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_variable(&mut self, variable: Variable) -> VariableId {
        self.variables.push(variable);
        VariableId(self.variables.len() - 1)
    }

    /// Add a factor after checking arity and variable kinds.
    pub fn add_factor(&mut self, factor: Factor) -> OptimResult<FactorId> {
        let expected = factor.kind.expected_variables();
        if expected.len() != factor.variables.len() {
            return Err(OptimError::ArityMismatch {
                factor: factor.kind.name(),
                expected: expected.len(),
                found: factor.variables.len(),
            });
        }
        for (position, (id, kind)) in factor.variables.iter().zip(expected).enumerate() {
            let variable = self
                .variables
                .get(id.0)
                .ok_or(OptimError::UnknownVariable(*id))?;
            if variable.kind() != *kind {
                return Err(OptimError::KindMismatch {
                    factor: factor.kind.name(),
                    position,
                    expected: *kind,
                    found: variable.kind(),
                });
            }
        }
        self.factors.push(factor);
        Ok(FactorId(self.factors.len() - 1))
    }

    pub fn variable(&self, id: VariableId) -> Option<&Variable> {
        self.variables.get(id.0)
    }

    pub fn variable_mut(&mut self, id: VariableId) -> Option<&mut Variable> {
        self.variables.get_mut(id.0)
    }

    pub fn estimate(&self, id: VariableId) -> Option<&Estimate> {
        self.variables.get(id.0).map(|v| &v.estimate)
    }

    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }

    pub fn variables_mut(&mut self) -> &mut [Variable] {
        &mut self.variables
    }

    pub fn factor(&self, id: FactorId) -> Option<&Factor> {
        self.factors.get(id.0)
    }

    pub fn factor_mut(&mut self, id: FactorId) -> Option<&mut Factor> {
        self.factors.get_mut(id.0)
    }

    pub fn factors(&self) -> &[Factor] {
        &self.factors
    }

    pub fn factors_mut(&mut self) -> &mut [Factor] {
        &mut self.factors
    }

    pub fn num_variables(&self) -> usize {
        self.variables.len()
    }

    pub fn num_factors(&self) -> usize {
        self.factors.len()
    }

    /// Estimates bound by a factor, in binding order.
    pub fn factor_estimates(&self, factor: &Factor) -> Option<Vec<&Estimate>> {
        factor.variables.iter().map(|id| self.estimate(*id)).collect()
    }

    /// Variables bound by a factor, in binding order.
    pub fn factor_variables(&self, factor: &Factor) -> Option<Vec<&Variable>> {
        factor.variables.iter().map(|id| self.variable(*id)).collect()
    }

    /// chi2 of a factor at the current estimates.
    pub fn factor_chi2(&self, id: FactorId) -> Option<f64> {
        let factor = self.factor(id)?;
        factor.chi2(&self.factor_estimates(factor)?)
    }

    /// Restore the initial estimate of every variable flagged to reset.
    pub fn reset_flagged(&mut self) {
        for variable in self.variables.iter_mut().filter(|v| v.reset_each_round) {
            variable.reset();
        }
    }

    /// Unweighted total chi2 over active factors.
    pub fn active_chi2(&self) -> f64 {
        self.factors
            .iter()
            .filter(|f| f.active)
            .filter_map(|f| f.chi2(&self.factor_estimates(f)?))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::factors::FactorKind;
    use nalgebra::{Vector2, Vector3};

    #[test]
    fn test_add_factor_validates_kinds() {
        let mut graph = Graph::new();
        let flow = graph.add_variable(Variable::new(Estimate::Flow(Vector2::zeros())));
        let point = graph.add_variable(Variable::new(Estimate::Point(Vector3::zeros())));

        let ok = graph.add_factor(Factor::new(
            FactorKind::FlowPrior { measurement: Vector2::new(1.0, 0.0) },
            vec![flow],
        ));
        assert!(ok.is_ok());

        let wrong_kind = graph.add_factor(Factor::new(
            FactorKind::FlowPrior { measurement: Vector2::zeros() },
            vec![point],
        ));
        assert!(matches!(wrong_kind, Err(OptimError::KindMismatch { .. })));

        let wrong_arity = graph.add_factor(Factor::new(
            FactorKind::FlowPrior { measurement: Vector2::zeros() },
            vec![flow, point],
        ));
        assert!(matches!(wrong_arity, Err(OptimError::ArityMismatch { .. })));

        let unknown = graph.add_factor(Factor::new(
            FactorKind::FlowPrior { measurement: Vector2::zeros() },
            vec![VariableId(7)],
        ));
        assert!(matches!(unknown, Err(OptimError::UnknownVariable(_))));
        assert_eq!(graph.num_factors(), 1);
    }

    #[test]
    fn test_factor_chi2_and_reset() {
        let mut graph = Graph::new();
        let flow = graph.add_variable(
            Variable::new(Estimate::Flow(Vector2::new(1.0, 1.0))).reset_each_round(true),
        );
        let id = graph
            .add_factor(Factor::new(
                FactorKind::FlowPrior { measurement: Vector2::zeros() },
                vec![flow],
            ))
            .unwrap();
        assert_eq!(graph.factor_chi2(id), Some(2.0));

        graph.variable_mut(flow).unwrap().estimate = Estimate::Flow(Vector2::zeros());
        assert_eq!(graph.active_chi2(), 0.0);

        graph.reset_flagged();
        assert_eq!(graph.estimate(flow), Some(&Estimate::Flow(Vector2::new(1.0, 1.0))));
    }
}
