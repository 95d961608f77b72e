// rust/trainer-core/src/optimizer.rs

//! Optimizer capability used by [`crate::model::TrainingModel::minimize`].
//!
//! The runtime never differentiates anything itself. Gradient graphs come
//! from whatever engine implements [`Differentiator`]; [`GradientDescent`]
//! only turns `(gradient, variable)` pairs into update operations.

use crate::error::{Result, TrainerError};
use crate::graph::{Graph, Operation, Tensor};
use crate::tensor::{DType, Data, Value};

/// A gradient (absent when the loss does not depend on the variable) and
/// the tensor it was taken against.
pub type GradAndVar = (Option<Tensor>, Tensor);

/// Trait for optimizer implementations.
pub trait Optimizer: Send + Sync {
    /// Builds one gradient per entry of `var_list`, in the same order.
    fn compute_gradients(
        &self,
        graph: &mut Graph,
        loss: &Tensor,
        var_list: &[Tensor],
    ) -> Result<Vec<GradAndVar>>;

    /// Builds the operation that applies `grads_and_vars` and advances
    /// `global_step` when given.
    fn apply_gradients(
        &self,
        graph: &mut Graph,
        grads_and_vars: &[GradAndVar],
        global_step: Option<&Tensor>,
    ) -> Result<Operation>;
}

/// Automatic differentiation capability of the local computation engine.
pub trait Differentiator: Send + Sync {
    /// Builds `d loss / d x` for every `x` in `xs`, `None` where `loss` does
    /// not depend on `x`.
    fn gradients(&self, graph: &mut Graph, loss: &Tensor, xs: &[Tensor])
        -> Result<Vec<Option<Tensor>>>;
}

/// Plain stochastic gradient descent: `var <- var - learning_rate * grad`.
pub struct GradientDescent<D> {
    learning_rate: f32,
    differentiator: D,
}

impl<D: Differentiator> GradientDescent<D> {
    pub fn new(learning_rate: f32, differentiator: D) -> Self {
        Self {
            learning_rate,
            differentiator,
        }
    }

    pub fn learning_rate(&self) -> f32 {
        self.learning_rate
    }
}

impl<D: Differentiator> Optimizer for GradientDescent<D> {
    fn compute_gradients(
        &self,
        graph: &mut Graph,
        loss: &Tensor,
        var_list: &[Tensor],
    ) -> Result<Vec<GradAndVar>> {
        let grads = self.differentiator.gradients(graph, loss, var_list)?;
        if grads.len() != var_list.len() {
            return Err(TrainerError::graph(format!(
                "differentiator returned {} gradients for {} tensors",
                grads.len(),
                var_list.len()
            )));
        }
        Ok(grads.into_iter().zip(var_list.iter().cloned()).collect())
    }

    fn apply_gradients(
        &self,
        graph: &mut Graph,
        grads_and_vars: &[GradAndVar],
        global_step: Option<&Tensor>,
    ) -> Result<Operation> {
        let mut updates = Vec::with_capacity(grads_and_vars.len() + 1);

        for (grad, var) in grads_and_vars {
            let Some(grad) = grad else { continue };
            if var.dtype() != DType::Float32 || grad.dtype() != DType::Float32 {
                return Err(TrainerError::graph(
                    "gradient descent only updates float32 variables",
                ));
            }

            let lr = self.learning_rate;
            let stepped = graph.compute(&[var, grad], DType::Float32, move |xs| {
                let (v, g) = (xs[0], xs[1]);
                if v.shape() != g.shape() {
                    return Err(TrainerError::graph(format!(
                        "gradient shape {:?} does not match variable shape {:?}",
                        g.shape(),
                        v.shape()
                    )));
                }
                let data = v
                    .as_f32()?
                    .iter()
                    .zip(g.as_f32()?)
                    .map(|(v, g)| v - lr * g)
                    .collect();
                Value::new(v.shape().to_vec(), Data::Float32(data))
            })?;
            updates.push(graph.assign(var, &stepped)?);
        }

        if let Some(step) = global_step {
            let next = graph.compute(&[step], DType::Int64, |xs| {
                let data = xs[0].as_i64()?.iter().map(|s| s + 1).collect();
                Value::new(xs[0].shape().to_vec(), Data::Int64(data))
            })?;
            updates.push(graph.assign(step, &next)?);
        }

        graph.group(&updates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::LocalBridge;
    use crate::model::Role;
    use crate::session::Session;
    use crate::testing::UniformGradients;

    #[tokio::test]
    async fn test_apply_gradients_steps_variables() {
        let mut graph = Graph::new();
        let w = graph.variable("w", Value::f32_vec(vec![1.0, 2.0]), true).unwrap();
        let step = graph.variable("global_step", Value::scalar_i64(0), false).unwrap();
        let loss = graph.constant(Value::scalar_f32(0.0));

        let opt = GradientDescent::new(0.5, UniformGradients::new(1.0));
        let gv = opt.compute_gradients(&mut graph, &loss, &[w.clone()]).unwrap();
        assert_eq!(gv.len(), 1);
        let train = opt.apply_gradients(&mut graph, &gv, Some(&step)).unwrap();

        let (bridge, _peer) = LocalBridge::pair();
        let mut session = Session::new(graph, Role::Leader);
        session.run(&bridge, &train, 0).await.unwrap();

        assert_eq!(session.variable("w").unwrap().as_f32().unwrap(), &[0.5, 1.5]);
        assert_eq!(session.variable("global_step").unwrap().as_i64().unwrap(), &[1]);
    }

    #[tokio::test]
    async fn test_missing_gradient_leaves_variable_untouched() {
        let mut graph = Graph::new();
        let w = graph.variable("w", Value::scalar_f32(1.0), true).unwrap();
        let loss = graph.constant(Value::scalar_f32(0.0));

        let opt = GradientDescent::new(0.1, UniformGradients::new(1.0).without(&w));
        let gv = opt.compute_gradients(&mut graph, &loss, &[w.clone()]).unwrap();
        assert!(gv[0].0.is_none());
        let train = opt.apply_gradients(&mut graph, &gv, None).unwrap();

        let (bridge, _peer) = LocalBridge::pair();
        let mut session = Session::new(graph, Role::Leader);
        session.run(&bridge, &train, 0).await.unwrap();
        assert_eq!(session.variable("w").unwrap().as_f32().unwrap(), &[1.0]);
    }

    #[test]
    fn test_integer_variables_rejected() {
        let mut graph = Graph::new();
        let counter = graph.variable("counter", Value::scalar_i64(0), true).unwrap();
        let g = graph.constant(Value::scalar_f32(1.0));

        let opt = GradientDescent::new(0.1, UniformGradients::new(1.0));
        assert!(opt
            .apply_gradients(&mut graph, &[(Some(g), counter)], None)
            .is_err());
    }
}
