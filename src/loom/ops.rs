use std::{fmt::Debug, sync::Arc};

use itertools::Itertools;
use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};

use super::{
    tensor::{Tensor, TensorError, TensorId},
    variable::{Variable, VariableId},
};

/// A differentiable operator recorded on the tape of its output.
pub trait TensorOp: Debug + Send + Sync {
    /// Name of the op, for diagnostics.
    fn name(&self) -> &'static str;

    /// Computes the gradients of the inputs given the gradient of the output.
    /// Returns `None` for inputs that do not receive a gradient.
    fn backward(
        &self,
        inputs: &[Tensor],
        output: &Tensor,
        grad: &Tensor,
    ) -> Result<Vec<Option<Tensor>>, TensorError>;
}

/// How a tracked tensor came to be.
#[derive(Debug)]
pub enum TensorNode {
    /// The value of a trainable variable.
    Variable(VariableId),
    /// The output of an op applied to some inputs.
    Op {
        op: Box<dyn TensorOp>,
        inputs: Vec<Tensor>,
    },
}

/// Gradients of a tensor w.r.t. trainable variables.
#[derive(Debug, Default, Clone)]
pub struct Gradients(HashMap<VariableId, Tensor>);

impl Gradients {
    #[inline]
    pub fn get(&self, variable: &Variable) -> Option<&Tensor> {
        self.0.get(&variable.id())
    }

    #[inline]
    pub fn get_by_id(&self, id: VariableId) -> Option<&Tensor> {
        self.0.get(&id)
    }

    #[inline]
    pub fn insert(&mut self, id: VariableId, grad: Tensor) {
        self.0.insert(id, grad);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = (&VariableId, &Tensor)> {
        self.0.iter()
    }

    #[inline]
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&VariableId, &mut Tensor)> {
        self.0.iter_mut()
    }
}

/// Adds two gradients of the same layout.
fn accumulate(x: &Tensor, y: &Tensor) -> Result<Tensor, TensorError> {
    if x.layout() != y.layout() {
        return Err(TensorError::Mismatch(x.layout(), y.layout()));
    }
    let data: Arc<[f32]> = x
        .data()
        .iter()
        .zip_eq(y.data())
        .map(|(x, y)| x + y)
        .collect();
    Ok(Tensor::raw(x.layout(), data))
}

impl Tensor {
    /// Tracked tensors this one depends on, in topological order (inputs first).
    fn topological(&self) -> Vec<Tensor> {
        let mut order = vec![];
        let mut visited = HashSet::default();
        let mut stack = vec![(self.clone(), false)];

        while let Some((tensor, expanded)) = stack.pop() {
            if expanded {
                order.push(tensor);
                continue;
            }
            if !visited.insert(tensor.id()) {
                continue;
            }
            let inputs = match tensor.node().map(AsRef::as_ref) {
                Some(TensorNode::Op { inputs, .. }) => inputs.clone(),
                _ => vec![],
            };
            stack.push((tensor, true));
            for input in inputs.into_iter().filter(Tensor::requires_grad) {
                if !visited.contains(&input.id()) {
                    stack.push((input, false));
                }
            }
        }
        order
    }

    /// # Backpropagation (`backward`)
    /// Computes the gradients of this tensor w.r.t. every trainable variable it depends on.
    ///
    /// The gradient of the tensor itself is seeded with ones, which makes the result
    /// the gradient of the sum of its elements.
    ///
    /// ## Returns
    /// * `Result<Gradients, TensorError>` - Gradients keyed by variable,
    ///   or an error if an op produced a gradient of the wrong layout.
    pub fn backward(&self) -> Result<Gradients, TensorError> {
        let mut gradients = Gradients::default();
        if !self.requires_grad() {
            return Ok(gradients);
        }

        let mut grads: HashMap<uid::Id<TensorId>, Tensor> = HashMap::default();
        grads.insert(self.id(), Tensor::ones(self.layout()));

        for tensor in self.topological().into_iter().rev() {
            let Some(grad) = grads.remove(&tensor.id()) else {
                continue;
            };
            match tensor.node().map(AsRef::as_ref) {
                Some(TensorNode::Variable(id)) => {
                    let grad = match gradients.0.remove(id) {
                        Some(acc) => accumulate(&acc, &grad)?,
                        None => grad,
                    };
                    gradients.0.insert(*id, grad);
                }
                Some(TensorNode::Op { op, inputs }) => {
                    // gradients are computed on detached values and never recorded
                    let output = tensor.detach();
                    let values = inputs.iter().map(Tensor::detach).collect_vec();
                    let input_grads = op.backward(&values, &output, &grad)?;
                    for (input, input_grad) in inputs.iter().zip(input_grads) {
                        let Some(input_grad) = input_grad else {
                            continue;
                        };
                        if !input.requires_grad() {
                            continue;
                        }
                        if input_grad.layout() != input.layout() {
                            log::debug!("op {} produced a gradient of the wrong layout", op.name());
                            return Err(TensorError::Mismatch(input.layout(), input_grad.layout()));
                        }
                        let input_grad = match grads.remove(&input.id()) {
                            Some(acc) => accumulate(&acc, &input_grad)?,
                            None => input_grad,
                        };
                        grads.insert(input.id(), input_grad);
                    }
                }
                None => {}
            }
        }
        Ok(gradients)
    }
}
